//! MMDB format constants and record sizes

use crate::error::{EnrichError, Result};

/// MMDB metadata marker: "\xAB\xCD\xEFMaxMind.com"
pub const METADATA_MARKER: &[u8] = b"\xAB\xCD\xEFMaxMind.com";

/// Zero bytes between the search tree and the data section
pub const DATA_SECTION_SEPARATOR: [u8; 16] = [0u8; 16];

/// Depth of the `::/96` node where IPv4 lookups enter an IPv6 search tree
pub const IPV4_SUBTREE_DEPTH: u8 = 96;

/// Record size in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordSize {
    /// 24-bit records (6 bytes per node)
    Bits24 = 24,
    /// 28-bit records (7 bytes per node)
    Bits28 = 28,
    /// 32-bit records (8 bytes per node)
    Bits32 = 32,
}

impl RecordSize {
    /// Size of a node (two records) in bytes
    pub fn node_bytes(self) -> usize {
        match self {
            RecordSize::Bits24 => 6,
            RecordSize::Bits28 => 7,
            RecordSize::Bits32 => 8,
        }
    }

    pub fn bits(self) -> u16 {
        self as u16
    }

    /// Largest value a record can hold
    pub fn max_value(self) -> u64 {
        (1u64 << self.bits()) - 1
    }

    /// Smallest record size able to hold `max_value`
    pub fn smallest_for(max_value: u64) -> Result<Self> {
        [RecordSize::Bits24, RecordSize::Bits28, RecordSize::Bits32]
            .into_iter()
            .find(|size| max_value <= size.max_value())
            .ok_or_else(|| {
                EnrichError::Format(format!(
                    "record value {} does not fit in 32 bits",
                    max_value
                ))
            })
    }

    pub fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            24 => Ok(RecordSize::Bits24),
            28 => Ok(RecordSize::Bits28),
            32 => Ok(RecordSize::Bits32),
            _ => Err(EnrichError::Format(format!(
                "invalid record size: {} bits",
                bits
            ))),
        }
    }
}
