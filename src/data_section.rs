//! Data section encoding and decoding
//!
//! Records attached to networks are stored in the MaxMind DB data section
//! format: a control byte carrying the type (3 bits) and payload size
//! (5 bits), optional size extension bytes, then the payload. Types above 7
//! are "extended": the control byte type bits are zero and the following
//! byte holds `type - 7`.
//!
//! Only the types this crate produces are encodable. The decoder also
//! understands pointers and doubles so it can read files written by other
//! MMDB writers.
//!
//! See: https://maxmind.github.io/MaxMind-DB/

use crate::error::{EnrichError, Result};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

const TYPE_EXTENDED: u8 = 0;
const TYPE_POINTER: u8 = 1;
const TYPE_STRING: u8 = 2;
const TYPE_DOUBLE: u8 = 3;
const TYPE_UINT16: u8 = 5;
const TYPE_UINT32: u8 = 6;
const TYPE_MAP: u8 = 7;
const TYPE_INT32: u8 = 8;
const TYPE_UINT64: u8 = 9;
const TYPE_ARRAY: u8 = 11;
const TYPE_BOOL: u8 = 14;
const TYPE_FLOAT: u8 = 15;

/// Value stored in the data section
///
/// Maps are ordered by key so that identical records always encode to
/// identical bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// UTF-8 string
    String(String),
    /// IEEE 754 double precision float (decode only in practice)
    Double(f64),
    /// Unsigned 16-bit integer
    Uint16(u16),
    /// Unsigned 32-bit integer
    Uint32(u32),
    /// Key-value map (string keys only)
    Map(BTreeMap<String, DataValue>),
    /// Signed 32-bit integer
    Int32(i32),
    /// Unsigned 64-bit integer
    Uint64(u64),
    /// Array of values
    Array(Vec<DataValue>),
    /// Boolean value
    Bool(bool),
    /// IEEE 754 single precision float
    Float(f32),
}

impl DataValue {
    /// Build a map value from `(key, value)` pairs
    pub fn map_from<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, DataValue)>,
    {
        DataValue::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// An empty map
    pub fn empty_map() -> Self {
        DataValue::Map(BTreeMap::new())
    }

    /// Look up a key if this value is a map
    pub fn get(&self, key: &str) -> Option<&DataValue> {
        match self {
            DataValue::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Follow a path of map keys
    pub fn get_path(&self, path: &[&str]) -> Option<&DataValue> {
        path.iter().try_fold(self, |value, key| value.get(key))
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, DataValue>> {
        match self {
            DataValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            DataValue::Int32(n) => Some(*n),
            _ => None,
        }
    }

    /// Any unsigned integer widened to u64
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DataValue::Uint16(n) => Some(u64::from(*n)),
            DataValue::Uint32(n) => Some(u64::from(*n)),
            DataValue::Uint64(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        DataValue::String(s.to_string())
    }
}

impl From<String> for DataValue {
    fn from(s: String) -> Self {
        DataValue::String(s)
    }
}

impl From<i32> for DataValue {
    fn from(n: i32) -> Self {
        DataValue::Int32(n)
    }
}

impl From<f32> for DataValue {
    fn from(f: f32) -> Self {
        DataValue::Float(f)
    }
}

impl From<BTreeMap<String, String>> for DataValue {
    fn from(names: BTreeMap<String, String>) -> Self {
        DataValue::Map(
            names
                .into_iter()
                .map(|(k, v)| (k, DataValue::String(v)))
                .collect(),
        )
    }
}

/// Data section encoder
///
/// Builds a data section by encoding values and tracking offsets.
/// Identical values get the same offset.
pub struct DataEncoder {
    buffer: Vec<u8>,
    dedup_map: FxHashMap<Vec<u8>, u32>,
}

impl DataEncoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            dedup_map: FxHashMap::default(),
        }
    }

    /// Encode a value and return its offset in the data section
    pub fn encode(&mut self, value: &DataValue) -> Result<u32> {
        let mut temp = Vec::new();
        encode_to_buffer(value, &mut temp)?;

        if let Some(&offset) = self.dedup_map.get(&temp) {
            return Ok(offset);
        }

        let offset = u32::try_from(self.buffer.len()).map_err(|_| {
            EnrichError::Format("data section exceeds 4 GiB".to_string())
        })?;
        self.buffer.extend_from_slice(&temp);
        self.dedup_map.insert(temp, offset);
        Ok(offset)
    }

    /// Current data section size in bytes
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for DataEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a single value without deduplication
pub fn encode_value(value: &DataValue) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    encode_to_buffer(value, &mut buffer)?;
    Ok(buffer)
}

fn encode_to_buffer(value: &DataValue, buffer: &mut Vec<u8>) -> Result<()> {
    match value {
        DataValue::String(s) => {
            write_control(TYPE_STRING, s.len(), buffer)?;
            buffer.extend_from_slice(s.as_bytes());
        }
        DataValue::Double(d) => {
            write_control(TYPE_DOUBLE, 8, buffer)?;
            buffer.extend_from_slice(&d.to_be_bytes());
        }
        DataValue::Uint16(n) => write_unsigned(TYPE_UINT16, u64::from(*n), buffer)?,
        DataValue::Uint32(n) => write_unsigned(TYPE_UINT32, u64::from(*n), buffer)?,
        DataValue::Uint64(n) => write_unsigned(TYPE_UINT64, *n, buffer)?,
        DataValue::Map(m) => {
            write_control(TYPE_MAP, m.len(), buffer)?;
            for (key, value) in m {
                write_control(TYPE_STRING, key.len(), buffer)?;
                buffer.extend_from_slice(key.as_bytes());
                encode_to_buffer(value, buffer)?;
            }
        }
        DataValue::Int32(n) => {
            // Always four bytes so negative values survive decoding
            write_control(TYPE_INT32, 4, buffer)?;
            buffer.extend_from_slice(&n.to_be_bytes());
        }
        DataValue::Array(items) => {
            write_control(TYPE_ARRAY, items.len(), buffer)?;
            for item in items {
                encode_to_buffer(item, buffer)?;
            }
        }
        DataValue::Bool(b) => write_control(TYPE_BOOL, usize::from(*b), buffer)?,
        DataValue::Float(f) => {
            write_control(TYPE_FLOAT, 4, buffer)?;
            buffer.extend_from_slice(&f.to_be_bytes());
        }
    }
    Ok(())
}

/// Unsigned integers are written with leading zero bytes stripped
fn write_unsigned(type_id: u8, n: u64, buffer: &mut Vec<u8>) -> Result<()> {
    let bytes = n.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    write_control(type_id, bytes.len() - skip, buffer)?;
    buffer.extend_from_slice(&bytes[skip..]);
    Ok(())
}

/// Write the control byte, the extended type byte if needed, and the size
fn write_control(type_id: u8, size: usize, buffer: &mut Vec<u8>) -> Result<()> {
    let (size_bits, extra): (u8, Vec<u8>) = if size < 29 {
        (size as u8, Vec::new())
    } else if size < 29 + 256 {
        (29, vec![(size - 29) as u8])
    } else if size < 29 + 256 + 65_536 {
        (30, ((size - 285) as u16).to_be_bytes().to_vec())
    } else if size < 29 + 256 + 65_536 + (1 << 24) {
        (31, ((size - 65_821) as u32).to_be_bytes()[1..].to_vec())
    } else {
        return Err(EnrichError::Format(format!(
            "value of size {} is too large to encode",
            size
        )));
    };

    if type_id > TYPE_MAP {
        buffer.push((TYPE_EXTENDED << 5) | size_bits);
        buffer.push(type_id - 7);
    } else {
        buffer.push((type_id << 5) | size_bits);
    }
    buffer.extend_from_slice(&extra);
    Ok(())
}

/// Deepest map/array nesting the decoder accepts
const MAX_NESTING: usize = 512;

/// Data section decoder
///
/// Offsets (and pointer targets) are relative to the start of `buffer`.
/// Pointers to pointers and nesting deeper than 512 levels are rejected, so
/// corrupt input fails with a `Format` error instead of recursing forever.
pub struct DataDecoder<'a> {
    buffer: &'a [u8],
}

impl<'a> DataDecoder<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    /// Decode the value at `offset`, following pointers
    pub fn decode(&self, offset: usize) -> Result<DataValue> {
        let mut cursor = offset;
        self.decode_at(&mut cursor, 0)
    }

    fn decode_at(&self, cursor: &mut usize, depth: usize) -> Result<DataValue> {
        if depth > MAX_NESTING {
            return Err(EnrichError::Format(format!(
                "data nested deeper than {} levels",
                MAX_NESTING
            )));
        }

        let ctrl = self.read_byte(cursor)?;
        let mut type_id = ctrl >> 5;

        if type_id == TYPE_POINTER {
            let mut target = self.decode_pointer(cursor, ctrl)?;
            let mut peek = target;
            if self.read_byte(&mut peek)? >> 5 == TYPE_POINTER {
                return Err(EnrichError::Format(format!(
                    "pointer at {} points to another pointer",
                    target
                )));
            }
            return self.decode_at(&mut target, depth);
        }

        if type_id == TYPE_EXTENDED {
            type_id = self.read_byte(cursor)? + 7;
        }

        let size = self.decode_size(cursor, ctrl & 0x1F)?;

        match type_id {
            TYPE_STRING => {
                let bytes = self.take(cursor, size)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| EnrichError::Format("invalid UTF-8 in string".to_string()))?;
                Ok(DataValue::String(s.to_string()))
            }
            TYPE_DOUBLE => {
                let bytes = self.take(cursor, 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(DataValue::Double(f64::from_be_bytes(raw)))
            }
            TYPE_UINT16 => Ok(DataValue::Uint16(self.read_uint(cursor, size, 2)? as u16)),
            TYPE_UINT32 => Ok(DataValue::Uint32(self.read_uint(cursor, size, 4)? as u32)),
            TYPE_UINT64 => Ok(DataValue::Uint64(self.read_uint(cursor, size, 8)?)),
            TYPE_INT32 => Ok(DataValue::Int32(self.read_uint(cursor, size, 4)? as u32 as i32)),
            TYPE_MAP => {
                let mut map = BTreeMap::new();
                for _ in 0..size {
                    let key = match self.decode_at(cursor, depth + 1)? {
                        DataValue::String(s) => s,
                        other => {
                            return Err(EnrichError::Format(format!(
                                "map key must be a string, got {:?}",
                                other
                            )))
                        }
                    };
                    let value = self.decode_at(cursor, depth + 1)?;
                    map.insert(key, value);
                }
                Ok(DataValue::Map(map))
            }
            TYPE_ARRAY => {
                let mut items = Vec::with_capacity(size.min(1024));
                for _ in 0..size {
                    items.push(self.decode_at(cursor, depth + 1)?);
                }
                Ok(DataValue::Array(items))
            }
            TYPE_BOOL => Ok(DataValue::Bool(size != 0)),
            TYPE_FLOAT => {
                let bytes = self.take(cursor, 4)?;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                Ok(DataValue::Float(f32::from_be_bytes(raw)))
            }
            other => Err(EnrichError::Format(format!(
                "unsupported data type {}",
                other
            ))),
        }
    }

    fn decode_pointer(&self, cursor: &mut usize, ctrl: u8) -> Result<usize> {
        let size = (ctrl >> 3) & 0x3;
        let high = usize::from(ctrl & 0x7);
        let bytes = self.take(cursor, usize::from(size) + 1)?;
        let value = bytes.iter().fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
        Ok(match size {
            0 => (high << 8) | value,
            1 => ((high << 16) | value) + 2048,
            2 => ((high << 24) | value) + 526_336,
            _ => value,
        })
    }

    fn decode_size(&self, cursor: &mut usize, size_bits: u8) -> Result<usize> {
        match size_bits {
            0..=28 => Ok(usize::from(size_bits)),
            29 => Ok(29 + usize::from(self.read_byte(cursor)?)),
            30 => {
                let bytes = self.take(cursor, 2)?;
                Ok(285 + ((usize::from(bytes[0]) << 8) | usize::from(bytes[1])))
            }
            _ => {
                let bytes = self.take(cursor, 3)?;
                Ok(65_821
                    + ((usize::from(bytes[0]) << 16)
                        | (usize::from(bytes[1]) << 8)
                        | usize::from(bytes[2])))
            }
        }
    }

    fn read_uint(&self, cursor: &mut usize, size: usize, max: usize) -> Result<u64> {
        if size > max {
            return Err(EnrichError::Format(format!(
                "integer payload of {} bytes exceeds {}",
                size, max
            )));
        }
        let bytes = self.take(cursor, size)?;
        Ok(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    fn read_byte(&self, cursor: &mut usize) -> Result<u8> {
        Ok(self.take(cursor, 1)?[0])
    }

    fn take(&self, cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
        let end = cursor
            .checked_add(len)
            .filter(|&end| end <= self.buffer.len())
            .ok_or_else(|| {
                EnrichError::Format(format!(
                    "data section read of {} bytes at {} out of bounds",
                    len, cursor
                ))
            })?;
        let bytes = &self.buffer[*cursor..end];
        *cursor = end;
        Ok(bytes)
    }
}
