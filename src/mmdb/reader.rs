//! MMDB reader
//!
//! Opens MMDB files (memory-mapped or from owned bytes) and answers
//! longest-prefix lookups. Used by the CLI `lookup`/`inspect` commands and
//! to check written databases against the tree they came from.

use super::types::{RecordSize, DATA_SECTION_SEPARATOR, IPV4_SUBTREE_DEPTH, METADATA_MARKER};
use crate::data_section::{DataDecoder, DataValue};
use crate::error::{EnrichError, Result};
use crate::network::Network;
use memmap2::Mmap;
use std::fs::File;
use std::net::IpAddr;
use std::path::Path;

/// The metadata marker must appear within this many bytes of the end
const METADATA_SEARCH_WINDOW: usize = 128 * 1024;

/// Storage for database data - either owned or memory-mapped
enum DatabaseStorage {
    Owned(Vec<u8>),
    Mmap(Mmap),
}

impl DatabaseStorage {
    fn as_slice(&self) -> &[u8] {
        match self {
            DatabaseStorage::Owned(v) => v.as_slice(),
            DatabaseStorage::Mmap(m) => &m[..],
        }
    }
}

/// Result of a database lookup
#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    /// Network of the matching record, in the family of the queried address
    pub network: Network,
    pub data: DataValue,
}

/// A read-only MMDB database
pub struct Database {
    storage: DatabaseStorage,
    node_count: u32,
    record_size: RecordSize,
    ip_version: u16,
    tree_size: usize,
    metadata: DataValue,
}

impl Database {
    /// Open a database file using memory mapping
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| EnrichError::Io(format!("failed to open {}: {}", path.display(), e)))?;

        // SAFETY: the mapping is read-only and owned by the Database; callers
        // must not truncate the file while it is open.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| EnrichError::Io(format!("failed to mmap {}: {}", path.display(), e)))?;

        Self::from_storage(DatabaseStorage::Mmap(mmap))
    }

    /// Create a database from raw bytes
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::from_storage(DatabaseStorage::Owned(data))
    }

    fn from_storage(storage: DatabaseStorage) -> Result<Self> {
        let data = storage.as_slice();
        let marker = find_metadata_marker(data)?;
        let metadata = DataDecoder::new(&data[marker + METADATA_MARKER.len()..]).decode(0)?;

        let field = |name: &str| {
            metadata
                .get(name)
                .and_then(DataValue::as_u64)
                .ok_or_else(|| EnrichError::Format(format!("metadata lacks {}", name)))
        };

        let node_count = u32::try_from(field("node_count")?)
            .map_err(|_| EnrichError::Format("node_count out of range".to_string()))?;
        let record_size = RecordSize::from_bits(field("record_size")?)?;
        let ip_version = match field("ip_version")? {
            4 => 4,
            6 => 6,
            other => {
                return Err(EnrichError::Format(format!(
                    "invalid ip_version {}",
                    other
                )))
            }
        };

        let tree_size = node_count as usize * record_size.node_bytes();
        if tree_size + DATA_SECTION_SEPARATOR.len() > marker {
            return Err(EnrichError::Format(format!(
                "search tree of {} bytes overlaps metadata at {}",
                tree_size, marker
            )));
        }

        Ok(Self {
            storage,
            node_count,
            record_size,
            ip_version,
            tree_size,
            metadata,
        })
    }

    /// Longest-prefix lookup
    ///
    /// In an IPv6 database, IPv4 addresses are looked up under `::/96`.
    pub fn lookup(&self, addr: IpAddr) -> Result<Option<LookupResult>> {
        // (key left-aligned in 128 bits, bits to walk, path depth of prefix 0)
        let (key, bits, base) = match (addr, self.ip_version) {
            (IpAddr::V4(v4), 4) => (u128::from(u32::from(v4)) << 96, 32u8, 0u8),
            (IpAddr::V4(v4), _) => (u128::from(u32::from(v4)), 128, IPV4_SUBTREE_DEPTH),
            (IpAddr::V6(_), 4) => {
                return Err(EnrichError::InvalidNetwork(format!(
                    "cannot look up IPv6 address {} in an IPv4 database",
                    addr
                )))
            }
            (IpAddr::V6(v6), _) => (u128::from(v6), 128, 0),
        };

        let mut node = 0u32;
        for depth in 0..bits {
            let bit = ((key >> (127 - u32::from(depth))) & 1) as usize;
            let record = self.read_record(node, bit)?;

            if record == self.node_count {
                return Ok(None);
            }
            if record < self.node_count {
                node = record;
                continue;
            }

            let data = self.decode_record(record)?;
            let network = Network::new(addr, (depth + 1).saturating_sub(base))?;
            return Ok(Some(LookupResult { network, data }));
        }

        Ok(None)
    }

    pub fn metadata(&self) -> &DataValue {
        &self.metadata
    }

    pub fn database_type(&self) -> Option<&str> {
        self.metadata.get("database_type").and_then(DataValue::as_str)
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn record_size(&self) -> RecordSize {
        self.record_size
    }

    pub fn ip_version(&self) -> u16 {
        self.ip_version
    }

    /// Total size of the database in bytes
    pub fn size(&self) -> usize {
        self.storage.as_slice().len()
    }

    fn read_record(&self, node: u32, side: usize) -> Result<u32> {
        if node >= self.node_count {
            return Err(EnrichError::Format(format!(
                "node {} exceeds node count {}",
                node, self.node_count
            )));
        }

        let data = self.storage.as_slice();
        let offset = node as usize * self.record_size.node_bytes();
        let bytes = &data[offset..offset + self.record_size.node_bytes()];
        let be24 = |b: &[u8]| (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);

        Ok(match (self.record_size, side) {
            (RecordSize::Bits24, 0) => be24(&bytes[0..3]),
            (RecordSize::Bits24, _) => be24(&bytes[3..6]),
            (RecordSize::Bits28, 0) => (u32::from(bytes[3] >> 4) << 24) | be24(&bytes[0..3]),
            (RecordSize::Bits28, _) => (u32::from(bytes[3] & 0x0F) << 24) | be24(&bytes[4..7]),
            (RecordSize::Bits32, 0) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            (RecordSize::Bits32, _) => u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    fn decode_record(&self, record: u32) -> Result<DataValue> {
        let offset = (record - self.node_count)
            .checked_sub(DATA_SECTION_SEPARATOR.len() as u32)
            .ok_or_else(|| {
                EnrichError::Format(format!(
                    "record {} points into the data section separator",
                    record
                ))
            })?;
        let start = self.tree_size + DATA_SECTION_SEPARATOR.len();
        DataDecoder::new(&self.storage.as_slice()[start..]).decode(offset as usize)
    }
}

/// Find the last metadata marker within the search window at the end of
/// the file
pub fn find_metadata_marker(data: &[u8]) -> Result<usize> {
    let search_start = data.len().saturating_sub(METADATA_SEARCH_WINDOW);
    data[search_start..]
        .windows(METADATA_MARKER.len())
        .rposition(|window| window == METADATA_MARKER)
        .map(|pos| search_start + pos)
        .ok_or_else(|| EnrichError::Format("MMDB metadata marker not found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmdb::writer::MmdbWriter;
    use crate::prefix_tree::{MergeStrategy, PrefixTree};

    fn build(nets: &[(&str, &str)]) -> (PrefixTree, Database) {
        let mut tree = PrefixTree::new();
        for (net, tag) in nets {
            tree.insert(
                net.parse().unwrap(),
                DataValue::map_from([("tag", DataValue::from(*tag))]),
                MergeStrategy::TopLevel,
            )
            .unwrap();
        }
        let bytes = MmdbWriter::new("Test-DB")
            .with_languages(["de", "en"])
            .build(&tree)
            .unwrap();
        (tree, Database::from_bytes(bytes).unwrap())
    }

    #[test]
    fn test_metadata_fields() {
        let (tree, db) = build(&[("10.0.0.0/8", "a")]);
        assert_eq!(db.database_type(), Some("Test-DB"));
        assert_eq!(db.ip_version(), 6);
        assert_eq!(db.record_size(), RecordSize::Bits24);
        // 96 nodes down to ::/96, then the IPv4 tree
        assert_eq!(db.node_count() as usize, 96 + tree.node_count());
        assert_eq!(
            db.metadata().get("languages"),
            Some(&DataValue::Array(vec!["de".into(), "en".into()]))
        );
    }

    #[test]
    fn test_lookups_match_tree() {
        let (tree, db) = build(&[
            ("10.0.0.0/16", "broad"),
            ("10.0.1.0/24", "narrow"),
            ("2001:db8::/32", "v6"),
        ]);

        for addr in ["10.0.1.5", "10.0.2.5", "10.1.0.0", "2001:db8::1", "2001:db9::1"] {
            let addr: IpAddr = addr.parse().unwrap();
            let expected = tree.lookup(addr).map(|m| m.data.clone());
            let actual = db.lookup(addr).unwrap().map(|r| r.data);
            assert_eq!(actual, expected, "{}", addr);
        }

        // The reader reports the search tree path, which is narrower than
        // the inserted /16 once the /24 split it
        let hit = db.lookup("10.0.2.5".parse().unwrap()).unwrap().unwrap();
        assert_eq!(hit.network.to_string(), "10.0.2.0/23");
        let hit = db.lookup("10.0.1.5".parse().unwrap()).unwrap().unwrap();
        assert_eq!(hit.network.to_string(), "10.0.1.0/24");
    }

    #[test]
    fn test_ipv6_default_route_does_not_answer_ipv4() {
        let (_, db) = build(&[("::/0", "v6any"), ("192.0.2.0/24", "v4")]);

        let hit = db.lookup("2001:db8::1".parse().unwrap()).unwrap().unwrap();
        assert_eq!(hit.data.get("tag"), Some(&DataValue::from("v6any")));
        let hit = db.lookup("192.0.2.1".parse().unwrap()).unwrap().unwrap();
        assert_eq!(hit.network.to_string(), "192.0.2.0/24");
        assert_eq!(db.lookup("198.51.100.1".parse().unwrap()).unwrap(), None);

        let (_, db) = build(&[("::/0", "v6any")]);
        assert_eq!(db.lookup("8.8.8.8".parse().unwrap()).unwrap(), None);
        assert!(db.lookup("::ffff:808:808".parse().unwrap()).unwrap().is_some());
    }

    #[test]
    fn test_record_into_separator_is_format_error() {
        let (_, db) = build(&[("10.0.0.0/8", "a")]);
        let node_count = db.node_count();
        let mut bytes = db.storage.as_slice().to_vec();
        // Node 0's left record points just past the node count
        bytes[..3].copy_from_slice(&(node_count + 1).to_be_bytes()[1..]);

        let db = Database::from_bytes(bytes).unwrap();
        let err = db.lookup("::1".parse().unwrap()).unwrap_err();
        assert!(matches!(err, EnrichError::Format(_)));
    }

    #[test]
    fn test_missing_marker() {
        assert!(matches!(
            Database::from_bytes(vec![0u8; 64]),
            Err(EnrichError::Format(_))
        ));
    }

    #[test]
    fn test_open_from_file() {
        let (tree, _) = build(&[("192.0.2.0/24", "doc")]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.mmdb");
        MmdbWriter::new("Test-DB").write_to_file(&tree, &path).unwrap();

        let db = Database::open(&path).unwrap();
        let hit = db.lookup("192.0.2.9".parse().unwrap()).unwrap().unwrap();
        assert_eq!(hit.data.get("tag"), Some(&DataValue::from("doc")));
    }
}
