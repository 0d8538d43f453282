//! MMDB writer
//!
//! Serializes a [`PrefixTree`] into MMDB bytes. Nodes are renumbered in
//! depth-first order from the root, so the output only depends on the shape
//! of the tree and its records, never on the order the arena was filled in.
//!
//! The file has a single IPv6 search tree. The IPv4 root is grafted in at
//! `::/96`, where MMDB readers look up IPv4 addresses, through a chain of
//! synthetic nodes along the all-zero path. IPv6 networks that contain
//! `::/96` keep covering the rest of their range but not the IPv4 subtree.
//! IPv6 networks at or inside `::/96` cannot be written.

use super::types::{RecordSize, DATA_SECTION_SEPARATOR, IPV4_SUBTREE_DEPTH, METADATA_MARKER};
use crate::data_section::{DataEncoder, DataValue};
use crate::error::{EnrichError, Result};
use crate::network::Family;
use crate::prefix_tree::{PrefixTree, Slot};
use log::debug;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Search tree pointer after renumbering
#[derive(Debug, Clone, Copy)]
enum Record {
    Empty,
    Node(u32),
    /// Offset into the data section
    Data(u32),
}

/// A node of the output tree before renumbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Source {
    /// Arena node of the prefix tree
    Tree(u32),
    /// Synthetic node at this depth on the path to `::/96`
    Alias(u8),
}

/// Child of an output node
#[derive(Debug, Clone, Copy)]
enum Child {
    Empty,
    Node(Source),
    Leaf(u32),
}

impl From<Slot> for Child {
    fn from(slot: Slot) -> Self {
        match slot {
            Slot::Empty => Child::Empty,
            Slot::Node(id) => Child::Node(Source::Tree(id)),
            Slot::Leaf { record, .. } => Child::Leaf(record),
        }
    }
}

/// Child of an output node after renumbering
#[derive(Debug, Clone, Copy)]
enum Numbered {
    Empty,
    Node(u32),
    Leaf(u32),
}

/// Writes prefix trees as MMDB files
#[derive(Debug, Clone)]
pub struct MmdbWriter {
    database_type: String,
    description: BTreeMap<String, String>,
    languages: Vec<String>,
    build_epoch: Option<u64>,
}

impl MmdbWriter {
    /// Create a writer for the given `database_type` metadata value
    pub fn new(database_type: impl Into<String>) -> Self {
        Self {
            database_type: database_type.into(),
            description: BTreeMap::new(),
            languages: Vec::new(),
            build_epoch: None,
        }
    }

    /// Add a description in a specific language
    pub fn with_description(
        mut self,
        language: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.description.insert(language.into(), text.into());
        self
    }

    /// Locale codes the records carry names for
    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    /// Fix the build timestamp (defaults to now)
    pub fn with_build_epoch(mut self, epoch: u64) -> Self {
        self.build_epoch = Some(epoch);
        self
    }

    /// Serialize the tree
    pub fn build(&self, tree: &PrefixTree) -> Result<Vec<u8>> {
        tree.check_invariants()?;

        let nodes = renumber(tree)?;
        let node_count = u32::try_from(nodes.len())
            .map_err(|_| EnrichError::Format("too many search tree nodes".to_string()))?;

        // Encode records in tree order so equal trees give equal bytes
        let mut encoder = DataEncoder::new();
        let mut offsets: FxHashMap<u32, u32> = FxHashMap::default();
        let mut records = Vec::with_capacity(nodes.len());
        for children in &nodes {
            let mut pair = [Record::Empty; 2];
            for (side, slot) in children.iter().enumerate() {
                pair[side] = match *slot {
                    Numbered::Empty => Record::Empty,
                    Numbered::Node(id) => Record::Node(id),
                    Numbered::Leaf(record) => {
                        let offset = match offsets.get(&record) {
                            Some(&offset) => offset,
                            None => {
                                let offset = encoder.encode(tree.record(record)?)?;
                                offsets.insert(record, offset);
                                offset
                            }
                        };
                        Record::Data(offset)
                    }
                };
            }
            records.push(pair);
        }

        let data_section = encoder.into_bytes();
        let max_value =
            u64::from(node_count) + DATA_SECTION_SEPARATOR.len() as u64 + data_section.len() as u64;
        let record_size = RecordSize::smallest_for(max_value)?;

        debug!(
            "Serializing {} nodes, {} distinct records, {} data bytes, {}-bit records",
            node_count,
            offsets.len(),
            data_section.len(),
            record_size.bits()
        );

        let mut database = Vec::with_capacity(
            nodes.len() * record_size.node_bytes() + 16 + data_section.len() + 512,
        );
        for [left, right] in records {
            write_node(
                &mut database,
                record_size,
                record_value(left, node_count),
                record_value(right, node_count),
            );
        }
        database.extend_from_slice(&DATA_SECTION_SEPARATOR);
        database.extend_from_slice(&data_section);

        let metadata = self.metadata(node_count, record_size);
        let mut meta_encoder = DataEncoder::new();
        meta_encoder.encode(&metadata)?;
        database.extend_from_slice(METADATA_MARKER);
        database.extend_from_slice(&meta_encoder.into_bytes());

        Ok(database)
    }

    /// Serialize the tree and write it to `path`, creating parent directories
    ///
    /// Returns the number of bytes written.
    pub fn write_to_file(&self, tree: &PrefixTree, path: &Path) -> Result<usize> {
        let bytes = self.build(tree)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                EnrichError::Io(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        fs::write(path, &bytes)
            .map_err(|e| EnrichError::Io(format!("failed to write {}: {}", path.display(), e)))?;
        Ok(bytes.len())
    }

    fn metadata(&self, node_count: u32, record_size: RecordSize) -> DataValue {
        let build_epoch = self.build_epoch.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });

        let description = if self.description.is_empty() {
            BTreeMap::from([(
                "en".to_string(),
                format!("{} enriched with locale names", self.database_type),
            )])
        } else {
            self.description.clone()
        };

        DataValue::map_from([
            ("binary_format_major_version", DataValue::Uint16(2)),
            ("binary_format_minor_version", DataValue::Uint16(0)),
            ("build_epoch", DataValue::Uint64(build_epoch)),
            ("database_type", DataValue::from(self.database_type.as_str())),
            ("description", DataValue::from(description)),
            ("ip_version", DataValue::Uint16(6)),
            (
                "languages",
                DataValue::Array(
                    self.languages
                        .iter()
                        .map(|l| DataValue::from(l.as_str()))
                        .collect(),
                ),
            ),
            ("node_count", DataValue::Uint32(node_count)),
            ("record_size", DataValue::Uint16(record_size.bits())),
        ])
    }
}

/// Assign node numbers in depth-first order, left before right
///
/// MMDB files always have a root node, so a tree with nothing to write gets a
/// single node with both sides empty.
fn renumber(tree: &PrefixTree) -> Result<Vec<[Numbered; 2]>> {
    let alias = ipv4_alias_path(tree)?;
    let root = match (&alias, tree.root(Family::V6)) {
        (Some(_), _) => Source::Alias(0),
        (None, Slot::Node(id)) => Source::Tree(id),
        (None, _) => return Ok(vec![[Numbered::Empty; 2]]),
    };

    let children_of = |source: Source| -> Result<[Child; 2]> {
        match source {
            Source::Tree(id) => Ok(tree.children(id)?.map(Child::from)),
            Source::Alias(depth) => alias
                .as_ref()
                .and_then(|path| path.get(depth as usize))
                .copied()
                .ok_or_else(|| {
                    EnrichError::TreeInvariant(format!("no alias node at depth {}", depth))
                }),
        }
    };

    let mut numbering: FxHashMap<Source, u32> = FxHashMap::default();
    let mut order = Vec::with_capacity(tree.node_count() + IPV4_SUBTREE_DEPTH as usize);
    let mut stack = vec![root];

    while let Some(source) = stack.pop() {
        let new_id = u32::try_from(order.len())
            .map_err(|_| EnrichError::Format("too many search tree nodes".to_string()))?;
        if numbering.insert(source, new_id).is_some() {
            return Err(EnrichError::TreeInvariant(format!(
                "node {:?} reachable twice",
                source
            )));
        }
        let children = children_of(source)?;
        order.push(children);
        for child in children.iter().rev() {
            if let Child::Node(next) = child {
                stack.push(*next);
            }
        }
    }

    order
        .into_iter()
        .map(|children| -> Result<[Numbered; 2]> {
            let mut out = [Numbered::Empty; 2];
            for (side, child) in children.into_iter().enumerate() {
                out[side] = match child {
                    Child::Empty => Numbered::Empty,
                    Child::Leaf(record) => Numbered::Leaf(record),
                    Child::Node(source) => {
                        Numbered::Node(numbering.get(&source).copied().ok_or_else(|| {
                            EnrichError::TreeInvariant(format!(
                                "node {:?} was never numbered",
                                source
                            ))
                        })?)
                    }
                };
            }
            Ok(out)
        })
        .collect()
}

/// Children of the synthetic nodes from the root down to `::/96`
///
/// Each one keeps the IPv6 tree's content on its one side; the zero side
/// leads on, ending in the IPv4 root. Returns `None` when there is no IPv4
/// data and no IPv6 data reaching `::/96`, so the IPv6 tree is written as is.
fn ipv4_alias_path(tree: &PrefixTree) -> Result<Option<Vec<[Child; 2]>>> {
    let v4_root = tree.root(Family::V4);
    let mut v6 = tree.root(Family::V6);
    let mut path = Vec::with_capacity(IPV4_SUBTREE_DEPTH as usize);

    for depth in 0..IPV4_SUBTREE_DEPTH {
        let [zero, one] = match v6 {
            Slot::Empty if v4_root == Slot::Empty => return Ok(None),
            Slot::Empty => [Slot::Empty; 2],
            Slot::Leaf { .. } => [v6; 2],
            Slot::Node(id) => tree.children(id)?,
        };
        let next = if depth + 1 < IPV4_SUBTREE_DEPTH {
            Child::Node(Source::Alias(depth + 1))
        } else {
            Child::from(v4_root)
        };
        path.push([next, Child::from(one)]);
        v6 = zero;
    }

    // Pieces of broader IPv6 networks give way to the IPv4 subtree
    match v6 {
        Slot::Empty => {}
        Slot::Leaf { depth, .. } if depth < IPV4_SUBTREE_DEPTH => {}
        _ => {
            return Err(EnrichError::Format(
                "IPv6 networks inside ::/96 collide with the IPv4 search tree".to_string(),
            ))
        }
    }

    Ok(Some(path))
}

fn record_value(record: Record, node_count: u32) -> u64 {
    match record {
        Record::Empty => u64::from(node_count),
        Record::Node(id) => u64::from(id),
        Record::Data(offset) => {
            u64::from(node_count) + DATA_SECTION_SEPARATOR.len() as u64 + u64::from(offset)
        }
    }
}

fn write_node(out: &mut Vec<u8>, record_size: RecordSize, left: u64, right: u64) {
    match record_size {
        RecordSize::Bits24 => {
            out.extend_from_slice(&(left as u32).to_be_bytes()[1..]);
            out.extend_from_slice(&(right as u32).to_be_bytes()[1..]);
        }
        RecordSize::Bits28 => {
            // [left low 24][left high 4 | right high 4][right low 24]
            out.extend_from_slice(&(left as u32).to_be_bytes()[1..]);
            out.push(((((left >> 24) & 0x0F) as u8) << 4) | (((right >> 24) & 0x0F) as u8));
            out.extend_from_slice(&(right as u32).to_be_bytes()[1..]);
        }
        RecordSize::Bits32 => {
            out.extend_from_slice(&(left as u32).to_be_bytes());
            out.extend_from_slice(&(right as u32).to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefix_tree::MergeStrategy;

    fn tree_with(nets: &[(&str, &str)]) -> PrefixTree {
        let mut tree = PrefixTree::new();
        for (net, tag) in nets {
            tree.insert(
                net.parse().unwrap(),
                DataValue::map_from([("tag", DataValue::from(*tag))]),
                MergeStrategy::TopLevel,
            )
            .unwrap();
        }
        tree
    }

    #[test]
    fn test_empty_tree_has_single_root() {
        let bytes = MmdbWriter::new("Test")
            .with_build_epoch(0)
            .build(&PrefixTree::new())
            .unwrap();
        // One 24-bit node whose records both point at node_count (1)
        assert_eq!(&bytes[..6], &[0, 0, 1, 0, 0, 1]);
        assert_eq!(&bytes[6..22], &DATA_SECTION_SEPARATOR);
        assert_eq!(&bytes[22..22 + METADATA_MARKER.len()], METADATA_MARKER);
    }

    #[test]
    fn test_insertion_order_does_not_change_bytes() {
        let a = tree_with(&[("10.0.0.0/8", "a"), ("192.168.0.0/16", "b"), ("2001:db8::/32", "c")]);
        let b = tree_with(&[("2001:db8::/32", "c"), ("192.168.0.0/16", "b"), ("10.0.0.0/8", "a")]);

        let writer = MmdbWriter::new("Test").with_build_epoch(1_700_000_000);
        assert_eq!(writer.build(&a).unwrap(), writer.build(&b).unwrap());
    }

    #[test]
    fn test_ipv4_grafted_under_ipv6_alias_path() {
        let tree = tree_with(&[("10.0.0.0/8", "v4"), ("2001:db8::/32", "v6")]);
        let bytes = MmdbWriter::new("Test").with_build_epoch(0).build(&tree).unwrap();
        let db = crate::mmdb::Database::from_bytes(bytes).unwrap();

        // 96 alias nodes replace the three 2001:db8::/32 nodes on the zero path
        assert_eq!(db.node_count() as usize, 96 - 3 + tree.node_count());
        let hit = db.lookup("10.1.2.3".parse().unwrap()).unwrap().unwrap();
        assert_eq!(hit.network.to_string(), "10.0.0.0/8");
        assert!(db.lookup("::a01:203".parse().unwrap()).unwrap().is_some());
        assert!(db.lookup("2001:db8::1".parse().unwrap()).unwrap().is_some());
    }

    #[test]
    fn test_ipv6_inside_ipv4_subtree_is_rejected() {
        for nets in [
            &[("::a00:0/104", "v6")][..],
            &[("10.0.0.0/8", "v4"), ("::/96", "v6")][..],
        ] {
            let err = MmdbWriter::new("Test").build(&tree_with(nets)).unwrap_err();
            assert!(matches!(err, EnrichError::Format(_)), "{:?}", nets);
        }
    }

    #[test]
    fn test_ipv6_only_tree_written_as_is() {
        let tree = tree_with(&[("2001:db8::/32", "v6")]);
        let bytes = MmdbWriter::new("Test").with_build_epoch(0).build(&tree).unwrap();
        let db = crate::mmdb::Database::from_bytes(bytes).unwrap();
        assert_eq!(db.node_count() as usize, tree.node_count());
    }

    #[test]
    fn test_identical_records_stored_once() {
        let tree = tree_with(&[("10.0.0.0/8", "same"), ("11.0.0.0/8", "same")]);
        let single = tree_with(&[("10.0.0.0/8", "same")]);

        let writer = MmdbWriter::new("Test").with_build_epoch(0);
        let both = writer.build(&tree).unwrap();
        let one = writer.build(&single).unwrap();
        let record_len = crate::data_section::encode_value(&DataValue::map_from([(
            "tag",
            DataValue::from("same"),
        )]))
        .unwrap()
        .len();

        let data_len = |bytes: &[u8]| {
            let nodes = crate::mmdb::Database::from_bytes(bytes.to_vec())
                .unwrap()
                .node_count() as usize;
            let start = nodes * 6 + 16;
            let marker = bytes
                .windows(METADATA_MARKER.len())
                .rposition(|w| w == METADATA_MARKER)
                .unwrap();
            marker - start
        };
        assert_eq!(data_len(&both), record_len);
        assert_eq!(data_len(&one), record_len);
    }

    #[test]
    fn test_write_to_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.mmdb");
        let written = MmdbWriter::new("Test")
            .write_to_file(&tree_with(&[("10.0.0.0/8", "a")]), &path)
            .unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, written);
    }
}
