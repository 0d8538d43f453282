//! Prefix tree with merge-on-insert
//!
//! A binary radix tree over address bits with one root per address family,
//! so IPv4 and IPv6 networks never share a path (see [`crate::network`] for
//! the key layout). Nodes live in an arena and refer to each other by index;
//! records live in a second arena and are referenced from leaf slots.
//!
//! Every child slot of a node is empty, a branch to another node, or a leaf.
//! A leaf covers exactly the range named by its path and remembers the
//! prefix length of the network it was inserted as. That length is shorter
//! than the path when a broader network was split to make room for a more
//! specific one:
//!
//! ```text
//! insert 10.0.0.0/16 (A), then 10.0.1.0/24 (B)
//!
//!   depth 16 ── leaf A/16          (before)
//!
//!   depth 16 ── node ─┬─ 0: node ─ ... ─┬─ leaf A/16   (after: A split
//!                     │                 └─ leaf B/24    down to /24)
//!                     └─ 1: leaf A/16
//! ```
//!
//! Longest-prefix precedence is therefore structural: a lookup returns the
//! first leaf on its path, and a broader insertion never overwrites a leaf
//! that came from a longer prefix.

use crate::data_section::DataValue;
use crate::error::{EnrichError, Result};
use crate::network::{address_key, Family, Network};
use rustc_hash::FxHashSet;
use std::net::IpAddr;

/// How a record is combined with the one already stored at the same prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// New top-level keys are added, colliding top-level keys take the new
    /// value. Nested maps are replaced, not merged.
    #[default]
    TopLevel,
    /// The new record replaces the existing one
    Replace,
    /// Maps are merged recursively; anything else takes the new value
    Deep,
}

impl MergeStrategy {
    /// Merge `new` into `existing`
    pub fn merge(self, existing: &mut DataValue, new: DataValue) {
        match self {
            MergeStrategy::Replace => *existing = new,
            MergeStrategy::TopLevel => match (existing, new) {
                (DataValue::Map(old), DataValue::Map(new)) => old.extend(new),
                (existing, new) => *existing = new,
            },
            MergeStrategy::Deep => deep_merge(existing, new),
        }
    }
}

fn deep_merge(existing: &mut DataValue, new: DataValue) {
    match (existing, new) {
        (DataValue::Map(old), DataValue::Map(new)) => {
            for (key, value) in new {
                match old.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        old.insert(key, value);
                    }
                }
            }
        }
        (existing, new) => *existing = new,
    }
}

/// Child slot of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Empty,
    Node(u32),
    /// `depth` is the prefix length of the network the record was inserted as
    Leaf { record: u32, depth: u8 },
}

#[derive(Debug, Clone)]
struct Node {
    children: [Slot; 2],
}

impl Node {
    fn new_empty() -> Self {
        Self {
            children: [Slot::Empty, Slot::Empty],
        }
    }
}

/// Location of a slot: the root slot or a child of a node
#[derive(Debug, Clone, Copy)]
enum SlotRef {
    Root(Family),
    Child(u32, usize),
}

/// Result of a longest-prefix lookup
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match<'a> {
    /// The network the record was inserted with
    pub network: Network,
    pub data: &'a DataValue,
}

/// A leaf visited by [`PrefixTree::leaves`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leaf<'a> {
    /// Address range covered by this leaf (its path in the tree)
    pub range: Network,
    /// The network the record was inserted with
    pub network: Network,
    pub data: &'a DataValue,
}

/// IP prefix tree mapping networks to records
#[derive(Debug, Clone)]
pub struct PrefixTree {
    /// One root per family, see `family_index`
    roots: [Slot; 2],
    nodes: Vec<Node>,
    records: Vec<DataValue>,
}

impl Default for PrefixTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixTree {
    pub fn new() -> Self {
        Self {
            roots: [Slot::Empty; 2],
            nodes: Vec::new(),
            records: Vec::new(),
        }
    }

    /// Insert a network with its record
    ///
    /// An exact-prefix collision merges the records with `strategy`. A
    /// network inside a broader one splits the broader leaf; a network
    /// around narrower ones only fills the gaps they leave.
    pub fn insert(
        &mut self,
        network: Network,
        value: DataValue,
        strategy: MergeStrategy,
    ) -> Result<()> {
        let key = network.key();
        let depth = network.prefix_len();

        let target = self.descend_splitting(network.family(), key, depth)?;

        match self.slot(target) {
            Slot::Empty => {
                let record = self.push_record(value)?;
                self.set_slot(target, Slot::Leaf { record, depth });
            }
            Slot::Leaf {
                record,
                depth: leaf_depth,
            } if leaf_depth == depth => {
                strategy.merge(&mut self.records[record as usize], value);
            }
            Slot::Leaf {
                depth: leaf_depth, ..
            } if leaf_depth < depth => {
                // Piece of a broader network; the more specific one wins here
                let record = self.push_record(value)?;
                self.set_slot(target, Slot::Leaf { record, depth });
            }
            Slot::Leaf {
                depth: leaf_depth, ..
            } => {
                return Err(EnrichError::TreeInvariant(format!(
                    "leaf for a /{} prefix found at depth {} while inserting {}",
                    leaf_depth, depth, network
                )));
            }
            Slot::Node(node_id) => {
                self.backfill(node_id, depth, value, strategy, network)?;
            }
        }

        Ok(())
    }

    /// Walk to the slot at `depth` along `key`, creating nodes and splitting
    /// broader leaves on the way
    fn descend_splitting(&mut self, family: Family, key: u128, depth: u8) -> Result<SlotRef> {
        let mut at = SlotRef::Root(family);

        for d in 0..depth {
            let node_id = match self.slot(at) {
                Slot::Empty => {
                    let id = self.allocate_node(Slot::Empty)?;
                    self.set_slot(at, Slot::Node(id));
                    id
                }
                Slot::Node(id) => self.check_node(id)?,
                Slot::Leaf {
                    record,
                    depth: leaf_depth,
                } => {
                    if leaf_depth > d {
                        return Err(EnrichError::TreeInvariant(format!(
                            "leaf for a /{} prefix found at depth {}",
                            leaf_depth, d
                        )));
                    }
                    // Both halves keep the broader record
                    let id = self.allocate_node(Slot::Leaf {
                        record,
                        depth: leaf_depth,
                    })?;
                    self.set_slot(at, Slot::Node(id));
                    id
                }
            };
            at = SlotRef::Child(node_id, bit_at(key, d));
        }

        Ok(at)
    }

    /// Insert a network whose slot already holds a subtree of more specific
    /// networks
    ///
    /// If the subtree holds pieces of this exact network, their record is
    /// merged in place. Empty slots and pieces of broader networks are then
    /// pointed at the network's record; pieces of narrower networks are left
    /// alone.
    fn backfill(
        &mut self,
        subtree: u32,
        depth: u8,
        value: DataValue,
        strategy: MergeStrategy,
        network: Network,
    ) -> Result<()> {
        let mut exact = None;
        let mut fill = Vec::new();
        let mut stack = vec![subtree];

        while let Some(node_id) = stack.pop() {
            let node_id = self.check_node(node_id)?;
            for (bit, child) in self.nodes[node_id as usize].children.iter().enumerate() {
                match *child {
                    Slot::Empty => fill.push(SlotRef::Child(node_id, bit)),
                    Slot::Node(id) => stack.push(id),
                    Slot::Leaf {
                        record,
                        depth: leaf_depth,
                    } => {
                        if leaf_depth < depth {
                            fill.push(SlotRef::Child(node_id, bit));
                        } else if leaf_depth == depth {
                            match exact {
                                None => exact = Some(record),
                                Some(seen) if seen == record => {}
                                Some(seen) => {
                                    return Err(EnrichError::TreeInvariant(format!(
                                        "records {} and {} both claim {}",
                                        seen, record, network
                                    )));
                                }
                            }
                        }
                    }
                }
            }
        }

        let record = match exact {
            Some(record) => {
                strategy.merge(&mut self.records[record as usize], value);
                record
            }
            None => self.push_record(value)?,
        };

        for slot in fill {
            self.set_slot(slot, Slot::Leaf { record, depth });
        }

        Ok(())
    }

    /// Longest-prefix match for an address
    ///
    /// Node ids only come from the arena allocator and nodes are never
    /// removed, so a missing node here is a corrupted tree; it reads as no
    /// match. [`PrefixTree::check_invariants`] (run by the writer) reports it
    /// as a `TreeInvariant` error.
    pub fn lookup(&self, addr: IpAddr) -> Option<Match<'_>> {
        let family = Family::of(&addr);
        let key = address_key(addr);
        let mut slot = self.roots[family_index(family)];
        let mut d = 0u8;

        loop {
            match slot {
                Slot::Empty => return None,
                Slot::Leaf { record, depth } => {
                    return Some(Match {
                        network: Network::from_key(family, key, depth),
                        data: self.records.get(record as usize)?,
                    });
                }
                Slot::Node(id) => {
                    if d >= family.bits() {
                        return None;
                    }
                    slot = self.nodes.get(id as usize)?.children[bit_at(key, d)];
                    d += 1;
                }
            }
        }
    }

    /// Record stored for exactly `network`, if it was inserted and is still
    /// reachable
    pub fn get(&self, network: &Network) -> Option<&DataValue> {
        let key = network.key();
        let depth = network.prefix_len();
        let mut slot = self.roots[family_index(network.family())];

        for d in 0..depth {
            match slot {
                Slot::Node(id) => slot = self.nodes.get(id as usize)?.children[bit_at(key, d)],
                _ => return None,
            }
        }

        let mut stack = vec![slot];
        while let Some(slot) = stack.pop() {
            match slot {
                Slot::Empty => {}
                Slot::Leaf { record, depth: d } if d == depth => {
                    return self.records.get(record as usize);
                }
                Slot::Leaf { .. } => {}
                Slot::Node(id) => stack.extend(self.nodes.get(id as usize)?.children),
            }
        }
        None
    }

    /// Leaves in ascending address order, IPv4 before IPv6
    ///
    /// Like [`PrefixTree::lookup`], a corrupted tree shows up here as missing
    /// leaves; [`PrefixTree::check_invariants`] is the place that fails.
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves {
            tree: self,
            stack: vec![
                (Family::V6, self.roots[family_index(Family::V6)], 0, 0),
                (Family::V4, self.roots[family_index(Family::V4)], 0, 0),
            ],
        }
    }

    /// Distinct inserted networks that still cover at least one address,
    /// in order of their lowest address
    pub fn entries(&self) -> impl Iterator<Item = (Network, &DataValue)> + '_ {
        let mut seen = FxHashSet::default();
        self.leaves()
            .filter(move |leaf| seen.insert(leaf.network))
            .map(|leaf| (leaf.network, leaf.data))
    }

    /// Number of networks stored as distinct records
    ///
    /// Networks merged into an existing prefix do not count twice.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of branch nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Verify the structural invariants, failing on the first violation
    pub fn check_invariants(&self) -> Result<()> {
        let mut visited = FxHashSet::default();

        for family in Family::ALL {
            let mut stack = vec![(self.roots[family_index(family)], 0u8)];

            while let Some((slot, depth)) = stack.pop() {
                match slot {
                    Slot::Empty => {}
                    Slot::Leaf {
                        record,
                        depth: leaf_depth,
                    } => {
                        if leaf_depth > depth {
                            return Err(EnrichError::TreeInvariant(format!(
                                "leaf for a /{} prefix at depth {}",
                                leaf_depth, depth
                            )));
                        }
                        if record as usize >= self.records.len() {
                            return Err(EnrichError::TreeInvariant(format!(
                                "dangling record {}",
                                record
                            )));
                        }
                    }
                    Slot::Node(id) => {
                        let id = self.check_node(id)?;
                        if depth >= family.bits() {
                            return Err(EnrichError::TreeInvariant(format!(
                                "node {} below the last {:?} address bit",
                                id, family
                            )));
                        }
                        if !visited.insert(id) {
                            return Err(EnrichError::TreeInvariant(format!(
                                "node {} reachable from two parents",
                                id
                            )));
                        }
                        for child in self.nodes[id as usize].children {
                            stack.push((child, depth + 1));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub(crate) fn root(&self, family: Family) -> Slot {
        self.roots[family_index(family)]
    }

    pub(crate) fn children(&self, node_id: u32) -> Result<[Slot; 2]> {
        self.nodes
            .get(node_id as usize)
            .map(|node| node.children)
            .ok_or_else(|| EnrichError::TreeInvariant(format!("dangling node {}", node_id)))
    }

    pub(crate) fn record(&self, record: u32) -> Result<&DataValue> {
        self.records
            .get(record as usize)
            .ok_or_else(|| EnrichError::TreeInvariant(format!("dangling record {}", record)))
    }

    fn slot(&self, at: SlotRef) -> Slot {
        match at {
            SlotRef::Root(family) => self.roots[family_index(family)],
            SlotRef::Child(node, bit) => self.nodes[node as usize].children[bit],
        }
    }

    fn set_slot(&mut self, at: SlotRef, slot: Slot) {
        match at {
            SlotRef::Root(family) => self.roots[family_index(family)] = slot,
            SlotRef::Child(node, bit) => self.nodes[node as usize].children[bit] = slot,
        }
    }

    fn check_node(&self, id: u32) -> Result<u32> {
        if (id as usize) < self.nodes.len() {
            Ok(id)
        } else {
            Err(EnrichError::TreeInvariant(format!("dangling node {}", id)))
        }
    }

    /// Allocate a node whose children both start as `fill`
    fn allocate_node(&mut self, fill: Slot) -> Result<u32> {
        let id = u32::try_from(self.nodes.len())
            .map_err(|_| EnrichError::TreeInvariant("node arena exhausted".to_string()))?;
        let mut node = Node::new_empty();
        node.children = [fill, fill];
        self.nodes.push(node);
        Ok(id)
    }

    fn push_record(&mut self, value: DataValue) -> Result<u32> {
        let id = u32::try_from(self.records.len())
            .map_err(|_| EnrichError::TreeInvariant("record arena exhausted".to_string()))?;
        self.records.push(value);
        Ok(id)
    }
}

/// Iterator over the leaves of a [`PrefixTree`]
pub struct Leaves<'a> {
    tree: &'a PrefixTree,
    /// (family, slot, key of the slot's path, depth of the slot)
    stack: Vec<(Family, Slot, u128, u8)>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = Leaf<'a>;

    fn next(&mut self) -> Option<Leaf<'a>> {
        while let Some((family, slot, key, depth)) = self.stack.pop() {
            match slot {
                Slot::Empty => {}
                Slot::Leaf {
                    record,
                    depth: leaf_depth,
                } => {
                    let Some(data) = self.tree.records.get(record as usize) else {
                        continue;
                    };
                    return Some(Leaf {
                        range: Network::from_key(family, key, depth),
                        network: Network::from_key(family, key, leaf_depth),
                        data,
                    });
                }
                Slot::Node(id) => {
                    let Some(node) = self.tree.nodes.get(id as usize) else {
                        continue;
                    };
                    if depth >= family.bits() {
                        continue;
                    }
                    let one = key | (1u128 << (127 - depth));
                    // Right first so the zero branch pops first
                    self.stack.push((family, node.children[1], one, depth + 1));
                    self.stack.push((family, node.children[0], key, depth + 1));
                }
            }
        }
        None
    }
}

fn family_index(family: Family) -> usize {
    match family {
        Family::V4 => 0,
        Family::V6 => 1,
    }
}

fn bit_at(key: u128, depth: u8) -> usize {
    ((key >> (127 - u32::from(depth))) & 1) as usize
}
