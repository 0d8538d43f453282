//! mmdb-enrich - GeoLite2 CSV to MaxMind DB converter
//!
//! Joins GeoLite2 blocks files (network → geoname id) with the per-language
//! locations files (geoname id → localized names) and writes the merged
//! records as MMDB files that any MaxMind reader can query.
//!
//! # Quick Start
//!
//! ```rust
//! use mmdb_enrich::{Database, DataValue, MergeStrategy, MmdbWriter, PrefixTree};
//!
//! let mut tree = PrefixTree::new();
//! let tag = |t: &str| DataValue::map_from([("tag", DataValue::from(t))]);
//!
//! tree.insert("10.0.0.0/16".parse()?, tag("broad"), MergeStrategy::TopLevel)?;
//! tree.insert("10.0.1.0/24".parse()?, tag("narrow"), MergeStrategy::TopLevel)?;
//!
//! // Longest prefix wins regardless of insertion order
//! let hit = tree.lookup("10.0.1.5".parse()?).unwrap();
//! assert_eq!(hit.network.to_string(), "10.0.1.0/24");
//!
//! // Serialize and query the MMDB bytes
//! let db = Database::from_bytes(MmdbWriter::new("Example").build(&tree)?)?;
//! let hit = db.lookup("10.0.2.5".parse()?)?.unwrap();
//! assert_eq!(hit.data.get("tag").and_then(DataValue::as_str), Some("broad"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//!  locations CSVs ──► LocaleIndex ─┐
//!                                  ├─► assembler ──► PrefixTree ──► MmdbWriter ──► .mmdb
//!  blocks CSVs ────────────────────┘        ▲
//!                                  continent catalog
//! ```
//!
//! [`converter`] drives the whole pipeline for one dataset directory.

#![warn(clippy::all)]

/// Block row → (network, record)
pub mod assembler;
/// Continent code → geoname id catalog
pub mod continent;
/// Dataset orchestration
pub mod converter;
/// MMDB data section values and codec
pub mod data_section;
/// Error types for enrichment operations
pub mod error;
/// geoname id → localized names
pub mod locale;
/// MMDB writer and reader
pub mod mmdb;
/// CIDR networks and the shared 128-bit key space
pub mod network;
/// IP prefix tree with merge-on-insert
pub mod prefix_tree;

pub use crate::converter::{
    convert_all, convert_dataset, ConversionStats, Converter, Dataset, DEFAULT_INPUT_ROOT,
    DEFAULT_OUTPUT_ROOT,
};
pub use crate::data_section::DataValue;
pub use crate::error::{EnrichError, Result};
pub use crate::locale::{LocaleIndex, LocaleRecord, LocaleRow};
pub use crate::mmdb::{Database, LookupResult, MmdbWriter};
pub use crate::network::Network;
pub use crate::prefix_tree::{MergeStrategy, PrefixTree};

/// Library version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
