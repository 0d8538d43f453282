//! MaxMind DB (MMDB) files
//!
//! The finished [`PrefixTree`](crate::prefix_tree::PrefixTree) is written as
//! a standard MMDB file so that any MaxMind reader can query it:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  1. Search tree (binary trie)        │
//! │  2. 16 zero bytes                    │
//! │  3. Data section (deduplicated)      │
//! │  4. \xAB\xCD\xEFMaxMind.com          │
//! │  5. Metadata map                     │
//! └──────────────────────────────────────┘
//! ```
//!
//! - **types**: record sizes and format constants
//! - **writer**: tree → bytes
//! - **reader**: bytes → lookups (used by the CLI and to verify output)

pub mod reader;
pub mod types;
pub mod writer;

pub use reader::{Database, LookupResult};
pub use types::{RecordSize, DATA_SECTION_SEPARATOR, METADATA_MARKER};
pub use writer::MmdbWriter;
