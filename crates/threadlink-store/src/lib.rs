//! threadlink-store - Persistent thread/channel bindings
//!
//! SQLite implementation of the core `MappingStore`, plus a one-shot
//! importer for databases written by the legacy bridge.

pub mod sqlite;

pub use sqlite::{DEFAULT_NAME_CACHE_CAPACITY, ImportReport, SqliteMappingStore};
