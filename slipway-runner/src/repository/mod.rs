//! Repository layer
//!
//! Narrow contracts to the external collaborators the engine mirrors its state
//! into: the relational metadata store and the durable blob archive.
//!
//! All repositories are trait-based so the engine can run against in-memory
//! implementations in tests and against Postgres / a blob store in production.

mod archive;
mod records;

// Re-export traits
pub use archive::ArchiveStore;
pub use records::RecordStore;

// Re-export implementations
pub use archive::{FsArchive, MemoryArchive, get_json, put_json};
pub use records::InMemoryRecordStore;
