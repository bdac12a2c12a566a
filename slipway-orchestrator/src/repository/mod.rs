//! Repository Module
//!
//! Postgres-backed implementations of the engine's storage seams.

pub mod records;

pub use records::PgRecordStore;
