//! Background synchronisation of in-memory state with the database.

pub mod policy_snapshot;

pub use policy_snapshot::{PolicySnapshotSync, SyncConfig, SyncStatus};
