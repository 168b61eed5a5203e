pub mod schema;
pub mod snapshots;
pub mod store;

pub use snapshots::{SnapshotStore, PREFIX_ERRORS, PREFIX_SCHEMA};
pub use store::{Store, UpsertOutcome};
