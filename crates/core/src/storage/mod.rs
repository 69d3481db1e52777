pub mod artifacts;
pub mod records;
pub mod redb_store;

pub use artifacts::{ArtifactStore, FilesystemArtifactStore, ObjectArtifactStore};
pub use records::{AdvisoryLockGuard, AdvisoryLocks, RecordStore};
pub use redb_store::RedbRecordStore;
