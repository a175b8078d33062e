//! Dual-tier file storage: an authoritative local filesystem tier, an
//! eventually consistent S3-compatible remote tier, and a bounded replication
//! pool copying local writes to the remote in the background.

mod local;
mod paths;
mod remote;
mod replicator;
mod store;
mod traits;

pub use local::LocalStore;
pub use remote::{RemoteOptions, RemoteStore, RetryPolicy};
pub use replicator::{ReplicateJob, Replicator};
pub use store::AsyncStore;
pub use traits::{FileReader, FileStore, SavedFile, StorageError, StorageResult};
