use async_trait::async_trait;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Byte source handed to `save` and returned by `open`.
pub type FileReader = Pin<Box<dyn AsyncRead + Send>>;

/// Outcome of a successful save: bytes consumed from the reader and the hex
/// SHA-256 digest of those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub written: u64,
    pub hash: String,
}

/// Capability set shared by both storage tiers and the write-through facade.
///
/// Filenames are single-segment canonical paths; implementations reject names
/// that escape their base prefix. `delete` is idempotent (absence is not an
/// error) and `cleanup_older_than` removes entries whose modification time is
/// older than `now - max_age`.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Persist the reader's bytes under `filename`. `size` is a hint for
    /// backends that want it up front; `None` means unknown.
    async fn save(
        &self,
        reader: FileReader,
        filename: &str,
        size: Option<u64>,
    ) -> StorageResult<SavedFile>;

    /// Open `filename` for reading, returning the stream and its size.
    async fn open(&self, filename: &str) -> StorageResult<(FileReader, u64)>;

    async fn delete(&self, filename: &str) -> StorageResult<()>;

    async fn cleanup_older_than(&self, max_age: Duration) -> StorageResult<()>;
}
