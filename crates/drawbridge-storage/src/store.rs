use crate::replicator::{ReplicateJob, Replicator};
use crate::traits::{FileReader, FileStore, SavedFile, StorageError, StorageResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Write-through facade over the two tiers.
///
/// Saves commit locally and enqueue a background copy to the remote; reads
/// fall through local→remote; deletes and age sweeps fan out to both tiers.
pub struct AsyncStore {
    local: Arc<dyn FileStore>,
    remote: Arc<dyn FileStore>,
    replicator: Replicator,
}

impl AsyncStore {
    pub async fn new(
        local: Arc<dyn FileStore>,
        remote: Arc<dyn FileStore>,
        queue_capacity: usize,
        worker_count: usize,
        max_retries: u32,
    ) -> Self {
        let replicator = Replicator::new(
            Arc::clone(&local),
            Arc::clone(&remote),
            queue_capacity,
            worker_count,
            max_retries,
        );
        replicator.start().await;

        AsyncStore {
            local,
            remote,
            replicator,
        }
    }

    /// Stop the replication pool, waiting up to `timeout` for in-flight
    /// copies.
    pub async fn close(&self, timeout: Duration) -> StorageResult<()> {
        self.replicator.stop(timeout).await
    }
}

#[async_trait]
impl FileStore for AsyncStore {
    async fn save(
        &self,
        reader: FileReader,
        filename: &str,
        size: Option<u64>,
    ) -> StorageResult<SavedFile> {
        let saved = self.local.save(reader, filename, size).await?;

        let accepted = self
            .replicator
            .enqueue(ReplicateJob {
                filename: filename.to_string(),
                size: saved.written,
                hash: saved.hash.clone(),
                retries: 0,
            })
            .await;
        if !accepted {
            tracing::error!(
                filename,
                size = saved.written,
                "replication queue full, file saved only locally"
            );
        }

        Ok(saved)
    }

    async fn open(&self, filename: &str) -> StorageResult<(FileReader, u64)> {
        match self.local.open(filename).await {
            Ok(found) => Ok(found),
            Err(StorageError::NotFound(_)) => self.remote.open(filename).await,
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, filename: &str) -> StorageResult<()> {
        let mut first_err = None;

        if let Err(e) = self.local.delete(filename).await {
            tracing::warn!(filename, error = %e, "delete from local tier failed");
            first_err = Some(e);
        }

        if let Err(e) = self.remote.delete(filename).await {
            tracing::warn!(filename, error = %e, "delete from remote tier failed");
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> StorageResult<()> {
        // First error wins and cancels the sibling sweep.
        tokio::try_join!(
            self.local.cleanup_older_than(max_age),
            self.remote.cleanup_older_than(max_age),
        )?;
        Ok(())
    }
}
