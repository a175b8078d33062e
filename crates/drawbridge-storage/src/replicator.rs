use crate::traits::{FileStore, StorageError, StorageResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_WORKER_COUNT: usize = 1;

/// One pending copy of a local file to the remote tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateJob {
    pub filename: String,
    pub size: u64,
    /// Hex SHA-256 recorded at local save time; the remote digest must match.
    pub hash: String,
    pub retries: u32,
}

struct Inner {
    local: Arc<dyn FileStore>,
    remote: Arc<dyn FileStore>,
    tx: mpsc::Sender<ReplicateJob>,
    max_retries: u32,
    token: CancellationToken,
}

/// Bounded worker pool copying local files to the remote tier.
///
/// `enqueue` never blocks: a full queue or a stopped replicator yields
/// `false` and the caller logs and moves on; the local tier stays
/// authoritative either way.
pub struct Replicator {
    inner: Arc<Inner>,
    rx: Mutex<Option<mpsc::Receiver<ReplicateJob>>>,
    closed: RwLock<bool>,
    worker_count: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Replicator {
    pub fn new(
        local: Arc<dyn FileStore>,
        remote: Arc<dyn FileStore>,
        queue_capacity: usize,
        worker_count: usize,
        max_retries: u32,
    ) -> Self {
        let queue_capacity = if queue_capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            queue_capacity
        };
        let worker_count = if worker_count == 0 {
            DEFAULT_WORKER_COUNT
        } else {
            worker_count
        };

        let (tx, rx) = mpsc::channel(queue_capacity);

        Replicator {
            inner: Arc::new(Inner {
                local,
                remote,
                tx,
                max_retries,
                token: CancellationToken::new(),
            }),
            rx: Mutex::new(Some(rx)),
            closed: RwLock::new(false),
            worker_count,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. A no-op when already started or stopped.
    pub async fn start(&self) {
        if *self.closed.read().await {
            return;
        }
        let Some(rx) = self.rx.lock().await.take() else {
            return;
        };

        let rx = Arc::new(Mutex::new(rx));
        let mut handles = self.handles.lock().await;
        for id in 0..self.worker_count {
            let inner = Arc::clone(&self.inner);
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                worker(id, inner, rx).await;
            }));
        }
    }

    /// Non-blocking submit. Returns `false` when the queue is full or the
    /// replicator is stopped.
    pub async fn enqueue(&self, job: ReplicateJob) -> bool {
        if *self.closed.read().await {
            return false;
        }
        self.inner.tx.try_send(job).is_ok()
    }

    /// Stop accepting jobs, cancel the workers, and wait for them within
    /// `timeout`. Idempotent.
    pub async fn stop(&self, timeout: Duration) -> StorageResult<()> {
        {
            let mut closed = self.closed.write().await;
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        self.inner.token.cancel();

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        tokio::time::timeout(timeout, join_all)
            .await
            .map_err(|_| StorageError::Backend("replicator stop timed out".to_string()))?;

        tracing::info!("replicator stopped");
        Ok(())
    }
}

async fn worker(id: usize, inner: Arc<Inner>, rx: Arc<Mutex<mpsc::Receiver<ReplicateJob>>>) {
    loop {
        let job = tokio::select! {
            biased;
            _ = inner.token.cancelled() => break,
            job = next_job(&rx) => match job {
                Some(job) => job,
                None => break,
            },
        };
        inner.handle_job(job).await;
    }
    tracing::debug!(worker = id, "replication worker exited");
}

async fn next_job(rx: &Arc<Mutex<mpsc::Receiver<ReplicateJob>>>) -> Option<ReplicateJob> {
    rx.lock().await.recv().await
}

impl Inner {
    async fn handle_job(&self, mut job: ReplicateJob) {
        let Err(err) = self.replicate_once(&job).await else {
            return;
        };

        if job.retries >= self.max_retries {
            tracing::error!(
                filename = %job.filename,
                retries = job.retries,
                error = %err,
                "replication failed, max retries exceeded"
            );
            return;
        }

        job.retries += 1;
        let filename = job.filename.clone();
        let next_retry = job.retries;
        match self.tx.try_send(job) {
            Ok(()) => {
                tracing::warn!(
                    filename = %filename,
                    error = %err,
                    next_retry,
                    "replication failed, job requeued"
                );
            }
            Err(_) => {
                tracing::error!(
                    filename = %filename,
                    error = %err,
                    "replication failed and queue is full, dropping job"
                );
            }
        }
    }

    async fn replicate_once(&self, job: &ReplicateJob) -> StorageResult<()> {
        let (reader, size) = self
            .local
            .open(&job.filename)
            .await
            .map_err(|e| StorageError::Backend(format!("open local file: {}", e)))?;

        let size = if job.size > 0 { job.size } else { size };

        let saved = self
            .remote
            .save(reader, &job.filename, Some(size))
            .await
            .map_err(|e| StorageError::Backend(format!("save to remote: {}", e)))?;

        if saved.written == 0 {
            return Err(StorageError::Backend(
                "remote save wrote zero bytes".to_string(),
            ));
        }

        if !job.hash.is_empty() && !saved.hash.is_empty() && job.hash != saved.hash {
            return Err(StorageError::Backend(format!(
                "hash mismatch: local={} remote={}",
                job.hash, saved.hash
            )));
        }

        tracing::debug!(filename = %job.filename, size = saved.written, "file replicated");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::traits::{FileReader, SavedFile};
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    /// In-memory store for exercising the replicator and the facade without
    /// touching a real backend.
    #[derive(Default)]
    pub(crate) struct MemStore {
        pub files: Mutex<HashMap<String, Vec<u8>>>,
        pub save_calls: AtomicUsize,
        /// Fail this many saves before succeeding.
        pub failing_saves: AtomicUsize,
        /// Report a bogus digest from every save.
        pub corrupt_hashes: bool,
    }

    impl MemStore {
        pub(crate) async fn insert(&self, name: &str, data: &[u8]) {
            self.files.lock().await.insert(name.to_string(), data.to_vec());
        }

        pub(crate) async fn contains(&self, name: &str) -> bool {
            self.files.lock().await.contains_key(name)
        }
    }

    #[async_trait]
    impl FileStore for MemStore {
        async fn save(
            &self,
            mut reader: FileReader,
            filename: &str,
            _size: Option<u64>,
        ) -> StorageResult<SavedFile> {
            self.save_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failing_saves
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Backend("injected save failure".to_string()));
            }

            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;
            let hash = if self.corrupt_hashes {
                "bogus".to_string()
            } else {
                hex::encode(Sha256::digest(&data))
            };
            let written = data.len() as u64;
            self.files.lock().await.insert(filename.to_string(), data);
            Ok(SavedFile { written, hash })
        }

        async fn open(&self, filename: &str) -> StorageResult<(FileReader, u64)> {
            let files = self.files.lock().await;
            let data = files
                .get(filename)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(filename.to_string()))?;
            let size = data.len() as u64;
            Ok((Box::pin(std::io::Cursor::new(data)), size))
        }

        async fn delete(&self, filename: &str) -> StorageResult<()> {
            self.files.lock().await.remove(filename);
            Ok(())
        }

        async fn cleanup_older_than(&self, _max_age: Duration) -> StorageResult<()> {
            self.files.lock().await.clear();
            Ok(())
        }
    }

    pub(crate) fn job(filename: &str, data: &[u8]) -> ReplicateJob {
        ReplicateJob {
            filename: filename.to_string(),
            size: data.len() as u64,
            hash: hex::encode(Sha256::digest(data)),
            retries: 0,
        }
    }

    pub(crate) async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn replicates_local_file_to_remote() {
        let local = Arc::new(MemStore::default());
        let remote = Arc::new(MemStore::default());
        local.insert("a.dwg", b"payload").await;

        let replicator = Replicator::new(local.clone(), remote.clone(), 4, 1, 0);
        replicator.start().await;
        assert!(replicator.enqueue(job("a.dwg", b"payload")).await);

        let remote2 = remote.clone();
        wait_until(|| remote2.files.try_lock().map(|f| f.contains_key("a.dwg")).unwrap_or(false))
            .await;

        replicator.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            remote.files.lock().await.get("a.dwg").unwrap(),
            &b"payload".to_vec()
        );
    }

    #[tokio::test]
    async fn enqueue_after_stop_returns_false() {
        let local = Arc::new(MemStore::default());
        let remote = Arc::new(MemStore::default());
        let replicator = Replicator::new(local, remote, 4, 1, 0);
        replicator.start().await;
        replicator.stop(Duration::from_secs(1)).await.unwrap();

        assert!(!replicator.enqueue(job("a.dwg", b"x")).await);
        // A second stop is a no-op.
        replicator.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_on_full_queue_returns_false() {
        let local = Arc::new(MemStore::default());
        let remote = Arc::new(MemStore::default());
        // Workers not started, so the first job fills the only slot.
        let replicator = Replicator::new(local, remote, 1, 1, 0);

        assert!(replicator.enqueue(job("a.dwg", b"x")).await);
        assert!(!replicator.enqueue(job("b.dwg", b"y")).await);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_within_budget() {
        let local = Arc::new(MemStore::default());
        let remote = Arc::new(MemStore::default());
        remote.failing_saves.store(1, Ordering::SeqCst);
        local.insert("a.dwg", b"payload").await;

        let replicator = Replicator::new(local, remote.clone(), 4, 1, 2);
        replicator.start().await;
        assert!(replicator.enqueue(job("a.dwg", b"payload")).await);

        let remote2 = remote.clone();
        wait_until(|| remote2.files.try_lock().map(|f| f.contains_key("a.dwg")).unwrap_or(false))
            .await;
        assert!(remote.save_calls.load(Ordering::SeqCst) >= 2);

        replicator.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn hash_mismatch_counts_as_failure() {
        let local = Arc::new(MemStore::default());
        let remote = Arc::new(MemStore {
            corrupt_hashes: true,
            ..MemStore::default()
        });
        local.insert("a.dwg", b"payload").await;

        let replicator = Replicator::new(local, remote.clone(), 4, 1, 1);
        replicator.start().await;
        assert!(replicator.enqueue(job("a.dwg", b"payload")).await);

        // The mismatch is retried once, then dropped.
        let remote2 = remote.clone();
        wait_until(|| remote2.save_calls.load(Ordering::SeqCst) >= 2).await;

        replicator.stop(Duration::from_secs(1)).await.unwrap();
    }
}
