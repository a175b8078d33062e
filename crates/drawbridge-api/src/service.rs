//! The convert use-case: validate the upload, commit it to storage, create
//! or join a task, and hand the id to the queue.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use drawbridge_core::models::{CreateTaskParams, StatusResponse, Task, TaskStatus};
use drawbridge_core::TaskError;
use drawbridge_registry::RegistryError;
use drawbridge_storage::{FileReader, FileStore};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Registry operations the ingress needs.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, p: CreateTaskParams) -> anyhow::Result<Uuid>;
    async fn task(&self, id: Uuid) -> anyhow::Result<Option<Task>>;
    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        err_reason: Option<String>,
    ) -> anyhow::Result<()>;
    async fn by_idempotency_key(&self, key: &str) -> anyhow::Result<Option<Task>>;
}

/// Queue operations the ingress needs.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("supported only .dwg files")]
    UnsupportedExtension,

    #[error("task status: {0}")]
    UnusableReplay(TaskStatus),

    #[error("idempotency key reused with different payload")]
    IdempotencyReuse,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The produced PDF, ready to stream to the client.
pub struct Download {
    pub file_name: String,
    pub size: u64,
    pub content: FileReader,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("file_name", &self.file_name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

pub struct ConvertService {
    task_ttl: Duration,
    tasks: Arc<dyn TaskStore>,
    files: Arc<dyn FileStore>,
    queue: Arc<dyn TaskQueue>,
}

impl ConvertService {
    pub fn new(
        task_ttl: Duration,
        tasks: Arc<dyn TaskStore>,
        files: Arc<dyn FileStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        ConvertService {
            task_ttl,
            tasks,
            files,
            queue,
        }
    }

    /// Accept an upload and return the id of the task that will convert it.
    ///
    /// Replays by idempotency key join the existing task unless it already
    /// failed or expired; identical content joins by file hash inside the
    /// registry, in which case the redundant upload is deleted again.
    pub async fn convert(
        &self,
        data: Bytes,
        filename: &str,
        idempotency_key: Option<String>,
    ) -> Result<Uuid, ConvertError> {
        let extension = Path::new(filename)
            .extension()
            .map(|e| e.to_ascii_lowercase());
        if extension.as_deref() != Some(std::ffi::OsStr::new("dwg")) {
            return Err(ConvertError::UnsupportedExtension);
        }

        if let Some(ref key) = idempotency_key {
            let existing = self
                .tasks
                .by_idempotency_key(key)
                .await
                .map_err(|e| anyhow::anyhow!("idempotency lookup: {}", e))?;
            if let Some(task) = existing {
                return match task.status {
                    TaskStatus::Failed | TaskStatus::Expired => {
                        Err(ConvertError::UnusableReplay(task.status))
                    }
                    _ => Ok(task.id),
                };
            }
        }

        let input_filename = format!("{}.dwg", Uuid::new_v4());
        let size = data.len() as u64;
        let reader: FileReader = Box::pin(std::io::Cursor::new(data));
        let saved = self
            .files
            .save(reader, &input_filename, Some(size))
            .await
            .map_err(|e| anyhow::anyhow!("save file: {}", e))?;

        let created = self
            .tasks
            .create_task(CreateTaskParams {
                original_name: filename.to_string(),
                input_filename: input_filename.clone(),
                file_size: saved.written,
                file_hash: saved.hash,
                idempotency_key,
                ttl: self.task_ttl,
            })
            .await;
        let task_id = match created {
            Ok(id) => id,
            Err(e) => {
                // Roll back the orphaned upload before surfacing the error.
                if let Err(del_err) = self.files.delete(&input_filename).await {
                    tracing::warn!(
                        filename = %input_filename,
                        error = %del_err,
                        "failed to delete file after task creation error"
                    );
                }
                if matches!(
                    e.downcast_ref::<RegistryError>(),
                    Some(RegistryError::IdempotencyReuse(_))
                ) {
                    return Err(ConvertError::IdempotencyReuse);
                }
                return Err(anyhow::anyhow!("create task: {}", e).into());
            }
        };

        // A content-hash hit returns an older task; the upload we just made
        // is then redundant.
        if let Ok(Some(task)) = self.tasks.task(task_id).await {
            if task.input_filename != input_filename {
                if let Err(e) = self.files.delete(&input_filename).await {
                    tracing::warn!(
                        filename = %input_filename,
                        error = %e,
                        "failed to delete duplicated upload"
                    );
                }
            }
        }

        tracing::debug!(task_id = %task_id, "enqueueing task");
        if let Err(e) = self.queue.enqueue(&task_id.to_string()).await {
            tracing::error!(task_id = %task_id, error = %e, "enqueue failed");
            if let Err(update_err) = self
                .tasks
                .update_status(task_id, TaskStatus::Failed, Some(e.to_string()))
                .await
            {
                tracing::warn!(
                    task_id = %task_id,
                    error = %update_err,
                    "failed to mark task failed after enqueue error"
                );
            }
            return Err(anyhow::anyhow!("enqueue: {}", e).into());
        }

        Ok(task_id)
    }

    /// Current state of a task, or `None` when it is unknown.
    pub async fn status(&self, id: Uuid) -> anyhow::Result<Option<StatusResponse>> {
        let Some(task) = self.tasks.task(id).await? else {
            return Ok(None);
        };
        Ok(Some(StatusResponse::from_task(&task)))
    }

    /// Open the finished PDF for a task.
    pub async fn download(&self, id: Uuid) -> Result<Download, DownloadError> {
        let task = self
            .tasks
            .task(id)
            .await
            .map_err(DownloadError::Internal)?
            .ok_or(TaskError::NotFound)?;

        match task.status {
            TaskStatus::Done => {
                let file_name = task
                    .result_filename
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("empty result path"))?;
                let (content, size) = self
                    .files
                    .open(&file_name)
                    .await
                    .map_err(|e| anyhow::anyhow!("open result: {}", e))?;
                Ok(Download {
                    file_name,
                    size,
                    content,
                })
            }
            TaskStatus::Failed => Err(TaskError::Failed.into()),
            TaskStatus::Expired => Err(TaskError::Expired.into()),
            _ => Err(TaskError::NotReady.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drawbridge_storage::{SavedFile, StorageError, StorageResult};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct MockFiles {
        files: Mutex<HashMap<String, Vec<u8>>>,
        deletes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FileStore for MockFiles {
        async fn save(
            &self,
            mut reader: FileReader,
            filename: &str,
            _size: Option<u64>,
        ) -> StorageResult<SavedFile> {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;
            let hash = format!("{:x}", data.len());
            let written = data.len() as u64;
            self.files
                .lock()
                .unwrap()
                .insert(filename.to_string(), data);
            Ok(SavedFile { written, hash })
        }

        async fn open(&self, filename: &str) -> StorageResult<(FileReader, u64)> {
            let data = self
                .files
                .lock()
                .unwrap()
                .get(filename)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(filename.to_string()))?;
            let size = data.len() as u64;
            Ok((Box::pin(std::io::Cursor::new(data)), size))
        }

        async fn delete(&self, filename: &str) -> StorageResult<()> {
            self.files.lock().unwrap().remove(filename);
            self.deletes.lock().unwrap().push(filename.to_string());
            Ok(())
        }

        async fn cleanup_older_than(&self, _max_age: std::time::Duration) -> StorageResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockTasks {
        tasks: Mutex<HashMap<Uuid, Task>>,
        by_key: Mutex<HashMap<String, Uuid>>,
        /// When set, `create_task` always resolves to this id (content dedup).
        dedup_to: Option<Uuid>,
        fail_create: bool,
    }

    impl MockTasks {
        fn insert(&self, task: Task) {
            if let Some(ref key) = task.idempotency_key {
                self.by_key.lock().unwrap().insert(key.clone(), task.id);
            }
            self.tasks.lock().unwrap().insert(task.id, task);
        }
    }

    #[async_trait]
    impl TaskStore for MockTasks {
        async fn create_task(&self, p: CreateTaskParams) -> anyhow::Result<Uuid> {
            if self.fail_create {
                anyhow::bail!("registry down");
            }
            if let Some(id) = self.dedup_to {
                return Ok(id);
            }
            let now = Utc::now();
            let task = Task {
                id: Uuid::new_v4(),
                status: TaskStatus::Pending,
                original_name: p.original_name,
                input_filename: p.input_filename,
                result_filename: None,
                file_size: p.file_size,
                file_hash: p.file_hash,
                idempotency_key: p.idempotency_key,
                error: None,
                created_at: now,
                updated_at: now,
                expires_at: now + p.ttl,
            };
            let id = task.id;
            self.insert(task);
            Ok(id)
        }

        async fn task(&self, id: Uuid) -> anyhow::Result<Option<Task>> {
            Ok(self.tasks.lock().unwrap().get(&id).cloned())
        }

        async fn update_status(
            &self,
            id: Uuid,
            status: TaskStatus,
            err_reason: Option<String>,
        ) -> anyhow::Result<()> {
            if let Some(task) = self.tasks.lock().unwrap().get_mut(&id) {
                task.status = status;
                task.error = err_reason;
            }
            Ok(())
        }

        async fn by_idempotency_key(&self, key: &str) -> anyhow::Result<Option<Task>> {
            let id = self.by_key.lock().unwrap().get(key).copied();
            Ok(id.and_then(|id| self.tasks.lock().unwrap().get(&id).cloned()))
        }
    }

    #[derive(Default)]
    struct MockQueue {
        published: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl TaskQueue for MockQueue {
        async fn enqueue(&self, task_id: &str) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("stream unavailable");
            }
            self.published.lock().unwrap().push(task_id.to_string());
            Ok(())
        }
    }

    fn service(
        tasks: Arc<MockTasks>,
        files: Arc<MockFiles>,
        queue: Arc<MockQueue>,
    ) -> ConvertService {
        ConvertService::new(Duration::seconds(60), tasks, files, queue)
    }

    fn existing_task(status: TaskStatus, key: &str) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            status,
            original_name: "drawing.dwg".to_string(),
            input_filename: "old.dwg".to_string(),
            result_filename: None,
            file_size: 4,
            file_hash: "4".to_string(),
            idempotency_key: Some(key.to_string()),
            error: None,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn happy_path_saves_creates_and_enqueues() {
        let tasks = Arc::new(MockTasks::default());
        let files = Arc::new(MockFiles::default());
        let queue = Arc::new(MockQueue::default());
        let svc = service(tasks.clone(), files.clone(), queue.clone());

        let id = svc
            .convert(Bytes::from_static(b"dwg!"), "drawing.dwg", None)
            .await
            .unwrap();

        let task = tasks.task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.original_name, "drawing.dwg");
        assert!(task.input_filename.ends_with(".dwg"));
        assert!(files.files.lock().unwrap().contains_key(&task.input_filename));
        assert_eq!(queue.published.lock().unwrap().as_slice(), [id.to_string()]);
    }

    #[tokio::test]
    async fn extension_check_is_case_insensitive() {
        let svc = service(
            Arc::new(MockTasks::default()),
            Arc::new(MockFiles::default()),
            Arc::new(MockQueue::default()),
        );

        assert!(svc
            .convert(Bytes::from_static(b"x"), "UPPER.DWG", None)
            .await
            .is_ok());
        assert!(matches!(
            svc.convert(Bytes::from_static(b"x"), "notes.txt", None).await,
            Err(ConvertError::UnsupportedExtension)
        ));
        assert!(matches!(
            svc.convert(Bytes::from_static(b"x"), "no-extension", None).await,
            Err(ConvertError::UnsupportedExtension)
        ));
    }

    #[tokio::test]
    async fn idempotent_replay_joins_existing_task_without_second_publish() {
        let tasks = Arc::new(MockTasks::default());
        let existing = existing_task(TaskStatus::Pending, "K1");
        let existing_id = existing.id;
        tasks.insert(existing);

        let files = Arc::new(MockFiles::default());
        let queue = Arc::new(MockQueue::default());
        let svc = service(tasks, files.clone(), queue.clone());

        let id = svc
            .convert(
                Bytes::from_static(b"dwg!"),
                "drawing.dwg",
                Some("K1".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(id, existing_id);
        assert!(queue.published.lock().unwrap().is_empty());
        assert!(files.files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_of_failed_key_is_rejected_with_the_status() {
        let tasks = Arc::new(MockTasks::default());
        tasks.insert(existing_task(TaskStatus::Failed, "K1"));
        let svc = service(
            tasks,
            Arc::new(MockFiles::default()),
            Arc::new(MockQueue::default()),
        );

        let err = svc
            .convert(
                Bytes::from_static(b"dwg!"),
                "drawing.dwg",
                Some("K1".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConvertError::UnusableReplay(TaskStatus::Failed)
        ));
    }

    #[tokio::test]
    async fn content_dedup_deletes_the_redundant_upload() {
        let older = existing_task(TaskStatus::Pending, "other");
        let older_id = older.id;
        let tasks = Arc::new(MockTasks {
            dedup_to: Some(older_id),
            ..MockTasks::default()
        });
        tasks.insert(older);

        let files = Arc::new(MockFiles::default());
        let queue = Arc::new(MockQueue::default());
        let svc = service(tasks, files.clone(), queue.clone());

        let id = svc
            .convert(Bytes::from_static(b"dwg!"), "drawing.dwg", None)
            .await
            .unwrap();

        assert_eq!(id, older_id);
        // The fresh upload was removed again; only the older task's file
        // matters.
        assert_eq!(files.deletes.lock().unwrap().len(), 1);
        assert!(files.files.lock().unwrap().is_empty());
        assert_eq!(queue.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn registry_failure_rolls_back_the_upload() {
        let tasks = Arc::new(MockTasks {
            fail_create: true,
            ..MockTasks::default()
        });
        let files = Arc::new(MockFiles::default());
        let svc = service(tasks, files.clone(), Arc::new(MockQueue::default()));

        let err = svc
            .convert(Bytes::from_static(b"dwg!"), "drawing.dwg", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Internal(_)));
        assert!(files.files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_failure_marks_the_task_failed() {
        let tasks = Arc::new(MockTasks::default());
        let files = Arc::new(MockFiles::default());
        let queue = Arc::new(MockQueue {
            fail: true,
            ..MockQueue::default()
        });
        let svc = service(tasks.clone(), files, queue);

        let err = svc
            .convert(Bytes::from_static(b"dwg!"), "drawing.dwg", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Internal(_)));

        let failed: Vec<_> = tasks
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .cloned()
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap().contains("stream unavailable"));
    }

    #[tokio::test]
    async fn download_maps_status_to_outcome() {
        let tasks = Arc::new(MockTasks::default());
        let files = Arc::new(MockFiles::default());
        files
            .files
            .lock()
            .unwrap()
            .insert("out.pdf".to_string(), b"%PDF".to_vec());

        let mut done = existing_task(TaskStatus::Done, "done-key");
        done.result_filename = Some("out.pdf".to_string());
        let done_id = done.id;
        tasks.insert(done);

        let failed = existing_task(TaskStatus::Failed, "failed-key");
        let failed_id = failed.id;
        tasks.insert(failed);

        let pending = existing_task(TaskStatus::Pending, "pending-key");
        let pending_id = pending.id;
        tasks.insert(pending);

        let svc = service(tasks, files, Arc::new(MockQueue::default()));

        let dl = svc.download(done_id).await.unwrap();
        assert_eq!(dl.file_name, "out.pdf");
        assert_eq!(dl.size, 4);

        assert!(matches!(
            svc.download(failed_id).await.unwrap_err(),
            DownloadError::Task(TaskError::Failed)
        ));
        assert!(matches!(
            svc.download(pending_id).await.unwrap_err(),
            DownloadError::Task(TaskError::NotReady)
        ));
        assert!(matches!(
            svc.download(Uuid::new_v4()).await.unwrap_err(),
            DownloadError::Task(TaskError::NotFound)
        ));
    }
}
