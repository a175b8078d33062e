//! Adapters binding the concrete registry and file store to the capability
//! traits the distributor consumes.

use crate::distributor::{FileCleaner, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drawbridge_core::models::{Task, TaskStatus};
use drawbridge_registry::TaskRegistry;
use drawbridge_storage::{AsyncStore, FileStore};
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
impl TaskStore for TaskRegistry {
    async fn task(&self, id: Uuid) -> anyhow::Result<Option<Task>> {
        Ok(TaskRegistry::task(self, id).await?)
    }

    async fn try_mark_processing(&self, id: Uuid) -> anyhow::Result<bool> {
        Ok(TaskRegistry::try_mark_processing(self, id).await?)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        err_reason: Option<String>,
    ) -> anyhow::Result<()> {
        Ok(TaskRegistry::update_status(self, id, status, err_reason.as_deref()).await?)
    }

    async fn set_result(&self, id: Uuid, result_filename: &str) -> anyhow::Result<()> {
        Ok(TaskRegistry::set_result(self, id, result_filename).await?)
    }

    async fn expired_tasks(
        &self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> anyhow::Result<Vec<Uuid>> {
        Ok(TaskRegistry::expired_tasks(self, now, ttl).await?)
    }

    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> anyhow::Result<usize> {
        Ok(TaskRegistry::delete_expired(self, now, ttl).await?)
    }
}

#[async_trait]
impl FileCleaner for AsyncStore {
    async fn delete(&self, filename: &str) -> anyhow::Result<()> {
        Ok(FileStore::delete(self, filename).await?)
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> anyhow::Result<()> {
        Ok(FileStore::cleanup_older_than(self, max_age).await?)
    }
}
