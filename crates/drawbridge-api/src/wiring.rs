//! Adapters binding the concrete registry and queue to the capability
//! traits the use-case consumes.

use crate::service::{TaskQueue, TaskStore};
use async_trait::async_trait;
use drawbridge_core::models::{CreateTaskParams, Task, TaskStatus};
use drawbridge_queue::Publisher;
use drawbridge_registry::TaskRegistry;
use uuid::Uuid;

#[async_trait]
impl TaskStore for TaskRegistry {
    async fn create_task(&self, p: CreateTaskParams) -> anyhow::Result<Uuid> {
        Ok(TaskRegistry::create_task(self, p).await?)
    }

    async fn task(&self, id: Uuid) -> anyhow::Result<Option<Task>> {
        Ok(TaskRegistry::task(self, id).await?)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        err_reason: Option<String>,
    ) -> anyhow::Result<()> {
        Ok(TaskRegistry::update_status(self, id, status, err_reason.as_deref()).await?)
    }

    async fn by_idempotency_key(&self, key: &str) -> anyhow::Result<Option<Task>> {
        Ok(TaskRegistry::by_idempotency_key(self, key).await?)
    }
}

#[async_trait]
impl TaskQueue for Publisher {
    async fn enqueue(&self, task_id: &str) -> anyhow::Result<()> {
        Ok(Publisher::enqueue(self, task_id).await?)
    }
}
