//! Periodic expiry sweep: mark overdue tasks expired, delete their files,
//! purge records past twice the TTL, and sweep orphaned files on both tiers.
//! Every step tolerates failure; the ticker never stops.

use crate::distributor::{FileCleaner, TaskStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct CleanupScheduler {
    tasks: Arc<dyn TaskStore>,
    files: Arc<dyn FileCleaner>,
    interval: Duration,
    task_ttl: chrono::Duration,
}

impl CleanupScheduler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        files: Arc<dyn FileCleaner>,
        interval: Duration,
        task_ttl: chrono::Duration,
    ) -> Self {
        CleanupScheduler {
            tasks,
            files,
            interval,
            task_ttl,
        }
    }

    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => self.run_once().await,
                }
            }

            tracing::info!("cleanup scheduler stopped");
        })
    }

    pub async fn run_once(&self) {
        let now = Utc::now();

        let expired = match self.tasks.expired_tasks(now, self.task_ttl).await {
            Ok(expired) => expired,
            Err(e) => {
                tracing::warn!(error = %e, "expiry scan failed");
                Vec::new()
            }
        };
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "tasks expired");
        }

        for id in expired {
            let task = match self.tasks.task(id).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(task_id = %id, error = %e, "expired task lookup failed");
                    continue;
                }
            };

            if let Err(e) = self.files.delete(&task.input_filename).await {
                tracing::warn!(task_id = %id, error = %e, "cleanup input file failed");
            }
            if let Some(ref result) = task.result_filename {
                if let Err(e) = self.files.delete(result).await {
                    tracing::warn!(task_id = %id, error = %e, "cleanup result file failed");
                }
            }
        }

        // Records and files both linger for a grace period of one extra TTL
        // before they are physically removed.
        match self.tasks.delete_expired(now, self.task_ttl * 2).await {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "purged expired tasks"),
            Err(e) => tracing::warn!(error = %e, "task purge failed"),
        }

        let max_age = self.task_ttl * 2;
        match max_age.to_std() {
            Ok(max_age) => {
                if let Err(e) = self.files.cleanup_older_than(max_age).await {
                    tracing::warn!(error = %e, "file sweep failed");
                }
            }
            Err(_) => tracing::warn!("task ttl out of range for file sweep"),
        }
    }
}
