use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
    Expired,
}

impl TaskStatus {
    /// `done`, `failed`, and `expired` are terminal; no writer may move a
    /// task out of them except the purge pass, which deletes the record.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Expired
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Expired => write!(f, "expired"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "expired" => Ok(TaskStatus::Expired),
            _ => Err(anyhow::anyhow!("invalid task status: {}", s)),
        }
    }
}

/// One conversion request, keyed by a server-minted uuid and persisted in the
/// registry for its TTL (plus a grace period before the purge pass removes
/// the record entirely).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub status: TaskStatus,

    /// Filename as uploaded by the client.
    pub original_name: String,
    /// Server-assigned `<uuid>.dwg` under which the upload is stored.
    pub input_filename: String,
    /// Set by the distributor when conversion succeeds.
    pub result_filename: Option<String>,

    pub file_size: u64,
    /// Hex SHA-256 of the uploaded bytes.
    pub file_hash: String,
    pub idempotency_key: Option<String>,
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Task {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Parameters for `create_task`. The registry resolves idempotency-key and
/// content-hash collisions before minting a new id.
#[derive(Debug, Clone)]
pub struct CreateTaskParams {
    pub original_name: String,
    pub input_filename: String,
    pub file_size: u64,
    pub file_hash: String,
    pub idempotency_key: Option<String>,
    pub ttl: Duration,
}

/// Body of the 202 response from `POST /convert`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConvertAccepted {
    pub id: Uuid,
}

/// Body of `GET /result/{id}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub id: Uuid,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResponse {
    /// Download URL and result filename are exposed only once the task is
    /// done; the error reason only once it is failed or expired.
    pub fn from_task(task: &Task) -> Self {
        let mut resp = StatusResponse {
            id: task.id,
            status: task.status,
            download_url: None,
            file_name: None,
            error: None,
        };
        match task.status {
            TaskStatus::Done => {
                resp.download_url = Some(format!("/download/{}", task.id));
                resp.file_name = task.result_filename.clone();
            }
            TaskStatus::Failed | TaskStatus::Expired => {
                resp.error = task.error.clone();
            }
            _ => {}
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            status,
            original_name: "drawing.dwg".to_string(),
            input_filename: "abc.dwg".to_string(),
            result_filename: None,
            file_size: 1024,
            file_hash: "deadbeef".to_string(),
            idempotency_key: None,
            error: None,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::seconds(10),
        }
    }

    #[test]
    fn status_display_round_trips() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Expired,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Expired.is_terminal());
    }

    #[test]
    fn status_response_hides_fields_until_relevant() {
        let pending = StatusResponse::from_task(&sample_task(TaskStatus::Pending));
        assert!(pending.download_url.is_none());
        assert!(pending.file_name.is_none());
        assert!(pending.error.is_none());

        let mut done_task = sample_task(TaskStatus::Done);
        done_task.result_filename = Some("out.pdf".to_string());
        let done = StatusResponse::from_task(&done_task);
        assert_eq!(done.download_url, Some(format!("/download/{}", done_task.id)));
        assert_eq!(done.file_name.as_deref(), Some("out.pdf"));

        let mut failed_task = sample_task(TaskStatus::Failed);
        failed_task.error = Some("rpc error".to_string());
        let failed = StatusResponse::from_task(&failed_task);
        assert_eq!(failed.error.as_deref(), Some("rpc error"));
        assert!(failed.download_url.is_none());
    }

    #[test]
    fn expiry_check_uses_expires_at() {
        let task = sample_task(TaskStatus::Pending);
        assert!(!task.is_expired_at(task.created_at));
        assert!(task.is_expired_at(task.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Processing).unwrap(),
            "\"processing\""
        );
    }
}
