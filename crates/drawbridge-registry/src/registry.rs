use chrono::{DateTime, TimeZone, Utc};
use drawbridge_core::models::{CreateTaskParams, Task, TaskStatus};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

const CONNECT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Lua guard for the `pending → processing` transition. Concurrent deliveries
/// of the same task race here; exactly one wins.
const MARK_PROCESSING_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') == 'pending' then
  redis.call('HSET', KEYS[1], 'status', 'processing', 'error', '', 'updated_at', ARGV[1])
  return 1
end
return 0
"#;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("idempotency key {0:?} reused with different payload")]
    IdempotencyReuse(String),

    #[error("corrupt task record: {0}")]
    Decode(String),

    #[error("redis: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("redis connect: {0}")]
    Connect(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

fn task_key(id: Uuid) -> String {
    format!("task:{}", id)
}

fn idemp_key(key: &str) -> String {
    format!("task:idemp:{}", key)
}

fn hash_key(hash: &str) -> String {
    format!("task:hash:{}", hash)
}

const TASKS_BY_CREATED_KEY: &str = "tasks:by_created";

/// Keyed task store over Redis. Every write that touches more than one key
/// goes through an atomic pipeline so the record and its indexes move
/// together; status writes are last-writer-wins except for the guarded
/// `pending → processing` transition.
#[derive(Clone)]
pub struct TaskRegistry {
    conn: ConnectionManager,
}

impl TaskRegistry {
    /// Connect and verify the server answers a PING within a bounded wait.
    pub async fn connect(addr: &str, password: &str, db: i64) -> RegistryResult<Self> {
        let url = if password.is_empty() {
            format!("redis://{}/{}", addr, db)
        } else {
            format!("redis://:{}@{}/{}", password, addr, db)
        };

        let client =
            redis::Client::open(url).map_err(|e| RegistryError::Connect(e.to_string()))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| RegistryError::Connect(e.to_string()))?;

        let ping = async {
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(pong)
        };
        tokio::time::timeout(CONNECT_PING_TIMEOUT, ping)
            .await
            .map_err(|_| RegistryError::Connect("ping timed out".to_string()))?
            .map_err(|e| RegistryError::Connect(e.to_string()))?;

        Ok(TaskRegistry { conn })
    }

    /// Create a task, or return the id of an existing one when the
    /// idempotency key or content hash already resolves to a live task.
    pub async fn create_task(&self, p: CreateTaskParams) -> RegistryResult<Uuid> {
        let mut conn = self.conn.clone();

        if let Some(ref key) = p.idempotency_key {
            let existing: Option<String> = conn.get(idemp_key(key)).await?;
            if let Some(existing_id) = existing.filter(|s| !s.is_empty()) {
                let existing_id = existing_id
                    .parse::<Uuid>()
                    .map_err(|e| RegistryError::Decode(e.to_string()))?;
                match self.task(existing_id).await? {
                    None => {
                        // Stale index entry left behind by a purge.
                        let _: () = conn.del(idemp_key(key)).await?;
                    }
                    Some(task) => {
                        if task.file_hash == p.file_hash && task.file_size == p.file_size {
                            return Ok(existing_id);
                        }
                        return Err(RegistryError::IdempotencyReuse(key.clone()));
                    }
                }
            }
        }

        if !p.file_hash.is_empty() {
            let existing: Option<String> = conn.get(hash_key(&p.file_hash)).await?;
            if let Some(existing_id) = existing.filter(|s| !s.is_empty()) {
                return existing_id
                    .parse::<Uuid>()
                    .map_err(|e| RegistryError::Decode(e.to_string()));
            }
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

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(task_key(task.id), &task_fields(&task));
        pipe.zadd(
            TASKS_BY_CREATED_KEY,
            task.id.to_string(),
            task.created_at.timestamp(),
        );
        if let Some(ref key) = task.idempotency_key {
            pipe.set(idemp_key(key), task.id.to_string());
        }
        if !task.file_hash.is_empty() {
            pipe.set(hash_key(&task.file_hash), task.id.to_string());
        }
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(task.id)
    }

    pub async fn task(&self, id: Uuid) -> RegistryResult<Option<Task>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(task_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_task(id, &fields).map(Some)
    }

    pub async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        err_reason: Option<&str>,
    ) -> RegistryResult<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();

        let mut pipe = redis::pipe();
        pipe.atomic();
        let key = task_key(id);
        pipe.hset(&key, "status", status.to_string());
        pipe.hset(&key, "error", err_reason.unwrap_or_default());
        pipe.hset(&key, "updated_at", now);
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(())
    }

    pub async fn set_result(&self, id: Uuid, result_filename: &str) -> RegistryResult<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();

        let mut pipe = redis::pipe();
        pipe.atomic();
        let key = task_key(id);
        pipe.hset(&key, "result_filename", result_filename);
        pipe.hset(&key, "error", "");
        pipe.hset(&key, "status", TaskStatus::Done.to_string());
        pipe.hset(&key, "updated_at", now);
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(())
    }

    pub async fn by_idempotency_key(&self, key: &str) -> RegistryResult<Option<Task>> {
        if key.is_empty() {
            return Ok(None);
        }
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(idemp_key(key)).await?;
        let Some(id) = id.filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let id = id
            .parse::<Uuid>()
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        self.task(id).await
    }

    /// Transition `pending → processing`, returning whether this caller won.
    pub async fn try_mark_processing(&self, id: Uuid) -> RegistryResult<bool> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let won: i64 = redis::Script::new(MARK_PROCESSING_SCRIPT)
            .key(task_key(id))
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(won == 1)
    }

    /// Mark tasks whose `expires_at` has passed and return their ids. Only
    /// tasks created before `now - ttl` can qualify, so the index scan is
    /// bounded to that range; `expires_at` stays the authority.
    pub async fn expired_tasks(
        &self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> RegistryResult<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let border = (now - ttl).timestamp();
        let ids: Vec<String> = conn
            .zrangebyscore(TASKS_BY_CREATED_KEY, "-inf", border)
            .await?;

        let mut expired = Vec::new();
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<Uuid>() else {
                continue;
            };
            let Some(task) = self.task(id).await? else {
                continue;
            };
            if now > task.expires_at && task.status != TaskStatus::Expired {
                if let Err(e) = self
                    .update_status(id, TaskStatus::Expired, Some("task expired"))
                    .await
                {
                    tracing::warn!(task_id = %id, error = %e, "failed to mark task expired");
                }
                expired.push(id);
            }
        }

        Ok(expired)
    }

    /// Physically delete records created before `now - ttl`, along with their
    /// index entries. Returns the number of deleted tasks.
    pub async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> RegistryResult<usize> {
        let mut conn = self.conn.clone();
        let border = (now - ttl).timestamp();
        let ids: Vec<String> = conn
            .zrangebyscore(TASKS_BY_CREATED_KEY, "-inf", border)
            .await?;

        let mut deleted = 0;
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<Uuid>() else {
                continue;
            };
            let Some(task) = self.task(id).await? else {
                // Dangling index entry; drop it so the scan stays bounded.
                let _: () = conn.zrem(TASKS_BY_CREATED_KEY, &raw_id).await?;
                continue;
            };

            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.del(task_key(id));
            pipe.zrem(TASKS_BY_CREATED_KEY, id.to_string());
            if let Some(ref key) = task.idempotency_key {
                pipe.del(idemp_key(key));
            }
            if !task.file_hash.is_empty() {
                pipe.del(hash_key(&task.file_hash));
            }

            match pipe.query_async::<()>(&mut conn).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(task_id = %id, error = %e, "failed to delete expired task");
                }
            }
        }

        Ok(deleted)
    }
}

fn task_fields(task: &Task) -> Vec<(&'static str, String)> {
    vec![
        ("id", task.id.to_string()),
        ("status", task.status.to_string()),
        ("original_name", task.original_name.clone()),
        ("input_filename", task.input_filename.clone()),
        (
            "result_filename",
            task.result_filename.clone().unwrap_or_default(),
        ),
        ("file_size", task.file_size.to_string()),
        ("file_hash", task.file_hash.clone()),
        (
            "idempotency_key",
            task.idempotency_key.clone().unwrap_or_default(),
        ),
        ("error", task.error.clone().unwrap_or_default()),
        (
            "created_at",
            task.created_at
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_string(),
        ),
        (
            "updated_at",
            task.updated_at
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_string(),
        ),
        (
            "expires_at",
            task.expires_at
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_string(),
        ),
    ]
}

fn parse_task(id: Uuid, fields: &HashMap<String, String>) -> RegistryResult<Task> {
    let status = fields
        .get("status")
        .ok_or_else(|| RegistryError::Decode(format!("task {} has no status", id)))?
        .parse()
        .map_err(|e| RegistryError::Decode(format!("task {}: {}", id, e)))?;

    let text = |name: &str| fields.get(name).cloned().unwrap_or_default();
    let optional = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();
    let nanos = |name: &str| {
        fields
            .get(name)
            .and_then(|v| v.parse::<i64>().ok())
            .map(|n| Utc.timestamp_nanos(n))
            .unwrap_or_default()
    };

    Ok(Task {
        id,
        status,
        original_name: text("original_name"),
        input_filename: text("input_filename"),
        result_filename: optional("result_filename"),
        file_size: fields
            .get("file_size")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
        file_hash: text("file_hash"),
        idempotency_key: optional("idempotency_key"),
        error: optional("error"),
        created_at: nanos("created_at"),
        updated_at: nanos("updated_at"),
        expires_at: nanos("expires_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        let id = Uuid::nil();
        assert_eq!(
            task_key(id),
            "task:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(idemp_key("k1"), "task:idemp:k1");
        assert_eq!(hash_key("abcd"), "task:hash:abcd");
        assert_eq!(TASKS_BY_CREATED_KEY, "tasks:by_created");
    }

    #[test]
    fn field_map_round_trips() {
        let now = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let task = Task {
            id: Uuid::new_v4(),
            status: TaskStatus::Processing,
            original_name: "drawing.dwg".to_string(),
            input_filename: "abc.dwg".to_string(),
            result_filename: Some("out.pdf".to_string()),
            file_size: 1024,
            file_hash: "cafe".to_string(),
            idempotency_key: Some("k1".to_string()),
            error: None,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::seconds(10),
        };

        let fields: HashMap<String, String> = task_fields(&task)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let decoded = parse_task(task.id, &fields).unwrap();

        assert_eq!(decoded.status, TaskStatus::Processing);
        assert_eq!(decoded.original_name, task.original_name);
        assert_eq!(decoded.result_filename, task.result_filename);
        assert_eq!(decoded.idempotency_key, task.idempotency_key);
        assert_eq!(decoded.error, None);
        assert_eq!(decoded.created_at, task.created_at);
        assert_eq!(decoded.expires_at, task.expires_at);
        assert_eq!(decoded.file_size, 1024);
    }

    #[test]
    fn empty_strings_decode_as_none() {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            original_name: "a.dwg".to_string(),
            input_filename: "b.dwg".to_string(),
            result_filename: None,
            file_size: 1,
            file_hash: "00".to_string(),
            idempotency_key: None,
            error: None,
            created_at: now,
            updated_at: now,
            expires_at: now,
        };

        let fields: HashMap<String, String> = task_fields(&task)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(fields.get("result_filename").map(String::as_str), Some(""));

        let decoded = parse_task(task.id, &fields).unwrap();
        assert_eq!(decoded.result_filename, None);
        assert_eq!(decoded.idempotency_key, None);
        assert_eq!(decoded.error, None);
    }

    #[test]
    fn missing_status_is_a_decode_error() {
        let err = parse_task(Uuid::new_v4(), &HashMap::new()).unwrap_err();
        assert!(matches!(err, RegistryError::Decode(_)));
    }
}
