//! C9 — async job queue: `POST /async` enqueues work, a background worker
//! runs the same C3→C4→C7 pipeline synchronously, `GET /async/{id}` reads
//! status.
//!
//! Grounded in the teacher's `logging/logger.rs` (a channel feeding a
//! background task) for the producer/consumer shape, and in
//! `telemetry::spans::SharedSpanStore` for the Redis key-per-record +
//! TTL idiom — generalized here to a durable FIFO queue (`LPUSH`/`BRPOP`)
//! plus one hash per job, since job records must outlive process restarts
//! (§4.9) the way the span registry's Redis backend already does.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::corpus::RetrievalRequest;
use crate::orchestrator::Orchestrator;
use crate::rerank::Citation;

pub const JOB_TTL: Duration = Duration::from_secs(60 * 60);
const QUEUE_KEY: &str = "corpus_qa:async_jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub query: String,
    pub response_text: Option<String>,
    pub citations: Option<Vec<Citation>>,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("async queue unavailable: {0}")]
    Unavailable(String),
    #[error("job not found")]
    NotFound,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, query: String, user_id: Option<String>) -> Result<Uuid, JobError>;
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, JobError>;
    async fn set_processing(&self, id: Uuid) -> Result<(), JobError>;
    async fn set_completed(&self, id: Uuid, response_text: String, citations: Vec<Citation>) -> Result<(), JobError>;
    async fn set_failed(&self, id: Uuid, message: String) -> Result<(), JobError>;
    /// Blocks up to `timeout` for the next queued id, or returns `None` on
    /// timeout with nothing dequeued.
    async fn dequeue_blocking(&self, timeout: Duration) -> Result<Option<Uuid>, JobError>;
}

/// Redis-backed implementation: one hash per job (`job:{id}`) with a 1 hour
/// TTL refreshed on every write, and a single FIFO list (`LPUSH` /
/// `BRPOP`) holding queued ids. A dedicated connection drives the blocking
/// pop so it never contends with the shared connection manager other
/// stores on this process use (`SharedSpanStore` included).
pub struct RedisJobQueue {
    manager: redis::aio::ConnectionManager,
    client: redis::Client,
}

impl RedisJobQueue {
    pub async fn connect(url: &str) -> anyhow::Result<Arc<Self>> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Arc::new(Self { manager, client }))
    }

    fn job_key(id: Uuid) -> String {
        format!("job:{id}")
    }
}

#[async_trait]
impl JobStore for RedisJobQueue {
    async fn enqueue(&self, query: String, user_id: Option<String>) -> Result<Uuid, JobError> {
        let id = Uuid::new_v4();
        let key = Self::job_key(id);
        let ttl = JOB_TTL.as_secs() as i64;
        let mut conn = self.manager.clone();

        let mut fields: Vec<(&str, String)> = vec![
            ("status", JobStatus::Queued.as_str().to_string()),
            ("created_at", Utc::now().to_rfc3339()),
            ("query", query),
        ];
        if let Some(uid) = &user_id {
            fields.push(("user_id", uid.clone()));
        }

        conn.hset_multiple::<_, _, _, ()>(&key, &fields)
            .await
            .map_err(|e| JobError::Unavailable(e.to_string()))?;
        conn.expire::<_, ()>(&key, ttl)
            .await
            .map_err(|e| JobError::Unavailable(e.to_string()))?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, id.to_string())
            .await
            .map_err(|e| JobError::Unavailable(e.to_string()))?;

        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, JobError> {
        let key = Self::job_key(id);
        let mut conn = self.manager.clone();
        let fields: std::collections::HashMap<String, String> = conn
            .hgetall(&key)
            .await
            .map_err(|e| JobError::Unavailable(e.to_string()))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let status = fields
            .get("status")
            .and_then(|s| JobStatus::parse(s))
            .unwrap_or(JobStatus::Queued);
        let created_at = fields
            .get("created_at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let citations = fields
            .get("citations")
            .and_then(|s| serde_json::from_str(s).ok());

        Ok(Some(JobRecord {
            id,
            status,
            created_at,
            user_id: fields.get("user_id").cloned(),
            query: fields.get("query").cloned().unwrap_or_default(),
            response_text: fields.get("response_text").cloned(),
            citations,
            error: fields.get("error").cloned(),
        }))
    }

    async fn set_processing(&self, id: Uuid) -> Result<(), JobError> {
        let mut conn = self.manager.clone();
        conn.hset::<_, _, _, ()>(Self::job_key(id), "status", JobStatus::Processing.as_str())
            .await
            .map_err(|e| JobError::Unavailable(e.to_string()))
    }

    async fn set_completed(&self, id: Uuid, response_text: String, citations: Vec<Citation>) -> Result<(), JobError> {
        let key = Self::job_key(id);
        let mut conn = self.manager.clone();
        let citations_json = serde_json::to_string(&citations).unwrap_or_default();
        let fields = [
            ("status", JobStatus::Completed.as_str().to_string()),
            ("response_text", response_text),
            ("citations", citations_json),
        ];
        conn.hset_multiple::<_, _, _, ()>(&key, &fields)
            .await
            .map_err(|e| JobError::Unavailable(e.to_string()))?;
        conn.expire::<_, ()>(&key, JOB_TTL.as_secs() as i64)
            .await
            .map_err(|e| JobError::Unavailable(e.to_string()))
    }

    async fn set_failed(&self, id: Uuid, message: String) -> Result<(), JobError> {
        let key = Self::job_key(id);
        let mut conn = self.manager.clone();
        let fields = [
            ("status", JobStatus::Failed.as_str().to_string()),
            ("error", message),
        ];
        conn.hset_multiple::<_, _, _, ()>(&key, &fields)
            .await
            .map_err(|e| JobError::Unavailable(e.to_string()))?;
        conn.expire::<_, ()>(&key, JOB_TTL.as_secs() as i64)
            .await
            .map_err(|e| JobError::Unavailable(e.to_string()))
    }

    async fn dequeue_blocking(&self, timeout: Duration) -> Result<Option<Uuid>, JobError> {
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| JobError::Unavailable(e.to_string()))?;
        let popped: Option<(String, String)> = conn
            .brpop(QUEUE_KEY, timeout.as_secs_f64())
            .await
            .map_err(|e| JobError::Unavailable(e.to_string()))?;
        match popped {
            Some((_key, id_str)) => Uuid::parse_str(&id_str)
                .map(Some)
                .map_err(|e| JobError::Unavailable(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Runs forever, block-popping one job at a time and driving it through
/// the orchestrator's synchronous path. Intended to be spawned once per
/// worker process; multiple workers safely share one `RedisJobQueue`
/// since `BRPOP` only ever delivers an id to one caller.
pub async fn run_worker(store: Arc<dyn JobStore>, orchestrator: Arc<Orchestrator>, default_k: usize) {
    loop {
        let id = match store.dequeue_blocking(Duration::from_secs(1)).await {
            Ok(Some(id)) => id,
            Ok(None) => continue,
            Err(err) => {
                tracing::error!(?err, "async job dequeue failed, backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if let Err(err) = store.set_processing(id).await {
            tracing::warn!(?err, %id, "failed to mark job processing");
        }

        let record = match store.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(%id, "dequeued job has no record, dropping");
                continue;
            }
            Err(err) => {
                tracing::error!(?err, %id, "failed to load dequeued job record");
                continue;
            }
        };

        let request = RetrievalRequest {
            query: record.query,
            k: default_k,
            corpus_filter: None,
            direction_filter: None,
            time_period_filter: None,
            session_id: id.to_string(),
            qa_id: id.to_string(),
        };

        match orchestrator.clone().answer_sync(request, Vec::new()).await {
            Ok(answer) => {
                if let Err(err) = store.set_completed(id, answer.response_text, answer.citations).await {
                    tracing::error!(?err, %id, "failed to persist completed job result");
                }
            }
            Err(err) => {
                if let Err(store_err) = store.set_failed(id, err.client_message()).await {
                    tracing::error!(?store_err, %id, "failed to persist failed job status");
                }
            }
        }
    }
}

/// In-process stand-in for `RedisJobQueue`, used in `development` when
/// `REDIS_URL` is not configured (§4.1's validation only requires Redis
/// outside `development`) and to exercise `run_worker`'s control flow in
/// tests. Job records do not survive a process restart in this backend —
/// acceptable in development, where §4.9's durability requirement does
/// not bind.
pub struct InMemoryJobStore {
    records: dashmap::DashMap<Uuid, JobRecord>,
    queue: flume::Sender<Uuid>,
    dequeue: parking_lot::Mutex<flume::Receiver<Uuid>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            records: dashmap::DashMap::new(),
            queue: tx,
            dequeue: parking_lot::Mutex::new(rx),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, query: String, user_id: Option<String>) -> Result<Uuid, JobError> {
        let id = Uuid::new_v4();
        self.records.insert(
            id,
            JobRecord {
                id,
                status: JobStatus::Queued,
                created_at: Utc::now(),
                user_id,
                query,
                response_text: None,
                citations: None,
                error: None,
            },
        );
        let _ = self.queue.send(id);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, JobError> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn set_processing(&self, id: Uuid) -> Result<(), JobError> {
        if let Some(mut r) = self.records.get_mut(&id) {
            r.status = JobStatus::Processing;
        }
        Ok(())
    }

    async fn set_completed(&self, id: Uuid, response_text: String, citations: Vec<Citation>) -> Result<(), JobError> {
        if let Some(mut r) = self.records.get_mut(&id) {
            r.status = JobStatus::Completed;
            r.response_text = Some(response_text);
            r.citations = Some(citations);
        }
        Ok(())
    }

    async fn set_failed(&self, id: Uuid, message: String) -> Result<(), JobError> {
        if let Some(mut r) = self.records.get_mut(&id) {
            r.status = JobStatus::Failed;
            r.error = Some(message);
        }
        Ok(())
    }

    async fn dequeue_blocking(&self, timeout: Duration) -> Result<Option<Uuid>, JobError> {
        let rx = self.dequeue.lock().clone();
        match tokio::time::timeout(timeout, rx.recv_async()).await {
            Ok(Ok(id)) => Ok(Some(id)),
            Ok(Err(_)) => Ok(None),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_status_round_trips_through_enqueue_and_completion() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue("what did Darwin write?".to_string(), None).await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);

        store.set_processing(id).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Processing);

        store.set_completed(id, "the answer".to_string(), vec![]).await.unwrap();
        let completed = store.get(id).await.unwrap().unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.response_text.as_deref(), Some("the answer"));
    }

    #[tokio::test]
    async fn dequeue_blocking_times_out_when_queue_is_empty() {
        let store = InMemoryJobStore::new();
        let result = store.dequeue_blocking(Duration::from_millis(20)).await.unwrap();
        assert!(result.is_none());
    }
}
