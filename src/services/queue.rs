use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const QUEUE_KEY: &str = "enhance:jobs";
const PROCESSING_KEY: &str = "enhance:processing";
const CANCEL_PREFIX: &str = "enhance:cancel:";

/// Cancellation flags outlive any reasonable job run and then expire.
pub const CANCEL_FLAG_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Job payload serialized into Redis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub agency_id: String,
}

/// Durable hand-off of accepted jobs to workers.
#[async_trait]
pub trait JobDispatch: Send + Sync {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Take the next job, moving it to the in-flight list.
    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError>;

    /// Drop a job from the in-flight list once it is terminal.
    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<u64, QueueError>;
}

/// Per-job cooperative cancellation flags.
#[async_trait]
pub trait CancellationFlags: Send + Sync {
    async fn request_cancel(&self, job_id: Uuid) -> Result<(), QueueError>;

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, QueueError>;

    async fn clear(&self, job_id: Uuid) -> Result<(), QueueError>;
}

fn cancel_key(job_id: Uuid) -> String {
    format!("{CANCEL_PREFIX}{job_id}")
}

/// Redis-backed job queue.
#[derive(Clone)]
pub struct JobQueue {
    client: redis::Client,
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Cancellation flags sharing this queue's Redis client.
    pub fn cancellation_flags(&self) -> RedisCancellationFlags {
        RedisCancellationFlags {
            client: self.client.clone(),
            ttl: CANCEL_FLAG_TTL,
        }
    }
}

#[async_trait]
impl JobDispatch for JobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.connection().await?;
        let result: Option<String> = conn.rpoplpush(QUEUE_KEY, PROCESSING_KEY).await?;

        match result {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job)?;
        // A re-queued job may have left an earlier copy behind.
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 0, &payload).await?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        Ok(conn.llen(QUEUE_KEY).await?)
    }
}

/// Cancellation flags as expiring Redis keys.
#[derive(Clone)]
pub struct RedisCancellationFlags {
    client: redis::Client,
    ttl: Duration,
}

#[async_trait]
impl CancellationFlags for RedisCancellationFlags {
    async fn request_cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set_ex::<_, _, ()>(cancel_key(job_id), 1, self.ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.exists(cancel_key(job_id)).await?)
    }

    async fn clear(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(cancel_key(job_id)).await?;
        Ok(())
    }
}

fn poison_err<T>(_: PoisonError<T>) -> QueueError {
    QueueError::Poisoned
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedJob>,
    in_flight: Vec<QueuedJob>,
}

/// Process-local queue for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().map_err(poison_err)?.in_flight.len())
    }
}

#[async_trait]
impl JobDispatch for InMemoryJobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        self.state
            .lock()
            .map_err(poison_err)?
            .pending
            .push_back(job.clone());
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let job = state.pending.pop_front();
        if let Some(job) = &job {
            state.in_flight.push(job.clone());
        }
        Ok(job)
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.in_flight.retain(|j| j != job);
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().map_err(poison_err)?.pending.len() as u64)
    }
}

/// Process-local cancellation flags with the same expiry semantics as Redis.
#[derive(Debug)]
pub struct InMemoryCancellationFlags {
    flags: Mutex<HashMap<Uuid, Instant>>,
    ttl: Duration,
}

impl Default for InMemoryCancellationFlags {
    fn default() -> Self {
        Self {
            flags: Mutex::new(HashMap::new()),
            ttl: CANCEL_FLAG_TTL,
        }
    }
}

impl InMemoryCancellationFlags {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CancellationFlags for InMemoryCancellationFlags {
    async fn request_cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.flags
            .lock()
            .map_err(poison_err)?
            .insert(job_id, Instant::now() + self.ttl);
        Ok(())
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let flags = self.flags.lock().map_err(poison_err)?;
        Ok(flags
            .get(&job_id)
            .is_some_and(|expires| *expires > Instant::now()))
    }

    async fn clear(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.flags.lock().map_err(poison_err)?.remove(&job_id);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue lock poisoned")]
    Poisoned,
}
