//! Persistence of jobs and their stage attempt history.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::job::{
    EnhancementJob, FailureReason, JobStatus, NewJob, PipelineState, SceneType, StageId,
};
use crate::models::stage::StageAttempt;

pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job {0} already exists")]
    Duplicate(Uuid),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job storage error: {0}")]
    Storage(String),
}

/// Job and attempt persistence. Terminal jobs are never mutated.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: NewJob) -> Result<EnhancementJob, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<EnhancementJob>, StoreError>;

    /// Claim a `queued` job. Returns false if it is running, terminal or missing.
    async fn mark_processing(&self, job_id: Uuid) -> Result<bool, StoreError>;

    async fn set_state(&self, job_id: Uuid, state: PipelineState) -> Result<(), StoreError>;

    /// Mark a `processing` job as still alive.
    async fn heartbeat(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn record_output(
        &self,
        job_id: Uuid,
        stage: StageId,
        output_key: &str,
    ) -> Result<(), StoreError>;

    async fn append_attempt(&self, attempt: &StageAttempt) -> Result<(), StoreError>;

    async fn attempts(&self, job_id: Uuid) -> Result<Vec<StageAttempt>, StoreError>;

    /// Returns false if the job was already terminal.
    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        state: PipelineState,
        error: Option<FailureReason>,
    ) -> Result<bool, StoreError>;

    /// Returns false if the job is terminal or missing.
    async fn update_classification(
        &self,
        job_id: Uuid,
        scene: SceneType,
        room_type: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Put `processing` jobs with no heartbeat since `heartbeat_before` back to `queued`.
    async fn reset_stale_processing(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<EnhancementJob>, StoreError>;
}
