use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::db::queries;
use crate::models::job::{
    EnhancementJob, FailureReason, JobStatus, NewJob, PipelineState, SceneType, StageId,
};
use crate::models::stage::StageAttempt;

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<EnhancementJob, StoreError> {
        queries::create_job(&self.pool, &job)
            .await?
            .ok_or(StoreError::Duplicate(job.id))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<EnhancementJob>, StoreError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn mark_processing(&self, job_id: Uuid) -> Result<bool, StoreError> {
        Ok(queries::mark_processing(&self.pool, job_id).await?)
    }

    async fn set_state(&self, job_id: Uuid, state: PipelineState) -> Result<(), StoreError> {
        Ok(queries::update_pipeline_state(&self.pool, job_id, state).await?)
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<(), StoreError> {
        Ok(queries::touch_heartbeat(&self.pool, job_id).await?)
    }

    async fn record_output(
        &self,
        job_id: Uuid,
        stage: StageId,
        output_key: &str,
    ) -> Result<(), StoreError> {
        Ok(queries::record_stage_output(&self.pool, job_id, stage, output_key).await?)
    }

    async fn append_attempt(&self, attempt: &StageAttempt) -> Result<(), StoreError> {
        Ok(queries::insert_stage_attempt(&self.pool, attempt).await?)
    }

    async fn attempts(&self, job_id: Uuid) -> Result<Vec<StageAttempt>, StoreError> {
        Ok(queries::list_stage_attempts(&self.pool, job_id).await?)
    }

    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        state: PipelineState,
        error: Option<FailureReason>,
    ) -> Result<bool, StoreError> {
        Ok(queries::finish_job(&self.pool, job_id, status, state, error).await?)
    }

    async fn update_classification(
        &self,
        job_id: Uuid,
        scene: SceneType,
        room_type: Option<&str>,
    ) -> Result<bool, StoreError> {
        Ok(queries::update_classification(&self.pool, job_id, scene, room_type).await?)
    }

    async fn reset_stale_processing(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<EnhancementJob>, StoreError> {
        Ok(queries::reset_stale_processing(&self.pool, heartbeat_before).await?)
    }
}
