//! In-memory job store for tests and local development.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::models::job::{
    EnhancementJob, FailureReason, JobStatus, NewJob, PipelineState, SceneType, StageId,
};
use crate::models::stage::StageAttempt;

#[derive(Debug)]
struct JobRecord {
    job: EnhancementJob,
    attempts: Vec<StageAttempt>,
    heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Storage("job store lock poisoned".to_string())
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.jobs.read().map_err(poison_err)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Apply `f` to a non-terminal job. Returns false if terminal or missing.
    fn mutate_live(
        &self,
        job_id: Uuid,
        f: impl FnOnce(&mut JobRecord),
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        match jobs.get_mut(&job_id) {
            Some(record) if !record.job.status.is_terminal() => {
                f(record);
                record.job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<EnhancementJob, StoreError> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        let job = job.into_job(Utc::now());
        jobs.insert(
            job.id,
            JobRecord {
                job: job.clone(),
                attempts: Vec::new(),
                heartbeat_at: None,
            },
        );
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<EnhancementJob>, StoreError> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        Ok(jobs.get(&job_id).map(|r| r.job.clone()))
    }

    async fn mark_processing(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        match jobs.get_mut(&job_id) {
            Some(record) if record.job.status == JobStatus::Queued => {
                let now = Utc::now();
                record.job.status = JobStatus::Processing;
                record.job.updated_at = now;
                record.heartbeat_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_state(&self, job_id: Uuid, state: PipelineState) -> Result<(), StoreError> {
        self.mutate_live(job_id, |r| r.job.pipeline_state = state)?;
        Ok(())
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        if let Some(record) = jobs.get_mut(&job_id) {
            if record.job.status == JobStatus::Processing {
                record.heartbeat_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn record_output(
        &self,
        job_id: Uuid,
        stage: StageId,
        output_key: &str,
    ) -> Result<(), StoreError> {
        self.mutate_live(job_id, |r| r.job.outputs.set(stage, output_key.to_string()))?;
        Ok(())
    }

    async fn append_attempt(&self, attempt: &StageAttempt) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let record = jobs
            .get_mut(&attempt.job_id)
            .ok_or(StoreError::NotFound(attempt.job_id))?;
        record.attempts.push(attempt.clone());
        Ok(())
    }

    async fn attempts(&self, job_id: Uuid) -> Result<Vec<StageAttempt>, StoreError> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        Ok(jobs
            .get(&job_id)
            .map(|r| r.attempts.clone())
            .unwrap_or_default())
    }

    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        state: PipelineState,
        error: Option<FailureReason>,
    ) -> Result<bool, StoreError> {
        self.mutate_live(job_id, |r| {
            r.job.status = status;
            r.job.pipeline_state = state;
            r.job.error = error;
        })
    }

    async fn update_classification(
        &self,
        job_id: Uuid,
        scene: SceneType,
        room_type: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.mutate_live(job_id, |r| {
            r.job.scene = Some(scene);
            r.job.room_type = room_type.map(str::to_string);
        })
    }

    async fn reset_stale_processing(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<EnhancementJob>, StoreError> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let mut reset = Vec::new();
        for record in jobs.values_mut() {
            let stale = record.job.status == JobStatus::Processing
                && record
                    .heartbeat_at
                    .is_some_and(|beat| beat < heartbeat_before);
            if stale {
                record.job.status = JobStatus::Queued;
                reset.push(record.job.clone());
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::RequestedStages;

    fn new_job() -> NewJob {
        NewJob {
            id: Uuid::new_v4(),
            user_id: "user-1".into(),
            agency_id: "agency-1".into(),
            image_id: "originals/kitchen.jpg".into(),
            requested: RequestedStages::default(),
            scene: Some(SceneType::Interior),
            room_type: Some("kitchen".into()),
        }
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_immutable() {
        let store = InMemoryJobStore::new();
        let job = store.insert_job(new_job()).await.unwrap();
        assert!(store.mark_processing(job.id).await.unwrap());
        assert!(!store.mark_processing(job.id).await.unwrap());
        assert!(store
            .finish(job.id, JobStatus::Succeeded, PipelineState::Complete, None)
            .await
            .unwrap());

        assert!(!store
            .finish(
                job.id,
                JobStatus::Failed,
                PipelineState::Failed,
                Some(FailureReason::InternalError)
            )
            .await
            .unwrap());
        assert!(!store
            .update_classification(job.id, SceneType::Exterior, None)
            .await
            .unwrap());

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.scene, Some(SceneType::Interior));
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = InMemoryJobStore::new();
        let job = new_job();
        store.insert_job(job.clone()).await.unwrap();
        assert!(matches!(
            store.insert_job(job).await.unwrap_err(),
            StoreError::Duplicate(_)
        ));
    }

    #[tokio::test]
    async fn test_stale_processing_reset() {
        let store = InMemoryJobStore::new();
        let job = store.insert_job(new_job()).await.unwrap();
        store.mark_processing(job.id).await.unwrap();

        let reset = store
            .reset_stale_processing(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reset.len(), 1);
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_job_live() {
        let store = InMemoryJobStore::new();
        let job = store.insert_job(new_job()).await.unwrap();
        store.mark_processing(job.id).await.unwrap();

        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.heartbeat(job.id).await.unwrap();

        assert!(store.reset_stale_processing(cutoff).await.unwrap().is_empty());
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
    }
}
