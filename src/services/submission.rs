//! Job intake and the caller-facing job operations.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use garde::Validate;
use uuid::Uuid;

use crate::models::enhancement::{
    AttemptView, ClassificationOverride, JobStatusResponse, RejectionReason, SubmitJobRequest,
    SubmitJobResponse,
};
use crate::models::job::{FailureReason, JobStatus, NewJob, PipelineState};
use crate::models::reservation::{ReservationRequest, StageSettlement, UsageSummary};
use crate::services::eligibility::can_stage;
use crate::services::ledger::{LedgerError, UsageLedger};
use crate::services::pipeline::settlement_from_outputs;
use crate::services::queue::{CancellationFlags, JobDispatch, QueueError, QueuedJob};
use crate::services::store::{JobStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid request: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Invalid month key {0:?}, expected YYYY-MM")]
    InvalidMonth(String),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} is already terminal")]
    Terminal(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Result of one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Held reservations of terminal jobs that were finalized.
    pub refinalized: usize,
    /// Held reservations without a job that were released.
    pub released_orphans: usize,
    /// Jobs stuck in `processing` that were put back on the queue.
    pub requeued: usize,
}

/// Submission, status, cancellation and classification for jobs.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn UsageLedger>,
    dispatch: Arc<dyn JobDispatch>,
    cancellation: Arc<dyn CancellationFlags>,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn UsageLedger>,
        dispatch: Arc<dyn JobDispatch>,
        cancellation: Arc<dyn CancellationFlags>,
    ) -> Self {
        Self {
            store,
            ledger,
            dispatch,
            cancellation,
        }
    }

    /// Accept or reject a job. Quota is reserved before anything is queued.
    pub async fn submit(&self, request: SubmitJobRequest) -> Result<SubmitJobResponse, SubmitError> {
        request.validate()?;

        let mut stages = request.requested_stages;
        let mut staging_skipped = None;
        if stages.staging {
            let decision = can_stage(request.scene, request.room_type.as_deref());
            if let Some(denial) = decision.reason {
                let reason = RejectionReason::from(denial);
                if !request.allow_enhance_only_fallback {
                    return Ok(self.reject(request.job_id, reason));
                }
                tracing::info!(job_id = %request.job_id, reason = %reason, "Staging dropped, enhancing only");
                stages.staging = false;
                staging_skipped = Some(reason);
            }
        }

        let reservation = match self
            .ledger
            .reserve(&ReservationRequest {
                job_id: request.job_id,
                agency_id: request.agency_id.clone(),
                stages,
            })
            .await
        {
            Ok(reservation) => reservation,
            Err(LedgerError::QuotaExhausted { .. }) => {
                return Ok(self.reject(request.job_id, RejectionReason::QuotaExhausted))
            }
            Err(LedgerError::UnknownAgency(_)) => {
                return Ok(self.reject(request.job_id, RejectionReason::UnknownAgency))
            }
            Err(LedgerError::DuplicateReservation(_)) => {
                return Ok(self.reject(request.job_id, RejectionReason::DuplicateJob))
            }
            Err(e) => return Err(e.into()),
        };
        metrics::counter!("usage_reservations_total", "outcome" => "held").increment(1);

        let new_job = NewJob {
            id: request.job_id,
            user_id: request.user_id,
            agency_id: request.agency_id.clone(),
            image_id: request.image_id,
            requested: stages,
            scene: request.scene,
            room_type: request.room_type,
        };

        if let Err(e) = self.store.insert_job(new_job).await {
            self.release(request.job_id).await;
            return match e {
                StoreError::Duplicate(_) => {
                    Ok(self.reject(request.job_id, RejectionReason::DuplicateJob))
                }
                e => Err(e.into()),
            };
        }

        let queued = QueuedJob {
            job_id: request.job_id,
            agency_id: request.agency_id,
        };
        if let Err(e) = self.dispatch.enqueue(&queued).await {
            tracing::error!(job_id = %queued.job_id, error = %e, "Failed to enqueue job");
            self.store
                .finish(
                    queued.job_id,
                    JobStatus::Failed,
                    PipelineState::Failed,
                    Some(FailureReason::InternalError),
                )
                .await?;
            self.release(queued.job_id).await;
            return Err(e.into());
        }

        metrics::counter!("enhancement_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %queued.job_id,
            agency_id = %queued.agency_id,
            reserved_included = reservation.reserved_included,
            reserved_addon = reservation.reserved_addon,
            staging = stages.staging,
            "Job accepted"
        );

        Ok(SubmitJobResponse::accepted(staging_skipped))
    }

    fn reject(&self, job_id: Uuid, reason: RejectionReason) -> SubmitJobResponse {
        metrics::counter!("enhancement_jobs_rejected_total", "reason" => reason.to_string())
            .increment(1);
        tracing::info!(job_id = %job_id, reason = %reason, "Job rejected");
        SubmitJobResponse::rejected(reason)
    }

    /// Release a reservation for a job that never started.
    async fn release(&self, job_id: Uuid) {
        match self.ledger.finalize(job_id, StageSettlement::default()).await {
            Ok(outcome) => {
                metrics::counter!("usage_reservations_total", "outcome" => outcome.status.to_string())
                    .increment(1);
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to release reservation");
            }
        }
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobStatusResponse, SubmitError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(SubmitError::NotFound(job_id))?;
        let attempts = self
            .store
            .attempts(job_id)
            .await?
            .into_iter()
            .map(|a| AttemptView {
                stage: a.stage,
                attempt: a.attempt,
                outcome: a.outcome,
                score: a.validation.map(|v| v.score),
                created_at: a.created_at,
            })
            .collect();

        Ok(JobStatusResponse {
            job_id,
            status: job.status,
            state: job.pipeline_state,
            outputs: job.outputs,
            attempts,
            error: job.error,
        })
    }

    /// Flag a job for cooperative cancellation. Returns immediately.
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), SubmitError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(SubmitError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(SubmitError::Terminal(job_id));
        }
        self.cancellation.request_cancel(job_id).await?;
        tracing::info!(job_id = %job_id, "Cancellation requested");
        Ok(())
    }

    /// Correct the scene classification of a job still in flight.
    pub async fn update_classification(
        &self,
        job_id: Uuid,
        update: ClassificationOverride,
    ) -> Result<(), SubmitError> {
        update.validate()?;
        let room_type = update
            .room_type
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        if !self
            .store
            .update_classification(job_id, update.scene, room_type)
            .await?
        {
            return match self.store.get_job(job_id).await? {
                Some(_) => Err(SubmitError::Terminal(job_id)),
                None => Err(SubmitError::NotFound(job_id)),
            };
        }
        tracing::info!(
            job_id = %job_id,
            scene = %update.scene,
            room_type = ?room_type,
            staging_allowed = can_stage(Some(update.scene), room_type).allowed,
            "Classification overridden"
        );
        Ok(())
    }

    pub async fn usage_summary(
        &self,
        agency_id: &str,
        month_key: &str,
    ) -> Result<UsageSummary, SubmitError> {
        if NaiveDate::parse_from_str(&format!("{month_key}-01"), "%Y-%m-%d").is_err() {
            return Err(SubmitError::InvalidMonth(month_key.to_string()));
        }
        Ok(self.ledger.usage_summary(agency_id, month_key).await?)
    }

    /// Settle what a crashed worker left behind.
    ///
    /// Held reservations older than `stale_before` are finalized from the job's
    /// persisted outputs when the job is terminal, or released when the job was
    /// never created. `processing` jobs whose last heartbeat is older than
    /// `stale_before` go back on the queue; their reservation stays held.
    pub async fn reconcile(&self, stale_before: DateTime<Utc>) -> Result<ReconcileReport, SubmitError> {
        let mut report = ReconcileReport::default();

        for reservation in self.ledger.held_reservations(stale_before).await? {
            match self.store.get_job(reservation.job_id).await? {
                Some(job) if job.status.is_terminal() => {
                    let outcome = self
                        .ledger
                        .finalize(job.id, settlement_from_outputs(&job))
                        .await?;
                    if outcome.applied {
                        report.refinalized += 1;
                        tracing::warn!(job_id = %job.id, reservation = %outcome.status, "Finalized reservation left held");
                    }
                }
                Some(_) => {}
                None => {
                    let outcome = self
                        .ledger
                        .finalize(reservation.job_id, StageSettlement::default())
                        .await?;
                    if outcome.applied {
                        report.released_orphans += 1;
                        tracing::warn!(job_id = %reservation.job_id, "Released reservation without a job");
                    }
                }
            }
        }

        for job in self.store.reset_stale_processing(stale_before).await? {
            self.dispatch
                .enqueue(&QueuedJob {
                    job_id: job.id,
                    agency_id: job.agency_id.clone(),
                })
                .await?;
            report.requeued += 1;
            tracing::warn!(job_id = %job.id, state = %job.pipeline_state, "Re-queued stale job");
        }

        Ok(report)
    }
}
