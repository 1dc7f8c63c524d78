//! Pipeline orchestrator.
//!
//! Drives one job through Stage 1A, the optional 1B declutter pass and the
//! optional, guarded Stage 2. Every attempt is validated and recorded; each
//! billing stage's outcome is settled once, and the job's reservation is
//! finalized on every exit path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::models::job::{
    EnhancementJob, FailureReason, JobStatus, PipelineState, StageId, StageOutputs,
};
use crate::models::reservation::{BillingStage, StageSettlement};
use crate::models::stage::{AttemptOutcome, StageAttempt};
use crate::models::validation::ValidationSummary;
use crate::services::eligibility::can_stage;
use crate::services::ledger::{FinalizeOutcome, LedgerError, UsageLedger};
use crate::services::provider::{EnhancementProvider, ProviderError, StageRequest};
use crate::services::queue::{CancellationFlags, QueueError};
use crate::services::retry::{GenerationParams, RetryController, RetryDecision, StageFailure};
use crate::services::storage::{candidate_key, content_type_of, ImageStore, StorageError};
use crate::services::store::{JobStore, StoreError};
use crate::services::structural::{self, ValidationConfig, ValidatorError};

/// Upper bound on a single retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Tunables for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Structural attempts per stage before the stage fails.
    pub max_retry_attempts: u32,
    /// Provider calls per attempt before a provider error fails the stage.
    pub provider_max_attempts: u32,
    pub retry_backoff: Duration,
    pub provider_timeout: Duration,
    pub validation: ValidationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            provider_max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            provider_timeout: Duration::from_secs(120),
            validation: ValidationConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Longest time a live job can go without a heartbeat: one provider call
    /// and the backoff after it.
    pub fn max_heartbeat_gap(&self) -> Duration {
        self.provider_timeout + MAX_BACKOFF
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Job {0} is already being processed")]
    AlreadyRunning(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Validation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Terminal result of running a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub state: PipelineState,
    pub error: Option<FailureReason>,
    pub settlement: StageSettlement,
    pub finalize: FinalizeOutcome,
    /// Stage failures recorded during this run, oldest first.
    pub failures: Vec<StageFailure>,
}

/// Billing outcome implied by a job's persisted accepted outputs.
///
/// Matches what a completed run settles, so recovery can re-finalize a job
/// whose worker died after the job became terminal.
pub fn settlement_from_outputs(job: &EnhancementJob) -> StageSettlement {
    let mut settlement = StageSettlement::default();
    settlement.record(BillingStage::Stage1, job.outputs.stage_1a.is_some());
    if job.requested.staging {
        settlement.record(BillingStage::Stage2, job.outputs.stage_2.is_some());
    }
    settlement
}

/// Map how a run ended to the job's terminal status, state and visible reason.
pub fn resolve_terminal(
    outputs: &StageOutputs,
    failed_final: bool,
    cancelled: bool,
    reason: Option<FailureReason>,
) -> (JobStatus, PipelineState, Option<FailureReason>) {
    let accepted = outputs.any_accepted();
    if cancelled && !accepted {
        return (JobStatus::Cancelled, PipelineState::Failed, reason);
    }
    if cancelled || failed_final {
        return if accepted {
            (
                JobStatus::PartiallySucceeded,
                PipelineState::PartiallySucceeded,
                reason,
            )
        } else {
            (JobStatus::Failed, PipelineState::Failed, reason)
        };
    }
    (JobStatus::Succeeded, PipelineState::Complete, None)
}

enum StageResult {
    Accepted { output: Vec<u8> },
    Failed,
    Cancelled,
}

/// Task-private state of one job run.
struct JobRun {
    retry: RetryController,
    settlement: StageSettlement,
    outputs: StageOutputs,
    next_attempt: [i32; 3],
    cancelled: bool,
}

impl JobRun {
    /// Attempt numbers continue after any history left by an earlier run.
    fn new(max_retry_attempts: u32, outputs: StageOutputs, history: &[StageAttempt]) -> Self {
        let mut next_attempt = [0; 3];
        for attempt in history {
            let slot = &mut next_attempt[attempt.stage.index()];
            *slot = (*slot).max(attempt.attempt + 1);
        }
        Self {
            retry: RetryController::new(max_retry_attempts),
            settlement: StageSettlement::default(),
            outputs,
            next_attempt,
            cancelled: false,
        }
    }

    fn take_attempt_number(&mut self, stage: StageId) -> i32 {
        let slot = &mut self.next_attempt[stage.index()];
        let n = *slot;
        *slot += 1;
        n
    }

    fn settle(&mut self, stage: BillingStage, accepted: bool) {
        if !self.settlement.record(stage, accepted) {
            tracing::warn!(?stage, "Billing stage already settled, ignoring");
        }
    }

    /// Refund every billing stage the run never reached.
    fn settle_remaining(&mut self, staging_requested: bool) {
        let stage1_accepted = self.outputs.stage_1a.is_some();
        self.settlement.record(BillingStage::Stage1, stage1_accepted);
        if staging_requested {
            self.settlement.record(BillingStage::Stage2, false);
        }
    }
}

/// The staged enhancement orchestrator.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn UsageLedger>,
    images: Arc<dyn ImageStore>,
    provider: Arc<dyn EnhancementProvider>,
    cancellation: Arc<dyn CancellationFlags>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn UsageLedger>,
        images: Arc<dyn ImageStore>,
        provider: Arc<dyn EnhancementProvider>,
        cancellation: Arc<dyn CancellationFlags>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            images,
            provider,
            cancellation,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run a queued job to a terminal state and finalize its reservation.
    ///
    /// A job that is already terminal is only re-finalized, which is a no-op
    /// when its reservation has been settled before.
    pub async fn run(&self, job_id: Uuid) -> Result<JobOutcome, OrchestratorError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            tracing::info!(job_id = %job_id, status = %job.status, "Job already terminal, re-finalizing");
            return self.refinalize(job_id).await;
        }
        if !self.store.mark_processing(job_id).await? {
            return match self.store.get_job(job_id).await? {
                Some(current) if current.status.is_terminal() => self.refinalize(job_id).await,
                _ => Err(OrchestratorError::AlreadyRunning(job_id)),
            };
        }

        tracing::info!(
            job_id = %job.id,
            agency_id = %job.agency_id,
            declutter = job.requested.declutter,
            staging = job.requested.staging,
            "Starting enhancement pipeline"
        );

        let started = Instant::now();
        let history = self.store.attempts(job.id).await?;
        let mut run = JobRun::new(self.config.max_retry_attempts, job.outputs.clone(), &history);
        let executed = self.execute(&job, &mut run).await;

        let (status, state, error) = match &executed {
            Ok(()) => resolve_terminal(
                &run.outputs,
                run.retry.failed_final(),
                run.cancelled,
                run.retry.highest_priority_reason(),
            ),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Pipeline aborted");
                let (status, state, _) = resolve_terminal(&run.outputs, true, false, None);
                (status, state, Some(FailureReason::InternalError))
            }
        };

        run.settle_remaining(job.requested.staging);

        // Completion hook: the job is marked terminal first so that a crash
        // before finalize is recovered from the persisted outputs.
        let finished = self.store.finish(job.id, status, state, error).await;
        let finalize = self.ledger.finalize(job.id, run.settlement).await;
        if let Err(e) = self.cancellation.clear(job.id).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to clear cancellation flag");
        }

        finished?;
        let finalize = finalize?;

        metrics::counter!("enhancement_jobs_finished_total", "status" => status.to_string())
            .increment(1);
        metrics::counter!("usage_reservations_total", "outcome" => finalize.status.to_string())
            .increment(1);

        for failure in run.retry.failures() {
            tracing::warn!(
                job_id = %job.id,
                stage = %failure.stage,
                reason = %failure.reason,
                detail = %failure.detail,
                "Stage failure"
            );
        }

        tracing::info!(
            job_id = %job.id,
            agency_id = %job.agency_id,
            status = %status,
            state = %state,
            error = ?error,
            last_failed_stage = ?run.retry.last_failed_stage(),
            reservation = %finalize.status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Enhancement pipeline finished"
        );

        executed?;

        Ok(JobOutcome {
            job_id: job.id,
            status,
            state,
            error,
            settlement: run.settlement,
            finalize,
            failures: run.retry.failures().to_vec(),
        })
    }

    /// Finalize a terminal job from its persisted outputs.
    pub async fn refinalize(&self, job_id: Uuid) -> Result<JobOutcome, OrchestratorError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        let settlement = settlement_from_outputs(&job);
        let finalize = self.ledger.finalize(job_id, settlement).await?;
        if finalize.applied {
            tracing::info!(job_id = %job_id, reservation = %finalize.status, "Reservation finalized from persisted outputs");
        }
        Ok(JobOutcome {
            job_id,
            status: job.status,
            state: job.pipeline_state,
            error: job.error,
            settlement,
            finalize,
            failures: Vec::new(),
        })
    }

    /// Terminate a job whose run died without reaching the completion hook.
    pub async fn abort(&self, job_id: Uuid) -> Result<JobOutcome, OrchestratorError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        if !job.status.is_terminal() {
            let (status, state, _) = resolve_terminal(&job.outputs, true, false, None);
            self.store
                .finish(job_id, status, state, Some(FailureReason::InternalError))
                .await?;
            metrics::counter!("enhancement_jobs_finished_total", "status" => status.to_string())
                .increment(1);
            tracing::error!(job_id = %job_id, status = %status, "Job aborted");
        }
        self.refinalize(job_id).await
    }

    async fn execute(&self, job: &EnhancementJob, run: &mut JobRun) -> Result<(), OrchestratorError> {
        let source = self.images.get(&job.image_id).await?;

        let mut current = match self
            .run_stage(job, StageId::Stage1A, &source, job.room_type.as_deref(), run)
            .await?
        {
            StageResult::Accepted { output } => {
                run.settle(BillingStage::Stage1, true);
                output
            }
            StageResult::Failed | StageResult::Cancelled => return Ok(()),
        };

        if job.requested.declutter {
            match self
                .run_stage(job, StageId::Stage1B, &current, job.room_type.as_deref(), run)
                .await?
            {
                StageResult::Accepted { output } => current = output,
                StageResult::Failed | StageResult::Cancelled => return Ok(()),
            }
        }

        if !job.requested.staging {
            return Ok(());
        }

        // Classification may have been corrected while earlier stages ran.
        let latest = self
            .store
            .get_job(job.id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job.id))?;
        let decision = can_stage(latest.scene, latest.room_type.as_deref());
        if !decision.allowed {
            tracing::info!(
                job_id = %job.id,
                reason = ?decision.reason,
                "Staging not eligible, skipping Stage 2"
            );
            run.settle(BillingStage::Stage2, false);
            return Ok(());
        }

        match self
            .run_stage(job, StageId::Stage2, &current, latest.room_type.as_deref(), run)
            .await?
        {
            StageResult::Accepted { .. } => run.settle(BillingStage::Stage2, true),
            StageResult::Failed | StageResult::Cancelled => run.settle(BillingStage::Stage2, false),
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        job: &EnhancementJob,
        stage: StageId,
        input: &[u8],
        room_type: Option<&str>,
        run: &mut JobRun,
    ) -> Result<StageResult, OrchestratorError> {
        self.store.set_state(job.id, stage.pipeline_state()).await?;
        let input: Arc<[u8]> = Arc::from(input);

        loop {
            if self.cancellation.is_cancelled(job.id).await? {
                tracing::info!(job_id = %job.id, stage = %stage, "Job cancelled");
                run.retry.on_cancelled();
                run.cancelled = true;
                return Ok(StageResult::Cancelled);
            }

            let attempt = run.take_attempt_number(stage);
            let generation = run.retry.generation_for(stage);
            let started = Instant::now();

            let candidate = match self
                .call_provider(job.id, stage, &input, room_type, generation)
                .await
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    let reason = if matches!(e, ProviderError::Misconfigured(_)) {
                        FailureReason::ConfigurationError
                    } else {
                        FailureReason::ProviderError
                    };
                    tracing::error!(job_id = %job.id, stage = %stage, attempt, error = %e, "Stage failed on provider error");
                    self.record_attempt(job.id, stage, attempt, AttemptOutcome::ProviderFailed, None, None, started)
                        .await?;
                    run.retry.on_terminal_failure(stage, reason, e.to_string());
                    return Ok(StageResult::Failed);
                }
            };

            let content_type = content_type_of(&candidate);
            let key = candidate_key(job.id, stage, attempt, content_type);
            self.images.put(&key, &candidate, content_type).await?;

            let candidate: Arc<[u8]> = Arc::from(candidate);
            let summary = {
                let (baseline, candidate) = (input.clone(), candidate.clone());
                let config = self.config.validation.clone();
                tokio::task::spawn_blocking(move || {
                    structural::validate(stage, &baseline, &candidate, &config)
                })
                .await?
            };

            let summary = match summary {
                Ok(summary) => summary,
                Err(e) => {
                    let reason = match e {
                        ValidatorError::Candidate(_) => FailureReason::ProviderError,
                        ValidatorError::Baseline(_) => FailureReason::ConfigurationError,
                    };
                    tracing::error!(job_id = %job.id, stage = %stage, attempt, error = %e, "Stage output could not be validated");
                    self.record_attempt(job.id, stage, attempt, AttemptOutcome::ProviderFailed, None, Some(key), started)
                        .await?;
                    run.retry.on_terminal_failure(stage, reason, e.to_string());
                    return Ok(StageResult::Failed);
                }
            };

            let blocked = summary.blocks();
            let detail = describe_triggers(&summary);
            let outcome = if blocked {
                AttemptOutcome::StructuralRisk
            } else {
                AttemptOutcome::Accepted
            };
            tracing::info!(
                job_id = %job.id,
                stage = %stage,
                attempt,
                score = summary.score,
                risk = summary.risk,
                mode = %summary.mode,
                triggers = %detail,
                "Stage attempt validated"
            );
            self.record_attempt(job.id, stage, attempt, outcome, Some(summary), Some(key.clone()), started)
                .await?;

            if !blocked {
                self.store.record_output(job.id, stage, &key).await?;
                run.outputs.set(stage, key);
                return Ok(StageResult::Accepted {
                    output: candidate.to_vec(),
                });
            }

            match run.retry.on_structural_risk(stage, detail) {
                RetryDecision::Retry { generation } => {
                    let delay = backoff(self.config.retry_backoff, run.retry.attempts(stage));
                    tracing::warn!(
                        job_id = %job.id,
                        stage = %stage,
                        attempt,
                        strength = generation.strength,
                        delay_ms = delay.as_millis() as u64,
                        "Structural risk, retrying with tightened generation"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted => {
                    tracing::warn!(job_id = %job.id, stage = %stage, attempt, "Structural retry budget exhausted");
                    return Ok(StageResult::Failed);
                }
            }
        }
    }

    /// Invoke the provider, retrying transient errors with bounded backoff.
    async fn call_provider(
        &self,
        job_id: Uuid,
        stage: StageId,
        input: &[u8],
        room_type: Option<&str>,
        generation: GenerationParams,
    ) -> Result<Vec<u8>, ProviderError> {
        let request = StageRequest {
            job_id,
            stage,
            image: input.to_vec(),
            room_type: room_type.map(str::to_string),
            generation,
        };
        let max_calls = self.config.provider_max_attempts.max(1);

        let mut call = 0;
        loop {
            call += 1;
            if let Err(e) = self.store.heartbeat(job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to record job heartbeat");
            }
            let result = match tokio::time::timeout(
                self.config.provider_timeout,
                self.provider.transform(&request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.config.provider_timeout)),
            };

            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && call < max_calls => {
                    let delay = backoff(self.config.retry_backoff, call);
                    tracing::warn!(
                        job_id = %job_id,
                        stage = %stage,
                        call,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Provider call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_attempt(
        &self,
        job_id: Uuid,
        stage: StageId,
        attempt: i32,
        outcome: AttemptOutcome,
        validation: Option<ValidationSummary>,
        output_key: Option<String>,
        started: Instant,
    ) -> Result<(), OrchestratorError> {
        metrics::counter!(
            "stage_attempts_total",
            "stage" => stage.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
        metrics::histogram!("stage_duration_seconds", "stage" => stage.to_string())
            .record(started.elapsed().as_secs_f64());

        self.store
            .append_attempt(&StageAttempt {
                job_id,
                stage,
                attempt,
                outcome,
                validation,
                output_key,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

/// Exponential backoff from `base`, capped.
fn backoff(base: Duration, call: u32) -> Duration {
    base.saturating_mul(1 << (call - 1).min(8)).min(MAX_BACKOFF)
}

fn describe_triggers(summary: &ValidationSummary) -> String {
    if summary.triggers.is_empty() {
        return "none".to_string();
    }
    summary
        .triggers
        .iter()
        .map(|t| {
            format!(
                "{}={:.3}/{:.3}{}",
                t.id,
                t.value,
                t.threshold,
                if t.fatal { " fatal" } else { "" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}
