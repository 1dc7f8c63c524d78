use serde::{Deserialize, Serialize};

use crate::models::job::{FailureReason, StageId};

/// Lowest image-to-image strength a tightened retry may use.
const MIN_STRENGTH: f32 = 0.15;

/// Generation settings handed to the AI capability for one attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    /// How far the model may depart from the input (0.0 - 1.0).
    pub strength: f32,
    /// Prompt adherence.
    pub guidance: f32,
}

impl GenerationParams {
    pub fn for_stage(stage: StageId) -> Self {
        match stage {
            StageId::Stage1A => Self {
                strength: 0.35,
                guidance: 7.5,
            },
            StageId::Stage1B => Self {
                strength: 0.55,
                guidance: 7.5,
            },
            StageId::Stage2 => Self {
                strength: 0.70,
                guidance: 8.0,
            },
        }
    }

    /// Narrower generation for a retry after structural drift.
    pub fn tightened(self, failed_attempts: u32) -> Self {
        if failed_attempts == 0 {
            return self;
        }
        let factor = 0.75_f32.powi(failed_attempts as i32);
        Self {
            strength: (self.strength * factor).max(MIN_STRENGTH),
            guidance: self.guidance + failed_attempts as f32,
        }
    }
}

/// What the orchestrator should do after a blocked attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Retry { generation: GenerationParams },
    Exhausted,
}

/// One recorded stage failure, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageFailure {
    pub stage: StageId,
    pub reason: FailureReason,
    pub detail: String,
}

/// Per-job attempt bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryController {
    max_attempts: u32,
    attempts: [u32; 3],
    last_failed_stage: Option<StageId>,
    failures: Vec<StageFailure>,
    terminal_reason: Option<FailureReason>,
    failed_final: bool,
}

impl RetryController {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts: [0; 3],
            last_failed_stage: None,
            failures: Vec::new(),
            terminal_reason: None,
            failed_final: false,
        }
    }

    /// Structural failures counted so far for a stage.
    pub fn attempts(&self, stage: StageId) -> u32 {
        self.attempts[stage.index()]
    }

    pub fn generation_for(&self, stage: StageId) -> GenerationParams {
        GenerationParams::for_stage(stage).tightened(self.attempts(stage))
    }

    /// Count a blocked validation and decide between retry and exhaustion.
    pub fn on_structural_risk(&mut self, stage: StageId, detail: impl Into<String>) -> RetryDecision {
        let idx = stage.index();
        self.attempts[idx] += 1;
        self.last_failed_stage = Some(stage);
        self.failures.push(StageFailure {
            stage,
            reason: FailureReason::StructuralRiskExceeded,
            detail: detail.into(),
        });

        if self.attempts[idx] < self.max_attempts {
            RetryDecision::Retry {
                generation: self.generation_for(stage),
            }
        } else {
            self.mark_terminal(FailureReason::StructuralRiskExceeded);
            RetryDecision::Exhausted
        }
    }

    /// Fail a stage outright (provider exhaustion, configuration errors).
    pub fn on_terminal_failure(
        &mut self,
        stage: StageId,
        reason: FailureReason,
        detail: impl Into<String>,
    ) {
        self.last_failed_stage = Some(stage);
        self.failures.push(StageFailure {
            stage,
            reason,
            detail: detail.into(),
        });
        self.mark_terminal(reason);
    }

    /// Record a cooperative cancellation.
    pub fn on_cancelled(&mut self) {
        self.terminal_reason = Some(
            self.terminal_reason
                .map_or(FailureReason::Cancelled, |r| r.max(FailureReason::Cancelled)),
        );
    }

    fn mark_terminal(&mut self, reason: FailureReason) {
        self.failed_final = true;
        self.terminal_reason = Some(self.terminal_reason.map_or(reason, |r| r.max(reason)));
    }

    pub fn failed_final(&self) -> bool {
        self.failed_final
    }

    pub fn last_failed_stage(&self) -> Option<StageId> {
        self.last_failed_stage
    }

    pub fn failures(&self) -> &[StageFailure] {
        &self.failures
    }

    /// The reason shown to users for a failed or partial job.
    pub fn highest_priority_reason(&self) -> Option<FailureReason> {
        self.terminal_reason
    }
}
