use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::job::{
    FailureReason, JobStatus, PipelineState, RequestedStages, SceneType, StageId, StageOutputs,
};
use crate::models::stage::AttemptOutcome;

/// Request to enhance one image.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitJobRequest {
    #[garde(skip)]
    pub job_id: Uuid,

    #[garde(length(min = 1, max = 128))]
    pub user_id: String,

    #[garde(length(min = 1, max = 128))]
    pub agency_id: String,

    #[garde(length(min = 1, max = 512))]
    pub image_id: String,

    #[garde(skip)]
    #[serde(default)]
    pub requested_stages: RequestedStages,

    #[garde(skip)]
    pub scene: Option<SceneType>,

    #[garde(length(max = 64))]
    pub room_type: Option<String>,

    /// Run enhancement only when staging is requested but not allowed.
    #[garde(skip)]
    #[serde(default)]
    pub allow_enhance_only_fallback: bool,
}

/// Why a submission was turned away before any processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RejectionReason {
    ExteriorBlocked,
    UnknownSceneRequiresConfirmation,
    MissingRoomType,
    QuotaExhausted,
    UnknownAgency,
    DuplicateJob,
}

/// Response after submitting a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitJobResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    /// Set when staging was dropped under an enhancement-only fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_skipped: Option<RejectionReason>,
}

impl SubmitJobResponse {
    pub fn accepted(staging_skipped: Option<RejectionReason>) -> Self {
        Self {
            accepted: true,
            reason: None,
            staging_skipped,
        }
    }

    pub fn rejected(reason: RejectionReason) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            staging_skipped: None,
        }
    }
}

/// Attempt history entry exposed to callers; trigger detail stays internal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptView {
    pub stage: StageId,
    pub attempt: i32,
    pub outcome: AttemptOutcome,
    pub score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Response for querying job status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub state: PipelineState,
    pub outputs: StageOutputs,
    pub attempts: Vec<AttemptView>,
    pub error: Option<FailureReason>,
}

/// Manual scene/room type correction for a job in flight.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ClassificationOverride {
    #[garde(skip)]
    pub scene: SceneType,

    #[garde(length(max = 64))]
    pub room_type: Option<String>,
}
