use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of an enhancement job as seen by callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    PartiallySucceeded,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::PartiallySucceeded | Self::Cancelled
        )
    }
}

/// Position of a job in the orchestrator state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
pub enum PipelineState {
    #[serde(rename = "init")]
    #[strum(serialize = "init")]
    Init,
    #[serde(rename = "stage_1a")]
    #[strum(serialize = "stage_1a")]
    Stage1A,
    #[serde(rename = "stage_1b")]
    #[strum(serialize = "stage_1b")]
    Stage1B,
    #[serde(rename = "stage_2")]
    #[strum(serialize = "stage_2")]
    Stage2,
    #[serde(rename = "complete")]
    #[strum(serialize = "complete")]
    Complete,
    #[serde(rename = "failed")]
    #[strum(serialize = "failed")]
    Failed,
    #[serde(rename = "partially_succeeded")]
    #[strum(serialize = "partially_succeeded")]
    PartiallySucceeded,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::PartiallySucceeded)
    }
}

/// One AI transformation step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
pub enum StageId {
    #[serde(rename = "1A")]
    #[strum(serialize = "1A")]
    Stage1A,
    #[serde(rename = "1B")]
    #[strum(serialize = "1B")]
    Stage1B,
    #[serde(rename = "2")]
    #[strum(serialize = "2")]
    Stage2,
}

impl StageId {
    pub const ALL: [StageId; 3] = [StageId::Stage1A, StageId::Stage1B, StageId::Stage2];

    /// Dense index for per-stage arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Stage1A => 0,
            Self::Stage1B => 1,
            Self::Stage2 => 2,
        }
    }

    pub fn pipeline_state(self) -> PipelineState {
        match self {
            Self::Stage1A => PipelineState::Stage1A,
            Self::Stage1B => PipelineState::Stage1B,
            Self::Stage2 => PipelineState::Stage2,
        }
    }

    /// Path-safe slug used in storage keys.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Stage1A => "1a",
            Self::Stage1B => "1b",
            Self::Stage2 => "2",
        }
    }
}

/// Scene classification of the source photo.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SceneType {
    Interior,
    Exterior,
    Unknown,
}

/// Optional stages requested on top of the mandatory 1A enhancement.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestedStages {
    #[serde(default)]
    pub declutter: bool,
    #[serde(default)]
    pub staging: bool,
}

/// User-visible failure reason, ordered by ascending priority.
///
/// When several stages fail for different reasons the job reports the
/// maximum, so declaration order matters.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureReason {
    Cancelled,
    ProviderError,
    StructuralRiskExceeded,
    ConfigurationError,
    InternalError,
}

/// Storage keys of the accepted output of each stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageOutputs {
    pub stage_1a: Option<String>,
    pub stage_1b: Option<String>,
    pub stage_2: Option<String>,
}

impl StageOutputs {
    pub fn get(&self, stage: StageId) -> Option<&str> {
        match stage {
            StageId::Stage1A => self.stage_1a.as_deref(),
            StageId::Stage1B => self.stage_1b.as_deref(),
            StageId::Stage2 => self.stage_2.as_deref(),
        }
    }

    pub fn set(&mut self, stage: StageId, key: String) {
        match stage {
            StageId::Stage1A => self.stage_1a = Some(key),
            StageId::Stage1B => self.stage_1b = Some(key),
            StageId::Stage2 => self.stage_2 = Some(key),
        }
    }

    /// Most advanced accepted output, if any stage succeeded.
    pub fn latest(&self) -> Option<&str> {
        self.stage_2
            .as_deref()
            .or(self.stage_1b.as_deref())
            .or(self.stage_1a.as_deref())
    }

    pub fn any_accepted(&self) -> bool {
        self.latest().is_some()
    }
}

/// An enhancement job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancementJob {
    pub id: Uuid,
    pub user_id: String,
    pub agency_id: String,
    pub image_id: String,
    pub requested: RequestedStages,
    pub scene: Option<SceneType>,
    pub room_type: Option<String>,
    pub status: JobStatus,
    pub pipeline_state: PipelineState,
    pub outputs: StageOutputs,
    pub error: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a queued job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub user_id: String,
    pub agency_id: String,
    pub image_id: String,
    pub requested: RequestedStages,
    pub scene: Option<SceneType>,
    pub room_type: Option<String>,
}

impl NewJob {
    pub fn into_job(self, now: DateTime<Utc>) -> EnhancementJob {
        EnhancementJob {
            id: self.id,
            user_id: self.user_id,
            agency_id: self.agency_id,
            image_id: self.image_id,
            requested: self.requested,
            scene: self.scene,
            room_type: self.room_type,
            status: JobStatus::Queued,
            pipeline_state: PipelineState::Init,
            outputs: StageOutputs::default(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
