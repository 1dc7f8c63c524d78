use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::job::StageId;
use crate::models::validation::ValidationSummary;

/// How a single stage attempt ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    StructuralRisk,
    ProviderFailed,
}

/// One execution of one stage. Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAttempt {
    pub job_id: Uuid,
    pub stage: StageId,
    /// Monotonic per stage, starting at 0.
    pub attempt: i32,
    pub outcome: AttemptOutcome,
    pub validation: Option<ValidationSummary>,
    pub output_key: Option<String>,
    pub created_at: DateTime<Utc>,
}
