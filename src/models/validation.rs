use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::job::StageId;

/// Whether a risky validation is only recorded or forces the attempt to fail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValidationMode {
    Log,
    Block,
}

/// Structural signals the validator can raise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerId {
    EdgeOverlap,
    LineAngleDeviation,
    MaskedDifference,
}

/// One structural-risk signal raised for a single comparison.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationTrigger {
    pub id: TriggerId,
    pub value: f64,
    pub threshold: f64,
    /// Bypasses multi-signal gating.
    pub fatal: bool,
    pub stage: StageId,
}

/// Why a metric (or the whole comparison) was not scored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    DimensionMismatch,
    EdgeMaskTooSmall,
    InsufficientLines,
}

/// Raw metric values; `None` when the metric was skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StructuralMetrics {
    pub edge_overlap: Option<f64>,
    pub line_angle_deviation_deg: Option<f64>,
    pub masked_difference: Option<f64>,
}

/// Graded outcome of comparing a stage's input and output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationSummary {
    pub stage: StageId,
    pub mode: ValidationMode,
    pub risk: bool,
    /// Structural similarity in [0, 1]; 1.0 means nothing moved.
    pub score: f64,
    pub triggers: Vec<ValidationTrigger>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkipReason>,
    pub metrics: StructuralMetrics,
}

impl ValidationSummary {
    /// A risky result in `block` mode fails the attempt.
    pub fn blocks(&self) -> bool {
        self.risk && self.mode == ValidationMode::Block
    }

    pub fn passed(&self) -> bool {
        !self.blocks()
    }

    /// True when no metric could be scored at all.
    pub fn inconclusive(&self) -> bool {
        self.skipped.contains(&SkipReason::DimensionMismatch)
    }
}
