use serde::Serialize;
use strum::Display;

use crate::models::enhancement::RejectionReason;
use crate::models::job::SceneType;

/// Reason staging was refused.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StagingDenial {
    ExteriorBlocked,
    UnknownSceneRequiresConfirmation,
    MissingRoomType,
}

impl From<StagingDenial> for RejectionReason {
    fn from(denial: StagingDenial) -> Self {
        match denial {
            StagingDenial::ExteriorBlocked => RejectionReason::ExteriorBlocked,
            StagingDenial::UnknownSceneRequiresConfirmation => {
                RejectionReason::UnknownSceneRequiresConfirmation
            }
            StagingDenial::MissingRoomType => RejectionReason::MissingRoomType,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StagingDecision {
    pub allowed: bool,
    pub reason: Option<StagingDenial>,
}

impl StagingDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: StagingDenial) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Decide whether virtual staging may run for a scene.
///
/// Rules, first match wins:
/// - exterior scenes are never staged
/// - unknown or unclassified scenes need a user confirmation
/// - interiors need a room type
pub fn can_stage(scene: Option<SceneType>, room_type: Option<&str>) -> StagingDecision {
    match scene {
        Some(SceneType::Exterior) => StagingDecision::deny(StagingDenial::ExteriorBlocked),
        None | Some(SceneType::Unknown) => {
            StagingDecision::deny(StagingDenial::UnknownSceneRequiresConfirmation)
        }
        Some(SceneType::Interior) => match room_type.map(str::trim) {
            Some(room) if !room.is_empty() => StagingDecision::allow(),
            _ => StagingDecision::deny(StagingDenial::MissingRoomType),
        },
    }
}
