use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::job::{RequestedStages, StageId};

/// Reservation lifecycle. Leaves `Held` exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReservationStatus {
    Held,
    Consumed,
    Released,
    PartiallyReleased,
}

/// Unit of charge. Stage 1 covers 1A and the optional 1B pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BillingStage {
    Stage1,
    Stage2,
}

impl BillingStage {
    pub fn of(stage: StageId) -> Self {
        match stage {
            StageId::Stage1A | StageId::Stage1B => Self::Stage1,
            StageId::Stage2 => Self::Stage2,
        }
    }
}

/// Which balance a reserved unit is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Included,
    Addon,
}

/// Subscription tier; determines the monthly included allowance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanTier {
    Starter,
    Pro,
    Agency,
}

impl PlanTier {
    pub fn included_allowance(self) -> i32 {
        match self {
            Self::Starter => 30,
            Self::Pro => 100,
            Self::Agency => 300,
        }
    }
}

/// Billing account of an agency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgencyAccount {
    pub agency_id: String,
    pub plan_tier: PlanTier,
    /// Overrides the tier allowance when set.
    pub included_limit_override: Option<i32>,
    pub addon_balance: i32,
}

impl AgencyAccount {
    pub fn included_limit(&self) -> i32 {
        self.included_limit_override
            .unwrap_or_else(|| self.plan_tier.included_allowance())
    }
}

/// Per agency, per billing month consumption.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonthlyUsage {
    pub included_used: i32,
    pub addon_used: i32,
    pub stage1_used: i32,
    pub stage2_used: i32,
}

/// Tentative claim against an agency's monthly quota.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub job_id: Uuid,
    pub agency_id: String,
    pub month_key: String,
    pub reserved_included: i32,
    pub reserved_addon: i32,
    pub stage1_requested: bool,
    pub stage2_requested: bool,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Billing units in pool-assignment order.
    pub fn units(&self) -> Vec<BillingStage> {
        let mut units = Vec::with_capacity(2);
        if self.stage1_requested {
            units.push(BillingStage::Stage1);
        }
        if self.stage2_requested {
            units.push(BillingStage::Stage2);
        }
        units
    }

    /// Pool a unit was reserved from: the first `reserved_included` units
    /// are included, the rest add-on.
    pub fn pool_for(&self, stage: BillingStage) -> Option<Pool> {
        let position = self.units().iter().position(|u| *u == stage)?;
        if (position as i32) < self.reserved_included {
            Some(Pool::Included)
        } else {
            Some(Pool::Addon)
        }
    }
}

/// Input to a reservation.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub job_id: Uuid,
    pub agency_id: String,
    pub stages: RequestedStages,
}

impl ReservationRequest {
    pub fn units(&self) -> i32 {
        1 + i32::from(self.stages.staging)
    }
}

/// Definitive per-billing-stage outcome reported by the orchestrator.
///
/// Each stage is recorded once; later reports for the same stage are ignored.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageSettlement {
    pub stage1: Option<bool>,
    pub stage2: Option<bool>,
}

impl StageSettlement {
    /// Returns false if the stage had already been settled.
    pub fn record(&mut self, stage: BillingStage, accepted: bool) -> bool {
        let slot = match stage {
            BillingStage::Stage1 => &mut self.stage1,
            BillingStage::Stage2 => &mut self.stage2,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(accepted);
        true
    }

    /// Unsettled stages count as not accepted.
    pub fn accepted(&self, stage: BillingStage) -> bool {
        match stage {
            BillingStage::Stage1 => self.stage1.unwrap_or(false),
            BillingStage::Stage2 => self.stage2.unwrap_or(false),
        }
    }
}

/// Read-only projection for quota displays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageSummary {
    pub agency_id: String,
    pub month_key: String,
    pub included_used: i32,
    pub included_limit: i32,
    pub addon_remaining: i32,
    pub per_stage_counts: PerStageCounts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerStageCounts {
    pub stage1: i32,
    pub stage2: i32,
}

/// Billing month key, e.g. `2026-10`.
pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}
