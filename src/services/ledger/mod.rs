//! Usage reservation ledger.
//!
//! Quota is handled in two phases around pipeline execution:
//!
//! - [`UsageLedger::reserve`] runs before any AI call. It splits the requested
//!   billing units between the included allowance and the add-on balance and
//!   takes the add-on share up front.
//! - [`UsageLedger::finalize`] runs once the orchestrator is terminal. It
//!   consumes accepted units and refunds the rest. Only the first call for a
//!   job has an effect.
//!
//! Both implementations share [`plan_split`] and [`settle`], so the accounting
//! rules live in one place.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::reservation::{
    BillingStage, Pool, Reservation, ReservationRequest, ReservationStatus, StageSettlement,
    UsageSummary,
};

pub use memory::InMemoryUsageLedger;
pub use postgres::PgUsageLedger;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Quota exhausted: {requested} image(s) requested, {included_available} included and {addon_available} add-on available")]
    QuotaExhausted {
        requested: i32,
        included_available: i32,
        addon_available: i32,
    },

    #[error("Unknown agency: {0}")]
    UnknownAgency(String),

    #[error("Reservation already exists for job {0}")]
    DuplicateReservation(Uuid),

    #[error("No reservation for job {0}")]
    NotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger storage error: {0}")]
    Storage(String),
}

/// How reserved units are divided between the two pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSplit {
    pub included: i32,
    pub addon: i32,
}

/// Counter and balance changes produced by finalizing a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementDelta {
    pub included_used: i32,
    pub addon_used: i32,
    /// Add-on units credited back to the balance.
    pub addon_refund: i32,
    pub stage1_used: i32,
    pub stage2_used: i32,
    pub status: ReservationStatus,
}

/// Result of a finalize call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub status: ReservationStatus,
    /// False when the reservation had already been finalized.
    pub applied: bool,
}

/// Transactional quota accounting against an agency's monthly pool.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Reserve quota for a job before processing starts.
    async fn reserve(&self, request: &ReservationRequest) -> Result<Reservation, LedgerError>;

    /// Consume or refund a held reservation. Idempotent per job.
    async fn finalize(
        &self,
        job_id: Uuid,
        settlement: StageSettlement,
    ) -> Result<FinalizeOutcome, LedgerError>;

    async fn reservation(&self, job_id: Uuid) -> Result<Option<Reservation>, LedgerError>;

    /// Reservations still held that were created before `before`.
    async fn held_reservations(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, LedgerError>;

    async fn usage_summary(
        &self,
        agency_id: &str,
        month_key: &str,
    ) -> Result<UsageSummary, LedgerError>;
}

/// Draw `units` from the included allowance first, add-on as overflow.
///
/// All-or-nothing: fails if the two pools together cannot cover every unit.
pub fn plan_split(
    units: i32,
    included_limit: i32,
    included_used: i32,
    included_held: i32,
    addon_balance: i32,
) -> Result<PoolSplit, LedgerError> {
    let included_available = (included_limit - included_used - included_held).max(0);
    let addon_available = addon_balance.max(0);

    let included = units.min(included_available);
    let addon = units - included;
    if addon > addon_available {
        return Err(LedgerError::QuotaExhausted {
            requested: units,
            included_available,
            addon_available,
        });
    }
    Ok(PoolSplit { included, addon })
}

/// Counter changes for finalizing `reservation` with the given stage outcomes.
pub fn settle(reservation: &Reservation, settlement: &StageSettlement) -> SettlementDelta {
    let mut delta = SettlementDelta {
        included_used: 0,
        addon_used: 0,
        addon_refund: 0,
        stage1_used: 0,
        stage2_used: 0,
        status: ReservationStatus::Released,
    };

    let units = reservation.units();
    let mut accepted = 0;
    for unit in &units {
        let pool = reservation.pool_for(*unit);
        if settlement.accepted(*unit) {
            accepted += 1;
            match pool {
                Some(Pool::Included) => delta.included_used += 1,
                Some(Pool::Addon) => delta.addon_used += 1,
                None => {}
            }
            match unit {
                BillingStage::Stage1 => delta.stage1_used += 1,
                BillingStage::Stage2 => delta.stage2_used += 1,
            }
        } else if pool == Some(Pool::Addon) {
            delta.addon_refund += 1;
        }
    }

    delta.status = if accepted == 0 {
        ReservationStatus::Released
    } else if accepted == units.len() {
        ReservationStatus::Consumed
    } else {
        ReservationStatus::PartiallyReleased
    };
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(included: i32, addon: i32, staging: bool) -> Reservation {
        Reservation {
            job_id: Uuid::new_v4(),
            agency_id: "agency-1".into(),
            month_key: "2026-10".into(),
            reserved_included: included,
            reserved_addon: addon,
            stage1_requested: true,
            stage2_requested: staging,
            status: ReservationStatus::Held,
            created_at: Utc::now(),
            finalized_at: None,
        }
    }

    fn settlement(stage1: bool, stage2: Option<bool>) -> StageSettlement {
        StageSettlement {
            stage1: Some(stage1),
            stage2,
        }
    }

    #[test]
    fn test_split_prefers_included() {
        let split = plan_split(2, 10, 3, 0, 5).unwrap();
        assert_eq!(split, PoolSplit { included: 2, addon: 0 });
    }

    #[test]
    fn test_split_overflows_into_addon() {
        let split = plan_split(2, 10, 9, 0, 5).unwrap();
        assert_eq!(split, PoolSplit { included: 1, addon: 1 });
    }

    #[test]
    fn test_split_counts_held_included_units() {
        let split = plan_split(1, 10, 8, 2, 1).unwrap();
        assert_eq!(split, PoolSplit { included: 0, addon: 1 });
    }

    #[test]
    fn test_split_is_all_or_nothing() {
        let err = plan_split(2, 10, 10, 0, 1).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::QuotaExhausted {
                requested: 2,
                included_available: 0,
                addon_available: 1
            }
        ));
    }

    #[test]
    fn test_over_used_allowance_is_not_negative_capacity() {
        let split = plan_split(1, 5, 7, 0, 1).unwrap();
        assert_eq!(split, PoolSplit { included: 0, addon: 1 });
    }

    #[test]
    fn test_settle_all_accepted_consumes() {
        let delta = settle(&held(1, 1, true), &settlement(true, Some(true)));
        assert_eq!(delta.status, ReservationStatus::Consumed);
        assert_eq!((delta.included_used, delta.addon_used), (1, 1));
        assert_eq!((delta.stage1_used, delta.stage2_used), (1, 1));
        assert_eq!(delta.addon_refund, 0);
    }

    #[test]
    fn test_settle_nothing_accepted_releases() {
        let delta = settle(&held(0, 2, true), &settlement(false, Some(false)));
        assert_eq!(delta.status, ReservationStatus::Released);
        assert_eq!(delta.included_used + delta.addon_used, 0);
        assert_eq!(delta.addon_refund, 2);
    }

    #[test]
    fn test_settle_mixed_partially_releases() {
        let delta = settle(&held(1, 1, true), &settlement(true, Some(false)));
        assert_eq!(delta.status, ReservationStatus::PartiallyReleased);
        assert_eq!(delta.included_used, 1);
        assert_eq!(delta.stage2_used, 0);
        assert_eq!(delta.addon_refund, 1);
    }

    #[test]
    fn test_settle_never_exceeds_reserved() {
        for (included, addon) in [(2, 0), (1, 1), (0, 2)] {
            let r = held(included, addon, true);
            for s1 in [false, true] {
                for s2 in [false, true] {
                    let d = settle(&r, &settlement(s1, Some(s2)));
                    let used = d.included_used + d.addon_used;
                    assert!(used <= included + addon);
                    assert!(d.included_used <= included && d.addon_used <= addon);
                    assert_eq!(d.addon_used + d.addon_refund, addon);
                }
            }
        }
    }

    #[test]
    fn test_unsettled_stage_is_refunded() {
        let delta = settle(&held(0, 2, true), &StageSettlement::default());
        assert_eq!(delta.status, ReservationStatus::Released);
        assert_eq!(delta.addon_refund, 2);
    }
}
