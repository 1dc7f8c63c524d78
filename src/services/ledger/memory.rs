//! In-memory ledger for tests and local development.
//!
//! A single mutex stands in for the row locks of the Postgres ledger, so
//! reservations and finalizations for every agency serialize. Not suitable
//! for production: nothing is persisted and nothing is shared across processes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{plan_split, settle, FinalizeOutcome, LedgerError, UsageLedger};
use crate::models::reservation::{
    month_key, AgencyAccount, MonthlyUsage, PerStageCounts, Reservation, ReservationRequest,
    ReservationStatus, StageSettlement, UsageSummary,
};

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<String, AgencyAccount>,
    usage: HashMap<(String, String), MonthlyUsage>,
    reservations: HashMap<Uuid, Reservation>,
}

#[derive(Debug, Default)]
pub struct InMemoryUsageLedger {
    state: Mutex<LedgerState>,
}

fn poison_err<T>(_: PoisonError<T>) -> LedgerError {
    LedgerError::Storage("ledger lock poisoned".to_string())
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: impl IntoIterator<Item = AgencyAccount>) -> Self {
        let ledger = Self::new();
        {
            let mut state = ledger.state.lock().unwrap_or_else(PoisonError::into_inner);
            for account in accounts {
                state.accounts.insert(account.agency_id.clone(), account);
            }
        }
        ledger
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        self.state.lock().map_err(poison_err)
    }

    /// Seed usage for a month, e.g. to simulate an exhausted allowance.
    pub fn set_usage(
        &self,
        agency_id: &str,
        month_key: &str,
        usage: MonthlyUsage,
    ) -> Result<(), LedgerError> {
        self.lock()?
            .usage
            .insert((agency_id.to_string(), month_key.to_string()), usage);
        Ok(())
    }

    pub fn usage(&self, agency_id: &str, month_key: &str) -> Result<MonthlyUsage, LedgerError> {
        Ok(self
            .lock()?
            .usage
            .get(&(agency_id.to_string(), month_key.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    pub fn account(&self, agency_id: &str) -> Result<Option<AgencyAccount>, LedgerError> {
        Ok(self.lock()?.accounts.get(agency_id).cloned())
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn reserve(&self, request: &ReservationRequest) -> Result<Reservation, LedgerError> {
        let now = Utc::now();
        let month = month_key(now);
        let mut state = self.lock()?;

        if state.reservations.contains_key(&request.job_id) {
            return Err(LedgerError::DuplicateReservation(request.job_id));
        }
        let account = state
            .accounts
            .get(&request.agency_id)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownAgency(request.agency_id.clone()))?;
        let usage = state
            .usage
            .get(&(request.agency_id.clone(), month.clone()))
            .cloned()
            .unwrap_or_default();
        let included_held: i32 = state
            .reservations
            .values()
            .filter(|r| {
                r.status == ReservationStatus::Held
                    && r.agency_id == request.agency_id
                    && r.month_key == month
            })
            .map(|r| r.reserved_included)
            .sum();

        let split = plan_split(
            request.units(),
            account.included_limit(),
            usage.included_used,
            included_held,
            account.addon_balance,
        )?;

        let reservation = Reservation {
            job_id: request.job_id,
            agency_id: request.agency_id.clone(),
            month_key: month,
            reserved_included: split.included,
            reserved_addon: split.addon,
            stage1_requested: true,
            stage2_requested: request.stages.staging,
            status: ReservationStatus::Held,
            created_at: now,
            finalized_at: None,
        };

        if let Some(account) = state.accounts.get_mut(&request.agency_id) {
            account.addon_balance -= split.addon;
        }
        state
            .reservations
            .insert(reservation.job_id, reservation.clone());
        Ok(reservation)
    }

    async fn finalize(
        &self,
        job_id: Uuid,
        settlement: StageSettlement,
    ) -> Result<FinalizeOutcome, LedgerError> {
        let mut state = self.lock()?;
        let reservation = state
            .reservations
            .get(&job_id)
            .cloned()
            .ok_or(LedgerError::NotFound(job_id))?;

        if reservation.status != ReservationStatus::Held {
            return Ok(FinalizeOutcome {
                status: reservation.status,
                applied: false,
            });
        }

        let delta = settle(&reservation, &settlement);

        let usage = state
            .usage
            .entry((reservation.agency_id.clone(), reservation.month_key.clone()))
            .or_default();
        usage.included_used += delta.included_used;
        usage.addon_used += delta.addon_used;
        usage.stage1_used += delta.stage1_used;
        usage.stage2_used += delta.stage2_used;

        if let Some(account) = state.accounts.get_mut(&reservation.agency_id) {
            account.addon_balance += delta.addon_refund;
        }
        if let Some(stored) = state.reservations.get_mut(&job_id) {
            stored.status = delta.status;
            stored.finalized_at = Some(Utc::now());
        }

        Ok(FinalizeOutcome {
            status: delta.status,
            applied: true,
        })
    }

    async fn reservation(&self, job_id: Uuid) -> Result<Option<Reservation>, LedgerError> {
        Ok(self.lock()?.reservations.get(&job_id).cloned())
    }

    async fn held_reservations(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, LedgerError> {
        let state = self.lock()?;
        let mut held: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Held && r.created_at < before)
            .cloned()
            .collect();
        held.sort_by_key(|r| r.created_at);
        Ok(held)
    }

    async fn usage_summary(
        &self,
        agency_id: &str,
        month_key: &str,
    ) -> Result<UsageSummary, LedgerError> {
        let state = self.lock()?;
        let account = state
            .accounts
            .get(agency_id)
            .ok_or_else(|| LedgerError::UnknownAgency(agency_id.to_string()))?;
        let usage = state
            .usage
            .get(&(agency_id.to_string(), month_key.to_string()))
            .cloned()
            .unwrap_or_default();

        Ok(UsageSummary {
            agency_id: agency_id.to_string(),
            month_key: month_key.to_string(),
            included_used: usage.included_used,
            included_limit: account.included_limit(),
            addon_remaining: account.addon_balance,
            per_stage_counts: PerStageCounts {
                stage1: usage.stage1_used,
                stage2: usage.stage2_used,
            },
        })
    }
}
