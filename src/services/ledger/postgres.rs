use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{FinalizeOutcome, LedgerError, UsageLedger};
use crate::db::ledger_queries;
use crate::models::reservation::{Reservation, ReservationRequest, StageSettlement, UsageSummary};

/// Ledger backed by PostgreSQL row locks.
#[derive(Clone)]
pub struct PgUsageLedger {
    pool: PgPool,
}

impl PgUsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageLedger for PgUsageLedger {
    async fn reserve(&self, request: &ReservationRequest) -> Result<Reservation, LedgerError> {
        let reservation = ledger_queries::reserve(&self.pool, request, Utc::now()).await?;
        tracing::info!(
            job_id = %reservation.job_id,
            agency_id = %reservation.agency_id,
            month = %reservation.month_key,
            included = reservation.reserved_included,
            addon = reservation.reserved_addon,
            "Usage reserved"
        );
        Ok(reservation)
    }

    async fn finalize(
        &self,
        job_id: Uuid,
        settlement: StageSettlement,
    ) -> Result<FinalizeOutcome, LedgerError> {
        let outcome = ledger_queries::finalize(&self.pool, job_id, &settlement).await?;
        if outcome.applied {
            tracing::info!(job_id = %job_id, status = %outcome.status, "Reservation finalized");
        } else {
            tracing::debug!(job_id = %job_id, status = %outcome.status, "Reservation already finalized");
        }
        Ok(outcome)
    }

    async fn reservation(&self, job_id: Uuid) -> Result<Option<Reservation>, LedgerError> {
        Ok(ledger_queries::get_reservation(&self.pool, job_id).await?)
    }

    async fn held_reservations(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, LedgerError> {
        Ok(ledger_queries::held_reservations(&self.pool, before).await?)
    }

    async fn usage_summary(
        &self,
        agency_id: &str,
        month_key: &str,
    ) -> Result<UsageSummary, LedgerError> {
        ledger_queries::usage_summary(&self.pool, agency_id, month_key).await
    }
}
