use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::reservation::{
    month_key, AgencyAccount, MonthlyUsage, PerStageCounts, PlanTier, Reservation,
    ReservationRequest, ReservationStatus, StageSettlement, UsageSummary,
};
use crate::services::ledger::{plan_split, settle, FinalizeOutcome, LedgerError};

const RESERVATION_COLUMNS: &str = "job_id, agency_id, month_key, reserved_included, reserved_addon, \
     stage1_requested, stage2_requested, status, created_at, finalized_at";

fn reservation_from_row(row: &PgRow) -> Result<Reservation, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Reservation {
        job_id: row.try_get("job_id")?,
        agency_id: row.try_get("agency_id")?,
        month_key: row.try_get("month_key")?,
        reserved_included: row.try_get("reserved_included")?,
        reserved_addon: row.try_get("reserved_addon")?,
        stage1_requested: row.try_get("stage1_requested")?,
        stage2_requested: row.try_get("stage2_requested")?,
        status: ReservationStatus::from_str(&status)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        created_at: row.try_get("created_at")?,
        finalized_at: row.try_get("finalized_at")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<AgencyAccount, sqlx::Error> {
    let tier: String = row.try_get("plan_tier")?;
    Ok(AgencyAccount {
        agency_id: row.try_get("agency_id")?,
        plan_tier: PlanTier::from_str(&tier).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        included_limit_override: row.try_get("included_limit_override")?,
        addon_balance: row.try_get("addon_balance")?,
    })
}

fn usage_from_row(row: &PgRow) -> Result<MonthlyUsage, sqlx::Error> {
    Ok(MonthlyUsage {
        included_used: row.try_get("included_used")?,
        addon_used: row.try_get("addon_used")?,
        stage1_used: row.try_get("stage1_used")?,
        stage2_used: row.try_get("stage2_used")?,
    })
}

/// Lock the `(agency, month)` counter row, creating it on first use.
///
/// Always taken before the account row so every accounting transaction
/// acquires locks in the same order.
async fn lock_usage_row(
    tx: &mut Transaction<'_, Postgres>,
    agency_id: &str,
    month_key: &str,
) -> Result<MonthlyUsage, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO monthly_usage (agency_id, month_key)
        VALUES ($1, $2)
        ON CONFLICT (agency_id, month_key) DO NOTHING
        "#,
    )
    .bind(agency_id)
    .bind(month_key)
    .execute(&mut **tx)
    .await?;

    let row = sqlx::query(
        r#"
        SELECT included_used, addon_used, stage1_used, stage2_used
        FROM monthly_usage
        WHERE agency_id = $1 AND month_key = $2
        FOR UPDATE
        "#,
    )
    .bind(agency_id)
    .bind(month_key)
    .fetch_one(&mut **tx)
    .await?;

    usage_from_row(&row)
}

async fn lock_account_row(
    tx: &mut Transaction<'_, Postgres>,
    agency_id: &str,
) -> Result<Option<AgencyAccount>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT agency_id, plan_tier, included_limit_override, addon_balance
        FROM agency_accounts
        WHERE agency_id = $1
        FOR UPDATE
        "#,
    )
    .bind(agency_id)
    .fetch_optional(&mut **tx)
    .await?;

    row.as_ref().map(account_from_row).transpose()
}

/// Reserve quota for a job in a single transaction.
pub async fn reserve(
    pool: &PgPool,
    request: &ReservationRequest,
    now: DateTime<Utc>,
) -> Result<Reservation, LedgerError> {
    let month = month_key(now);
    let mut tx = pool.begin().await?;

    // A re-submitted job is a duplicate even when the pool is already spent.
    let duplicate: Option<i32> = sqlx::query_scalar("SELECT 1 FROM usage_reservations WHERE job_id = $1")
        .bind(request.job_id)
        .fetch_optional(&mut *tx)
        .await?;
    if duplicate.is_some() {
        return Err(LedgerError::DuplicateReservation(request.job_id));
    }

    let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM agency_accounts WHERE agency_id = $1")
        .bind(&request.agency_id)
        .fetch_optional(&mut *tx)
        .await?;
    if exists.is_none() {
        return Err(LedgerError::UnknownAgency(request.agency_id.clone()));
    }

    let usage = lock_usage_row(&mut tx, &request.agency_id, &month).await?;
    let account = lock_account_row(&mut tx, &request.agency_id)
        .await?
        .ok_or_else(|| LedgerError::UnknownAgency(request.agency_id.clone()))?;

    let included_held: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(reserved_included), 0)::BIGINT
        FROM usage_reservations
        WHERE agency_id = $1 AND month_key = $2 AND status = 'held'
        "#,
    )
    .bind(&request.agency_id)
    .bind(&month)
    .fetch_one(&mut *tx)
    .await?;

    let split = plan_split(
        request.units(),
        account.included_limit(),
        usage.included_used,
        i32::try_from(included_held).unwrap_or(i32::MAX),
        account.addon_balance,
    )?;

    let inserted = sqlx::query(&format!(
        r#"
        INSERT INTO usage_reservations
            (job_id, agency_id, month_key, reserved_included, reserved_addon,
             stage1_requested, stage2_requested, status, created_at)
        VALUES ($1, $2, $3, $4, $5, TRUE, $6, 'held', $7)
        ON CONFLICT (job_id) DO NOTHING
        RETURNING {RESERVATION_COLUMNS}
        "#
    ))
    .bind(request.job_id)
    .bind(&request.agency_id)
    .bind(&month)
    .bind(split.included)
    .bind(split.addon)
    .bind(request.stages.staging)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = inserted else {
        return Err(LedgerError::DuplicateReservation(request.job_id));
    };
    let reservation = reservation_from_row(&row)?;

    if split.addon > 0 {
        sqlx::query(
            r#"
            UPDATE agency_accounts
            SET addon_balance = addon_balance - $2, updated_at = NOW()
            WHERE agency_id = $1
            "#,
        )
        .bind(&request.agency_id)
        .bind(split.addon)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(reservation)
}

/// Consume or refund a held reservation. A second call is a no-op.
pub async fn finalize(
    pool: &PgPool,
    job_id: Uuid,
    settlement: &StageSettlement,
) -> Result<FinalizeOutcome, LedgerError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM usage_reservations WHERE job_id = $1 FOR UPDATE"
    ))
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(LedgerError::NotFound(job_id))?;
    let reservation = reservation_from_row(&row)?;

    if reservation.status != ReservationStatus::Held {
        tx.rollback().await?;
        return Ok(FinalizeOutcome {
            status: reservation.status,
            applied: false,
        });
    }

    lock_usage_row(&mut tx, &reservation.agency_id, &reservation.month_key).await?;
    lock_account_row(&mut tx, &reservation.agency_id).await?;

    let delta = settle(&reservation, settlement);

    sqlx::query(
        r#"
        UPDATE monthly_usage
        SET included_used = included_used + $3,
            addon_used = addon_used + $4,
            stage1_used = stage1_used + $5,
            stage2_used = stage2_used + $6,
            updated_at = NOW()
        WHERE agency_id = $1 AND month_key = $2
        "#,
    )
    .bind(&reservation.agency_id)
    .bind(&reservation.month_key)
    .bind(delta.included_used)
    .bind(delta.addon_used)
    .bind(delta.stage1_used)
    .bind(delta.stage2_used)
    .execute(&mut *tx)
    .await?;

    if delta.addon_refund > 0 {
        sqlx::query(
            r#"
            UPDATE agency_accounts
            SET addon_balance = addon_balance + $2, updated_at = NOW()
            WHERE agency_id = $1
            "#,
        )
        .bind(&reservation.agency_id)
        .bind(delta.addon_refund)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        UPDATE usage_reservations
        SET status = $2, finalized_at = NOW()
        WHERE job_id = $1 AND status = 'held'
        "#,
    )
    .bind(job_id)
    .bind(delta.status.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(FinalizeOutcome {
        status: delta.status,
        applied: true,
    })
}

pub async fn get_reservation(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Option<Reservation>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM usage_reservations WHERE job_id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(reservation_from_row).transpose()
}

pub async fn held_reservations(
    pool: &PgPool,
    before: DateTime<Utc>,
) -> Result<Vec<Reservation>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {RESERVATION_COLUMNS}
        FROM usage_reservations
        WHERE status = 'held' AND created_at < $1
        ORDER BY created_at ASC
        "#
    ))
    .bind(before)
    .fetch_all(pool)
    .await?;

    rows.iter().map(reservation_from_row).collect()
}

/// Read-only usage projection for one agency and month.
pub async fn usage_summary(
    pool: &PgPool,
    agency_id: &str,
    month_key: &str,
) -> Result<UsageSummary, LedgerError> {
    let account = sqlx::query(
        r#"
        SELECT agency_id, plan_tier, included_limit_override, addon_balance
        FROM agency_accounts
        WHERE agency_id = $1
        "#,
    )
    .bind(agency_id)
    .fetch_optional(pool)
    .await?
    .as_ref()
    .map(account_from_row)
    .transpose()?
    .ok_or_else(|| LedgerError::UnknownAgency(agency_id.to_string()))?;

    let usage = sqlx::query(
        r#"
        SELECT included_used, addon_used, stage1_used, stage2_used
        FROM monthly_usage
        WHERE agency_id = $1 AND month_key = $2
        "#,
    )
    .bind(agency_id)
    .bind(month_key)
    .fetch_optional(pool)
    .await?
    .as_ref()
    .map(usage_from_row)
    .transpose()?
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
