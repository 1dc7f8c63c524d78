use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{
    EnhancementJob, FailureReason, JobStatus, NewJob, PipelineState, RequestedStages, SceneType,
    StageId, StageOutputs,
};
use crate::models::stage::{AttemptOutcome, StageAttempt};

const JOB_COLUMNS: &str = "id, user_id, agency_id, image_id, run_declutter, run_staging, scene, \
     room_type, status, pipeline_state, output_1a, output_1b, output_2, error, created_at, updated_at";

/// Guard appended to every mutation: terminal jobs are immutable.
const NOT_TERMINAL: &str =
    "status NOT IN ('succeeded', 'failed', 'partially_succeeded', 'cancelled')";

fn decode<T: FromStr>(value: &str) -> Result<T, sqlx::Error>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    T::from_str(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn job_from_row(row: &PgRow) -> Result<EnhancementJob, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let state: String = row.try_get("pipeline_state")?;
    let scene: Option<String> = row.try_get("scene")?;
    let error: Option<String> = row.try_get("error")?;

    Ok(EnhancementJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        agency_id: row.try_get("agency_id")?,
        image_id: row.try_get("image_id")?,
        requested: RequestedStages {
            declutter: row.try_get("run_declutter")?,
            staging: row.try_get("run_staging")?,
        },
        scene: scene.as_deref().map(decode::<SceneType>).transpose()?,
        room_type: row.try_get("room_type")?,
        status: decode(&status)?,
        pipeline_state: decode(&state)?,
        outputs: StageOutputs {
            stage_1a: row.try_get("output_1a")?,
            stage_1b: row.try_get("output_1b")?,
            stage_2: row.try_get("output_2")?,
        },
        error: error.as_deref().map(decode::<FailureReason>).transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn output_column(stage: StageId) -> &'static str {
    match stage {
        StageId::Stage1A => "output_1a",
        StageId::Stage1B => "output_1b",
        StageId::Stage2 => "output_2",
    }
}

/// Insert a new queued job. Returns `None` if the id is already taken.
pub async fn create_job(pool: &PgPool, job: &NewJob) -> Result<Option<EnhancementJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO enhancement_jobs
            (id, user_id, agency_id, image_id, run_declutter, run_staging, scene, room_type,
             status, pipeline_state)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'queued', 'init')
        ON CONFLICT (id) DO NOTHING
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job.id)
    .bind(&job.user_id)
    .bind(&job.agency_id)
    .bind(&job.image_id)
    .bind(job.requested.declutter)
    .bind(job.requested.staging)
    .bind(job.scene.map(|s| s.to_string()))
    .bind(&job.room_type)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<EnhancementJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM enhancement_jobs WHERE id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Claim a queued job. Returns false if it is running elsewhere, terminal or missing.
pub async fn mark_processing(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE enhancement_jobs
        SET status = 'processing',
            processing_started_at = NOW(),
            heartbeat_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status = 'queued'
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Refresh the liveness timestamp of a running job.
pub async fn touch_heartbeat(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE enhancement_jobs SET heartbeat_at = NOW() WHERE id = $1 AND status = 'processing'",
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Update the orchestrator state of a running job.
pub async fn update_pipeline_state(
    pool: &PgPool,
    job_id: Uuid,
    state: PipelineState,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        r#"
        UPDATE enhancement_jobs
        SET pipeline_state = $2, updated_at = NOW()
        WHERE id = $1 AND {NOT_TERMINAL}
        "#
    ))
    .bind(job_id)
    .bind(state.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Record the accepted output of a stage.
pub async fn record_stage_output(
    pool: &PgPool,
    job_id: Uuid,
    stage: StageId,
    output_key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        r#"
        UPDATE enhancement_jobs
        SET {column} = $2, updated_at = NOW()
        WHERE id = $1 AND {NOT_TERMINAL}
        "#,
        column = output_column(stage)
    ))
    .bind(job_id)
    .bind(output_key)
    .execute(pool)
    .await?;

    Ok(())
}

/// Move a job to a terminal status. Returns false if it was already terminal.
pub async fn finish_job(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
    state: PipelineState,
    error: Option<FailureReason>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(&format!(
        r#"
        UPDATE enhancement_jobs
        SET status = $2,
            pipeline_state = $3,
            error = $4,
            processing_completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND {NOT_TERMINAL}
        "#
    ))
    .bind(job_id)
    .bind(status.to_string())
    .bind(state.to_string())
    .bind(error.map(|e| e.to_string()))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Apply a manual scene/room type correction to a job in flight.
pub async fn update_classification(
    pool: &PgPool,
    job_id: Uuid,
    scene: SceneType,
    room_type: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(&format!(
        r#"
        UPDATE enhancement_jobs
        SET scene = $2, room_type = $3, updated_at = NOW()
        WHERE id = $1 AND {NOT_TERMINAL}
        "#
    ))
    .bind(job_id)
    .bind(scene.to_string())
    .bind(room_type)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Append one attempt to a job's audit trail.
pub async fn insert_stage_attempt(pool: &PgPool, attempt: &StageAttempt) -> Result<(), sqlx::Error> {
    let validation = attempt
        .validation
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO stage_attempts (job_id, stage, attempt, outcome, validation, output_key, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(attempt.job_id)
    .bind(attempt.stage.to_string())
    .bind(attempt.attempt)
    .bind(attempt.outcome.to_string())
    .bind(validation)
    .bind(&attempt.output_key)
    .bind(attempt.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Attempt history of a job, oldest first.
pub async fn list_stage_attempts(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Vec<StageAttempt>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT job_id, stage, attempt, outcome, validation, output_key, created_at
        FROM stage_attempts
        WHERE job_id = $1
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| -> Result<StageAttempt, sqlx::Error> {
            let stage: String = r.try_get("stage")?;
            let outcome: String = r.try_get("outcome")?;
            let validation: Option<serde_json::Value> = r.try_get("validation")?;
            Ok(StageAttempt {
                job_id: r.try_get("job_id")?,
                stage: decode::<StageId>(&stage)?,
                attempt: r.try_get("attempt")?,
                outcome: decode::<AttemptOutcome>(&outcome)?,
                validation: validation
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
                output_key: r.try_get("output_key")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .collect()
}

/// Reset jobs left `processing` by a worker that died, so they can be re-queued.
pub async fn reset_stale_processing(
    pool: &PgPool,
    heartbeat_before: DateTime<Utc>,
) -> Result<Vec<EnhancementJob>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        UPDATE enhancement_jobs
        SET status = 'queued', updated_at = NOW()
        WHERE status = 'processing'
          AND COALESCE(heartbeat_at, processing_started_at) < $1
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(heartbeat_before)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}
