use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::enhancement::{
    ClassificationOverride, JobStatusResponse, RejectionReason, SubmitJobRequest,
    SubmitJobResponse,
};
use crate::services::ledger::LedgerError;
use crate::services::submission::SubmitError;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let status = match &self {
            SubmitError::Invalid(_) | SubmitError::InvalidMonth(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SubmitError::NotFound(_) | SubmitError::Ledger(LedgerError::UnknownAgency(_)) => {
                StatusCode::NOT_FOUND
            }
            SubmitError::Terminal(_) => StatusCode::CONFLICT,
            SubmitError::Store(_) | SubmitError::Ledger(_) | SubmitError::Queue(_) => {
                tracing::error!(error = %self, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

fn submission_status(response: &SubmitJobResponse) -> StatusCode {
    match response.reason {
        None => StatusCode::ACCEPTED,
        Some(RejectionReason::QuotaExhausted) => StatusCode::PAYMENT_REQUIRED,
        Some(RejectionReason::DuplicateJob) => StatusCode::CONFLICT,
        Some(RejectionReason::UnknownAgency) => StatusCode::NOT_FOUND,
        Some(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

/// POST /api/v1/jobs: reserve quota and queue an enhancement job.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), SubmitError> {
    let response = state.jobs.submit(request).await?;
    Ok((submission_status(&response), Json(response)))
}

/// GET /api/v1/jobs/{job_id}: job state and attempt history.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, SubmitError> {
    Ok(Json(state.jobs.status(job_id).await?))
}

/// POST /api/v1/jobs/{job_id}/cancel: request cooperative cancellation.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<StatusCode, SubmitError> {
    state.jobs.cancel(job_id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// PUT /api/v1/jobs/{job_id}/classification: correct scene and room type.
pub async fn update_classification(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(update): Json<ClassificationOverride>,
) -> Result<StatusCode, SubmitError> {
    state.jobs.update_classification(job_id, update).await?;
    Ok(StatusCode::NO_CONTENT)
}
