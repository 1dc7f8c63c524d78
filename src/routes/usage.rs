use axum::extract::{Path, State};
use axum::Json;

use crate::app_state::AppState;
use crate::models::reservation::UsageSummary;
use crate::services::submission::SubmitError;

/// GET /api/v1/agencies/{agency_id}/usage/{month_key}: quota consumption for a month.
pub async fn get_usage_summary(
    State(state): State<AppState>,
    Path((agency_id, month_key)): Path<(String, String)>,
) -> Result<Json<UsageSummary>, SubmitError> {
    Ok(Json(state.jobs.usage_summary(&agency_id, &month_key).await?))
}
