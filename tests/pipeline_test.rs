//! Pipeline and billing scenarios against in-memory adapters
//!
//! Run with: cargo test --test pipeline_test

mod fixtures;
mod helpers;

use chrono::Utc;
use helpers::{request, test_config, Harness, Step};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use realenhance_pipeline::models::enhancement::{ClassificationOverride, RejectionReason};
use realenhance_pipeline::models::job::{
    FailureReason, JobStatus, PipelineState, SceneType, StageId,
};
use realenhance_pipeline::models::reservation::{month_key, ReservationStatus};
use realenhance_pipeline::models::stage::AttemptOutcome;
use realenhance_pipeline::models::validation::ValidationMode;
use realenhance_pipeline::services::ledger::UsageLedger;
use realenhance_pipeline::services::pipeline::{OrchestratorError, PipelineConfig};
use realenhance_pipeline::services::queue::{CancellationFlags, JobDispatch};
use realenhance_pipeline::services::store::JobStore;
use realenhance_pipeline::services::structural::ValidationConfig;
use realenhance_pipeline::services::submission::SubmitError;

fn this_month() -> String {
    month_key(Utc::now())
}

async fn wait_for_calls(h: &Harness, stage: StageId, n: usize) {
    for _ in 0..1000 {
        if h.provider.calls(stage).len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("provider never reached {n} calls for stage {stage}");
}

#[tokio::test]
async fn test_enhance_only_job_consumes_one_included_unit() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(false, false, SceneType::Interior, None);
    let job_id = req.job_id;

    let response = h.submit(req).await;
    assert!(response.accepted);
    assert_eq!(response.reason, None);
    assert_eq!(h.queue.depth().await.unwrap(), 1);

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.state, PipelineState::Complete);
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.finalize.status, ReservationStatus::Consumed);
    assert!(outcome.finalize.applied);

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(
        job.outputs.stage_1a.as_deref(),
        Some(format!("outputs/{job_id}/1a/attempt-0.png").as_str())
    );
    assert!(h.images.keys().unwrap().contains(&format!("outputs/{job_id}/1a/attempt-0.png")));

    let usage = h.ledger.usage(fixtures::AGENCY, &this_month()).unwrap();
    assert_eq!(usage.included_used, 1);
    assert_eq!(usage.addon_used, 0);
    assert_eq!(usage.stage1_used, 1);
    assert_eq!(usage.stage2_used, 0);
    assert_eq!(h.queue.in_flight().unwrap(), 0);
    assert!(h.provider.calls(StageId::Stage2).is_empty());
}

#[tokio::test]
async fn test_declutter_runs_inside_stage_one_billing() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(true, false, SceneType::Interior, Some("bedroom"));
    let job_id = req.job_id;
    h.submit(req).await;

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Succeeded);

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert!(job.outputs.stage_1a.is_some());
    assert!(job.outputs.stage_1b.is_some());
    assert_eq!(job.outputs.latest(), job.outputs.stage_1b.as_deref());

    let usage = h.ledger.usage(fixtures::AGENCY, &this_month()).unwrap();
    assert_eq!(usage.included_used, 1);
    assert_eq!(usage.stage1_used, 1);
}

#[tokio::test]
async fn test_exterior_staging_rejected_before_reservation() {
    let h = Harness::new(fixtures::account(5, 2)).await;
    let req = request(false, true, SceneType::Exterior, Some("living_room"));
    let job_id = req.job_id;

    let response = h.submit(req).await;
    assert!(!response.accepted);
    assert_eq!(response.reason, Some(RejectionReason::ExteriorBlocked));

    assert!(h.ledger.reservation(job_id).await.unwrap().is_none());
    assert!(h.store.get_job(job_id).await.unwrap().is_none());
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(h.ledger.account(fixtures::AGENCY).unwrap().unwrap().addon_balance, 2);
}

#[tokio::test]
async fn test_unknown_scene_and_missing_room_rejected() {
    let h = Harness::new(fixtures::account(5, 0)).await;

    let response = h.submit(request(false, true, SceneType::Unknown, Some("bedroom"))).await;
    assert_eq!(
        response.reason,
        Some(RejectionReason::UnknownSceneRequiresConfirmation)
    );

    let response = h.submit(request(false, true, SceneType::Interior, Some("  "))).await;
    assert_eq!(response.reason, Some(RejectionReason::MissingRoomType));
}

#[tokio::test]
async fn test_exterior_fallback_enhances_only() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let mut req = request(false, true, SceneType::Exterior, None);
    req.allow_enhance_only_fallback = true;
    let job_id = req.job_id;

    let response = h.submit(req).await;
    assert!(response.accepted);
    assert_eq!(response.staging_skipped, Some(RejectionReason::ExteriorBlocked));

    let reservation = h.ledger.reservation(job_id).await.unwrap().unwrap();
    assert!(!reservation.stage2_requested);
    assert_eq!(reservation.reserved_included, 1);

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.finalize.status, ReservationStatus::Consumed);
    assert!(h.provider.calls(StageId::Stage2).is_empty());
}

#[tokio::test]
async fn test_stage_two_exhaustion_partially_releases() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(false, true, SceneType::Interior, Some("living_room"));
    let job_id = req.job_id;
    h.submit(req).await;

    let moved = fixtures::moved_room_png();
    h.provider.script(
        StageId::Stage2,
        [
            Step::Respond(moved.clone()),
            Step::Respond(moved.clone()),
            Step::Respond(moved),
        ],
    );

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::PartiallySucceeded);
    assert_eq!(outcome.state, PipelineState::PartiallySucceeded);
    assert_eq!(outcome.error, Some(FailureReason::StructuralRiskExceeded));
    assert_eq!(outcome.settlement.stage1, Some(true));
    assert_eq!(outcome.settlement.stage2, Some(false));
    assert_eq!(outcome.finalize.status, ReservationStatus::PartiallyReleased);

    // Every blocked attempt is kept in the failure audit.
    assert_eq!(outcome.failures.len(), 3);
    assert!(outcome.failures.iter().all(|f| f.stage == StageId::Stage2
        && f.reason == FailureReason::StructuralRiskExceeded
        && f.detail.contains("edge_overlap")));

    let attempts: Vec<_> = h
        .store
        .attempts(job_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.stage == StageId::Stage2)
        .collect();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::StructuralRisk));
    assert_eq!(
        attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    // Each retry narrows the generation.
    let strengths: Vec<f32> = h
        .provider
        .calls(StageId::Stage2)
        .iter()
        .map(|c| c.generation.strength)
        .collect();
    assert_eq!(strengths.len(), 3);
    assert!(strengths.windows(2).all(|w| w[1] < w[0]));

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert!(job.outputs.stage_2.is_none());
    assert_eq!(job.outputs.latest(), job.outputs.stage_1a.as_deref());

    let usage = h.ledger.usage(fixtures::AGENCY, &this_month()).unwrap();
    assert_eq!(usage.included_used, 1);
    assert_eq!(usage.stage1_used, 1);
    assert_eq!(usage.stage2_used, 0);
}

#[tokio::test]
async fn test_failed_addon_stage_is_credited_back() {
    let h = Harness::new(fixtures::account(1, 1)).await;
    let req = request(false, true, SceneType::Interior, Some("kitchen"));
    let job_id = req.job_id;
    h.submit(req).await;

    let reservation = h.ledger.reservation(job_id).await.unwrap().unwrap();
    assert_eq!(reservation.reserved_included, 1);
    assert_eq!(reservation.reserved_addon, 1);
    assert_eq!(h.ledger.account(fixtures::AGENCY).unwrap().unwrap().addon_balance, 0);

    let moved = fixtures::moved_room_png();
    h.provider
        .script(StageId::Stage2, std::iter::repeat(Step::Respond(moved)).take(3));

    let outcome = h.run_next().await;
    assert_eq!(outcome.finalize.status, ReservationStatus::PartiallyReleased);

    let summary = h
        .jobs
        .usage_summary(fixtures::AGENCY, &this_month())
        .await
        .unwrap();
    assert_eq!(summary.included_used, 1);
    assert_eq!(summary.included_limit, 1);
    assert_eq!(summary.addon_remaining, 1);
    assert_eq!(summary.per_stage_counts.stage1, 1);
    assert_eq!(summary.per_stage_counts.stage2, 0);
}

#[tokio::test]
async fn test_structural_retries_back_off() {
    let config = PipelineConfig {
        retry_backoff: Duration::from_millis(150),
        ..test_config()
    };
    let h = Harness::with_config(fixtures::account(5, 0), config).await;
    h.submit(request(false, true, SceneType::Interior, Some("living_room")))
        .await;
    h.provider.script(
        StageId::Stage2,
        std::iter::repeat(Step::Respond(fixtures::moved_room_png())).take(3),
    );

    let started = Instant::now();
    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::PartiallySucceeded);
    assert_eq!(h.provider.calls(StageId::Stage2).len(), 3);
    // 150ms before the second attempt, 300ms before the third.
    assert!(
        started.elapsed() >= Duration::from_millis(450),
        "retries did not wait: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_declutter_exhaustion_keeps_stage_one_billed() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(true, true, SceneType::Interior, Some("bedroom"));
    let job_id = req.job_id;
    h.submit(req).await;
    h.provider.script(
        StageId::Stage1B,
        std::iter::repeat(Step::Respond(fixtures::moved_room_png())).take(3),
    );

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::PartiallySucceeded);
    assert_eq!(outcome.error, Some(FailureReason::StructuralRiskExceeded));
    assert_eq!(outcome.settlement.stage1, Some(true));
    assert_eq!(outcome.settlement.stage2, Some(false));
    assert_eq!(outcome.finalize.status, ReservationStatus::PartiallyReleased);
    assert_eq!(h.provider.calls(StageId::Stage1B).len(), 3);
    assert!(h.provider.calls(StageId::Stage2).is_empty());

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert!(job.outputs.stage_1a.is_some());
    assert!(job.outputs.stage_1b.is_none());

    let usage = h.ledger.usage(fixtures::AGENCY, &this_month()).unwrap();
    assert_eq!(usage.included_used, 1);
    assert_eq!(usage.stage1_used, 1);
    assert_eq!(usage.stage2_used, 0);
}

#[tokio::test]
async fn test_enhance_exhaustion_fails_and_refunds_addon() {
    let h = Harness::new(fixtures::account(1, 1)).await;
    let req = request(false, true, SceneType::Interior, Some("kitchen"));
    let job_id = req.job_id;
    h.submit(req).await;
    assert_eq!(h.ledger.account(fixtures::AGENCY).unwrap().unwrap().addon_balance, 0);
    h.provider.script(
        StageId::Stage1A,
        std::iter::repeat(Step::Respond(fixtures::moved_room_png())).take(3),
    );

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.state, PipelineState::Failed);
    assert_eq!(outcome.error, Some(FailureReason::StructuralRiskExceeded));
    assert_eq!(outcome.finalize.status, ReservationStatus::Released);
    assert!(h.provider.calls(StageId::Stage2).is_empty());

    let attempts = h.store.attempts(job_id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::StructuralRisk));

    let usage = h.ledger.usage(fixtures::AGENCY, &this_month()).unwrap();
    assert_eq!(usage.included_used, 0);
    assert_eq!(usage.addon_used, 0);
    assert_eq!(usage.stage1_used, 0);
    assert_eq!(h.ledger.account(fixtures::AGENCY).unwrap().unwrap().addon_balance, 1);
}

#[tokio::test]
async fn test_full_pipeline_consumes_addon_for_staging() {
    let h = Harness::new(fixtures::account(1, 1)).await;
    h.submit(request(true, true, SceneType::Interior, Some("living_room"))).await;

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.finalize.status, ReservationStatus::Consumed);

    let usage = h.ledger.usage(fixtures::AGENCY, &this_month()).unwrap();
    assert_eq!(usage.included_used, 1);
    assert_eq!(usage.addon_used, 1);
    assert_eq!(usage.stage2_used, 1);
    assert_eq!(h.ledger.account(fixtures::AGENCY).unwrap().unwrap().addon_balance, 0);

    let staged = h.provider.calls(StageId::Stage2);
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].room_type.as_deref(), Some("living_room"));
}

#[tokio::test]
async fn test_concurrent_submissions_race_for_last_addon_unit() {
    let h = Harness::new(fixtures::account(0, 1)).await;
    let first = request(false, false, SceneType::Interior, None);
    let second = request(false, false, SceneType::Interior, None);

    let (a, b) = futures::join!(h.jobs.submit(first), h.jobs.submit(second));
    let responses = [a.unwrap(), b.unwrap()];

    let accepted = responses.iter().filter(|r| r.accepted).count();
    assert_eq!(accepted, 1);
    assert!(responses
        .iter()
        .any(|r| r.reason == Some(RejectionReason::QuotaExhausted)));
    assert_eq!(h.ledger.account(fixtures::AGENCY).unwrap().unwrap().addon_balance, 0);
    assert_eq!(h.queue.depth().await.unwrap(), 1);
}

#[tokio::test]
async fn test_quota_is_all_or_nothing() {
    let h = Harness::new(fixtures::account(1, 0)).await;
    let req = request(false, true, SceneType::Interior, Some("bedroom"));
    let job_id = req.job_id;

    let response = h.submit(req).await;
    assert_eq!(response.reason, Some(RejectionReason::QuotaExhausted));
    assert!(h.ledger.reservation(job_id).await.unwrap().is_none());
    assert!(h.store.get_job(job_id).await.unwrap().is_none());

    // The single unit is still there for an enhance-only job.
    assert!(h.submit(request(false, false, SceneType::Interior, None)).await.accepted);
}

#[tokio::test]
async fn test_unknown_agency_and_duplicate_job_rejected() {
    let h = Harness::new(fixtures::account(5, 0)).await;

    let mut stranger = request(false, false, SceneType::Interior, None);
    stranger.agency_id = "agency-unknown".to_string();
    assert_eq!(
        h.submit(stranger).await.reason,
        Some(RejectionReason::UnknownAgency)
    );

    let req = request(false, false, SceneType::Interior, None);
    assert!(h.submit(req.clone()).await.accepted);
    assert_eq!(h.submit(req).await.reason, Some(RejectionReason::DuplicateJob));
    assert_eq!(h.queue.depth().await.unwrap(), 1);
}

#[tokio::test]
async fn test_resubmitted_job_is_duplicate_when_pool_spent() {
    let h = Harness::new(fixtures::account(1, 0)).await;
    let req = request(false, false, SceneType::Interior, None);
    assert!(h.submit(req.clone()).await.accepted);

    let again = h.submit(req).await;
    assert!(!again.accepted);
    assert_eq!(again.reason, Some(RejectionReason::DuplicateJob));
}

#[tokio::test]
async fn test_invalid_request_is_an_error() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let mut req = request(false, false, SceneType::Interior, None);
    req.user_id = String::new();
    let job_id = req.job_id;

    // Malformed input is an error, never a billing rejection.
    let result = h.jobs.submit(req).await;
    assert!(matches!(result, Err(SubmitError::Invalid(_))));
    assert!(h.ledger.reservation(job_id).await.unwrap().is_none());
    assert_eq!(h.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_finalize_is_idempotent_across_redelivery() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(false, false, SceneType::Interior, None);
    let job_id = req.job_id;
    h.submit(req).await;
    h.run_next().await;
    let before = h.ledger.usage(fixtures::AGENCY, &this_month()).unwrap();

    // A second delivery of a finished job only re-finalizes.
    let again = h.pipeline.run(job_id).await.unwrap();
    assert_eq!(again.status, JobStatus::Succeeded);
    assert!(!again.finalize.applied);
    assert_eq!(again.finalize.status, ReservationStatus::Consumed);

    let refinalized = h.pipeline.refinalize(job_id).await.unwrap();
    assert!(!refinalized.finalize.applied);

    assert_eq!(h.ledger.usage(fixtures::AGENCY, &this_month()).unwrap(), before);
    assert_eq!(h.provider.calls(StageId::Stage1A).len(), 1);
}

#[tokio::test]
async fn test_job_running_elsewhere_is_not_started_twice() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(false, false, SceneType::Interior, None);
    let job_id = req.job_id;
    h.submit(req).await;
    assert!(h.store.mark_processing(job_id).await.unwrap());

    let result = h.pipeline.run(job_id).await;
    assert!(matches!(result, Err(OrchestratorError::AlreadyRunning(id)) if id == job_id));
    assert!(h.provider.calls(StageId::Stage1A).is_empty());
    assert_eq!(
        h.ledger.reservation(job_id).await.unwrap().unwrap().status,
        ReservationStatus::Held
    );
}

#[tokio::test]
async fn test_cancel_before_start_releases_everything() {
    let h = Harness::new(fixtures::account(5, 1)).await;
    let req = request(false, true, SceneType::Interior, Some("bedroom"));
    let job_id = req.job_id;
    h.submit(req).await;

    h.jobs.cancel(job_id).await.unwrap();
    let outcome = h.run_next().await;

    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert_eq!(outcome.state, PipelineState::Failed);
    assert_eq!(outcome.error, Some(FailureReason::Cancelled));
    assert_eq!(outcome.finalize.status, ReservationStatus::Released);
    assert!(h.provider.calls(StageId::Stage1A).is_empty());
    assert!(!h.flags.is_cancelled(job_id).await.unwrap());

    let usage = h.ledger.usage(fixtures::AGENCY, &this_month()).unwrap();
    assert_eq!(usage.included_used, 0);

    // Terminal jobs cannot be cancelled again.
    assert!(matches!(
        h.jobs.cancel(job_id).await,
        Err(SubmitError::Terminal(_))
    ));
}

#[tokio::test]
async fn test_cancel_mid_run_keeps_accepted_output() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(true, true, SceneType::Interior, Some("bedroom"));
    let job_id = req.job_id;
    h.submit(req).await;
    h.provider.script(StageId::Stage1A, [Step::EchoAndCancel]);

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::PartiallySucceeded);
    assert_eq!(outcome.error, Some(FailureReason::Cancelled));
    assert_eq!(outcome.settlement.stage1, Some(true));
    assert_eq!(outcome.settlement.stage2, Some(false));
    assert_eq!(outcome.finalize.status, ReservationStatus::PartiallyReleased);

    assert!(h.provider.calls(StageId::Stage1B).is_empty());
    assert!(h.provider.calls(StageId::Stage2).is_empty());
    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert!(job.outputs.stage_1a.is_some());
}

#[tokio::test]
async fn test_classification_override_skips_stage_two() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(false, true, SceneType::Interior, Some("bedroom"));
    let job_id = req.job_id;
    h.submit(req).await;

    h.jobs
        .update_classification(
            job_id,
            ClassificationOverride {
                scene: SceneType::Exterior,
                room_type: None,
            },
        )
        .await
        .unwrap();

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.state, PipelineState::Complete);
    assert_eq!(outcome.settlement.stage2, Some(false));
    assert_eq!(outcome.finalize.status, ReservationStatus::PartiallyReleased);
    assert!(h.provider.calls(StageId::Stage2).is_empty());

    // No further corrections once terminal.
    let late = h
        .jobs
        .update_classification(
            job_id,
            ClassificationOverride {
                scene: SceneType::Interior,
                room_type: Some("bedroom".to_string()),
            },
        )
        .await;
    assert!(matches!(late, Err(SubmitError::Terminal(_))));
}

#[tokio::test]
async fn test_transient_provider_errors_are_retried() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(false, false, SceneType::Interior, None);
    let job_id = req.job_id;
    h.submit(req).await;
    h.provider
        .script(StageId::Stage1A, [Step::Fail(503), Step::Fail(429), Step::Echo]);

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(h.provider.calls(StageId::Stage1A).len(), 3);

    // Provider retries do not consume structural attempts.
    let attempts = h.store.attempts(job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Accepted);
}

#[tokio::test]
async fn test_provider_exhaustion_fails_and_releases() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(false, true, SceneType::Interior, Some("bedroom"));
    let job_id = req.job_id;
    h.submit(req).await;
    h.provider.script(
        StageId::Stage1A,
        [Step::Fail(502), Step::Fail(502), Step::Fail(502)],
    );

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.state, PipelineState::Failed);
    assert_eq!(outcome.error, Some(FailureReason::ProviderError));
    assert_eq!(outcome.finalize.status, ReservationStatus::Released);

    let attempts = h.store.attempts(job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::ProviderFailed);
    assert!(h.provider.calls(StageId::Stage2).is_empty());
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    h.submit(request(false, false, SceneType::Interior, None)).await;
    h.provider.script(StageId::Stage1A, [Step::Fail(400)]);

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(h.provider.calls(StageId::Stage1A).len(), 1);
}

#[tokio::test]
async fn test_undecodable_output_fails_stage() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    h.submit(request(false, false, SceneType::Interior, None)).await;
    h.provider
        .script(StageId::Stage1A, [Step::Respond(b"not an image".to_vec())]);

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.error, Some(FailureReason::ProviderError));
    assert_eq!(outcome.finalize.status, ReservationStatus::Released);
}

#[tokio::test]
async fn test_log_mode_accepts_risky_output() {
    let config = PipelineConfig {
        validation: ValidationConfig {
            stage_1a_mode: ValidationMode::Log,
            ..ValidationConfig::default()
        },
        ..helpers::test_config()
    };
    let h = Harness::with_config(fixtures::account(5, 0), config).await;
    let req = request(false, false, SceneType::Interior, None);
    let job_id = req.job_id;
    h.submit(req).await;
    h.provider
        .script(StageId::Stage1A, [Step::Respond(fixtures::moved_room_png())]);

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Succeeded);

    let attempts = h.store.attempts(job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Accepted);
    let validation = attempts[0].validation.as_ref().unwrap();
    assert!(validation.risk);
    assert_eq!(validation.mode, ValidationMode::Log);
}

#[tokio::test]
async fn test_status_reports_attempt_history() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(false, false, SceneType::Interior, None);
    let job_id = req.job_id;
    h.submit(req).await;

    let queued = h.jobs.status(job_id).await.unwrap();
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.state, PipelineState::Init);
    assert!(queued.attempts.is_empty());

    h.provider.script(
        StageId::Stage1A,
        [Step::Respond(fixtures::moved_room_png()), Step::Echo],
    );
    h.run_next().await;

    let done = h.jobs.status(job_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts.len(), 2);
    assert_eq!(done.attempts[0].outcome, AttemptOutcome::StructuralRisk);
    assert_eq!(done.attempts[1].outcome, AttemptOutcome::Accepted);
    assert_eq!(done.attempts[1].score, Some(1.0));
    assert_eq!(
        done.outputs.stage_1a.as_deref(),
        Some(format!("outputs/{job_id}/1a/attempt-1.png").as_str())
    );
}

#[tokio::test]
async fn test_reconcile_requeues_stale_jobs() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(false, false, SceneType::Interior, None);
    let job_id = req.job_id;
    h.submit(req).await;

    // Worker claims the job and dies.
    let lost = h.queue.dequeue().await.unwrap().unwrap();
    assert!(h.store.mark_processing(lost.job_id).await.unwrap());

    let report = h
        .jobs
        .reconcile(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.refinalized, 0);
    assert_eq!(h.queue.depth().await.unwrap(), 1);
    assert_eq!(
        h.store.get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Queued
    );

    let outcome = h.run_next().await;
    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.finalize.status, ReservationStatus::Consumed);
}

#[tokio::test]
async fn test_reconcile_leaves_live_jobs_running() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(true, false, SceneType::Interior, None);
    let job_id = req.job_id;
    h.submit(req).await;

    let enhance_gate = Arc::new(Notify::new());
    let declutter_gate = Arc::new(Notify::new());
    h.provider
        .script(StageId::Stage1A, [Step::EchoAfter(enhance_gate.clone())]);
    h.provider
        .script(StageId::Stage1B, [Step::EchoAfter(declutter_gate.clone())]);

    let queued = h.queue.dequeue().await.unwrap().unwrap();
    let pipeline = h.pipeline.clone();
    let worker = tokio::spawn(async move { pipeline.run(queued.job_id).await });

    wait_for_calls(&h, StageId::Stage1A, 1).await;
    let cutoff = Utc::now();
    tokio::time::sleep(Duration::from_millis(5)).await;
    enhance_gate.notify_one();
    wait_for_calls(&h, StageId::Stage1B, 1).await;

    // Claimed before the cutoff, but still beating.
    let report = h.jobs.reconcile(cutoff).await.unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(
        h.store.get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Processing
    );

    declutter_gate.notify_one();
    let outcome = worker.await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.finalize.status, ReservationStatus::Consumed);
    assert_eq!(h.provider.calls(StageId::Stage1A).len(), 1);
}

#[tokio::test]
async fn test_reconcile_settles_abandoned_reservations() {
    let h = Harness::new(fixtures::account(5, 0)).await;

    // Terminal job whose worker died before finalize.
    let req = request(false, false, SceneType::Interior, None);
    let finished_id = req.job_id;
    h.submit(req).await;
    h.store
        .record_output(finished_id, StageId::Stage1A, "outputs/x/1a/attempt-0.png")
        .await
        .unwrap();
    h.store
        .finish(
            finished_id,
            JobStatus::Succeeded,
            PipelineState::Complete,
            None,
        )
        .await
        .unwrap();

    // Reservation whose job was never created.
    let orphan = request(false, false, SceneType::Interior, None);
    h.ledger
        .reserve(&realenhance_pipeline::models::reservation::ReservationRequest {
            job_id: orphan.job_id,
            agency_id: orphan.agency_id.clone(),
            stages: orphan.requested_stages,
        })
        .await
        .unwrap();

    let report = h
        .jobs
        .reconcile(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.refinalized, 1);
    assert_eq!(report.released_orphans, 1);

    assert_eq!(
        h.ledger.reservation(finished_id).await.unwrap().unwrap().status,
        ReservationStatus::Consumed
    );
    assert_eq!(
        h.ledger.reservation(orphan.job_id).await.unwrap().unwrap().status,
        ReservationStatus::Released
    );

    // A second sweep finds nothing left to do.
    let again = h
        .jobs
        .reconcile(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(again.refinalized + again.released_orphans + again.requeued, 0);
}

#[tokio::test]
async fn test_abort_settles_from_persisted_outputs() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let req = request(false, true, SceneType::Interior, Some("bedroom"));
    let job_id = req.job_id;
    h.submit(req).await;
    assert!(h.store.mark_processing(job_id).await.unwrap());
    h.store
        .record_output(job_id, StageId::Stage1A, "outputs/x/1a/attempt-0.png")
        .await
        .unwrap();

    let outcome = h.pipeline.abort(job_id).await.unwrap();
    assert_eq!(outcome.status, JobStatus::PartiallySucceeded);
    assert_eq!(outcome.error, Some(FailureReason::InternalError));
    assert_eq!(outcome.finalize.status, ReservationStatus::PartiallyReleased);
}

#[tokio::test]
async fn test_usage_summary_rejects_bad_month() {
    let h = Harness::new(fixtures::account(5, 0)).await;
    let result = h.jobs.usage_summary(fixtures::AGENCY, "2026-13").await;
    assert!(matches!(result, Err(SubmitError::InvalidMonth(_))));

    let summary = h
        .jobs
        .usage_summary(fixtures::AGENCY, "2026-01")
        .await
        .unwrap();
    assert_eq!(summary.included_limit, 5);
    assert_eq!(summary.included_used, 0);
}
