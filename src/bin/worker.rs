use chrono::Utc;
use realenhance_pipeline::{
    config::AppConfig,
    db,
    services::{
        ledger::PgUsageLedger,
        pipeline::{OrchestratorError, Pipeline},
        provider::WorkersAiClient,
        queue::{JobDispatch, JobQueue, QueuedJob},
        storage::R2Client,
        store::PgJobStore,
        submission::JobService,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_MS: u64 = 1000; // 1 second
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting enhancement worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let r2_client = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");

    let queue = Arc::new(JobQueue::new(&config.redis_url).expect("Failed to initialize job queue"));
    let cancellation = Arc::new(queue.cancellation_flags());

    let provider = WorkersAiClient::new(&config.cf_account_id, &config.cf_api_token)
        .expect("Failed to initialize Workers AI client");

    let store = Arc::new(PgJobStore::new(db_pool.clone()));
    let ledger = Arc::new(PgUsageLedger::new(db_pool));

    let pipeline = Pipeline::new(
        store.clone(),
        ledger.clone(),
        Arc::new(r2_client),
        Arc::new(provider),
        cancellation.clone(),
        config.pipeline_config(),
    );
    let jobs = JobService::new(store, ledger, queue.clone(), cancellation);

    let stale_age = config.stale_job_age();
    reconcile(&jobs, stale_age).await;

    tracing::info!(
        concurrency = config.worker_concurrency,
        "Worker ready, starting job processing loop"
    );

    let permits = Arc::new(Semaphore::new(config.worker_concurrency));
    let mut last_reconcile = tokio::time::Instant::now();

    // Main processing loop
    loop {
        if last_reconcile.elapsed() >= RECONCILE_INTERVAL {
            reconcile(&jobs, stale_age).await;
            last_reconcile = tokio::time::Instant::now();
        }

        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        match queue.dequeue().await {
            Ok(Some(job)) => {
                let pipeline = pipeline.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    process_job(&pipeline, queue.as_ref(), job).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                // No job available, sleep before next poll
                drop(permit);
                tracing::trace!("No jobs available, sleeping");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                drop(permit);
                tracing::error!(error = %e, "Failed to dequeue job, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Settle reservations and jobs abandoned by a crashed worker.
async fn reconcile(jobs: &JobService, stale_age: chrono::Duration) {
    match jobs.reconcile(Utc::now() - stale_age).await {
        Ok(report) => tracing::info!(
            refinalized = report.refinalized,
            released_orphans = report.released_orphans,
            requeued = report.requeued,
            "Reconciliation complete"
        ),
        Err(e) => tracing::error!(error = %e, "Reconciliation failed"),
    }
}

/// Run one job in its own task so a panic cannot skip finalization.
async fn process_job(pipeline: &Pipeline, queue: &JobQueue, job: QueuedJob) {
    tracing::info!(job_id = %job.job_id, agency_id = %job.agency_id, "Processing enhancement job");

    let run = {
        let pipeline = pipeline.clone();
        let job_id = job.job_id;
        tokio::spawn(async move { pipeline.run(job_id).await })
    };

    let keep_in_flight = match run.await {
        Ok(Ok(outcome)) => {
            tracing::debug!(job_id = %job.job_id, status = %outcome.status, "Job done");
            false
        }
        Ok(Err(OrchestratorError::AlreadyRunning(job_id))) => {
            tracing::info!(job_id = %job_id, "Duplicate delivery dropped");
            false
        }
        Ok(Err(OrchestratorError::JobNotFound(job_id))) => {
            tracing::warn!(job_id = %job_id, "Queued job has no record, dropping");
            false
        }
        Ok(Err(e)) => {
            // The completion hook already ran or failed mid-way; recovery settles the rest.
            tracing::error!(job_id = %job.job_id, error = %e, "Job processing failed");
            abort(pipeline, &job).await
        }
        Err(join_error) => {
            tracing::error!(job_id = %job.job_id, error = %join_error, "Job task panicked");
            abort(pipeline, &job).await
        }
    };

    if keep_in_flight {
        return;
    }
    if let Err(e) = queue.complete(&job).await {
        tracing::error!(job_id = %job.job_id, error = %e, "Failed to remove job from in-flight list");
    }
}

/// Returns true when the job could not be settled and must stay in flight.
async fn abort(pipeline: &Pipeline, job: &QueuedJob) -> bool {
    match pipeline.abort(job.job_id).await {
        Ok(outcome) => {
            tracing::warn!(
                job_id = %job.job_id,
                status = %outcome.status,
                reservation = %outcome.finalize.status,
                "Job aborted and settled"
            );
            false
        }
        Err(e) => {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to settle aborted job");
            true
        }
    }
}
