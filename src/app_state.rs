use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{
    ledger::PgUsageLedger, queue::JobQueue, store::PgJobStore, submission::JobService,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<JobQueue>,
    pub jobs: JobService,
}

impl AppState {
    pub fn new(db: PgPool, queue: JobQueue) -> Self {
        let queue = Arc::new(queue);
        let jobs = JobService::new(
            Arc::new(PgJobStore::new(db.clone())),
            Arc::new(PgUsageLedger::new(db.clone())),
            queue.clone(),
            Arc::new(queue.cancellation_flags()),
        );
        Self { db, queue, jobs }
    }
}
