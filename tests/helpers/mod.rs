//! In-memory pipeline harness for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use realenhance_pipeline::models::enhancement::{SubmitJobRequest, SubmitJobResponse};
use realenhance_pipeline::models::job::{RequestedStages, SceneType, StageId};
use realenhance_pipeline::models::reservation::AgencyAccount;
use realenhance_pipeline::services::ledger::InMemoryUsageLedger;
use realenhance_pipeline::services::pipeline::{JobOutcome, Pipeline, PipelineConfig};
use realenhance_pipeline::services::provider::{EnhancementProvider, ProviderError, StageRequest};
use realenhance_pipeline::services::queue::{
    CancellationFlags, InMemoryCancellationFlags, InMemoryJobQueue, JobDispatch,
};
use realenhance_pipeline::services::storage::{ImageStore, InMemoryImageStore};
use realenhance_pipeline::services::store::InMemoryJobStore;
use realenhance_pipeline::services::submission::JobService;

use crate::fixtures;

pub const SOURCE_KEY: &str = "originals/living-room.png";

/// What the scripted model does for one call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return the input unchanged.
    Echo,
    /// Return fixed bytes.
    Respond(Vec<u8>),
    /// Fail with an HTTP status.
    Fail(u16),
    /// Return the input and flag the job for cancellation.
    EchoAndCancel,
    /// Return the input once the gate is opened.
    EchoAfter(Arc<tokio::sync::Notify>),
}

/// Provider that plays back scripted steps per stage; `Echo` once a script runs out.
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<StageId, VecDeque<Step>>>,
    calls: Mutex<Vec<StageRequest>>,
    cancellation: Arc<InMemoryCancellationFlags>,
}

impl ScriptedProvider {
    pub fn new(cancellation: Arc<InMemoryCancellationFlags>) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            cancellation,
        }
    }

    pub fn script(&self, stage: StageId, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .extend(steps);
    }

    pub fn calls(&self, stage: StageId) -> Vec<StageRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.stage == stage)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EnhancementProvider for ScriptedProvider {
    async fn transform(&self, request: &StageRequest) -> Result<Vec<u8>, ProviderError> {
        self.calls.lock().unwrap().push(request.clone());
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.stage)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Echo);

        match step {
            Step::Echo => Ok(request.image.clone()),
            Step::Respond(bytes) => Ok(bytes),
            Step::Fail(status) => Err(ProviderError::Api {
                status,
                message: "scripted failure".to_string(),
            }),
            Step::EchoAndCancel => {
                self.cancellation
                    .request_cancel(request.job_id)
                    .await
                    .expect("cancel flag");
                Ok(request.image.clone())
            }
            Step::EchoAfter(gate) => {
                gate.notified().await;
                Ok(request.image.clone())
            }
        }
    }
}

/// Every adapter in memory, wired the way the worker and API wire them.
pub struct Harness {
    pub store: Arc<InMemoryJobStore>,
    pub ledger: Arc<InMemoryUsageLedger>,
    pub images: Arc<InMemoryImageStore>,
    pub provider: Arc<ScriptedProvider>,
    pub flags: Arc<InMemoryCancellationFlags>,
    pub queue: Arc<InMemoryJobQueue>,
    pub pipeline: Pipeline,
    pub jobs: JobService,
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        retry_backoff: Duration::from_millis(1),
        provider_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    }
}

impl Harness {
    pub async fn new(account: AgencyAccount) -> Self {
        Self::with_config(account, test_config()).await
    }

    pub async fn with_config(account: AgencyAccount, config: PipelineConfig) -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        let ledger = Arc::new(InMemoryUsageLedger::with_accounts([account]));
        let images = Arc::new(InMemoryImageStore::new());
        let flags = Arc::new(InMemoryCancellationFlags::new());
        let provider = Arc::new(ScriptedProvider::new(flags.clone()));
        let queue = Arc::new(InMemoryJobQueue::new());

        images
            .put(SOURCE_KEY, &fixtures::room_png(), "image/png")
            .await
            .expect("seed source image");

        let pipeline = Pipeline::new(
            store.clone(),
            ledger.clone(),
            images.clone(),
            provider.clone(),
            flags.clone(),
            config,
        );
        let jobs = JobService::new(store.clone(), ledger.clone(), queue.clone(), flags.clone());

        Self {
            store,
            ledger,
            images,
            provider,
            flags,
            queue,
            pipeline,
            jobs,
        }
    }

    pub async fn submit(&self, request: SubmitJobRequest) -> SubmitJobResponse {
        self.jobs.submit(request).await.expect("submit failed")
    }

    /// Dequeue and run the next job the way the worker does.
    pub async fn run_next(&self) -> JobOutcome {
        let queued = self
            .queue
            .dequeue()
            .await
            .expect("dequeue failed")
            .expect("queue is empty");
        let outcome = self.pipeline.run(queued.job_id).await.expect("run failed");
        self.queue.complete(&queued).await.expect("complete failed");
        outcome
    }
}

pub fn request(declutter: bool, staging: bool, scene: SceneType, room: Option<&str>) -> SubmitJobRequest {
    SubmitJobRequest {
        job_id: Uuid::new_v4(),
        user_id: "user-7".to_string(),
        agency_id: fixtures::AGENCY.to_string(),
        image_id: SOURCE_KEY.to_string(),
        requested_stages: RequestedStages { declutter, staging },
        scene: Some(scene),
        room_type: room.map(str::to_string),
        allow_enhance_only_fallback: false,
    }
}
