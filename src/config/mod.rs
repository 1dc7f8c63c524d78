use std::time::Duration;

use serde::Deserialize;

use crate::models::validation::ValidationMode;
use crate::services::pipeline::PipelineConfig;
use crate::services::structural::ValidationConfig;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue and cancellation flags
    pub redis_url: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Structural attempts per stage
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Provider calls per attempt on transient errors
    #[serde(default = "default_provider_max_attempts")]
    pub provider_max_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Distinct non-fatal triggers that flag structural risk
    #[serde(default = "default_validation_min_signals")]
    pub validation_min_signals: usize,

    #[serde(default = "default_validation_mode")]
    pub validation_mode_stage1a: ValidationMode,

    #[serde(default = "default_validation_mode")]
    pub validation_mode_stage1b: ValidationMode,

    #[serde(default = "default_validation_mode")]
    pub validation_mode_stage2: ValidationMode,

    /// Jobs processed concurrently by one worker
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Age after which held reservations and `processing` jobs count as abandoned
    #[serde(default = "default_stale_job_secs")]
    pub stale_job_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_provider_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_provider_timeout_secs() -> u64 {
    120
}

fn default_validation_min_signals() -> usize {
    2
}

fn default_validation_mode() -> ValidationMode {
    ValidationMode::Block
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_stale_job_secs() -> u64 {
    30 * 60
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.check()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    fn check(&self) -> Result<(), ConfigError> {
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::Invalid("MAX_RETRY_ATTEMPTS must be at least 1".into()));
        }
        if self.provider_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "PROVIDER_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.validation_min_signals == 0 {
            return Err(ConfigError::Invalid(
                "VALIDATION_MIN_SIGNALS must be at least 1".into(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid("WORKER_CONCURRENCY must be at least 1".into()));
        }
        // A live job must never look abandoned to the reconcile sweep.
        let min_stale = self.pipeline_config().max_heartbeat_gap() * 2;
        if Duration::from_secs(self.stale_job_secs) < min_stale {
            return Err(ConfigError::Invalid(format!(
                "STALE_JOB_SECS must be at least {}s with PROVIDER_TIMEOUT_SECS={}",
                min_stale.as_secs(),
                self.provider_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn validation_config(&self) -> ValidationConfig {
        ValidationConfig {
            min_signals: self.validation_min_signals,
            stage_1a_mode: self.validation_mode_stage1a,
            stage_1b_mode: self.validation_mode_stage1b,
            stage_2_mode: self.validation_mode_stage2,
            ..ValidationConfig::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_retry_attempts: self.max_retry_attempts,
            provider_max_attempts: self.provider_max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            provider_timeout: Duration::from_secs(self.provider_timeout_secs),
            validation: self.validation_config(),
        }
    }

    pub fn stale_job_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_job_secs as i64)
    }
}
