use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use uuid::Uuid;

use crate::models::job::StageId;
use crate::services::retry::GenerationParams;

const IMG2IMG_MODEL: &str = "@cf/runwayml/stable-diffusion-v1-5-img2img";

/// One stage transformation request.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub job_id: Uuid,
    pub stage: StageId,
    pub image: Vec<u8>,
    pub room_type: Option<String>,
    pub generation: GenerationParams,
}

/// Generative image capability: image plus instructions in, image out.
#[async_trait]
pub trait EnhancementProvider: Send + Sync {
    async fn transform(&self, request: &StageRequest) -> Result<Vec<u8>, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider returned no usable image: {0}")]
    EmptyOutput(String),

    #[error("Provider misconfigured: {0}")]
    Misconfigured(String),
}

impl ProviderError {
    /// Whether a repeat call can be expected to succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::Timeout(_) | ProviderError::EmptyOutput(_) => {
                true
            }
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Misconfigured(_) => false,
        }
    }
}

fn instruction(stage: StageId, room_type: Option<&str>) -> String {
    match stage {
        StageId::Stage1A => {
            "Enhance this real estate photo: balanced exposure, neutral white balance, \
             crisp detail. Keep walls, windows, doors and fixtures exactly as they are."
                .to_string()
        }
        StageId::Stage1B => {
            "Remove clutter and personal items from this room. Keep the architecture, \
             built-in fixtures, windows and doors unchanged."
                .to_string()
        }
        StageId::Stage2 => format!(
            "Virtually stage this empty {} with tasteful modern furniture. Do not alter \
             walls, windows, doors, floors or ceiling.",
            room_type.unwrap_or("room")
        ),
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    errors: Vec<ApiErrorEntry>,
}

#[derive(Deserialize)]
struct ApiErrorEntry {
    message: String,
}

/// Client for Cloudflare Workers AI image-to-image models.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
}

impl WorkersAiClient {
    pub fn new(account_id: &str, api_token: &str) -> Result<Self, ProviderError> {
        if account_id.trim().is_empty() || api_token.trim().is_empty() {
            return Err(ProviderError::Misconfigured(
                "Cloudflare account id and API token are required".to_string(),
            ));
        }
        Ok(Self {
            http: Client::new(),
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
        })
    }
}

#[async_trait]
impl EnhancementProvider for WorkersAiClient {
    async fn transform(&self, request: &StageRequest) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{IMG2IMG_MODEL}",
            self.account_id
        );

        let body = serde_json::json!({
            "prompt": instruction(request.stage, request.room_type.as_deref()),
            "image_b64": base64::engine::general_purpose::STANDARD.encode(&request.image),
            "strength": request.generation.strength,
            "guidance": request.generation.guidance,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ApiErrorBody>()
                .await
                .ok()
                .and_then(|b| b.errors.into_iter().next())
                .map(|e| e.message)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ProviderError::Misconfigured(message));
            }
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(ProviderError::EmptyOutput(format!(
                "stage {} returned an empty body",
                request.stage
            )));
        }
        Ok(bytes.to_vec())
    }
}
