//! Flux image generator: submit, poll until ready, download.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use streamdigest_shared::{FailureKind, FluxConfig, Result, ServiceError, api_key};

use crate::http;
use crate::traits::{GeneratedImage, ImageGenerator, ImageRequest};

const SERVICE: &str = "flux";

/// Timeout for each individual HTTP request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    prompt: &'a str,
    width: u32,
    height: u32,
    steps: u32,
    guidance: f32,
    safety_tolerance: u32,
    seed: u64,
    output_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    polling_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    result: Option<PollResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollResult {
    #[serde(default)]
    sample: Option<String>,
}

/// Image generator backed by the Flux asynchronous API.
#[derive(Debug, Clone)]
pub struct FluxImageGenerator {
    client: Client,
    api_url: String,
    api_key: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl FluxImageGenerator {
    /// Create a generator from config, reading the key from the named env var.
    pub fn new(config: &FluxConfig) -> Result<Self> {
        let key = api_key(&config.api_key_env, "Flux")?;
        Self::with_api_key(config, key)
    }

    pub fn with_api_key(config: &FluxConfig, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: http::build_client(HTTP_TIMEOUT)?,
            api_url: config.api_url.clone(),
            api_key: api_key.into(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls.max(1),
        })
    }

    async fn submit(&self, request: &ImageRequest) -> std::result::Result<String, ServiceError> {
        let body = SubmitRequest {
            prompt: &request.prompt,
            width: request.width,
            height: request.height,
            steps: 28,
            guidance: 3.5,
            safety_tolerance: 2,
            seed: request.seed,
            output_format: "png",
        };

        let response = http::send(
            SERVICE,
            self.client
                .post(&self.api_url)
                .header("X-Key", &self.api_key)
                .json(&body),
        )
        .await?;

        let submitted: SubmitResponse = response
            .json()
            .await
            .map_err(|e| http::invalid_output(SERVICE, format!("unreadable submit response: {e}")))?;

        debug!(task_id = submitted.id.as_deref().unwrap_or("-"), "image task submitted");
        submitted
            .polling_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| http::invalid_output(SERVICE, "no polling_url in submit response"))
    }

    async fn poll(&self, polling_url: &str) -> std::result::Result<String, ServiceError> {
        for attempt in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let response = http::send(
                SERVICE,
                self.client.get(polling_url).header("X-Key", &self.api_key),
            )
            .await?;

            let polled: PollResponse = response
                .json()
                .await
                .map_err(|e| http::invalid_output(SERVICE, format!("unreadable poll response: {e}")))?;

            match polled.status.as_str() {
                "Ready" => {
                    return polled
                        .result
                        .and_then(|r| r.sample)
                        .ok_or_else(|| http::invalid_output(SERVICE, "ready without sample url"));
                }
                "Error" | "Failed" => {
                    return Err(ServiceError::new(
                        SERVICE,
                        FailureKind::Transient,
                        polled.error.unwrap_or_else(|| "generation failed".into()),
                    ));
                }
                "Content Moderated" | "Request Moderated" => {
                    return Err(ServiceError::new(
                        SERVICE,
                        FailureKind::MalformedPrompt,
                        format!("prompt rejected: {}", polled.status),
                    ));
                }
                status => debug!(attempt, status, "image not ready"),
            }
        }

        Err(ServiceError::new(
            SERVICE,
            FailureKind::Timeout,
            format!("image not ready after {} polls", self.max_polls),
        ))
    }

    async fn download(&self, url: &str) -> std::result::Result<GeneratedImage, ServiceError> {
        let response = http::send(SERVICE, self.client.get(url)).await?;
        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("image/"))
            .unwrap_or("image/png")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| http::classify_transport(SERVICE, &e))?;
        if bytes.is_empty() {
            return Err(http::invalid_output(SERVICE, "downloaded image is empty"));
        }
        Ok(GeneratedImage {
            media_type,
            bytes: bytes.to_vec(),
        })
    }
}

#[async_trait]
impl ImageGenerator for FluxImageGenerator {
    fn service(&self) -> &str {
        SERVICE
    }

    #[instrument(skip_all, fields(seed = request.seed))]
    async fn generate(
        &self,
        request: &ImageRequest,
    ) -> std::result::Result<GeneratedImage, ServiceError> {
        let polling_url = self.submit(request).await?;
        let sample_url = self.poll(&polling_url).await?;
        let image = self.download(&sample_url).await?;
        info!(bytes = image.bytes.len(), "image downloaded");
        Ok(image)
    }
}
