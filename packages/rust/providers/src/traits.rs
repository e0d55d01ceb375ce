//! Capability traits for the external generative and link services.
//!
//! Each call produces exactly one result and fails with a classified
//! [`ServiceError`]; batching, retries and rate limiting live in the
//! orchestrator.

use async_trait::async_trait;
use streamdigest_shared::ServiceError;

/// One text completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One image generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub prompt: String,
    /// Varies output between candidates sharing a prompt.
    pub seed: u64,
    pub width: u32,
    pub height: u32,
}

/// Raw image bytes returned by an image service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Service name used in errors and rate-limit bookkeeping.
    fn service(&self) -> &str;

    async fn generate(&self, request: &TextRequest) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn service(&self) -> &str;

    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage, ServiceError>;
}

#[async_trait]
pub trait LinkShortener: Send + Sync {
    fn service(&self) -> &str;

    /// Return a short URL that redirects to `url`.
    async fn shorten(&self, url: &str) -> Result<String, ServiceError>;
}

/// Shortener used when no shortening service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughShortener;

#[async_trait]
impl LinkShortener for PassthroughShortener {
    fn service(&self) -> &str {
        "passthrough"
    }

    async fn shorten(&self, url: &str) -> Result<String, ServiceError> {
        Ok(url.to_string())
    }
}
