//! Shared HTTP plumbing: client construction and failure classification.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use streamdigest_shared::{DigestError, FailureKind, Result, ServiceError};

/// User-Agent string for service requests.
const USER_AGENT: &str = concat!("StreamDigest/", env!("CARGO_PKG_VERSION"));

/// Longest response excerpt carried in an error message.
const MAX_ERROR_BODY: usize = 200;

/// Build a reqwest client with appropriate settings.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(3))
        .timeout(timeout)
        .build()
        .map_err(|e| DigestError::Network(format!("failed to build HTTP client: {e}")))
}

/// Classify a non-success HTTP status.
pub(crate) fn classify_status(service: &str, status: StatusCode, body: &str) -> ServiceError {
    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureKind::InvalidCredentials,
        StatusCode::TOO_MANY_REQUESTS => FailureKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FailureKind::Timeout,
        s if s.is_server_error() => FailureKind::Transient,
        s if s.is_client_error() => FailureKind::MalformedPrompt,
        _ => FailureKind::Transient,
    };
    let excerpt: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
    ServiceError::new(service, kind, format!("HTTP {status}: {excerpt}"))
}

/// Classify a transport-level failure.
pub(crate) fn classify_transport(service: &str, err: &reqwest::Error) -> ServiceError {
    let kind = if err.is_timeout() {
        FailureKind::Timeout
    } else {
        FailureKind::Transient
    };
    ServiceError::new(service, kind, err.to_string())
}

/// Send a request, mapping transport failures and non-success statuses.
pub(crate) async fn send(
    service: &str,
    request: reqwest::RequestBuilder,
) -> std::result::Result<reqwest::Response, ServiceError> {
    let response = request
        .send()
        .await
        .map_err(|e| classify_transport(service, &e))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(service, status, &body))
}

/// An unusable successful response.
pub(crate) fn invalid_output(service: &str, message: impl Into<String>) -> ServiceError {
    ServiceError::new(service, FailureKind::InvalidOutput, message)
}
