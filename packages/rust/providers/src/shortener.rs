//! HTTP link shortener: `GET {endpoint}?url={long_url}` returns the short URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

use streamdigest_shared::{DigestError, Result, ServiceError};

use crate::http;
use crate::traits::LinkShortener;

const SERVICE: &str = "shortener";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpLinkShortener {
    client: Client,
    endpoint: Url,
}

impl HttpLinkShortener {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            DigestError::config(format!("invalid shortener endpoint '{endpoint}': {e}"))
        })?;
        Ok(Self {
            client: http::build_client(HTTP_TIMEOUT)?,
            endpoint,
        })
    }
}

#[async_trait]
impl LinkShortener for HttpLinkShortener {
    fn service(&self) -> &str {
        SERVICE
    }

    async fn shorten(&self, url: &str) -> std::result::Result<String, ServiceError> {
        let response = http::send(
            SERVICE,
            self.client.get(self.endpoint.clone()).query(&[("url", url)]),
        )
        .await?;

        let body = response
            .text()
            .await
            .map_err(|e| http::classify_transport(SERVICE, &e))?;
        let short = body.trim();

        let is_web_url = Url::parse(short)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !is_web_url {
            return Err(http::invalid_output(
                SERVICE,
                format!("not a URL: {}", short.chars().take(80).collect::<String>()),
            ));
        }
        debug!(url, short, "link shortened");
        Ok(short.to_string())
    }
}
