//! Calendar-page ingestion source.
//!
//! The calendar page lists premieres as the children of `main section`:
//! an `h6` date header followed by one `a` card per entry. Each card holds
//! an `h3` title, an `h5` kind, a `p` description, the platform logo as
//! the first `img` (its `alt` is the platform name) and an optional poster
//! as the second `img`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, instrument};
use url::Url;

use streamdigest_shared::{DateRange, DigestError, RawRecord, Result, SourceConfig};

use crate::source::IngestionSource;

/// User-Agent string for calendar requests.
const USER_AGENT: &str = concat!("StreamDigest/", env!("CARGO_PKG_VERSION"));

/// Fetches and parses the streaming calendar page.
#[derive(Debug, Clone)]
pub struct CalendarSource {
    client: Client,
    url: Url,
}

impl CalendarSource {
    /// Create a source for the configured calendar URL.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let url = Url::parse(&config.calendar_url).map_err(|e| {
            DigestError::config(format!("invalid calendar_url '{}': {e}", config.calendar_url))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DigestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl IngestionSource for CalendarSource {
    fn name(&self) -> &str {
        "calendar"
    }

    #[instrument(skip_all, fields(url = %self.url, range = %range))]
    async fn fetch(&self, range: &DateRange) -> Result<Vec<RawRecord>> {
        debug!("fetching calendar page");

        let response = self
            .client
            .get(self.url.as_str())
            .send()
            .await
            .map_err(|e| DigestError::SourceUnavailable(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DigestError::SourceUnavailable(format!(
                "{}: HTTP {status}",
                self.url
            )));
        }

        let body = response.text().await.map_err(|e| {
            DigestError::SourceUnavailable(format!("{}: body read failed: {e}", self.url))
        })?;

        let records = parse_calendar(&body, &self.url)?;
        info!(records = records.len(), "parsed calendar page");
        Ok(records)
    }
}

fn selector(css: &'static str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| DigestError::parse(format!("invalid selector {css}: {e}")))
}

/// Extract raw records from a calendar page.
///
/// Cards appearing before the first date header are ignored.
pub fn parse_calendar(html: &str, base_url: &Url) -> Result<Vec<RawRecord>> {
    let doc = Html::parse_document(html);
    let section_sel = selector("main section")?;
    let title_sel = selector("h3")?;
    let kind_sel = selector("h5")?;
    let desc_sel = selector("p")?;
    let img_sel = selector("img")?;

    let section = doc
        .select(&section_sel)
        .next()
        .ok_or_else(|| DigestError::parse("calendar page has no `main section`"))?;

    let mut records = Vec::new();
    let mut current_date: Option<String> = None;

    for child in section.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "h6" => current_date = non_empty(text_of(child)),
            "a" => {
                let Some(date) = current_date.clone() else {
                    continue;
                };
                let first_text = |sel: &Selector| child.select(sel).next().map(text_of);
                let mut images = child.select(&img_sel);
                let logo = images.next();
                let poster = images.next();

                records.push(RawRecord {
                    title: first_text(&title_sel).and_then(non_empty),
                    date: Some(date),
                    kind: first_text(&kind_sel).and_then(non_empty),
                    description: first_text(&desc_sel).and_then(non_empty),
                    platform: logo
                        .and_then(|img| img.value().attr("alt"))
                        .map(str::to_string)
                        .and_then(non_empty),
                    platform_logo: logo.and_then(|img| absolute(img.value().attr("src"), base_url)),
                    image_url: poster.and_then(|img| absolute(img.value().attr("src"), base_url)),
                    link: absolute(child.value().attr("href"), base_url),
                    country: Some("US".into()),
                });
            }
            _ => {}
        }
    }

    Ok(records)
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn absolute(href: Option<&str>, base_url: &Url) -> Option<String> {
    let href = href?.trim();
    if href.is_empty() {
        return None;
    }
    base_url.join(href).ok().map(|u| u.to_string())
}
