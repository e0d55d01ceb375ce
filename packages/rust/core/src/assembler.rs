//! Newsletter assembly.
//!
//! Turns a session's content entries and chosen candidates into an immutable
//! [`NewsletterDocument`], and writes finished documents to disk.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use streamdigest_ingest::escape_html;
use streamdigest_providers::LinkShortener;
use streamdigest_shared::{
    ArtifactType, BannerArtifact, Candidate, CandidatePayload, ContentItem, DateRange,
    DigestError, DocumentSection, NewsletterDocument, Operation, PlatformGroup, PlatformLink,
    Result, RetryPolicy, SessionId, Stage, lookup_website,
};
use streamdigest_storage::CacheStore;

use crate::ratelimit::TokenBucket;
use crate::retry::{RetryContext, with_retry};

/// Short links keyed by the long URL.
pub type LinkCache = CacheStore<String>;

/// Everything assembly reads from a session.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyInput<'a> {
    pub session_id: SessionId,
    pub range: &'a DateRange,
    pub items: &'a [ContentItem],
    pub tagline: Option<&'a Candidate>,
    pub intro: Option<&'a Candidate>,
    pub banner: Option<&'a Candidate>,
}

/// Link shortening for "Watch Now" buttons.
#[derive(Clone)]
pub struct LinkResolver {
    shortener: Arc<dyn LinkShortener>,
    bucket: Arc<TokenBucket>,
    cache: Arc<LinkCache>,
    ttl: Duration,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl LinkResolver {
    pub fn new(
        shortener: Arc<dyn LinkShortener>,
        bucket: Arc<TokenBucket>,
        cache: Arc<LinkCache>,
        ttl: Duration,
        policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            shortener,
            bucket,
            cache,
            ttl,
            policy,
            call_timeout,
        }
    }

    /// Short form of `url`, from cache when fresh. Falls back to `url`
    /// itself when the service fails.
    pub async fn resolve(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        if let Some(short) = self.cache.get_value(url) {
            return Ok(short);
        }

        let service = self.shortener.service().to_string();
        let ctx = RetryContext {
            service: &service,
            policy: &self.policy,
            bucket: &self.bucket,
            call_timeout: self.call_timeout,
            cancel,
            operation: Operation::Finalize,
        };
        match with_retry(ctx, |_| self.shortener.shorten(url)).await {
            Ok(short) => {
                self.cache.put(url, short.clone(), self.ttl);
                Ok(short)
            }
            Err(failure) if matches!(failure.error, DigestError::Cancelled { .. }) => {
                Err(failure.error)
            }
            Err(failure) => {
                warn!(url, error = %failure.error, "link shortening failed, using full URL");
                Ok(url.to_string())
            }
        }
    }
}

/// Builds newsletter documents.
#[derive(Clone)]
pub struct Assembler {
    platforms: Arc<Vec<PlatformLink>>,
    links: LinkResolver,
}

impl Assembler {
    pub fn new(platforms: Vec<PlatformLink>, links: LinkResolver) -> Self {
        Self {
            platforms: Arc::new(platforms),
            links,
        }
    }

    /// Assemble the document for a session at `BannerChosen`.
    ///
    /// The picks are validated independently of the stage machine; any
    /// problem is a `Finalization` error and nothing is produced.
    #[instrument(skip_all, fields(session = %input.session_id, items = input.items.len()))]
    pub async fn assemble(
        &self,
        input: AssemblyInput<'_>,
        cancel: &CancellationToken,
    ) -> Result<NewsletterDocument> {
        let tagline = chosen_text(input.tagline, ArtifactType::Tagline)?;
        let intro = chosen_text(input.intro, ArtifactType::Intro)?;
        let banner = chosen_banner(input.banner)?;

        // --- Phase 1: Watch links ---
        let mut websites: BTreeMap<String, Option<String>> = BTreeMap::new();
        for item in input.items {
            websites
                .entry(item.platform.clone())
                .or_insert_with(|| lookup_website(&self.platforms, &item.platform));
        }

        let mut watch_links: BTreeMap<String, String> = BTreeMap::new();
        let mut missing_platforms = Vec::new();
        for (platform, website) in &websites {
            match website {
                Some(url) => {
                    let link = self.links.resolve(url, cancel).await?;
                    watch_links.insert(platform.clone(), link);
                }
                None => {
                    warn!(%platform, "no website for platform");
                    missing_platforms.push(platform.clone());
                }
            }
        }

        // --- Phase 2: Sections ---
        let sections = group_items(input.items, &watch_links);

        // --- Phase 3: Render ---
        let title = format!("Streaming Updates for {}", input.range.start.format("%B %Y"));
        let html = render_html(&RenderContext {
            title: &title,
            intro: &intro,
            banner_file: &banner_file_name(&banner.media_type),
            sections: &sections,
            year: input.range.start.year(),
        });
        let id = document_id(&html, &banner.bytes);

        let document = NewsletterDocument {
            id,
            session_id: input.session_id,
            range: *input.range,
            title,
            tagline,
            intro,
            banner,
            sections,
            missing_platforms,
            html,
            created_at: Utc::now(),
        };
        info!(
            id = %document.id,
            sections = document.sections.len(),
            items = document.item_count(),
            missing = document.missing_platforms.len(),
            "document assembled"
        );
        Ok(document)
    }
}

fn finalization_error(message: String) -> DigestError {
    DigestError::Finalization {
        stage: Stage::BannerChosen,
        message,
    }
}

fn chosen_text(candidate: Option<&Candidate>, artifact: ArtifactType) -> Result<String> {
    let candidate =
        candidate.ok_or_else(|| finalization_error(format!("no {artifact} has been chosen")))?;
    if candidate.artifact != artifact {
        return Err(finalization_error(format!(
            "chosen {artifact} refers to a {} candidate",
            candidate.artifact
        )));
    }
    match candidate.payload.as_text() {
        Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
        _ => Err(finalization_error(format!(
            "chosen {artifact} #{} has no text",
            candidate.index
        ))),
    }
}

fn chosen_banner(candidate: Option<&Candidate>) -> Result<BannerArtifact> {
    let candidate =
        candidate.ok_or_else(|| finalization_error("no banner has been chosen".into()))?;
    match &candidate.payload {
        CandidatePayload::Image { media_type, bytes }
            if candidate.artifact == ArtifactType::Banner && !bytes.is_empty() =>
        {
            Ok(BannerArtifact {
                media_type: media_type.clone(),
                bytes: bytes.clone(),
            })
        }
        _ => Err(finalization_error(format!(
            "chosen banner #{} is not an image",
            candidate.index
        ))),
    }
}

/// Group sorted items by date, then platform in order of appearance.
fn group_items(items: &[ContentItem], watch_links: &BTreeMap<String, String>) -> Vec<DocumentSection> {
    let mut sections: Vec<DocumentSection> = Vec::new();
    for item in items {
        if sections.last().is_none_or(|s| s.date != item.date) {
            sections.push(DocumentSection {
                date: item.date,
                platforms: Vec::new(),
            });
        }
        let Some(section) = sections.last_mut() else {
            continue;
        };
        match section.platforms.iter_mut().find(|g| g.platform == item.platform) {
            Some(group) => group.items.push(item.clone()),
            None => section.platforms.push(PlatformGroup {
                platform: item.platform.clone(),
                watch_link: watch_links.get(&item.platform).cloned(),
                items: vec![item.clone()],
            }),
        }
    }
    sections
}

/// SHA-256 over the rendered HTML and the banner bytes.
pub fn document_id(html: &str, banner: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(html.as_bytes());
    hasher.update(banner);
    format!("{:x}", hasher.finalize())
}

fn banner_file_name(media_type: &str) -> String {
    format!("banner.{}", image_extension(media_type))
}

/// File extension for an image media type; unknown types are written as PNG.
pub fn image_extension(media_type: &str) -> &'static str {
    match media_type {
        "image/svg+xml" => "svg",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

// ---------------------------------------------------------------------------
// HTML
// ---------------------------------------------------------------------------

struct RenderContext<'a> {
    title: &'a str,
    intro: &'a str,
    banner_file: &'a str,
    sections: &'a [DocumentSection],
    year: i32,
}

fn render_html(ctx: &RenderContext<'_>) -> String {
    let sections: String = ctx.sections.iter().map(render_section).collect();
    format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{title}</title>
<style>
*, body {{ box-sizing: border-box; }}
@media only screen and (max-width: 600px) {{
  .movie-list {{ width: 100% !important; }}
  .movie-card {{ display: block !important; }}
  .movie-card img {{ width: 90% !important; height: auto !important; margin-bottom: 15px !important; }}
  .movie-info {{ margin-left: 0 !important; }}
  .watch-now {{ width: 100% !important; font-size: 14px !important; }}
}}
</style>
</head>
<body>
<div class="email-container" style="max-width: 600px; margin: 30px auto; background: #ffffff; border-radius: 10px; overflow: hidden; box-shadow: 0 8px 20px rgba(0, 0, 0, 0.3);">
<div class="top-banner" style="position: relative; width: 100%; max-width: 600px; height: 0; padding-top: 59.17%; background-image: url('{banner}'); background-size: cover; background-position: center;"></div>
<div class="content" style="padding: 25px 20px; text-align: center;">
<p style="font-size: 16px; font-family: Helvetica, Arial, sans-serif; line-height: 1.8; color: #000; margin-bottom: 20px;">{intro}</p>
{sections}</div>
<div class="footer" style="background: #001219; color: #BEBEBE; text-align: center; padding: 20px; font-size: 12px;">
<p style="margin: 0;">&copy; {year} StreamDigest. All rights reserved.</p>
<p style="margin: 8px 0 0;"><a href="<%unsub%>" style="color: #BEBEBE;">Unsubscribe</a></p>
</div>
</div>
</body>
</html>
"##,
        title = escape_html(ctx.title),
        banner = escape_html(ctx.banner_file),
        intro = escape_html(ctx.intro),
        sections = sections,
        year = ctx.year,
    )
}

fn render_section(section: &DocumentSection) -> String {
    let header = section.date.format("%A, %B %d").to_string().to_uppercase();
    let rows: String = section
        .platforms
        .iter()
        .flat_map(|group| group.items.iter().map(move |item| render_item(item, group)))
        .collect();
    format!(
        r##"<div class="date-section" style="font-family: 'Helvetica Neue', Arial, sans-serif;">
<h3 style="margin: 0 0 1px; color: #3B108E; font-size: 20px; padding-bottom: 5px;">{header}</h3>
<table class="movie-list" border="0" cellspacing="0" cellpadding="10" width="100%" style="background-color: #fff; padding: 15px 0;">
<tbody>
{rows}</tbody>
</table>
</div>
"##
    )
}

/// Item text fields arrive escaped from ingestion; URLs and platform names
/// are escaped here.
fn render_item(item: &ContentItem, group: &PlatformGroup) -> String {
    let poster = item
        .image_url
        .as_deref()
        .map(|src| {
            format!(
                r#"<img src="{}" alt="{}" style="width: 180px; height: 120px; border-radius: 8px; object-fit: cover;">"#,
                escape_html(src),
                item.title
            )
        })
        .unwrap_or_default();
    let kind = item
        .kind
        .as_deref()
        .map(|k| format!(r#"<em style="font-size: 13px; color: #6d3db9;">{k}</em><br>"#))
        .unwrap_or_default();
    let description = item.description.as_deref().unwrap_or_default();
    let platform = escape_html(&group.platform);
    let logo = item
        .platform_logo
        .as_deref()
        .map(|src| {
            format!(
                r#"<img src="{}" alt="{platform} Logo" style="max-width: 50px; height: auto; margin-right: 10px; border-radius: 8px; vertical-align: middle;">"#,
                escape_html(src)
            )
        })
        .unwrap_or_default();
    let watch = escape_html(group.watch_link.as_deref().unwrap_or("#"));

    format!(
        r##"<tr style="background-color: #f3f1ff;">
<td class="movie-card" style="background-color: #f3f1ff; display: flex; align-items: center;">
{poster}
<div class="movie-info" style="margin: 0 15px; text-align: left;">
<strong style="font-family: Helvetica, Arial, sans-serif; font-size: 18px; color: #333;">{title}</strong><br>
{kind}<p style="font-size: 14px; font-family: Helvetica, Arial, sans-serif; line-height: 1.5; color: #333; text-align: justify;">{description}</p>
<div style="display: flex;">{logo}<span style="font-family: Helvetica, Arial, sans-serif; font-size: 14px; color: #555;">Available on: {platform}</span></div>
</div>
</td>
</tr>
<tr style="background: #f3f1ff;">
<td><a href="{watch}" class="watch-now" style="display: block; width: 100%; padding: 14px 20px; background-color: #6d3db9; color: white; text-decoration: none; text-align: center; font-size: 16px; font-weight: bold; border-radius: 30px;">Watch Now</a></td>
</tr>
<tr style="height: 15px;"></tr>
"##,
        title = item.title,
    )
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Metadata of one written file.
#[derive(Debug, Clone, Serialize)]
pub struct WrittenFile {
    pub filename: String,
    pub sha256: String,
    pub size_bytes: usize,
}

/// `document.json`: the document without its heavy payloads.
#[derive(Debug, Serialize)]
struct DocumentManifest<'a> {
    id: &'a str,
    session_id: SessionId,
    range: &'a DateRange,
    title: &'a str,
    tagline: &'a str,
    intro: &'a str,
    item_count: usize,
    missing_platforms: &'a [String],
    files: &'a [WrittenFile],
    created_at: chrono::DateTime<Utc>,
}

/// Write `newsletter.html`, the banner and `document.json` into
/// `out_dir/<session id>/`. Each file is written to a temp file first and
/// renamed into place.
#[instrument(skip_all, fields(id = %document.id, out_dir = %out_dir.display()))]
pub fn write_document(document: &NewsletterDocument, out_dir: &Path) -> Result<PathBuf> {
    let dir = out_dir.join(document.session_id.to_string());
    std::fs::create_dir_all(&dir).map_err(|e| DigestError::io(&dir, e))?;

    let banner_name = banner_file_name(&document.banner.media_type);
    let mut files = Vec::with_capacity(2);
    files.push(write_atomic(&dir, "newsletter.html", document.html.as_bytes())?);
    files.push(write_atomic(&dir, &banner_name, &document.banner.bytes)?);

    let manifest = DocumentManifest {
        id: &document.id,
        session_id: document.session_id,
        range: &document.range,
        title: &document.title,
        tagline: &document.tagline,
        intro: &document.intro,
        item_count: document.item_count(),
        missing_platforms: &document.missing_platforms,
        files: &files,
        created_at: document.created_at,
    };
    let json = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| DigestError::validation(format!("JSON serialization failed: {e}")))?;
    write_atomic(&dir, "document.json", &json)?;

    info!(path = %dir.display(), "document written");
    Ok(dir)
}

fn write_atomic(dir: &Path, filename: &str, content: &[u8]) -> Result<WrittenFile> {
    let target = dir.join(filename);
    let temp = dir.join(format!(".{filename}.tmp"));

    std::fs::write(&temp, content).map_err(|e| DigestError::io(&temp, e))?;
    std::fs::rename(&temp, &target).map_err(|e| DigestError::io(&target, e))?;

    let sha256 = format!("{:x}", Sha256::digest(content));
    debug!(file = %filename, size = content.len(), "wrote file");
    Ok(WrittenFile {
        filename: filename.to_string(),
        sha256,
        size_bytes: content.len(),
    })
}
