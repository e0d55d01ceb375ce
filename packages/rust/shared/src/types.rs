//! Core domain types for StreamDigest sessions, content and candidates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{DigestError, Result};

/// Longest allowed distance between the start and end of a range, in days.
pub const MAX_RANGE_DAYS: i64 = 30;

/// How far in the future a range may end, in days.
pub const MAX_DAYS_AHEAD: i64 = 90;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for session identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new time-sortable session identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// DateRange
// ---------------------------------------------------------------------------

/// An inclusive range of calendar dates covered by one digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Build a range, rejecting inverted ranges and spans over [`MAX_RANGE_DAYS`].
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(DigestError::validation(
                "start date must not be after end date",
            ));
        }
        if (end - start).num_days() > MAX_RANGE_DAYS {
            return Err(DigestError::validation(format!(
                "date range cannot exceed {MAX_RANGE_DAYS} days"
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse a range from two `YYYY-MM-DD` strings.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |s: &str| {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
                DigestError::validation(format!("invalid date '{s}', use YYYY-MM-DD"))
            })
        };
        Self::new(parse(start)?, parse(end)?)
    }

    /// Reject ranges ending more than [`MAX_DAYS_AHEAD`] days after `today`.
    pub fn check_horizon(&self, today: NaiveDate) -> Result<()> {
        if (self.end - today).num_days() > MAX_DAYS_AHEAD {
            return Err(DigestError::validation(format!(
                "end date cannot be more than {MAX_DAYS_AHEAD} days in the future"
            )));
        }
        Ok(())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Number of calendar days covered (inclusive).
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Cache key for ingested content of this range.
    pub fn cache_key(&self) -> String {
        format!("content:{self}")
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// A record as delivered by an ingestion source, before normalization.
///
/// Every field is optional; the normalizer decides what is malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// ISO date (`2024-01-02`) or a calendar header (`Tuesday, January 2`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// A canonical schedule entry (show or movie premiering on a platform).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub title: String,
    /// Air or release date.
    pub date: NaiveDate,
    /// Canonical platform name (`Netflix`, `Disney+`, ...).
    pub platform: String,
    /// Entry kind as shown by the source (`Series Premiere`, `Movie`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl ContentItem {
    /// Dedupe key over normalized (title, date, platform).
    pub fn dedupe_key(&self) -> String {
        dedupe_key(&self.title, self.date, &self.platform)
    }
}

/// Build the dedupe key for a (title, date, platform) triple.
pub fn dedupe_key(title: &str, date: NaiveDate, platform: &str) -> String {
    format!(
        "{}|{date}|{}",
        normalize_key_part(title),
        normalize_key_part(platform)
    )
}

fn normalize_key_part(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Artifacts and stages
// ---------------------------------------------------------------------------

/// The three kinds of generated content an operator picks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Tagline,
    Intro,
    Banner,
}

impl ArtifactType {
    /// All artifact types in workflow order.
    pub const ALL: [ArtifactType; 3] = [Self::Tagline, Self::Intro, Self::Banner];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tagline => "tagline",
            Self::Intro => "intro",
            Self::Banner => "banner",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tagline" => Ok(Self::Tagline),
            "intro" => Ok(Self::Intro),
            "banner" => Ok(Self::Banner),
            other => Err(DigestError::validation(format!(
                "unknown artifact type '{other}'"
            ))),
        }
    }
}

/// Workflow stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initialized,
    Scraped,
    TaglinesGenerated,
    TaglineChosen,
    IntrosGenerated,
    IntroChosen,
    BannersGenerated,
    BannerChosen,
    Assembled,
    Finalized,
    Aborted,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Scraped => "scraped",
            Self::TaglinesGenerated => "taglines_generated",
            Self::TaglineChosen => "tagline_chosen",
            Self::IntrosGenerated => "intros_generated",
            Self::IntroChosen => "intro_chosen",
            Self::BannersGenerated => "banners_generated",
            Self::BannerChosen => "banner_chosen",
            Self::Assembled => "assembled",
            Self::Finalized => "finalized",
            Self::Aborted => "aborted",
        }
    }

    /// `Finalized` and `Aborted` accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Aborted)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self> {
        let stage = match s {
            "initialized" => Self::Initialized,
            "scraped" => Self::Scraped,
            "taglines_generated" => Self::TaglinesGenerated,
            "tagline_chosen" => Self::TaglineChosen,
            "intros_generated" => Self::IntrosGenerated,
            "intro_chosen" => Self::IntroChosen,
            "banners_generated" => Self::BannersGenerated,
            "banner_chosen" => Self::BannerChosen,
            "assembled" => Self::Assembled,
            "finalized" => Self::Finalized,
            "aborted" => Self::Aborted,
            other => {
                return Err(DigestError::validation(format!("unknown stage '{other}'")));
            }
        };
        Ok(stage)
    }
}

/// A public pipeline operation, recorded in errors for caller context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    StartSession,
    Ingest,
    SelectContent,
    GenerateCandidates(ArtifactType),
    SelectCandidate(ArtifactType),
    Assemble,
    Finalize,
    Abort,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartSession => f.write_str("start_session"),
            Self::Ingest => f.write_str("ingest"),
            Self::SelectContent => f.write_str("select_content"),
            Self::GenerateCandidates(a) => write!(f, "generate_candidates({a})"),
            Self::SelectCandidate(a) => write!(f, "select_candidate({a})"),
            Self::Assemble => f.write_str("assemble"),
            Self::Finalize => f.write_str("finalize"),
            Self::Abort => f.write_str("abort"),
        }
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Prompt inputs for one generation batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptParams {
    /// System instruction for text services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// One prompt per candidate index. Text artifacts repeat the same prompt.
    pub prompts: Vec<String>,
    /// Prompt template version; part of the batch idempotence key.
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Succeeded,
    Failed,
}

/// A request for a fixed-size batch of candidates of one artifact type.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub artifact: ArtifactType,
    pub params: PromptParams,
    /// Exact number of candidates the batch must produce.
    pub count: usize,
    pub policy: RetryPolicy,
    pub status: GenerationStatus,
}

impl GenerationRequest {
    pub fn new(artifact: ArtifactType, params: PromptParams, count: usize, policy: RetryPolicy) -> Self {
        Self {
            artifact,
            params,
            count,
            policy,
            status: GenerationStatus::Pending,
        }
    }

    /// The prompt used for candidate `index`.
    pub fn prompt_for(&self, index: usize) -> &str {
        match self.params.prompts.len() {
            0 => "",
            n => &self.params.prompts[index % n],
        }
    }
}

/// Payload of a single generated candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidatePayload {
    Text { text: String },
    Image { media_type: String, bytes: Vec<u8> },
}

impl CandidatePayload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Image { .. } => None,
        }
    }

    pub fn as_image(&self) -> Option<(&str, &[u8])> {
        match self {
            Self::Image { media_type, bytes } => Some((media_type, bytes)),
            Self::Text { .. } => None,
        }
    }
}

/// One generated option within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub artifact: ArtifactType,
    /// 0-based position in request order.
    pub index: usize,
    pub payload: CandidatePayload,
    pub chosen: bool,
}

/// Reference to a generated batch, as persisted with the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchRef {
    pub artifact: ArtifactType,
    pub prompt_version: String,
}

/// Chosen candidate index per artifact type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Picks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tagline: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<usize>,
}

impl Picks {
    pub fn get(&self, artifact: ArtifactType) -> Option<usize> {
        match artifact {
            ArtifactType::Tagline => self.tagline,
            ArtifactType::Intro => self.intro,
            ArtifactType::Banner => self.banner,
        }
    }

    pub fn set(&mut self, artifact: ArtifactType, index: usize) {
        let slot = match artifact {
            ArtifactType::Tagline => &mut self.tagline,
            ArtifactType::Intro => &mut self.intro,
            ArtifactType::Banner => &mut self.banner,
        };
        *slot = Some(index);
    }
}

// ---------------------------------------------------------------------------
// SessionSnapshot
// ---------------------------------------------------------------------------

/// Persisted form of a session, sufficient to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub range: DateRange,
    pub stage: Stage,
    pub picks: Picks,
    /// Batches recorded against the session, in generation order.
    #[serde(default)]
    pub batches: Vec<BatchRef>,
    /// Normalized content entries (sorted, deduplicated).
    #[serde(default)]
    pub items: Vec<ContentItem>,
    /// Malformed records skipped during ingestion.
    #[serde(default)]
    pub skipped: usize,
    /// Indices into `items` chosen for the newsletter; `None` keeps every entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// NewsletterDocument
// ---------------------------------------------------------------------------

/// Content entries of one platform on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformGroup {
    pub platform: String,
    /// "Watch Now" link; `None` when the platform has no known website.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_link: Option<String>,
    pub items: Vec<ContentItem>,
}

/// All entries of one date, grouped by platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSection {
    pub date: NaiveDate,
    pub platforms: Vec<PlatformGroup>,
}

/// The chosen banner image embedded in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannerArtifact {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// The final newsletter. Created once, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsletterDocument {
    /// SHA-256 (hex) over the rendered content and banner bytes.
    pub id: String,
    pub session_id: SessionId,
    pub range: DateRange,
    pub title: String,
    pub tagline: String,
    pub intro: String,
    pub banner: BannerArtifact,
    pub sections: Vec<DocumentSection>,
    /// Platforms that appear in the document without a known website.
    #[serde(default)]
    pub missing_platforms: Vec<String>,
    pub html: String,
    pub created_at: DateTime<Utc>,
}

impl NewsletterDocument {
    /// Total number of content entries across all sections.
    pub fn item_count(&self) -> usize {
        self.sections
            .iter()
            .flat_map(|s| &s.platforms)
            .map(|p| p.items.len())
            .sum()
    }
}
