//! Application configuration for StreamDigest.
//!
//! User config lives at `~/.streamdigest/streamdigest.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DigestError, Result};
use crate::types::ArtifactType;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "streamdigest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".streamdigest";

// ---------------------------------------------------------------------------
// Config structs (matching streamdigest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Calendar source settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// OpenAI text generation settings.
    #[serde(default)]
    pub openai: OpenAiConfig,

    /// Flux image generation settings.
    #[serde(default)]
    pub flux: FluxConfig,

    /// Link shortening service.
    #[serde(default)]
    pub shortener: ShortenerConfig,

    /// Candidate batch settings.
    #[serde(default)]
    pub generation: GenerationSection,

    /// Retry/backoff policy for external calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Token buckets per external service.
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub banner: BannerConfig,

    /// Ingestion filtering policy.
    #[serde(default)]
    pub filters: FiltersConfig,

    /// Platform registry used for "Watch Now" links.
    #[serde(default = "default_platforms")]
    pub platforms: Vec<PlatformLink>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            source: SourceConfig::default(),
            openai: OpenAiConfig::default(),
            flux: FluxConfig::default(),
            shortener: ShortenerConfig::default(),
            generation: GenerationSection::default(),
            retry: RetryPolicy::default(),
            rate_limits: RateLimitsConfig::default(),
            cache: CacheConfig::default(),
            banner: BannerConfig::default(),
            filters: FiltersConfig::default(),
            platforms: default_platforms(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory finalized newsletters are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Directory holding the session database.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Whether sessions are persisted so they can be resumed.
    #[serde(default = "default_true")]
    pub persist_sessions: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            data_dir: default_data_dir(),
            persist_sessions: true,
        }
    }
}

fn default_output_dir() -> String {
    "~/streamdigest-newsletters".into()
}
fn default_data_dir() -> String {
    "~/.streamdigest/data".into()
}
fn default_true() -> bool {
    true
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Calendar page listing upcoming premieres.
    #[serde(default = "default_calendar_url")]
    pub calendar_url: String,

    /// HTTP timeout for one page fetch.
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            calendar_url: default_calendar_url(),
            timeout_secs: default_source_timeout(),
        }
    }
}

fn default_calendar_url() -> String {
    "https://www.tvinsider.com/shows/calendar/".into()
}
fn default_source_timeout() -> u64 {
    30
}

/// `[openai]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_openai_model")]
    pub model: String,

    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_openai_key_env(),
            model: default_openai_model(),
            base_url: default_openai_base_url(),
        }
    }
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_openai_model() -> String {
    "gpt-3.5-turbo".into()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".into()
}

/// `[flux]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxConfig {
    #[serde(default = "default_flux_key_env")]
    pub api_key_env: String,

    /// Submission endpoint.
    #[serde(default = "default_flux_url")]
    pub api_url: String,

    /// Delay between polls of a pending generation.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Polls before a pending generation counts as timed out.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl Default for FluxConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_flux_key_env(),
            api_url: default_flux_url(),
            poll_interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
        }
    }
}

fn default_flux_key_env() -> String {
    "FLUX_API_KEY".into()
}
fn default_flux_url() -> String {
    "https://api.flux.ai/v1/generate".into()
}
fn default_poll_interval() -> u64 {
    2000
}
fn default_max_polls() -> u32 {
    30
}

/// `[shortener]` section. Links are used as-is when no endpoint is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShortenerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// `[generation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSection {
    #[serde(default = "default_text_count")]
    pub tagline_count: usize,

    #[serde(default = "default_text_count")]
    pub intro_count: usize,

    #[serde(default = "default_banner_count")]
    pub banner_count: usize,

    /// Maximum in-flight external calls per batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Prompt template version; bump to invalidate cached batches.
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,

    /// Timeout for a single external call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_tagline_min")]
    pub tagline_min_len: usize,
    #[serde(default = "default_tagline_max")]
    pub tagline_max_len: usize,
    #[serde(default = "default_intro_min")]
    pub intro_min_len: usize,
    #[serde(default = "default_intro_max")]
    pub intro_max_len: usize,

    #[serde(default = "default_tagline_min_words")]
    pub tagline_min_words: usize,
    #[serde(default = "default_tagline_max_words")]
    pub tagline_max_words: usize,
    #[serde(default = "default_intro_min_words")]
    pub intro_min_words: usize,
    #[serde(default = "default_intro_max_words")]
    pub intro_max_words: usize,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            tagline_count: default_text_count(),
            intro_count: default_text_count(),
            banner_count: default_banner_count(),
            concurrency: default_concurrency(),
            prompt_version: default_prompt_version(),
            call_timeout_secs: default_call_timeout(),
            tagline_min_len: default_tagline_min(),
            tagline_max_len: default_tagline_max(),
            intro_min_len: default_intro_min(),
            intro_max_len: default_intro_max(),
            tagline_min_words: default_tagline_min_words(),
            tagline_max_words: default_tagline_max_words(),
            intro_min_words: default_intro_min_words(),
            intro_max_words: default_intro_max_words(),
        }
    }
}

fn default_text_count() -> usize {
    3
}
fn default_banner_count() -> usize {
    6
}
fn default_concurrency() -> usize {
    3
}
fn default_prompt_version() -> String {
    "v1".into()
}
fn default_call_timeout() -> u64 {
    60
}
fn default_tagline_min() -> usize {
    10
}
fn default_tagline_max() -> usize {
    80
}
fn default_intro_min() -> usize {
    80
}
fn default_intro_max() -> usize {
    320
}
fn default_tagline_min_words() -> usize {
    3
}
fn default_tagline_max_words() -> usize {
    8
}
fn default_intro_min_words() -> usize {
    15
}
fn default_intro_max_words() -> usize {
    50
}

/// `[retry]` section, also the runtime retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Upper bound of the random delay added to each backoff.
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter_ms: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    2000
}
fn default_max_delay() -> u64 {
    30_000
}
fn default_jitter() -> u64 {
    500
}

/// `[rate_limits.*]` tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_text_bucket")]
    pub text: BucketConfig,
    #[serde(default = "default_image_bucket")]
    pub image: BucketConfig,
    #[serde(default = "default_shortener_bucket")]
    pub shortener: BucketConfig,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            text: default_text_bucket(),
            image: default_image_bucket(),
            shortener: default_shortener_bucket(),
        }
    }
}

/// Token bucket parameters for one external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Burst size.
    pub capacity: u32,
    /// Tokens restored per minute.
    pub refill_per_minute: u32,
    /// How long `acquire` waits before giving up.
    pub max_wait_ms: u64,
}

impl BucketConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

fn default_text_bucket() -> BucketConfig {
    BucketConfig {
        capacity: 60,
        refill_per_minute: 60,
        max_wait_ms: 30_000,
    }
}
fn default_image_bucket() -> BucketConfig {
    BucketConfig {
        capacity: 10,
        refill_per_minute: 10,
        max_wait_ms: 60_000,
    }
}
fn default_shortener_bucket() -> BucketConfig {
    BucketConfig {
        capacity: 30,
        refill_per_minute: 30,
        max_wait_ms: 10_000,
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of cached content and links.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_ttl() -> u64 {
    900
}

/// What to do when the image service cannot produce a banner batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFallback {
    /// Surface the failure; the operator retries.
    #[default]
    Fail,
    /// Compose banners over the gradient background without a generated image.
    LocalBackground,
}

/// `[banner]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BannerConfig {
    #[serde(default = "default_banner_width")]
    pub width: u32,
    #[serde(default = "default_banner_height")]
    pub height: u32,
    #[serde(default)]
    pub on_image_failure: ImageFallback,
}

impl Default for BannerConfig {
    fn default() -> Self {
        Self {
            width: default_banner_width(),
            height: default_banner_height(),
            on_image_failure: ImageFallback::default(),
        }
    }
}

fn default_banner_width() -> u32 {
    600
}
fn default_banner_height() -> u32 {
    350
}

/// `[filters]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// Records mentioning any of these (case-insensitive) are dropped.
    #[serde(default = "default_excluded_keywords")]
    pub excluded_keywords: Vec<String>,

    /// Accept an empty ingestion result instead of failing.
    #[serde(default)]
    pub allow_empty: bool,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            excluded_keywords: default_excluded_keywords(),
            allow_empty: false,
        }
    }
}

fn default_excluded_keywords() -> Vec<String> {
    [
        "Sports",
        "VOD / Buy / Rent",
        "YouTube",
        "Fox Soccer Plus",
        "ESPN",
        "Gold Channel",
        "Baseball",
        "Cup",
        "Football",
        "Championship",
        "WWE",
        "NFL",
        "Tennis",
        "Formula 1",
        "NBA",
        "Apple TV+",
        "Soccer",
        "Boxing",
        "UFC",
        "MMA",
        "Golf",
        "Hockey",
        "Cricket",
        "Rugby",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// `[[platforms]]` entry. A platform without a website gets no watch link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformLink {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_country() -> String {
    "US".into()
}

fn default_platforms() -> Vec<PlatformLink> {
    [
        ("A&E", Some("aetv.com")),
        ("ABC", Some("abc.com")),
        ("Acorn", Some("acorn.tv")),
        ("AMC", Some("amc.com")),
        ("BET+", Some("bet.com")),
        ("Bravo", Some("bravotv.com")),
        ("BritBox", Some("britbox.com")),
        ("CBS", Some("cbs.com")),
        ("Disney Junior", None),
        ("Disney+", Some("disneyplus.com")),
        ("FOX", Some("fox.com")),
        ("Freeform", Some("freeform.com")),
        ("FX", None),
        ("Hallmark Channel", Some("hallmarkchannel.com")),
        ("HBO", Some("hbo.com")),
        ("Hulu", Some("hulu.com")),
        ("Lifetime", Some("mylifetime.com")),
        ("Max", Some("max.com")),
        ("MGM+", Some("mgmplus.com")),
        ("NBC", Some("nbc.com")),
        ("Netflix", Some("netflix.com")),
        ("Paramount+", Some("paramountplus.com")),
        ("PBS", Some("pbs.org")),
        ("Peacock", Some("peacocktv.com")),
        ("Prime Video", Some("primevideo.com")),
        ("Shudder", Some("shudder.com")),
        ("Starz", Some("starz.com")),
        ("The CW", Some("cwtv.com")),
        ("Tubi", Some("tubi.tv")),
    ]
    .into_iter()
    .map(|(name, website)| PlatformLink {
        name: name.into(),
        website: website.map(String::from),
        country: default_country(),
    })
    .collect()
}

impl AppConfig {
    /// Look up a platform's website by case-insensitive exact name.
    pub fn platform_website(&self, platform: &str) -> Option<String> {
        lookup_website(&self.platforms, platform)
    }
}

/// Find `platform` in a registry and return its website as an absolute URL.
pub fn lookup_website(platforms: &[PlatformLink], platform: &str) -> Option<String> {
    let wanted = platform.trim().to_lowercase();
    platforms
        .iter()
        .find(|p| p.name.to_lowercase() == wanted)
        .and_then(|p| p.website.as_deref())
        .filter(|w| !w.is_empty() && *w != "N/A")
        .map(|w| {
            if w.starts_with("http://") || w.starts_with("https://") {
                w.to_string()
            } else {
                format!("https://{w}")
            }
        })
}

// ---------------------------------------------------------------------------
// Runtime configs (derived from AppConfig)
// ---------------------------------------------------------------------------

/// Runtime ingestion settings.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub excluded_keywords: Vec<String>,
    pub allow_empty: bool,
    pub cache_ttl: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for IngestConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            excluded_keywords: config.filters.excluded_keywords.clone(),
            allow_empty: config.filters.allow_empty,
            cache_ttl: config.cache.ttl(),
        }
    }
}

/// Inclusive bounds on generated text, in characters or words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthBounds {
    pub min: usize,
    pub max: usize,
}

impl LengthBounds {
    pub fn contains(&self, len: usize) -> bool {
        self.min <= len && len <= self.max
    }
}

/// Runtime generation settings.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub tagline_count: usize,
    pub intro_count: usize,
    pub banner_count: usize,
    pub concurrency: usize,
    pub prompt_version: String,
    pub call_timeout: Duration,
    pub tagline_len: LengthBounds,
    pub intro_len: LengthBounds,
    pub tagline_words: LengthBounds,
    pub intro_words: LengthBounds,
    pub retry: RetryPolicy,
    pub banner_width: u32,
    pub banner_height: u32,
    pub on_image_failure: ImageFallback,
}

impl GenerationConfig {
    /// Candidates requested per batch of `artifact`.
    pub fn count_for(&self, artifact: ArtifactType) -> usize {
        match artifact {
            ArtifactType::Tagline => self.tagline_count,
            ArtifactType::Intro => self.intro_count,
            ArtifactType::Banner => self.banner_count,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for GenerationConfig {
    fn from(config: &AppConfig) -> Self {
        let g = &config.generation;
        Self {
            tagline_count: g.tagline_count,
            intro_count: g.intro_count,
            banner_count: g.banner_count,
            concurrency: g.concurrency.max(1),
            prompt_version: g.prompt_version.clone(),
            call_timeout: Duration::from_secs(g.call_timeout_secs),
            tagline_len: LengthBounds {
                min: g.tagline_min_len,
                max: g.tagline_max_len,
            },
            intro_len: LengthBounds {
                min: g.intro_min_len,
                max: g.intro_max_len,
            },
            tagline_words: LengthBounds {
                min: g.tagline_min_words,
                max: g.tagline_max_words,
            },
            intro_words: LengthBounds {
                min: g.intro_min_words,
                max: g.intro_max_words,
            },
            retry: config.retry.clone(),
            banner_width: config.banner.width,
            banner_height: config.banner.height,
            on_image_failure: config.banner.on_image_failure,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Get the path to the config directory (`~/.streamdigest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| DigestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.streamdigest/streamdigest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DigestError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DigestError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DigestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DigestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DigestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Add `link` to the `[[platforms]]` registry of the user's config file.
/// Returns `true` when the platform is new, `false` when it was updated.
pub fn add_platform(link: PlatformLink) -> Result<bool> {
    add_platform_to(&config_file_path()?, link)
}

/// Add or update a `[[platforms]]` entry in the config file at `path`,
/// matching names case-insensitively. A missing file starts from defaults.
pub fn add_platform_to(path: &Path, link: PlatformLink) -> Result<bool> {
    let mut config = if path.exists() {
        load_config_from(path)?
    } else {
        AppConfig::default()
    };

    let added = match config
        .platforms
        .iter_mut()
        .find(|p| p.name.eq_ignore_ascii_case(&link.name))
    {
        Some(existing) => {
            existing.website = link.website;
            existing.country = link.country;
            false
        }
        None => {
            config.platforms.push(link);
            true
        }
    };

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| DigestError::io(dir, e))?;
    }
    let content =
        toml::to_string_pretty(&config).map_err(|e| DigestError::config(e.to_string()))?;
    std::fs::write(path, content).map_err(|e| DigestError::io(path, e))?;
    tracing::info!(?path, added, "platform registry updated");

    Ok(added)
}

/// Read an API key from the env var named in config.
pub fn api_key(var_name: &str, service: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(DigestError::config(format!(
            "{service} API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Check that the API keys for the text and image services are set.
pub fn validate_credentials(config: &AppConfig) -> Result<()> {
    api_key(&config.openai.api_key_env, "OpenAI")?;
    api_key(&config.flux.api_key_env, "Flux")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("output_dir"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
        assert!(toml_str.contains("[[platforms]]"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.generation.tagline_count, 3);
        assert_eq!(parsed.generation.banner_count, 6);
        assert_eq!(parsed.retry, RetryPolicy::default());
        assert_eq!(parsed.platforms.len(), config.platforms.len());
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml_str = r#"
[defaults]
output_dir = "/tmp/newsletters"

[rate_limits.text]
capacity = 5
refill_per_minute = 5
max_wait_ms = 100

[banner]
on_image_failure = "local_background"

[[platforms]]
name = "Netflix"
website = "netflix.com"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.output_dir, "/tmp/newsletters");
        assert_eq!(config.rate_limits.text.capacity, 5);
        assert_eq!(config.rate_limits.image, default_image_bucket());
        assert_eq!(config.banner.on_image_failure, ImageFallback::LocalBackground);
        assert_eq!(config.platforms.len(), 1);
        assert_eq!(config.cache.ttl_secs, 900);
    }

    #[test]
    fn add_platform_appends_then_updates() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("nested").join(CONFIG_FILE_NAME);
        let defaults = AppConfig::default().platforms.len();

        let link = |website: &str, country: &str| PlatformLink {
            name: "Crunchyroll".into(),
            website: Some(website.into()),
            country: country.into(),
        };
        assert!(add_platform_to(&path, link("crunchyroll.com", "US")).expect("add"));
        let config = load_config_from(&path).expect("reload");
        assert_eq!(config.platforms.len(), defaults + 1);
        assert_eq!(
            lookup_website(&config.platforms, "crunchyroll").as_deref(),
            Some("https://crunchyroll.com")
        );

        let mut renamed = link("https://www.crunchyroll.com/ca", "CA");
        renamed.name = "CRUNCHYROLL".into();
        assert!(!add_platform_to(&path, renamed).expect("update"));
        let config = load_config_from(&path).expect("reload");
        assert_eq!(config.platforms.len(), defaults + 1);
        let entry = config
            .platforms
            .iter()
            .find(|p| p.name == "Crunchyroll")
            .expect("entry kept its name");
        assert_eq!(entry.website.as_deref(), Some("https://www.crunchyroll.com/ca"));
        assert_eq!(entry.country, "CA");
    }

    #[test]
    fn platform_website_lookup() {
        let config = AppConfig::default();
        assert_eq!(
            config.platform_website("netflix").as_deref(),
            Some("https://netflix.com")
        );
        assert_eq!(config.platform_website("FX"), None);
        assert_eq!(config.platform_website("Unknown Network"), None);
    }

    #[test]
    fn retry_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
            jitter_ms: 0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }

    #[test]
    fn generation_config_from_app_config() {
        let app = AppConfig::default();
        let generation = GenerationConfig::from(&app);
        assert_eq!(generation.count_for(ArtifactType::Banner), 6);
        assert_eq!(generation.concurrency, 3);
        assert!(generation.tagline_len.contains(40));
        assert!(!generation.intro_len.contains(20));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openai.api_key_env = "SD_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_credentials(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
