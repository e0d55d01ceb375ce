//! Shared types, error model, and configuration for StreamDigest.
//!
//! This crate is the foundation depended on by all other StreamDigest crates.
//! It provides:
//! - [`DigestError`] — the unified error type
//! - Domain types ([`ContentItem`], [`Candidate`], [`Stage`], [`SessionSnapshot`], ...)
//! - Configuration ([`AppConfig`], [`GenerationConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BannerConfig, BucketConfig, CacheConfig, DefaultsConfig, FiltersConfig,
    FluxConfig, GenerationConfig, GenerationSection, ImageFallback, IngestConfig, LengthBounds,
    OpenAiConfig, PlatformLink, RateLimitsConfig, RetryPolicy, ShortenerConfig, SourceConfig,
    add_platform, add_platform_to, api_key, config_dir, config_file_path, expand_home,
    init_config, load_config,
    load_config_from, lookup_website, validate_credentials,
};
pub use error::{BatchFailure, DigestError, FailureKind, Result, ServiceError};
pub use types::{
    ArtifactType, BannerArtifact, BatchRef, Candidate, CandidatePayload, ContentItem, DateRange,
    DocumentSection, GenerationRequest, GenerationStatus, MAX_DAYS_AHEAD, MAX_RANGE_DAYS,
    NewsletterDocument, Operation, Picks, PlatformGroup, PromptParams, RawRecord, SessionId,
    SessionSnapshot, Stage, dedupe_key,
};
