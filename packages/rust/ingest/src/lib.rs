//! Content ingestion: sources, normalization, and the cache-first ingestor.
//!
//! This crate provides:
//! - [`IngestionSource`] — the capability trait for raw schedule records
//! - [`CalendarSource`] — scrapes the streaming calendar page
//! - [`Normalizer`] — validation, date parsing, filtering and dedupe
//! - [`Ingestor`] — cache-first ingestion keyed by date range

pub mod calendar;
pub mod ingestor;
pub mod normalize;
pub mod source;

pub use calendar::{CalendarSource, parse_calendar};
pub use ingestor::{CachedContent, ContentCache, IngestReport, Ingestor};
pub use normalize::{
    NormalizeOutcome, Normalizer, Rejection, canonical_platform, escape_html, parse_date,
};
pub use source::{IngestionSource, StaticSource};
