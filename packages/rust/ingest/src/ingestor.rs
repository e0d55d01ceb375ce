//! Cache-first ingestion of content entries for a date range.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use streamdigest_shared::{ContentItem, DateRange, DigestError, IngestConfig, Result};
use streamdigest_storage::CacheStore;

use crate::normalize::Normalizer;
use crate::source::IngestionSource;

/// Normalized content as stored in the content cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContent {
    pub items: Vec<ContentItem>,
    pub skipped: usize,
    pub filtered: usize,
}

/// Shared cache of normalized content keyed by date range.
pub type ContentCache = CacheStore<CachedContent>;

/// Outcome of one ingestion call.
#[derive(Debug, Clone)]
pub struct IngestReport {
    /// Sorted, deduplicated entries.
    pub items: Vec<ContentItem>,
    /// Malformed records skipped.
    pub skipped: usize,
    /// Records dropped by range or keyword policy.
    pub filtered: usize,
    /// Messages for skipped records. Empty when served from cache.
    pub warnings: Vec<String>,
    pub from_cache: bool,
}

/// Fetches, normalizes and caches content entries.
pub struct Ingestor {
    source: Arc<dyn IngestionSource>,
    cache: Arc<ContentCache>,
    normalizer: Normalizer,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(
        source: Arc<dyn IngestionSource>,
        cache: Arc<ContentCache>,
        config: IngestConfig,
    ) -> Self {
        Self {
            source,
            cache,
            normalizer: Normalizer::new(&config.excluded_keywords),
            config,
        }
    }

    /// Produce the content entries for `range`, from cache when fresh.
    ///
    /// Fails with `SourceUnavailable` when the source is unreachable and
    /// with `Ingestion` when nothing usable remains (unless empty results
    /// are allowed). Empty results are never cached.
    #[instrument(skip_all, fields(range = %range, source = self.source.name()))]
    pub async fn ingest(&self, range: &DateRange) -> Result<IngestReport> {
        let key = range.cache_key();
        if let Some(entry) = self.cache.get(&key) {
            info!(items = entry.value.items.len(), "content served from cache");
            return Ok(IngestReport {
                items: entry.value.items.clone(),
                skipped: entry.value.skipped,
                filtered: entry.value.filtered,
                warnings: Vec::new(),
                from_cache: true,
            });
        }

        let records = self.source.fetch(range).await?;
        let fetched = records.len();
        let outcome = self.normalizer.normalize(range, records);

        for warning in &outcome.warnings {
            warn!(%warning, "malformed record");
        }

        if outcome.items.is_empty() && !self.config.allow_empty {
            return Err(DigestError::ingestion(format!(
                "no content entries for {range} ({fetched} fetched, {} skipped, {} filtered)",
                outcome.skipped, outcome.filtered
            )));
        }

        info!(
            fetched,
            items = outcome.items.len(),
            skipped = outcome.skipped,
            filtered = outcome.filtered,
            duplicates = outcome.duplicates,
            "ingestion complete"
        );

        if !outcome.items.is_empty() {
            self.cache.put(
                key,
                CachedContent {
                    items: outcome.items.clone(),
                    skipped: outcome.skipped,
                    filtered: outcome.filtered,
                },
                self.config.cache_ttl,
            );
        }

        Ok(IngestReport {
            items: outcome.items,
            skipped: outcome.skipped,
            filtered: outcome.filtered,
            warnings: outcome.warnings,
            from_cache: false,
        })
    }

    /// Drop cached content for `range` so the next ingest refetches.
    pub fn invalidate(&self, range: &DateRange) -> bool {
        self.cache.invalidate(&range.cache_key())
    }
}
