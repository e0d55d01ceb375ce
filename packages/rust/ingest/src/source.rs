//! The ingestion source capability.

use async_trait::async_trait;
use streamdigest_shared::{DateRange, RawRecord, Result};

/// A provider of raw schedule records for a date range.
///
/// Implementations return [`DigestError::SourceUnavailable`] when the
/// source cannot be reached; the whole fetch may then be retried.
///
/// [`DigestError::SourceUnavailable`]: streamdigest_shared::DigestError::SourceUnavailable
#[async_trait]
pub trait IngestionSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Fetch every record the source holds for `range`. Records outside the
    /// range may be included; the normalizer drops them.
    async fn fetch(&self, range: &DateRange) -> Result<Vec<RawRecord>>;
}

/// A source serving a fixed list of records.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    records: Vec<RawRecord>,
}

impl StaticSource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl IngestionSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self, _range: &DateRange) -> Result<Vec<RawRecord>> {
        Ok(self.records.clone())
    }
}
