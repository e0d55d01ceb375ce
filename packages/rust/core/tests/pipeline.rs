//! End-to-end tests for `DigestPipeline` over deterministic fake services.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use streamdigest_core::prompts::TAGLINE_SYSTEM;
use streamdigest_core::{DigestPipeline, PipelineConfig, Services, write_document};
use streamdigest_ingest::{IngestionSource, StaticSource};
use streamdigest_providers::{
    GeneratedImage, ImageGenerator, ImageRequest, PassthroughShortener, TextGenerator,
    TextRequest,
};
use streamdigest_shared::{
    ArtifactType, BatchFailure, BucketConfig, DateRange, DigestError, FailureKind, Operation, RawRecord,
    RetryPolicy, ServiceError, Stage,
};
use streamdigest_storage::Storage;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Text keyed on the requested temperature, so each candidate is distinct.
#[derive(Default)]
struct FakeText {
    calls: AtomicUsize,
    /// Candidate temperatures (in tenths) that fail fatally.
    reject_tenths: Vec<u32>,
    delay: Duration,
}

#[async_trait]
impl TextGenerator for FakeText {
    fn service(&self) -> &str {
        "fake-text"
    }

    async fn generate(&self, request: &TextRequest) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let tenths = (request.temperature * 10.0).round() as u32;
        if self.reject_tenths.contains(&tenths) {
            return Err(ServiceError::new("fake-text", FailureKind::MalformedPrompt, "rejected"));
        }
        if request.system.as_deref() == Some(TAGLINE_SYSTEM) {
            Ok(format!("\"stream this week's best picks no. {tenths}\""))
        } else {
            Ok(format!(
                "Unlock endless streaming from anywhere, every night of the week, and never \
                 miss a release. Click 'Watch Now' for pick {tenths}."
            ))
        }
    }
}

#[derive(Default)]
struct FakeImage {
    calls: AtomicUsize,
}

#[async_trait]
impl ImageGenerator for FakeImage {
    fn service(&self) -> &str {
        "fake-image"
    }

    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GeneratedImage {
            media_type: "image/png".into(),
            bytes: request.seed.to_be_bytes().to_vec(),
        })
    }
}

fn record(title: &str, date: &str, platform: &str) -> RawRecord {
    RawRecord {
        title: Some(title.into()),
        date: Some(date.into()),
        platform: Some(platform.into()),
        kind: Some("Series Premiere".into()),
        description: Some("A new season & more.".into()),
        ..RawRecord::default()
    }
}

fn records() -> Vec<RawRecord> {
    vec![
        record("The Bear", "2024-01-02", "Hulu"),
        record("Echo", "Monday, January 1", "Netflix"),
        record("the  bear", "2024-01-02", "HULU"),
        record("Night Court", "January 3, 2024", "Shudder Plus"),
        record("Masters of the Air", "2024-01-03", "Netflix"),
        RawRecord {
            title: None,
            ..record("", "2024-01-01", "Hulu")
        },
        record("Outside", "2024-01-09", "Netflix"),
    ]
}

fn range() -> DateRange {
    DateRange::parse("2024-01-01", "2024-01-03").unwrap()
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.generation.banner_count = 3;
    config.generation.retry = RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 5,
        max_delay_ms: 5,
        jitter_ms: 0,
    };
    config
}

struct Harness {
    pipeline: DigestPipeline,
    text: Arc<FakeText>,
    image: Arc<FakeImage>,
}

fn harness_with(text: FakeText, source: Arc<dyn IngestionSource>, config: PipelineConfig) -> Harness {
    let text = Arc::new(text);
    let image = Arc::new(FakeImage::default());
    let services = Services {
        source,
        text: text.clone(),
        image: image.clone(),
        shortener: Arc::new(PassthroughShortener),
    };
    Harness {
        pipeline: DigestPipeline::new(services, config),
        text,
        image,
    }
}

fn harness() -> Harness {
    harness_with(
        FakeText::default(),
        Arc::new(StaticSource::new(records())),
        config(),
    )
}

async fn pick_all(pipeline: &DigestPipeline, id: streamdigest_shared::SessionId) {
    for (artifact, index) in [
        (ArtifactType::Tagline, 1),
        (ArtifactType::Intro, 0),
        (ArtifactType::Banner, 2),
    ] {
        pipeline.generate_candidates(id, artifact).await.unwrap();
        pipeline.select_candidate(id, artifact, index).await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_session_produces_stable_document() {
    let h = harness();
    let started = h.pipeline.start_session(range()).await.unwrap();
    assert_eq!(started.items, 4);
    assert_eq!(started.skipped, 1);
    assert_eq!(started.filtered, 1);
    assert_eq!(started.warnings.len(), 1);
    let id = started.session_id;
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::Scraped);

    let taglines = h
        .pipeline
        .generate_candidates(id, ArtifactType::Tagline)
        .await
        .unwrap();
    assert_eq!(taglines.len(), 3);
    assert_eq!(
        taglines.iter().map(|c| c.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(
        taglines[0].payload.as_text(),
        Some("Stream this week's best picks no. 8")
    );
    h.pipeline
        .select_candidate(id, ArtifactType::Tagline, 1)
        .await
        .unwrap();
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::TaglineChosen);

    h.pipeline
        .generate_candidates(id, ArtifactType::Intro)
        .await
        .unwrap();
    h.pipeline
        .select_candidate(id, ArtifactType::Intro, 0)
        .await
        .unwrap();

    let banners = h
        .pipeline
        .generate_candidates(id, ArtifactType::Banner)
        .await
        .unwrap();
    assert_eq!(banners.len(), 3);
    assert_eq!(h.image.calls.load(Ordering::SeqCst), 3);
    h.pipeline
        .select_candidate(id, ArtifactType::Banner, 2)
        .await
        .unwrap();
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::BannerChosen);

    let document = h.pipeline.finalize(id).await.unwrap();
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::Finalized);
    assert_eq!(document.tagline, "Stream this week's best picks no. 9");
    assert!(document.intro.starts_with("Unlock endless streaming"));
    assert_eq!(document.item_count(), 4);
    assert_eq!(document.sections.len(), 3);
    assert_eq!(document.missing_platforms, vec!["Shudder Plus".to_string()]);
    assert!(document.html.contains("Streaming Updates for January 2024"));
    assert!(document.html.contains("https://hulu.com"));

    let chosen = h.pipeline.candidates(id, ArtifactType::Banner).unwrap();
    assert!(chosen[2].chosen);
    assert!(!chosen[0].chosen);

    let again = h.pipeline.finalize(id).await.unwrap();
    assert_eq!(again.id, document.id);
    assert_eq!(again.html, document.html);

    let out = tempfile::tempdir().unwrap();
    let dir = write_document(&document, out.path()).unwrap();
    assert!(dir.join("newsletter.html").exists());
    assert!(dir.join("banner.svg").exists());
}

#[tokio::test]
async fn select_before_generate_leaves_stage_unchanged() {
    let h = harness();
    let id = h.pipeline.start_session(range()).await.unwrap().session_id;

    let err = h
        .pipeline
        .select_candidate(id, ArtifactType::Tagline, 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DigestError::InvalidStateTransition {
            stage: Stage::Scraped,
            operation: Operation::SelectCandidate(ArtifactType::Tagline),
        }
    ));
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::Scraped);

    let err = h
        .pipeline
        .generate_candidates(id, ArtifactType::Intro)
        .await
        .unwrap_err();
    assert!(matches!(err, DigestError::InvalidStateTransition { .. }));
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::Scraped);
}

#[tokio::test]
async fn regenerating_returns_recorded_batch() {
    let h = harness();
    let id = h.pipeline.start_session(range()).await.unwrap().session_id;

    let first = h
        .pipeline
        .generate_candidates(id, ArtifactType::Tagline)
        .await
        .unwrap();
    let second = h
        .pipeline
        .generate_candidates(id, ArtifactType::Tagline)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(h.text.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn generating_after_the_pick_returns_the_same_batch() {
    let h = harness();
    let id = h.pipeline.start_session(range()).await.unwrap().session_id;

    let first = h
        .pipeline
        .generate_candidates(id, ArtifactType::Tagline)
        .await
        .unwrap();
    h.pipeline
        .select_candidate(id, ArtifactType::Tagline, 1)
        .await
        .unwrap();

    let again = h
        .pipeline
        .generate_candidates(id, ArtifactType::Tagline)
        .await
        .unwrap();
    assert_eq!(
        again.iter().map(|c| c.payload.as_text()).collect::<Vec<_>>(),
        first.iter().map(|c| c.payload.as_text()).collect::<Vec<_>>()
    );
    assert!(again[1].chosen);
    assert_eq!(h.text.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::TaglineChosen);
}

#[tokio::test]
async fn selected_content_shapes_the_document() {
    let h = harness();
    let id = h.pipeline.start_session(range()).await.unwrap().session_id;
    let items = h.pipeline.snapshot(id).unwrap().items;
    assert_eq!(items.len(), 4);

    let err = h.pipeline.select_content(id, vec![4]).await.unwrap_err();
    assert!(matches!(err, DigestError::Validation { .. }));
    let err = h.pipeline.select_content(id, Vec::new()).await.unwrap_err();
    assert!(matches!(err, DigestError::Validation { .. }));
    assert_eq!(h.pipeline.snapshot(id).unwrap().included, None);

    assert_eq!(h.pipeline.select_content(id, vec![3, 0]).await.unwrap(), 2);
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::Scraped);
    assert_eq!(h.pipeline.snapshot(id).unwrap().included, Some(vec![0, 3]));

    pick_all(&h.pipeline, id).await;
    let err = h.pipeline.select_content(id, vec![1]).await.unwrap_err();
    assert!(matches!(err, DigestError::InvalidStateTransition { .. }));

    let document = h.pipeline.finalize(id).await.unwrap();
    assert_eq!(document.item_count(), 2);
    assert!(document.html.contains(&items[0].title));
    assert!(document.html.contains(&items[3].title));
    assert!(!document.html.contains(&items[1].title));
}

#[tokio::test]
async fn finished_sessions_are_evicted_on_next_start() {
    let h = harness();
    let done = h.pipeline.start_session(range()).await.unwrap().session_id;
    pick_all(&h.pipeline, done).await;
    h.pipeline.finalize(done).await.unwrap();
    let aborted = h.pipeline.start_session(range()).await.unwrap().session_id;
    h.pipeline.abort(aborted).await.unwrap();
    let open = h.pipeline.start_session(range()).await.unwrap().session_id;
    assert_eq!(h.pipeline.session_ids(), vec![open]);

    let next = h.pipeline.start_session(range()).await.unwrap().session_id;
    let mut expected = vec![open, next];
    expected.sort();
    assert_eq!(h.pipeline.session_ids(), expected);
    assert!(matches!(
        h.pipeline.get_status(done),
        Err(DigestError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn bad_index_is_rejected() {
    let h = harness();
    let id = h.pipeline.start_session(range()).await.unwrap().session_id;
    h.pipeline
        .generate_candidates(id, ArtifactType::Tagline)
        .await
        .unwrap();

    let err = h
        .pipeline
        .select_candidate(id, ArtifactType::Tagline, 3)
        .await
        .unwrap_err();
    assert!(matches!(err, DigestError::Validation { .. }));
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::TaglinesGenerated);
}

#[tokio::test]
async fn abort_blocks_further_mutation() {
    let h = harness();
    let id = h.pipeline.start_session(range()).await.unwrap().session_id;
    h.pipeline
        .generate_candidates(id, ArtifactType::Tagline)
        .await
        .unwrap();

    h.pipeline.abort(id).await.unwrap();
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::Aborted);

    let err = h
        .pipeline
        .select_candidate(id, ArtifactType::Tagline, 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DigestError::InvalidStateTransition {
            stage: Stage::Aborted,
            ..
        }
    ));
    assert!(h.pipeline.finalize(id).await.is_err());
    assert!(h
        .pipeline
        .generate_candidates(id, ArtifactType::Tagline)
        .await
        .is_err());
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::Aborted);

    // Aborting again is a no-op.
    h.pipeline.abort(id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn abort_cancels_in_flight_generation() {
    let h = harness_with(
        FakeText {
            delay: Duration::from_secs(5),
            ..FakeText::default()
        },
        Arc::new(StaticSource::new(records())),
        config(),
    );
    let id = h.pipeline.start_session(range()).await.unwrap().session_id;

    let (generated, aborted) = tokio::join!(
        h.pipeline.generate_candidates(id, ArtifactType::Tagline),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.pipeline.abort(id).await
        }
    );

    aborted.unwrap();
    assert!(matches!(
        generated,
        Err(DigestError::Cancelled {
            operation: Operation::GenerateCandidates(ArtifactType::Tagline)
        })
    ));
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::Aborted);
    assert!(h
        .pipeline
        .candidates(id, ArtifactType::Tagline)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn partial_batch_records_nothing() {
    let h = harness_with(
        FakeText {
            reject_tenths: vec![9],
            ..FakeText::default()
        },
        Arc::new(StaticSource::new(records())),
        config(),
    );
    let id = h.pipeline.start_session(range()).await.unwrap().session_id;

    let err = h
        .pipeline
        .generate_candidates(id, ArtifactType::Tagline)
        .await
        .unwrap_err();
    match err {
        DigestError::PartialGeneration {
            artifact,
            succeeded,
            requested,
            stage,
            ..
        } => {
            assert_eq!(artifact, ArtifactType::Tagline);
            assert_eq!((succeeded, requested), (2, 3));
            assert_eq!(stage, Stage::Scraped);
        }
        other => panic!("expected partial generation, got {other}"),
    }
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::Scraped);
    assert!(h
        .pipeline
        .candidates(id, ArtifactType::Tagline)
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_rate_limit_fails_the_batch() {
    let mut config = config();
    config.rate_limits.text = BucketConfig {
        capacity: 2,
        refill_per_minute: 0,
        max_wait_ms: 0,
    };
    let h = harness_with(
        FakeText::default(),
        Arc::new(StaticSource::new(records())),
        config,
    );
    let id = h.pipeline.start_session(range()).await.unwrap().session_id;

    let err = h
        .pipeline
        .generate_candidates(id, ArtifactType::Tagline)
        .await
        .unwrap_err();
    match err {
        DigestError::PartialGeneration {
            succeeded, failure, ..
        } => {
            assert_eq!(succeeded, 2);
            assert_eq!(failure, BatchFailure::RateLimitExceeded);
        }
        other => panic!("expected partial generation, got {other}"),
    }
    assert_eq!(h.text.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.pipeline.get_status(id).unwrap(), Stage::Scraped);
}

#[tokio::test]
async fn empty_ingestion_creates_no_session() {
    let h = harness_with(
        FakeText::default(),
        Arc::new(StaticSource::new(vec![record("Later", "2024-02-01", "Netflix")])),
        config(),
    );

    let err = h.pipeline.start_session(range()).await.unwrap_err();
    assert!(matches!(err, DigestError::Ingestion { .. }));
    assert!(h.pipeline.session_ids().is_empty());
}

#[tokio::test]
async fn unknown_session_is_reported() {
    let h = harness();
    let id = streamdigest_shared::SessionId::new();
    assert!(matches!(
        h.pipeline.get_status(id),
        Err(DigestError::SessionNotFound(_))
    ));
    assert!(matches!(
        h.pipeline.finalize(id).await,
        Err(DigestError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn persisted_session_resumes_in_a_new_pipeline() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = Arc::new(Storage::open(&tmp.path().join("streamdigest.db")).await.unwrap());

    let first = harness().pipeline.with_storage(storage.clone());
    let id = first.start_session(range()).await.unwrap().session_id;
    pick_all(&first, id).await;
    let expected = first.snapshot(id).unwrap();
    drop(first);

    let second = harness_with(
        FakeText::default(),
        Arc::new(StaticSource::new(Vec::new())),
        config(),
    );
    let text = second.text.clone();
    let pipeline = second.pipeline.with_storage(storage.clone());

    let restored = pipeline.resume(id).await.unwrap();
    assert_eq!(restored.stage, Stage::BannerChosen);
    assert_eq!(restored.picks, expected.picks);
    assert_eq!(restored.items, expected.items);
    assert_eq!(restored.batches.len(), 3);

    let taglines = pipeline.candidates(id, ArtifactType::Tagline).unwrap();
    assert!(taglines[1].chosen);
    assert!(!taglines[0].chosen);

    let document = pipeline.finalize(id).await.unwrap();
    assert_eq!(document.tagline, "Stream this week's best picks no. 9");
    assert_eq!(text.calls.load(Ordering::SeqCst), 0);

    let stored = storage.load_document(&id).await.unwrap().unwrap();
    assert_eq!(stored.id, document.id);
    let snapshot = storage.load_session(&id).await.unwrap().unwrap();
    assert_eq!(snapshot.stage, Stage::Finalized);
    assert_eq!(snapshot.document_id.as_deref(), Some(document.id.as_str()));
}

#[tokio::test]
async fn resume_without_storage_is_not_found() {
    let h = harness();
    let id = streamdigest_shared::SessionId::new();
    assert!(matches!(
        h.pipeline.resume(id).await,
        Err(DigestError::SessionNotFound(_))
    ));
}
