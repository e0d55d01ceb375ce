//! The session pipeline: content range → candidates → picks → document.
//!
//! [`DigestPipeline`] owns every live session. Each session has a state lock
//! held only for short in-memory updates, an operation lock that serializes
//! generate/select/finalize, and a cancellation token fired by `abort`.
//! Mutations are applied to a copy, persisted, then committed, so a failed
//! storage write leaves the session unchanged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use streamdigest_ingest::{ContentCache, IngestionSource, Ingestor};
use streamdigest_providers::{ImageGenerator, LinkShortener, TextGenerator};
use streamdigest_shared::{
    AppConfig, ArtifactType, Candidate, DateRange, DigestError, GenerationConfig,
    GenerationRequest, IngestConfig, NewsletterDocument, Operation, PlatformLink, PromptParams,
    RateLimitsConfig, Result, SessionId, SessionSnapshot, Stage,
};
use streamdigest_storage::Storage;

use crate::assembler::{Assembler, AssemblyInput, LinkCache, LinkResolver};
use crate::generation::{BatchProgress, Generator};
use crate::prompts;
use crate::ratelimit::RateLimiters;
use crate::session::SelectionSession;

/// Runtime settings for [`DigestPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub generation: GenerationConfig,
    pub ingest: IngestConfig,
    pub rate_limits: RateLimitsConfig,
    /// Registry used for "Watch Now" links.
    pub platforms: Vec<PlatformLink>,
    /// Lifetime of cached short links.
    pub link_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            generation: GenerationConfig::from(config),
            ingest: IngestConfig::from(config),
            rate_limits: config.rate_limits.clone(),
            platforms: config.platforms.clone(),
            link_ttl: config.cache.ttl(),
        }
    }
}

/// The external capabilities a pipeline consumes.
#[derive(Clone)]
pub struct Services {
    pub source: Arc<dyn IngestionSource>,
    pub text: Arc<dyn TextGenerator>,
    pub image: Arc<dyn ImageGenerator>,
    pub shortener: Arc<dyn LinkShortener>,
}

/// Result of [`DigestPipeline::start_session`].
#[derive(Debug, Clone)]
pub struct SessionStarted {
    pub session_id: SessionId,
    pub range: DateRange,
    /// Content entries recorded on the session.
    pub items: usize,
    /// Malformed records skipped.
    pub skipped: usize,
    /// Records dropped by range or keyword policy.
    pub filtered: usize,
    pub warnings: Vec<String>,
    pub from_cache: bool,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when one candidate of a batch is ready.
    fn candidate_done(&self, artifact: ArtifactType, completed: usize, total: usize);
    /// Called once a document is finalized.
    fn done(&self, document: &NewsletterDocument);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn candidate_done(&self, _artifact: ArtifactType, _completed: usize, _total: usize) {}
    fn done(&self, _document: &NewsletterDocument) {}
}

struct ReporterBatchProgress<'a>(&'a dyn ProgressReporter);

impl BatchProgress for ReporterBatchProgress<'_> {
    fn candidate_done(&self, artifact: ArtifactType, completed: usize, total: usize) {
        self.0.candidate_done(artifact, completed, total);
    }
}

struct SessionHandle {
    state: Mutex<SelectionSession>,
    op_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl SessionHandle {
    fn new(session: SelectionSession) -> Self {
        let cancel = CancellationToken::new();
        if session.stage() == Stage::Aborted {
            cancel.cancel();
        }
        Self {
            state: Mutex::new(session),
            op_lock: tokio::sync::Mutex::new(()),
            cancel,
        }
    }

    fn state(&self) -> MutexGuard<'_, SelectionSession> {
        // Sessions are only replaced wholesale, so a poisoned value is intact.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn copy(&self) -> SelectionSession {
        self.state().clone()
    }
}

/// Orchestrates ingestion, generation, selection and assembly for all
/// sessions of one process.
pub struct DigestPipeline {
    ingestor: Ingestor,
    generator: Generator,
    assembler: Assembler,
    storage: Option<Arc<Storage>>,
    progress: Arc<dyn ProgressReporter>,
    content_cache: Arc<ContentCache>,
    link_cache: Arc<LinkCache>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl DigestPipeline {
    /// Build a pipeline with fresh caches and rate limiters.
    pub fn new(services: Services, config: PipelineConfig) -> Self {
        let limiters = RateLimiters::from(&config.rate_limits);
        Self::with_shared(
            services,
            config,
            limiters,
            Arc::new(ContentCache::new()),
            Arc::new(LinkCache::new()),
        )
    }

    /// Build a pipeline over caches and rate limiters shared with others.
    pub fn with_shared(
        services: Services,
        config: PipelineConfig,
        limiters: RateLimiters,
        content_cache: Arc<ContentCache>,
        link_cache: Arc<LinkCache>,
    ) -> Self {
        let links = LinkResolver::new(
            services.shortener,
            limiters.shortener.clone(),
            link_cache.clone(),
            config.link_ttl,
            config.generation.retry.clone(),
            config.generation.call_timeout,
        );
        Self {
            ingestor: Ingestor::new(services.source, content_cache.clone(), config.ingest),
            generator: Generator::new(services.text, services.image, limiters, config.generation),
            assembler: Assembler::new(config.platforms, links),
            storage: None,
            progress: Arc::new(SilentProgress),
            content_cache,
            link_cache,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Persist sessions, batches and documents to `storage`.
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Create a session for `range` and ingest its content.
    ///
    /// The session is only registered once ingestion succeeded; on failure
    /// nothing is kept and the call may be retried. Finalized and aborted
    /// sessions are dropped from memory first (they stay in storage).
    #[instrument(skip_all, fields(range = %range))]
    pub async fn start_session(&self, range: DateRange) -> Result<SessionStarted> {
        range.check_horizon(Utc::now().date_naive())?;
        self.evict_finished();

        let mut session = SelectionSession::new(SessionId::new(), range);

        // --- Phase 1: Ingestion ---
        self.progress.phase("Fetching content");
        let report = self.ingestor.ingest(&range).await?;

        session.record_content(report.items, report.skipped)?;
        if let Some(storage) = &self.storage {
            storage.save_session(&session.snapshot()).await?;
        }

        let session_id = session.id();
        let items = session.items().len();
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, Arc::new(SessionHandle::new(session)));

        info!(%session_id, items, skipped = report.skipped, from_cache = report.from_cache, "session started");
        Ok(SessionStarted {
            session_id,
            range,
            items,
            skipped: report.skipped,
            filtered: report.filtered,
            warnings: report.warnings,
            from_cache: report.from_cache,
        })
    }

    /// Generate the candidate batch for `artifact`.
    ///
    /// Returns exactly the configured number of candidates or an error; a
    /// failed batch records nothing. Calling again while the batch is the
    /// current one returns it unchanged.
    #[instrument(skip_all, fields(session = %session_id, artifact = %artifact))]
    pub async fn generate_candidates(
        &self,
        session_id: SessionId,
        artifact: ArtifactType,
    ) -> Result<Vec<Candidate>> {
        let operation = Operation::GenerateCandidates(artifact);
        let handle = self.handle(session_id)?;
        let _op = handle.op_lock.lock().await;

        let version = self.generator.config().prompt_version.clone();
        let count = self.generator.config().count_for(artifact);
        let (stage, params, banner_text) = {
            let session = handle.state();
            if let Some(batch) = session.recorded_batch(artifact, &version) {
                debug!(candidates = batch.len(), "returning recorded batch");
                return Ok(batch.to_vec());
            }
            session.check(operation)?;
            let banner_text = session
                .chosen(ArtifactType::Tagline)
                .and_then(|c| c.payload.as_text().map(str::to_string));
            (
                session.stage(),
                self.prompt_params(&session, artifact, &version),
                banner_text,
            )
        };

        // --- Phase 2: Generation ---
        self.progress.phase(&format!("Generating {artifact} candidates"));
        let mut request = GenerationRequest::new(
            artifact,
            params,
            count,
            self.generator.config().retry.clone(),
        );
        let candidates = self
            .generator
            .generate_batch(
                &mut request,
                banner_text.as_deref(),
                stage,
                &handle.cancel,
                &ReporterBatchProgress(self.progress.as_ref()),
            )
            .await?;

        if let Some(storage) = &self.storage {
            storage
                .save_batch(&session_id, artifact, &version, &candidates)
                .await?;
        }
        let recorded = candidates.clone();
        self.commit(&handle, operation, move |s| {
            s.record_batch(artifact, &version, recorded)
        })
        .await?;

        info!(candidates = candidates.len(), "candidates recorded");
        Ok(candidates)
    }

    /// Keep only the content entries at `indices` for the newsletter.
    ///
    /// Allowed after ingestion and before the first tagline batch; returns
    /// the number of entries kept.
    #[instrument(skip_all, fields(session = %session_id, selected = indices.len()))]
    pub async fn select_content(&self, session_id: SessionId, indices: Vec<usize>) -> Result<usize> {
        let handle = self.handle(session_id)?;
        let _op = handle.op_lock.lock().await;

        let mut kept = 0;
        self.commit(&handle, Operation::SelectContent, |s| {
            kept = s.select_content(&indices)?;
            Ok(())
        })
        .await?;
        info!(kept, "content selected");
        Ok(kept)
    }

    /// Choose candidate `index` of the current `artifact` batch.
    #[instrument(skip_all, fields(session = %session_id, artifact = %artifact, index))]
    pub async fn select_candidate(
        &self,
        session_id: SessionId,
        artifact: ArtifactType,
        index: usize,
    ) -> Result<()> {
        let handle = self.handle(session_id)?;
        let _op = handle.op_lock.lock().await;

        self.commit(&handle, Operation::SelectCandidate(artifact), |s| {
            s.select(artifact, index)
        })
        .await?;
        info!("candidate selected");
        Ok(())
    }

    /// Assemble and finalize the session's document.
    ///
    /// Repeated calls on a finalized session return the same document.
    #[instrument(skip_all, fields(session = %session_id))]
    pub async fn finalize(&self, session_id: SessionId) -> Result<Arc<NewsletterDocument>> {
        let handle = self.handle(session_id)?;
        let _op = handle.op_lock.lock().await;

        let session = handle.copy();
        if session.stage() == Stage::Finalized {
            return session.document().cloned().ok_or_else(|| DigestError::Finalization {
                stage: Stage::Finalized,
                message: "finalized session has no document".into(),
            });
        }

        if session.stage() == Stage::BannerChosen {
            session.check(Operation::Assemble)?;

            // --- Phase 3: Assembly ---
            self.progress.phase("Assembling newsletter");
            let tagline = session.chosen(ArtifactType::Tagline);
            let intro = session.chosen(ArtifactType::Intro);
            let banner = session.chosen(ArtifactType::Banner);
            let items = session.included_items();
            let input = AssemblyInput {
                session_id,
                range: session.range(),
                items: &items,
                tagline: tagline.as_ref(),
                intro: intro.as_ref(),
                banner: banner.as_ref(),
            };
            let document = Arc::new(self.assembler.assemble(input, &handle.cancel).await?);

            if let Some(storage) = &self.storage {
                storage.save_document(&document).await?;
            }
            self.commit(&handle, Operation::Assemble, move |s| {
                s.record_assembled(document)
            })
            .await?;
        }

        // --- Phase 4: Finalize ---
        let mut finalized = None;
        self.commit(&handle, Operation::Finalize, |s| {
            finalized = Some(s.finalize()?);
            Ok(())
        })
        .await?;
        let document = finalized.ok_or_else(|| DigestError::Finalization {
            stage: Stage::Assembled,
            message: "no assembled document".into(),
        })?;

        info!(id = %document.id, items = document.item_count(), "session finalized");
        self.progress.done(&document);
        Ok(document)
    }

    /// Abort the session and cancel whatever it has in flight.
    ///
    /// Takes effect immediately; in-flight operations fail with `Cancelled`
    /// and record nothing. Aborting twice is a no-op.
    #[instrument(skip_all, fields(session = %session_id))]
    pub async fn abort(&self, session_id: SessionId) -> Result<()> {
        let handle = self.handle(session_id)?;
        let snapshot = {
            let mut session = handle.state();
            session.abort()?;
            session.snapshot()
        };
        handle.cancel.cancel();
        info!("session aborted");

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_session(&snapshot).await {
                warn!(error = %e, "failed to persist aborted session");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Current stage of the session.
    pub fn get_status(&self, session_id: SessionId) -> Result<Stage> {
        Ok(self.handle(session_id)?.state().stage())
    }

    /// The current batch for `artifact`; empty before it was generated.
    pub fn candidates(&self, session_id: SessionId, artifact: ArtifactType) -> Result<Vec<Candidate>> {
        let handle = self.handle(session_id)?;
        let session = handle.state();
        Ok(session
            .latest_batch(artifact)
            .map(|b| b.to_vec())
            .unwrap_or_default())
    }

    pub fn snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot> {
        Ok(self.handle(session_id)?.state().snapshot())
    }

    /// Load a persisted session back into memory. A session that is already
    /// live is returned as is.
    #[instrument(skip_all, fields(session = %session_id))]
    pub async fn resume(&self, session_id: SessionId) -> Result<SessionSnapshot> {
        if let Ok(snapshot) = self.snapshot(session_id) {
            return Ok(snapshot);
        }
        let storage = self
            .storage
            .as_ref()
            .ok_or(DigestError::SessionNotFound(session_id))?;
        let snapshot = storage
            .load_session(&session_id)
            .await?
            .ok_or(DigestError::SessionNotFound(session_id))?;

        let mut batches = Vec::with_capacity(snapshot.batches.len());
        for batch in &snapshot.batches {
            let candidates = storage
                .load_batch(&session_id, batch.artifact, &batch.prompt_version)
                .await?
                .ok_or_else(|| {
                    DigestError::Storage(format!(
                        "session {session_id} references missing {} batch '{}'",
                        batch.artifact, batch.prompt_version
                    ))
                })?;
            batches.push((batch.clone(), candidates));
        }
        let document = match snapshot.document_id {
            Some(_) => storage.load_document(&session_id).await?,
            None => None,
        };

        let session = SelectionSession::restore(snapshot, batches, document);
        let restored = session.snapshot();
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionHandle::new(session)));

        info!(stage = %restored.stage, batches = restored.batches.len(), "session resumed");
        Ok(restored)
    }

    /// Ids of the sessions live in this process.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn handle(&self, session_id: SessionId) -> Result<Arc<SessionHandle>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .cloned()
            .ok_or(DigestError::SessionNotFound(session_id))
    }

    /// Drop finished sessions from memory and expired entries from the
    /// caches.
    fn evict_finished(&self) {
        let evicted = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            let before = sessions.len();
            sessions.retain(|_, handle| !handle.state().stage().is_terminal());
            before - sessions.len()
        };
        let content = self.content_cache.purge_expired();
        let links = self.link_cache.purge_expired();
        if evicted + content + links > 0 {
            debug!(sessions = evicted, content, links, "evicted finished state");
        }
    }

    fn prompt_params(
        &self,
        session: &SelectionSession,
        artifact: ArtifactType,
        version: &str,
    ) -> PromptParams {
        match artifact {
            ArtifactType::Tagline => {
                prompts::tagline_params(session.range(), &session.included_items(), version)
            }
            ArtifactType::Intro => prompts::intro_params(version),
            ArtifactType::Banner => prompts::banner_params(version, &mut rand::thread_rng()),
        }
    }

    /// Apply `mutate` to a copy of the session, persist the copy, then swap
    /// it in. Fails with `Cancelled` if the session was aborted meanwhile.
    async fn commit<F>(&self, handle: &SessionHandle, operation: Operation, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut SelectionSession) -> Result<()>,
    {
        let mut next = handle.copy();
        mutate(&mut next)?;

        if let Some(storage) = &self.storage {
            storage.save_session(&next.snapshot()).await?;
        }

        let aborted = {
            let mut current = handle.state();
            if current.stage() == Stage::Aborted {
                Some(current.snapshot())
            } else {
                *current = next;
                None
            }
        };

        if let Some(snapshot) = aborted {
            // Our write may have raced the abort's; the aborted state wins.
            if let Some(storage) = &self.storage {
                storage.save_session(&snapshot).await?;
            }
            return Err(DigestError::Cancelled { operation });
        }
        Ok(())
    }
}
