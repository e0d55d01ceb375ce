//! Candidate batch generation.
//!
//! A batch issues one call per candidate with bounded concurrency, retries
//! each call independently, and returns either exactly `count` candidates in
//! request order or an error. Nothing from a failed batch is kept.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use streamdigest_providers::{ImageGenerator, ImageRequest, TextGenerator, TextRequest};
use streamdigest_shared::{
    ArtifactType, BatchFailure, Candidate, CandidatePayload, DigestError, FailureKind, GenerationConfig,
    GenerationRequest, GenerationStatus, ImageFallback, LengthBounds, Operation, Result,
    ServiceError, Stage,
};

use crate::banner::compose_banner;
use crate::prompts::{self, BANNER_IMAGE_SIZE};
use crate::ratelimit::{RateLimiters, TokenBucket};
use crate::retry::{RetryContext, RetryFailure, with_retry};

/// Observer for per-candidate completion.
pub trait BatchProgress: Send + Sync {
    fn candidate_done(&self, artifact: ArtifactType, completed: usize, total: usize);
}

/// No-op batch observer.
pub struct NoBatchProgress;

impl BatchProgress for NoBatchProgress {
    fn candidate_done(&self, _artifact: ArtifactType, _completed: usize, _total: usize) {}
}

/// Produces candidate batches from the text and image services.
#[derive(Clone)]
pub struct Generator {
    text: Arc<dyn TextGenerator>,
    image: Arc<dyn ImageGenerator>,
    limiters: RateLimiters,
    config: Arc<GenerationConfig>,
}

impl Generator {
    pub fn new(
        text: Arc<dyn TextGenerator>,
        image: Arc<dyn ImageGenerator>,
        limiters: RateLimiters,
        config: GenerationConfig,
    ) -> Self {
        Self {
            text,
            image,
            limiters,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate `request.count` candidates.
    ///
    /// `banner_text` is the chosen tagline drawn onto banners; `stage` is the
    /// session stage reported if the batch fails.
    #[instrument(skip_all, fields(artifact = %request.artifact, count = request.count, version = %request.params.version))]
    pub async fn generate_batch(
        &self,
        request: &mut GenerationRequest,
        banner_text: Option<&str>,
        stage: Stage,
        cancel: &CancellationToken,
        progress: &dyn BatchProgress,
    ) -> Result<Vec<Candidate>> {
        let artifact = request.artifact;
        let count = request.count;
        if count == 0 {
            request.status = GenerationStatus::Failed;
            return Err(DigestError::validation(format!(
                "batch size for {artifact} must be at least 1"
            )));
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let claimed = Arc::new(Mutex::new(HashSet::new()));
        let mut set = JoinSet::new();

        for index in 0..count {
            let call = CandidateCall {
                artifact,
                index,
                system: request.params.system.clone(),
                prompt: request.prompt_for(index).to_string(),
                banner_text: banner_text.unwrap_or_default().to_string(),
                policy: request.policy.clone(),
                cancel: cancel.clone(),
                claimed: claimed.clone(),
                generator: self.clone(),
            };
            let semaphore = semaphore.clone();
            set.spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await;
                (index, call.run().await)
            });
        }

        let mut slots: Vec<Option<CandidatePayload>> = vec![None; count];
        let mut failures: Vec<(usize, RetryFailure)> = Vec::new();
        let mut completed = 0;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(payload))) => {
                    slots[index] = Some(payload);
                    completed += 1;
                    progress.candidate_done(artifact, completed, count);
                    debug!(index, "candidate ready");
                }
                Ok((index, Err(failure))) => {
                    warn!(index, attempts = failure.attempts, error = %failure.error, "candidate failed");
                    failures.push((index, failure));
                }
                Err(e) => {
                    warn!(error = %e, "candidate task panicked");
                    failures.push((
                        usize::MAX,
                        RetryFailure {
                            error: DigestError::Service(ServiceError::new(
                                "generator",
                                FailureKind::Transient,
                                e.to_string(),
                            )),
                            attempts: 0,
                            retries_remaining: 0,
                        },
                    ));
                }
            }
        }

        if failures.is_empty() {
            request.status = GenerationStatus::Succeeded;
            let candidates = slots
                .into_iter()
                .enumerate()
                .filter_map(|(index, payload)| {
                    payload.map(|payload| Candidate {
                        artifact,
                        index,
                        payload,
                        chosen: false,
                    })
                })
                .collect::<Vec<_>>();
            info!(candidates = candidates.len(), "batch complete");
            return Ok(candidates);
        }

        request.status = GenerationStatus::Failed;
        if cancel.is_cancelled()
            || failures
                .iter()
                .any(|(_, f)| matches!(f.error, DigestError::Cancelled { .. }))
        {
            return Err(DigestError::Cancelled {
                operation: Operation::GenerateCandidates(artifact),
            });
        }

        failures.sort_by_key(|(index, _)| *index);
        let succeeded = count - failures.len();
        let retries_remaining = failures
            .iter()
            .map(|(_, f)| f.retries_remaining)
            .min()
            .unwrap_or(0);
        let (failure, cause) = failures
            .into_iter()
            .next()
            .map(|(_, f)| (f.error.batch_failure(), f.error.to_string()))
            .unwrap_or((BatchFailure::Other, String::new()));

        Err(DigestError::PartialGeneration {
            artifact,
            succeeded,
            requested: count,
            stage,
            retries_remaining,
            failure,
            cause,
        })
    }

    /// Character and word bounds for a text artifact.
    fn bounds(&self, artifact: ArtifactType) -> Option<(LengthBounds, LengthBounds)> {
        match artifact {
            ArtifactType::Tagline => Some((self.config.tagline_len, self.config.tagline_words)),
            ArtifactType::Intro => Some((self.config.intro_len, self.config.intro_words)),
            ArtifactType::Banner => None,
        }
    }
}

/// Everything one spawned candidate call owns.
struct CandidateCall {
    artifact: ArtifactType,
    index: usize,
    system: Option<String>,
    prompt: String,
    banner_text: String,
    policy: streamdigest_shared::RetryPolicy,
    cancel: CancellationToken,
    /// Texts already taken by candidates of the same batch, lowercased.
    claimed: Arc<Mutex<HashSet<String>>>,
    generator: Generator,
}

impl CandidateCall {
    async fn run(self) -> std::result::Result<CandidatePayload, RetryFailure> {
        match self.artifact {
            ArtifactType::Tagline | ArtifactType::Intro => self.run_text().await,
            ArtifactType::Banner => self.run_image().await,
        }
    }

    fn context<'a>(&'a self, service: &'a str, bucket: &'a TokenBucket) -> RetryContext<'a> {
        RetryContext {
            service,
            policy: &self.policy,
            bucket,
            call_timeout: self.generator.config.call_timeout,
            cancel: &self.cancel,
            operation: Operation::GenerateCandidates(self.artifact),
        }
    }

    async fn run_text(&self) -> std::result::Result<CandidatePayload, RetryFailure> {
        let text = &self.generator.text;
        let service = text.service().to_string();
        let bounds = self.generator.bounds(self.artifact);
        let request = TextRequest {
            system: self.system.clone(),
            prompt: self.prompt.clone(),
            temperature: prompts::temperature(self.artifact, self.index),
            max_tokens: prompts::max_tokens(self.artifact),
        };

        let ctx = self.context(&service, &self.generator.limiters.text);
        let cleaned = with_retry(ctx, |_| {
            let request = &request;
            let service = &service;
            async move {
                let raw = text.generate(request).await?;
                let cleaned = prompts::clean_text(self.artifact, &raw);
                match self.reject_text(&cleaned, bounds) {
                    Some(problem) => Err(ServiceError::new(
                        service.as_str(),
                        FailureKind::InvalidOutput,
                        problem,
                    )),
                    None => Ok(cleaned),
                }
            }
        })
        .await?;

        Ok(CandidatePayload::Text { text: cleaned })
    }

    /// Why `text` is unusable, or `None` once it is accepted and claimed.
    fn reject_text(&self, text: &str, bounds: Option<(LengthBounds, LengthBounds)>) -> Option<String> {
        let artifact = self.artifact;
        if let Some((chars, words)) = bounds {
            let len = text.chars().count();
            if !chars.contains(len) {
                return Some(format!("{artifact} of {len} chars outside {}..={}", chars.min, chars.max));
            }
            let count = text.split_whitespace().count();
            if !words.contains(count) {
                return Some(format!("{artifact} of {count} words outside {}..={}", words.min, words.max));
            }
        }
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        if !claimed.insert(text.to_lowercase()) {
            return Some(format!("{artifact} repeats an earlier candidate"));
        }
        None
    }

    async fn run_image(&self) -> std::result::Result<CandidatePayload, RetryFailure> {
        let image = &self.generator.image;
        let service = image.service().to_string();
        let config = &self.generator.config;
        let request = ImageRequest {
            prompt: self.prompt.clone(),
            seed: prompts::banner_seed(self.index),
            width: BANNER_IMAGE_SIZE,
            height: BANNER_IMAGE_SIZE,
        };

        let ctx = self.context(&service, &self.generator.limiters.image);
        let generated = with_retry(ctx, |_| image.generate(&request)).await;

        let banner = match generated {
            Ok(img) => compose_banner(
                &self.banner_text,
                Some(&img),
                self.index,
                config.banner_width,
                config.banner_height,
            ),
            Err(failure)
                if config.on_image_failure == ImageFallback::LocalBackground
                    && !matches!(failure.error, DigestError::Cancelled { .. }) =>
            {
                warn!(index = self.index, error = %failure.error, "image unavailable, using local background");
                compose_banner(
                    &self.banner_text,
                    None,
                    self.index,
                    config.banner_width,
                    config.banner_height,
                )
            }
            Err(failure) => return Err(failure),
        };

        Ok(CandidatePayload::Image {
            media_type: banner.media_type,
            bytes: banner.bytes,
        })
    }
}
