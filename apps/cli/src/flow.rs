//! Walks a session from its current stage to the written newsletter.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr, eyre};
use dialoguer::{Confirm, MultiSelect, Select};
use indicatif::{ProgressBar, ProgressStyle};
use streamdigest_core::{DigestPipeline, ProgressReporter, image_extension, write_document};
use streamdigest_shared::{
    ArtifactType, Candidate, CandidatePayload, ContentItem, NewsletterDocument, SessionId, Stage,
};
use tracing::{info, warn};

/// How the flow picks candidates and where it writes.
pub(crate) struct FlowOptions {
    pub out_dir: PathBuf,
    pub auto_pick: bool,
}

/// The next thing a session needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Generate(ArtifactType),
    Pick(ArtifactType),
    Finalize,
    Done,
    Stopped,
}

fn next_step(stage: Stage) -> Step {
    use ArtifactType::{Banner, Intro, Tagline};

    match stage {
        Stage::Initialized | Stage::Scraped => Step::Generate(Tagline),
        Stage::TaglinesGenerated => Step::Pick(Tagline),
        Stage::TaglineChosen => Step::Generate(Intro),
        Stage::IntrosGenerated => Step::Pick(Intro),
        Stage::IntroChosen => Step::Generate(Banner),
        Stage::BannersGenerated => Step::Pick(Banner),
        Stage::BannerChosen | Stage::Assembled => Step::Finalize,
        Stage::Finalized => Step::Done,
        Stage::Aborted => Step::Stopped,
    }
}

/// Drive `session_id` until it is finalized (and written) or aborted.
pub(crate) async fn drive(
    pipeline: &DigestPipeline,
    session_id: SessionId,
    options: &FlowOptions,
    progress: &CliProgress,
) -> Result<()> {
    loop {
        let stage = pipeline.get_status(session_id)?;
        match next_step(stage) {
            Step::Generate(artifact) => {
                if stage == Stage::Scraped && !options.auto_pick {
                    let snapshot = pipeline.snapshot(session_id)?;
                    if snapshot.included.is_none() {
                        let indices = choose_content(&snapshot.items)?;
                        let kept = pipeline.select_content(session_id, indices).await?;
                        println!("  Keeping {kept} of {} entries.", snapshot.items.len());
                    }
                }
                let generated = pipeline.generate_candidates(session_id, artifact).await;
                progress.idle();
                if let Err(e) = generated {
                    let retry =
                        e.is_retryable() && !options.auto_pick && confirm(&format!("{e}. Retry?"))?;
                    if retry {
                        continue;
                    }
                    return Err(e.into());
                }
            }
            Step::Pick(artifact) => {
                let candidates = pipeline.candidates(session_id, artifact)?;
                let choice = if options.auto_pick {
                    Some(0)
                } else {
                    choose(session_id, artifact, &candidates, options)?
                };
                match choice {
                    Some(index) => {
                        pipeline.select_candidate(session_id, artifact, index).await?;
                    }
                    None => {
                        pipeline.abort(session_id).await?;
                        println!("  Session {session_id} aborted.");
                        return Ok(());
                    }
                }
            }
            Step::Finalize => {
                let finalized = pipeline.finalize(session_id).await;
                progress.idle();
                match finalized {
                    Ok(document) => return publish(&document, options),
                    Err(e) if e.is_retryable() && !options.auto_pick => {
                        if !confirm(&format!("{e}. Retry?"))? {
                            return Err(e.into());
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Step::Done => {
                let document = pipeline.finalize(session_id).await?;
                return publish(&document, options);
            }
            Step::Stopped => return Err(eyre!("session {session_id} was aborted")),
        }
    }
}

/// Prompt for one candidate. `None` means the operator aborted.
fn choose(
    session_id: SessionId,
    artifact: ArtifactType,
    candidates: &[Candidate],
    options: &FlowOptions,
) -> Result<Option<usize>> {
    let mut labels = Vec::with_capacity(candidates.len() + 1);
    for candidate in candidates {
        labels.push(match &candidate.payload {
            CandidatePayload::Text { text } => text.clone(),
            CandidatePayload::Image { media_type, bytes } => {
                let path = write_preview(session_id, candidate.index, media_type, bytes, options)?;
                format!("banner #{} ({})", candidate.index + 1, path.display())
            }
        });
    }
    labels.push("Abort session".to_string());

    let selected = tokio::task::block_in_place(|| {
        Select::new()
            .with_prompt(format!("Choose a {artifact}"))
            .items(&labels)
            .default(0)
            .interact()
    })
    .wrap_err("selection cancelled")?;

    Ok((selected < candidates.len()).then_some(selected))
}

/// Prompt for the entries to keep; all are checked to start with.
fn choose_content(items: &[ContentItem]) -> Result<Vec<usize>> {
    let labels: Vec<String> = items
        .iter()
        .map(|item| format!("{}  {:<14} {}", item.date, item.platform, item.title))
        .collect();
    let defaults = vec![true; items.len()];

    loop {
        let selected = tokio::task::block_in_place(|| {
            MultiSelect::new()
                .with_prompt("Entries to include (space toggles, enter confirms)")
                .items(&labels)
                .defaults(&defaults)
                .interact()
        })
        .wrap_err("selection cancelled")?;
        if !selected.is_empty() {
            return Ok(selected);
        }
        println!("  Select at least one entry.");
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    let answer = tokio::task::block_in_place(|| {
        Confirm::new().with_prompt(prompt).default(true).interact()
    })
    .unwrap_or(false);
    Ok(answer)
}

/// Write a banner candidate where the operator can open it.
fn write_preview(
    session_id: SessionId,
    index: usize,
    media_type: &str,
    bytes: &[u8],
    options: &FlowOptions,
) -> Result<PathBuf> {
    let dir = options
        .out_dir
        .join(session_id.to_string())
        .join("candidates");
    std::fs::create_dir_all(&dir).wrap_err_with(|| format!("cannot create {}", dir.display()))?;
    let path = dir.join(format!("banner-{}.{}", index + 1, image_extension(media_type)));
    std::fs::write(&path, bytes).wrap_err_with(|| format!("cannot write {}", path.display()))?;
    Ok(path)
}

fn publish(document: &NewsletterDocument, options: &FlowOptions) -> Result<()> {
    let dir = write_document(document, &options.out_dir)?;
    info!(id = %document.id, path = %dir.display(), "newsletter written");
    for platform in &document.missing_platforms {
        warn!(%platform, "no website configured, Watch Now links to '#'");
    }

    println!();
    println!("  Newsletter ready!");
    println!("  Title:    {}", document.title);
    println!("  Tagline:  {}", document.tagline);
    println!("  Entries:  {}", document.item_count());
    println!("  ID:       {}", document.id);
    println!("  Path:     {}", dir.display());
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
pub(crate) struct CliProgress {
    spinner: Mutex<Option<ProgressBar>>,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        Self {
            spinner: Mutex::new(None),
        }
    }

    fn with_spinner(&self, f: impl FnOnce(&ProgressBar)) {
        let mut slot = self.spinner.lock().unwrap_or_else(|e| e.into_inner());
        let spinner = slot.get_or_insert_with(|| {
            let spinner = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
                spinner.set_style(
                    style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
                );
            }
            spinner.enable_steady_tick(Duration::from_millis(80));
            spinner
        });
        f(spinner);
    }

    /// Clear the spinner before printing or prompting.
    pub(crate) fn idle(&self) {
        let mut slot = self.spinner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(spinner) = slot.take() {
            spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.with_spinner(|s| s.set_message(name.to_string()));
    }

    fn candidate_done(&self, artifact: ArtifactType, completed: usize, total: usize) {
        self.with_spinner(|s| {
            s.set_message(format!(
                "Generating {artifact} candidates [{completed}/{total}]"
            ));
        });
    }

    fn done(&self, _document: &NewsletterDocument) {
        self.idle();
    }
}
