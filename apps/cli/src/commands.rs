//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use streamdigest_core::{DigestPipeline, PipelineConfig, Services};
use streamdigest_ingest::{CalendarSource, IngestionSource, StaticSource};
use streamdigest_providers::{
    FluxImageGenerator, HttpLinkShortener, LinkShortener, OpenAiTextGenerator,
    PassthroughShortener,
};
use streamdigest_shared::{
    AppConfig, DateRange, PlatformLink, RawRecord, SessionId, add_platform, expand_home,
    init_config, load_config, validate_credentials,
};
use streamdigest_storage::{DB_FILE_NAME, Storage};
use tracing::info;

use crate::flow::{self, CliProgress, FlowOptions};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// StreamDigest — weekly streaming newsletters from the release calendar.
#[derive(Parser)]
#[command(
    name = "streamdigest",
    version,
    about = "Build a streaming newsletter: fetch releases, pick generated copy and banner, publish.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Start a new newsletter session and walk it to the final document.
    Run {
        /// First day of the range (YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// Last day of the range (YYYY-MM-DD), at most 30 days after start.
        #[arg(long)]
        end: String,

        /// Output directory (defaults to `defaults.output_dir`).
        #[arg(short, long)]
        out: Option<String>,

        /// Pick the first candidate of every batch without prompting.
        #[arg(long)]
        auto_pick: bool,

        /// Read raw records from a JSON file instead of the calendar page.
        #[arg(long)]
        records: Option<PathBuf>,
    },

    /// Continue a persisted session from where it stopped.
    Resume {
        /// Session ID.
        id: String,

        /// Output directory (defaults to `defaults.output_dir`).
        #[arg(short, long)]
        out: Option<String>,

        /// Pick the first candidate of every batch without prompting.
        #[arg(long)]
        auto_pick: bool,
    },

    /// Abort a persisted session.
    Abort {
        /// Session ID.
        id: String,
    },

    /// Show the state of a persisted session.
    Status {
        /// Session ID.
        id: String,
    },

    /// List persisted sessions.
    List,

    /// Delete a persisted session with its batches and document.
    Delete {
        /// Session ID.
        id: String,
    },

    /// Platform registry used for "Watch Now" links.
    Platforms {
        #[command(subcommand)]
        action: PlatformsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

/// Platform registry subcommands.
#[derive(Subcommand)]
pub(crate) enum PlatformsAction {
    /// Add a platform, or update the one with the same name.
    Add {
        /// Platform name as shown in the calendar (e.g. "Netflix").
        name: String,
        /// Website the "Watch Now" button links to.
        website: String,
        /// Country the website serves.
        #[arg(long, default_value = "US")]
        country: String,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "streamdigest=info",
        1 => "streamdigest=debug",
        _ => "streamdigest=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            start,
            end,
            out,
            auto_pick,
            records,
        } => cmd_run(&start, &end, out.as_deref(), auto_pick, records.as_deref()).await,
        Command::Resume { id, out, auto_pick } => {
            cmd_resume(&id, out.as_deref(), auto_pick).await
        }
        Command::Abort { id } => cmd_abort(&id).await,
        Command::Status { id } => cmd_status(&id).await,
        Command::List => cmd_list().await,
        Command::Delete { id } => cmd_delete(&id).await,
        Command::Platforms { action } => match action {
            PlatformsAction::Add {
                name,
                website,
                country,
            } => cmd_platforms_add(name, website, country).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    start: &str,
    end: &str,
    out: Option<&str>,
    auto_pick: bool,
    records: Option<&Path>,
) -> Result<()> {
    // Validate API keys before doing anything
    let config = load_config()?;
    validate_credentials(&config)?;
    let range = DateRange::parse(start, end)?;

    let source: Arc<dyn IngestionSource> = match records {
        Some(path) => Arc::new(StaticSource::new(read_records(path)?)),
        None => Arc::new(CalendarSource::new(&config.source)?),
    };
    let progress = Arc::new(CliProgress::new());
    let pipeline = build_pipeline(&config, source, progress.clone(), Keys::Required).await?;

    info!(%range, auto_pick, "starting newsletter session");
    let started = pipeline.start_session(range).await?;
    progress.idle();

    println!();
    println!("  Session:  {}", started.session_id);
    println!("  Range:    {}", started.range);
    println!(
        "  Entries:  {} ({} skipped, {} filtered{})",
        started.items,
        started.skipped,
        started.filtered,
        if started.from_cache { ", cached" } else { "" }
    );
    for warning in &started.warnings {
        println!("  warning:  {warning}");
    }
    println!();

    let options = FlowOptions {
        out_dir: output_dir(&config, out),
        auto_pick,
    };
    flow::drive(&pipeline, started.session_id, &options, &progress).await
}

async fn cmd_resume(id: &str, out: Option<&str>, auto_pick: bool) -> Result<()> {
    let config = load_config()?;
    validate_credentials(&config)?;
    let session_id = parse_id(id)?;
    if !config.defaults.persist_sessions {
        return Err(eyre!(
            "session persistence is disabled (defaults.persist_sessions = false)"
        ));
    }

    // The content is already recorded on the session; the source is never asked.
    let source: Arc<dyn IngestionSource> = Arc::new(StaticSource::default());
    let progress = Arc::new(CliProgress::new());
    let pipeline = build_pipeline(&config, source, progress.clone(), Keys::Required).await?;

    let snapshot = pipeline.resume(session_id).await?;
    info!(session = %session_id, stage = %snapshot.stage, "resuming session");
    println!("  Resuming {session_id} at stage {}", snapshot.stage);

    let options = FlowOptions {
        out_dir: output_dir(&config, out),
        auto_pick,
    };
    flow::drive(&pipeline, session_id, &options, &progress).await
}

async fn cmd_abort(id: &str) -> Result<()> {
    let config = load_config()?;
    let session_id = parse_id(id)?;
    if !config.defaults.persist_sessions {
        return Err(eyre!(
            "session persistence is disabled (defaults.persist_sessions = false)"
        ));
    }

    let source: Arc<dyn IngestionSource> = Arc::new(StaticSource::default());
    let pipeline =
        build_pipeline(&config, source, Arc::new(CliProgress::new()), Keys::Unused).await?;
    pipeline.resume(session_id).await?;
    pipeline.abort(session_id).await?;

    println!("  Session {session_id} is now {}", pipeline.get_status(session_id)?);
    Ok(())
}

async fn cmd_status(id: &str) -> Result<()> {
    let config = load_config()?;
    let session_id = parse_id(id)?;
    let db_path = db_path(&config);
    if !db_path.exists() {
        return Err(eyre!("no session database at {}", db_path.display()));
    }
    let storage = Storage::open_readonly(&db_path).await?;
    let snapshot = storage
        .load_session(&session_id)
        .await?
        .ok_or_else(|| eyre!("session {session_id} not found"))?;

    println!();
    println!("  Session:  {}", snapshot.id);
    println!("  Range:    {}", snapshot.range);
    println!("  Stage:    {}", snapshot.stage);
    println!("  Entries:  {} ({} skipped)", snapshot.items.len(), snapshot.skipped);
    for batch in &snapshot.batches {
        let pick = snapshot
            .picks
            .get(batch.artifact)
            .map(|i| format!("#{i}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<9} batch {} picked {pick}",
            format!("{}:", batch.artifact),
            batch.prompt_version
        );
    }
    if let Some(document_id) = &snapshot.document_id {
        println!("  Document: {document_id}");
    }
    println!("  Updated:  {}", snapshot.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    Ok(())
}

async fn cmd_list() -> Result<()> {
    let config = load_config()?;
    let db_path = db_path(&config);
    if !db_path.exists() {
        println!("No sessions yet.");
        return Ok(());
    }
    let storage = Storage::open_readonly(&db_path).await?;
    let sessions = storage.list_sessions().await?;
    if sessions.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }

    println!();
    println!("  {:<36}  {:<23}  {:<18}  UPDATED", "ID", "RANGE", "STAGE");
    for s in sessions {
        println!(
            "  {:<36}  {} .. {}  {:<18}  {}",
            s.id,
            s.start,
            s.end,
            s.stage.as_str(),
            s.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    Ok(())
}

async fn cmd_delete(id: &str) -> Result<()> {
    let config = load_config()?;
    let session_id = parse_id(id)?;
    let db_path = db_path(&config);
    if !db_path.exists() {
        return Err(eyre!("no session database at {}", db_path.display()));
    }
    let storage = Storage::open(&db_path).await?;
    if storage.load_session(&session_id).await?.is_none() {
        return Err(eyre!("session {session_id} not found"));
    }
    storage.delete_session(&session_id).await?;

    info!(session = %session_id, "session deleted");
    println!("  Session {session_id} deleted.");
    Ok(())
}

async fn cmd_platforms_add(name: String, website: String, country: String) -> Result<()> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(eyre!("platform name must not be empty"));
    }
    let added = add_platform(PlatformLink {
        name: name.clone(),
        website: Some(website.trim().to_string()),
        country,
    })?;
    println!(
        "  {} {name} in the platform registry.",
        if added { "Added" } else { "Updated" }
    );
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Whether the text and image services will actually be called.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Keys {
    Required,
    /// The command never generates; no API keys are read.
    Unused,
}

async fn build_pipeline(
    config: &AppConfig,
    source: Arc<dyn IngestionSource>,
    progress: Arc<CliProgress>,
    keys: Keys,
) -> Result<DigestPipeline> {
    let services = match keys {
        Keys::Required => Services {
            source,
            text: Arc::new(OpenAiTextGenerator::new(&config.openai)?),
            image: Arc::new(FluxImageGenerator::new(&config.flux)?),
            shortener: shortener(config)?,
        },
        Keys::Unused => Services {
            source,
            text: Arc::new(OpenAiTextGenerator::with_api_key(
                &config.openai.base_url,
                &config.openai.model,
                "",
            )?),
            image: Arc::new(FluxImageGenerator::with_api_key(&config.flux, "")?),
            shortener: Arc::new(PassthroughShortener),
        },
    };

    let mut pipeline =
        DigestPipeline::new(services, PipelineConfig::from(config)).with_progress(progress);
    if let Some(storage) = open_storage(config).await? {
        pipeline = pipeline.with_storage(storage);
    }
    Ok(pipeline)
}

fn shortener(config: &AppConfig) -> Result<Arc<dyn LinkShortener>> {
    Ok(match config.shortener.endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => Arc::new(HttpLinkShortener::new(endpoint)?),
        _ => Arc::new(PassthroughShortener),
    })
}

async fn open_storage(config: &AppConfig) -> Result<Option<Arc<Storage>>> {
    if !config.defaults.persist_sessions {
        return Ok(None);
    }
    let storage = Storage::open(&db_path(config)).await?;
    Ok(Some(Arc::new(storage)))
}

fn db_path(config: &AppConfig) -> PathBuf {
    expand_home(&config.defaults.data_dir).join(DB_FILE_NAME)
}

fn output_dir(config: &AppConfig, out: Option<&str>) -> PathBuf {
    expand_home(out.unwrap_or(&config.defaults.output_dir))
}

fn parse_id(id: &str) -> Result<SessionId> {
    id.parse()
        .map_err(|e| eyre!("invalid session id '{id}': {e}"))
}

fn read_records(path: &Path) -> Result<Vec<RawRecord>> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read records file {}", path.display()))?;
    serde_json::from_str(&content)
        .wrap_err_with(|| format!("{} is not a JSON array of records", path.display()))
}
