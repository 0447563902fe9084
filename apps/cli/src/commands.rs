//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use kbforge_core::pipeline::{FileStatus, IngestReport, ProgressReporter};
use kbforge_core::{
    CancelFlag, ChatClient, ExtractorRegistry, HeadingClassifier, ImageDescriber, IngestConfig,
    LlmClassifier, OutlineClassifier, load_ignore_file,
};
use kbforge_shared::{
    AppConfig, ClassifierKind, KB_INFO_FILE_NAME, KNOWLEDGE_DB_FILE_NAME, KbInfo, init_config,
    load_config, load_config_from,
};
use kbforge_storage::KnowledgeStore;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// kbforge: build a hierarchically tagged knowledge base from documents.
#[derive(Parser)]
#[command(
    name = "kbforge",
    version,
    about = "Build a hierarchically tagged knowledge base from a directory of documents.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.kbforge/kbforge.toml).
    #[arg(long, global = true, env = "KBFORGE_CONFIG")]
    pub config: Option<PathBuf>,

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
    /// Ingest new and changed files under an input directory.
    Ingest {
        /// Directory of source documents.
        input_root: PathBuf,

        /// Knowledge base directory (defaults to `defaults.output_dir`).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Title prefix template: `%parent`, `%parent_N`, `%file`, or literal text.
        #[arg(short, long)]
        prefix: Option<String>,

        /// Reprocess every file regardless of modification time.
        #[arg(long)]
        force: bool,

        /// Files extracted concurrently.
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// File of regex lines; matching relative paths are skipped.
        #[arg(long)]
        ignore_file: Option<PathBuf>,
    },

    /// Show record counts per source file.
    Stats {
        /// Knowledge base directory (defaults to `defaults.output_dir`).
        #[arg(short, long)]
        out: Option<PathBuf>,
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

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "kbforge=info",
        1 => "kbforge=debug",
        _ => "kbforge=trace",
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
    let config_path = cli.config.clone();
    match cli.command {
        Command::Ingest {
            input_root,
            out,
            prefix,
            force,
            concurrency,
            ignore_file,
        } => {
            let config = resolve_config(config_path.as_deref())?;
            let ingest = ingest_settings(&config, input_root, out, prefix, force, concurrency);
            let ignore_file = ignore_file.or_else(|| config.defaults.path_ignore.as_ref().map(PathBuf::from));
            cmd_ingest(&config, &ingest, ignore_file.as_deref()).await
        }
        Command::Stats { out } => {
            let config = resolve_config(config_path.as_deref())?;
            let out = out.unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir));
            cmd_stats(&out).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Merge ingest flags over the config file defaults.
fn ingest_settings(
    config: &AppConfig,
    input_root: PathBuf,
    out: Option<PathBuf>,
    prefix: Option<String>,
    force: bool,
    concurrency: Option<usize>,
) -> IngestConfig {
    IngestConfig {
        source_root: input_root,
        output_dir: out.unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir)),
        title_prefix: prefix.unwrap_or_else(|| config.defaults.title_prefix.clone()),
        concurrency: concurrency.unwrap_or(config.defaults.concurrency as usize),
        force,
    }
}

// ---------------------------------------------------------------------------
// Collaborator wiring
// ---------------------------------------------------------------------------

fn build_registry(config: &AppConfig, ignore_file: Option<&Path>) -> Result<ExtractorRegistry> {
    let describer = if config.vision.enabled {
        let client = ChatClient::from_config(&config.vision)?;
        info!(model = client.model(), "image descriptions enabled");
        Some(Arc::new(ImageDescriber::new(client)))
    } else {
        None
    };

    let patterns = match ignore_file {
        Some(path) => load_ignore_file(path)?,
        None => Vec::new(),
    };
    Ok(ExtractorRegistry::builtin(describer).with_ignore_patterns(patterns))
}

fn build_classifier(config: &AppConfig) -> Result<Arc<dyn HeadingClassifier>> {
    match config.reconcile.classifier {
        ClassifierKind::Outline => Ok(Arc::new(OutlineClassifier)),
        ClassifierKind::Llm => {
            if !config.llm.enabled {
                return Err(eyre!(
                    "reconcile.classifier is \"llm\" but the [llm] service is disabled"
                ));
            }
            let client = ChatClient::from_config(&config.llm)?;
            info!(model = client.model(), "LLM heading classifier enabled");
            Ok(Arc::new(LlmClassifier::new(client)))
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_ingest(config: &AppConfig, ingest: &IngestConfig, ignore_file: Option<&Path>) -> Result<()> {
    let registry = build_registry(config, ignore_file)?;
    let classifier = build_classifier(config)?;

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing files already in flight");
            on_signal.cancel();
        }
    });

    info!(
        root = %ingest.source_root.display(),
        out = %ingest.output_dir.display(),
        prefix = %ingest.title_prefix,
        force = ingest.force,
        "ingesting"
    );

    let reporter = CliProgress::new();
    let report = kbforge_core::ingest(ingest, &registry, classifier, &reporter, &cancel).await?;

    println!();
    if report.cancelled {
        println!("  Ingest interrupted; remaining files will be picked up next run.");
    } else {
        println!("  Ingest complete.");
    }
    println!("  Processed:   {}", report.processed);
    println!("  Unchanged:   {}", report.unchanged);
    println!("  Failed:      {}", report.failed);
    println!("  Ignored:     {}", report.ignored);
    println!("  Unsupported: {}", report.unsupported);
    println!("  Records:     {}", report.records_written);
    println!("  Time:        {:.1}s", report.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_stats(out: &Path) -> Result<()> {
    let db_path = out.join(KNOWLEDGE_DB_FILE_NAME);
    if !db_path.exists() {
        return Err(eyre!(
            "no {KNOWLEDGE_DB_FILE_NAME} found in '{}'; is this a knowledge base directory?",
            out.display()
        ));
    }

    let info_path = out.join(KB_INFO_FILE_NAME);
    match std::fs::read(&info_path) {
        Ok(bytes) => match serde_json::from_slice::<KbInfo>(&bytes) {
            Ok(kb) => {
                println!("  Name:     {}", kb.name);
                println!("  Created:  {}", kb.create_time.to_rfc3339());
                if let Some(modified) = kb.mod_time {
                    println!("  Modified: {}", modified.to_rfc3339());
                }
                println!();
            }
            Err(e) => warn!(path = %info_path.display(), error = %e, "state document unreadable"),
        },
        Err(e) => warn!(path = %info_path.display(), error = %e, "no state document"),
    }

    let store = KnowledgeStore::open(&db_path).await?;
    let counts = store.count_by_path().await?;
    let width = counts.iter().map(|(path, _)| path.len()).max().unwrap_or(0);
    for (path, count) in &counts {
        println!("  {path:<width$}  {count}");
    }
    println!();
    println!("  {} records across {} files", store.count().await?, counts.len());
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        bar.set_message("Scanning source tree");
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn discovered(&self, to_process: usize) {
        self.bar.set_length(to_process as u64);
        self.bar.set_message("Extracting");
    }

    fn file_finished(&self, knowledge_path: &str, status: FileStatus) {
        self.bar.inc(1);
        match status {
            FileStatus::Committed { records } => {
                self.bar.set_message(format!("{knowledge_path} ({records} records)"));
            }
            FileStatus::Failed => self.bar.set_message(format!("{knowledge_path} (failed)")),
        }
    }

    fn done(&self, _report: &IngestReport) {
        self.bar.finish_and_clear();
    }
}
