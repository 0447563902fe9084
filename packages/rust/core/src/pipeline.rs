//! End-to-end `ingest` pipeline: source tree → extract → sections → knowledge base.
//!
//! Files are extracted concurrently by a bounded worker pool. A single
//! committer applies each file's store replacement and state update in turn,
//! so the knowledge store and the doc-tree state are only written from one
//! place and a file's pair of writes is never split by another file's.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, UNIX_EPOCH};

use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use walkdir::WalkDir;

use kbforge_markdown::{SectionOptions, SectionSource, build_sections, render_title_prefix};
use kbforge_shared::{KNOWLEDGE_DB_FILE_NAME, KbForgeError, QaRecord, Result};
use kbforge_storage::{DocTreeState, KnowledgeStore};

use crate::extract::{Extraction, Extractor, ExtractorRegistry, HeadingLevels, Selection, SourceFile};
use crate::pages::assemble_pages;
use crate::reconcile::{HeadingClassifier, reconcile};

/// Configuration for one `ingest` run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Directory tree to ingest.
    pub source_root: PathBuf,
    /// Knowledge base directory (`knowledge.db` and `kb_info.json`).
    pub output_dir: PathBuf,
    /// Title prefix template (`%parent`, `%parent_N`, `%file`, or literal text).
    pub title_prefix: String,
    /// Files extracted at once.
    pub concurrency: usize,
    /// Reprocess files even when their mtime is unchanged.
    pub force: bool,
}

/// Cooperative cancellation shared with signal handlers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters for a finished run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// Files extracted and committed.
    pub processed: usize,
    /// Files skipped because their mtime was not newer than the recorded one.
    pub unchanged: usize,
    /// Hidden, temporary, or pattern-ignored files.
    pub ignored: usize,
    /// Files with no extractor for their type.
    pub unsupported: usize,
    /// Files whose extraction failed.
    pub failed: usize,
    /// Records written across all committed files.
    pub records_written: usize,
    /// Whether the run stopped dispatching early.
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// How one dispatched file ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Committed { records: usize },
    Failed,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called once the walk is done, with the number of files to extract.
    fn discovered(&self, to_process: usize);
    /// Called after each dispatched file is committed or has failed.
    fn file_finished(&self, knowledge_path: &str, status: FileStatus);
    /// Called when the run completes.
    fn done(&self, report: &IngestReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn discovered(&self, _to_process: usize) {}
    fn file_finished(&self, _knowledge_path: &str, _status: FileStatus) {}
    fn done(&self, _report: &IngestReport) {}
}

/// A changed file waiting for extraction.
struct FileJob {
    source: SourceFile,
    rel_path: PathBuf,
    /// Observed before extraction; this is what gets recorded.
    mtime: f64,
    extractor: Arc<dyn Extractor>,
}

struct FileOutcome {
    knowledge_path: String,
    rel_path: PathBuf,
    mtime: f64,
    result: Result<Vec<QaRecord>>,
}

/// Shared by all workers.
struct WorkContext {
    classifier: Arc<dyn HeadingClassifier>,
    title_template: String,
}

/// Run the ingest pipeline over `config.source_root`.
///
/// Returns `Err` only for an invalid source root or a failure to write the
/// knowledge store or state document. Per-file failures are counted.
#[instrument(skip_all, fields(root = %config.source_root.display(), out = %config.output_dir.display()))]
pub async fn ingest(
    config: &IngestConfig,
    registry: &ExtractorRegistry,
    classifier: Arc<dyn HeadingClassifier>,
    progress: &dyn ProgressReporter,
    cancel: &CancelFlag,
) -> Result<IngestReport> {
    let start = Instant::now();
    let root = validate_root(&config.source_root).await?;

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .map_err(|e| KbForgeError::io(&config.output_dir, e))?;
    let store = KnowledgeStore::open(&config.output_dir.join(KNOWLEDGE_DB_FILE_NAME)).await?;
    let mut state = DocTreeState::load_or_create(&config.output_dir, &root).await?;

    let mut report = IngestReport::default();
    let output_dir = tokio::fs::canonicalize(&config.output_dir)
        .await
        .map_err(|e| KbForgeError::io(&config.output_dir, e))?;
    let jobs = plan(&root, &output_dir, registry, &state, config.force, &mut report);

    info!(
        to_process = jobs.len(),
        unchanged = report.unchanged,
        ignored = report.ignored,
        unsupported = report.unsupported,
        "source tree scanned"
    );
    progress.discovered(jobs.len());

    let ctx = Arc::new(WorkContext {
        classifier,
        title_template: config.title_prefix.clone(),
    });
    let concurrency = config.concurrency.max(1);
    let (tx, mut rx) = mpsc::channel::<FileOutcome>(concurrency);
    let dispatcher = tokio::spawn(dispatch(jobs, ctx, tx, cancel.clone(), concurrency));

    while let Some(outcome) = rx.recv().await {
        match outcome.result {
            Ok(records) => {
                let committed = commit(
                    &store,
                    &mut state,
                    &outcome.knowledge_path,
                    &outcome.rel_path,
                    outcome.mtime,
                    &records,
                )
                .await;
                let written = match committed {
                    Ok(written) => written,
                    Err(e) => {
                        dispatcher.abort();
                        return Err(e);
                    }
                };
                report.processed += 1;
                report.records_written += written;
                progress.file_finished(&outcome.knowledge_path, FileStatus::Committed { records: written });
            }
            Err(e) if e.is_fatal() => {
                dispatcher.abort();
                return Err(e);
            }
            Err(e) => {
                warn!(path = %outcome.knowledge_path, error = %e, "file failed, skipping");
                report.failed += 1;
                progress.file_finished(&outcome.knowledge_path, FileStatus::Failed);
            }
        }
    }

    if let Err(e) = dispatcher.await {
        warn!(error = %e, "dispatcher task failed");
    }

    report.cancelled = cancel.is_cancelled();
    report.elapsed = start.elapsed();
    info!(
        processed = report.processed,
        failed = report.failed,
        records = report.records_written,
        cancelled = report.cancelled,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "ingest finished"
    );
    progress.done(&report);
    Ok(report)
}

async fn validate_root(root: &Path) -> Result<PathBuf> {
    let meta = tokio::fs::metadata(root)
        .await
        .map_err(|e| KbForgeError::io(root, e))?;
    if !meta.is_dir() {
        return Err(KbForgeError::validation(format!(
            "input root {} is not a directory",
            root.display()
        )));
    }
    tokio::fs::canonicalize(root)
        .await
        .map_err(|e| KbForgeError::io(root, e))
}

/// Walk the source tree and decide what to do with each file.
fn plan(
    root: &Path,
    output_dir: &Path,
    registry: &ExtractorRegistry,
    state: &DocTreeState,
    force: bool,
    report: &mut IngestReport,
) -> Vec<FileJob> {
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            !hidden && entry.path() != output_dir
        });

    let mut jobs = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "unreadable entry in source tree, skipping");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(rel_path) = entry.path().strip_prefix(root) else {
            continue;
        };
        let knowledge_path = knowledge_path(rel_path);

        let extractor = match registry.select(&knowledge_path) {
            Selection::Extractor(extractor) => extractor,
            Selection::Ignored => {
                report.ignored += 1;
                continue;
            }
            Selection::Unsupported => {
                debug!(path = %knowledge_path, "no extractor for file type");
                report.unsupported += 1;
                continue;
            }
        };

        let mtime = match entry.metadata() {
            Ok(meta) => mtime_secs(&meta),
            Err(e) => {
                warn!(path = %knowledge_path, error = %e, "cannot stat file, skipping");
                report.failed += 1;
                continue;
            }
        };
        if !force && !state.is_new_or_changed(rel_path, mtime) {
            report.unchanged += 1;
            continue;
        }

        jobs.push(FileJob {
            source: SourceFile {
                path: entry.path().to_path_buf(),
                knowledge_path,
            },
            rel_path: rel_path.to_path_buf(),
            mtime,
            extractor,
        });
    }
    jobs
}

/// Dispatch jobs to workers, at most `concurrency` at a time.
async fn dispatch(
    jobs: Vec<FileJob>,
    ctx: Arc<WorkContext>,
    tx: mpsc::Sender<FileOutcome>,
    cancel: CancelFlag,
    concurrency: usize,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut handles = Vec::new();
    let total = jobs.len();

    for (i, job) in jobs.into_iter().enumerate() {
        if cancel.is_cancelled() {
            info!(remaining = total - i, "cancelled, no further files dispatched");
            break;
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        if cancel.is_cancelled() {
            info!(remaining = total - i, "cancelled, no further files dispatched");
            break;
        }

        let tx = tx.clone();
        let ctx = Arc::clone(&ctx);
        let span = info_span!("file", path = %job.source.knowledge_path, extractor = job.extractor.name());
        handles.push(tokio::spawn(
            async move {
                let _permit = permit;
                let result = process_file(&job, &ctx).await;
                let outcome = FileOutcome {
                    knowledge_path: job.source.knowledge_path,
                    rel_path: job.rel_path,
                    mtime: job.mtime,
                    result,
                };
                if tx.send(outcome).await.is_err() {
                    debug!("committer stopped, result dropped");
                }
            }
            .instrument(span),
        ));
    }
    drop(tx);

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "worker task failed");
        }
    }
}

/// Extract one file and turn it into records.
async fn process_file(job: &FileJob, ctx: &WorkContext) -> Result<Vec<QaRecord>> {
    let extraction = job.extractor.extract(&job.source).await?;

    let parents = parent_dirs(&job.rel_path);
    let file_stem = job
        .rel_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let title_prefix = render_title_prefix(&ctx.title_template, &parents, &file_stem);
    let knowledge_path = job.source.knowledge_path.as_str();

    let records = match extraction {
        Extraction::Document {
            markdown,
            levels,
            reference_toc,
            synthesize_root,
        } => {
            let markdown = match levels {
                HeadingLevels::Reliable => markdown,
                HeadingLevels::Flat => reconcile(&markdown, &reference_toc, ctx.classifier.as_ref()).await,
            };
            let source = SectionSource {
                knowledge_path,
                file_stem: &file_stem,
                title_prefix: &title_prefix,
            };
            let opts = SectionOptions {
                synthesize_root,
                ..SectionOptions::default()
            };
            build_sections(&markdown, source, &opts).into_records(knowledge_path)
        }
        Extraction::Pages(pages) => assemble_pages(&pages, &title_prefix, knowledge_path),
    };

    if records.is_empty() {
        debug!("file produced no records");
    }
    Ok(records)
}

/// Apply one file's store replacement, then its state update.
async fn commit(
    store: &KnowledgeStore,
    state: &mut DocTreeState,
    knowledge_path: &str,
    rel_path: &Path,
    mtime: f64,
    records: &[QaRecord],
) -> Result<usize> {
    let written = store.replace_file(knowledge_path, records).await?;
    state.record_updated(rel_path, mtime);
    state.persist().await?;
    Ok(written)
}

fn knowledge_path(rel_path: &Path) -> String {
    rel_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn parent_dirs(rel_path: &Path) -> Vec<String> {
    rel_path
        .parent()
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

fn mtime_secs(meta: &std::fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0.0, |d| d.as_secs_f64())
}
