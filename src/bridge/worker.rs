//! The queue worker
//!
//! One task drains the processing queue, strictly serially. For each item:
//! open the set, gate on encryption and integrity, enumerate and filter
//! entries, materialize every survivor with the source's strategy, then
//! notify the library and dispose of the archives. Transient failures go
//! back through the retry timekeeper at a constant cadence; terminal
//! failures quarantine the whole set into `failed/`.

use crate::archive::{ArchiveEntry, ArchiveSet, EntryFilter, RarSession};
use crate::config::Config;
use crate::db::Database;
use crate::disposer;
use crate::error::{ArchiveError, Error, Result};
use crate::materialize::mount::MountManager;
use crate::materialize::{effective_strategy, extract, virtual_http};
use crate::notifier::LibraryNotifier;
use crate::queue::{ProcessingQueue, RetryDecision};
use crate::reencode::ReencodeHook;
use crate::types::{BridgeStats, Event, ProcessedRecord, QueueItem, StrategyKind};
use crate::vfs::{TokenRegistry, VfsHandle};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct WorkerContext {
    pub(crate) config: Arc<Config>,
    pub(crate) db: Arc<Database>,
    pub(crate) queue: Arc<ProcessingQueue>,
    pub(crate) registry: Arc<TokenRegistry>,
    pub(crate) vfs: Arc<OnceLock<VfsHandle>>,
    pub(crate) notifier: Arc<LibraryNotifier>,
    pub(crate) mounts: Arc<MountManager>,
    pub(crate) reencoder: Arc<dyn ReencodeHook>,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) stats: Arc<BridgeStats>,
    pub(crate) stop: CancellationToken,
    pub(crate) abort: CancellationToken,
}

impl WorkerContext {
    fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }
}

/// Worker loop: drain the queue until told to stop, finishing the current
/// item before exiting.
pub(crate) async fn run(ctx: WorkerContext) {
    info!("queue worker started");
    loop {
        if ctx.stop.is_cancelled() {
            break;
        }
        let Some(item) = ctx.queue.take_next() else {
            tokio::select! {
                _ = ctx.stop.cancelled() => break,
                _ = ctx.queue.ready() => {}
            }
            continue;
        };
        process_item(&ctx, item).await;
    }
    info!("queue worker stopped");
}

async fn process_item(ctx: &WorkerContext, item: QueueItem) {
    let archive = item.set.first_volume.clone();
    info!(
        archive = %archive.display(),
        attempt = item.attempts,
        source = %item.source,
        "processing archive set"
    );
    ctx.emit(Event::Processing {
        archive: archive.clone(),
        attempt: item.attempts,
    });

    match process_set(ctx, &item).await {
        Ok(record) => {
            ctx.queue.finish(&archive);
            ctx.stats.record_processed();
            info!(
                archive = %archive.display(),
                files = record.files.len(),
                elapsed_ms = record.elapsed_ms,
                "archive set processed"
            );
            ctx.emit(Event::Processed(record));
        }
        Err(Error::ShuttingDown) => {
            // Aborted mid-entry during shutdown. The source archives stay in
            // place; the startup scan resubmits them on the next run.
            warn!(archive = %archive.display(), "processing aborted by shutdown");
            ctx.queue.finish(&archive);
        }
        Err(e) if e.is_retryable() && !e.quarantines_immediately() => {
            let reason = e.to_string();
            let attempts = item.attempts;
            match ctx.queue.try_schedule_retry(item) {
                RetryDecision::Scheduled => {
                    ctx.stats.record_retry();
                    let delay_secs = ctx.config.options.retry_interval;
                    info!(
                        archive = %archive.display(),
                        attempts,
                        delay_secs,
                        reason = %reason,
                        "retry scheduled"
                    );
                    ctx.emit(Event::RetryScheduled {
                        archive,
                        attempts,
                        delay_secs,
                        reason,
                    });
                }
                RetryDecision::AttemptsExhausted => {
                    quarantine(ctx, &archive, format!("retry attempts exhausted: {reason}")).await;
                }
                RetryDecision::TooOld => {
                    quarantine(ctx, &archive, format!("retry age exceeded: {reason}")).await;
                }
            }
        }
        Err(e) => {
            ctx.queue.finish(&archive);
            quarantine(ctx, &archive, e.to_string()).await;
        }
    }
}

/// Move the set into `failed/` and record the terminal failure.
async fn quarantine(ctx: &WorkerContext, archive: &Path, reason: String) {
    warn!(archive = %archive.display(), reason = %reason, "quarantining archive set");
    let set = ArchiveSet::resolve(archive);
    disposer::quarantine(&set, &ctx.config.failed_dir()).await;
    ctx.stats.record_failed();
    ctx.emit(Event::Quarantined {
        archive: archive.to_path_buf(),
        reason,
    });
}

/// The per-item pipeline: gate, enumerate, materialize, notify, dispose.
async fn process_set(ctx: &WorkerContext, item: &QueueItem) -> Result<ProcessedRecord> {
    let started = Instant::now();

    // Re-resolve: volumes may have appeared since submission.
    let set = ArchiveSet::resolve(item.handle());
    let session = RarSession::open(set, &ctx.config.tools, ctx.config.test_timeout())?;

    if session.is_encrypted()? {
        return Err(ArchiveError::Encrypted {
            archive: item.handle().to_path_buf(),
        }
        .into());
    }
    session.test().await?;

    let filter = EntryFilter {
        min_size: ctx.config.options.min_file_size,
        max_size: ctx.config.options.max_file_size,
    };
    let mut kept = Vec::new();
    let mut filtered = 0usize;
    for entry in session.entries()? {
        match filter.skip_reason(&entry) {
            None => kept.push(entry),
            Some(reason) => {
                debug!(entry = %entry.path.display(), reason, "entry skipped");
                filtered += 1;
            }
        }
    }

    let strategy = effective_strategy(
        item.pair.strategy,
        session.set().total_size(),
        ctx.config.virtual_http.fallback_threshold,
    );

    let mut files = Vec::new();
    let mut duplicates = 0usize;

    if kept.is_empty() {
        // Empty processing still disposes the source but never rings the
        // media server.
        info!(archive = %item.handle().display(), "no media entries survived the filter");
    } else {
        match strategy {
            StrategyKind::Extract => {
                let work_dir = ctx.config.work_dir().join(&session.set().stem);
                let result = extract_all(ctx, &session, &kept, &work_dir, item).await;
                let _ = tokio::fs::remove_dir_all(&work_dir).await;
                let (extracted, dups) = result?;
                files = extracted;
                duplicates = dups;
            }
            StrategyKind::VirtualHttp => {
                let Some(handle) = ctx.vfs.get() else {
                    let [lo, hi] = ctx.config.virtual_http.port_range;
                    return Err(Error::PortUnavailable { lo, hi });
                };
                for entry in &kept {
                    let pointer = virtual_http::materialize_entry(
                        &ctx.registry,
                        handle,
                        session.set().handle(),
                        entry,
                        &item.pair.target,
                    )
                    .await?;
                    files.push(pointer);
                }
            }
            StrategyKind::ExternalMount => {
                files = ctx
                    .mounts
                    .materialize_set(session.set(), &kept, &item.pair.target)
                    .await?;
            }
        }
    }

    if !files.is_empty() && ctx.notifier.refresh_section(&item.pair.library_id).await {
        ctx.emit(Event::LibraryRefreshed {
            library_id: item.pair.library_id.clone(),
        });
    }

    dispose_set(ctx, &session, item, strategy).await;

    Ok(ProcessedRecord {
        archive: item.handle().to_path_buf(),
        strategy,
        files,
        duplicates_skipped: duplicates,
        entries_filtered: filtered,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

async fn extract_all(
    ctx: &WorkerContext,
    session: &RarSession,
    entries: &[ArchiveEntry],
    work_dir: &Path,
    item: &QueueItem,
) -> Result<(Vec<PathBuf>, usize)> {
    let dedup: Option<&Database> = if ctx.config.options.duplicate_check {
        Some(ctx.db.as_ref())
    } else {
        None
    };

    let mut files = Vec::new();
    let mut duplicates = 0usize;
    for entry in entries {
        let entry_name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "entry".to_string());
        let reader = session.open_entry(entry);
        match extract::materialize_entry(
            reader,
            &entry_name,
            entry.size,
            work_dir,
            &item.pair.target,
            dedup,
            ctx.reencoder.as_ref(),
            &ctx.abort,
        )
        .await?
        {
            extract::ExtractOutcome::Materialized(path) => files.push(path),
            extract::ExtractOutcome::Duplicate { existing } => {
                duplicates += 1;
                ctx.stats.record_duplicate();
                ctx.emit(Event::DuplicateSkipped {
                    entry: entry.path.clone(),
                    existing,
                });
            }
        }
    }
    Ok((files, duplicates))
}

/// Dispose of the source set per configuration.
///
/// Disposal failures are logged and swallowed; the archive already produced
/// its files and must not be re-queued. Relocated virtual-http sets have
/// their token registrations repointed so pointer files keep playing;
/// deleting them instead is the operator's documented trade-off.
async fn dispose_set(
    ctx: &WorkerContext,
    session: &RarSession,
    item: &QueueItem,
    strategy: StrategyKind,
) {
    let set = session.set();
    let delete = ctx.config.options.delete_archives;

    if delete && strategy == StrategyKind::VirtualHttp {
        warn!(
            archive = %set.first_volume.display(),
            "deleting archives under virtual-http makes existing pointer files unusable"
        );
    }

    let archive_dir = ctx.config.archive_dir();
    if let Err(e) = disposer::dispose(set, &item.pair.source, delete, &archive_dir).await {
        tracing::error!(
            archive = %set.first_volume.display(),
            error = %e,
            "disposal failed, leaving source in place"
        );
        return;
    }

    if !delete && strategy == StrategyKind::VirtualHttp {
        let prefix = set
            .first_volume
            .parent()
            .and_then(|p| p.strip_prefix(&item.pair.source).ok())
            .unwrap_or_else(|| Path::new(""));
        if let Some(name) = set.first_volume.file_name() {
            let new_path = archive_dir.join(prefix).join(name);
            let moved = ctx
                .registry
                .rebase_archive(&set.first_volume, &new_path)
                .await;
            if moved > 0 {
                debug!(
                    old = %set.first_volume.display(),
                    new = %new_path.display(),
                    tokens = moved,
                    "rebased token registrations after relocation"
                );
            }
        }
    }
}
