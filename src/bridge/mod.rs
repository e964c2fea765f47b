//! Core service implementation
//!
//! [`RarBridge`] wires the watchers, the processing queue, the worker, the
//! virtual-HTTP server and the duplicate index together and supervises their
//! lifecycles. All fields are Arc-wrapped; the struct is cheap to clone and
//! share across tasks.

mod worker;

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::materialize::mount::MountManager;
use crate::notifier::LibraryNotifier;
use crate::queue::ProcessingQueue;
use crate::reencode::{CliReencoder, NoOpReencoder, ReencodeHook};
use crate::types::{BridgeStats, Event, StatsSnapshot, SubmitSource};
use crate::vfs::{ArchiveEntrySource, TokenRegistry, VfsHandle};
use crate::watcher::{SourceWatcher, Submission, WatcherSettings};
use crate::{archive, vfs};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cadence the retry timekeeper falls back to while no retry is scheduled.
const TIMEKEEPER_IDLE: Duration = Duration::from_secs(1);

struct Runtime {
    watch_cancel: CancellationToken,
    stop: CancellationToken,
    abort: CancellationToken,
    http_cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
    started: bool,
}

impl Runtime {
    fn new() -> Self {
        Self {
            watch_cancel: CancellationToken::new(),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            http_cancel: CancellationToken::new(),
            tasks: Vec::new(),
            worker: None,
            started: false,
        }
    }
}

/// The RAR bridge service (cloneable; all fields are Arc-wrapped)
#[derive(Clone)]
pub struct RarBridge {
    config: Arc<Config>,
    db: Arc<Database>,
    queue: Arc<ProcessingQueue>,
    registry: Arc<TokenRegistry>,
    notifier: Arc<LibraryNotifier>,
    mounts: Arc<MountManager>,
    reencoder: Arc<dyn ReencodeHook>,
    event_tx: broadcast::Sender<Event>,
    stats: Arc<BridgeStats>,
    vfs: Arc<OnceLock<VfsHandle>>,
    runtime: Arc<Mutex<Runtime>>,
}

impl std::fmt::Debug for RarBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RarBridge").finish_non_exhaustive()
    }
}

impl RarBridge {
    /// Create the service: validate configuration, prepare the directory
    /// layout and open the duplicate index.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        for dir in [config.work_dir(), config.failed_dir(), config.archive_dir()] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to create directory '{}': {}", dir.display(), e),
                ))
            })?;
        }

        let db = Database::new(&config.database_path()).await?;

        let queue = ProcessingQueue::new(
            config.options.max_retry_attempts,
            config.retry_interval(),
            config.max_retry_age(),
        );

        let reencoder: Arc<dyn ReencodeHook> = match CliReencoder::from_config(&config.reencode) {
            Some(hook) => Arc::new(hook),
            None => Arc::new(NoOpReencoder),
        };
        info!(reencoder = reencoder.name(), "re-encode hook selected");

        let notifier = LibraryNotifier::new(config.plex.clone());
        let mounts = MountManager::new(config.external_mount.clone(), config.mounts_dir());

        let (event_tx, _rx) = broadcast::channel(1000);

        Ok(Self {
            config: Arc::new(config),
            db: Arc::new(db),
            queue: Arc::new(queue),
            registry: Arc::new(TokenRegistry::new()),
            notifier: Arc::new(notifier),
            mounts: Arc::new(mounts),
            reencoder,
            event_tx,
            stats: Arc::new(BridgeStats::default()),
            vfs: Arc::new(OnceLock::new()),
            runtime: Arc::new(Mutex::new(Runtime::new())),
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Counters since startup.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Where the virtual-HTTP server is reachable, once started.
    pub fn vfs_handle(&self) -> Option<VfsHandle> {
        self.vfs.get().cloned()
    }

    /// Submit an archive set programmatically.
    ///
    /// The path must live under one of the configured source directories;
    /// the matching pair's target and strategy apply.
    pub async fn submit_archive(&self, first_volume: &Path) -> Result<bool> {
        let pair = self
            .config
            .directory_pairs()
            .into_iter()
            .find(|p| first_volume.starts_with(&p.source))
            .ok_or_else(|| {
                Error::Watch(format!(
                    "{} is not under any configured source",
                    first_volume.display()
                ))
            })?;

        let set = archive::ArchiveSet::resolve(first_volume);
        let accepted = self.queue.submit(set, pair, SubmitSource::Manual);
        if accepted {
            self.stats.record_queued();
            self.emit(Event::Queued {
                archive: first_volume.to_path_buf(),
                source: SubmitSource::Manual,
            });
        }
        Ok(accepted)
    }

    /// Start the long-running tasks: virtual-HTTP server (when any source
    /// needs it), watchers, the retry timekeeper and the worker.
    ///
    /// # Errors
    ///
    /// Startup failures are fatal: no free port in the configured range, no
    /// decoder binary for a virtual-http source, or an unwatchable source
    /// directory.
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.started {
            return Ok(());
        }

        clean_work_dir(&self.config.work_dir()).await;

        let pairs = self.config.directory_pairs();
        if pairs.is_empty() {
            return Err(Error::Config {
                message: "no enabled directory pairs".into(),
                key: Some("directory_pairs".into()),
            });
        }

        // Range server first: a virtual-http source without it is useless,
        // and port exhaustion must abort startup with a clear error.
        let needs_vfs = pairs
            .iter()
            .any(|p| p.strategy == crate::types::StrategyKind::VirtualHttp);
        if needs_vfs {
            let (listener, handle) = vfs::bind(&self.config.virtual_http).await?;
            let unrar_bin = resolve_unrar(&self.config)?;
            let state = vfs::server::ServerState::new(
                Arc::clone(&self.registry),
                Arc::new(ArchiveEntrySource::new(unrar_bin)),
                self.config.virtual_http.stream_chunk_size,
            );
            let max_streams = self.config.virtual_http.max_concurrent_streams;
            let cancel = runtime.http_cancel.clone();
            let _ = self.vfs.set(handle);
            runtime.tasks.push(tokio::spawn(vfs::server::serve(
                listener,
                state,
                max_streams,
                cancel,
            )));
        }

        // Watchers feed submissions into the queue through one channel.
        let (submit_tx, submit_rx) = mpsc::unbounded_channel::<Submission>();
        let settings = WatcherSettings::from_config(&self.config);
        for pair in pairs {
            let mut watcher = SourceWatcher::new(pair, settings.clone(), submit_tx.clone())?;
            watcher.start()?;
            if self.config.options.scan_existing_files {
                watcher.scan_existing();
            }
            let watch_cancel = runtime.watch_cancel.clone();
            runtime.tasks.push(tokio::spawn(watcher.run(watch_cancel)));
        }
        drop(submit_tx);

        runtime.tasks.push(tokio::spawn(ingest(
            submit_rx,
            Arc::clone(&self.queue),
            Arc::clone(&self.stats),
            self.event_tx.clone(),
        )));

        let watch_cancel = runtime.watch_cancel.clone();
        runtime.tasks.push(tokio::spawn(retry_timekeeper(
            Arc::clone(&self.queue),
            watch_cancel,
        )));

        let ctx = worker::WorkerContext {
            config: Arc::clone(&self.config),
            db: Arc::clone(&self.db),
            queue: Arc::clone(&self.queue),
            registry: Arc::clone(&self.registry),
            vfs: Arc::clone(&self.vfs),
            notifier: Arc::clone(&self.notifier),
            mounts: Arc::clone(&self.mounts),
            reencoder: Arc::clone(&self.reencoder),
            event_tx: self.event_tx.clone(),
            stats: Arc::clone(&self.stats),
            stop: runtime.stop.clone(),
            abort: runtime.abort.clone(),
        };
        runtime.worker = Some(tokio::spawn(worker::run(ctx)));

        runtime.started = true;
        info!("bridge started");
        Ok(())
    }

    /// Graceful shutdown: stop the watchers first, drain the worker under
    /// the grace budget, release mounts, stop the HTTP server last so
    /// in-flight range requests complete.
    pub async fn shutdown(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if !runtime.started {
            return Ok(());
        }
        info!("shutting down");

        runtime.watch_cancel.cancel();
        runtime.stop.cancel();

        if let Some(worker) = runtime.worker.take() {
            let grace = self.config.shutdown_grace();
            if tokio::time::timeout(grace, worker).await.is_err() {
                warn!("grace period elapsed, aborting in-flight materialization");
                runtime.abort.cancel();
                // The worker notices the abort at its next suspension point.
            }
        }

        self.mounts.release_all().await;

        runtime.http_cancel.cancel();
        for task in runtime.tasks.drain(..) {
            let _ = task.await;
        }

        self.registry.purge().await;
        clean_work_dir(&self.config.work_dir()).await;
        self.db.close().await;

        runtime.started = false;
        info!("shutdown complete");
        Ok(())
    }

    fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }
}

/// Forward watcher submissions into the queue.
async fn ingest(
    mut rx: mpsc::UnboundedReceiver<Submission>,
    queue: Arc<ProcessingQueue>,
    stats: Arc<BridgeStats>,
    event_tx: broadcast::Sender<Event>,
) {
    while let Some(submission) = rx.recv().await {
        let archive = submission.set.first_volume.clone();
        let source = submission.source;
        if queue.submit(submission.set, submission.pair, source) {
            stats.record_queued();
            let _ = event_tx.send(Event::Queued { archive, source });
        }
    }
}

/// Move due retries back to pending; a single clock and a small heap, no
/// per-item timers.
async fn retry_timekeeper(queue: Arc<ProcessingQueue>, cancel: CancellationToken) {
    loop {
        let wait = queue
            .next_due_in()
            .unwrap_or(TIMEKEEPER_IDLE)
            .max(Duration::from_millis(10));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => queue.promote_due(),
        }
    }
}

/// Empty and recreate the extraction scratch directory.
async fn clean_work_dir(work_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(work_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!(work_dir = %work_dir.display(), error = %e, "could not clean work directory");
        }
    }
    if let Err(e) = tokio::fs::create_dir_all(work_dir).await {
        error!(work_dir = %work_dir.display(), error = %e, "could not recreate work directory");
    }
}

/// Locate the decoder binary for the range server.
fn resolve_unrar(config: &Config) -> Result<std::path::PathBuf> {
    match (&config.tools.unrar_path, config.tools.search_path) {
        (Some(path), _) => Ok(path.clone()),
        (None, true) => which::which("unrar")
            .map_err(|_| Error::ExternalTool("unrar not found in PATH".into())),
        (None, false) => Err(Error::ExternalTool(
            "no unrar binary configured and PATH search disabled".into(),
        )),
    }
}
