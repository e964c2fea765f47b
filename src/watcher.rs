//! Directory watching with archive-set stabilization
//!
//! One watcher runs per enabled source directory. Filesystem events identify
//! the archive set a touched volume belongs to; the set then enters a polling
//! phase where size and mtime of every known volume are sampled at a fixed
//! interval. A set is submitted when two consecutive probes are identical
//! for every volume and the newest mtime has aged past the stabilization
//! window. Sets that refuse to settle are submitted anyway once they exceed
//! `max_file_age` and the queue rejects them if volumes are incomplete.
//!
//! Watchers never write into the directories they observe and hold no locks
//! on observed files.

use crate::archive::{self, ArchiveSet};
use crate::error::{Error, Result};
use crate::types::{DirectoryPair, SubmitSource};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An archive set ready for the queue
#[derive(Debug)]
pub struct Submission {
    /// The resolved archive set
    pub set: ArchiveSet,
    /// Source pair the set was found under
    pub pair: DirectoryPair,
    /// How it was found
    pub source: SubmitSource,
}

/// Tunables shared by all watchers
#[derive(Clone, Debug)]
pub struct WatcherSettings {
    /// Recognized archive-volume suffixes (e.g. `.rar`)
    pub extensions: Vec<String>,
    /// Quiescence window before a set counts as complete
    pub stabilization: Duration,
    /// Horizon after which an unstable set is submitted anyway
    pub max_file_age: Duration,
    /// Probe cadence for pending sets
    pub poll_interval: Duration,
}

impl WatcherSettings {
    /// Settings derived from the service configuration.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            extensions: config.options.extensions.clone(),
            stabilization: config.stabilization_window(),
            max_file_age: config.max_file_age(),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// One volume sample: path, size, mtime.
type Probe = Vec<(PathBuf, u64, SystemTime)>;

struct PendingSet {
    first_seen: Instant,
    last_probe: Option<Probe>,
}

/// Watches one source directory and emits stabilized archive sets
pub struct SourceWatcher {
    pair: DirectoryPair,
    settings: WatcherSettings,
    watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    pending: HashMap<PathBuf, PendingSet>,
    submit_tx: mpsc::UnboundedSender<Submission>,
}

impl SourceWatcher {
    /// Create a watcher for one directory pair.
    pub fn new(
        pair: DirectoryPair,
        settings: WatcherSettings,
        submit_tx: mpsc::UnboundedSender<Submission>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                if let Err(e) = tx.send(res) {
                    error!("failed to forward filesystem event: {}", e);
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        Ok(Self {
            pair,
            settings,
            watcher,
            rx,
            pending: HashMap::new(),
            submit_tx,
        })
    }

    /// Register the source directory with the filesystem watcher.
    pub fn start(&mut self) -> Result<()> {
        if !self.pair.source.exists() {
            std::fs::create_dir_all(&self.pair.source)
                .map_err(|e| Error::Watch(format!("failed to create source directory: {}", e)))?;
            info!(source = %self.pair.source.display(), "created source directory");
        }

        let mode = if self.pair.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.watcher
            .watch(&self.pair.source, mode)
            .map_err(|e| Error::Watch(format!("failed to watch directory: {}", e)))?;

        info!(
            source = %self.pair.source.display(),
            target = %self.pair.target.display(),
            strategy = %self.pair.strategy,
            "watching source directory"
        );
        Ok(())
    }

    /// Submit every archive set already present in the source.
    ///
    /// Existing sets skip stabilization; whatever was on disk before startup
    /// is not being copied by us anymore, and the queue re-checks volumes
    /// anyway.
    pub fn scan_existing(&self) {
        let mut found = 0usize;
        let mut first_volumes = Vec::new();
        collect_first_volumes(&self.pair.source, self.pair.recursive, &mut first_volumes);

        for first in first_volumes {
            let set = ArchiveSet::resolve(&first);
            if self
                .submit_tx
                .send(Submission {
                    set,
                    pair: self.pair.clone(),
                    source: SubmitSource::Existing,
                })
                .is_ok()
            {
                found += 1;
            }
        }
        if found > 0 {
            info!(source = %self.pair.source.display(), count = found, "submitted existing archive sets");
        } else {
            debug!(source = %self.pair.source.display(), "no existing archive sets");
        }
    }

    /// Event/probe loop; runs until the token fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(source = %self.pair.source.display(), "watcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.rx.recv() => {
                    match event {
                        Some(Ok(event)) => self.handle_event(event),
                        Some(Err(e)) => warn!(error = %e, "filesystem watcher error"),
                        None => break,
                    }
                }
                _ = ticker.tick() => self.probe_pending(),
            }
        }
        info!(source = %self.pair.source.display(), "watcher stopped");
    }

    /// Fold a filesystem event into the pending map.
    fn handle_event(&mut self, event: Event) {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        for path in event.paths {
            if !self.is_volume_file(&path) {
                continue;
            }
            let Some(stem) = archive::volume_stem(&path) else {
                continue;
            };
            let dir = path.parent().unwrap_or(self.pair.source.as_path());
            let Some(first) = archive::find_first_volume(dir, &stem) else {
                // The first volume has not appeared yet; its own event will
                // register the set.
                continue;
            };
            self.pending.entry(first.clone()).or_insert_with(|| {
                debug!(archive = %first.display(), "tracking archive set for stabilization");
                PendingSet {
                    first_seen: Instant::now(),
                    last_probe: None,
                }
            });
        }
    }

    /// Probe every pending set and submit the ones that settled.
    fn probe_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut done = Vec::new();

        for (first, state) in &mut self.pending {
            if !first.exists() {
                // Appeared then vanished before stabilization: no submission.
                debug!(archive = %first.display(), "pending set vanished");
                done.push((first.clone(), None));
                continue;
            }

            let set = ArchiveSet::resolve(first);
            let probe = sample(&set);

            let quiescent = state
                .last_probe
                .as_ref()
                .is_some_and(|previous| *previous == probe);
            let aged = newest_mtime(&probe)
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .is_some_and(|age| age >= self.settings.stabilization);

            if quiescent && aged {
                done.push((first.clone(), Some((set, SubmitSource::New))));
            } else if now.duration_since(state.first_seen) >= self.settings.max_file_age {
                warn!(
                    archive = %first.display(),
                    "set never stabilized, submitting anyway"
                );
                done.push((first.clone(), Some((set, SubmitSource::New))));
            } else {
                state.last_probe = Some(probe);
            }
        }

        for (first, submission) in done {
            self.pending.remove(&first);
            if let Some((set, source)) = submission {
                info!(archive = %set.first_volume.display(), "archive set stabilized");
                if self
                    .submit_tx
                    .send(Submission {
                        set,
                        pair: self.pair.clone(),
                        source,
                    })
                    .is_err()
                {
                    warn!("submission channel closed, dropping archive set");
                }
            }
        }
    }

    fn is_volume_file(&self, path: &Path) -> bool {
        if archive::volume_stem(path).is_some() {
            return true;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let lower = name.to_lowercase();
        self.settings
            .extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_lowercase()))
    }
}

/// Sample size and mtime of every volume, skipping files that vanish
/// mid-probe.
fn sample(set: &ArchiveSet) -> Probe {
    let mut probe: Probe = set
        .volumes
        .iter()
        .filter_map(|v| {
            let meta = std::fs::metadata(v).ok()?;
            let mtime = meta.modified().ok()?;
            Some((v.clone(), meta.len(), mtime))
        })
        .collect();
    probe.sort_by(|a, b| a.0.cmp(&b.0));
    probe
}

fn newest_mtime(probe: &Probe) -> Option<SystemTime> {
    probe.iter().map(|(_, _, m)| *m).max()
}

fn collect_first_volumes(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        warn!(dir = %dir.display(), "cannot scan directory");
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                collect_first_volumes(&path, true, out);
            }
            continue;
        }
        if archive::volume_stem(&path).is_some() && archive::is_first_volume(&path) {
            out.push(path);
        }
    }
}
