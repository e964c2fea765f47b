//! Core types and events

use crate::archive::ArchiveSet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// How an archive set entered the processing queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitSource {
    /// Detected by a directory watcher after stabilization
    New,
    /// Found by the startup scan of the watched directories
    Existing,
    /// Re-submitted by the retry timekeeper
    Retry,
    /// Submitted programmatically by an embedding application
    Manual,
}

impl std::fmt::Display for SubmitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitSource::New => write!(f, "new"),
            SubmitSource::Existing => write!(f, "existing"),
            SubmitSource::Retry => write!(f, "retry"),
            SubmitSource::Manual => write!(f, "manual"),
        }
    }
}

/// Materialization strategy for a source directory
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Decode entries onto disk inside the target directory
    Extract,
    /// Serve entries over the in-process HTTP range server via `.strm`
    /// pointer files (default)
    #[default]
    VirtualHttp,
    /// Mount the archive with an external helper and symlink entries
    ExternalMount,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Extract => write!(f, "extract"),
            StrategyKind::VirtualHttp => write!(f, "virtual_http"),
            StrategyKind::ExternalMount => write!(f, "external_mount"),
        }
    }
}

/// A watched source directory paired with its target and strategy
///
/// Resolved from `[[directory_pairs]]` in the configuration, falling back to
/// the global `[paths]` watch/target pair with the default processing mode.
#[derive(Clone, Debug)]
pub struct DirectoryPair {
    /// Directory observed for new archive sets
    pub source: PathBuf,
    /// Library directory the materialized files appear in
    pub target: PathBuf,
    /// Materialization strategy for this source
    pub strategy: StrategyKind,
    /// Media-server library section to refresh after success
    pub library_id: String,
    /// Whether this pair is active
    pub enabled: bool,
    /// Whether subdirectories of the source are observed too
    pub recursive: bool,
}

/// An archive set waiting for, or undergoing, processing
///
/// Invariants: `attempts` is monotonically non-decreasing; the queue never
/// holds two items for the same archive-set handle at once.
#[derive(Clone, Debug)]
pub struct QueueItem {
    /// The archive set to process
    pub set: ArchiveSet,
    /// Source/target/strategy binding for this item
    pub pair: DirectoryPair,
    /// How the item entered the queue
    pub source: SubmitSource,
    /// Number of processing attempts so far
    pub attempts: u32,
    /// When the item was first submitted (monotonic; drives the age bound)
    pub first_submitted: Instant,
}

impl QueueItem {
    /// Queue-wide identity of this item: the first volume path.
    pub fn handle(&self) -> &std::path::Path {
        self.set.handle()
    }
}

/// Structured record of one successfully processed archive set
#[derive(Clone, Debug, Serialize)]
pub struct ProcessedRecord {
    /// First volume of the processed set
    pub archive: PathBuf,
    /// Strategy that materialized the entries
    pub strategy: StrategyKind,
    /// Files now visible inside the target directory
    pub files: Vec<PathBuf>,
    /// Entries skipped by the duplicate index
    pub duplicates_skipped: usize,
    /// Entries dropped by the media/size filter
    pub entries_filtered: usize,
    /// Wall-clock processing time in milliseconds
    pub elapsed_ms: u64,
}

/// Lifecycle events broadcast to subscribers
///
/// Consumers subscribe via [`crate::RarBridge::subscribe`]; the channel is
/// lossy for slow subscribers (broadcast semantics), never for the pipeline.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Archive set accepted into the queue
    Queued {
        /// First volume path
        archive: PathBuf,
        /// Submission source
        source: SubmitSource,
    },

    /// Worker started processing an item
    Processing {
        /// First volume path
        archive: PathBuf,
        /// Attempt number (1-based)
        attempt: u32,
    },

    /// Archive set fully processed
    Processed(ProcessedRecord),

    /// Item failed transiently and was rescheduled
    RetryScheduled {
        /// First volume path
        archive: PathBuf,
        /// Attempts so far
        attempts: u32,
        /// Delay before the item returns to the pending queue
        delay_secs: u64,
        /// Failure that caused the retry
        reason: String,
    },

    /// Item failed terminally; the set was moved to the failed directory
    Quarantined {
        /// First volume path
        archive: PathBuf,
        /// Failure that caused the quarantine
        reason: String,
    },

    /// A materialized entry matched an existing fingerprint and was skipped
    DuplicateSkipped {
        /// Entry path inside the archive
        entry: PathBuf,
        /// Path of the previously materialized copy
        existing: PathBuf,
    },

    /// The media server was asked to rescan a library section
    LibraryRefreshed {
        /// Section identifier that was refreshed
        library_id: String,
    },
}

/// Monotonic counters describing the service since startup
#[derive(Debug, Default)]
pub struct BridgeStats {
    queued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    duplicates: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Archive sets accepted into the queue
    pub queued: u64,
    /// Archive sets processed successfully
    pub processed: u64,
    /// Archive sets quarantined
    pub failed: u64,
    /// Retry attempts scheduled
    pub retries: u64,
    /// Entries skipped as duplicates
    pub duplicates: u64,
}

impl BridgeStats {
    /// Record a queue acceptance.
    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful processing.
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a quarantine.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a scheduled retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a duplicate skip.
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}
