//! Single-worker processing queue
//!
//! The queue is the central synchronization point of the service: every
//! expensive operation runs on the one worker draining it. It keeps three
//! structures under one lock:
//!
//! - a FIFO of pending items,
//! - the set of archive-set handles in any non-terminal state (pending,
//!   running or retry-scheduled), which dedups submissions,
//! - a due-heap of retry-scheduled items keyed on a single monotonic clock.
//!
//! Retry-scheduled items do not occupy the worker; the retry timekeeper task
//! promotes them back to pending when their delay elapses. Retries go to the
//! back of the queue.

use crate::archive::ArchiveSet;
use crate::types::{DirectoryPair, QueueItem, SubmitSource};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// Why a retry was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The item was re-scheduled and will return to pending after the delay
    Scheduled,
    /// The attempt budget is spent; quarantine the item
    AttemptsExhausted,
    /// The item has been failing for longer than the age bound; quarantine
    TooOld,
}

struct DueEntry {
    due: Instant,
    item: QueueItem,
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for DueEntry {}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due)
    }
}

struct QueueInner {
    pending: VecDeque<QueueItem>,
    tracked: HashSet<PathBuf>,
    retries: BinaryHeap<Reverse<DueEntry>>,
    running: Option<PathBuf>,
}

/// FIFO queue with bounded retries and submission dedup
pub struct ProcessingQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_attempts: u32,
    max_age: Duration,
    retry_delay: Duration,
}

impl ProcessingQueue {
    /// Create a queue with the configured retry policy.
    pub fn new(max_attempts: u32, retry_delay: Duration, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                tracked: HashSet::new(),
                retries: BinaryHeap::new(),
                running: None,
            }),
            notify: Notify::new(),
            max_attempts,
            max_age,
            retry_delay,
        }
    }

    /// Submit an archive set; duplicates across all non-terminal states are
    /// dropped.
    ///
    /// Returns whether the item was accepted.
    pub fn submit(&self, set: ArchiveSet, pair: DirectoryPair, source: SubmitSource) -> bool {
        let mut inner = self.lock();
        let handle = set.first_volume.clone();
        if !inner.tracked.insert(handle.clone()) {
            debug!(archive = %handle.display(), "duplicate submission dropped");
            return false;
        }
        inner.pending.push_back(QueueItem {
            set,
            pair,
            source,
            attempts: 0,
            first_submitted: Instant::now(),
        });
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Dequeue the next pending item and mark it running.
    ///
    /// At most one item is ever running; callers must pass the previous item
    /// to [`finish`](Self::finish) or [`try_schedule_retry`](Self::try_schedule_retry)
    /// first.
    pub fn take_next(&self) -> Option<QueueItem> {
        let mut inner = self.lock();
        Self::promote_due_locked(&mut inner);
        if inner.running.is_some() {
            return None;
        }
        let mut item = inner.pending.pop_front()?;
        item.attempts = item.attempts.saturating_add(1);
        inner.running = Some(item.set.first_volume.clone());
        Some(item)
    }

    /// Terminal transition: the item succeeded or was quarantined.
    pub fn finish(&self, handle: &std::path::Path) {
        let mut inner = self.lock();
        inner.tracked.remove(handle);
        if inner.running.as_deref() == Some(handle) {
            inner.running = None;
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Try to re-schedule a failed item at the configured cadence.
    ///
    /// The handle stays tracked while retry-scheduled, so re-submissions from
    /// the watcher are still deduplicated. On `AttemptsExhausted`/`TooOld`
    /// the item leaves the queue entirely; the caller quarantines it.
    pub fn try_schedule_retry(&self, mut item: QueueItem) -> RetryDecision {
        let mut inner = self.lock();
        debug_assert_eq!(inner.running.as_deref(), Some(item.set.handle()));
        inner.running = None;

        if item.attempts >= self.max_attempts {
            inner.tracked.remove(item.set.handle());
            return RetryDecision::AttemptsExhausted;
        }
        if item.first_submitted.elapsed() >= self.max_age {
            inner.tracked.remove(item.set.handle());
            return RetryDecision::TooOld;
        }

        item.source = SubmitSource::Retry;
        inner.retries.push(Reverse(DueEntry {
            due: Instant::now() + self.retry_delay,
            item,
        }));
        drop(inner);
        self.notify.notify_one();
        RetryDecision::Scheduled
    }

    /// Move every due retry back to the end of the pending FIFO.
    pub fn promote_due(&self) {
        let mut inner = self.lock();
        let moved = Self::promote_due_locked(&mut inner);
        drop(inner);
        if moved {
            self.notify.notify_one();
        }
    }

    fn promote_due_locked(inner: &mut QueueInner) -> bool {
        let now = Instant::now();
        let mut moved = false;
        while inner.retries.peek().is_some_and(|r| r.0.due <= now) {
            if let Some(Reverse(entry)) = inner.retries.pop() {
                inner.pending.push_back(entry.item);
                moved = true;
            }
        }
        moved
    }

    /// Time until the next retry becomes due, if any are scheduled.
    pub fn next_due_in(&self) -> Option<Duration> {
        let inner = self.lock();
        inner
            .retries
            .peek()
            .map(|r| r.0.due.saturating_duration_since(Instant::now()))
    }

    /// Wait until the queue may have new work.
    pub async fn ready(&self) {
        self.notify.notified().await;
    }

    /// Number of items waiting in the FIFO.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of items waiting for their retry delay.
    pub fn retry_len(&self) -> usize {
        self.lock().retries.len()
    }

    /// Whether nothing is pending, running or retry-scheduled.
    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.pending.is_empty() && inner.retries.is_empty() && inner.running.is_none()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
