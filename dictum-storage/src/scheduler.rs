//! Refresh Scheduler Background Task
//!
//! One coordinator task keeps every registered dictionary fresh. It owns a
//! min-heap of `(due, sequence, name)` entries and sleeps until the earliest
//! one is due. Due refreshes run on spawned workers, at most
//! `max_concurrent_refreshes` at a time; lookups never run here.
//!
//! Rescheduling a dictionary bumps its sequence number, so stale heap
//! entries are skipped when popped instead of being removed eagerly.
//!
//! After a successful refresh the next due time is drawn from the
//! dictionary lifetime (a zero lifetime is never refreshed again). After a
//! failure it is `min(initial * multiplier^(n-1), max)` with jitter, and
//! failures are retried forever.
//!
//! # Configuration
//!
//! ```rust
//! use dictum_core::RetryConfig;
//! use dictum_storage::scheduler::SchedulerConfig;
//!
//! let config = SchedulerConfig {
//!     max_concurrent_refreshes: 4,
//!     retry: RetryConfig::default(),
//!     command_buffer: 256,
//! };
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dictum_core::{DictResult, RetryConfig};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::dictionary::Dictionary;
use crate::layout::RefreshOutcome;

pub const DEFAULT_MAX_CONCURRENT_REFRESHES: usize = 4;
pub const DEFAULT_COMMAND_BUFFER: usize = 256;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Refreshes allowed to run at once (default: 4)
    pub max_concurrent_refreshes: usize,
    /// Backoff for failed refreshes
    pub retry: RetryConfig,
    /// Capacity of the command channel (default: 256)
    pub command_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_refreshes: DEFAULT_MAX_CONCURRENT_REFRESHES,
            retry: RetryConfig::default(),
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }
}

impl SchedulerConfig {
    /// Create SchedulerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `DICTUM_SCHEDULER_MAX_CONCURRENT_REFRESHES` (default: 4)
    /// - `DICTUM_SCHEDULER_COMMAND_BUFFER` (default: 256)
    /// - `DICTUM_RETRY_*`, see [`RetryConfig::from_env`]
    pub fn from_env() -> Self {
        let max_concurrent_refreshes = std::env::var("DICTUM_SCHEDULER_MAX_CONCURRENT_REFRESHES")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REFRESHES);

        let command_buffer = std::env::var("DICTUM_SCHEDULER_COMMAND_BUFFER")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(DEFAULT_COMMAND_BUFFER);

        Self {
            max_concurrent_refreshes,
            retry: RetryConfig::from_env(),
            command_buffer,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub refreshes_started: AtomicU64,
    pub refreshes_succeeded: AtomicU64,
    /// Refreshes skipped because the source reported no modification.
    pub refreshes_unchanged: AtomicU64,
    pub refreshes_failed: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            refreshes_started: self.refreshes_started.load(Ordering::Relaxed),
            refreshes_succeeded: self.refreshes_succeeded.load(Ordering::Relaxed),
            refreshes_unchanged: self.refreshes_unchanged.load(Ordering::Relaxed),
            refreshes_failed: self.refreshes_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub refreshes_started: u64,
    pub refreshes_succeeded: u64,
    pub refreshes_unchanged: u64,
    pub refreshes_failed: u64,
}

// ============================================================================
// QUEUE
// ============================================================================

/// Min-heap of due refreshes with lazy cancellation.
#[derive(Debug, Default)]
pub struct RefreshQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, String)>>,
    next_sequence: u64,
}

impl RefreshQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `name` at `due`; returns the entry's sequence number.
    pub fn push(&mut self, due: Instant, name: &str) -> u64 {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.heap.push(Reverse((due, sequence, name.to_string())));
        sequence
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((due, _, _))| *due)
    }

    /// Pop the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(u64, String)> {
        if self.next_due()? > now {
            return None;
        }
        self.heap.pop().map(|Reverse((_, sequence, name))| (sequence, name))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

#[derive(Debug)]
pub enum SchedulerCommand {
    /// Start (or restart) scheduling a dictionary.
    Register(Dictionary),
    Deregister(String),
    /// Sent by a worker when its refresh finishes.
    Completed {
        name: String,
        outcome: DictResult<RefreshOutcome>,
    },
}

struct Scheduled {
    dictionary: Dictionary,
    /// Only the heap entry with this sequence is live.
    sequence: u64,
    failed_attempts: u32,
    running: bool,
}

struct SchedulerState {
    config: SchedulerConfig,
    queue: RefreshQueue,
    entries: HashMap<String, Scheduled>,
    permits: Arc<Semaphore>,
    completions: mpsc::Sender<SchedulerCommand>,
    metrics: Arc<SchedulerMetrics>,
}

impl SchedulerState {
    fn schedule_after(&mut self, name: &str, delay: std::time::Duration) {
        let sequence = self.queue.push(Instant::now() + delay, name);
        if let Some(entry) = self.entries.get_mut(name) {
            entry.sequence = sequence;
        }
    }

    /// Queue the next refresh from the lifetime, or from the backoff after failures.
    fn schedule_next(&mut self, name: &str) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        let delay = if entry.failed_attempts > 0 {
            Some(self.config.retry.jittered_backoff(entry.failed_attempts))
        } else {
            entry.dictionary.lifetime().next_delay()
        };
        // Zeroing the sequence cancels any queued entry.
        entry.sequence = 0;
        if let Some(delay) = delay {
            self.schedule_after(name, delay);
        }
    }

    fn handle(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Register(dictionary) => {
                let name = dictionary.name().to_string();
                let info = dictionary.info();
                let failed_attempts = if dictionary.is_loaded() {
                    info.failed_attempts
                } else {
                    info.failed_attempts.max(1)
                };
                tracing::debug!(dictionary = %name, failed_attempts, "Dictionary registered for refresh");
                self.entries.insert(
                    name.clone(),
                    Scheduled {
                        dictionary,
                        sequence: 0,
                        failed_attempts,
                        running: false,
                    },
                );
                self.schedule_next(&name);
            }
            SchedulerCommand::Deregister(name) => {
                if self.entries.remove(&name).is_some() {
                    tracing::debug!(dictionary = %name, "Dictionary deregistered");
                }
            }
            SchedulerCommand::Completed { name, outcome } => self.complete(&name, outcome),
        }
    }

    fn complete(&mut self, name: &str, outcome: DictResult<RefreshOutcome>) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        entry.running = false;
        match outcome {
            Ok(RefreshOutcome::Published { .. }) => {
                entry.failed_attempts = 0;
                self.metrics.refreshes_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(RefreshOutcome::Unchanged) => {
                entry.failed_attempts = 0;
                self.metrics.refreshes_unchanged.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                entry.failed_attempts += 1;
                self.metrics.refreshes_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    dictionary = %name,
                    error = %e,
                    attempts = entry.failed_attempts,
                    transient = e.is_transient(),
                    "Scheduled refresh failed, retrying with backoff"
                );
            }
        }
        self.schedule_next(name);
    }

    /// Spawn workers for every live, due entry.
    fn dispatch_due(&mut self) {
        let now = Instant::now();
        while let Some((sequence, name)) = self.queue.pop_due(now) {
            let Some(entry) = self.entries.get_mut(&name) else {
                continue;
            };
            if entry.sequence != sequence || entry.running {
                continue;
            }
            entry.running = true;
            entry.sequence = 0;
            self.metrics.refreshes_started.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(dictionary = %name, "Dispatching scheduled refresh");

            let dictionary = entry.dictionary.clone();
            let permits = Arc::clone(&self.permits);
            let completions = self.completions.clone();
            tokio::spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => dictionary.refresh().await,
                    Err(_) => return,
                };
                let _ = completions
                    .send(SchedulerCommand::Completed { name, outcome })
                    .await;
            });
        }
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Background task that refreshes registered dictionaries until shutdown.
///
/// `completions` must feed the same channel as `commands`; workers report
/// through it.
pub async fn refresh_scheduler_task(
    config: SchedulerConfig,
    mut commands: mpsc::Receiver<SchedulerCommand>,
    completions: mpsc::Sender<SchedulerCommand>,
    metrics: Arc<SchedulerMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SchedulerMetrics> {
    tracing::info!(
        max_concurrent_refreshes = config.max_concurrent_refreshes,
        initial_backoff_ms = config.retry.initial_backoff.as_millis() as u64,
        "Refresh scheduler started"
    );

    let mut state = SchedulerState {
        permits: Arc::new(Semaphore::new(config.max_concurrent_refreshes.max(1))),
        config,
        queue: RefreshQueue::new(),
        entries: HashMap::new(),
        completions,
        metrics,
    };

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Refresh scheduler shutting down");
                    break;
                }
            }

            command = commands.recv() => {
                match command {
                    Some(command) => state.handle(command),
                    None => break,
                }
            }

            _ = sleep_until(state.queue.next_due()) => {
                state.dispatch_due();
            }
        }
    }

    state.permits.close();
    let snapshot = state.metrics.snapshot();
    tracing::info!(
        refreshes_started = snapshot.refreshes_started,
        refreshes_succeeded = snapshot.refreshes_succeeded,
        refreshes_unchanged = snapshot.refreshes_unchanged,
        refreshes_failed = snapshot.refreshes_failed,
        "Refresh scheduler completed"
    );
    state.metrics
}

/// Owner-side handle of a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
    shutdown: watch::Sender<bool>,
    metrics: Arc<SchedulerMetrics>,
    task: JoinHandle<Arc<SchedulerMetrics>>,
}

impl SchedulerHandle {
    /// Spawn the scheduler task on the current runtime.
    pub fn spawn(config: SchedulerConfig) -> Self {
        let (commands, commands_rx) = mpsc::channel(config.command_buffer.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(SchedulerMetrics::new());
        let task = tokio::spawn(refresh_scheduler_task(
            config,
            commands_rx,
            commands.clone(),
            Arc::clone(&metrics),
            shutdown_rx,
        ));
        Self {
            commands,
            shutdown,
            metrics,
            task,
        }
    }

    /// Returns `false` once the scheduler has stopped.
    pub async fn register(&self, dictionary: Dictionary) -> bool {
        self.commands
            .send(SchedulerCommand::Register(dictionary))
            .await
            .is_ok()
    }

    pub async fn deregister(&self, name: &str) -> bool {
        self.commands
            .send(SchedulerCommand::Deregister(name.to_string()))
            .await
            .is_ok()
    }

    pub fn metrics(&self) -> SchedulerSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the task and return its final metrics.
    pub async fn shutdown(self) -> SchedulerSnapshot {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(metrics) => metrics.snapshot(),
            Err(e) => {
                tracing::error!(error = %e, "Refresh scheduler task panicked");
                self.metrics.snapshot()
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
