//! Fast-Push Scheduler (§4.6): debounces bursts of local writes into one
//! push-only cycle, independent of the full `syncAll` cadence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::Result;
use crate::events::{EventBus, SyncEvent};

/// Executes the push-only phase across all entities (implemented by the
/// sync engine; kept as a narrow port so the scheduler never depends on the
/// full engine type).
#[async_trait]
pub trait PushOnlyExecutor: Send + Sync {
    /// Pushes all pending mutations across every registered entity. Returns
    /// the number of mutations pushed.
    async fn push_only(&self) -> Result<usize>;

    /// Runs a full `syncWithRetry` cycle (pull+push), used when the
    /// scheduler elects to follow a push-only cycle with a full sync.
    async fn sync_with_retry(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    pub max_buffer_size: usize,
    pub full_sync_throttle: Duration,
    pub schedule_full_sync_after_push: bool,
    pub full_sync_prefer_wifi: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1_500),
            max_buffer_size: 20,
            full_sync_throttle: Duration::from_secs(5 * 60),
            schedule_full_sync_after_push: true,
            full_sync_prefer_wifi: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
    pub coalesced_mutations: usize,
    pub push_count: usize,
    pub throttled_full_sync_count: usize,
    pub last_push_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

struct Inner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn PushOnlyExecutor>,
    events: EventBus,

    generation: AtomicU64,
    pending: AtomicUsize,
    push_in_progress: AtomicBool,
    offline: AtomicBool,
    is_cellular_only: AtomicBool,

    metrics: Mutex<SchedulerMetrics>,
}

/// Narrow notification port the engine uses to tell the scheduler a full
/// sync just completed (§4.4.3 step 5), without depending on the scheduler
/// concretely.
pub trait FullSyncListener: Send + Sync {
    fn notify_full_sync_completed(&self);
}

/// Narrow notification port the mutation queue uses to forward a newly
/// enqueued mutation into the fast-push debounce (§4.2 `enqueue`, §4.6
/// `notifyMutationAdded`), without depending on the scheduler concretely.
pub trait FastPushListener: Send + Sync {
    fn notify_mutation_added(&self);
}

/// §4.6 fast-push scheduler. Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct FastPushScheduler {
    inner: Arc<Inner>,
}

impl FullSyncListener for FastPushScheduler {
    fn notify_full_sync_completed(&self) {
        FastPushScheduler::notify_full_sync_completed(self)
    }
}

impl FastPushListener for FastPushScheduler {
    fn notify_mutation_added(&self) {
        FastPushScheduler::notify_mutation_added(self)
    }
}

impl FastPushScheduler {
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn PushOnlyExecutor>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                executor,
                events,
                generation: AtomicU64::new(0),
                pending: AtomicUsize::new(0),
                push_in_progress: AtomicBool::new(false),
                offline: AtomicBool::new(false),
                is_cellular_only: AtomicBool::new(false),
                metrics: Mutex::new(SchedulerMetrics::default()),
            }),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_cellular_only(&self, cellular_only: bool) {
        self.inner
            .is_cellular_only
            .store(cellular_only, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.inner
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// §4.6 `notifyMutationAdded`: arms the debounce timer, or fires
    /// immediately once the buffer exceeds `max_buffer_size`.
    pub fn notify_mutation_added(&self) {
        let pending = self.inner.pending.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut metrics = self.inner.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.coalesced_mutations += 1;
        }

        if pending >= self.inner.config.max_buffer_size {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.fire().await });
            return;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let scheduler = self.clone();
        let debounce = self.inner.config.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if scheduler.inner.generation.load(Ordering::SeqCst) == generation {
                scheduler.fire().await;
            }
        });
    }

    /// §4.6 `flushNow`: forces an immediate push, bypassing debounce.
    pub async fn flush_now(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.fire().await;
    }

    /// §4.6 `notifyFullSyncCompleted`: records the full-sync timestamp and
    /// cancels any scheduled full sync by invalidating the debounce
    /// generation.
    pub fn notify_full_sync_completed(&self) {
        let now = self.inner.clock.now();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let mut metrics = self.inner.metrics.lock().unwrap_or_else(|e| e.into_inner());
        metrics.last_full_sync_at = Some(now);
    }

    /// §4.6 `cancelAll`: clears timers and counters (teardown).
    pub fn cancel_all(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.pending.store(0, Ordering::SeqCst);
    }

    async fn fire(&self) {
        if self.inner.offline.load(Ordering::SeqCst) {
            return;
        }
        if self
            .inner
            .push_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.inner.pending.store(0, Ordering::SeqCst);

        let correlation_id = uuid::Uuid::now_v7().to_string();
        self.inner.events.emit(SyncEvent::PushOnlyStart {
            correlation_id: correlation_id.clone(),
        });

        let result = self.inner.executor.push_only().await;
        self.inner.push_in_progress.store(false, Ordering::SeqCst);

        match result {
            Ok(pushed) => {
                let now = self.inner.clock.now();
                {
                    let mut metrics = self.inner.metrics.lock().unwrap_or_else(|e| e.into_inner());
                    metrics.push_count += 1;
                    metrics.last_push_at = Some(now);
                }
                self.inner.events.emit(SyncEvent::PushOnlyComplete {
                    correlation_id,
                    pushed,
                });
                self.maybe_schedule_full_sync().await;
            }
            Err(err) => {
                self.inner.events.emit(SyncEvent::PushOnlyError {
                    correlation_id,
                    message: err.to_string(),
                });
            }
        }
    }

    async fn maybe_schedule_full_sync(&self) {
        if !self.inner.config.schedule_full_sync_after_push {
            return;
        }
        if self.inner.config.full_sync_prefer_wifi && self.inner.is_cellular_only.load(Ordering::SeqCst) {
            return;
        }

        let now = self.inner.clock.now();
        let due = {
            let metrics = self.inner.metrics.lock().unwrap_or_else(|e| e.into_inner());
            match metrics.last_full_sync_at {
                Some(last) => {
                    now.signed_duration_since(last).num_milliseconds()
                        >= self.inner.config.full_sync_throttle.as_millis() as i64
                }
                None => true,
            }
        };

        if !due {
            let mut metrics = self.inner.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.throttled_full_sync_count += 1;
            return;
        }

        let executor = Arc::clone(&self.inner.executor);
        let scheduler = self.clone();
        tokio::spawn(async move {
            let _ = executor.sync_with_retry().await;
            scheduler.notify_full_sync_completed();
        });
    }
}
