//! Runtime wiring: constructs the engine and scheduler from injected ports
//! and owns the background poll loop, modeled on the host app's
//! `DeviceSyncRuntimeState`/`ensure_background_engine_started` pattern —
//! here collapsed into one struct since this crate has no surrounding
//! multi-service container to share it with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::bulk::ChunkExecutor;
use crate::clock::Clock;
use crate::config::{EngineFlags, SyncConfig};
use crate::engine::SyncEngine;
use crate::entity::EntityRegistry;
use crate::events::{EventBus, SyncEvent};
use crate::metrics::MetricsSink;
use crate::mutation::MutationStore;
use crate::network::NetworkPort;
use crate::queue::MutationQueue;
use crate::scheduler::{FastPushListener, FastPushScheduler, PushOnlyExecutor, SchedulerConfig};
use crate::sync_meta::SyncMetaStore;

/// Every port the engine and scheduler need. Grouped so callers assemble
/// the concrete adapters once and hand them to `build()`.
#[allow(clippy::too_many_arguments)]
pub struct SyncRuntimeBuilder {
    pub config: SyncConfig,
    pub flags: EngineFlags,
    pub registry: EntityRegistry,
    pub network: Arc<dyn NetworkPort>,
    pub mutation_store: Arc<dyn MutationStore>,
    pub sync_meta_store: Arc<dyn SyncMetaStore>,
    pub bulk_executor: Arc<dyn ChunkExecutor>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// How often the runtime polls `NetworkPort::is_reachable` for the
/// offline/online transition events (§4.4.9). Not part of `EngineFlags`
/// since it is runtime plumbing, not a sync-semantics knob.
const REACHABILITY_POLL_INTERVAL: Duration = Duration::from_secs(15);

impl SyncRuntimeBuilder {
    pub fn build(self) -> SyncRuntime {
        let events = EventBus::new();
        let scheduler_config = SchedulerConfig {
            debounce: Duration::from_millis(self.flags.fast_push_debounce_ms),
            max_buffer_size: self.flags.fast_push_max_buffer_size,
            full_sync_throttle: Duration::from_millis(self.flags.full_sync_throttle_ms),
            schedule_full_sync_after_push: self.flags.fast_push_schedule_full_sync,
            full_sync_prefer_wifi: self.flags.full_sync_prefer_wifi,
        };

        let queue = Arc::new(MutationQueue::new(
            self.mutation_store,
            events.clone(),
            Arc::clone(&self.clock),
        ));
        queue.set_fast_push_enabled(self.flags.fast_push_only);

        let engine = Arc::new(SyncEngine::new(
            self.config,
            self.flags,
            self.registry,
            Arc::clone(&self.network),
            Arc::clone(&queue),
            self.sync_meta_store,
            self.bulk_executor,
            Arc::clone(&self.clock),
            events.clone(),
            self.metrics,
        ));

        let scheduler = FastPushScheduler::new(
            scheduler_config,
            self.clock,
            Arc::clone(&engine) as Arc<dyn PushOnlyExecutor>,
            events.clone(),
        );
        engine.set_scheduler(Arc::new(scheduler.clone()));
        queue.set_scheduler(Arc::new(scheduler.clone()) as Arc<dyn FastPushListener>);
        queue.set_full_sync_executor(Arc::clone(&engine) as Arc<dyn PushOnlyExecutor>);

        SyncRuntime {
            engine,
            scheduler,
            mutation_queue: queue,
            network: self.network,
            events,
            background_task: AsyncMutex::new(None),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Owns the engine, scheduler, and background reachability poll loop for
/// one configured sync target.
pub struct SyncRuntime {
    engine: Arc<SyncEngine>,
    scheduler: FastPushScheduler,
    mutation_queue: Arc<MutationQueue>,
    network: Arc<dyn NetworkPort>,
    events: EventBus,
    background_task: AsyncMutex<Option<JoinHandle<()>>>,
    shutting_down: Arc<AtomicBool>,
}

impl SyncRuntime {
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &FastPushScheduler {
        &self.scheduler
    }

    pub fn mutation_queue(&self) -> &Arc<MutationQueue> {
        &self.mutation_queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Starts the background reachability poll loop if it isn't already
    /// running. Mirrors `ensure_background_engine_started`: idempotent,
    /// replaces a finished handle rather than stacking duplicate loops.
    pub async fn ensure_started(self: &Arc<Self>) {
        let mut guard = self.background_task.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
            guard.take();
        }

        let runtime = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut was_offline = false;
            loop {
                if runtime.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                let reachable = runtime.network.is_reachable().await;
                if !reachable && !was_offline {
                    was_offline = true;
                    runtime.scheduler.set_offline(true);
                    runtime.mutation_queue.set_online(false);
                    runtime.events.emit(SyncEvent::OfflineDetected);
                } else if reachable && was_offline {
                    was_offline = false;
                    runtime.scheduler.set_offline(false);
                    runtime.mutation_queue.set_online(true);
                    runtime.events.emit(SyncEvent::OnlineDetected);
                    // §4.4.9: reconnect triggers an auto-sync.
                    let engine = Arc::clone(&runtime.engine);
                    tokio::spawn(async move {
                        let _ = engine.sync_with_retry().await;
                    });
                }
                tokio::time::sleep(REACHABILITY_POLL_INTERVAL).await;
            }
        });
        *guard = Some(handle);
    }

    /// Stops the background loop without interrupting any in-flight push
    /// or pull (§ Cancellation: "teardown clears timers but does not
    /// interrupt in-flight work").
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.scheduler.cancel_all();
        let mut guard = self.background_task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }
}
