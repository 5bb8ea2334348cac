//! Mutation Queue (§4.2): the observer-emitting façade over `MutationStore`.
//! `enqueue` is the one production entry point for a local write — it
//! persists the row, emits `mutation_added`, and either hands off to the
//! fast-push scheduler or arms the queue's own debounce leading to a full
//! sync (§2 data-flow step 1). Every other mutating operation funnels
//! through here too, so a queue-change event is a side effect of the state
//! change rather than something each call site has to remember to emit.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::Result;
use crate::events::{EmittedEvent, EventBus, Subscription, SyncEvent};
use crate::mutation::{Mutation, MutationStore, NewMutation, TerminalReason};
use crate::scheduler::{FastPushListener, PushOnlyExecutor};

/// §4.2 `enqueue`'s fallback debounce when fast-push is off: "arms the 2 s
/// debounce leading to a full sync."
const ENQUEUE_DEBOUNCE: Duration = Duration::from_secs(2);

pub struct MutationQueue {
    store: Arc<dyn MutationStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    debounce: Duration,
    scheduler: OnceLock<Arc<dyn FastPushListener>>,
    full_sync: OnceLock<Arc<dyn PushOnlyExecutor>>,
    fast_push_enabled: AtomicBool,
    online: AtomicBool,
    generation: Arc<AtomicU64>,
}

impl MutationQueue {
    pub fn new(store: Arc<dyn MutationStore>, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self::with_debounce(store, events, clock, ENQUEUE_DEBOUNCE)
    }

    /// Tests use a short debounce so they don't have to wait 2 real seconds.
    pub fn with_debounce(
        store: Arc<dyn MutationStore>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            debounce,
            scheduler: OnceLock::new(),
            full_sync: OnceLock::new(),
            fast_push_enabled: AtomicBool::new(false),
            online: AtomicBool::new(true),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wires the fast-push scheduler in after construction. Only the first
    /// call takes effect.
    pub fn set_scheduler(&self, scheduler: Arc<dyn FastPushListener>) {
        let _ = self.scheduler.set(scheduler);
    }

    /// Wires the full-sync executor (the engine) in after construction.
    /// Only the first call takes effect.
    pub fn set_full_sync_executor(&self, executor: Arc<dyn PushOnlyExecutor>) {
        let _ = self.full_sync.set(executor);
    }

    /// `SYNC_OPT_FAST_PUSH_ONLY` (§6.4): routes enqueue-triggered pushes
    /// through the scheduler instead of a debounced full sync.
    pub fn set_fast_push_enabled(&self, enabled: bool) {
        self.fast_push_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// §4.2 `subscribe`.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EmittedEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// §4.2 `enqueue`: persists the row, emits `mutation_added`, then either
    /// notifies the fast-push scheduler (online + fast-push enabled) or
    /// arms the debounced full sync.
    pub async fn enqueue(&self, new: NewMutation) -> Result<i64> {
        let entity = new.entity.clone();
        let entity_id = new.entity_id.clone();
        let now = self.clock.now();
        let id = self.store.insert(new, now).await?;
        let pending_count = self.store.count_pending().await.unwrap_or(0);
        self.events.emit(SyncEvent::MutationAdded {
            mutation_id: id,
            entity,
            entity_id,
            pending_count,
        });

        if self.online.load(Ordering::SeqCst) && self.fast_push_enabled.load(Ordering::SeqCst) {
            if let Some(scheduler) = self.scheduler.get() {
                scheduler.notify_mutation_added();
            }
        } else {
            self.arm_debounced_full_sync();
        }

        Ok(id)
    }

    fn arm_debounced_full_sync(&self) {
        let Some(executor) = self.full_sync.get().cloned() else {
            return;
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation_counter = Arc::clone(&self.generation);
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if generation_counter.load(Ordering::SeqCst) == generation {
                let _ = executor.sync_with_retry().await;
            }
        });
    }

    pub async fn get_pending(
        &self,
        entity: Option<&str>,
        limit: i64,
        max_retries: i32,
    ) -> Result<Vec<Mutation>> {
        self.store.get_pending(entity, limit, max_retries).await
    }

    pub async fn get_by_entity(&self, entity: &str, entity_id: &str) -> Result<Vec<Mutation>> {
        self.store.get_by_entity(entity, entity_id).await
    }

    pub async fn mark_processing(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.store.mark_processing(id, now).await
    }

    /// §4.2 `markCompleted`. Emits `mutation_completed`.
    pub async fn mark_completed(&self, mutation: &Mutation) -> Result<()> {
        self.store.mark_completed(mutation.id).await?;
        let pending_count = self.store.count_pending().await.unwrap_or(0);
        self.events.emit(SyncEvent::MutationCompleted {
            mutation_id: mutation.id,
            entity: mutation.entity.clone(),
            entity_id: mutation.entity_id.clone(),
            pending_count,
        });
        Ok(())
    }

    /// §4.2 `markFailed`. Emits `mutation_failed`.
    pub async fn mark_failed(
        &self,
        mutation: &Mutation,
        error_message: String,
        terminal_reason: TerminalReason,
    ) -> Result<()> {
        self.store
            .mark_failed(mutation.id, error_message.clone(), terminal_reason)
            .await?;
        let pending_count = self.store.count_pending().await.unwrap_or(0);
        self.events.emit(SyncEvent::MutationFailed {
            mutation_id: mutation.id,
            entity: mutation.entity.clone(),
            entity_id: mutation.entity_id.clone(),
            pending_count,
            error_message,
        });
        Ok(())
    }

    /// §4.2 `remove`. Emits `mutation_removed`.
    pub async fn remove(&self, id: i64) -> Result<()> {
        self.store.remove(id).await?;
        let pending_count = self.store.count_pending().await.unwrap_or(0);
        self.events.emit(SyncEvent::MutationRemoved {
            mutation_id: id,
            pending_count,
        });
        Ok(())
    }

    /// §4.2 `cleanup`. Emits `mutations_cleanup` only if a row was deleted.
    pub async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.cleanup(cutoff).await?;
        if removed > 0 {
            let pending_count = self.store.count_pending().await.unwrap_or(0);
            self.events.emit(SyncEvent::MutationsCleanup {
                removed_count: removed,
                pending_count,
            });
        }
        Ok(removed)
    }

    /// §4.2 `resetFailed`. Emits `mutations_reset` only if a row changed.
    pub async fn reset_failed(&self) -> Result<usize> {
        let reset = self.store.reset_failed().await?;
        if reset > 0 {
            let pending_count = self.store.count_pending().await.unwrap_or(0);
            self.events.emit(SyncEvent::MutationsReset {
                reset_count: reset,
                pending_count,
            });
        }
        Ok(reset)
    }

    pub async fn count_pending(&self) -> Result<i64> {
        self.store.count_pending().await
    }

    pub async fn has_pending_for(&self, entity: &str, entity_id: &str) -> Result<bool> {
        self.store.has_pending_for(entity, entity_id).await
    }

    pub async fn pending_targets_for_entity(&self, entity: &str) -> Result<Vec<String>> {
        self.store.pending_targets_for_entity(entity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::mutation::MutationOperation;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as SyncMutex;

    #[derive(Default)]
    struct InMemoryStore {
        rows: SyncMutex<Vec<Mutation>>,
        next_id: SyncMutex<i64>,
    }

    #[async_trait]
    impl MutationStore for InMemoryStore {
        async fn insert(&self, new: NewMutation, now: DateTime<Utc>) -> Result<i64> {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            let id = *next_id;
            self.rows.lock().unwrap().push(Mutation {
                id,
                entity: new.entity,
                entity_id: new.entity_id,
                operation: new.operation,
                payload: new.payload,
                created_at: now,
                attempts: 0,
                last_attempt: None,
                status: crate::mutation::MutationStatus::Pending,
                terminal_reason: TerminalReason::None,
                error_message: None,
            });
            Ok(id)
        }

        async fn get_pending(&self, _entity: Option<&str>, _limit: i64, _max_retries: i32) -> Result<Vec<Mutation>> {
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn get_by_entity(&self, _entity: &str, _entity_id: &str) -> Result<Vec<Mutation>> {
            Ok(Vec::new())
        }

        async fn mark_processing(&self, _id: i64, _now: DateTime<Utc>) -> Result<()> {
            Ok(())
        }

        async fn mark_completed(&self, _id: i64) -> Result<()> {
            Ok(())
        }

        async fn mark_failed(&self, _id: i64, _error_message: String, _terminal_reason: TerminalReason) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _id: i64) -> Result<()> {
            Ok(())
        }

        async fn cleanup(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }

        async fn reset_failed(&self) -> Result<usize> {
            Ok(0)
        }

        async fn count_pending(&self) -> Result<i64> {
            Ok(self.rows.lock().unwrap().len() as i64)
        }

        async fn has_pending_for(&self, _entity: &str, _entity_id: &str) -> Result<bool> {
            Ok(false)
        }

        async fn pending_targets_for_entity(&self, _entity: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct RecordingScheduler {
        calls: AtomicUsize,
    }

    impl FastPushListener for RecordingScheduler {
        fn notify_mutation_added(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct RecordingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PushOnlyExecutor for RecordingExecutor {
        async fn push_only(&self) -> Result<usize> {
            Ok(0)
        }

        async fn sync_with_retry(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_mutation() -> NewMutation {
        NewMutation {
            entity: "clients".to_string(),
            entity_id: "client-1".to_string(),
            operation: MutationOperation::Create,
            payload: serde_json::json!({"name": "Acme"}),
        }
    }

    #[tokio::test]
    async fn enqueue_emits_mutation_added() {
        let events = EventBus::new();
        let received = Arc::new(SyncMutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let _sub = events.subscribe(move |emitted| {
            received_clone.lock().unwrap().push(emitted.event.clone());
        });

        let queue = MutationQueue::with_debounce(
            Arc::new(InMemoryStore::default()),
            events,
            Arc::new(FakeClock::new(Utc::now())),
            Duration::from_millis(10),
        );

        let id = queue.enqueue(sample_mutation()).await.unwrap();

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SyncEvent::MutationAdded { mutation_id, entity, entity_id, pending_count } => {
                assert_eq!(*mutation_id, id);
                assert_eq!(entity, "clients");
                assert_eq!(entity_id, "client-1");
                assert_eq!(*pending_count, 1);
            }
            other => panic!("expected MutationAdded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueue_notifies_scheduler_when_online_and_fast_push_enabled() {
        let queue = MutationQueue::with_debounce(
            Arc::new(InMemoryStore::default()),
            EventBus::new(),
            Arc::new(FakeClock::new(Utc::now())),
            Duration::from_millis(10),
        );
        let scheduler = Arc::new(RecordingScheduler {
            calls: AtomicUsize::new(0),
        });
        queue.set_scheduler(scheduler.clone());
        queue.set_fast_push_enabled(true);

        queue.enqueue(sample_mutation()).await.unwrap();

        assert_eq!(scheduler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_without_fast_push_arms_debounced_full_sync() {
        let queue = MutationQueue::with_debounce(
            Arc::new(InMemoryStore::default()),
            EventBus::new(),
            Arc::new(FakeClock::new(Utc::now())),
            Duration::from_millis(10),
        );
        let executor = Arc::new(RecordingExecutor {
            calls: AtomicUsize::new(0),
        });
        queue.set_full_sync_executor(executor.clone());

        queue.enqueue(sample_mutation()).await.unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_enqueue_within_debounce_window_collapses_to_one_full_sync() {
        let queue = MutationQueue::with_debounce(
            Arc::new(InMemoryStore::default()),
            EventBus::new(),
            Arc::new(FakeClock::new(Utc::now())),
            Duration::from_millis(20),
        );
        let executor = Arc::new(RecordingExecutor {
            calls: AtomicUsize::new(0),
        });
        queue.set_full_sync_executor(executor.clone());

        queue.enqueue(sample_mutation()).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        queue.enqueue(sample_mutation()).await.unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }
}
