//! Sync Engine (§4.4): owns the `syncAll`/`syncEntity`/`syncWithRetry`
//! cycle, the push and pull phases, and the save-to-local-db policy.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

use crate::bulk::{bulk_insert, BulkInsertOptions, ChunkExecutor};
use crate::clock::Clock;
use crate::config::{EngineFlags, SyncConfig};
use crate::entity::{EntityRegistry, EntitySyncDescriptor, Record};
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::metrics::{EntityRunMetrics, MetricsSink, SyncCycleMetrics};
use crate::mutation::{TerminalReason, DEFAULT_PENDING_LIMIT};
use crate::network::{
    MutationOutcome, MutationPushItem, NetworkPort, PullRequest, PushRequest,
};
use crate::queue::MutationQueue;
use crate::scheduler::{FullSyncListener, PushOnlyExecutor};
use crate::sync_meta::{EngineState, EngineStatus, SyncMetaStore};

/// One captured error from a `syncAll`/`syncEntity` cycle (§4.4.4).
#[derive(Debug, Clone)]
pub struct SyncResultError {
    pub operation: &'static str,
    pub message: String,
}

/// Per-entity outcome returned by `syncAll`/`syncEntity` (§4.4.3, §4.4.4).
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub success: bool,
    pub entity: String,
    pub pulled: usize,
    pub pushed: usize,
    pub errors: Vec<SyncResultError>,
    pub duration: Duration,
}

struct PushOutcome {
    pushed: usize,
    errors: Vec<SyncResultError>,
    duration: Duration,
}

/// The sync engine. Holds no locks across `.await` other than its own
/// `state` — the durable store, network, and registry are accessed through
/// injected ports so the engine itself stays free of I/O concerns.
pub struct SyncEngine {
    config: SyncConfig,
    flags: EngineFlags,
    registry: EntityRegistry,
    network: Arc<dyn NetworkPort>,
    mutation_store: Arc<MutationQueue>,
    sync_meta_store: Arc<dyn SyncMetaStore>,
    bulk_executor: Arc<dyn ChunkExecutor>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Arc<dyn MetricsSink>,
    scheduler: OnceLock<Arc<dyn FullSyncListener>>,
    state: AsyncMutex<EngineState>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        flags: EngineFlags,
        registry: EntityRegistry,
        network: Arc<dyn NetworkPort>,
        mutation_store: Arc<MutationQueue>,
        sync_meta_store: Arc<dyn SyncMetaStore>,
        bulk_executor: Arc<dyn ChunkExecutor>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            flags,
            registry,
            network,
            mutation_store,
            sync_meta_store,
            bulk_executor,
            clock,
            events,
            metrics,
            scheduler: OnceLock::new(),
            state: AsyncMutex::new(EngineState::default()),
        }
    }

    /// Wires the fast-push scheduler in after construction — both the
    /// engine and scheduler hold an `Arc` to each other, so neither can be
    /// built fully-formed first. Only the first call takes effect.
    pub fn set_scheduler(&self, scheduler: Arc<dyn FullSyncListener>) {
        let _ = self.scheduler.set(scheduler);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn state(&self) -> EngineState {
        self.state.lock().await.clone()
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// §4.4.3: full pull+push cycle across every registered entity.
    pub async fn sync_all(&self) -> Vec<SyncResult> {
        {
            let mut state = self.state.lock().await;
            if state.status == EngineStatus::Offline || !self.is_configured() {
                return Vec::new();
            }
            if state.status == EngineStatus::Syncing {
                // Re-entrancy guard (§4.4.2): a second `syncAll` while one
                // is in flight is a no-op.
                return Vec::new();
            }
            state.status = EngineStatus::Syncing;
            state.error = None;
        }

        let correlation_id = uuid::Uuid::now_v7().to_string();
        self.events.emit(SyncEvent::SyncStart {
            correlation_id: correlation_id.clone(),
        });
        let cycle_started = Instant::now();

        let mut push_outcomes: HashMap<String, PushOutcome> = HashMap::new();
        for descriptor in self.registry.in_order() {
            if descriptor.push_endpoint().is_none() {
                continue;
            }
            let outcome = self
                .push_entity(descriptor.as_ref(), &correlation_id)
                .await;
            push_outcomes.insert(descriptor.name().to_string(), outcome);
        }

        let (parallel_safe, sequential): (Vec<_>, Vec<_>) = self
            .registry
            .in_order()
            .cloned()
            .partition(|d| self.is_parallel_safe(d.as_ref()));

        let mut pull_results: Vec<(String, usize, Vec<SyncResultError>, Duration)> = Vec::new();

        if !parallel_safe.is_empty() && self.flags.parallel_entities {
            let max_parallel = self.flags.max_parallel_entities.max(1);
            let correlation_id_ref = &correlation_id;
            let parallel_pulls: Vec<_> = stream::iter(parallel_safe.iter())
                .map(|descriptor| async move {
                    let started = Instant::now();
                    let (pulled, errors) = self
                        .pull_entity(descriptor.as_ref(), correlation_id_ref)
                        .await;
                    (descriptor.name().to_string(), pulled, errors, started.elapsed())
                })
                .buffer_unordered(max_parallel)
                .collect()
                .await;
            pull_results.extend(parallel_pulls);
        } else {
            for descriptor in &parallel_safe {
                let started = Instant::now();
                let (pulled, errors) = self.pull_entity(descriptor.as_ref(), &correlation_id).await;
                pull_results.push((descriptor.name().to_string(), pulled, errors, started.elapsed()));
            }
        }

        for descriptor in &sequential {
            let started = Instant::now();
            let (pulled, errors) = self.pull_entity(descriptor.as_ref(), &correlation_id).await;
            pull_results.push((descriptor.name().to_string(), pulled, errors, started.elapsed()));
        }

        let mut results = Vec::with_capacity(self.registry.len());
        let mut last_error: Option<String> = None;
        for descriptor in self.registry.in_order() {
            let name = descriptor.name().to_string();
            let push = push_outcomes.remove(&name);
            let pull = pull_results
                .iter()
                .find(|(entity, ..)| entity == &name)
                .cloned();

            let (pushed, mut errors, push_duration) = match push {
                Some(outcome) => (outcome.pushed, outcome.errors, outcome.duration),
                None => (0, Vec::new(), Duration::ZERO),
            };
            let (pulled, pull_errors, pull_duration) = match pull {
                Some((_, pulled, pull_errors, duration)) => (pulled, pull_errors, duration),
                None => (0, Vec::new(), Duration::ZERO),
            };
            errors.extend(pull_errors);
            let success = errors.is_empty();
            if !success {
                last_error = errors.last().map(|e| e.message.clone());
            }

            self.metrics.record_entity_run(EntityRunMetrics {
                correlation_id: correlation_id.clone(),
                entity: name.clone(),
                pulled,
                pushed,
                duration: push_duration + pull_duration,
            });

            results.push(SyncResult {
                success,
                entity: name,
                pulled,
                pushed,
                errors,
                duration: push_duration + pull_duration,
            });
        }

        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            state.last_sync_at = Some(now);
            state.progress = None;
            state.status = if last_error.is_some() {
                EngineStatus::Error
            } else {
                EngineStatus::Idle
            };
            state.error = last_error;
        }

        self.metrics.record_cycle(SyncCycleMetrics {
            correlation_id: correlation_id.clone(),
            entities_attempted: results.len(),
            entities_succeeded: results.iter().filter(|r| r.success).count(),
            duration: cycle_started.elapsed(),
        });
        self.events.emit(SyncEvent::SyncComplete { correlation_id });

        if let Some(scheduler) = self.scheduler.get() {
            scheduler.notify_full_sync_completed();
        }

        results
    }

    /// §4.4.7 `syncWithRetry`: exponential backoff, base 1s factor 2, cap 3
    /// attempts. Never propagates an error; the returned results reflect
    /// whatever the final attempt produced.
    pub async fn sync_with_retry(&self) -> Vec<SyncResult> {
        const MAX_ATTEMPTS: u32 = 3;
        let correlation_id = uuid::Uuid::now_v7().to_string();
        let mut attempt = 0;
        loop {
            let results = self.sync_all().await;
            let all_ok = results.iter().all(|r| r.success);
            if all_ok || attempt + 1 >= MAX_ATTEMPTS {
                if !all_ok {
                    self.events.emit(SyncEvent::SyncMaxRetriesExceeded {
                        correlation_id: correlation_id.clone(),
                    });
                }
                return results;
            }

            let delay_ms = 1_000u64 * 2u64.pow(attempt);
            self.events.emit(SyncEvent::SyncRetry {
                correlation_id: correlation_id.clone(),
                attempt: attempt + 1,
                delay_ms,
            });
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            attempt += 1;
        }
    }

    /// §4.4.4 `syncEntity(name)`: pull phase only for one entity.
    pub async fn sync_entity(&self, name: &str) -> Result<SyncResult> {
        if !self.registry.contains(name) {
            return Err(SyncError::EntityNotRegistered(name.to_string()));
        }
        if !self.is_configured() {
            return Err(SyncError::NotConfigured);
        }
        let descriptor = self.registry.get(name)?;
        let correlation_id = uuid::Uuid::now_v7().to_string();
        let started = Instant::now();
        let (pulled, errors) = self.pull_entity(descriptor.as_ref(), &correlation_id).await;
        Ok(SyncResult {
            success: errors.is_empty(),
            entity: name.to_string(),
            pulled,
            pushed: 0,
            errors,
            duration: started.elapsed(),
        })
    }

    /// §4.6: push-only cycle across every entity with a mutation endpoint.
    async fn push_only_cycle(&self) -> Result<usize> {
        let correlation_id = uuid::Uuid::now_v7().to_string();
        let mut total_pushed = 0usize;
        for descriptor in self.registry.in_order() {
            if descriptor.push_endpoint().is_none() {
                continue;
            }
            let outcome = self
                .push_entity(descriptor.as_ref(), &correlation_id)
                .await;
            total_pushed += outcome.pushed;
        }
        Ok(total_pushed)
    }

    fn is_parallel_safe(&self, descriptor: &dyn EntitySyncDescriptor) -> bool {
        let name = descriptor.name();
        if self.flags.sequential_entities.iter().any(|n| n == name) {
            return false;
        }
        if self.flags.parallel_safe_entities.iter().any(|n| n == name) {
            return true;
        }
        descriptor.parallel_safe()
    }

    /// §4.4.5: push phase for one entity.
    async fn push_entity(
        &self,
        descriptor: &dyn EntitySyncDescriptor,
        correlation_id: &str,
    ) -> PushOutcome {
        let started = Instant::now();
        let endpoint = match descriptor.push_endpoint() {
            Some(endpoint) => endpoint,
            None => {
                return PushOutcome {
                    pushed: 0,
                    errors: Vec::new(),
                    duration: started.elapsed(),
                }
            }
        };

        let pending = match self
            .mutation_store
            .get_pending(
                Some(descriptor.name()),
                DEFAULT_PENDING_LIMIT,
                self.flags.max_retries as i32,
            )
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                return PushOutcome {
                    pushed: 0,
                    errors: vec![SyncResultError {
                        operation: "push",
                        message: err.to_string(),
                    }],
                    duration: started.elapsed(),
                }
            }
        };

        if pending.is_empty() {
            return PushOutcome {
                pushed: 0,
                errors: Vec::new(),
                duration: started.elapsed(),
            };
        }

        let now = self.clock.now();
        for mutation in &pending {
            let _ = self.mutation_store.mark_processing(mutation.id, now).await;
        }

        let mut items = Vec::with_capacity(pending.len());
        let mut errors = Vec::new();
        for mutation in &pending {
            let payload = match mutation.payload.as_object().cloned() {
                Some(record) => record,
                None => serde_json::Map::new(),
            };
            match descriptor.transform_to_server(payload) {
                Ok(wire) => items.push(MutationPushItem::from_mutation(mutation, wire)),
                Err(err) => {
                    let _ = self
                        .mutation_store
                        .mark_failed(mutation, err.to_string(), TerminalReason::Rejected)
                        .await;
                    errors.push(SyncResultError {
                        operation: "push",
                        message: err.to_string(),
                    });
                }
            }
        }

        if items.is_empty() {
            return PushOutcome {
                pushed: 0,
                errors,
                duration: started.elapsed(),
            };
        }

        let request = PushRequest {
            endpoint: endpoint.to_string(),
            mutations: items,
        };

        let mut pushed = 0usize;
        match self.network.push(request).await {
            Ok(response) => {
                let by_key: HashMap<String, _> = pending
                    .iter()
                    .map(|m| (m.idempotency_key(), m))
                    .collect();
                let mut seen: HashSet<String> = HashSet::new();
                for result in response.results {
                    seen.insert(result.mutation_id.clone());
                    let Some(mutation) = by_key.get(&result.mutation_id) else {
                        continue;
                    };
                    match result.outcome {
                        MutationOutcome::Applied => {
                            let _ = self.mutation_store.mark_completed(mutation).await;
                            pushed += 1;
                            self.events.emit(SyncEvent::MutationPushed {
                                correlation_id: correlation_id.to_string(),
                                entity: descriptor.name().to_string(),
                                mutation_id: mutation.id,
                            });
                        }
                        MutationOutcome::Rejected => {
                            let message = result.error.unwrap_or_else(|| "rejected".to_string());
                            let _ = self
                                .mutation_store
                                .mark_failed(mutation, message.clone(), TerminalReason::Rejected)
                                .await;
                            errors.push(SyncResultError {
                                operation: "push",
                                message,
                            });
                        }
                        MutationOutcome::Failed => {
                            let message = result.error.unwrap_or_else(|| "failed".to_string());
                            let _ = self
                                .mutation_store
                                .mark_failed(mutation, message.clone(), TerminalReason::None)
                                .await;
                            errors.push(SyncResultError {
                                operation: "push",
                                message,
                            });
                        }
                    }
                }
                // §4.4.5 step 5 partial form: any mutation absent from the
                // response is treated as a transient failure.
                for mutation in &pending {
                    if !seen.contains(&mutation.idempotency_key()) {
                        let message = "no result reported for mutation".to_string();
                        let _ = self
                            .mutation_store
                            .mark_failed(mutation, message.clone(), TerminalReason::None)
                            .await;
                        errors.push(SyncResultError {
                            operation: "push",
                            message,
                        });
                    }
                }
                self.events.emit(SyncEvent::MutationsBatchComplete {
                    correlation_id: correlation_id.to_string(),
                    entity: descriptor.name().to_string(),
                    count: pushed,
                });
            }
            Err(err) => {
                // §4.4.5 step 5: the whole batch fails transiently.
                for mutation in &pending {
                    let _ = self
                        .mutation_store
                        .mark_failed(mutation, err.to_string(), TerminalReason::None)
                        .await;
                }
                errors.push(SyncResultError {
                    operation: "push",
                    message: err.to_string(),
                });
            }
        }

        PushOutcome {
            pushed,
            errors,
            duration: started.elapsed(),
        }
    }

    /// §4.4.4: pull phase for one entity, paginated to `hasMore=false`.
    async fn pull_entity(
        &self,
        descriptor: &dyn EntitySyncDescriptor,
        correlation_id: &str,
    ) -> (usize, Vec<SyncResultError>) {
        self.events.emit(SyncEvent::EntitySyncStart {
            correlation_id: correlation_id.to_string(),
            entity: descriptor.name().to_string(),
        });

        let meta = match self.sync_meta_store.get(descriptor.name()).await {
            Ok(meta) => meta,
            Err(err) => {
                return (
                    0,
                    vec![SyncResultError {
                        operation: "pull",
                        message: err.to_string(),
                    }],
                )
            }
        };

        let mut cursor = meta.last_cursor;
        let mut pulled = 0usize;
        let mut errors = Vec::new();
        let mut final_cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;
            let request = PullRequest {
                entity: descriptor.name().to_string(),
                endpoint: descriptor.pull_endpoint().to_string(),
                since: meta.last_sync_at.map(|t| t.to_rfc3339()),
                cursor: cursor.clone(),
                limit: descriptor.batch_size(),
                technician_id: self.config.technician_id.clone(),
            };

            let response = match self.network.pull(request).await {
                Ok(response) => response,
                Err(err) => {
                    errors.push(SyncResultError {
                        operation: "pull",
                        message: err.to_string(),
                    });
                    break;
                }
            };

            let mut transformed = Vec::with_capacity(response.records.len());
            for record in response.records {
                match descriptor.transform_from_server(record) {
                    Ok(record) => transformed.push(record),
                    Err(err) => errors.push(SyncResultError {
                        operation: "pull",
                        message: err.to_string(),
                    }),
                }
            }

            match self.save_to_local_db(descriptor, transformed).await {
                Ok(saved) => pulled += saved,
                Err(err) => errors.push(SyncResultError {
                    operation: "pull",
                    message: err.to_string(),
                }),
            }

            final_cursor = response.next_cursor.clone();
            if !response.has_more {
                break;
            }
            cursor = response.next_cursor;
            if cursor.is_none() {
                // Defensive: a server claiming hasMore with no cursor can't
                // be paginated further.
                break;
            }
        }

        let now = self.clock.now();
        if let Err(err) = self
            .sync_meta_store
            .set_cursor(descriptor.name(), final_cursor, now)
            .await
        {
            errors.push(SyncResultError {
                operation: "pull",
                message: err.to_string(),
            });
        }

        self.events.emit(SyncEvent::EntitySyncComplete {
            correlation_id: correlation_id.to_string(),
            entity: descriptor.name().to_string(),
            pulled,
            pushed: 0,
        });

        (pulled, errors)
    }

    /// §4.4.6: overwrite-safety filter (I3), then the custom or default
    /// bulk-upsert persistence path. Returns the number of records actually
    /// persisted, which `pullEntity` accumulates into its `pulled` count —
    /// this is never the raw fetched-page size, since I3 can drop rows.
    async fn save_to_local_db(
        &self,
        descriptor: &dyn EntitySyncDescriptor,
        records: Vec<Record>,
    ) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        // §4.4.6 I3: every conflict policy in the described corpus filters
        // outstanding-mutation targets before upsert; a `server_wins`
        // entity may opt out, but none in this registry does.
        let filtered = self.filter_pending_targets(descriptor, records).await?;

        if filtered.is_empty() {
            return Ok(0);
        }

        if let Some(()) = descriptor.custom_save(&filtered).await? {
            return Ok(filtered.len());
        }

        let options = BulkInsertOptions {
            columns: descriptor.columns().iter().map(|c| c.to_string()).collect(),
            chunk_size: self.flags.bulk_insert_chunk_size,
            continue_on_error: self.flags.bulk_insert_continue_on_error,
            bisect_min_size: self.flags.bulk_insert_bisect_min_size,
        };
        let result = bulk_insert(
            self.bulk_executor.as_ref(),
            descriptor.table_name(),
            filtered,
            &options,
            descriptor.id_field(),
            None,
        )
        .await?;
        Ok(result.inserted_records)
    }

    /// §4.4.6 step 1 (I3): drop rows whose id has an outstanding mutation.
    async fn filter_pending_targets(
        &self,
        descriptor: &dyn EntitySyncDescriptor,
        records: Vec<Record>,
    ) -> Result<Vec<Record>> {
        let pending_ids: HashSet<String> = self
            .mutation_store
            .pending_targets_for_entity(descriptor.name())
            .await?
            .into_iter()
            .collect();
        if pending_ids.is_empty() {
            return Ok(records);
        }

        let id_field = descriptor.id_field();
        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            let id = record.get(id_field).and_then(|v| v.as_str());
            match id {
                Some(id) if pending_ids.contains(id) => {
                    self.events.emit(SyncEvent::ConflictResolved {
                        entity: descriptor.name().to_string(),
                        entity_id: id.to_string(),
                    });
                }
                _ => kept.push(record),
            }
        }
        Ok(kept)
    }
}

#[async_trait::async_trait]
impl PushOnlyExecutor for SyncEngine {
    async fn push_only(&self) -> Result<usize> {
        self.push_only_cycle().await
    }

    async fn sync_with_retry(&self) -> Result<()> {
        let _ = SyncEngine::sync_with_retry(self).await;
        Ok(())
    }
}
