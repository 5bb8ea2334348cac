//! Observability sink (§2 "Metrics/Observability Sink", supplemented per
//! SPEC_FULL.md §C: correlation-id-tagged records of cycles, entity runs,
//! and bulk-writer chunk timings).

use std::sync::Mutex;
use std::time::Duration;

use crate::bulk::BulkInsertResult;

/// One full `syncAll`/`syncWithRetry` cycle.
#[derive(Debug, Clone)]
pub struct SyncCycleMetrics {
    pub correlation_id: String,
    pub entities_attempted: usize,
    pub entities_succeeded: usize,
    pub duration: Duration,
}

/// One entity's pull+push within a cycle.
#[derive(Debug, Clone)]
pub struct EntityRunMetrics {
    pub correlation_id: String,
    pub entity: String,
    pub pulled: usize,
    pub pushed: usize,
    pub duration: Duration,
}

/// One bulk-writer chunk (§4.3 B3: "metrics reflect real chunk counts").
#[derive(Debug, Clone)]
pub struct ChunkMetrics {
    pub correlation_id: String,
    pub table: String,
    pub bisected: bool,
    pub duration: Duration,
}

/// Sink port the engine and bulk writer report into. Implementations may
/// forward to a metrics backend; the in-memory sink below is for tests and
/// for hosts with no metrics backend configured.
pub trait MetricsSink: Send + Sync {
    fn record_cycle(&self, metrics: SyncCycleMetrics);
    fn record_entity_run(&self, metrics: EntityRunMetrics);
    fn record_chunk(&self, metrics: ChunkMetrics);
}

/// No-op sink, used when no metrics backend is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record_cycle(&self, _metrics: SyncCycleMetrics) {}
    fn record_entity_run(&self, _metrics: EntityRunMetrics) {}
    fn record_chunk(&self, _metrics: ChunkMetrics) {}
}

/// Captures every record in memory — used by integration tests to assert
/// on what the engine reported without standing up a real metrics backend.
#[derive(Default)]
pub struct InMemoryMetricsSink {
    cycles: Mutex<Vec<SyncCycleMetrics>>,
    entity_runs: Mutex<Vec<EntityRunMetrics>>,
    chunks: Mutex<Vec<ChunkMetrics>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycles(&self) -> Vec<SyncCycleMetrics> {
        self.cycles.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn entity_runs(&self) -> Vec<EntityRunMetrics> {
        self.entity_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn chunks(&self) -> Vec<ChunkMetrics> {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn chunks_bisected(&self) -> usize {
        self.chunks().iter().filter(|c| c.bisected).count()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record_cycle(&self, metrics: SyncCycleMetrics) {
        self.cycles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(metrics);
    }

    fn record_entity_run(&self, metrics: EntityRunMetrics) {
        self.entity_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(metrics);
    }

    fn record_chunk(&self, metrics: ChunkMetrics) {
        self.chunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(metrics);
    }
}

/// Derives a `ChunkMetrics`-friendly bisect count from a `BulkInsertResult`
/// (§B3), used by the storage layer after a `bulk_insert` call completes.
pub fn chunks_bisected_from_result(result: &BulkInsertResult) -> usize {
    result.chunks_bisected
}
