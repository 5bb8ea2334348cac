//! Per-entity sync metadata (§3.3) and single-writer engine state (§3.4).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// One row of `sync_meta(entity, lastCursor, lastSyncAt)` (§6.3).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncMeta {
    pub entity: String,
    pub last_cursor: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Durable-store port for sync metadata. Implemented by
/// `fieldsync-storage-sqlite`; faked in engine unit tests.
#[async_trait]
pub trait SyncMetaStore: Send + Sync {
    async fn get(&self, entity: &str) -> Result<SyncMeta>;

    /// §4.4.4 final page: persists `{lastCursor, lastSyncAt}` together so a
    /// crash between the two writes never leaves a torn cursor.
    async fn set_cursor(
        &self,
        entity: &str,
        last_cursor: Option<String>,
        last_sync_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// §3.4 engine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    Syncing,
    Error,
    Offline,
}

/// §3.4 optional in-flight progress indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    pub current: usize,
    pub total: usize,
    pub entity: String,
}

/// Single-writer engine state record (§3.4). Only the engine's own
/// cooperative task ever mutates this; readers (UI, diagnostics) observe a
/// snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    pub status: EngineStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub progress: Option<SyncProgress>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            status: EngineStatus::Idle,
            last_sync_at: None,
            error: None,
            progress: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_engine_state_is_idle_with_no_error() {
        let state = EngineState::default();
        assert_eq!(state.status, EngineStatus::Idle);
        assert!(state.error.is_none());
        assert!(state.progress.is_none());
    }
}
