//! Wire protocol and transport port (§6: bidirectional protocol).
//!
//! Canonical shapes only: field-name drift (`items`/`data`, `cursor`/
//! `nextCursor`) is absorbed by the `NetworkPort` implementation before it
//! reaches these types, per §6.1's note that the engine itself never sees
//! the raw historical variants.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::Record;
use crate::error::Result;
use crate::mutation::Mutation;

/// §6.1 delta pull request.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub entity: String,
    pub endpoint: String,
    /// `since` query parameter — `sync_meta[entity].lastSyncAt`.
    pub since: Option<String>,
    /// `cursor` query parameter, threaded from the previous page's
    /// `next_cursor` (§4.4.4).
    pub cursor: Option<String>,
    pub limit: usize,
    pub technician_id: String,
}

/// §6.1 delta pull response, normalized from `{items|data, nextCursor|
/// cursor, hasMore, total}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PullResponse {
    pub records: Vec<Record>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub total: Option<u64>,
}

/// One mutation as serialized into a push envelope (§4.4.5 step 2).
#[derive(Debug, Clone, Serialize)]
pub struct MutationPushItem {
    /// The composite idempotency key: `"<entityId>-<operation>-<localId>"`.
    pub mutation_id: String,
    pub entity: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: Record,
}

impl MutationPushItem {
    pub fn from_mutation(mutation: &Mutation, payload: Record) -> Self {
        Self {
            mutation_id: mutation.idempotency_key(),
            entity: mutation.entity.clone(),
            entity_id: mutation.entity_id.clone(),
            operation: mutation.operation.as_wire_str().to_string(),
            payload,
        }
    }
}

/// §6.2 push envelope, `{mutations: [...]}`. POSTed once per entity to that
/// entity's `apiMutationEndpoint`.
#[derive(Debug, Clone, Serialize)]
pub struct PushRequest {
    pub endpoint: String,
    pub mutations: Vec<MutationPushItem>,
}

/// Per-mutation outcome reported back from a push (§4.4.5 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOutcome {
    /// Accepted; `record`, if present, is the authoritative post-image.
    Applied,
    /// Terminal business failure (validation, policy, quota); never retried.
    Rejected,
    /// Transient; retried while `attempts < MAX_RETRIES`.
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MutationPushResult {
    pub mutation_id: String,
    pub outcome: MutationOutcome,
    pub record: Option<Record>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushResponse {
    pub results: Vec<MutationPushResult>,
    pub server_time: Option<String>,
}

/// Transport port (§9 design note: adapters over a concrete reqwest client
/// so the engine is testable without a live server). Implemented by
/// `fieldsync-net`; faked in engine unit tests.
#[async_trait]
pub trait NetworkPort: Send + Sync {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse>;

    async fn push(&self, request: PushRequest) -> Result<PushResponse>;

    /// Cheap reachability probe used by the offline/online transition
    /// events (§4.4.8/§4.4.9).
    async fn is_reachable(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{MutationOperation, MutationStatus, TerminalReason};
    use chrono::Utc;

    #[test]
    fn push_item_mutation_id_matches_idempotency_key() {
        let mutation = Mutation {
            id: 7,
            entity: "clients".to_string(),
            entity_id: "client-9".to_string(),
            operation: MutationOperation::Update,
            payload: serde_json::json!({"name": "Acme"}),
            created_at: Utc::now(),
            attempts: 0,
            last_attempt: None,
            status: MutationStatus::Pending,
            terminal_reason: TerminalReason::None,
            error_message: None,
        };
        let record = serde_json::Map::new();
        let item = MutationPushItem::from_mutation(&mutation, record);
        assert_eq!(item.mutation_id, mutation.idempotency_key());
        assert_eq!(item.operation, "update");
    }
}
