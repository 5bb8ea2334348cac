//! The mutation journal (§3.2): a durable FIFO log of locally initiated
//! writes awaiting server acknowledgement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// §3.2 M3: a `failed` mutation is retryable while `attempts < MAX_RETRIES`.
pub const MAX_RETRIES: i32 = 5;

/// §4.2 `getPending` default page size.
pub const DEFAULT_PENDING_LIMIT: i64 = 50;

/// Server-side mutation kinds (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOperation {
    Create,
    Update,
    UpdateStatus,
    Delete,
}

impl MutationOperation {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            MutationOperation::Create => "create",
            MutationOperation::Update => "update",
            MutationOperation::UpdateStatus => "update_status",
            MutationOperation::Delete => "delete",
        }
    }
}

/// Lifecycle state of a journal row (§3.2).
///
/// `Rejected` and transient `Failed` are both persisted under the logical
/// `failed` status from spec.md, but are tracked as a distinct terminality
/// flag here (`TerminalReason`) rather than conflated into one string, per
/// the resolution of the open question in §9/SPEC_FULL.md §D.1: a server
/// `rejected` is a terminal business failure and must never be resubmitted,
/// while a transient `failed` is retried while `attempts < MAX_RETRIES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Processing,
    Failed,
    Completed,
}

/// Why a mutation is in `Failed` state. Persisted alongside `status` so the
/// queue can tell a transient transport failure from a terminal business
/// rejection without overloading `status` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// Not in a failed state, or failed transiently and still retry-eligible.
    None,
    /// Server responded `rejected`: terminal business failure (§4.4.5 step 4).
    Rejected,
}

/// One row of the mutation journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: i64,
    pub entity: String,
    pub entity_id: String,
    pub operation: MutationOperation,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempts: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub status: MutationStatus,
    pub terminal_reason: TerminalReason,
    pub error_message: Option<String>,
}

impl Mutation {
    /// §4.4.5 step 2: the idempotency key the server deduplicates retries by.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.entity_id,
            self.operation.as_wire_str(),
            self.id
        )
    }

    /// §3.2 M3: retry-eligible iff transiently failed and under the cap.
    pub fn is_retry_eligible(&self, max_retries: i32) -> bool {
        self.status == MutationStatus::Pending
            || (self.status == MutationStatus::Failed
                && self.terminal_reason == TerminalReason::None
                && self.attempts < max_retries)
    }
}

/// A request to enqueue a new local mutation (§4.2 `enqueue`).
#[derive(Debug, Clone)]
pub struct NewMutation {
    pub entity: String,
    pub entity_id: String,
    pub operation: MutationOperation,
    pub payload: serde_json::Value,
}

/// Durable-store port for the mutation journal (§4.2). Implemented by
/// `fieldsync-storage-sqlite`; faked in engine/queue unit tests.
#[async_trait]
pub trait MutationStore: Send + Sync {
    async fn insert(&self, new: NewMutation, now: DateTime<Utc>) -> Result<i64>;

    /// §4.2 `getPending`: ascending `createdAt`, `pending` or eligible `failed`.
    async fn get_pending(&self, entity: Option<&str>, limit: i64, max_retries: i32)
        -> Result<Vec<Mutation>>;

    async fn get_by_entity(&self, entity: &str, entity_id: &str) -> Result<Vec<Mutation>>;

    async fn mark_processing(&self, id: i64, now: DateTime<Utc>) -> Result<()>;

    async fn mark_completed(&self, id: i64) -> Result<()>;

    async fn mark_failed(
        &self,
        id: i64,
        error_message: String,
        terminal_reason: TerminalReason,
    ) -> Result<()>;

    async fn remove(&self, id: i64) -> Result<()>;

    /// §4.2 `cleanup`: returns number of rows deleted.
    async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// §4.2 `resetFailed`: returns number of rows reset.
    async fn reset_failed(&self) -> Result<usize>;

    async fn count_pending(&self) -> Result<i64>;

    async fn has_pending_for(&self, entity: &str, entity_id: &str) -> Result<bool>;

    /// All entity/entity_id targets that currently have a pending or
    /// processing mutation — used by the pull-save overwrite filter (§4.4.6).
    async fn pending_targets_for_entity(&self, entity: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: MutationStatus, terminal: TerminalReason, attempts: i32) -> Mutation {
        Mutation {
            id: 42,
            entity: "clients".to_string(),
            entity_id: "client-1".to_string(),
            operation: MutationOperation::Create,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
            attempts,
            last_attempt: None,
            status,
            terminal_reason: terminal,
            error_message: None,
        }
    }

    #[test]
    fn idempotency_key_is_entity_op_localid() {
        let m = sample(MutationStatus::Pending, TerminalReason::None, 0);
        assert_eq!(m.idempotency_key(), "client-1-create-42");
    }

    #[test]
    fn rejected_is_never_retry_eligible_regardless_of_attempts() {
        let m = sample(MutationStatus::Failed, TerminalReason::Rejected, 0);
        assert!(!m.is_retry_eligible(MAX_RETRIES));
    }

    #[test]
    fn transient_failure_retry_eligible_below_cap() {
        let m = sample(MutationStatus::Failed, TerminalReason::None, 4);
        assert!(m.is_retry_eligible(MAX_RETRIES));
        let exhausted = sample(MutationStatus::Failed, TerminalReason::None, 5);
        assert!(!exhausted.is_retry_eligible(MAX_RETRIES));
    }
}
