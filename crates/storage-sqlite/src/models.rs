//! Diesel row types and their conversions to/from the core domain model.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use fieldsync_core::{Mutation, MutationOperation, MutationStatus, SyncMeta, TerminalReason};

use crate::errors::StorageError;
use crate::schema::{mutations_queue, sync_meta};

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Other(format!("invalid timestamp '{value}': {err}")))
}

fn operation_to_db(op: MutationOperation) -> &'static str {
    op.as_wire_str()
}

fn operation_from_db(value: &str) -> Result<MutationOperation, StorageError> {
    match value {
        "create" => Ok(MutationOperation::Create),
        "update" => Ok(MutationOperation::Update),
        "update_status" => Ok(MutationOperation::UpdateStatus),
        "delete" => Ok(MutationOperation::Delete),
        other => Err(StorageError::Other(format!("unknown mutation operation '{other}'"))),
    }
}

fn status_to_db(status: MutationStatus) -> &'static str {
    match status {
        MutationStatus::Pending => "pending",
        MutationStatus::Processing => "processing",
        MutationStatus::Failed => "failed",
        MutationStatus::Completed => "completed",
    }
}

fn status_from_db(value: &str) -> Result<MutationStatus, StorageError> {
    match value {
        "pending" => Ok(MutationStatus::Pending),
        "processing" => Ok(MutationStatus::Processing),
        "failed" => Ok(MutationStatus::Failed),
        "completed" => Ok(MutationStatus::Completed),
        other => Err(StorageError::Other(format!("unknown mutation status '{other}'"))),
    }
}

fn terminal_reason_to_db(reason: TerminalReason) -> &'static str {
    match reason {
        TerminalReason::None => "none",
        TerminalReason::Rejected => "rejected",
    }
}

fn terminal_reason_from_db(value: &str) -> Result<TerminalReason, StorageError> {
    match value {
        "none" => Ok(TerminalReason::None),
        "rejected" => Ok(TerminalReason::Rejected),
        other => Err(StorageError::Other(format!("unknown terminal reason '{other}'"))),
    }
}

#[derive(Debug, Clone, Queryable)]
pub struct MutationRow {
    pub id: i64,
    pub entity: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: String,
    pub created_at: String,
    pub attempts: i32,
    pub last_attempt: Option<String>,
    pub status: String,
    pub terminal_reason: String,
    pub error_message: Option<String>,
}

impl MutationRow {
    pub fn into_domain(self) -> Result<Mutation, StorageError> {
        Ok(Mutation {
            id: self.id,
            entity: self.entity,
            entity_id: self.entity_id,
            operation: operation_from_db(&self.operation)?,
            payload: serde_json::from_str(&self.payload)?,
            created_at: parse_rfc3339(&self.created_at)?,
            attempts: self.attempts,
            last_attempt: self.last_attempt.as_deref().map(parse_rfc3339).transpose()?,
            status: status_from_db(&self.status)?,
            terminal_reason: terminal_reason_from_db(&self.terminal_reason)?,
            error_message: self.error_message,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = mutations_queue)]
pub struct NewMutationRow {
    pub entity: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: String,
    pub created_at: String,
    pub attempts: i32,
    pub last_attempt: Option<String>,
    pub status: String,
    pub terminal_reason: String,
    pub error_message: Option<String>,
}

impl NewMutationRow {
    pub fn from_new(
        entity: String,
        entity_id: String,
        operation: MutationOperation,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            entity,
            entity_id,
            operation: operation_to_db(operation).to_string(),
            payload: serde_json::to_string(payload)?,
            created_at: now.to_rfc3339(),
            attempts: 0,
            last_attempt: None,
            status: status_to_db(MutationStatus::Pending).to_string(),
            terminal_reason: terminal_reason_to_db(TerminalReason::None).to_string(),
            error_message: None,
        })
    }
}

pub fn status_db_value(status: MutationStatus) -> &'static str {
    status_to_db(status)
}

pub fn terminal_reason_db_value(reason: TerminalReason) -> &'static str {
    terminal_reason_to_db(reason)
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = sync_meta)]
pub struct SyncMetaRow {
    pub entity: String,
    pub last_cursor: Option<String>,
    pub last_sync_at: Option<String>,
}

impl SyncMetaRow {
    pub fn into_domain(self) -> Result<SyncMeta, StorageError> {
        Ok(SyncMeta {
            entity: self.entity,
            last_cursor: self.last_cursor,
            last_sync_at: self.last_sync_at.as_deref().map(parse_rfc3339).transpose()?,
        })
    }
}
