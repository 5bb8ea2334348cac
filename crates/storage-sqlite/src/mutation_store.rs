//! Diesel-backed `MutationStore` (§4.2).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::sync::Arc;

use fieldsync_core::{Mutation, MutationStore, NewMutation, Result as CoreResult, TerminalReason};

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::models::{status_db_value, terminal_reason_db_value, MutationRow, NewMutationRow};
use crate::schema::mutations_queue;

pub struct SqliteMutationStore {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SqliteMutationStore {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }
}

#[async_trait]
impl MutationStore for SqliteMutationStore {
    async fn insert(&self, new: NewMutation, now: DateTime<Utc>) -> CoreResult<i64> {
        let row = NewMutationRow::from_new(new.entity, new.entity_id, new.operation, &new.payload, now)
            .map_err(StorageError::from)?;
        self.writer
            .exec(move |conn| {
                diesel::insert_into(mutations_queue::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                mutations_queue::table
                    .select(diesel::dsl::max(mutations_queue::id))
                    .first::<Option<i64>>(conn)
                    .map_err(StorageError::from)?
                    .ok_or_else(|| StorageError::Other("insert did not assign an id".to_string()))
            })
            .await
            .map_err(|err| err.into())
    }

    async fn get_pending(
        &self,
        entity: Option<&str>,
        limit: i64,
        max_retries: i32,
    ) -> CoreResult<Vec<Mutation>> {
        let mut conn = get_connection(&self.pool).map_err(StorageError::from)?;
        let pending_status = status_db_value(fieldsync_core::MutationStatus::Pending);
        let failed_status = status_db_value(fieldsync_core::MutationStatus::Failed);
        let none_reason = terminal_reason_db_value(TerminalReason::None);

        let mut query = mutations_queue::table
            .filter(
                mutations_queue::status
                    .eq(pending_status)
                    .or(mutations_queue::status
                        .eq(failed_status)
                        .and(mutations_queue::terminal_reason.eq(none_reason))
                        .and(mutations_queue::attempts.lt(max_retries))),
            )
            .order(mutations_queue::created_at.asc())
            .limit(limit)
            .into_boxed();

        if let Some(entity) = entity {
            query = query.filter(mutations_queue::entity.eq(entity.to_string()));
        }

        let rows = query
            .load::<MutationRow>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter()
            .map(|row| row.into_domain().map_err(Into::into))
            .collect()
    }

    async fn get_by_entity(&self, entity: &str, entity_id: &str) -> CoreResult<Vec<Mutation>> {
        let mut conn = get_connection(&self.pool).map_err(StorageError::from)?;
        let rows = mutations_queue::table
            .filter(mutations_queue::entity.eq(entity.to_string()))
            .filter(mutations_queue::entity_id.eq(entity_id.to_string()))
            .order(mutations_queue::created_at.asc())
            .load::<MutationRow>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter()
            .map(|row| row.into_domain().map_err(Into::into))
            .collect()
    }

    async fn mark_processing(&self, id: i64, now: DateTime<Utc>) -> CoreResult<()> {
        let status = status_db_value(fieldsync_core::MutationStatus::Processing).to_string();
        self.writer
            .exec(move |conn| {
                diesel::update(mutations_queue::table.find(id))
                    .set((
                        mutations_queue::status.eq(status),
                        mutations_queue::last_attempt.eq(now.to_rfc3339()),
                        mutations_queue::attempts.eq(mutations_queue::attempts + 1),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    async fn mark_completed(&self, id: i64) -> CoreResult<()> {
        let status = status_db_value(fieldsync_core::MutationStatus::Completed).to_string();
        self.writer
            .exec(move |conn| {
                diesel::update(mutations_queue::table.find(id))
                    .set(mutations_queue::status.eq(status))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    async fn mark_failed(
        &self,
        id: i64,
        error_message: String,
        terminal_reason: TerminalReason,
    ) -> CoreResult<()> {
        let status = status_db_value(fieldsync_core::MutationStatus::Failed).to_string();
        let reason = terminal_reason_db_value(terminal_reason).to_string();
        self.writer
            .exec(move |conn| {
                diesel::update(mutations_queue::table.find(id))
                    .set((
                        mutations_queue::status.eq(status),
                        mutations_queue::terminal_reason.eq(reason),
                        mutations_queue::error_message.eq(Some(error_message)),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    async fn remove(&self, id: i64) -> CoreResult<()> {
        self.writer
            .exec(move |conn| {
                diesel::delete(mutations_queue::table.find(id))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        let completed = status_db_value(fieldsync_core::MutationStatus::Completed).to_string();
        let cutoff = cutoff.to_rfc3339();
        self.writer
            .exec(move |conn| {
                diesel::delete(
                    mutations_queue::table
                        .filter(mutations_queue::status.eq(completed))
                        .filter(mutations_queue::created_at.lt(cutoff)),
                )
                .execute(conn)
                .map_err(StorageError::from)
            })
            .await
            .map_err(Into::into)
    }

    async fn reset_failed(&self) -> CoreResult<usize> {
        let pending = status_db_value(fieldsync_core::MutationStatus::Pending).to_string();
        let failed = status_db_value(fieldsync_core::MutationStatus::Failed).to_string();
        let none_reason = terminal_reason_db_value(TerminalReason::None).to_string();
        self.writer
            .exec(move |conn| {
                diesel::update(
                    mutations_queue::table
                        .filter(mutations_queue::status.eq(failed))
                        .filter(mutations_queue::terminal_reason.eq(none_reason)),
                )
                .set((mutations_queue::status.eq(pending), mutations_queue::attempts.eq(0)))
                .execute(conn)
                .map_err(StorageError::from)
            })
            .await
            .map_err(Into::into)
    }

    async fn count_pending(&self) -> CoreResult<i64> {
        let mut conn = get_connection(&self.pool).map_err(StorageError::from)?;
        let pending = status_db_value(fieldsync_core::MutationStatus::Pending);
        let processing = status_db_value(fieldsync_core::MutationStatus::Processing);
        let count = mutations_queue::table
            .filter(
                mutations_queue::status
                    .eq(pending)
                    .or(mutations_queue::status.eq(processing)),
            )
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(count)
    }

    async fn has_pending_for(&self, entity: &str, entity_id: &str) -> CoreResult<bool> {
        let mut conn = get_connection(&self.pool).map_err(StorageError::from)?;
        let pending = status_db_value(fieldsync_core::MutationStatus::Pending);
        let processing = status_db_value(fieldsync_core::MutationStatus::Processing);
        let count = mutations_queue::table
            .filter(mutations_queue::entity.eq(entity.to_string()))
            .filter(mutations_queue::entity_id.eq(entity_id.to_string()))
            .filter(
                mutations_queue::status
                    .eq(pending)
                    .or(mutations_queue::status.eq(processing)),
            )
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(count > 0)
    }

    async fn pending_targets_for_entity(&self, entity: &str) -> CoreResult<Vec<String>> {
        let mut conn = get_connection(&self.pool).map_err(StorageError::from)?;
        let pending = status_db_value(fieldsync_core::MutationStatus::Pending);
        let processing = status_db_value(fieldsync_core::MutationStatus::Processing);
        let ids = mutations_queue::table
            .filter(mutations_queue::entity.eq(entity.to_string()))
            .filter(
                mutations_queue::status
                    .eq(pending)
                    .or(mutations_queue::status.eq(processing)),
            )
            .select(mutations_queue::entity_id)
            .distinct()
            .load::<String>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(ids)
    }
}
