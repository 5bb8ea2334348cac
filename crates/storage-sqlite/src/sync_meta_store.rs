//! Diesel-backed `SyncMetaStore` (§4.4.4 cursor persistence).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::sync::Arc;

use fieldsync_core::{Result as CoreResult, SyncMeta, SyncMetaStore};

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::models::SyncMetaRow;
use crate::schema::sync_meta;

pub struct SqliteSyncMetaStore {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SqliteSyncMetaStore {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }
}

#[async_trait]
impl SyncMetaStore for SqliteSyncMetaStore {
    async fn get(&self, entity: &str) -> CoreResult<SyncMeta> {
        let mut conn = get_connection(&self.pool).map_err(StorageError::from)?;
        let row = sync_meta::table
            .find(entity.to_string())
            .first::<SyncMetaRow>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        match row {
            Some(row) => row.into_domain().map_err(Into::into),
            None => Ok(SyncMeta {
                entity: entity.to_string(),
                ..Default::default()
            }),
        }
    }

    async fn set_cursor(
        &self,
        entity: &str,
        last_cursor: Option<String>,
        last_sync_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let row = SyncMetaRow {
            entity: entity.to_string(),
            last_cursor,
            last_sync_at: Some(last_sync_at.to_rfc3339()),
        };
        self.writer
            .exec(move |conn| {
                diesel::insert_into(sync_meta::table)
                    .values(&row)
                    .on_conflict(sync_meta::entity)
                    .do_update()
                    .set((
                        sync_meta::last_cursor.eq(&row.last_cursor),
                        sync_meta::last_sync_at.eq(&row.last_sync_at),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }
}
