//! Raw-SQL `ChunkExecutor` (§4.3): one `INSERT ... ON CONFLICT DO UPDATE`
//! statement per chunk, run inside a transaction so a failing chunk leaves
//! no partial row behind (§B1). Statement construction mirrors the
//! `quote_identifier`/`escape_sqlite_str`/`json_value_to_sql_literal` helpers
//! used for the outbox-applied upserts.

use async_trait::async_trait;
use diesel::sqlite::SqliteConnection;
use diesel::{Connection, RunQueryDsl};
use std::collections::HashMap;
use std::sync::Arc;

use fieldsync_core::{ChunkExecutor, Record, Result as CoreResult};

use crate::db::{DbPool, WriteHandle};
use crate::errors::StorageError;

fn escape_sqlite_str(value: &str) -> String {
    value.replace('\'', "''")
}

fn quote_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

fn json_value_to_sql_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(v) => if *v { "1" } else { "0" }.to_string(),
        serde_json::Value::Number(v) => v.to_string(),
        serde_json::Value::String(v) => format!("'{}'", escape_sqlite_str(v)),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => format!(
            "'{}'",
            escape_sqlite_str(&serde_json::to_string(value).unwrap_or_default())
        ),
    }
}

fn record_row_sql(columns: &[String], record: &Record) -> String {
    let values = columns
        .iter()
        .map(|col| {
            record
                .get(col)
                .map(json_value_to_sql_literal)
                .unwrap_or_else(|| "NULL".to_string())
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("({values})")
}

fn upsert_sql(table: &str, columns: &[String], primary_keys: &[String], rows: &str) -> String {
    let columns_sql = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict_sql = primary_keys
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");
    let upserts_sql = columns
        .iter()
        .filter(|c| !primary_keys.contains(c))
        .map(|c| {
            let quoted = quote_identifier(c);
            format!("{quoted}=excluded.{quoted}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    if upserts_sql.is_empty() {
        format!(
            "INSERT INTO {} ({columns_sql}) VALUES {rows} ON CONFLICT({conflict_sql}) DO NOTHING",
            quote_identifier(table)
        )
    } else {
        format!(
            "INSERT INTO {} ({columns_sql}) VALUES {rows} ON CONFLICT({conflict_sql}) DO UPDATE SET {upserts_sql}",
            quote_identifier(table)
        )
    }
}

/// Executes chunk/single-record upserts against the single writer
/// connection. `primary_keys` maps each synced table to its conflict-target
/// columns, resolved once at startup from each entity descriptor's
/// `table_name()`/`primary_keys()`.
pub struct DieselChunkExecutor {
    writer: WriteHandle,
    primary_keys: HashMap<String, Vec<String>>,
}

impl DieselChunkExecutor {
    pub fn new(_pool: Arc<DbPool>, writer: WriteHandle, primary_keys: HashMap<String, Vec<String>>) -> Self {
        Self { writer, primary_keys }
    }

    fn primary_keys_for(&self, table: &str) -> Vec<String> {
        self.primary_keys
            .get(table)
            .cloned()
            .unwrap_or_else(|| vec!["id".to_string()])
    }
}

#[async_trait]
impl ChunkExecutor for DieselChunkExecutor {
    async fn execute_chunk(&self, table: &str, columns: &[String], chunk: &[Record]) -> CoreResult<()> {
        let table = table.to_string();
        let columns = columns.to_vec();
        let chunk = chunk.to_vec();
        let primary_keys = self.primary_keys_for(&table);
        self.writer
            .exec(move |conn: &mut SqliteConnection| {
                conn.transaction(|conn| {
                    let rows = chunk
                        .iter()
                        .map(|record| record_row_sql(&columns, record))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = upsert_sql(&table, &columns, &primary_keys, &rows);
                    diesel::sql_query(sql).execute(conn)?;
                    Ok::<_, diesel::result::Error>(())
                })
                .map_err(StorageError::from)
            })
            .await
            .map_err(Into::into)
    }

    async fn execute_one(&self, table: &str, columns: &[String], record: &Record) -> CoreResult<()> {
        let table = table.to_string();
        let columns = columns.to_vec();
        let record = record.clone();
        let primary_keys = self.primary_keys_for(&table);
        self.writer
            .exec(move |conn: &mut SqliteConnection| {
                let rows = record_row_sql(&columns, &record);
                let sql = upsert_sql(&table, &columns, &primary_keys, &rows);
                diesel::sql_query(sql).execute(conn).map_err(StorageError::from)?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_sql_quotes_identifiers_and_uses_excluded() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let pk = vec!["id".to_string()];
        let sql = upsert_sql("widgets", &columns, &pk, "('a', 'b')");
        assert!(sql.contains("ON CONFLICT(`id`) DO UPDATE SET `name`=excluded.`name`"));
        assert!(!sql.contains("`id`=excluded.`id`"));
    }

    #[test]
    fn json_value_to_sql_literal_escapes_quotes() {
        let value = serde_json::Value::String("o'brien".to_string());
        assert_eq!(json_value_to_sql_literal(&value), "'o''brien'");
    }
}
