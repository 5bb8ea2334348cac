//! Bulk persistence (§4.3): chunked upserts with per-chunk transactions and
//! bisect-on-error isolation. The chunking/bisect algorithm here is storage
//! agnostic — it drives a `ChunkExecutor` port implemented concretely by
//! `fieldsync-storage-sqlite`.

use async_trait::async_trait;

use crate::entity::Record;
use crate::error::Result;

/// Tuning knobs for one `bulk_insert` call (§4.3).
#[derive(Debug, Clone)]
pub struct BulkInsertOptions {
    pub columns: Vec<String>,
    pub chunk_size: usize,
    pub continue_on_error: bool,
    pub bisect_min_size: usize,
}

impl Default for BulkInsertOptions {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            chunk_size: 50,
            continue_on_error: true,
            bisect_min_size: 1,
        }
    }
}

/// One record that failed to insert, with the id it failed under (best
/// effort — the `id_field` value if present, else its index as a string)
/// and the storage error that rejected it.
#[derive(Debug, Clone)]
pub struct FailedRecord {
    pub id: String,
    pub error: String,
}

/// §B3: chunk/bisect metrics plus the B5/P5 accounting of every input
/// record landing in exactly one of the inserted or failed sets.
#[derive(Debug, Clone, Default)]
pub struct BulkInsertResult {
    pub inserted_records: usize,
    pub failed_records: usize,
    pub failed: Vec<FailedRecord>,
    pub chunks: usize,
    pub chunks_bisected: usize,
}

/// A callback invoked for every record bisect determines to be invalid
/// (§4.3 `onInvalidRecord`).
pub type InvalidRecordHook<'a> = &'a (dyn Fn(&FailedRecord) + Send + Sync);

/// Storage port driven by the bulk-insert algorithm. One implementation
/// executes the whole chunk as a single `INSERT OR REPLACE` statement
/// inside one transaction; a failure must leave no partial row from that
/// chunk behind (§B1).
#[async_trait]
pub trait ChunkExecutor: Send + Sync {
    /// Attempts to upsert the whole chunk as one atomic statement. `Ok(())`
    /// means every record in `chunk` is now present. `Err` means none are,
    /// and the caller should bisect.
    async fn execute_chunk(
        &self,
        table: &str,
        columns: &[String],
        chunk: &[Record],
    ) -> Result<()>;

    /// Attempts to upsert exactly one record (used once bisect has reduced
    /// a failing group to `bisect_min_size`).
    async fn execute_one(&self, table: &str, columns: &[String], record: &Record) -> Result<()>;
}

fn record_id(record: &Record, id_field: &str, fallback_index: usize) -> String {
    record
        .get(id_field)
        .map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| fallback_index.to_string())
}

/// §4.3: split, insert per chunk, bisect on failure. `id_field` names the
/// column used to identify a record in `FailedRecord::id`.
pub async fn bulk_insert(
    executor: &dyn ChunkExecutor,
    table: &str,
    records: Vec<Record>,
    options: &BulkInsertOptions,
    id_field: &str,
    on_invalid_record: Option<InvalidRecordHook<'_>>,
) -> Result<BulkInsertResult> {
    let mut result = BulkInsertResult::default();
    if records.is_empty() {
        return Ok(result);
    }

    let chunk_size = options.chunk_size.max(1);
    for (chunk_index, chunk) in records.chunks(chunk_size).enumerate() {
        result.chunks += 1;
        match executor.execute_chunk(table, &options.columns, chunk).await {
            Ok(()) => {
                result.inserted_records += chunk.len();
            }
            Err(_) => {
                result.chunks_bisected += 1;
                let base_index = chunk_index * chunk_size;
                let aborted = bisect(
                    executor,
                    table,
                    chunk,
                    options,
                    id_field,
                    base_index,
                    &mut result,
                    on_invalid_record,
                )
                .await;
                if aborted {
                    break;
                }
            }
        }
    }

    Ok(result)
}

/// Recursively splits `group` until subgroups reach `bisect_min_size`, then
/// inserts each survivor individually. Returns `true` if processing should
/// stop entirely (`continue_on_error=false` and a failure occurred).
#[allow(clippy::too_many_arguments)]
async fn bisect(
    executor: &dyn ChunkExecutor,
    table: &str,
    group: &[Record],
    options: &BulkInsertOptions,
    id_field: &str,
    base_index: usize,
    result: &mut BulkInsertResult,
    on_invalid_record: Option<InvalidRecordHook<'_>>,
) -> bool {
    if group.len() <= options.bisect_min_size.max(1) || group.len() == 1 {
        for (offset, record) in group.iter().enumerate() {
            let index = base_index + offset;
            match executor.execute_one(table, &options.columns, record).await {
                Ok(()) => result.inserted_records += 1,
                Err(err) => {
                    let failed = FailedRecord {
                        id: record_id(record, id_field, index),
                        error: err.to_string(),
                    };
                    if let Some(hook) = on_invalid_record {
                        hook(&failed);
                    }
                    result.failed_records += 1;
                    result.failed.push(failed);
                    if !options.continue_on_error {
                        return true;
                    }
                }
            }
        }
        return false;
    }

    let mid = group.len() / 2;
    let (left, right) = group.split_at(mid);
    for (offset, sub) in [left, right].into_iter().enumerate() {
        if sub.is_empty() {
            continue;
        }
        let sub_base = base_index + offset * mid;
        match executor.execute_chunk(table, &options.columns, sub).await {
            Ok(()) => result.inserted_records += sub.len(),
            Err(_) => {
                let aborted = Box::pin(bisect(
                    executor,
                    table,
                    sub,
                    options,
                    id_field,
                    sub_base,
                    result,
                    on_invalid_record,
                ))
                .await;
                if aborted {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result as CoreResult, StoreError, SyncError};
    use std::sync::Mutex;

    struct FlakyExecutor {
        invalid_ids: Vec<&'static str>,
        chunk_calls: Mutex<usize>,
    }

    #[async_trait]
    impl ChunkExecutor for FlakyExecutor {
        async fn execute_chunk(
            &self,
            _table: &str,
            _columns: &[String],
            chunk: &[Record],
        ) -> CoreResult<()> {
            *self.chunk_calls.lock().unwrap() += 1;
            let has_invalid = chunk.iter().any(|record| {
                record
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(|id| self.invalid_ids.contains(&id))
                    .unwrap_or(false)
            });
            if has_invalid {
                Err(SyncError::Store(StoreError::new("chunk rejected")))
            } else {
                Ok(())
            }
        }

        async fn execute_one(
            &self,
            _table: &str,
            _columns: &[String],
            record: &Record,
        ) -> CoreResult<()> {
            let id = record.get("id").and_then(|v| v.as_str()).unwrap_or("");
            if self.invalid_ids.contains(&id) {
                Err(SyncError::Store(StoreError::new("invalid record")))
            } else {
                Ok(())
            }
        }
    }

    fn record(id: &str) -> Record {
        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), serde_json::Value::String(id.to_string()));
        map
    }

    #[tokio::test]
    async fn empty_input_does_zero_work() {
        let executor = FlakyExecutor {
            invalid_ids: vec![],
            chunk_calls: Mutex::new(0),
        };
        let result = bulk_insert(
            &executor,
            "clients",
            vec![],
            &BulkInsertOptions::default(),
            "id",
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.chunks, 0);
        assert_eq!(result.inserted_records, 0);
        assert_eq!(result.failed_records, 0);
    }

    #[tokio::test]
    async fn bisect_isolates_single_invalid_record() {
        let executor = FlakyExecutor {
            invalid_ids: vec!["INVALID"],
            chunk_calls: Mutex::new(0),
        };
        let records = vec![record("1"), record("INVALID"), record("3")];
        let options = BulkInsertOptions {
            chunk_size: 50,
            ..Default::default()
        };
        let result = bulk_insert(&executor, "clients", records, &options, "id", None)
            .await
            .unwrap();
        assert_eq!(result.inserted_records, 2);
        assert_eq!(result.failed_records, 1);
        assert_eq!(result.failed[0].id, "INVALID");
        assert_eq!(result.chunks_bisected, 1);
    }

    #[tokio::test]
    async fn continue_on_error_false_stops_after_first_failure() {
        let executor = FlakyExecutor {
            invalid_ids: vec!["bad-1", "bad-2"],
            chunk_calls: Mutex::new(0),
        };
        let records = vec![record("bad-1"), record("ok"), record("bad-2")];
        let options = BulkInsertOptions {
            chunk_size: 50,
            continue_on_error: false,
            ..Default::default()
        };
        let result = bulk_insert(&executor, "clients", records, &options, "id", None)
            .await
            .unwrap();
        assert_eq!(result.failed_records, 1);
        assert!(result.inserted_records < 2);
    }

    #[tokio::test]
    async fn every_record_lands_in_exactly_one_set() {
        let executor = FlakyExecutor {
            invalid_ids: vec!["x2", "x5"],
            chunk_calls: Mutex::new(0),
        };
        let records: Vec<Record> = (0..7).map(|i| record(&format!("x{i}"))).collect();
        let options = BulkInsertOptions {
            chunk_size: 4,
            ..Default::default()
        };
        let total = records.len();
        let result = bulk_insert(&executor, "clients", records, &options, "id", None)
            .await
            .unwrap();
        assert_eq!(result.inserted_records + result.failed_records, total);
    }
}
