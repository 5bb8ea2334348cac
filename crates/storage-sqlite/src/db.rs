//! Connection pool, migrations, and the single-writer actor (§5 shared
//! resource policy: "the mutation queue, sync metadata, and engine state
//! are all guarded by being accessed only from the engine's cooperative
//! task" — enforced here by routing every mutating statement through one
//! dedicated writer task rather than the pool).

use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::errors::StorageError;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

pub fn create_pool(database_url: &str) -> Result<Arc<DbPool>, StorageError> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder()
        .build(manager)
        .map_err(|err| StorageError::Other(format!("failed to build pool: {err}")))?;
    Ok(Arc::new(pool))
}

pub fn get_connection(pool: &Arc<DbPool>) -> Result<PooledConn, StorageError> {
    pool.get().map_err(StorageError::from)
}

/// Runs pending migrations up to the latest embedded version (§6.3 "schema
/// is versioned; migrations are applied at startup").
pub fn run_migrations(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    conn.run_pending_migrations(MIGRATIONS)
        .map(|_| ())
        .map_err(|err| StorageError::Migration(err.to_string()))
}

/// Opens a pool against `database_url` and applies migrations on the first
/// connection before handing the pool back.
pub fn init(database_url: &str) -> Result<Arc<DbPool>, StorageError> {
    let pool = create_pool(database_url)?;
    let mut conn = get_connection(&pool)?;
    run_migrations(&mut conn)?;
    Ok(pool)
}

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send>;

/// Handle to the dedicated writer task. Every mutating statement is
/// submitted here so at most one write is ever in flight against the
/// store, matching the single-writer engine-state policy (§5).
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl WriteHandle {
    pub async fn exec<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError> + Send + 'static,
    {
        let (resp_tx, resp_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let result = f(conn);
            let _ = resp_tx.send(result);
        });
        self.tx
            .send(job)
            .map_err(|_| StorageError::Writer("writer task is no longer running".to_string()))?;
        resp_rx
            .await
            .map_err(|_| StorageError::Writer("writer task dropped the response".to_string()))?
    }
}

pub mod write_actor {
    use super::*;

    /// Spawns the writer task on one pooled connection and returns the
    /// handle callers submit closures to.
    pub fn spawn_writer(pool: Arc<DbPool>) -> Result<WriteHandle, StorageError> {
        let mut conn = get_connection(&pool)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job(&mut conn);
            }
        });
        Ok(WriteHandle { tx })
    }
}
