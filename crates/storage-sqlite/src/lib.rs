//! SQLite-backed implementations of the `fieldsync-core` storage ports:
//! the mutation journal, sync cursor metadata, and the chunked bulk writer.
//! Every mutating statement runs on the single writer task spawned by
//! `db::write_actor` (§5).

mod bulk;
mod db;
mod errors;
mod models;
mod mutation_store;
mod sync_meta_store;

pub use bulk::DieselChunkExecutor;
pub use db::{create_pool, get_connection, init, run_migrations, write_actor, DbPool, PooledConn, WriteHandle, MIGRATIONS};
pub use errors::StorageError;
pub use mutation_store::SqliteMutationStore;
pub use sync_meta_store::SqliteSyncMetaStore;

pub mod schema;
