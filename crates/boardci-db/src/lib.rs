//! Storage layer for boardci.
//!
//! Provides two [`JobStore`](boardci_core::store::JobStore) implementations: an
//! in-memory store for tests and local runs, and a PostgreSQL store.

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use postgres::PgJobStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
