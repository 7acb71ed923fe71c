//! Durable-store layer.
//!
//! The durable analytical store is the record of truth the cache converges
//! to. The layer follows the repository pattern:
//!
//! - [`handlers`]: the [`handlers::LedgerStore`] trait plus its PostgreSQL
//!   and in-memory implementations
//! - [`models`]: aggregate rows, cached snapshots, and transaction records
//! - [`errors`]: durable-store error types
//!
//! Aggregate rows are mutated only through the idempotent apply path driven
//! by the queue consumer; the synchronous ledger path only reads them for
//! cache seeding and startup resynchronization.

pub mod errors;
pub mod handlers;
pub mod models;

/// Returns the migrator for the ledger's PostgreSQL schema.
///
/// ```ignore
/// meterd::db::migrator().run(&pool).await?;
/// ```
///
/// The database is shared with the queue's migrations, so rows applied by
/// other migrators are ignored rather than treated as corruption.
pub fn migrator() -> sqlx::migrate::Migrator {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
}
