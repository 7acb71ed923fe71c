//! # meterd: balance & token-usage ledger
//!
//! `meterd` is the accounting engine for a multi-tenant metered AI service.
//! It tracks per-user monetary balances and per-credential token usage with
//! a simple contract: reads are fast because they come from a snapshot
//! cache, writes never silently lose money or tokens under concurrency, and
//! the durable analytical store converges asynchronously.
//!
//! ## Architecture
//!
//! The write path is optimistic. An update observes the cached snapshot's
//! version, computes new field values, and commits only if no other writer
//! touched the key in between; conflicts repeat the whole round with
//! exponential backoff ([`cache`]). Once a commit lands, the mutation is
//! recorded as an immutable transaction and handed to a write-behind queue
//! ([`sluice`]); a background worker applies each record to the durable
//! store idempotently ([`consumer`]), so at-least-once delivery still
//! mutates each aggregate exactly once.
//!
//! The cache is authoritative the moment a commit succeeds. An enqueue
//! failure after a commit is logged, not rolled back: the durable store is
//! simply behind until reconciled. The system is not a distributed
//! transaction and does not try to be one.
//!
//! Reads are read-through: a cache miss (first access, or TTL expiry)
//! pulls the aggregate from the durable store and reseeds the cache.
//! Token-usage seeding is de-duplicated per credential ([`singleflight`])
//! so a thundering herd of misses issues one durable read.
//!
//! ## Core Components
//!
//! - [`ledger::Ledger`]: the public operations, i.e. balance reads and
//!   updates (single and batch), token-usage reads and updates, least-used
//!   credential selection, and startup cache resynchronization
//! - [`cache`]: the versioned compare-and-swap snapshot cache
//! - [`db`]: the durable-store layer (PostgreSQL and in-memory)
//! - [`consumer`]: queue handlers reconciling the durable store
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use meterd::{Config, telemetry};
//!
//! # fn main() -> anyhow::Result<()> {
//! let args = meterd::config::Args::parse();
//! let config = Config::load(&args)?;
//! telemetry::init_telemetry(config.enable_otel_export)?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod consumer;
pub mod db;
pub mod errors;
pub mod ledger;
pub mod singleflight;
pub mod telemetry;
pub mod types;

pub use config::Config;
pub use errors::{Error, Result};
pub use ledger::{BalanceUpdate, Ledger};
