//! Durable-store record structures and cached snapshot types.

pub mod balances;
pub mod token_usage;
pub mod transactions;

pub use balances::{BalanceAggregate, BalanceSnapshot};
pub use token_usage::{TokenUsageAggregate, TokenUsageSnapshot};
pub use transactions::{Transaction, TransactionKind, UsageEvent};
