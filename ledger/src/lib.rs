//! Corebank Ledger Engine
//!
//! Validates and atomically applies deposits, withdrawals and transfers
//! against account records, with idempotent retries and optimistic
//! concurrency on account versions.

pub mod account;
pub mod balance;
pub mod config;
pub mod engine;
pub mod journal;
pub mod memory;
pub mod metrics;
pub mod postgres;
pub mod store;
pub mod transaction;

pub use account::{Account, AccountStatus, NewAccount};
pub use balance::{AccountBalance, PostedBalance};
pub use config::{EngineConfig, LedgerConfig, StoreConfig};
pub use engine::LedgerEngine;
pub use journal::{EntryType, JournalBatch, JournalEntry};
pub use memory::MemoryStore;
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use postgres::PgStore;
pub use store::{AccountUpdate, Claim, CommitBatch, LedgerStore, StoreError};
pub use transaction::{FailureReason, Transaction, TransactionRequest, TransactionResult};
