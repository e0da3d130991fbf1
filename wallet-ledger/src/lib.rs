//! Custodial wallet ledger and transfer engine
//!
//! Accounts hold a single non-negative balance. Funds enter through deposits
//! and move between accounts through transfers; every balance change is
//! recorded as an immutable transaction entry in the same atomic unit.
//! Reads go through an optional, advisory cache.

pub mod cache;
pub mod config;
pub mod engine;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod store;
pub mod telemetry;

pub use cache::{CacheBackend, LedgerCache, MemoryCache, RedisCache};
pub use config::{Config, LedgerSettings};
pub use engine::WalletLedger;
pub use errors::{LedgerError, Result};
pub use models::{
    Account, AccountBalance, AccountId, Amount, DepositReceipt, EntryId, EntryKind, Fetched,
    HistoryPage, PageRequest, ReadSource, TransactionEntry, TransactionFilter, TransferReceipt,
    TransferTarget, UserId,
};
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
