//! Ledger of record
//!
//! Every mutating method is one atomic unit: the balance change(s) and the
//! transaction entry either all commit or none do. Implementations are the
//! only place the non-negative balance invariant is enforced.

use crate::errors::Result;
use crate::models::{
    Account, AccountId, TransactionEntry, TransactionFilter, TransferOutcome, UserId,
};
use async_trait::async_trait;
use rust_decimal::Decimal;

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create a zero-balance account. Fails with `AlreadyExists` when the
    /// user's uniqueness constraint rejects the insert.
    async fn create_account(&self, user_id: UserId) -> Result<Account>;

    async fn get_account(&self, account_id: AccountId) -> Result<Option<Account>>;

    async fn find_account_by_user(&self, user_id: UserId) -> Result<Option<Account>>;

    async fn find_account_by_username(&self, username: &str) -> Result<Option<Account>>;

    /// Atomically credit `amount` and record a deposit entry.
    async fn deposit(
        &self,
        account_id: AccountId,
        amount: Decimal,
    ) -> Result<(Account, TransactionEntry)>;

    /// Atomically debit `from` (only if its balance covers `amount`), credit
    /// `to`, and record a transfer entry.
    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> Result<TransferOutcome>;

    /// Entries touching `account_id`, newest first, plus the total count.
    async fn account_history(
        &self,
        account_id: AccountId,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<TransactionEntry>, u64)>;

    /// Ledger-wide entries matching `filter`, newest first, plus the total count.
    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<TransactionEntry>, u64)>;
}
