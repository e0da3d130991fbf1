use crate::errors::{LedgerError, Result};
use crate::models::{
    Account, AccountId, EntryId, EntryKind, TransactionEntry, TransactionFilter, TransferOutcome,
    UserId,
};
use crate::store::LedgerStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct State {
    usernames: HashMap<String, UserId>,
    accounts: BTreeMap<AccountId, Account>,
    accounts_by_user: HashMap<UserId, AccountId>,
    /// Append-only, in creation order
    entries: Vec<TransactionEntry>,
    next_user_id: i64,
    next_account_id: i64,
    next_entry_id: i64,
    last_created_at: Option<DateTime<Utc>>,
}

impl State {
    /// Wall-clock time, but never earlier than the previous entry
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let at = match self.last_created_at {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_created_at = Some(at);
        at
    }

    fn append_entry(
        &mut self,
        from: Option<AccountId>,
        to: Option<AccountId>,
        amount: Decimal,
        kind: EntryKind,
    ) -> TransactionEntry {
        self.next_entry_id += 1;
        let entry = TransactionEntry {
            id: EntryId(self.next_entry_id),
            from_account: from,
            to_account: to,
            amount,
            kind,
            created_at: self.tick(),
        };
        self.entries.push(entry.clone());
        entry
    }

    fn page(
        &self,
        mut matches: impl FnMut(&TransactionEntry) -> bool,
        offset: u64,
        limit: u64,
    ) -> (Vec<TransactionEntry>, u64) {
        let mut total = 0u64;
        let mut page = Vec::new();
        // Entries are appended in (created_at, id) order, so reverse is newest first
        for entry in self.entries.iter().rev() {
            if !matches(entry) {
                continue;
            }
            if total >= offset && (page.len() as u64) < limit {
                page.push(entry.clone());
            }
            total += 1;
        }
        (page, total)
    }
}

/// In-process ledger store.
///
/// A single mutex guards all state and each operation runs entirely under it,
/// so the lock scope is the atomic unit. Every check happens before the first
/// write, which means a rejected operation leaves nothing behind.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<State>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a username so transfers can target it. Mirrors the user table
    /// the authentication service owns.
    pub fn register_user(&self, username: &str) -> UserId {
        let mut state = self.state.lock();
        if let Some(id) = state.usernames.get(username) {
            return *id;
        }
        state.next_user_id += 1;
        let id = UserId(state.next_user_id);
        state.usernames.insert(username.to_string(), id);
        id
    }

    /// Sum of every account balance, or `None` if it exceeds `Decimal::MAX`
    pub fn total_balance(&self) -> Option<Decimal> {
        self.state
            .lock()
            .accounts
            .values()
            .try_fold(Decimal::ZERO, |total, a| total.checked_add(a.balance))
    }

    fn set_balance(state: &mut State, account_id: AccountId, balance: Decimal) -> Result<Account> {
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| LedgerError::account_not_found(account_id))?;
        account.balance = balance;
        Ok(account.clone())
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.state.lock().accounts.values().cloned().collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_account(&self, user_id: UserId) -> Result<Account> {
        let mut state = self.state.lock();
        if state.accounts_by_user.contains_key(&user_id) {
            return Err(LedgerError::AlreadyExists(user_id));
        }

        state.next_account_id += 1;
        let account = Account {
            id: AccountId(state.next_account_id),
            user_id,
            balance: Decimal::ZERO,
            created_at: Utc::now(),
        };
        state.accounts_by_user.insert(user_id, account.id);
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, account_id: AccountId) -> Result<Option<Account>> {
        Ok(self.state.lock().accounts.get(&account_id).cloned())
    }

    async fn find_account_by_user(&self, user_id: UserId) -> Result<Option<Account>> {
        let state = self.state.lock();
        Ok(state
            .accounts_by_user
            .get(&user_id)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn find_account_by_username(&self, username: &str) -> Result<Option<Account>> {
        let state = self.state.lock();
        Ok(state
            .usernames
            .get(username)
            .and_then(|user| state.accounts_by_user.get(user))
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn deposit(
        &self,
        account_id: AccountId,
        amount: Decimal,
    ) -> Result<(Account, TransactionEntry)> {
        let mut state = self.state.lock();

        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| LedgerError::account_not_found(account_id))?;
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::balance_out_of_range(account_id))?;
        let account = account.clone();

        let entry = state.append_entry(None, Some(account_id), amount, EntryKind::Deposit);
        Ok((account, entry))
    }

    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> Result<TransferOutcome> {
        if from == to {
            return Err(LedgerError::SelfTransfer(from));
        }

        let mut state = self.state.lock();

        let source_balance = state
            .accounts
            .get(&from)
            .map(|a| a.balance)
            .ok_or_else(|| LedgerError::account_not_found(from))?;
        let destination_balance = state
            .accounts
            .get(&to)
            .map(|a| a.balance)
            .ok_or_else(|| LedgerError::account_not_found(to))?;
        if source_balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account: from,
                requested: amount,
            });
        }

        // Both new balances are computed before either account is touched
        let debited = source_balance.checked_sub(amount).ok_or_else(|| {
            LedgerError::InsufficientFunds {
                account: from,
                requested: amount,
            }
        })?;
        let credited = destination_balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::balance_out_of_range(to))?;

        let from_account = Self::set_balance(&mut state, from, debited)?;
        let to_account = Self::set_balance(&mut state, to, credited)?;

        let entry = state.append_entry(Some(from), Some(to), amount, EntryKind::Transfer);
        Ok(TransferOutcome {
            from: from_account,
            to: to_account,
            entry,
        })
    }

    async fn account_history(
        &self,
        account_id: AccountId,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<TransactionEntry>, u64)> {
        let state = self.state.lock();
        Ok(state.page(|entry| entry.involves(account_id), offset, limit))
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<TransactionEntry>, u64)> {
        let state = self.state.lock();
        Ok(state.page(|entry| filter.matches(entry), offset, limit))
    }
}
