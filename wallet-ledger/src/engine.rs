//! Wallet ledger engine
//!
//! Orchestrates store atomic units and cache maintenance. Mutations always go
//! to the store; the cache only ever serves reads and is cleared after commit.

use crate::cache::{keys, LedgerCache};
use crate::config::LedgerSettings;
use crate::errors::{LedgerError, Result};
use crate::metrics;
use crate::models::{
    Account, AccountBalance, AccountId, Amount, DepositReceipt, Fetched, HistoryPage, Page,
    PageRequest, TransactionFilter, TransferReceipt, TransferTarget, UserId,
};
use crate::store::LedgerStore;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

pub struct WalletLedger {
    store: Arc<dyn LedgerStore>,
    cache: Option<LedgerCache>,
    settings: LedgerSettings,
}

impl WalletLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cache: Option<LedgerCache>,
        settings: LedgerSettings,
    ) -> Self {
        WalletLedger {
            store,
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub fn cache(&self) -> Option<&LedgerCache> {
        self.cache.as_ref()
    }

    /// Open a zero-balance account for `user_id`
    #[instrument(skip(self))]
    pub async fn create_account(&self, user_id: UserId) -> Result<Account> {
        let started = Instant::now();
        let result = self.store.create_account(user_id).await;
        self.record("create_account", started, &result);

        let account = result?;
        self.invalidate(vec![keys::account_by_user(user_id)]).await;

        info!(account_id = %account.id, user_id = %user_id, "Account created");
        Ok(account)
    }

    /// Credit an account from outside the ledger
    #[instrument(skip(self))]
    pub async fn deposit(&self, account_id: AccountId, amount: Decimal) -> Result<DepositReceipt> {
        let started = Instant::now();
        let result = self.deposit_inner(account_id, amount).await;
        self.record("deposit", started, &result);
        result
    }

    async fn deposit_inner(&self, account_id: AccountId, amount: Decimal) -> Result<DepositReceipt> {
        let amount = Amount::with_precision(amount, self.settings.decimal_precision)?;

        let (account, entry) = self.store.deposit(account_id, amount.value()).await?;

        self.invalidate(self.account_keys(&account)).await;
        metrics::DEPOSIT_AMOUNT.observe(amount.value().to_f64().unwrap_or_default());

        info!(
            account_id = %account_id,
            amount = %amount,
            entry_id = %entry.id,
            "Deposit completed"
        );

        Ok(DepositReceipt {
            entry_id: entry.id,
            account_id,
            balance: account.balance,
        })
    }

    /// Move funds from `from` to the account `destination` resolves to
    #[instrument(skip(self))]
    pub async fn transfer(
        &self,
        from: AccountId,
        destination: TransferTarget,
        amount: Decimal,
    ) -> Result<TransferReceipt> {
        let started = Instant::now();
        let result = self.transfer_inner(from, &destination, amount).await;
        self.record("transfer", started, &result);
        result
    }

    async fn transfer_inner(
        &self,
        from: AccountId,
        destination: &TransferTarget,
        amount: Decimal,
    ) -> Result<TransferReceipt> {
        let amount = Amount::with_precision(amount, self.settings.decimal_precision)?;

        let to = self.resolve_destination(destination).await?;
        if to == from {
            return Err(LedgerError::SelfTransfer(from));
        }

        let outcome = self.store.transfer(from, to, amount.value()).await?;

        let mut stale = self.account_keys(&outcome.from);
        stale.extend(self.account_keys(&outcome.to));
        self.invalidate(stale).await;

        info!(
            from = %from,
            to = %to,
            amount = %amount,
            entry_id = %outcome.entry.id,
            "Transfer completed"
        );

        Ok(TransferReceipt {
            entry_id: outcome.entry.id,
            from_account: from,
            to_account: to,
            amount: outcome.entry.amount,
            created_at: outcome.entry.created_at,
        })
    }

    /// Always resolved against the store, never the cache
    async fn resolve_destination(&self, destination: &TransferTarget) -> Result<AccountId> {
        match destination {
            TransferTarget::Account(id) => Ok(*id),
            TransferTarget::User(user_id) => self
                .store
                .find_account_by_user(*user_id)
                .await?
                .map(|account| account.id)
                .ok_or_else(|| LedgerError::user_not_found(user_id)),
            TransferTarget::Username(username) => self
                .store
                .find_account_by_username(username)
                .await?
                .map(|account| account.id)
                .ok_or_else(|| LedgerError::user_not_found(format!("'{}'", username))),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_balance(&self, account_id: AccountId) -> Result<Fetched<AccountBalance>> {
        let started = Instant::now();
        let result = self
            .read_through(
                keys::balance(account_id),
                self.settings.balance_ttl,
                self.load_balance(account_id),
            )
            .await;
        self.record("get_balance", started, &result);
        result
    }

    async fn load_balance(&self, account_id: AccountId) -> Result<AccountBalance> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::account_not_found(account_id))?;

        Ok(AccountBalance {
            account_id,
            balance: account.balance,
        })
    }

    /// Entries where the account is source or destination, newest first
    #[instrument(skip(self))]
    pub async fn get_history(
        &self,
        account_id: AccountId,
        request: PageRequest,
    ) -> Result<Fetched<HistoryPage>> {
        let started = Instant::now();
        let page = self.normalize(request);
        let result = self
            .read_through(
                keys::history(account_id, page),
                self.settings.history_ttl,
                self.load_history(account_id, page),
            )
            .await;
        self.record("get_history", started, &result);
        result
    }

    async fn load_history(&self, account_id: AccountId, page: Page) -> Result<HistoryPage> {
        if self.store.get_account(account_id).await?.is_none() {
            return Err(LedgerError::account_not_found(account_id));
        }

        let (entries, total) = self
            .store
            .account_history(account_id, page.offset(), page.limit())
            .await?;

        Ok(HistoryPage::new(entries, page, total))
    }

    #[instrument(skip(self))]
    pub async fn get_account_for_user(&self, user_id: UserId) -> Result<Fetched<Account>> {
        let started = Instant::now();
        let result = self
            .read_through(
                keys::account_by_user(user_id),
                self.settings.account_ttl,
                self.load_account_for_user(user_id),
            )
            .await;
        self.record("get_account_for_user", started, &result);
        result
    }

    async fn load_account_for_user(&self, user_id: UserId) -> Result<Account> {
        self.store
            .find_account_by_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::user_not_found(user_id))
    }

    /// Ledger-wide listing. Cached pages are never invalidated and expire
    /// with the history TTL.
    #[instrument(skip(self))]
    pub async fn list_transactions(
        &self,
        filter: TransactionFilter,
        request: PageRequest,
    ) -> Result<Fetched<HistoryPage>> {
        let started = Instant::now();
        let page = self.normalize(request);
        let result = self
            .read_through(
                keys::ledger_listing(&filter, page),
                self.settings.history_ttl,
                self.load_listing(&filter, page),
            )
            .await;
        self.record("list_transactions", started, &result);
        result
    }

    async fn load_listing(&self, filter: &TransactionFilter, page: Page) -> Result<HistoryPage> {
        let (entries, total) = self
            .store
            .list_transactions(filter, page.offset(), page.limit())
            .await?;

        Ok(HistoryPage::new(entries, page, total))
    }

    fn normalize(&self, request: PageRequest) -> Page {
        request.normalize(self.settings.default_page_size, self.settings.max_page_size)
    }

    /// Serve from cache when possible, otherwise run `load` and populate.
    /// Errors from `load` are never cached.
    async fn read_through<T, F>(&self, key: String, ttl: Duration, load: F) -> Result<Fetched<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<T>>,
    {
        let cache = match &self.cache {
            Some(cache) => cache,
            None => return load.await.map(Fetched::fresh),
        };

        if let Some(hit) = cache.get_json::<T>(&key).await {
            debug!(key = %key, "Served from cache");
            return Ok(Fetched::cached(hit));
        }

        let observed = cache.epoch();
        let value = load.await?;
        cache.put_json_if_current(&key, &value, ttl, observed).await;
        Ok(Fetched::fresh(value))
    }

    /// Keys derived from one account's state
    fn account_keys(&self, account: &Account) -> Vec<String> {
        let mut stale = vec![
            keys::balance(account.id),
            keys::account_by_user(account.user_id),
        ];
        stale.extend(keys::history_prefix(
            account.id,
            self.settings.history_invalidation_pages,
            &self.settings.history_invalidation_page_sizes,
        ));
        stale
    }

    async fn invalidate(&self, stale: Vec<String>) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&stale).await;
        }
    }

    fn record<T>(&self, operation: &'static str, started: Instant, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => "success",
            Err(e) if e.is_rejection() => "rejected",
            Err(_) => "error",
        };
        metrics::record_operation(operation, outcome, started.elapsed().as_secs_f64());

        match result {
            Err(e) if e.is_rejection() => {
                warn!(operation, error_type = e.error_type(), error = %e, "Ledger operation rejected")
            }
            Err(e) => {
                error!(operation, error_type = e.error_type(), error = %e, "Ledger operation failed")
            }
            Ok(_) => {}
        }
    }
}
