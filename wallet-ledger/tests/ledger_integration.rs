//! End-to-end ledger behaviour against the in-memory store and cache

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use wallet_ledger::models::TransferOutcome;
use wallet_ledger::{
    Account, AccountId, EntryKind, LedgerCache, LedgerError, LedgerSettings, LedgerStore,
    MemoryLedgerStore, PageRequest, ReadSource, TransactionEntry, TransactionFilter,
    TransferTarget, UserId, WalletLedger,
};

struct Harness {
    ledger: Arc<WalletLedger>,
    store: Arc<MemoryLedgerStore>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryLedgerStore::new());
    let ledger = Arc::new(WalletLedger::new(
        store.clone(),
        Some(LedgerCache::in_memory()),
        LedgerSettings::default(),
    ));
    Harness { ledger, store }
}

/// Account reads return their snapshot only after `delay`
struct SlowReadStore {
    inner: MemoryLedgerStore,
    delay: Duration,
}

#[async_trait]
impl LedgerStore for SlowReadStore {
    async fn create_account(&self, user_id: UserId) -> wallet_ledger::Result<Account> {
        self.inner.create_account(user_id).await
    }

    async fn get_account(&self, account_id: AccountId) -> wallet_ledger::Result<Option<Account>> {
        let account = self.inner.get_account(account_id).await;
        tokio::time::sleep(self.delay).await;
        account
    }

    async fn find_account_by_user(&self, user_id: UserId) -> wallet_ledger::Result<Option<Account>> {
        self.inner.find_account_by_user(user_id).await
    }

    async fn find_account_by_username(
        &self,
        username: &str,
    ) -> wallet_ledger::Result<Option<Account>> {
        self.inner.find_account_by_username(username).await
    }

    async fn deposit(
        &self,
        account_id: AccountId,
        amount: Decimal,
    ) -> wallet_ledger::Result<(Account, TransactionEntry)> {
        self.inner.deposit(account_id, amount).await
    }

    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> wallet_ledger::Result<TransferOutcome> {
        self.inner.transfer(from, to, amount).await
    }

    async fn account_history(
        &self,
        account_id: AccountId,
        offset: u64,
        limit: u64,
    ) -> wallet_ledger::Result<(Vec<TransactionEntry>, u64)> {
        self.inner.account_history(account_id, offset, limit).await
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        offset: u64,
        limit: u64,
    ) -> wallet_ledger::Result<(Vec<TransactionEntry>, u64)> {
        self.inner.list_transactions(filter, offset, limit).await
    }
}

async fn funded_account(h: &Harness, user: i64, amount: Decimal) -> AccountId {
    let account = h.ledger.create_account(UserId(user)).await.unwrap();
    if amount > Decimal::ZERO {
        h.ledger.deposit(account.id, amount).await.unwrap();
    }
    account.id
}

#[tokio::test]
async fn test_deposit_and_transfer_round_trip() {
    let h = harness();
    let a = funded_account(&h, 1, dec!(100)).await;
    let b = funded_account(&h, 2, Decimal::ZERO).await;

    assert_eq!(h.ledger.get_balance(a).await.unwrap().data.balance, dec!(100));

    h.ledger
        .transfer(a, TransferTarget::Account(b), dec!(40))
        .await
        .unwrap();

    assert_eq!(h.ledger.get_balance(a).await.unwrap().data.balance, dec!(60));
    assert_eq!(h.ledger.get_balance(b).await.unwrap().data.balance, dec!(40));
}

#[tokio::test]
async fn test_duplicate_account_rejected() {
    let h = harness();
    h.ledger.create_account(UserId(1)).await.unwrap();
    let err = h.ledger.create_account(UserId(1)).await.unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyExists(UserId(1))));
    assert_eq!(err.error_type(), "already_exists");
}

#[tokio::test]
async fn test_insufficient_funds_leaves_balances_unchanged() {
    let h = harness();
    let a = funded_account(&h, 1, dec!(25)).await;
    let b = funded_account(&h, 2, dec!(5)).await;

    let err = h
        .ledger
        .transfer(a, TransferTarget::Account(b), dec!(25.01))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InsufficientFunds { account, requested } if account == a && requested == dec!(25.01)
    ));

    assert_eq!(h.ledger.get_balance(a).await.unwrap().data.balance, dec!(25));
    assert_eq!(h.ledger.get_balance(b).await.unwrap().data.balance, dec!(5));
    assert_eq!(h.store.entry_count(), 2);
}

#[tokio::test]
async fn test_missing_accounts() {
    let h = harness();
    let a = funded_account(&h, 1, dec!(10)).await;

    let err = h.ledger.deposit(AccountId(999), dec!(1)).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));

    let err = h
        .ledger
        .transfer(a, TransferTarget::Account(AccountId(999)), dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));

    let err = h
        .ledger
        .transfer(AccountId(999), TransferTarget::Account(a), dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));

    let err = h
        .ledger
        .transfer(a, TransferTarget::Username("ghost".into()), dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
    assert_eq!(h.ledger.get_balance(a).await.unwrap().data.balance, dec!(10));
}

#[tokio::test]
async fn test_balance_range_overflow_is_rejected_without_side_effects() {
    let h = harness();
    let a = funded_account(&h, 1, Decimal::MAX).await;
    let b = funded_account(&h, 2, dec!(10)).await;

    let err = h.ledger.deposit(a, Decimal::ONE).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidAmount(_)));
    assert!(err.is_rejection());

    let err = h
        .ledger
        .transfer(b, TransferTarget::Account(a), dec!(10))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidAmount(_)));

    assert_eq!(h.ledger.get_balance(a).await.unwrap().data.balance, Decimal::MAX);
    assert_eq!(h.ledger.get_balance(b).await.unwrap().data.balance, dec!(10));
    assert_eq!(h.store.entry_count(), 2);
}

#[tokio::test]
async fn test_transfer_by_username() {
    let h = harness();
    let alice = h.store.register_user("alice");
    let bob = h.store.register_user("bob");

    let from = h.ledger.create_account(alice).await.unwrap().id;
    let to = h.ledger.create_account(bob).await.unwrap().id;
    h.ledger.deposit(from, dec!(50)).await.unwrap();

    let receipt = h
        .ledger
        .transfer(from, TransferTarget::Username("bob".into()), dec!(12.5))
        .await
        .unwrap();
    assert_eq!(receipt.to_account, to);

    let err = h
        .ledger
        .transfer(from, TransferTarget::Username("alice".into()), dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::SelfTransfer(_)));

    let bob_account = h.ledger.get_account_for_user(bob).await.unwrap();
    assert_eq!(bob_account.data.balance, dec!(12.5));
}

#[tokio::test]
async fn test_stale_cache_is_never_served_after_mutation() {
    let h = harness();
    let a = funded_account(&h, 1, dec!(100)).await;
    let b = funded_account(&h, 2, Decimal::ZERO).await;

    // Warm the cache
    h.ledger.get_balance(a).await.unwrap();
    h.ledger.get_balance(b).await.unwrap();
    assert!(h.ledger.get_balance(a).await.unwrap().is_cached());

    h.ledger
        .transfer(a, TransferTarget::Account(b), dec!(30))
        .await
        .unwrap();

    let a_balance = h.ledger.get_balance(a).await.unwrap();
    let b_balance = h.ledger.get_balance(b).await.unwrap();
    assert_eq!(a_balance.source, ReadSource::Store);
    assert_eq!(a_balance.data.balance, dec!(70));
    assert_eq!(b_balance.data.balance, dec!(30));
}

#[tokio::test(start_paused = true)]
async fn test_read_overlapping_a_deposit_does_not_cache_the_old_balance() {
    let store = Arc::new(SlowReadStore {
        inner: MemoryLedgerStore::new(),
        delay: Duration::from_millis(200),
    });
    let ledger = Arc::new(WalletLedger::new(
        store,
        Some(LedgerCache::in_memory()),
        LedgerSettings::default(),
    ));
    let a = ledger.create_account(UserId(1)).await.unwrap().id;

    // The read snapshots the zero balance, then stalls past the deposit
    let reader = {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.get_balance(a).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    ledger.deposit(a, dec!(100)).await.unwrap();

    let overlapped = reader.await.unwrap().unwrap();
    assert_eq!(overlapped.data.balance, Decimal::ZERO);

    let balance = ledger.get_balance(a).await.unwrap();
    assert_eq!(balance.source, ReadSource::Store);
    assert_eq!(balance.data.balance, dec!(100));
}

#[tokio::test]
async fn test_history_ordering_and_paging() {
    let h = harness();
    let a = funded_account(&h, 1, Decimal::ZERO).await;
    let b = funded_account(&h, 2, Decimal::ZERO).await;

    for i in 1..=12 {
        h.ledger.deposit(a, Decimal::from(i)).await.unwrap();
    }
    h.ledger
        .transfer(a, TransferTarget::Account(b), dec!(5))
        .await
        .unwrap();

    let first = h
        .ledger
        .get_history(a, PageRequest::new(1, 10))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(first.total, 13);
    assert_eq!(first.total_pages, 2);
    assert_eq!(first.entries.len(), 10);
    assert_eq!(first.entries[0].kind, EntryKind::Transfer);
    assert_eq!(first.entries[1].amount, dec!(12));
    for pair in first.entries.windows(2) {
        assert!(
            (pair[0].created_at, pair[0].id) > (pair[1].created_at, pair[1].id),
            "history must be newest first"
        );
    }

    let second = h
        .ledger
        .get_history(a, PageRequest::new(2, 10))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(second.entries.len(), 3);
    assert_eq!(second.entries[2].amount, dec!(1));

    // Out-of-range pages are clamped rather than rejected
    let clamped = h
        .ledger
        .get_history(b, PageRequest::new(0, 1000))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(clamped.page, 1);
    assert_eq!(clamped.page_size, 100);
    assert_eq!(clamped.total, 1);

    let empty = h
        .ledger
        .get_history(b, PageRequest::new(5, 10))
        .await
        .unwrap()
        .into_inner();
    assert!(empty.entries.is_empty());
    assert_eq!(empty.total_pages, 1);
}

#[tokio::test]
async fn test_every_mutation_is_visible_in_history() {
    let h = harness();
    let a = funded_account(&h, 1, dec!(10)).await;
    let b = funded_account(&h, 2, Decimal::ZERO).await;

    // Warm history pages for both sides
    h.ledger.get_history(a, PageRequest::first()).await.unwrap();
    h.ledger.get_history(b, PageRequest::first()).await.unwrap();

    let receipt = h
        .ledger
        .transfer(a, TransferTarget::Account(b), dec!(2))
        .await
        .unwrap();

    for account in [a, b] {
        let page = h
            .ledger
            .get_history(account, PageRequest::first())
            .await
            .unwrap()
            .into_inner();
        assert_eq!(page.entries[0].id, receipt.entry_id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_overdraft_only_one_succeeds() {
    let h = harness();
    let a = funded_account(&h, 1, dec!(100)).await;
    let b = funded_account(&h, 2, Decimal::ZERO).await;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let ledger = h.ledger.clone();
            tokio::spawn(async move {
                ledger
                    .transfer(a, TransferTarget::Account(b), dec!(60))
                    .await
            })
        })
        .collect();

    let mut successes = 0;
    let mut rejections = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(LedgerError::InsufficientFunds { .. }) => rejections += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(rejections, 1);
    assert_eq!(h.ledger.get_balance(a).await.unwrap().data.balance, dec!(40));
    assert_eq!(h.ledger.get_balance(b).await.unwrap().data.balance, dec!(60));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_conserve_total() {
    let h = harness();
    let mut accounts = Vec::new();
    for user in 1..=4 {
        accounts.push(funded_account(&h, user, dec!(250)).await);
    }
    let total_before = h.store.total_balance().unwrap();

    let mut handles = Vec::new();
    for i in 0..40usize {
        let ledger = h.ledger.clone();
        let from = accounts[i % 4];
        let to = accounts[(i * 3 + 1) % 4];
        handles.push(tokio::spawn(async move {
            ledger
                .transfer(from, TransferTarget::Account(to), dec!(37.5))
                .await
        }));
    }

    for handle in handles {
        match handle.await.unwrap() {
            Ok(_)
            | Err(LedgerError::InsufficientFunds { .. })
            | Err(LedgerError::SelfTransfer(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(h.store.total_balance(), Some(total_before));
    for account in h.store.accounts() {
        assert!(account.balance >= Decimal::ZERO);
    }
}
