use crate::errors::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                $name(value)
            }
        }
    };
}

id_type!(
    /// Wallet identifier
    AccountId
);
id_type!(
    /// Identity handed to the ledger by the authentication layer
    UserId
);
id_type!(
    /// Transaction entry identifier, increasing in creation order
    EntryId
);

/// Wallet account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Kind of balance-affecting event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Deposit,
    Transfer,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deposit" => Ok(EntryKind::Deposit),
            "transfer" => Ok(EntryKind::Transfer),
            other => Err(LedgerError::Internal(format!(
                "unknown transaction kind '{}'",
                other
            ))),
        }
    }
}

/// Immutable record of one balance-affecting event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub id: EntryId,
    pub from_account: Option<AccountId>,
    pub to_account: Option<AccountId>,
    pub amount: Decimal,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
}

impl TransactionEntry {
    pub fn involves(&self, account_id: AccountId) -> bool {
        self.from_account == Some(account_id) || self.to_account == Some(account_id)
    }
}

/// Strictly positive monetary amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self> {
        if value <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "amount must be positive, got {}",
                value
            )));
        }
        Ok(Amount(value))
    }

    /// Rejects amounts carrying more fractional digits than the ledger stores.
    pub fn with_precision(value: Decimal, precision: u32) -> Result<Self> {
        let amount = Amount::new(value)?;
        let scale = value.normalize().scale();
        if scale > precision {
            return Err(LedgerError::InvalidAmount(format!(
                "amount {} has {} fractional digits, at most {} allowed",
                value, scale, precision
            )));
        }
        Ok(amount)
    }

    /// Boundary conversion for callers that still hold binary floats.
    pub fn from_f64(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(LedgerError::InvalidAmount(format!(
                "amount must be finite, got {}",
                value
            )));
        }
        let decimal = Decimal::from_f64(value).ok_or_else(|| {
            LedgerError::InvalidAmount(format!("amount {} is out of range", value))
        })?;
        Amount::new(decimal)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let decimal = Decimal::from_str(s.trim())
            .map_err(|e| LedgerError::InvalidAmount(format!("'{}': {}", s, e)))?;
        Amount::new(decimal)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Destination of a transfer as the caller names it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    Account(AccountId),
    User(UserId),
    Username(String),
}

impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferTarget::Account(id) => write!(f, "account {}", id),
            TransferTarget::User(id) => write!(f, "user {}", id),
            TransferTarget::Username(name) => write!(f, "user '{}'", name),
        }
    }
}

/// Balance as served to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub balance: Decimal,
}

/// Result of a committed deposit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositReceipt {
    pub entry_id: EntryId,
    pub account_id: AccountId,
    pub balance: Decimal,
}

/// Result of a committed transfer. Balances are intentionally absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub entry_id: EntryId,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Both sides of a committed transfer, as reported by the store
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub from: Account,
    pub to: Account,
    pub entry: TransactionEntry,
}

/// Where a read was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadSource {
    Cache,
    Store,
}

/// A read result tagged with its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fetched<T> {
    pub data: T,
    pub source: ReadSource,
}

impl<T> Fetched<T> {
    pub fn cached(data: T) -> Self {
        Fetched {
            data,
            source: ReadSource::Cache,
        }
    }

    pub fn fresh(data: T) -> Self {
        Fetched {
            data,
            source: ReadSource::Store,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.source == ReadSource::Cache
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

/// Requested page; unset fields fall back to the ledger defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        PageRequest {
            page: Some(page),
            page_size: Some(page_size),
        }
    }

    pub fn first() -> Self {
        PageRequest::default()
    }

    /// Page is at least 1; size is clamped to `[1, max_page_size]`.
    pub fn normalize(&self, default_page_size: u32, max_page_size: u32) -> Page {
        let page = self.page.unwrap_or(1).max(1);
        let page_size = self
            .page_size
            .unwrap_or(default_page_size)
            .clamp(1, max_page_size.max(1));
        Page { page, page_size }
    }
}

/// Normalized page coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.page_size as u64
    }

    pub fn limit(&self) -> u64 {
        self.page_size as u64
    }

    pub fn total_pages(&self, total: u64) -> u64 {
        total.div_ceil(self.page_size as u64)
    }
}

/// One page of transaction entries, newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub entries: Vec<TransactionEntry>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl HistoryPage {
    pub fn new(entries: Vec<TransactionEntry>, page: Page, total: u64) -> Self {
        HistoryPage {
            entries,
            page: page.page,
            page_size: page.page_size,
            total,
            total_pages: page.total_pages(total),
        }
    }
}

/// Ledger-wide listing filter. Bounds on `created_at` are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub account: Option<AccountId>,
    pub kind: Option<EntryKind>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    pub fn matches(&self, entry: &TransactionEntry) -> bool {
        if let Some(account) = self.account {
            if !entry.involves(account) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if entry.kind != kind {
                return false;
            }
        }
        if let Some(from) = self.from {
            if entry.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.created_at > to {
                return false;
            }
        }
        true
    }
}
