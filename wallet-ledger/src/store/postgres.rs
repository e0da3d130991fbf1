use crate::config::DatabaseConfig;
use crate::errors::{is_check_violation, is_unique_violation, LedgerError, Result};
use crate::models::{
    Account, AccountId, EntryId, EntryKind, TransactionEntry, TransactionFilter, TransferOutcome,
    UserId,
};
use crate::store::LedgerStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{debug, info};

const ACCOUNT_COLUMNS: &str = "id, user_id, balance, created_at";
const ENTRY_COLUMNS: &str = "id, from_account_id, to_account_id, amount, kind, created_at";

/// Caps balances at `Decimal::MAX` so every stored row decodes
const BALANCE_RANGE_CONSTRAINT: &str = "wallet_accounts_balance_range";

#[derive(Debug, FromRow)]
struct AccountRow {
    id: i64,
    user_id: i64,
    balance: Decimal,
    created_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: AccountId(row.id),
            user_id: UserId(row.user_id),
            balance: row.balance,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct EntryRow {
    id: i64,
    from_account_id: Option<i64>,
    to_account_id: Option<i64>,
    amount: Decimal,
    kind: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for TransactionEntry {
    type Error = LedgerError;

    fn try_from(row: EntryRow) -> Result<Self> {
        Ok(TransactionEntry {
            id: EntryId(row.id),
            from_account: row.from_account_id.map(AccountId),
            to_account: row.to_account_id.map(AccountId),
            amount: row.amount,
            kind: row.kind.parse()?,
            created_at: row.created_at,
        })
    }
}

fn into_entries(rows: Vec<EntryRow>) -> Result<Vec<TransactionEntry>> {
    rows.into_iter().map(TransactionEntry::try_from).collect()
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// PostgreSQL ledger of record
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "Connected to ledger database"
        );

        Ok(PgLedgerStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgLedgerStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Internal(format!("migration failed: {}", e)))?;
        info!("Ledger schema is up to date");
        Ok(())
    }

    async fn insert_entry(
        conn: &mut PgConnection,
        from: Option<AccountId>,
        to: Option<AccountId>,
        amount: Decimal,
        kind: EntryKind,
    ) -> Result<TransactionEntry> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            r#"
            INSERT INTO wallet_transactions (from_account_id, to_account_id, amount, kind)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        ))
        .bind(from.map(|id| id.0))
        .bind(to.map(|id| id.0))
        .bind(amount)
        .bind(kind.as_str())
        .fetch_one(conn)
        .await?;

        row.try_into()
    }

    async fn credit(
        conn: &mut PgConnection,
        account_id: AccountId,
        amount: Decimal,
    ) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            r#"
            UPDATE wallet_accounts
            SET balance = balance + $1
            WHERE id = $2
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(amount)
        .bind(account_id.0)
        .fetch_optional(conn)
        .await
        .map_err(|e| {
            if is_check_violation(&e, BALANCE_RANGE_CONSTRAINT) {
                LedgerError::balance_out_of_range(account_id)
            } else {
                LedgerError::from(e)
            }
        })?;

        Ok(row.map(Account::from))
    }

    fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &TransactionFilter) {
        builder.push(" WHERE TRUE");
        if let Some(account) = filter.account {
            builder
                .push(" AND (from_account_id = ")
                .push_bind(account.0)
                .push(" OR to_account_id = ")
                .push_bind(account.0)
                .push(")");
        }
        if let Some(kind) = filter.kind {
            builder.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(from) = filter.from {
            builder.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            builder.push(" AND created_at <= ").push_bind(to);
        }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_account(&self, user_id: UserId) -> Result<Account> {
        let result = sqlx::query_as::<_, AccountRow>(&format!(
            r#"
            INSERT INTO wallet_accounts (user_id)
            VALUES ($1)
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.into()),
            Err(e) if is_unique_violation(&e) => Err(LedgerError::AlreadyExists(user_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_account(&self, account_id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {} FROM wallet_accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Account::from))
    }

    async fn find_account_by_user(&self, user_id: UserId) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {} FROM wallet_accounts WHERE user_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Account::from))
    }

    async fn find_account_by_username(&self, username: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT a.id, a.user_id, a.balance, a.created_at
            FROM wallet_accounts a
            JOIN wallet_users u ON u.id = a.user_id
            WHERE u.username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Account::from))
    }

    async fn deposit(
        &self,
        account_id: AccountId,
        amount: Decimal,
    ) -> Result<(Account, TransactionEntry)> {
        let mut tx = self.pool.begin().await?;

        // Atomic increment; the balance is never read back into the engine first
        let account = Self::credit(&mut tx, account_id, amount)
            .await?
            .ok_or_else(|| LedgerError::account_not_found(account_id))?;

        let entry =
            Self::insert_entry(&mut tx, None, Some(account_id), amount, EntryKind::Deposit)
                .await?;

        tx.commit().await?;

        debug!(account_id = %account_id, entry_id = %entry.id, "Deposit committed");
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

        let mut tx = self.pool.begin().await?;

        // Lock both rows in id order so opposing transfers cannot deadlock
        let locked: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM wallet_accounts
            WHERE id = ANY($1)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(vec![from.0, to.0])
        .fetch_all(&mut *tx)
        .await?;

        if !locked.contains(&from.0) {
            return Err(LedgerError::account_not_found(from));
        }
        if !locked.contains(&to.0) {
            return Err(LedgerError::account_not_found(to));
        }

        // Conditional debit: the predicate re-checks sufficiency at write time
        let debited = sqlx::query_as::<_, AccountRow>(&format!(
            r#"
            UPDATE wallet_accounts
            SET balance = balance - $1
            WHERE id = $2 AND balance >= $1
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(amount)
        .bind(from.0)
        .fetch_optional(&mut *tx)
        .await?;

        let from_account = match debited {
            Some(row) => Account::from(row),
            None => {
                return Err(LedgerError::InsufficientFunds {
                    account: from,
                    requested: amount,
                })
            }
        };

        let to_account = Self::credit(&mut tx, to, amount)
            .await?
            .ok_or_else(|| LedgerError::account_not_found(to))?;

        let entry =
            Self::insert_entry(&mut tx, Some(from), Some(to), amount, EntryKind::Transfer).await?;

        tx.commit().await?;

        debug!(from = %from, to = %to, entry_id = %entry.id, "Transfer committed");
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
        let mut tx = self.pool.begin().await?;
        // Count and page must observe the same snapshot
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM wallet_transactions
            WHERE from_account_id = $1 OR to_account_id = $1
            "#,
        )
        .bind(account_id.0)
        .fetch_one(&mut *tx)
        .await?;

        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            r#"
            SELECT {}
            FROM wallet_transactions
            WHERE from_account_id = $1 OR to_account_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
            ENTRY_COLUMNS
        ))
        .bind(account_id.0)
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((into_entries(rows)?, total.max(0) as u64))
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<TransactionEntry>, u64)> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM wallet_transactions");
        Self::push_filter(&mut count, filter);
        let total: i64 = count.build().fetch_one(&mut *tx).await?.try_get(0)?;

        let mut page = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM wallet_transactions",
            ENTRY_COLUMNS
        ));
        Self::push_filter(&mut page, filter);
        page.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(to_i64(limit))
            .push(" OFFSET ")
            .push_bind(to_i64(offset));
        let rows = page
            .build_query_as::<EntryRow>()
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok((into_entries(rows)?, total.max(0) as u64))
    }
}
