//! Postgres-backed ledger store.
//!
//! One sqlx transaction per atomic unit. The funds-check lock is a
//! `SELECT ... FOR UPDATE` on the wallet row; a debit is an `UPDATE` that
//! must hit an existing row; a credit is a single conditional upsert so two
//! concurrent first-credits cannot both win the insert. The unique index on
//! `transactions.idempotency_key` (SQLSTATE 23505) is the arbiter for
//! concurrent retries of the same request.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use goldmint_core::{AccountId, TransactionId};
use goldmint_ledger::{
    Account, AccountKind, Amount, LedgerEntry, TransactionRecord, WalletBalance,
};

use super::{
    BalanceRepository, LedgerStore, LedgerUnit, NewLedgerEntry, NewTransaction, StoreError,
    TransactionRepository,
};

const SCHEMA: &str = include_str!("schema.sql");

/// Postgres-backed ledger store.
///
/// Uses the sqlx connection pool (thread-safe, `Send + Sync`); every unit of
/// work is one database transaction, so a dropped unit rolls back.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the ledger schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Ensure the asset type row and the singleton treasury account exist,
    /// with a zero-balance treasury wallet for `asset_type`.
    #[instrument(skip(self), err)]
    pub async fn seed(
        &self,
        asset_type: &str,
        treasury_name: &str,
    ) -> Result<Account, StoreError> {
        sqlx::query("INSERT INTO asset_types (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(asset_type)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("seed_asset_type", e))?;

        let treasury = match self.treasury_account().await? {
            Some(account) => account,
            None => {
                self.create_account(treasury_name, AccountKind::Treasury)
                    .await?
            }
        };

        sqlx::query(
            r#"
            INSERT INTO wallet_balances (account_id, asset_type, balance)
            VALUES ($1, $2, 0)
            ON CONFLICT (account_id, asset_type) DO NOTHING
            "#,
        )
        .bind(treasury.id.as_uuid())
        .bind(asset_type)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("seed_treasury_wallet", e))?;

        Ok(treasury)
    }

    /// Provision an account. The ledger core never mutates accounts.
    pub async fn create_account(
        &self,
        name: &str,
        kind: AccountKind,
    ) -> Result<Account, StoreError> {
        let id = AccountId::new();
        let row = sqlx::query(
            r#"
            INSERT INTO accounts (id, name, type)
            VALUES ($1, $2, $3)
            RETURNING id, name, type, created_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(name)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_account", e))?;

        account_from_row(&row)
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    type Unit = PgLedgerUnit;

    async fn begin(&self) -> Result<Self::Unit, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(PgLedgerUnit { tx })
    }

    async fn treasury_account(&self) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, type, created_at FROM accounts WHERE type = 'TREASURY' LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("treasury_account", e))?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, idempotency_key, type, amount, reference_id, status, metadata, created_at
            FROM transactions
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_transaction", e))?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn find_transaction_by_key(
        &self,
        key: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, idempotency_key, type, amount, reference_id, status, metadata, created_at
            FROM transactions
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_transaction_by_key", e))?;

        row.as_ref().map(transaction_from_row).transpose()
    }
}

/// Atomic unit over one Postgres transaction.
pub struct PgLedgerUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl BalanceRepository for PgLedgerUnit {
    async fn lock_and_get(
        &mut self,
        account_id: AccountId,
        asset_type: &str,
    ) -> Result<Option<WalletBalance>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT account_id, asset_type, balance, updated_at
            FROM wallet_balances
            WHERE account_id = $1 AND asset_type = $2
            FOR UPDATE
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(asset_type)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_and_get", e))?;

        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn apply_delta(
        &mut self,
        account_id: AccountId,
        asset_type: &str,
        delta: i64,
    ) -> Result<WalletBalance, StoreError> {
        let row = if delta < 0 {
            // Debit: the row must exist already.
            sqlx::query(
                r#"
                UPDATE wallet_balances
                SET balance = balance + $3, updated_at = NOW()
                WHERE account_id = $1 AND asset_type = $2
                RETURNING account_id, asset_type, balance, updated_at
                "#,
            )
            .bind(account_id.as_uuid())
            .bind(asset_type)
            .bind(delta)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("apply_delta", e))?
            .ok_or_else(|| StoreError::WalletNotFound {
                account_id,
                asset_type: asset_type.to_string(),
            })?
        } else {
            // Credit: insert-or-add in one statement.
            sqlx::query(
                r#"
                INSERT INTO wallet_balances (account_id, asset_type, balance)
                VALUES ($1, $2, $3)
                ON CONFLICT (account_id, asset_type)
                DO UPDATE SET
                    balance = wallet_balances.balance + EXCLUDED.balance,
                    updated_at = NOW()
                RETURNING account_id, asset_type, balance, updated_at
                "#,
            )
            .bind(account_id.as_uuid())
            .bind(asset_type)
            .bind(delta)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("apply_delta", e))?
        };

        wallet_from_row(&row)
    }
}

#[async_trait::async_trait]
impl TransactionRepository for PgLedgerUnit {
    async fn create_transaction(
        &mut self,
        new: NewTransaction,
    ) -> Result<TransactionRecord, StoreError> {
        let created_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO transactions
                (id, idempotency_key, type, amount, reference_id, status, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(new.id.as_uuid())
        .bind(&new.idempotency_key)
        .bind(new.kind.as_str())
        .bind(new.amount.minor())
        .bind(&new.reference_id)
        .bind(new.status.as_str())
        .bind(&new.metadata)
        .bind(created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!(
                    "idempotency key {:?} already used",
                    new.idempotency_key
                ))
            } else {
                map_sqlx_error("create_transaction", e)
            }
        })?;

        Ok(TransactionRecord {
            id: new.id,
            idempotency_key: new.idempotency_key,
            kind: new.kind,
            amount: new.amount,
            reference_id: new.reference_id,
            status: new.status,
            metadata: new.metadata,
            created_at,
        })
    }

    async fn find_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, idempotency_key, type, amount, reference_id, status, metadata, created_at
            FROM transactions
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn create_ledger_entry(
        &mut self,
        new: NewLedgerEntry,
    ) -> Result<LedgerEntry, StoreError> {
        let created_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, transaction_id, account_id, asset_type, amount, direction, balance_after, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(new.id.as_uuid())
        .bind(new.transaction_id.as_uuid())
        .bind(new.account_id.as_uuid())
        .bind(&new.asset_type)
        .bind(new.amount.minor())
        .bind(new.direction.as_str())
        .bind(new.balance_after)
        .bind(created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("create_ledger_entry", e))?;

        Ok(LedgerEntry {
            id: new.id,
            transaction_id: new.transaction_id,
            account_id: new.account_id,
            asset_type: new.asset_type,
            amount: new.amount,
            direction: new.direction,
            balance_after: new.balance_after,
            created_at,
        })
    }

    async fn mark_completed(&mut self, id: TransactionId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE transactions SET status = 'COMPLETED' WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("mark_completed", e))?;

        if result.rows_affected() != 1 {
            return Err(StoreError::Storage(format!(
                "transaction {id} not found for finalization"
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerUnit for PgLedgerUnit {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

// Row decoding

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    Ok(Account {
        id: AccountId::from_uuid(read(row, "id")?),
        name: read(row, "name")?,
        kind: parse_token(&read::<String>(row, "type")?)?,
        created_at: read(row, "created_at")?,
    })
}

fn wallet_from_row(row: &PgRow) -> Result<WalletBalance, StoreError> {
    Ok(WalletBalance {
        account_id: AccountId::from_uuid(read(row, "account_id")?),
        asset_type: read(row, "asset_type")?,
        balance: read(row, "balance")?,
        updated_at: read(row, "updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<TransactionRecord, StoreError> {
    let amount: i64 = read(row, "amount")?;
    Ok(TransactionRecord {
        id: TransactionId::from_uuid(read(row, "id")?),
        idempotency_key: read(row, "idempotency_key")?,
        kind: parse_token(&read::<String>(row, "type")?)?,
        amount: Amount::from_minor(amount)
            .map_err(|e| StoreError::Storage(format!("corrupt amount column: {e}")))?,
        reference_id: read(row, "reference_id")?,
        status: parse_token(&read::<String>(row, "status")?)?,
        metadata: read(row, "metadata")?,
        created_at: read::<DateTime<Utc>>(row, "created_at")?,
    })
}

fn read<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Storage(format!("failed to decode column {column}: {e}")))
}

fn parse_token<T>(token: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    token
        .parse()
        .map_err(|e| StoreError::Storage(format!("corrupt enum column: {e}")))
}

/// Map sqlx errors to [`StoreError`], tagging the failing operation.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                StoreError::Conflict(format!("unique violation in {operation}: {}", db_err.message()))
            } else {
                StoreError::Storage(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                ))
            }
        }
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
