//! Ledger store abstraction.
//!
//! A `LedgerStore` hands out atomic units of work (`LedgerUnit`). The unit
//! exposes the two repository surfaces the engine writes through — wallet
//! balances and transactions/entries — and commits or rolls back as a whole.
//! Dropping an uncommitted unit rolls back.

use async_trait::async_trait;
use thiserror::Error;

use goldmint_core::{AccountId, EntryId, TransactionId};
use goldmint_ledger::{
    Account, Amount, Direction, LedgerEntry, TransactionRecord, TransactionStatus,
    TransactionType, WalletBalance,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

/// Storage operation error.
///
/// These are **infrastructure errors**; the engine classifies them before
/// anything reaches a caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint conflict: the idempotency key is already used or
    /// reserved by a concurrent unit.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A debit targeted a wallet row that does not exist. Debits never
    /// materialize wallets.
    #[error("wallet not found for account {account_id} (asset {asset_type})")]
    WalletNotFound {
        account_id: AccountId,
        asset_type: String,
    },

    /// Any other storage failure (connectivity, constraint, decode).
    #[error("storage error: {0}")]
    Storage(String),
}

/// Fields of a new transaction row. The engine creates these as `PENDING`
/// and finalizes them inside the same unit.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub id: TransactionId,
    pub idempotency_key: String,
    pub kind: TransactionType,
    pub amount: Amount,
    pub reference_id: Option<String>,
    pub status: TransactionStatus,
    pub metadata: serde_json::Value,
}

/// Fields of a new ledger entry row. Insert-only, never updated.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub id: EntryId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub asset_type: String,
    pub amount: Amount,
    pub direction: Direction,
    pub balance_after: i64,
}

/// Wallet balance operations available inside an atomic unit.
#[async_trait]
pub trait BalanceRepository {
    /// Read a balance row, taking an exclusive lock held until the unit
    /// ends. Absence is `None`, not an error: the credit path treats it as a
    /// row to create, the funds check treats it as a zero balance.
    async fn lock_and_get(
        &mut self,
        account_id: AccountId,
        asset_type: &str,
    ) -> Result<Option<WalletBalance>, StoreError>;

    /// Apply a signed delta to a balance and return the mutated row.
    ///
    /// A negative delta requires the row to exist (`WalletNotFound`
    /// otherwise). A non-negative delta is a single conditional upsert, so
    /// two concurrent first-credits to the same wallet cannot both win the
    /// insert.
    async fn apply_delta(
        &mut self,
        account_id: AccountId,
        asset_type: &str,
        delta: i64,
    ) -> Result<WalletBalance, StoreError>;
}

/// Transaction and ledger-entry operations available inside an atomic unit.
#[async_trait]
pub trait TransactionRepository {
    /// Insert a transaction row. Store-level uniqueness of the idempotency
    /// key is the race arbiter: a duplicate insert fails with
    /// [`StoreError::Conflict`].
    async fn create_transaction(
        &mut self,
        new: NewTransaction,
    ) -> Result<TransactionRecord, StoreError>;

    /// Point read by idempotency key (committed rows only).
    async fn find_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> Result<Option<TransactionRecord>, StoreError>;

    /// Insert one leg of a transaction's double entry.
    async fn create_ledger_entry(
        &mut self,
        new: NewLedgerEntry,
    ) -> Result<LedgerEntry, StoreError>;

    /// Transition a transaction created by this unit to `COMPLETED`.
    async fn mark_completed(&mut self, id: TransactionId) -> Result<(), StoreError>;
}

/// One atomic unit of work against the store.
#[async_trait]
pub trait LedgerUnit: BalanceRepository + TransactionRepository + Send {
    /// Commit every staged mutation and release all locks.
    async fn commit(self) -> Result<(), StoreError>
    where
        Self: Sized;

    /// Discard every staged mutation and release all locks.
    async fn rollback(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

/// Durable ledger storage.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Unit: LedgerUnit + Send;

    /// Begin an atomic unit of work.
    async fn begin(&self) -> Result<Self::Unit, StoreError>;

    /// Resolve the singleton treasury account, if provisioned.
    async fn treasury_account(&self) -> Result<Option<Account>, StoreError>;

    /// Point read outside any unit.
    async fn find_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<TransactionRecord>, StoreError>;

    /// Point read by idempotency key outside any unit.
    async fn find_transaction_by_key(
        &self,
        key: &str,
    ) -> Result<Option<TransactionRecord>, StoreError>;
}
