//! In-memory ledger store.
//!
//! Intended for tests/dev. Mutations are staged on the unit and applied to
//! the shared tables on commit. Exclusive row locks are modeled with one
//! async mutex per wallet row, and the unique index on the idempotency key
//! is modeled with a per-key mutex: a conflicting insert waits on the
//! holder's unit the way a blocked insert waits on the winner's transaction
//! in the database. Lock waits are bounded; a timeout aborts the unit the
//! way the database's deadlock detector would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use goldmint_core::{AccountId, TransactionId};
use goldmint_ledger::{Account, AccountKind, LedgerEntry, TransactionRecord, WalletBalance};

use super::{
    BalanceRepository, LedgerStore, LedgerUnit, NewLedgerEntry, NewTransaction, StoreError,
    TransactionRepository,
};

const LOCK_WAIT: Duration = Duration::from_secs(5);

type WalletKey = (AccountId, String);

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    wallets: HashMap<WalletKey, WalletBalance>,
    transactions: HashMap<TransactionId, TransactionRecord>,
    by_key: HashMap<String, TransactionId>,
    entries: Vec<LedgerEntry>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<WalletKey, Arc<AsyncMutex<()>>>>,
    key_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Shared {
    fn row_lock(&self, key: &WalletKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.row_locks.lock().unwrap();
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.key_locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// In-memory ledger store (tests/dev twin of the Postgres store).
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision an account (stand-in for schema seeding).
    pub fn create_account(&self, name: &str, kind: AccountKind) -> Account {
        let account = Account {
            id: AccountId::new(),
            name: name.to_string(),
            kind,
            created_at: Utc::now(),
        };
        let mut tables = self.shared.tables.lock().unwrap();
        tables.accounts.insert(account.id, account.clone());
        account
    }

    /// Ensure the singleton treasury account exists with a zero-balance
    /// wallet for `asset_type`, mirroring the Postgres seed.
    pub fn seed(&self, asset_type: &str, treasury_name: &str) -> Account {
        let existing = {
            let tables = self.shared.tables.lock().unwrap();
            tables
                .accounts
                .values()
                .find(|a| a.kind == AccountKind::Treasury)
                .cloned()
        };
        let treasury =
            existing.unwrap_or_else(|| self.create_account(treasury_name, AccountKind::Treasury));

        let mut tables = self.shared.tables.lock().unwrap();
        tables
            .wallets
            .entry((treasury.id, asset_type.to_string()))
            .or_insert_with(|| WalletBalance {
                account_id: treasury.id,
                asset_type: asset_type.to_string(),
                balance: 0,
                updated_at: Utc::now(),
            });
        treasury
    }

    /// Committed wallet snapshot (test inspection).
    pub fn wallet(&self, account_id: AccountId, asset_type: &str) -> Option<WalletBalance> {
        let tables = self.shared.tables.lock().unwrap();
        tables
            .wallets
            .get(&(account_id, asset_type.to_string()))
            .cloned()
    }

    /// Committed entries for a transaction (test inspection).
    pub fn entries_for(&self, transaction_id: TransactionId) -> Vec<LedgerEntry> {
        let tables = self.shared.tables.lock().unwrap();
        tables
            .entries
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect()
    }

    /// Number of committed transactions (test inspection).
    pub fn transaction_count(&self) -> usize {
        self.shared.tables.lock().unwrap().transactions.len()
    }

    /// Ids of all committed transactions (test inspection).
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        let tables = self.shared.tables.lock().unwrap();
        tables.transactions.keys().copied().collect()
    }
}

/// Atomic unit over the in-memory tables.
pub struct InMemoryUnit {
    shared: Arc<Shared>,
    held_rows: HashMap<WalletKey, OwnedMutexGuard<()>>,
    key_guard: Option<OwnedMutexGuard<()>>,
    staged_wallets: HashMap<WalletKey, WalletBalance>,
    staged_transaction: Option<TransactionRecord>,
    staged_entries: Vec<LedgerEntry>,
}

impl InMemoryUnit {
    async fn lock_row(&mut self, key: &WalletKey) -> Result<(), StoreError> {
        if self.held_rows.contains_key(key) {
            return Ok(());
        }
        let lock = self.shared.row_lock(key);
        let guard = tokio::time::timeout(LOCK_WAIT, lock.lock_owned())
            .await
            .map_err(|_| {
                StoreError::Storage(format!(
                    "lock wait timeout on wallet {}/{}",
                    key.0, key.1
                ))
            })?;
        self.held_rows.insert(key.clone(), guard);
        Ok(())
    }

    /// Current view of a wallet row: staged value if this unit already
    /// touched it, committed value otherwise.
    fn wallet_view(&self, key: &WalletKey) -> Option<WalletBalance> {
        if let Some(staged) = self.staged_wallets.get(key) {
            return Some(staged.clone());
        }
        let tables = self.shared.tables.lock().unwrap();
        tables.wallets.get(key).cloned()
    }

    fn committed_key_exists(&self, key: &str) -> bool {
        let tables = self.shared.tables.lock().unwrap();
        tables.by_key.contains_key(key)
    }
}

#[async_trait]
impl BalanceRepository for InMemoryUnit {
    async fn lock_and_get(
        &mut self,
        account_id: AccountId,
        asset_type: &str,
    ) -> Result<Option<WalletBalance>, StoreError> {
        let key = (account_id, asset_type.to_string());
        self.lock_row(&key).await?;
        Ok(self.wallet_view(&key))
    }

    async fn apply_delta(
        &mut self,
        account_id: AccountId,
        asset_type: &str,
        delta: i64,
    ) -> Result<WalletBalance, StoreError> {
        let key = (account_id, asset_type.to_string());
        self.lock_row(&key).await?;

        let balance = match self.wallet_view(&key) {
            Some(wallet) => wallet.balance + delta,
            None if delta < 0 => {
                return Err(StoreError::WalletNotFound {
                    account_id,
                    asset_type: asset_type.to_string(),
                });
            }
            None => delta,
        };

        let wallet = WalletBalance {
            account_id,
            asset_type: asset_type.to_string(),
            balance,
            updated_at: Utc::now(),
        };
        self.staged_wallets.insert(key, wallet.clone());
        Ok(wallet)
    }
}

#[async_trait]
impl TransactionRepository for InMemoryUnit {
    async fn create_transaction(
        &mut self,
        new: NewTransaction,
    ) -> Result<TransactionRecord, StoreError> {
        if self.staged_transaction.is_some() {
            return Err(StoreError::Storage(
                "unit already carries a transaction".to_string(),
            ));
        }
        if self.committed_key_exists(&new.idempotency_key) {
            return Err(StoreError::Conflict(format!(
                "idempotency key {:?} already used",
                new.idempotency_key
            )));
        }

        // An in-flight reservation blocks this insert until the holder's
        // unit resolves, like a conflicting insert waiting on the winner's
        // transaction.
        let lock = self.shared.key_lock(&new.idempotency_key);
        let guard = tokio::time::timeout(LOCK_WAIT, lock.lock_owned())
            .await
            .map_err(|_| {
                StoreError::Storage(format!(
                    "lock wait timeout on idempotency key {:?}",
                    new.idempotency_key
                ))
            })?;
        if self.committed_key_exists(&new.idempotency_key) {
            return Err(StoreError::Conflict(format!(
                "idempotency key {:?} already used",
                new.idempotency_key
            )));
        }
        self.key_guard = Some(guard);

        let record = TransactionRecord {
            id: new.id,
            idempotency_key: new.idempotency_key,
            kind: new.kind,
            amount: new.amount,
            reference_id: new.reference_id,
            status: new.status,
            metadata: new.metadata,
            created_at: Utc::now(),
        };
        self.staged_transaction = Some(record.clone());
        Ok(record)
    }

    async fn find_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let tables = self.shared.tables.lock().unwrap();
        Ok(tables
            .by_key
            .get(key)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn create_ledger_entry(
        &mut self,
        new: NewLedgerEntry,
    ) -> Result<LedgerEntry, StoreError> {
        let entry = LedgerEntry {
            id: new.id,
            transaction_id: new.transaction_id,
            account_id: new.account_id,
            asset_type: new.asset_type,
            amount: new.amount,
            direction: new.direction,
            balance_after: new.balance_after,
            created_at: Utc::now(),
        };
        self.staged_entries.push(entry.clone());
        Ok(entry)
    }

    async fn mark_completed(&mut self, id: TransactionId) -> Result<(), StoreError> {
        match self.staged_transaction.as_mut() {
            Some(tx) if tx.id == id => {
                tx.status = goldmint_ledger::TransactionStatus::Completed;
                Ok(())
            }
            _ => Err(StoreError::Storage(format!(
                "transaction {id} is not part of this unit"
            ))),
        }
    }
}

#[async_trait]
impl LedgerUnit for InMemoryUnit {
    async fn commit(mut self) -> Result<(), StoreError> {
        let mut tables = self.shared.tables.lock().unwrap();
        for (key, wallet) in self.staged_wallets.drain() {
            tables.wallets.insert(key, wallet);
        }
        if let Some(tx) = self.staged_transaction.take() {
            tables.by_key.insert(tx.idempotency_key.clone(), tx.id);
            tables.transactions.insert(tx.id, tx);
        }
        tables.entries.append(&mut self.staged_entries);
        drop(tables);
        // Row and key guards release when `self` drops.
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.staged_wallets.clear();
        self.staged_transaction = None;
        self.staged_entries.clear();
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Unit = InMemoryUnit;

    async fn begin(&self) -> Result<Self::Unit, StoreError> {
        Ok(InMemoryUnit {
            shared: self.shared.clone(),
            held_rows: HashMap::new(),
            key_guard: None,
            staged_wallets: HashMap::new(),
            staged_transaction: None,
            staged_entries: Vec::new(),
        })
    }

    async fn treasury_account(&self) -> Result<Option<Account>, StoreError> {
        let tables = self.shared.tables.lock().unwrap();
        Ok(tables
            .accounts
            .values()
            .find(|a| a.kind == AccountKind::Treasury)
            .cloned())
    }

    async fn find_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let tables = self.shared.tables.lock().unwrap();
        Ok(tables.transactions.get(&id).cloned())
    }

    async fn find_transaction_by_key(
        &self,
        key: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let tables = self.shared.tables.lock().unwrap();
        Ok(tables
            .by_key
            .get(key)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goldmint_core::EntryId;
    use goldmint_ledger::{Amount, Direction, TransactionStatus, TransactionType};

    const ASSET: &str = "GoldCoins";

    fn new_tx(key: &str) -> NewTransaction {
        NewTransaction {
            id: TransactionId::new(),
            idempotency_key: key.to_string(),
            kind: TransactionType::Topup,
            amount: Amount::from_minor(10).unwrap(),
            reference_id: None,
            status: TransactionStatus::Pending,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn credit_creates_wallet_and_debit_requires_one() {
        let store = InMemoryLedgerStore::new();
        let account = store.create_account("alice", AccountKind::User);

        let mut unit = store.begin().await.unwrap();
        let wallet = unit.apply_delta(account.id, ASSET, 100).await.unwrap();
        assert_eq!(wallet.balance, 100);
        unit.commit().await.unwrap();
        assert_eq!(store.wallet(account.id, ASSET).unwrap().balance, 100);

        let other = store.create_account("bob", AccountKind::User);
        let mut unit = store.begin().await.unwrap();
        let err = unit.apply_delta(other.id, ASSET, -1).await.unwrap_err();
        assert!(matches!(err, StoreError::WalletNotFound { .. }));
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let store = InMemoryLedgerStore::new();
        let account = store.create_account("alice", AccountKind::User);

        let mut unit = store.begin().await.unwrap();
        unit.apply_delta(account.id, ASSET, 50).await.unwrap();
        unit.create_transaction(new_tx("k1")).await.unwrap();
        assert!(store.wallet(account.id, ASSET).is_none());
        assert_eq!(store.transaction_count(), 0);

        unit.rollback().await.unwrap();
        assert!(store.wallet(account.id, ASSET).is_none());
        assert_eq!(store.transaction_count(), 0);
        assert!(store.find_transaction_by_key("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn committed_idempotency_key_conflicts() {
        let store = InMemoryLedgerStore::new();

        let mut unit = store.begin().await.unwrap();
        let tx = unit.create_transaction(new_tx("dup")).await.unwrap();
        unit.mark_completed(tx.id).await.unwrap();
        unit.commit().await.unwrap();

        let mut unit = store.begin().await.unwrap();
        let err = unit.create_transaction(new_tx("dup")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn dropping_a_unit_releases_its_key_reservation() {
        let store = InMemoryLedgerStore::new();

        {
            let mut unit = store.begin().await.unwrap();
            unit.create_transaction(new_tx("k")).await.unwrap();
            // Dropped without commit: the reservation must not outlive it.
        }

        let mut unit = store.begin().await.unwrap();
        assert!(unit.create_transaction(new_tx("k")).await.is_ok());
    }

    #[tokio::test]
    async fn row_lock_blocks_a_second_unit_until_commit() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let account = store.create_account("alice", AccountKind::User);

        let mut first = store.begin().await.unwrap();
        first.apply_delta(account.id, ASSET, 100).await.unwrap();

        let contender = {
            let store = store.clone();
            let account_id = account.id;
            tokio::spawn(async move {
                let mut unit = store.begin().await.unwrap();
                let wallet = unit.lock_and_get(account_id, ASSET).await.unwrap();
                unit.commit().await.unwrap();
                wallet
            })
        };

        // Give the contender a chance to block on the row lock, then commit.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());
        first.commit().await.unwrap();

        let seen = contender.await.unwrap();
        assert_eq!(seen.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn ledger_entries_are_committed_with_the_unit() {
        let store = InMemoryLedgerStore::new();
        let account = store.create_account("alice", AccountKind::User);

        let mut unit = store.begin().await.unwrap();
        let tx = unit.create_transaction(new_tx("k9")).await.unwrap();
        unit.apply_delta(account.id, ASSET, 10).await.unwrap();
        unit.create_ledger_entry(NewLedgerEntry {
            id: EntryId::new(),
            transaction_id: tx.id,
            account_id: account.id,
            asset_type: ASSET.to_string(),
            amount: Amount::from_minor(10).unwrap(),
            direction: Direction::Credit,
            balance_after: 10,
        })
        .await
        .unwrap();
        unit.mark_completed(tx.id).await.unwrap();
        unit.commit().await.unwrap();

        let entries = store.entries_for(tx.id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].balance_after, 10);
        assert_eq!(
            store.find_transaction(tx.id).await.unwrap().unwrap().status,
            TransactionStatus::Completed
        );
    }
}
