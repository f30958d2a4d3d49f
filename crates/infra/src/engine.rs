//! The transaction-processing core.
//!
//! One `process()` call is one atomic unit of work: idempotency lookup,
//! leg resolution, PENDING insert, funds check under the wallet row lock,
//! balance mutation, paired ledger entries, finalization, commit. Any
//! failure rolls the whole unit back; no partial state is ever observable.

use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use goldmint_core::{AccountId, EntryId, TransactionId};
use goldmint_ledger::{
    Direction, TransactionRecord, TransactionRequest, TransactionStatus,
};

use crate::store::{
    BalanceRepository, LedgerStore, LedgerUnit, NewLedgerEntry, NewTransaction, StoreError,
    TransactionRepository,
};

/// Classified engine failure. The HTTP layer maps these to status codes;
/// raw store detail never reaches a caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("insufficient funds: account {account_id} has {available}, requested {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        available: i64,
        requested: i64,
    },

    #[error("wallet not found for account {account_id} (asset {asset_type})")]
    WalletNotFound {
        account_id: AccountId,
        asset_type: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transaction not found")]
    NotFound,

    #[error("storage failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WalletNotFound {
                account_id,
                asset_type,
            } => EngineError::WalletNotFound {
                account_id,
                asset_type,
            },
            other => EngineError::Store(other),
        }
    }
}

/// Result of processing a request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome {
    pub transaction: TransactionRecord,
    /// True when an already-completed transaction was returned for a
    /// retried idempotency key. A replay is a success, not an error.
    pub replayed: bool,
}

enum Processed {
    Fresh(TransactionRecord),
    Replay(TransactionRecord),
}

/// Stateless transaction engine.
///
/// Holds no in-process mutable state; all coordination happens through the
/// store's transactional and locking primitives. Constructed once at
/// startup and passed by reference to request handlers.
#[derive(Debug)]
pub struct LedgerEngine<S: LedgerStore> {
    store: Arc<S>,
    treasury_id: AccountId,
    asset_type: String,
}

impl<S: LedgerStore> LedgerEngine<S> {
    /// Resolve the singleton treasury account once and build the engine.
    ///
    /// A missing treasury is a configuration error: it cannot be fixed by
    /// retrying requests.
    pub async fn resolve(store: Arc<S>, asset_type: impl Into<String>) -> Result<Self, EngineError> {
        let treasury = store
            .treasury_account()
            .await?
            .ok_or_else(|| {
                EngineError::Configuration("no treasury account provisioned".to_string())
            })?;

        Ok(Self {
            store,
            treasury_id: treasury.id,
            asset_type: asset_type.into(),
        })
    }

    pub fn treasury_id(&self) -> AccountId {
        self.treasury_id
    }

    pub fn asset_type(&self) -> &str {
        &self.asset_type
    }

    /// Process one movement request atomically. Safe to retry verbatim:
    /// replays of an already-processed idempotency key return the original
    /// transaction without side effects.
    #[instrument(
        skip(self, request),
        fields(
            kind = %request.kind,
            account_id = %request.account_id,
            amount = %request.amount,
            idempotency_key = %request.idempotency_key,
        )
    )]
    pub async fn process(
        &self,
        request: TransactionRequest,
    ) -> Result<TransactionOutcome, EngineError> {
        if request.idempotency_key.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "idempotency key must not be empty".to_string(),
            ));
        }

        let mut unit = self.store.begin().await?;

        match self.run(&mut unit, &request).await {
            Ok(Processed::Replay(existing)) => {
                // Idempotency hit: abort without side effects.
                unit.rollback().await?;
                tracing::warn!(transaction_id = %existing.id, "transaction already processed");
                Ok(TransactionOutcome {
                    transaction: existing,
                    replayed: true,
                })
            }
            Ok(Processed::Fresh(transaction)) => {
                unit.commit().await?;
                tracing::info!(transaction_id = %transaction.id, "transaction processed");
                Ok(TransactionOutcome {
                    transaction,
                    replayed: false,
                })
            }
            Err(EngineError::Store(StoreError::Conflict(_))) => {
                // Lost the idempotency insert race; the winner's row is
                // authoritative.
                if let Err(e) = unit.rollback().await {
                    tracing::warn!(error = %e, "rollback after idempotency conflict failed");
                }
                self.replay_after_conflict(&request.idempotency_key).await
            }
            Err(err) => {
                if let Err(e) = unit.rollback().await {
                    tracing::warn!(error = %e, "rollback failed");
                }
                tracing::error!(error = %err, "transaction failed");
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        unit: &mut S::Unit,
        request: &TransactionRequest,
    ) -> Result<Processed, EngineError> {
        // 1. Idempotency lookup.
        if let Some(existing) = unit
            .find_by_idempotency_key(&request.idempotency_key)
            .await?
        {
            return Ok(Processed::Replay(existing));
        }

        // 2. Leg resolution: the direction encodes which side the user
        // stands on.
        let legs = request
            .kind
            .resolve_legs(self.treasury_id, request.account_id);

        // 3. Record creation (PENDING until this unit finalizes it).
        let pending = unit
            .create_transaction(NewTransaction {
                id: TransactionId::new(),
                idempotency_key: request.idempotency_key.clone(),
                kind: request.kind,
                amount: request.amount,
                reference_id: request.reference_id.clone(),
                status: TransactionStatus::Pending,
                metadata: request.metadata.clone(),
            })
            .await?;

        // 4. Funds check, user debit leg only. The lock taken here spans
        // the mutation below; the treasury is never floor-checked.
        if legs.debit != self.treasury_id {
            let available = unit
                .lock_and_get(legs.debit, &self.asset_type)
                .await?
                .map(|w| w.balance)
                .unwrap_or(0);
            if available < request.amount.minor() {
                return Err(EngineError::InsufficientFunds {
                    account_id: legs.debit,
                    available,
                    requested: request.amount.minor(),
                });
            }
        }

        // 5. Balance mutation: debit must hit an existing row, credit may
        // lazily create one.
        let debit_wallet = unit
            .apply_delta(legs.debit, &self.asset_type, -request.amount.minor())
            .await?;
        let credit_wallet = unit
            .apply_delta(legs.credit, &self.asset_type, request.amount.minor())
            .await?;

        // 6. Paired entries with post-mutation snapshots.
        unit.create_ledger_entry(NewLedgerEntry {
            id: EntryId::new(),
            transaction_id: pending.id,
            account_id: legs.debit,
            asset_type: self.asset_type.clone(),
            amount: request.amount,
            direction: Direction::Debit,
            balance_after: debit_wallet.balance,
        })
        .await?;
        unit.create_ledger_entry(NewLedgerEntry {
            id: EntryId::new(),
            transaction_id: pending.id,
            account_id: legs.credit,
            asset_type: self.asset_type.clone(),
            amount: request.amount,
            direction: Direction::Credit,
            balance_after: credit_wallet.balance,
        })
        .await?;

        // 7. Finalize.
        unit.mark_completed(pending.id).await?;

        Ok(Processed::Fresh(TransactionRecord {
            status: TransactionStatus::Completed,
            ..pending
        }))
    }

    async fn replay_after_conflict(
        &self,
        idempotency_key: &str,
    ) -> Result<TransactionOutcome, EngineError> {
        match self.store.find_transaction_by_key(idempotency_key).await? {
            Some(existing) => {
                tracing::warn!(transaction_id = %existing.id, "transaction already processed");
                Ok(TransactionOutcome {
                    transaction: existing,
                    replayed: true,
                })
            }
            // The winner rolled back after reserving the key; surface the
            // conflict and let the caller retry.
            None => Err(EngineError::Store(StoreError::Conflict(format!(
                "idempotency key {idempotency_key:?} is contended"
            )))),
        }
    }

    /// Point read. `NotFound` when no such transaction exists.
    pub async fn get_by_id(&self, id: TransactionId) -> Result<TransactionRecord, EngineError> {
        self.store
            .find_transaction(id)
            .await?
            .ok_or(EngineError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLedgerStore;
    use goldmint_ledger::{AccountKind, Amount, TransactionType};
    use proptest::prelude::*;

    const ASSET: &str = "GoldCoins";

    async fn engine_with_user() -> (
        Arc<InMemoryLedgerStore>,
        LedgerEngine<InMemoryLedgerStore>,
        AccountId,
    ) {
        let store = Arc::new(InMemoryLedgerStore::new());
        store.seed(ASSET, "System Treasury");
        let user = store.create_account("alice", AccountKind::User);
        let engine = LedgerEngine::resolve(store.clone(), ASSET).await.unwrap();
        (store, engine, user.id)
    }

    fn request(
        kind: TransactionType,
        account_id: AccountId,
        amount: i64,
        key: &str,
    ) -> TransactionRequest {
        TransactionRequest {
            account_id,
            kind,
            amount: Amount::from_minor(amount).unwrap(),
            idempotency_key: key.to_string(),
            reference_id: Some("ref-1".to_string()),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn missing_treasury_is_a_configuration_error() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let err = LedgerEngine::resolve(store, ASSET).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn bonus_spend_topup_flow_tracks_balances() {
        let (store, engine, user) = engine_with_user().await;

        let bonus = engine
            .process(request(TransactionType::Bonus, user, 100, "K1"))
            .await
            .unwrap();
        assert!(!bonus.replayed);
        assert_eq!(bonus.transaction.status, TransactionStatus::Completed);
        assert_eq!(store.wallet(user, ASSET).unwrap().balance, 100);

        engine
            .process(request(TransactionType::Spend, user, 50, "K2"))
            .await
            .unwrap();
        assert_eq!(store.wallet(user, ASSET).unwrap().balance, 50);

        engine
            .process(request(TransactionType::Topup, user, 200, "K3"))
            .await
            .unwrap();
        assert_eq!(store.wallet(user, ASSET).unwrap().balance, 250);

        // The treasury absorbed the opposite side of every movement.
        let treasury = store.wallet(engine.treasury_id(), ASSET).unwrap();
        assert_eq!(treasury.balance, -250);
    }

    #[tokio::test]
    async fn overdraft_is_rejected_without_a_trace() {
        let (store, engine, user) = engine_with_user().await;

        engine
            .process(request(TransactionType::Topup, user, 250, "K3"))
            .await
            .unwrap();

        let err = engine
            .process(request(TransactionType::Spend, user, 1000, "K4"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFunds {
                available: 250,
                requested: 1000,
                ..
            }
        ));

        // Nothing from the failed unit is observable.
        assert_eq!(store.wallet(user, ASSET).unwrap().balance, 250);
        assert!(store.find_transaction_by_key("K4").await.unwrap().is_none());
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn spend_from_an_unfunded_wallet_is_insufficient_funds() {
        let (store, engine, user) = engine_with_user().await;

        let err = engine
            .process(request(TransactionType::Spend, user, 1, "K0"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFunds { available: 0, .. }
        ));
        assert!(store.wallet(user, ASSET).is_none());
    }

    #[tokio::test]
    async fn replay_returns_the_original_transaction_without_side_effects() {
        let (store, engine, user) = engine_with_user().await;

        let first = engine
            .process(request(TransactionType::Bonus, user, 100, "K1"))
            .await
            .unwrap();

        let replay = engine
            .process(request(TransactionType::Bonus, user, 100, "K1"))
            .await
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.transaction.id, first.transaction.id);
        assert_eq!(store.wallet(user, ASSET).unwrap().balance, 100);
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(store.entries_for(first.transaction.id).len(), 2);
    }

    #[tokio::test]
    async fn every_transaction_writes_a_zero_sum_entry_pair() {
        let (store, engine, user) = engine_with_user().await;

        let outcome = engine
            .process(request(TransactionType::Bonus, user, 100, "K1"))
            .await
            .unwrap();

        let entries = store.entries_for(outcome.transaction.id);
        assert_eq!(entries.len(), 2);

        let debit = entries
            .iter()
            .find(|e| e.direction == Direction::Debit)
            .unwrap();
        let credit = entries
            .iter()
            .find(|e| e.direction == Direction::Credit)
            .unwrap();
        assert_eq!(debit.amount, credit.amount);
        assert_ne!(debit.account_id, credit.account_id);
        assert_eq!(debit.account_id, engine.treasury_id());
        assert_eq!(credit.account_id, user);
        assert_eq!(debit.balance_after, -100);
        assert_eq!(credit.balance_after, 100);
    }

    #[tokio::test]
    async fn debit_of_a_missing_treasury_wallet_rolls_everything_back() {
        // Treasury provisioned without a wallet row: the debit leg has
        // nothing to update and the whole unit must vanish.
        let store = Arc::new(InMemoryLedgerStore::new());
        store.create_account("System Treasury", AccountKind::Treasury);
        let user = store.create_account("alice", AccountKind::User);
        let engine = LedgerEngine::resolve(store.clone(), ASSET).await.unwrap();

        let err = engine
            .process(request(TransactionType::Topup, user.id, 10, "K1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WalletNotFound { .. }));
        assert!(store.wallet(user.id, ASSET).is_none());
        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn empty_idempotency_key_is_rejected() {
        let (_store, engine, user) = engine_with_user().await;

        let err = engine
            .process(request(TransactionType::Topup, user, 10, "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn get_by_id_reports_not_found() {
        let (_store, engine, user) = engine_with_user().await;

        let outcome = engine
            .process(request(TransactionType::Topup, user, 10, "K1"))
            .await
            .unwrap();
        let fetched = engine.get_by_id(outcome.transaction.id).await.unwrap();
        assert_eq!(fetched.id, outcome.transaction.id);

        let err = engine.get_by_id(TransactionId::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_spends_never_overdraw() {
        let (store, engine, user) = engine_with_user().await;
        let engine = Arc::new(engine);

        engine
            .process(request(TransactionType::Topup, user, 50, "seed"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .process(request(TransactionType::Spend, user, 10, &format!("spend-{i}")))
                    .await
            }));
        }

        let mut successes = 0;
        let mut rejections = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(EngineError::InsufficientFunds { .. }) => rejections += 1,
                Err(other) => panic!("unexpected failure: {other}"),
            }
        }

        assert_eq!(successes, 5);
        assert_eq!(rejections, 5);
        assert_eq!(store.wallet(user, ASSET).unwrap().balance, 0);
        // 1 topup + 5 spends committed.
        assert_eq!(store.transaction_count(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_retries_of_one_key_produce_one_transaction() {
        let (store, engine, user) = engine_with_user().await;
        let engine = Arc::new(engine);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .process(request(TransactionType::Bonus, user, 100, "same-key"))
                    .await
                    .unwrap()
            }));
        }

        let mut ids = Vec::new();
        let mut replays = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            ids.push(outcome.transaction.id);
            if outcome.replayed {
                replays += 1;
            }
        }

        assert_eq!(ids.iter().collect::<std::collections::HashSet<_>>().len(), 1);
        assert_eq!(replays, 3);
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(store.wallet(user, ASSET).unwrap().balance, 100);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Balance conservation: after any sequence of operations, the user
        /// balance equals the sum of its CREDIT entries minus its DEBIT
        /// entries, and never goes negative.
        #[test]
        fn balances_equal_the_sum_of_their_entries(
            ops in prop::collection::vec((0u8..3, 1i64..100), 1..20)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let (store, engine, user) = engine_with_user().await;

                for (i, (kind_idx, amount)) in ops.iter().enumerate() {
                    let kind = [
                        TransactionType::Topup,
                        TransactionType::Bonus,
                        TransactionType::Spend,
                    ][*kind_idx as usize];
                    // Overdrafts are expected rejections, everything else
                    // must succeed.
                    match engine
                        .process(request(kind, user, *amount, &format!("op-{i}")))
                        .await
                    {
                        Ok(_) => {}
                        Err(EngineError::InsufficientFunds { .. }) => {}
                        Err(other) => panic!("unexpected failure: {other}"),
                    }
                }

                let balance = store.wallet(user, ASSET).map(|w| w.balance).unwrap_or(0);
                assert!(balance >= 0);

                let mut from_entries = 0i64;
                for id in store.transaction_ids() {
                    for entry in store.entries_for(id) {
                        if entry.account_id == user {
                            match entry.direction {
                                Direction::Credit => from_entries += entry.amount.minor(),
                                Direction::Debit => from_entries -= entry.amount.minor(),
                            }
                        }
                    }
                }
                assert_eq!(balance, from_entries);
            });
        }
    }
}
