//! Storage implementations and the transaction-processing engine.

pub mod engine;
pub mod store;

pub use engine::{EngineError, LedgerEngine, TransactionOutcome};
pub use store::{
    BalanceRepository, InMemoryLedgerStore, LedgerStore, LedgerUnit, NewLedgerEntry,
    NewTransaction, PostgresLedgerStore, StoreError, TransactionRepository,
};
