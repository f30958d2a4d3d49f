//! Ledger domain model (double-entry wallet movements).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod amount;
pub mod model;

pub use amount::Amount;
pub use model::{
    Account, AccountKind, Direction, LedgerEntry, TransactionLegs, TransactionRecord,
    TransactionRequest, TransactionStatus, TransactionType, WalletBalance,
};
