//! Ledger record types and leg resolution.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use goldmint_core::{AccountId, DomainError, EntryId, TransactionId};

use crate::amount::Amount;

/// Account kind: exactly one `Treasury` account exists system-wide and is
/// the counterparty for every user-facing movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountKind {
    User,
    Treasury,
}

/// A provisioned account. Immutable as far as the ledger core is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub kind: AccountKind,
    pub created_at: DateTime<Utc>,
}

/// Per-account, per-asset balance row.
///
/// Created lazily on first credit; a debit never materializes one. User
/// balances never go below zero (the engine rejects the debit instead);
/// the treasury balance is unbounded and may be negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    pub account_id: AccountId,
    pub asset_type: String,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

/// Movement kind. Determines which side of the double entry the user
/// account stands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Topup,
    Bonus,
    Spend,
}

impl TransactionType {
    /// Resolve the debit/credit legs for this movement.
    ///
    /// `TOPUP`/`BONUS` are treasury-originated credits to the user account;
    /// `SPEND` debits the user account back into the treasury.
    pub fn resolve_legs(self, treasury: AccountId, account: AccountId) -> TransactionLegs {
        match self {
            TransactionType::Topup | TransactionType::Bonus => TransactionLegs {
                debit: treasury,
                credit: account,
            },
            TransactionType::Spend => TransactionLegs {
                debit: account,
                credit: treasury,
            },
        }
    }
}

/// The two accounts a transaction moves value between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionLegs {
    pub debit: AccountId,
    pub credit: AccountId,
}

/// Transaction lifecycle status.
///
/// `Pending` exists only inside the atomic unit that creates the record; a
/// durably observable transaction is always `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
}

/// A recorded value movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub idempotency_key: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: Amount,
    pub reference_id: Option<String>,
    pub status: TransactionStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Entry direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Debit,
    Credit,
}

/// One leg of a transaction's double entry. Immutable once written.
///
/// `balance_after` snapshots the affected wallet immediately after this
/// entry's mutation; it is written atomically with the mutation and never
/// recomputed later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: EntryId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub asset_type: String,
    pub amount: Amount,
    pub direction: Direction,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

/// A validated request to move value, handed to the engine by the HTTP layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    pub account_id: AccountId,
    pub kind: TransactionType,
    pub amount: Amount,
    pub idempotency_key: String,
    pub reference_id: Option<String>,
    pub metadata: serde_json::Value,
}

macro_rules! impl_token_enum {
    ($t:ty, $( $variant:path => $token:literal ),+ $(,)?) => {
        impl $t {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $variant => $token, )+
                }
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $token => Ok($variant), )+
                    other => Err(DomainError::validation(format!(
                        concat!("unknown ", stringify!($t), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

impl_token_enum!(AccountKind, AccountKind::User => "USER", AccountKind::Treasury => "TREASURY");
impl_token_enum!(
    TransactionType,
    TransactionType::Topup => "TOPUP",
    TransactionType::Bonus => "BONUS",
    TransactionType::Spend => "SPEND",
);
impl_token_enum!(
    TransactionStatus,
    TransactionStatus::Pending => "PENDING",
    TransactionStatus::Completed => "COMPLETED",
);
impl_token_enum!(Direction, Direction::Debit => "DEBIT", Direction::Credit => "CREDIT");
