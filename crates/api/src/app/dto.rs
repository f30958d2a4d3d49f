//! Request/response DTOs and mapping to/from domain types.

use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use uuid::Uuid;

use goldmint_core::AccountId;
use goldmint_infra::TransactionOutcome;
use goldmint_ledger::{Amount, TransactionRecord, TransactionRequest, TransactionType};

use super::errors;

/// Body of a movement request; the transaction type is implied by the path.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionBody {
    pub account_id: String,
    pub amount: serde_json::Value,
    #[serde(default)]
    pub reference_id: Option<String>,
}

/// Map a request body + headers into a validated engine request.
///
/// The idempotency key comes from the `Idempotency-Key` header and defaults
/// to a fresh token when absent, so a one-shot caller still gets a usable
/// key in the response.
pub fn to_request(
    kind: TransactionType,
    headers: &HeaderMap,
    body: TransactionBody,
) -> Result<TransactionRequest, axum::response::Response> {
    let account_id: AccountId = body.account_id.parse().map_err(|e| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("accountId: {e}"),
        )
    })?;

    let amount = Amount::from_json(&body.amount).map_err(|e| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_request", e.to_string())
    })?;

    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    Ok(TransactionRequest {
        account_id,
        kind,
        amount,
        idempotency_key,
        reference_id: body.reference_id,
        metadata: serde_json::json!({}),
    })
}

pub fn transaction_to_json(tx: &TransactionRecord) -> serde_json::Value {
    serde_json::to_value(tx).unwrap_or_else(|_| serde_json::json!({}))
}

pub fn outcome_to_json(outcome: &TransactionOutcome) -> serde_json::Value {
    let mut json = transaction_to_json(&outcome.transaction);
    if let serde_json::Value::Object(map) = &mut json {
        map.insert(
            "replayed".to_string(),
            serde_json::Value::Bool(outcome.replayed),
        );
    }
    json
}
