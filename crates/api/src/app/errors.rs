use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use goldmint_infra::{EngineError, StoreError};

/// Map a classified engine failure to a response.
///
/// Raw store detail is logged here and never returned to the caller.
pub fn engine_error_to_response(err: EngineError) -> axum::response::Response {
    match err {
        EngineError::InvalidRequest(msg) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_request", msg)
        }
        EngineError::InsufficientFunds { .. } => json_error(
            StatusCode::BAD_REQUEST,
            "insufficient_funds",
            "insufficient funds",
        ),
        EngineError::WalletNotFound { .. } => {
            tracing::error!(error = %err, "debit leg wallet missing");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "wallet_not_found",
                "wallet not found",
            )
        }
        EngineError::Configuration(msg) => {
            tracing::error!(error = %msg, "ledger misconfigured");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                "ledger misconfigured",
            )
        }
        EngineError::NotFound => {
            json_error(StatusCode::NOT_FOUND, "not_found", "transaction not found")
        }
        EngineError::Store(StoreError::Conflict(_)) => json_error(
            StatusCode::CONFLICT,
            "conflict",
            "request is already being processed; retry",
        ),
        EngineError::Store(e) => {
            tracing::error!(error = %e, "transaction processing failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "transaction processing failed",
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
