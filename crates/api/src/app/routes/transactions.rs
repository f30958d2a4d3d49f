use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};

use goldmint_core::TransactionId;
use goldmint_ledger::TransactionType;

use crate::app::{AppServices, dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/topup", post(topup))
        .route("/bonus", post(bonus))
        .route("/spend", post(spend))
        .route("/:id", get(get_transaction))
}

async fn topup(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Json(body): Json<dto::TransactionBody>,
) -> axum::response::Response {
    submit(services, TransactionType::Topup, headers, body).await
}

async fn bonus(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Json(body): Json<dto::TransactionBody>,
) -> axum::response::Response {
    submit(services, TransactionType::Bonus, headers, body).await
}

async fn spend(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Json(body): Json<dto::TransactionBody>,
) -> axum::response::Response {
    submit(services, TransactionType::Spend, headers, body).await
}

async fn submit(
    services: Arc<AppServices>,
    kind: TransactionType,
    headers: HeaderMap,
    body: dto::TransactionBody,
) -> axum::response::Response {
    let request = match dto::to_request(kind, &headers, body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match services.process(request).await {
        Ok(outcome) => {
            // A replay is a success that caused no new side effect.
            let status = if outcome.replayed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(dto::outcome_to_json(&outcome))).into_response()
        }
        Err(err) => errors::engine_error_to_response(err),
    }
}

async fn get_transaction(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: TransactionId = match id.parse() {
        Ok(id) => id,
        Err(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_id",
                "invalid transaction id",
            );
        }
    };

    match services.get_transaction(id).await {
        Ok(tx) => (StatusCode::OK, Json(dto::transaction_to_json(&tx))).into_response(),
        Err(err) => errors::engine_error_to_response(err),
    }
}
