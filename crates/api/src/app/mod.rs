//! App wiring: services, router, health.

pub mod dto;
pub mod errors;
pub mod routes;

use std::sync::Arc;

use axum::{Extension, Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use chrono::Utc;

use goldmint_core::TransactionId;
use goldmint_infra::{
    EngineError, InMemoryLedgerStore, LedgerEngine, PostgresLedgerStore, TransactionOutcome,
};
use goldmint_ledger::{TransactionRecord, TransactionRequest};

const DEFAULT_ASSET: &str = "GoldCoins";

/// Services shared by all request handlers.
///
/// Constructed once at startup and injected by reference into handlers; no
/// process-wide singletons, no in-process mutable state.
pub enum AppServices {
    InMemory {
        engine: LedgerEngine<InMemoryLedgerStore>,
    },
    Postgres {
        engine: LedgerEngine<PostgresLedgerStore>,
    },
}

impl AppServices {
    pub async fn process(
        &self,
        request: TransactionRequest,
    ) -> Result<TransactionOutcome, EngineError> {
        match self {
            AppServices::InMemory { engine } => engine.process(request).await,
            AppServices::Postgres { engine } => engine.process(request).await,
        }
    }

    pub async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<TransactionRecord, EngineError> {
        match self {
            AppServices::InMemory { engine } => engine.get_by_id(id).await,
            AppServices::Postgres { engine } => engine.get_by_id(id).await,
        }
    }
}

/// Build the application router, wiring services from the environment:
/// `USE_PERSISTENT_STORES=true` selects Postgres (`DATABASE_URL` required),
/// anything else the in-memory store (dev/test).
pub async fn build_app() -> Router {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);
    let asset_type =
        std::env::var("GOLDMINT_ASSET").unwrap_or_else(|_| DEFAULT_ASSET.to_string());

    let services = if use_persistent {
        build_postgres_services(&asset_type).await
    } else {
        build_in_memory_services(&asset_type).await
    };

    build_router(Arc::new(services))
}

pub fn build_router(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/transactions", routes::transactions::router())
        .layer(Extension(services))
}

async fn build_in_memory_services(asset_type: &str) -> AppServices {
    let store = Arc::new(InMemoryLedgerStore::new());
    let treasury = store.seed(asset_type, "System Treasury");
    tracing::info!(treasury_id = %treasury.id, "seeded in-memory treasury account");

    let engine = LedgerEngine::resolve(store, asset_type)
        .await
        .expect("in-memory treasury was just seeded");
    AppServices::InMemory { engine }
}

async fn build_postgres_services(asset_type: &str) -> AppServices {
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");

    let store = PostgresLedgerStore::connect(&database_url)
        .await
        .expect("failed to connect to Postgres");
    store.migrate().await.expect("failed to apply ledger schema");
    let treasury = store
        .seed(asset_type, "System Treasury")
        .await
        .expect("failed to seed treasury account");
    tracing::info!(treasury_id = %treasury.id, "treasury account ready");

    let engine = LedgerEngine::resolve(Arc::new(store), asset_type)
        .await
        .expect("treasury resolution failed");
    AppServices::Postgres { engine }
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "UP", "timestamp": Utc::now() })),
    )
}
