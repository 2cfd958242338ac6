// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{get, post},
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;

use crate::{
    ledger::{ChainContext, PaymentMethod, SettlementRecord, SettlementStatus, Transaction, TxStatus},
    merchants::{Merchant, PayoutPreferences},
    normalize::SourceKind,
    state::AppState,
};

pub mod health;
pub mod transactions;
pub mod webhook;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/webhooks/payments", post(webhook::receive_payment_webhook))
        .route("/transactions", get(transactions::list_transactions_by_range))
        .route(
            "/transactions/{merchant_id}/{reference}",
            get(transactions::get_transaction),
        )
        .route(
            "/transactions/{merchant_id}/{reference}/settle",
            post(transactions::retry_settlement),
        )
        .route(
            "/wallets/{wallet}/transactions",
            get(transactions::list_wallet_transactions),
        );

    Router::new()
        .nest("/v1", v1_routes)
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/api-doc/openapi.json", get(openapi_spec))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CorsLayer::permissive()),
        )
}

async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        webhook::receive_payment_webhook,
        transactions::get_transaction,
        transactions::list_transactions_by_range,
        transactions::list_wallet_transactions,
        transactions::retry_settlement,
        health::health,
        health::liveness,
        health::readiness
    ),
    components(
        schemas(
            Transaction,
            TxStatus,
            PaymentMethod,
            ChainContext,
            SettlementRecord,
            SettlementStatus,
            SourceKind,
            Merchant,
            PayoutPreferences,
            webhook::WebhookAck,
            transactions::TransactionPage,
            transactions::RetryAck,
            health::HealthResponse,
            health::ReadyResponse,
            health::HealthChecks
        )
    ),
    tags(
        (name = "Webhooks", description = "Fiat gateway event intake"),
        (name = "Transactions", description = "Ledger reads and settlement retries"),
        (name = "Health", description = "Service health probes")
    )
)]
struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ledger::LedgerStore;
    use crate::merchants::{MerchantDirectory, MerchantResolver};
    use crate::reconcile::ReconcileCoordinator;
    use crate::settlement::SettlementQueue;

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(LedgerStore::open(&dir.path().join("ledger.redb")).unwrap());
        let directory =
            Arc::new(MerchantDirectory::open(&dir.path().join("merchants.redb")).unwrap());
        let resolver = Arc::new(MerchantResolver::new(directory));
        let (queue, _rx) = SettlementQueue::bounded(8);
        let coordinator = Arc::new(ReconcileCoordinator::new(
            ledger.clone(),
            resolver,
            queue.clone(),
        ));
        let state = AppState::new(ledger, coordinator, queue, "secret".to_string());

        let app = router(state);
        // Ensure the router can be converted into a service without panicking.
        let _ = app.into_make_service();
    }

    #[test]
    fn openapi_document_lists_every_path() {
        let doc = ApiDoc::openapi();
        for path in [
            "/v1/webhooks/payments",
            "/v1/transactions",
            "/v1/transactions/{merchant_id}/{reference}",
            "/v1/transactions/{merchant_id}/{reference}/settle",
            "/v1/wallets/{wallet}/transactions",
            "/health",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing path {path}");
        }
    }

    #[test]
    fn webhook_path_declares_a_request_body() {
        let doc = ApiDoc::openapi();
        let webhook = doc
            .paths
            .paths
            .get("/v1/webhooks/payments")
            .expect("webhook path documented");
        let post = webhook.post.as_ref().expect("webhook POST documented");
        assert!(post.request_body.is_some());
    }
}
