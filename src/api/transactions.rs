// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ledger read endpoints and the operator settlement retry.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::error::ApiError;
use crate::ledger::{Transaction, TxStatus};
use crate::settlement::SettlementJob;
use crate::state::AppState;

/// Default page size for listings.
const DEFAULT_LIMIT: usize = 50;

/// Hard cap on page size.
const MAX_LIMIT: usize = 200;

#[derive(Debug, Deserialize, IntoParams)]
pub struct PageQuery {
    /// Opaque cursor from a previous page.
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RangeQuery {
    /// Inclusive start of the event-time window (RFC 3339).
    pub from: DateTime<Utc>,
    /// Inclusive end of the event-time window (RFC 3339).
    pub to: DateTime<Utc>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RetryAck {
    pub status: String,
    pub reference: String,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Fetch one ledger record.
#[utoipa::path(
    get,
    path = "/v1/transactions/{merchant_id}/{reference}",
    tag = "Transactions",
    params(
        ("merchant_id" = String, Path, description = "Owning merchant"),
        ("reference" = String, Path, description = "Transaction reference")
    ),
    responses(
        (status = 200, description = "Ledger record", body = Transaction),
        (status = 404, description = "No such record")
    )
)]
pub async fn get_transaction(
    State(state): State<AppState>,
    Path((merchant_id, reference)): Path<(String, String)>,
) -> Result<Json<Transaction>, ApiError> {
    let tx = state
        .ledger
        .get(&merchant_id, &reference)
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("no transaction {merchant_id}/{reference}")))?;
    Ok(Json(tx))
}

/// Paginated listing for a merchant wallet, newest first.
#[utoipa::path(
    get,
    path = "/v1/wallets/{wallet}/transactions",
    tag = "Transactions",
    params(
        ("wallet" = String, Path, description = "Merchant wallet address"),
        PageQuery
    ),
    responses(
        (status = 200, description = "Page of ledger records", body = TransactionPage)
    )
)]
pub async fn list_wallet_transactions(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<TransactionPage>, ApiError> {
    let (transactions, next_cursor) = state
        .ledger
        .list_by_wallet(&wallet, query.cursor.as_deref(), clamp_limit(query.limit))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(TransactionPage {
        transactions,
        next_cursor,
    }))
}

/// Listing by event-time window, oldest first.
#[utoipa::path(
    get,
    path = "/v1/transactions",
    tag = "Transactions",
    params(RangeQuery),
    responses(
        (status = 200, description = "Ledger records in the window", body = [Transaction]),
        (status = 400, description = "Invalid window")
    )
)]
pub async fn list_transactions_by_range(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    if query.from > query.to {
        return Err(ApiError::bad_request("window start is after window end"));
    }
    let transactions = state
        .ledger
        .list_by_range(query.from, query.to, clamp_limit(query.limit))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(transactions))
}

/// Operator retry: re-queue a record for settlement.
///
/// `Failed` records are the normal target; a stuck `Processing` record is
/// reclaimed by the worker since the job allows it. A `Settled` record is
/// acknowledged without queuing anything.
#[utoipa::path(
    post,
    path = "/v1/transactions/{merchant_id}/{reference}/settle",
    tag = "Transactions",
    params(
        ("merchant_id" = String, Path, description = "Owning merchant"),
        ("reference" = String, Path, description = "Transaction reference")
    ),
    responses(
        (status = 200, description = "Already settled", body = RetryAck),
        (status = 202, description = "Settlement queued", body = RetryAck),
        (status = 404, description = "No such record"),
        (status = 503, description = "Settlement queue is full")
    )
)]
pub async fn retry_settlement(
    State(state): State<AppState>,
    Path((merchant_id, reference)): Path<(String, String)>,
) -> Result<(StatusCode, Json<RetryAck>), ApiError> {
    let tx = state
        .ledger
        .get(&merchant_id, &reference)
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("no transaction {merchant_id}/{reference}")))?;

    if tx.status == TxStatus::Settled {
        return Ok((
            StatusCode::OK,
            Json(RetryAck {
                status: "settled".to_string(),
                reference,
            }),
        ));
    }

    state
        .queue
        .submit(SettlementJob {
            merchant_id,
            reference: reference.clone(),
            reclaim_stale: true,
        })
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RetryAck {
            status: "queued".to_string(),
            reference,
        }),
    ))
}
