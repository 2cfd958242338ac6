// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Fiat gateway webhook intake.
//!
//! The gateway signs every delivery with HMAC-SHA256 over the raw body,
//! hex-encoded in `X-Webhook-Signature`. Verification happens before the
//! body is even parsed; a bad signature is a 401 and leaves no trace in
//! the ledger.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::warn;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::merchants::ResolveError;
use crate::normalize;
use crate::reconcile::ReconcileError;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Signature header set by the fiat gateway.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub status: String,
    pub reference: String,
}

/// Verify the gateway signature with a constant-time comparison.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = alloy::hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Webhook intake handler.
///
/// Replays are expected and harmless: the same reference reconciles into
/// the same ledger record, so the gateway may retry as often as it likes.
#[utoipa::path(
    post,
    path = "/v1/webhooks/payments",
    tag = "Webhooks",
    request_body(
        content = serde_json::Value,
        description = "Signed gateway payload; raw bytes are verified before parsing"
    ),
    responses(
        (status = 200, description = "Event reconciled", body = WebhookAck),
        (status = 401, description = "Missing or invalid signature"),
        (status = 404, description = "Merchant not found"),
        (status = 422, description = "Payload cannot be normalized")
    )
)]
pub async fn receive_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing webhook signature"))?;

    if !verify_signature(&state.webhook_secret, &body, signature) {
        warn!("webhook signature verification failed");
        return Err(ApiError::unauthorized("invalid webhook signature"));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid JSON payload: {e}")))?;

    let event = normalize::normalize_webhook(&payload)
        .map_err(|e| ApiError::unprocessable(e.to_string()))?;

    let tx = state.coordinator.reconcile(&event).map_err(|e| match e {
        ReconcileError::Resolve(ResolveError::NotFound(who)) => {
            ApiError::not_found(format!("merchant not found: {who}"))
        }
        ReconcileError::Resolve(resolve) => ApiError::unprocessable(resolve.to_string()),
        ReconcileError::Ledger(ledger) => ApiError::internal(ledger.to_string()),
    })?;

    Ok((
        StatusCode::OK,
        Json(WebhookAck {
            status: "reconciled".to_string(),
            reference: tx.reference,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        alloy::hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"data":{"tx_ref":"FLW-1"}}"#;
        let signature = sign("topsecret", body);
        assert!(verify_signature("topsecret", body, &signature));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let signature = sign("topsecret", b"original");
        assert!(!verify_signature("topsecret", b"tampered", &signature));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = b"payload";
        let signature = sign("topsecret", body);
        assert!(!verify_signature("othersecret", body, &signature));
    }

    #[test]
    fn garbage_signature_fails_verification() {
        assert!(!verify_signature("topsecret", b"payload", "not-hex"));
        assert!(!verify_signature("topsecret", b"payload", ""));
    }
}
