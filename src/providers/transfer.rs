// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Fiat transfer gateway client (bank payouts).
//!
//! One call matters here: `POST /transfers`, submitting an idempotent
//! payout. The gateway deduplicates on the `reference` field, so retrying
//! a transfer with the same reference can never pay a merchant twice.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::{env_required, TRANSFER_API_BASE_URL_ENV, TRANSFER_API_KEY_ENV};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer gateway configuration missing: {0}")]
    MissingConfig(String),

    #[error("transfer request failed: {0}")]
    Request(String),

    #[error("transfer gateway returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid transfer response: {0}")]
    InvalidResponse(String),
}

/// Bank payout submission.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    pub account_bank: String,
    pub account_number: String,
    pub amount: Decimal,
    pub currency: String,
    pub narration: String,
    /// Idempotency key at the gateway.
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beneficiary_name: Option<String>,
}

/// Accepted payout, as reported by the gateway.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    /// Gateway-side transfer id.
    pub provider_reference: String,
    /// Gateway-side status ("NEW", "PENDING", ...).
    pub status: String,
    /// Full response body, stored on the settlement record.
    pub raw: Value,
}

/// Seam for the bank payout channel; tests inject fakes.
#[async_trait]
pub trait FiatTransferApi: Send + Sync {
    async fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, TransferError>;
}

/// Stand-in used when the fiat rail is not configured.
///
/// Every dispatch through it records a settlement failure instead of
/// blocking startup of the other rail.
pub struct DisabledTransfers;

#[async_trait]
impl FiatTransferApi for DisabledTransfers {
    async fn create_transfer(
        &self,
        _request: &TransferRequest,
    ) -> Result<TransferReceipt, TransferError> {
        Err(TransferError::MissingConfig(
            "fiat transfer gateway is not configured".to_string(),
        ))
    }
}

/// HTTP client for the transfer gateway.
pub struct HttpTransferClient {
    base_url: String,
    api_key: String,
    http: Client,
}

impl HttpTransferClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self, TransferError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransferError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
        })
    }

    pub fn from_env() -> Result<Self, TransferError> {
        let base_url = env_required(TRANSFER_API_BASE_URL_ENV)
            .map_err(|e| TransferError::MissingConfig(e.to_string()))?;
        let api_key = env_required(TRANSFER_API_KEY_ENV)
            .map_err(|e| TransferError::MissingConfig(e.to_string()))?;
        Self::new(base_url, api_key)
    }
}

#[async_trait]
impl FiatTransferApi for HttpTransferClient {
    async fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, TransferError> {
        let response = self
            .http
            .post(format!("{}/transfers", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| TransferError::Request(format!("POST /transfers failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Api { status, body });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TransferError::InvalidResponse(format!("invalid JSON: {e}")))?;

        let receipt = parse_transfer_response(body)?;
        info!(
            reference = %request.reference,
            provider_reference = %receipt.provider_reference,
            status = %receipt.status,
            "transfer accepted by gateway"
        );
        Ok(receipt)
    }
}

/// Extract the transfer id and status from a gateway response body.
fn parse_transfer_response(body: Value) -> Result<TransferReceipt, TransferError> {
    let data = body.get("data").unwrap_or(&body);

    let provider_reference = match data.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(TransferError::InvalidResponse(
                "missing transfer id in response".to_string(),
            ))
        }
    };

    let status = data
        .get("status")
        .or_else(|| body.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("pending")
        .to_string();

    Ok(TransferReceipt {
        provider_reference,
        status,
        raw: body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn request_serializes_without_null_beneficiary() {
        let request = TransferRequest {
            account_bank: "044".to_string(),
            account_number: "0690000040".to_string(),
            amount: dec!(7500),
            currency: "NGN".to_string(),
            narration: "Settlement KP-1".to_string(),
            reference: "PAYOUT-KP-1-1700000000".to_string(),
            beneficiary_name: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["account_bank"], "044");
        // rust_decimal serializes as a string; the gateway accepts both.
        assert_eq!(json["amount"], "7500");
        assert!(json.get("beneficiary_name").is_none());
    }

    #[test]
    fn parses_numeric_transfer_id() {
        let receipt = parse_transfer_response(json!({
            "status": "success",
            "data": { "id": 98765, "status": "NEW" }
        }))
        .unwrap();
        assert_eq!(receipt.provider_reference, "98765");
        assert_eq!(receipt.status, "NEW");
    }

    #[test]
    fn parses_string_id_and_falls_back_to_top_level_status() {
        let receipt = parse_transfer_response(json!({
            "status": "success",
            "data": { "id": "tr_abc" }
        }))
        .unwrap();
        assert_eq!(receipt.provider_reference, "tr_abc");
        assert_eq!(receipt.status, "success");
    }

    #[test]
    fn missing_id_is_invalid() {
        let err = parse_transfer_response(json!({ "data": {} })).unwrap_err();
        assert!(matches!(err, TransferError::InvalidResponse(_)));
    }
}
