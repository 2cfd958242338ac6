// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Event Normalizer
//!
//! Maps raw producer payloads — fiat gateway webhooks and decoded payment
//! gateway contract logs — into one canonical [`NormalizedEvent`] shape that
//! the reconciliation coordinator understands.
//!
//! Both producers deliver at-least-once and out of order; the normalizer is
//! pure and stateless, so re-delivery produces an identical event. Amounts
//! from the chain arrive as fixed-point integers and are converted with
//! scaled-integer math only (see [`crate::units`]).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::ledger::transaction::{ChainContext, PaymentMethod};
use crate::units;

/// Provider label stored on records produced by the contract listener.
pub const CONTRACT_PROVIDER: &str = "contract";

/// Provider label stored on records produced by the fiat gateway webhook.
pub const GATEWAY_PROVIDER: &str = "flutterwave";

/// Symbols treated as crypto when `payment_type` gives no signal.
const CRYPTO_SYMBOLS: [&str; 6] = ["USDT", "USDC", "BTC", "ETH", "WETH", "WBTC"];

/// Which producer a transaction originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Fiat,
    Crypto,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("no transaction reference in payload (tried tx_ref, txRef, reference)")]
    MissingReference,

    #[error("missing or malformed amount: {0}")]
    InvalidAmount(String),

    #[error("invalid base-unit amount: {0}")]
    Units(#[from] units::UnitError),
}

/// Canonical event shape handed to the reconciliation coordinator.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    /// Merchant id carried by the event (fiat webhooks).
    pub merchant_id: Option<String>,
    /// Merchant wallet carried by the event (chain logs), lower-cased.
    pub merchant_wallet: Option<String>,
    /// Idempotency key.
    pub reference: String,
    /// Payer identifier; chain payers are lower-cased.
    pub payer: Option<String>,
    pub source: SourceKind,
    pub payment_type: Option<String>,
    /// Amount in natural units (major fiat units / human token units).
    pub amount: Decimal,
    /// Original base-unit string, preserved for audit.
    pub amount_raw: Option<String>,
    pub fiat_equivalent: Option<Decimal>,
    pub fiat_currency: Option<String>,
    pub charge_fee: Decimal,
    /// Token symbol or fiat code of `amount`.
    pub currency: String,
    pub method: PaymentMethod,
    pub provider: String,
    /// Raw status string reported by the source.
    pub source_status: Option<String>,
    pub event_timestamp: DateTime<Utc>,
    pub chain: Option<ChainContext>,
    /// Raw upstream payload, retained for dispute resolution.
    pub provider_response: Option<Value>,
}

/// Decoded payment gateway contract log, before normalization.
///
/// Amount fields are base-unit integer strings exactly as emitted.
#[derive(Debug, Clone)]
pub struct ChainPaymentEvent {
    pub payer: String,
    pub merchant_wallet: String,
    pub amount_raw: String,
    pub token_symbol: String,
    pub fiat_equivalent_raw: String,
    pub tx_ref: String,
    pub timestamp: DateTime<Utc>,
    pub payment_type: String,
    pub status: String,
    pub charge_fee_raw: String,
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub network: String,
}

/// Classify an event's source kind.
///
/// `payment_type` wins when it names a flow ("FIAT_TO_FIAT",
/// "CRYPTO_TO_FIAT", ...); otherwise a known crypto symbol decides; the
/// default is fiat.
pub fn classify(payment_type: Option<&str>, symbol: Option<&str>) -> SourceKind {
    if let Some(pt) = payment_type {
        let upper = pt.to_ascii_uppercase();
        if upper.contains("FIAT") && !upper.contains("CRYPTO") {
            return SourceKind::Fiat;
        }
        if upper.contains("CRYPTO") {
            return SourceKind::Crypto;
        }
    }
    if let Some(sym) = symbol {
        let upper = sym.trim().to_ascii_uppercase();
        if CRYPTO_SYMBOLS.contains(&upper.as_str()) {
            return SourceKind::Crypto;
        }
    }
    SourceKind::Fiat
}

/// Normalize a decoded contract log into the canonical event shape.
///
/// `decimals` is the fixed-point base the contract emits amounts in.
pub fn normalize_chain_event(
    event: &ChainPaymentEvent,
    decimals: u32,
) -> Result<NormalizedEvent, NormalizeError> {
    if event.tx_ref.trim().is_empty() {
        return Err(NormalizeError::MissingReference);
    }

    let amount = units::from_base_units(&event.amount_raw, decimals)?;
    let charge_fee = if event.charge_fee_raw.trim().is_empty() {
        Decimal::ZERO
    } else {
        units::from_base_units(&event.charge_fee_raw, decimals)?
    };
    let fiat_equivalent = if event.fiat_equivalent_raw.trim().is_empty() {
        None
    } else {
        Some(units::from_base_units(&event.fiat_equivalent_raw, decimals)?)
    };

    let source = classify(Some(&event.payment_type), Some(&event.token_symbol));

    Ok(NormalizedEvent {
        merchant_id: None,
        merchant_wallet: Some(event.merchant_wallet.to_lowercase()),
        reference: event.tx_ref.trim().to_string(),
        payer: Some(event.payer.to_lowercase()),
        source,
        payment_type: Some(event.payment_type.clone()),
        amount,
        amount_raw: Some(event.amount_raw.clone()),
        fiat_equivalent,
        fiat_currency: None,
        charge_fee,
        currency: event.token_symbol.trim().to_ascii_uppercase(),
        method: PaymentMethod::Crypto,
        provider: CONTRACT_PROVIDER.to_string(),
        source_status: Some(event.status.clone()),
        event_timestamp: event.timestamp,
        chain: Some(ChainContext {
            tx_hash: event.tx_hash.clone(),
            block_number: event.block_number,
            network: event.network.clone(),
        }),
        provider_response: None,
    })
}

/// Normalize a fiat gateway webhook payload.
///
/// The gateway nests the interesting fields under `data`; optional fields
/// may be absent, but a payload with no resolvable reference is rejected.
pub fn normalize_webhook(payload: &Value) -> Result<NormalizedEvent, NormalizeError> {
    let data = payload.get("data").unwrap_or(payload);

    let reference = first_string(data, &["tx_ref", "txRef", "reference"])
        .ok_or(NormalizeError::MissingReference)?;

    let amount = decimal_field(data, "amount")
        .ok_or_else(|| NormalizeError::InvalidAmount("data.amount".to_string()))?;
    let charge_fee = decimal_field(data, "app_fee").unwrap_or(Decimal::ZERO);

    let currency = first_string(data, &["currency"]).unwrap_or_else(|| "NGN".to_string());
    let payment_type = first_string(data, &["payment_type"])
        .or_else(|| string_at(data, "/meta/payment_type"));
    let merchant_id = string_at(data, "/meta/merchant_id")
        .or_else(|| first_string(data, &["merchant_id"]));
    let payer = string_at(data, "/customer/email")
        .or_else(|| string_at(data, "/customer/name"));

    let event_timestamp = first_string(data, &["created_at"])
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let source = classify(payment_type.as_deref(), Some(&currency));

    Ok(NormalizedEvent {
        merchant_id,
        merchant_wallet: None,
        reference,
        payer,
        source,
        payment_type: payment_type.clone(),
        amount,
        amount_raw: None,
        fiat_equivalent: None,
        fiat_currency: Some(currency.clone()),
        charge_fee,
        currency,
        method: parse_method(payment_type.as_deref()),
        provider: GATEWAY_PROVIDER.to_string(),
        source_status: first_string(data, &["status"]),
        event_timestamp,
        chain: None,
        provider_response: Some(payload.clone()),
    })
}

/// Map a gateway payment-type string to a funding method.
fn parse_method(payment_type: Option<&str>) -> PaymentMethod {
    let Some(raw) = payment_type else {
        return PaymentMethod::Fiat;
    };
    let lower = raw.to_ascii_lowercase();
    if lower.contains("card") {
        PaymentMethod::Card
    } else if lower.contains("bank") {
        PaymentMethod::Bank
    } else if lower.contains("wallet") {
        PaymentMethod::Wallet
    } else if lower.contains("crypto") {
        PaymentMethod::Crypto
    } else {
        PaymentMethod::Fiat
    }
}

/// First non-empty string among the given keys.
fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = value.get(key).and_then(Value::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// String at a JSON pointer, trimmed, empty treated as absent.
fn string_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Read a field as an exact decimal, accepting JSON numbers and strings.
fn decimal_field(value: &Value, key: &str) -> Option<Decimal> {
    match value.get(key)? {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::ledger::transaction::ChainContext;

    /// The §8 scenario event: 5 USDT paid to merchant wallet `0xb...`.
    pub fn sample_chain_event(reference: &str) -> NormalizedEvent {
        NormalizedEvent {
            merchant_id: None,
            merchant_wallet: Some("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string()),
            reference: reference.to_string(),
            payer: Some("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string()),
            source: SourceKind::Crypto,
            payment_type: Some("CRYPTO_TO_FIAT".to_string()),
            amount: Decimal::new(5, 0),
            amount_raw: Some("5000000".to_string()),
            fiat_equivalent: None,
            fiat_currency: None,
            charge_fee: Decimal::ZERO,
            currency: "USDT".to_string(),
            method: PaymentMethod::Crypto,
            provider: CONTRACT_PROVIDER.to_string(),
            source_status: Some("successful".to_string()),
            event_timestamp: Utc::now(),
            chain: Some(ChainContext {
                tx_hash: "0xfeed".to_string(),
                block_number: Some(42),
                network: "testnet".to_string(),
            }),
            provider_response: None,
        }
    }
}
