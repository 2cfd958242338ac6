// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Canonical ledger record types.
//!
//! One [`Transaction`] exists per `(merchant_id, reference)` pair, no matter
//! how many times the fiat gateway or the chain listener re-delivers the
//! underlying event. Optional fields are skipped during serialization so
//! stored documents never accumulate null padding.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::normalize::{NormalizedEvent, SourceKind};

/// Ledger transaction lifecycle status.
///
/// Status only moves forward: `Pending → Processing → Settled`, with
/// `Processing → Failed` on settlement failure and `Failed → Processing`
/// on an operator or sweeper retry. `Settled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// Recorded, settlement not yet started.
    Pending,
    /// A settlement attempt has claimed this record.
    Processing,
    /// Merchant has been paid out.
    Settled,
    /// Last settlement attempt failed; retriable.
    Failed,
}

impl TxStatus {
    /// Whether a transition from `self` to `next` is permitted.
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        matches!(
            (self, next),
            (TxStatus::Pending, TxStatus::Processing)
                | (TxStatus::Processing, TxStatus::Settled)
                | (TxStatus::Processing, TxStatus::Failed)
                | (TxStatus::Failed, TxStatus::Processing)
        )
    }

    /// Whether this status permits further settlement work.
    pub fn is_terminal(self) -> bool {
        self == TxStatus::Settled
    }
}

/// How the payer funded the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    Bank,
    Wallet,
    Crypto,
    Fiat,
}

/// Chain metadata, present only on crypto-sourced records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChainContext {
    /// Transaction hash of the originating contract event.
    pub tx_hash: String,
    /// Block the event was emitted in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// Network label (e.g. "testnet").
    pub network: String,
}

/// Outcome of a settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Success,
    Failed,
}

/// Audit trail of the most recent settlement attempt.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SettlementRecord {
    /// When the attempt ran.
    pub last_run_at: DateTime<Utc>,
    /// Payout channel used ("bank_transfer" or "chain_credit").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Downstream provider that executed (or rejected) the payout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Idempotent payout reference submitted downstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Attempt outcome.
    pub status: SettlementStatus,
    /// Failure detail, preserved verbatim for audit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider receipt detail (transfer id, tx hash, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl SettlementRecord {
    /// A failure record carrying only an error message, used when a
    /// settlement attempt could not even be dispatched.
    pub fn dispatch_error(message: impl Into<String>) -> Self {
        Self {
            last_run_at: Utc::now(),
            method: None,
            provider: None,
            reference: None,
            status: SettlementStatus::Failed,
            error: Some(message.into()),
            details: None,
        }
    }
}

/// The unified ledger record for one logical payment.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Internal record id, assigned at creation and stable across merges.
    pub id: Uuid,
    /// Owning merchant; immutable after creation.
    pub merchant_id: String,
    /// Idempotency key, unique per merchant.
    pub reference: String,
    /// Wallet address or payer identifier (chain payers lower-cased).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    /// Which producer created/last touched this record.
    pub source: SourceKind,
    /// Business flow classification (e.g. "CRYPTO_TO_FIAT").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_type: Option<String>,
    /// Amount in the record's natural unit (major fiat units or
    /// human-readable token units).
    pub amount: Decimal,
    /// Original base-unit integer string from the source, kept for audit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_raw: Option<String>,
    /// Amount expressed in the merchant's settlement fiat currency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fiat_equivalent: Option<Decimal>,
    /// Settlement fiat currency.
    pub fiat_currency: String,
    /// Fee deducted before merchant payout.
    pub charge_fee: Decimal,
    /// Token symbol or fiat code of `amount`.
    pub currency: String,
    /// Funding method.
    pub method: PaymentMethod,
    /// Producing provider ("contract", gateway name, or "manual").
    pub provider: String,
    /// Lifecycle status.
    pub status: TxStatus,
    /// Time the source says the event occurred.
    pub event_timestamp: DateTime<Utc>,
    /// Time this engine last persisted the record.
    pub recorded_at: DateTime<Utc>,
    /// Chain metadata for crypto-sourced records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainContext>,
    /// Most recent settlement attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement: Option<SettlementRecord>,
    /// Raw upstream payload, retained for dispute resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_response: Option<serde_json::Value>,
}

impl Transaction {
    /// Build a fresh `Pending` record from a normalized event.
    ///
    /// `default_fiat_currency` is the merchant's preferred settlement
    /// currency, used when the event does not carry one.
    pub fn from_event(
        merchant_id: &str,
        event: &NormalizedEvent,
        default_fiat_currency: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            merchant_id: merchant_id.to_string(),
            reference: event.reference.clone(),
            payer: event.payer.clone(),
            source: event.source,
            payment_type: event.payment_type.clone(),
            amount: event.amount,
            amount_raw: event.amount_raw.clone(),
            fiat_equivalent: event.fiat_equivalent,
            fiat_currency: event
                .fiat_currency
                .clone()
                .unwrap_or_else(|| default_fiat_currency.to_string()),
            charge_fee: event.charge_fee,
            currency: event.currency.clone(),
            method: event.method,
            provider: event.provider.clone(),
            status: TxStatus::Pending,
            event_timestamp: event.event_timestamp,
            recorded_at: Utc::now(),
            chain: event.chain.clone(),
            settlement: None,
            provider_response: event.provider_response.clone(),
        }
    }

    /// Merge a re-delivered event into this record.
    ///
    /// A `Pending` record is overwritten wholesale (last writer wins); once
    /// settlement has started only missing optional fields are filled in, so
    /// a stale re-delivery can never regress the amount or the status.
    pub fn merge_event(&mut self, event: &NormalizedEvent) {
        if self.status == TxStatus::Pending {
            self.payer = event.payer.clone().or(self.payer.take());
            self.source = event.source;
            self.payment_type = event.payment_type.clone().or(self.payment_type.take());
            self.amount = event.amount;
            self.amount_raw = event.amount_raw.clone().or(self.amount_raw.take());
            self.fiat_equivalent = event.fiat_equivalent.or(self.fiat_equivalent);
            if let Some(currency) = &event.fiat_currency {
                self.fiat_currency = currency.clone();
            }
            self.charge_fee = event.charge_fee;
            self.currency = event.currency.clone();
            self.method = event.method;
            self.provider = event.provider.clone();
            self.event_timestamp = event.event_timestamp;
            self.chain = event.chain.clone().or(self.chain.take());
            self.provider_response = event
                .provider_response
                .clone()
                .or(self.provider_response.take());
        } else {
            // Settlement already started: additive fields only.
            if self.payer.is_none() {
                self.payer = event.payer.clone();
            }
            if self.chain.is_none() {
                self.chain = event.chain.clone();
            }
            if self.fiat_equivalent.is_none() {
                self.fiat_equivalent = event.fiat_equivalent;
            }
            if self.amount_raw.is_none() {
                self.amount_raw = event.amount_raw.clone();
            }
            if self.provider_response.is_none() {
                self.provider_response = event.provider_response.clone();
            }
        }
        self.recorded_at = Utc::now();
    }
}
