// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Chain Log Listener
//!
//! Background task that ingests `PaymentReceived` logs from the payment
//! gateway contract into the ledger via the reconciliation coordinator.
//!
//! ## Strategy
//!
//! Polls `eth_getLogs` in bounded block chunks, filtered to the gateway
//! contract and the `PaymentReceived` topic. Every decoded log is
//! normalized and reconciled; a log that fails to decode or reconcile is
//! logged and skipped, never blocking the rest of the chunk.
//!
//! ## Checkpointing
//!
//! The last processed block is persisted in the ledger's listener-state
//! table after each chunk. On restart the listener resumes from the
//! checkpoint; a fresh database starts a bounded lookback behind head.
//! Re-delivered logs are harmless — reconciliation merges them.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::rpc::types::Filter;
use alloy::sol_types::SolEvent;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::gateway::{read_provider, GatewayError, IPaymentGateway::PaymentReceived};
use crate::ledger::{LedgerError, LedgerStore};
use crate::normalize::{self, ChainPaymentEvent};
use crate::reconcile::ReconcileCoordinator;
use crate::units::DEFAULT_TOKEN_DECIMALS;

/// Default block chunk size per `eth_getLogs` query.
const DEFAULT_CHUNK_SIZE: u64 = 2000;

/// Default poll interval when caught up to chain head.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How far back to look when starting fresh (no checkpoint).
const INITIAL_LOOKBACK_BLOCKS: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Gateway log listener that runs as a background tokio task.
pub struct ChainListener {
    coordinator: Arc<ReconcileCoordinator>,
    ledger: Arc<LedgerStore>,
    rpc_url: String,
    contract: Address,
    network: String,
    poll_interval: Duration,
    chunk_size: u64,
}

impl ChainListener {
    pub fn new(
        coordinator: Arc<ReconcileCoordinator>,
        ledger: Arc<LedgerStore>,
        rpc_url: String,
        contract_address: &str,
        network: String,
    ) -> Result<Self, GatewayError> {
        let contract = Address::from_str(contract_address)
            .map_err(|e| GatewayError::InvalidAddress(e.to_string()))?;
        Ok(Self {
            coordinator,
            ledger,
            rpc_url,
            contract,
            network,
            poll_interval: DEFAULT_POLL_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Run the listener loop until the cancellation token is triggered.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            network = %self.network,
            contract = %self.contract,
            "Chain listener starting"
        );

        let provider = match read_provider(&self.rpc_url) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Chain listener cannot build provider, exiting");
                return;
            }
        };

        loop {
            if shutdown.is_cancelled() {
                tracing::info!("Chain listener shutting down");
                return;
            }

            if let Err(e) = self.ingest_step(&provider).await {
                tracing::warn!(error = %e, "Listener step failed, will retry");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = shutdown.cancelled() => {
                    tracing::info!("Chain listener shutting down");
                    return;
                }
            }
        }
    }

    /// Execute one ingest step: fetch logs from checkpoint to head.
    async fn ingest_step<P: Provider + Clone>(&self, provider: &P) -> Result<(), ListenerError> {
        let checkpoint = self.ledger.get_last_ingested_block(&self.network)?;

        let head = provider
            .get_block_number()
            .await
            .map_err(|e| ListenerError::Rpc(e.to_string()))?;

        let start = if checkpoint == 0 {
            head.saturating_sub(INITIAL_LOOKBACK_BLOCKS)
        } else {
            checkpoint + 1
        };

        if start > head {
            return Ok(());
        }

        let mut from = start;
        while from <= head {
            let to = (from + self.chunk_size - 1).min(head);

            let ingested = self.fetch_and_reconcile(provider, from, to).await?;
            if ingested > 0 {
                tracing::debug!(
                    from_block = from,
                    to_block = to,
                    events = ingested,
                    "Ingested gateway payment logs"
                );
            }

            self.ledger.set_last_ingested_block(&self.network, to)?;
            from = to + 1;
        }

        Ok(())
    }

    /// Fetch `PaymentReceived` logs for a block range and reconcile them.
    async fn fetch_and_reconcile<P: Provider + Clone>(
        &self,
        provider: &P,
        from_block: u64,
        to_block: u64,
    ) -> Result<usize, ListenerError> {
        let filter = Filter::new()
            .address(self.contract)
            .event_signature(PaymentReceived::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| ListenerError::Rpc(e.to_string()))?;

        let mut count = 0;

        for log in &logs {
            let decoded = match PaymentReceived::decode_log(&log.inner) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable gateway log");
                    continue;
                }
            };

            let tx_hash = log
                .transaction_hash
                .map(|h| format!("{h:#x}"))
                .unwrap_or_default();
            if tx_hash.is_empty() {
                continue;
            }

            let raw = raw_event(&decoded.data, tx_hash, log.block_number, &self.network);

            let event = match normalize::normalize_chain_event(&raw, DEFAULT_TOKEN_DECIMALS) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(
                        tx_hash = %raw.tx_hash,
                        error = %e,
                        "Skipping malformed gateway payment"
                    );
                    continue;
                }
            };

            if let Err(e) = self.coordinator.reconcile(&event) {
                tracing::warn!(
                    reference = %event.reference,
                    error = %e,
                    "Failed to reconcile gateway payment"
                );
                continue;
            }

            count += 1;
        }

        Ok(count)
    }
}

/// Flatten a decoded `PaymentReceived` into the normalizer's input shape.
fn raw_event(
    event: &PaymentReceived,
    tx_hash: String,
    block_number: Option<u64>,
    network: &str,
) -> ChainPaymentEvent {
    let seconds: u64 = event.timestamp.try_into().unwrap_or(0);
    let timestamp = DateTime::from_timestamp(seconds as i64, 0).unwrap_or_else(Utc::now);

    ChainPaymentEvent {
        payer: format!("{:#x}", event.payer),
        merchant_wallet: format!("{:#x}", event.merchant),
        amount_raw: event.amount.to_string(),
        token_symbol: event.tokenSymbol.clone(),
        fiat_equivalent_raw: event.fiatEquivalent.to_string(),
        tx_ref: event.txRef.clone(),
        timestamp,
        payment_type: event.paymentType.clone(),
        status: event.status.clone(),
        charge_fee_raw: event.chargeFee.to_string(),
        tx_hash,
        block_number,
        network: network.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use rust_decimal_macros::dec;

    #[test]
    fn decoded_log_flattens_and_normalizes() {
        let payer = Address::repeat_byte(0xaa);
        let merchant = Address::repeat_byte(0xbb);
        let event = PaymentReceived {
            payer,
            merchant,
            amount: U256::from(5_000_000u64),
            tokenSymbol: "USDT".to_string(),
            fiatEquivalent: U256::from(7_500_000_000u64),
            txRef: "KP-1".to_string(),
            timestamp: U256::from(1_767_600_000u64),
            paymentType: "CRYPTO_TO_FIAT".to_string(),
            status: "successful".to_string(),
            chargeFee: U256::from(50_000u64),
        };

        let raw = raw_event(&event, "0xdeadbeef".to_string(), Some(1234), "testnet");
        assert_eq!(raw.amount_raw, "5000000");
        assert_eq!(raw.tx_ref, "KP-1");
        assert_eq!(raw.network, "testnet");

        let normalized = normalize::normalize_chain_event(&raw, DEFAULT_TOKEN_DECIMALS).unwrap();
        assert_eq!(normalized.amount, dec!(5));
        assert_eq!(normalized.charge_fee, dec!(0.05));
        assert_eq!(normalized.payer, Some(format!("{payer:#x}")));
        assert_eq!(normalized.chain.as_ref().unwrap().block_number, Some(1234));
    }
}
