// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Settlement dispatcher: claims a ledger record, executes the payout on
//! the merchant's channel, and records the terminal outcome.
//!
//! Idempotence guards, in order:
//! 1. an already `Settled` record returns its stored outcome with zero
//!    external calls;
//! 2. the claim flips `status → Processing` atomically before any I/O, so
//!    a concurrent attempt observes `Processing` and backs off;
//! 3. downstream references are deduplication keys on the provider side:
//!    the bank rail receives a `PAYOUT-` reference derived from the ledger
//!    reference, and the chain rail receives the ledger reference itself,
//!    which the contract deduplicates on.
//!
//! A failed attempt ends as `Failed` with the error preserved verbatim;
//! nothing in here retries on its own.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, warn};

use crate::chain::{ChainCredit, GatewayError, SETTLEMENT_TOKEN};
use crate::ledger::{
    ClaimOutcome, LedgerError, LedgerStore, SettlementRecord, SettlementStatus, Transaction,
};
use crate::merchants::{Merchant, MerchantResolver, ResolveError};
use crate::providers::{FiatTransferApi, TransferError, TransferRequest};
use crate::rates::{ConversionService, ConvertError};
use crate::units::{self, UnitError, DEFAULT_TOKEN_DECIMALS};

/// Provider labels stored on settlement records.
const FIAT_PROVIDER: &str = "transfer-api";
const CHAIN_PROVIDER: &str = "contract";

/// Payout channel labels.
const BANK_TRANSFER: &str = "bank_transfer";
const CHAIN_CREDIT: &str = "chain_credit";

/// Hard failure of the settle call itself. Payout failures are not errors
/// at this level — they end up in the stored settlement record.
#[derive(Debug, thiserror::Error)]
pub enum SettleError {
    #[error("no ledger record for {merchant_id}/{reference}")]
    NotFound {
        merchant_id: String,
        reference: String,
    },

    #[error("settlement already in flight for {merchant_id}/{reference}")]
    InFlight {
        merchant_id: String,
        reference: String,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Why a claimed attempt could not pay out. Recorded on the ledger record
/// as a `Failed` settlement, never propagated to producers.
#[derive(Debug, thiserror::Error)]
enum SettleFailure {
    #[error("merchant has no payout account on file")]
    MissingPayoutAccount,

    #[error("merchant has no payout wallet on file")]
    MissingPayoutWallet,

    #[error("merchant could not be resolved: {0}")]
    Resolve(#[from] ResolveError),

    #[error("charge fee consumes the full settlement amount")]
    FeeExceedsAmount,

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Units(#[from] UnitError),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("chain credit failed: {0}")]
    Chain(#[from] GatewayError),
}

pub struct SettlementDispatcher {
    ledger: Arc<LedgerStore>,
    resolver: Arc<MerchantResolver>,
    rates: Arc<ConversionService>,
    transfers: Arc<dyn FiatTransferApi>,
    chain: Arc<dyn ChainCredit>,
}

impl SettlementDispatcher {
    pub fn new(
        ledger: Arc<LedgerStore>,
        resolver: Arc<MerchantResolver>,
        rates: Arc<ConversionService>,
        transfers: Arc<dyn FiatTransferApi>,
        chain: Arc<dyn ChainCredit>,
    ) -> Self {
        Self {
            ledger,
            resolver,
            rates,
            transfers,
            chain,
        }
    }

    /// Settle one ledger record and return the stored outcome.
    ///
    /// `stale_after` permits reclaiming a `Processing` record that has
    /// been stuck longer than the given age; only the sweeper sets it.
    pub async fn settle(
        &self,
        merchant_id: &str,
        reference: &str,
        stale_after: Option<Duration>,
    ) -> Result<SettlementRecord, SettleError> {
        let tx = match self
            .ledger
            .claim_for_settlement(merchant_id, reference, stale_after)?
        {
            ClaimOutcome::Claimed(tx) => tx,
            ClaimOutcome::AlreadySettled(tx) => {
                return Ok(tx.settlement.unwrap_or_else(|| SettlementRecord {
                    last_run_at: tx.recorded_at,
                    method: None,
                    provider: None,
                    reference: None,
                    status: SettlementStatus::Success,
                    error: None,
                    details: None,
                }));
            }
            ClaimOutcome::InFlight => {
                return Err(SettleError::InFlight {
                    merchant_id: merchant_id.to_string(),
                    reference: reference.to_string(),
                })
            }
            ClaimOutcome::NotFound => {
                return Err(SettleError::NotFound {
                    merchant_id: merchant_id.to_string(),
                    reference: reference.to_string(),
                })
            }
        };

        // The claim is ours; from here on the attempt always runs to a
        // recorded terminal state.
        let record = match self.execute(&tx).await {
            Ok(record) => record,
            Err(failure) => {
                warn!(
                    merchant_id = %tx.merchant_id,
                    reference = %tx.reference,
                    error = %failure,
                    "settlement attempt failed"
                );
                SettlementRecord::dispatch_error(failure.to_string())
            }
        };

        let stored = self
            .ledger
            .record_settlement(merchant_id, reference, record)?;

        info!(
            merchant_id = %stored.merchant_id,
            reference = %stored.reference,
            status = ?stored.status,
            "settlement recorded"
        );

        // record_settlement just wrote it
        Ok(stored
            .settlement
            .unwrap_or_else(|| SettlementRecord::dispatch_error("settlement record missing")))
    }

    async fn execute(&self, tx: &Transaction) -> Result<SettlementRecord, SettleFailure> {
        let merchant = self.resolver.resolve(Some(&tx.merchant_id), None)?;

        if merchant.payout.method.eq_ignore_ascii_case("crypto") {
            self.credit_on_chain(tx, &merchant).await
        } else {
            self.transfer_fiat(tx, &merchant).await
        }
    }

    /// Bank payout: convert to the merchant's settlement currency, deduct
    /// the charge fee, submit the transfer.
    async fn transfer_fiat(
        &self,
        tx: &Transaction,
        merchant: &Merchant,
    ) -> Result<SettlementRecord, SettleFailure> {
        let payout = &merchant.payout;
        let account_number = payout
            .account_number
            .clone()
            .ok_or(SettleFailure::MissingPayoutAccount)?;
        let bank_code = payout
            .bank_code
            .clone()
            .ok_or(SettleFailure::MissingPayoutAccount)?;

        // Prefer the source-reported fiat value; fall back to the native
        // amount in its own currency.
        let (source_amount, source_currency) = match tx.fiat_equivalent {
            Some(fiat) => (fiat, tx.fiat_currency.as_str()),
            None => (tx.amount, tx.currency.as_str()),
        };

        let gross = self
            .rates
            .convert(source_currency, &payout.currency, source_amount)
            .await?;
        let fee = if tx.charge_fee > Decimal::ZERO {
            self.rates
                .convert(&tx.currency, &payout.currency, tx.charge_fee)
                .await?
        } else {
            Decimal::ZERO
        };

        let net = (gross - fee).round_dp(2);
        if net <= Decimal::ZERO {
            return Err(SettleFailure::FeeExceedsAmount);
        }

        let payout_reference = payout_reference(&tx.reference);
        let request = TransferRequest {
            account_bank: bank_code,
            account_number,
            amount: net,
            currency: payout.currency.clone(),
            narration: format!("Settlement {}", tx.reference),
            reference: payout_reference.clone(),
            beneficiary_name: payout.account_name.clone(),
        };

        let receipt = self.transfers.create_transfer(&request).await?;

        Ok(SettlementRecord {
            last_run_at: Utc::now(),
            method: Some(BANK_TRANSFER.to_string()),
            provider: Some(FIAT_PROVIDER.to_string()),
            reference: Some(payout_reference),
            status: SettlementStatus::Success,
            error: None,
            details: Some(json!({
                "provider_reference": receipt.provider_reference,
                "provider_status": receipt.status,
                "amount": net,
                "currency": payout.currency,
            })),
        })
    }

    /// On-chain payout: convert to the settlement token and call
    /// `creditMerchant` with base-unit amounts and the original ledger
    /// reference. The contract deduplicates on `txRef`, so a retried
    /// attempt replays the same credit instead of issuing a second one.
    async fn credit_on_chain(
        &self,
        tx: &Transaction,
        merchant: &Merchant,
    ) -> Result<SettlementRecord, SettleFailure> {
        let wallet = merchant
            .wallet_address
            .clone()
            .ok_or(SettleFailure::MissingPayoutWallet)?;

        let amount = self
            .rates
            .convert(&tx.currency, SETTLEMENT_TOKEN, tx.amount)
            .await?
            .round_dp(DEFAULT_TOKEN_DECIMALS);
        let fee = if tx.charge_fee > Decimal::ZERO {
            self.rates
                .convert(&tx.currency, SETTLEMENT_TOKEN, tx.charge_fee)
                .await?
                .round_dp(DEFAULT_TOKEN_DECIMALS)
        } else {
            Decimal::ZERO
        };

        if fee >= amount {
            return Err(SettleFailure::FeeExceedsAmount);
        }

        let amount_units = units::to_base_units(amount, DEFAULT_TOKEN_DECIMALS)?;
        let fee_units = units::to_base_units(fee, DEFAULT_TOKEN_DECIMALS)?;

        let tx_hash = self
            .chain
            .credit_merchant(&wallet, &amount_units, &fee_units, &tx.reference)
            .await?;

        Ok(SettlementRecord {
            last_run_at: Utc::now(),
            method: Some(CHAIN_CREDIT.to_string()),
            provider: Some(CHAIN_PROVIDER.to_string()),
            reference: Some(tx.reference.clone()),
            status: SettlementStatus::Success,
            error: None,
            details: Some(json!({
                "tx_hash": tx_hash,
                "amount_base_units": amount_units,
                "fee_base_units": fee_units,
                "token": SETTLEMENT_TOKEN,
            })),
        })
    }
}

/// Idempotent payout reference submitted to the fiat transfer gateway.
fn payout_reference(reference: &str) -> String {
    format!("PAYOUT-{reference}-{}", Utc::now().timestamp())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::providers::TransferReceipt;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fake bank rail recording every request.
    pub struct FakeTransfers {
        pub calls: Mutex<Vec<TransferRequest>>,
        pub fail_with: Option<String>,
    }

    impl FakeTransfers {
        pub fn ok() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_with: None,
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_with: Some(message.to_string()),
            }
        }
    }

    #[async_trait]
    impl FiatTransferApi for FakeTransfers {
        async fn create_transfer(
            &self,
            request: &TransferRequest,
        ) -> Result<TransferReceipt, TransferError> {
            self.calls.lock().unwrap().push(request.clone());
            match &self.fail_with {
                Some(message) => Err(TransferError::Api {
                    status: 502,
                    body: message.clone(),
                }),
                None => Ok(TransferReceipt {
                    provider_reference: "tr_1".to_string(),
                    status: "NEW".to_string(),
                    raw: json!({"id": "tr_1"}),
                }),
            }
        }
    }

    /// Fake chain rail recording every credit.
    #[derive(Default)]
    pub struct FakeChain {
        pub calls: Mutex<Vec<(String, String, String, String)>>,
        /// Number of upcoming calls that should fail before succeeding.
        pub fail_remaining: Mutex<u32>,
    }

    #[async_trait]
    impl ChainCredit for FakeChain {
        async fn credit_merchant(
            &self,
            wallet: &str,
            amount_base_units: &str,
            fee_base_units: &str,
            reference: &str,
        ) -> Result<String, GatewayError> {
            self.calls.lock().unwrap().push((
                wallet.to_string(),
                amount_base_units.to_string(),
                fee_base_units.to_string(),
                reference.to_string(),
            ));
            let mut remaining = self.fail_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GatewayError::Rpc("transaction dropped".to_string()));
            }
            Ok("0xc0ffee".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{FakeChain, FakeTransfers};
    use super::*;
    use crate::ledger::TxStatus;
    use crate::merchants::test_support::sample_merchant;
    use crate::merchants::MerchantDirectory;
    use crate::normalize::test_support::sample_chain_event;
    use crate::rates::test_support::StaticRates;
    use crate::rates::RateSource;
    use rust_decimal_macros::dec;

    const WALLET: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    struct Harness {
        dispatcher: SettlementDispatcher,
        ledger: Arc<LedgerStore>,
        transfers: Arc<FakeTransfers>,
        chain: Arc<FakeChain>,
        _dir: tempfile::TempDir,
    }

    fn harness(merchant: crate::merchants::Merchant, transfers: FakeTransfers) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(LedgerStore::open(&dir.path().join("ledger.redb")).unwrap());
        let directory =
            Arc::new(MerchantDirectory::open(&dir.path().join("merchants.redb")).unwrap());
        directory.upsert(&merchant).unwrap();
        let resolver = Arc::new(MerchantResolver::new(directory));

        let sources: Vec<Arc<dyn RateSource>> =
            vec![Arc::new(StaticRates::single("USDT", "NGN", dec!(1500)))];
        let rates = Arc::new(ConversionService::new(sources));

        let transfers = Arc::new(transfers);
        let chain = Arc::new(FakeChain::default());

        let dispatcher = SettlementDispatcher::new(
            ledger.clone(),
            resolver,
            rates,
            transfers.clone(),
            chain.clone(),
        );
        Harness {
            dispatcher,
            ledger,
            transfers,
            chain,
            _dir: dir,
        }
    }

    fn seed(harness: &Harness, reference: &str) {
        let event = sample_chain_event(reference);
        harness
            .ledger
            .upsert_event("merchant-1", Some(WALLET), "NGN", &event)
            .unwrap();
    }

    #[tokio::test]
    async fn crypto_payment_settles_as_converted_bank_transfer() {
        let h = harness(sample_merchant("merchant-1", Some(WALLET)), FakeTransfers::ok());
        seed(&h, "KP-1");

        let record = h.dispatcher.settle("merchant-1", "KP-1", None).await.unwrap();
        assert_eq!(record.status, SettlementStatus::Success);
        assert_eq!(record.method.as_deref(), Some("bank_transfer"));

        // 5 USDT at 1500 NGN/USDT.
        let calls = h.transfers.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].amount, dec!(7500));
        assert_eq!(calls[0].currency, "NGN");
        assert!(calls[0].reference.starts_with("PAYOUT-KP-1-"));

        let tx = h.ledger.get("merchant-1", "KP-1").unwrap().unwrap();
        assert_eq!(tx.status, TxStatus::Settled);
    }

    #[tokio::test]
    async fn settling_twice_pays_once() {
        let h = harness(sample_merchant("merchant-1", Some(WALLET)), FakeTransfers::ok());
        seed(&h, "KP-1");

        let first = h.dispatcher.settle("merchant-1", "KP-1", None).await.unwrap();
        let second = h.dispatcher.settle("merchant-1", "KP-1", None).await.unwrap();

        assert_eq!(first.status, SettlementStatus::Success);
        assert_eq!(second.status, SettlementStatus::Success);
        assert_eq!(second.reference, first.reference);
        assert_eq!(h.transfers.calls.lock().unwrap().len(), 1, "one payout only");
    }

    #[tokio::test]
    async fn charge_fee_is_deducted_from_the_payout() {
        let h = harness(sample_merchant("merchant-1", Some(WALLET)), FakeTransfers::ok());
        let mut event = sample_chain_event("KP-1");
        event.charge_fee = dec!(0.05);
        h.ledger
            .upsert_event("merchant-1", Some(WALLET), "NGN", &event)
            .unwrap();

        h.dispatcher.settle("merchant-1", "KP-1", None).await.unwrap();

        // 7500 gross - 75 fee.
        let calls = h.transfers.calls.lock().unwrap();
        assert_eq!(calls[0].amount, dec!(7425));
    }

    #[tokio::test]
    async fn crypto_payout_credits_base_units_on_chain() {
        let mut merchant = sample_merchant("merchant-1", Some(WALLET));
        merchant.payout.method = "crypto".to_string();
        merchant.payout.currency = "USDT".to_string();
        let h = harness(merchant, FakeTransfers::ok());
        seed(&h, "KP-1");

        let record = h.dispatcher.settle("merchant-1", "KP-1", None).await.unwrap();
        assert_eq!(record.status, SettlementStatus::Success);
        assert_eq!(record.method.as_deref(), Some("chain_credit"));
        assert_eq!(record.reference.as_deref(), Some("KP-1"));

        let calls = h.chain.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, WALLET);
        assert_eq!(calls[0].1, "5000000");
        assert_eq!(calls[0].2, "0");
        // The contract deduplicates on txRef, so the ledger reference goes
        // on-chain unchanged.
        assert_eq!(calls[0].3, "KP-1");
        assert!(h.transfers.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chain_credit_retry_replays_the_same_reference() {
        let mut merchant = sample_merchant("merchant-1", Some(WALLET));
        merchant.payout.method = "crypto".to_string();
        merchant.payout.currency = "USDT".to_string();
        let h = harness(merchant, FakeTransfers::ok());
        seed(&h, "KP-1");
        *h.chain.fail_remaining.lock().unwrap() = 1;

        let first = h.dispatcher.settle("merchant-1", "KP-1", None).await.unwrap();
        assert_eq!(first.status, SettlementStatus::Failed);

        let second = h.dispatcher.settle("merchant-1", "KP-1", None).await.unwrap();
        assert_eq!(second.status, SettlementStatus::Success);

        let calls = h.chain.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].3, "KP-1");
        assert_eq!(
            calls[1].3, "KP-1",
            "retry must resubmit the contract-side dedup key"
        );
    }

    #[tokio::test]
    async fn missing_payout_account_fails_without_external_calls() {
        let mut merchant = sample_merchant("merchant-1", Some(WALLET));
        merchant.payout.account_number = None;
        let h = harness(merchant, FakeTransfers::ok());
        seed(&h, "KP-1");

        let record = h.dispatcher.settle("merchant-1", "KP-1", None).await.unwrap();
        assert_eq!(record.status, SettlementStatus::Failed);
        assert!(record.error.unwrap().contains("payout account"));
        assert!(h.transfers.calls.lock().unwrap().is_empty());

        let tx = h.ledger.get("merchant-1", "KP-1").unwrap().unwrap();
        assert_eq!(tx.status, TxStatus::Failed);
    }

    #[tokio::test]
    async fn unsupported_conversion_fails_the_attempt_not_the_engine() {
        let mut merchant = sample_merchant("merchant-1", Some(WALLET));
        merchant.payout.currency = "GHS".to_string();
        let h = harness(merchant, FakeTransfers::ok());
        seed(&h, "KP-1");

        let record = h.dispatcher.settle("merchant-1", "KP-1", None).await.unwrap();
        assert_eq!(record.status, SettlementStatus::Failed);
        assert!(record.error.unwrap().contains("no conversion rate"));
        assert!(h.transfers.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_is_recorded_and_retriable() {
        let h = harness(
            sample_merchant("merchant-1", Some(WALLET)),
            FakeTransfers::failing("bank unavailable"),
        );
        seed(&h, "KP-1");

        let record = h.dispatcher.settle("merchant-1", "KP-1", None).await.unwrap();
        assert_eq!(record.status, SettlementStatus::Failed);
        assert!(record.error.unwrap().contains("bank unavailable"));

        // Failed records accept another claim.
        let tx = h.ledger.get("merchant-1", "KP-1").unwrap().unwrap();
        assert_eq!(tx.status, TxStatus::Failed);
    }

    #[tokio::test]
    async fn in_flight_record_is_not_settled_twice() {
        let h = harness(sample_merchant("merchant-1", Some(WALLET)), FakeTransfers::ok());
        seed(&h, "KP-1");

        // Simulate another worker owning the claim.
        h.ledger
            .claim_for_settlement("merchant-1", "KP-1", None)
            .unwrap();

        let err = h.dispatcher.settle("merchant-1", "KP-1", None).await.unwrap_err();
        assert!(matches!(err, SettleError::InFlight { .. }));
        assert!(h.transfers.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_record_is_not_found() {
        let h = harness(sample_merchant("merchant-1", Some(WALLET)), FakeTransfers::ok());
        let err = h.dispatcher.settle("merchant-1", "nope", None).await.unwrap_err();
        assert!(matches!(err, SettleError::NotFound { .. }));
    }
}
