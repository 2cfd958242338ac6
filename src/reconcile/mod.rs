// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Reconciliation Coordinator
//!
//! Single entry point for both producers. Every normalized event passes
//! through here: resolve the merchant, upsert the ledger record inside one
//! write transaction, then hand the record to the settlement queue if it
//! still needs paying out.
//!
//! Same-reference races between the webhook handler and the chain listener
//! are resolved by redb's serialized writers — both events land, in some
//! order, on the same record. A lost race is a success, not an error.

use std::sync::Arc;

use tracing::{info, warn};

use crate::ledger::{LedgerError, LedgerStore, Transaction};
use crate::merchants::{MerchantResolver, ResolveError};
use crate::normalize::NormalizedEvent;
use crate::settlement::{SettlementJob, SettlementQueue};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct ReconcileCoordinator {
    ledger: Arc<LedgerStore>,
    resolver: Arc<MerchantResolver>,
    queue: SettlementQueue,
}

impl ReconcileCoordinator {
    pub fn new(
        ledger: Arc<LedgerStore>,
        resolver: Arc<MerchantResolver>,
        queue: SettlementQueue,
    ) -> Self {
        Self {
            ledger,
            resolver,
            queue,
        }
    }

    /// Reconcile one normalized event into the ledger.
    ///
    /// An event naming no resolvable merchant fails here, before any
    /// ledger write. Settlement enqueue failure is recorded on the
    /// transaction and logged, never propagated — the producer's delivery
    /// already succeeded at that point.
    pub fn reconcile(&self, event: &NormalizedEvent) -> Result<Transaction, ReconcileError> {
        let merchant = self
            .resolver
            .resolve(event.merchant_id.as_deref(), event.merchant_wallet.as_deref())?;

        let tx = self.ledger.upsert_event(
            &merchant.merchant_id,
            merchant.wallet_address.as_deref(),
            &merchant.payout.currency,
            event,
        )?;

        info!(
            merchant_id = %tx.merchant_id,
            reference = %tx.reference,
            source = ?tx.source,
            status = ?tx.status,
            amount = %tx.amount,
            currency = %tx.currency,
            "event reconciled"
        );

        if !tx.status.is_terminal() {
            let job = SettlementJob {
                merchant_id: tx.merchant_id.clone(),
                reference: tx.reference.clone(),
                reclaim_stale: false,
            };
            if let Err(e) = self.queue.submit(job) {
                warn!(
                    merchant_id = %tx.merchant_id,
                    reference = %tx.reference,
                    error = %e,
                    "failed to enqueue settlement"
                );
                self.ledger
                    .note_dispatch_error(&tx.merchant_id, &tx.reference, &e.to_string())?;
            }
        }

        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TxStatus;
    use crate::merchants::test_support::sample_merchant;
    use crate::merchants::MerchantDirectory;
    use crate::normalize::test_support::sample_chain_event;

    const WALLET: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn coordinator(
        capacity: usize,
    ) -> (
        ReconcileCoordinator,
        tokio::sync::mpsc::Receiver<SettlementJob>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(LedgerStore::open(&dir.path().join("ledger.redb")).unwrap());
        let directory =
            Arc::new(MerchantDirectory::open(&dir.path().join("merchants.redb")).unwrap());
        directory
            .upsert(&sample_merchant("merchant-1", Some(WALLET)))
            .unwrap();
        let resolver = Arc::new(MerchantResolver::new(directory));
        let (queue, rx) = SettlementQueue::bounded(capacity);
        (ReconcileCoordinator::new(ledger.clone(), resolver, queue), rx, dir)
    }

    #[test]
    fn reconcile_resolves_wallet_and_enqueues_settlement() {
        let (coordinator, mut rx, _dir) = coordinator(8);
        let event = sample_chain_event("KP-1");

        let tx = coordinator.reconcile(&event).unwrap();
        assert_eq!(tx.merchant_id, "merchant-1");
        assert_eq!(tx.status, TxStatus::Pending);

        let job = rx.try_recv().unwrap();
        assert_eq!(job.reference, "KP-1");
        assert!(!job.reclaim_stale);
    }

    #[test]
    fn unknown_merchant_never_touches_the_ledger() {
        let (coordinator, mut rx, _dir) = coordinator(8);
        let mut event = sample_chain_event("KP-1");
        event.merchant_wallet = Some("0x0000000000000000000000000000000000000000".to_string());

        let err = coordinator.reconcile(&event).unwrap_err();
        assert!(matches!(err, ReconcileError::Resolve(ResolveError::NotFound(_))));
        assert!(rx.try_recv().is_err());
        assert!(coordinator.ledger.get("merchant-1", "KP-1").unwrap().is_none());
    }

    #[test]
    fn redelivery_enqueues_again_but_keeps_one_record() {
        let (coordinator, mut rx, _dir) = coordinator(8);
        let event = sample_chain_event("KP-1");

        coordinator.reconcile(&event).unwrap();
        coordinator.reconcile(&event).unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        let (listed, _) = coordinator.ledger.list_by_wallet(WALLET, None, 10).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn full_queue_is_recorded_not_propagated() {
        let (coordinator, _rx, _dir) = coordinator(1);

        coordinator.reconcile(&sample_chain_event("KP-1")).unwrap();
        // Queue capacity exhausted; the second reconcile still succeeds.
        let tx = coordinator.reconcile(&sample_chain_event("KP-2")).unwrap();
        assert_eq!(tx.status, TxStatus::Pending);

        let stored = coordinator.ledger.get("merchant-1", "KP-2").unwrap().unwrap();
        let settlement = stored.settlement.unwrap();
        assert!(settlement.error.unwrap().contains("queue"));
    }
}
