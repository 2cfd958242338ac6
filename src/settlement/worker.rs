// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Background settlement worker and the stuck-record sweeper.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{SettlementDispatcher, SettlementJob, SettlementQueue};
use crate::ledger::LedgerStore;
use crate::settlement::SettleError;

/// Drains the settlement queue, one job at a time.
///
/// Order within the queue does not matter for correctness — the claim in
/// the dispatcher makes duplicate jobs harmless.
pub struct SettlementWorker {
    dispatcher: Arc<SettlementDispatcher>,
    rx: mpsc::Receiver<SettlementJob>,
    stale_after: Duration,
}

impl SettlementWorker {
    pub fn new(
        dispatcher: Arc<SettlementDispatcher>,
        rx: mpsc::Receiver<SettlementJob>,
        stale_after: Duration,
    ) -> Self {
        Self {
            dispatcher,
            rx,
            stale_after,
        }
    }

    /// Run until the queue closes or the cancellation token fires.
    ///
    /// A job picked up before shutdown still runs to its recorded terminal
    /// state; cancellation only stops picking up new jobs.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Settlement worker starting");

        loop {
            let job = tokio::select! {
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let stale_after = job.reclaim_stale.then_some(self.stale_after);
            match self
                .dispatcher
                .settle(&job.merchant_id, &job.reference, stale_after)
                .await
            {
                Ok(_) => {}
                Err(SettleError::InFlight { .. }) => {
                    tracing::debug!(
                        merchant_id = %job.merchant_id,
                        reference = %job.reference,
                        "settlement already in flight, skipping"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        merchant_id = %job.merchant_id,
                        reference = %job.reference,
                        error = %e,
                        "settlement job failed"
                    );
                }
            }
        }

        tracing::info!("Settlement worker shutting down");
    }
}

/// Re-queues records stuck in `Processing` — crash recovery for attempts
/// that died between claim and recorded outcome.
pub struct SettlementSweeper {
    ledger: Arc<LedgerStore>,
    queue: SettlementQueue,
    interval: StdDuration,
    stale_after: Duration,
}

impl SettlementSweeper {
    pub fn new(
        ledger: Arc<LedgerStore>,
        queue: SettlementQueue,
        interval: StdDuration,
        stale_after: Duration,
    ) -> Self {
        Self {
            ledger,
            queue,
            interval,
            stale_after,
        }
    }

    /// Run sweep passes until the cancellation token fires.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Settlement sweeper starting");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    tracing::info!("Settlement sweeper shutting down");
                    return;
                }
            }

            match self.ledger.list_stuck_processing(self.stale_after) {
                Ok(stuck) => {
                    for (merchant_id, reference) in stuck {
                        tracing::warn!(
                            merchant_id = %merchant_id,
                            reference = %reference,
                            "re-queuing stale processing record"
                        );
                        let job = SettlementJob {
                            merchant_id,
                            reference,
                            reclaim_stale: true,
                        };
                        if self.queue.submit(job).is_err() {
                            // Queue full; the next pass will find it again.
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Sweep pass failed, will retry");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{SettlementStatus, TxStatus};
    use crate::merchants::test_support::sample_merchant;
    use crate::merchants::{MerchantDirectory, MerchantResolver};
    use crate::normalize::test_support::sample_chain_event;
    use crate::rates::test_support::StaticRates;
    use crate::rates::{ConversionService, RateSource};
    use crate::settlement::dispatcher::test_support::{FakeChain, FakeTransfers};
    use rust_decimal_macros::dec;

    const WALLET: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn build() -> (
        Arc<SettlementDispatcher>,
        Arc<LedgerStore>,
        SettlementQueue,
        mpsc::Receiver<SettlementJob>,
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
        let sources: Vec<Arc<dyn RateSource>> =
            vec![Arc::new(StaticRates::single("USDT", "NGN", dec!(1500)))];
        let dispatcher = Arc::new(SettlementDispatcher::new(
            ledger.clone(),
            resolver,
            Arc::new(ConversionService::new(sources)),
            Arc::new(FakeTransfers::ok()),
            Arc::new(FakeChain::default()),
        ));
        let (queue, rx) = SettlementQueue::bounded(8);
        (dispatcher, ledger, queue, rx, dir)
    }

    #[tokio::test]
    async fn worker_drains_queue_and_settles() {
        let (dispatcher, ledger, queue, rx, _dir) = build();
        ledger
            .upsert_event("merchant-1", Some(WALLET), "NGN", &sample_chain_event("KP-1"))
            .unwrap();

        queue
            .submit(SettlementJob {
                merchant_id: "merchant-1".to_string(),
                reference: "KP-1".to_string(),
                reclaim_stale: false,
            })
            .unwrap();
        drop(queue); // close the channel so the worker exits

        let worker = SettlementWorker::new(dispatcher, rx, Duration::minutes(10));
        worker.run(CancellationToken::new()).await;

        let tx = ledger.get("merchant-1", "KP-1").unwrap().unwrap();
        assert_eq!(tx.status, TxStatus::Settled);
        assert_eq!(tx.settlement.unwrap().status, SettlementStatus::Success);
    }

    #[tokio::test]
    async fn reclaim_job_settles_a_stuck_processing_record() {
        let (dispatcher, ledger, queue, rx, _dir) = build();
        ledger
            .upsert_event("merchant-1", Some(WALLET), "NGN", &sample_chain_event("KP-1"))
            .unwrap();
        // A crashed attempt left the record claimed.
        ledger
            .claim_for_settlement("merchant-1", "KP-1", None)
            .unwrap();

        queue
            .submit(SettlementJob {
                merchant_id: "merchant-1".to_string(),
                reference: "KP-1".to_string(),
                reclaim_stale: true,
            })
            .unwrap();
        drop(queue);

        // Zero stale age: anything in Processing counts as stuck.
        let worker = SettlementWorker::new(dispatcher, rx, Duration::zero());
        worker.run(CancellationToken::new()).await;

        let tx = ledger.get("merchant-1", "KP-1").unwrap().unwrap();
        assert_eq!(tx.status, TxStatus::Settled);
    }
}
