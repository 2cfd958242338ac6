// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Settlement
//!
//! Settlement runs in the background: the reconciliation coordinator and
//! the sweeper submit jobs to a bounded queue, one worker drains it, and
//! the dispatcher executes the payout and records the outcome on the
//! ledger record. Producers never wait on a payout; the only way to
//! observe a settlement is the stored record.

pub mod dispatcher;
pub mod worker;

use tokio::sync::mpsc;

pub use dispatcher::{SettleError, SettlementDispatcher};
pub use worker::{SettlementSweeper, SettlementWorker};

/// One unit of settlement work.
#[derive(Debug, Clone)]
pub struct SettlementJob {
    pub merchant_id: String,
    pub reference: String,
    /// Set by the sweeper: allow reclaiming a stale `Processing` record.
    pub reclaim_stale: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("settlement queue is full")]
pub struct QueueFull;

/// Sending half of the settlement queue, shared by producers.
#[derive(Clone)]
pub struct SettlementQueue {
    tx: mpsc::Sender<SettlementJob>,
}

impl SettlementQueue {
    /// Create a bounded queue; the receiver goes to the worker.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<SettlementJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Submit a job without blocking the producer.
    pub fn submit(&self, job: SettlementJob) -> Result<(), QueueFull> {
        self.tx.try_send(job).map_err(|_| QueueFull)
    }
}
