// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::ledger::LedgerStore;
use crate::reconcile::ReconcileCoordinator;
use crate::settlement::SettlementQueue;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerStore>,
    pub coordinator: Arc<ReconcileCoordinator>,
    pub queue: SettlementQueue,
    /// HMAC-SHA256 secret shared with the fiat gateway.
    pub webhook_secret: Arc<String>,
}

impl AppState {
    pub fn new(
        ledger: Arc<LedgerStore>,
        coordinator: Arc<ReconcileCoordinator>,
        queue: SettlementQueue,
        webhook_secret: String,
    ) -> Self {
        Self {
            ledger,
            coordinator,
            queue,
            webhook_secret: Arc::new(webhook_secret),
        }
    }
}
