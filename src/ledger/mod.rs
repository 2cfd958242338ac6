// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Canonical ledger: record model, status state machine, and the embedded
//! redb store that holds exactly one record per `(merchant, reference)`.

pub mod store;
pub mod transaction;

pub use store::{ClaimOutcome, LedgerError, LedgerResult, LedgerStore};
pub use transaction::{
    ChainContext, PaymentMethod, SettlementRecord, SettlementStatus, Transaction, TxStatus,
};
