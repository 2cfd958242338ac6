// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! External payout providers.

pub mod transfer;

pub use transfer::{
    DisabledTransfers, FiatTransferApi, HttpTransferClient, TransferError, TransferReceipt,
    TransferRequest,
};
