// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! On-chain rail: payment gateway contract bindings, the merchant credit
//! client, and the log listener that feeds reconciliation.

pub mod gateway;
pub mod listener;

pub use gateway::{ChainCredit, DisabledCredit, GatewayClient, GatewayError};
pub use listener::ChainListener;

/// Default network label stored on chain-sourced records.
pub const DEFAULT_NETWORK: &str = "testnet";

/// Token the gateway contract settles crypto payouts in.
pub const SETTLEMENT_TOKEN: &str = "USDT";
