// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Crossrail - Transaction Reconciliation & Settlement Engine
//!
//! Ingests merchant payment events from two independent rails — a fiat
//! gateway delivering signed webhooks and an EVM payment gateway contract
//! emitting `PaymentReceived` logs — reconciles them into exactly one
//! ledger record per (merchant, reference), and settles each record once
//! via a bank transfer or an on-chain merchant credit.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum)
//! - `chain` - EVM gateway contract bindings, credit client, log listener
//! - `ledger` - redb-backed transaction ledger and settlement claims
//! - `merchants` - merchant directory and resolver
//! - `normalize` - event normalization from both rails
//! - `providers` - fiat transfer gateway client
//! - `rates` - currency conversion service
//! - `reconcile` - reconciliation coordinator
//! - `settlement` - settlement dispatcher, worker, and sweeper

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod merchants;
pub mod normalize;
pub mod providers;
pub mod rates;
pub mod reconcile;
pub mod settlement;
pub mod state;
pub mod units;
