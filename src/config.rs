// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names, default values, and the
//! small helpers used to read them. Configuration is loaded from the
//! environment at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Root directory for the redb databases | `/data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `WEBHOOK_SECRET` | HMAC-SHA256 secret for gateway webhook signatures | Required |
//! | `MERCHANTS_FILE` | JSON file synced into the merchant directory at startup | Optional |
//! | `TRANSFER_API_BASE_URL` | Fiat transfer gateway base URL | Required for fiat payouts |
//! | `TRANSFER_API_KEY` | Fiat transfer gateway bearer key | Required for fiat payouts |
//! | `CHAIN_RPC_URL` | EVM RPC endpoint | Required for chain rail |
//! | `GATEWAY_CONTRACT_ADDRESS` | Payment gateway contract address | Required for chain rail |
//! | `GATEWAY_SIGNER_KEY` | Hex private key for `creditMerchant` calls | Required for crypto payouts |
//! | `CHAIN_NETWORK` | Network label stored on chain records | `testnet` |
//! | `RATE_FEED_URL` | Price feed base URL for crypto pairs | Optional |
//! | `FIAT_RATES` | Fixed fiat/fiat rates, e.g. `USD:NGN=1500,USDT:NGN=1500` | Optional |
//! | `SETTLE_STALE_AFTER_SECS` | Age before a stuck `processing` record is reclaimed | `600` |
//! | `SETTLE_SWEEP_INTERVAL_SECS` | Interval between sweeper passes | `60` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

/// Environment variable name for the data directory holding the redb files.
pub const DATA_DIR_ENV: &str = "DATA_DIR";

/// Default data directory when `DATA_DIR` is unset.
pub const DEFAULT_DATA_DIR: &str = "/data";

/// Environment variable name for the gateway webhook HMAC secret.
pub const WEBHOOK_SECRET_ENV: &str = "WEBHOOK_SECRET";

/// Environment variable name for the merchant directory seed file.
pub const MERCHANTS_FILE_ENV: &str = "MERCHANTS_FILE";

/// Environment variable names for the fiat transfer gateway.
pub const TRANSFER_API_BASE_URL_ENV: &str = "TRANSFER_API_BASE_URL";
pub const TRANSFER_API_KEY_ENV: &str = "TRANSFER_API_KEY";

/// Environment variable names for the chain rail.
pub const CHAIN_RPC_URL_ENV: &str = "CHAIN_RPC_URL";
pub const GATEWAY_CONTRACT_ADDRESS_ENV: &str = "GATEWAY_CONTRACT_ADDRESS";
pub const GATEWAY_SIGNER_KEY_ENV: &str = "GATEWAY_SIGNER_KEY";
pub const CHAIN_NETWORK_ENV: &str = "CHAIN_NETWORK";

/// Environment variable names for the price conversion service.
pub const RATE_FEED_URL_ENV: &str = "RATE_FEED_URL";
pub const FIAT_RATES_ENV: &str = "FIAT_RATES";

/// Environment variable names for the settlement sweeper.
pub const SETTLE_STALE_AFTER_SECS_ENV: &str = "SETTLE_STALE_AFTER_SECS";
pub const SETTLE_SWEEP_INTERVAL_SECS_ENV: &str = "SETTLE_SWEEP_INTERVAL_SECS";

/// Read a required environment variable, trimming whitespace.
///
/// Empty values count as missing.
pub fn env_required(name: &str) -> Result<String, MissingConfig> {
    env_optional(name).ok_or_else(|| MissingConfig(name.to_string()))
}

/// Read an optional environment variable, trimming whitespace.
pub fn env_optional(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        }
        Err(_) => None,
    }
}

/// Read an environment variable with a fallback default.
pub fn env_or_default(name: &str, default: &str) -> String {
    env_optional(name).unwrap_or_else(|| default.to_string())
}

/// Parse an environment variable as seconds, with a fallback default.
pub fn env_secs_or_default(name: &str, default_secs: u64) -> u64 {
    env_optional(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs)
}

/// A required configuration value was absent from the environment.
#[derive(Debug, thiserror::Error)]
#[error("configuration missing: {0}")]
pub struct MissingConfig(pub String);
