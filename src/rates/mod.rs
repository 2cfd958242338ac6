// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Price Conversion Service
//!
//! Converts amounts between currencies during settlement. Only explicitly
//! supported pairs convert; there is no chained inference through an
//! intermediate currency. `from == to` is the identity and touches no
//! source.
//!
//! Two sources ship by default: a fixed fiat/fiat table configured via
//! `FIAT_RATES` (e.g. `USD:NGN=1500,USDT:NGN=1500`) and an HTTP price feed
//! for crypto pairs. Both sit behind [`RateSource`] so tests inject fakes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("no conversion rate configured for {from} -> {to}")]
    UnsupportedPair { from: String, to: String },

    #[error("price feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error("conversion overflow for {0}")]
    Overflow(Decimal),
}

/// Malformed `FIAT_RATES` entry.
#[derive(Debug, thiserror::Error)]
#[error("invalid rate entry `{0}`, expected FROM:TO=RATE")]
pub struct RateSpecError(String);

/// A source of exchange rates for explicit currency pairs.
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Rate for one unit of `from` in `to`.
    ///
    /// `Ok(None)` means this source does not carry the pair; a transport
    /// or feed failure is an error.
    async fn rate(&self, from: &str, to: &str) -> Result<Option<Decimal>, ConvertError>;
}

// =============================================================================
// Fixed fiat/fiat table
// =============================================================================

/// Operator-configured rate table, parsed from `FIAT_RATES`.
pub struct FixedRates {
    rates: HashMap<(String, String), Decimal>,
}

impl FixedRates {
    /// Parse a spec like `USD:NGN=1500,USDT:NGN=1500.25`.
    pub fn parse(spec: &str) -> Result<Self, RateSpecError> {
        let mut rates = HashMap::new();
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let parsed = entry.split_once('=').and_then(|(pair, rate)| {
                let (from, to) = pair.split_once(':')?;
                let rate: Decimal = rate.trim().parse().ok()?;
                Some((
                    from.trim().to_ascii_uppercase(),
                    to.trim().to_ascii_uppercase(),
                    rate,
                ))
            });
            let (from, to, rate) = parsed.ok_or_else(|| RateSpecError(entry.to_string()))?;
            rates.insert((from, to), rate);
        }
        Ok(Self { rates })
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

#[async_trait]
impl RateSource for FixedRates {
    async fn rate(&self, from: &str, to: &str) -> Result<Option<Decimal>, ConvertError> {
        Ok(self
            .rates
            .get(&(from.to_string(), to.to_string()))
            .copied())
    }
}

// =============================================================================
// HTTP price feed
// =============================================================================

#[derive(Deserialize)]
struct RateResponse {
    rate: Decimal,
}

/// Price feed client for crypto pairs: `GET {base}/rates?base=X&quote=Y`.
pub struct HttpRateFeed {
    base_url: String,
    http: Client,
}

impl HttpRateFeed {
    pub fn new(base_url: String) -> Result<Self, ConvertError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConvertError::FeedUnavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl RateSource for HttpRateFeed {
    async fn rate(&self, from: &str, to: &str) -> Result<Option<Decimal>, ConvertError> {
        let response = self
            .http
            .get(format!("{}/rates", self.base_url))
            .query(&[("base", from), ("quote", to)])
            .send()
            .await
            .map_err(|e| ConvertError::FeedUnavailable(format!("rate request failed: {e}")))?;

        // The feed answers 404 for pairs it does not quote.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ConvertError::FeedUnavailable(format!(
                "rate request returned {status}: {body}"
            )));
        }

        let parsed: RateResponse = response
            .json()
            .await
            .map_err(|e| ConvertError::FeedUnavailable(format!("invalid rate response: {e}")))?;
        Ok(Some(parsed.rate))
    }
}

// =============================================================================
// ConversionService
// =============================================================================

/// Converts settlement amounts by asking its sources in order.
pub struct ConversionService {
    sources: Vec<Arc<dyn RateSource>>,
}

impl ConversionService {
    pub fn new(sources: Vec<Arc<dyn RateSource>>) -> Self {
        Self { sources }
    }

    /// Convert `amount` from one currency to another.
    ///
    /// The first source that carries the pair wins. A source failure is
    /// propagated rather than silently falling through — a settlement must
    /// not be priced off a secondary source the operator did not choose.
    pub async fn convert(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<Decimal, ConvertError> {
        let from = from.trim().to_ascii_uppercase();
        let to = to.trim().to_ascii_uppercase();

        if from == to {
            return Ok(amount);
        }

        for source in &self.sources {
            if let Some(rate) = source.rate(&from, &to).await? {
                debug!(%from, %to, %rate, "conversion rate resolved");
                return amount
                    .checked_mul(rate)
                    .ok_or(ConvertError::Overflow(amount));
            }
        }

        Err(ConvertError::UnsupportedPair { from, to })
    }
}

// =============================================================================
// Tests
// =============================================================================
