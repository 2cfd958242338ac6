// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Payment gateway contract bindings and the merchant credit client.

use std::str::FromStr;

use alloy::{
    network::EthereumWallet,
    primitives::{Address, U256},
    providers::{Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
};
use async_trait::async_trait;
use tracing::info;

// Gateway contract interface. `PaymentReceived` is emitted for every
// inbound payment; `creditMerchant` pays a merchant out in the settlement
// token, deduplicated contract-side on `txRef`.
sol! {
    #[sol(rpc)]
    interface IPaymentGateway {
        event PaymentReceived(
            address indexed payer,
            address indexed merchant,
            uint256 amount,
            string tokenSymbol,
            uint256 fiatEquivalent,
            string txRef,
            uint256 timestamp,
            string paymentType,
            string status,
            uint256 chargeFee
        );

        function creditMerchant(
            address merchant,
            uint256 amount,
            uint256 fee,
            string txRef
        ) external;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid signer key: {0}")]
    InvalidKey(String),

    #[error("invalid RPC URL: {0}")]
    InvalidRpcUrl(String),

    #[error("invalid base-unit amount: {0}")]
    InvalidAmount(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("contract error: {0}")]
    Contract(String),

    #[error("chain payouts not configured: {0}")]
    NotConfigured(String),
}

/// Seam for the on-chain payout channel; tests inject fakes.
#[async_trait]
pub trait ChainCredit: Send + Sync {
    /// Credit a merchant wallet with settlement-token base units.
    ///
    /// Returns the transaction hash once the transaction is mined.
    async fn credit_merchant(
        &self,
        wallet: &str,
        amount_base_units: &str,
        fee_base_units: &str,
        reference: &str,
    ) -> Result<String, GatewayError>;
}

/// Stand-in used when no signer key is configured.
///
/// Crypto settlements dispatched through it fail with a recorded error
/// while the fiat rail keeps working.
pub struct DisabledCredit;

#[async_trait]
impl ChainCredit for DisabledCredit {
    async fn credit_merchant(
        &self,
        _wallet: &str,
        _amount_base_units: &str,
        _fee_base_units: &str,
        _reference: &str,
    ) -> Result<String, GatewayError> {
        Err(GatewayError::NotConfigured(
            "no gateway signer key".to_string(),
        ))
    }
}

/// Build a read-only provider for the listener.
pub fn read_provider(rpc_url: &str) -> Result<impl Provider + Clone, GatewayError> {
    let url: url::Url = rpc_url
        .parse()
        .map_err(|e: url::ParseError| GatewayError::InvalidRpcUrl(e.to_string()))?;
    Ok(ProviderBuilder::new().connect_http(url))
}

/// Build a signing provider for `creditMerchant` calls.
pub fn signer_provider(
    rpc_url: &str,
    private_key_hex: &str,
) -> Result<impl Provider + Clone, GatewayError> {
    let url: url::Url = rpc_url
        .parse()
        .map_err(|e: url::ParseError| GatewayError::InvalidRpcUrl(e.to_string()))?;
    let signer = PrivateKeySigner::from_str(private_key_hex.trim())
        .map_err(|e| GatewayError::InvalidKey(e.to_string()))?;
    let wallet = EthereumWallet::from(signer);
    Ok(ProviderBuilder::new().wallet(wallet).connect_http(url))
}

/// Payment gateway contract wrapper.
pub struct GatewayClient<P> {
    contract: IPaymentGateway::IPaymentGatewayInstance<P>,
}

impl<P: Provider + Clone> GatewayClient<P> {
    pub fn new(provider: &P, contract_address: &str) -> Result<Self, GatewayError> {
        let address = Address::from_str(contract_address)
            .map_err(|e| GatewayError::InvalidAddress(e.to_string()))?;
        let contract = IPaymentGateway::new(address, provider.clone());
        Ok(Self { contract })
    }
}

#[async_trait]
impl<P: Provider + Clone + Send + Sync + 'static> ChainCredit for GatewayClient<P> {
    async fn credit_merchant(
        &self,
        wallet: &str,
        amount_base_units: &str,
        fee_base_units: &str,
        reference: &str,
    ) -> Result<String, GatewayError> {
        let merchant = Address::from_str(wallet)
            .map_err(|e| GatewayError::InvalidAddress(e.to_string()))?;
        let amount = U256::from_str_radix(amount_base_units, 10)
            .map_err(|e| GatewayError::InvalidAmount(e.to_string()))?;
        let fee = U256::from_str_radix(fee_base_units, 10)
            .map_err(|e| GatewayError::InvalidAmount(e.to_string()))?;

        let pending = self
            .contract
            .creditMerchant(merchant, amount, fee, reference.to_string())
            .send()
            .await
            .map_err(|e| GatewayError::Contract(e.to_string()))?;

        let hash = pending
            .watch()
            .await
            .map_err(|e| GatewayError::Rpc(e.to_string()))?;

        let tx_hash = format!("{hash:#x}");
        info!(
            merchant = %wallet,
            reference = %reference,
            tx_hash = %tx_hash,
            "merchant credited on-chain"
        );
        Ok(tx_hash)
    }
}
