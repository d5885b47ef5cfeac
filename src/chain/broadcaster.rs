//! Signing broadcaster for committee transactions on EVM chains

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::str::FromStr;
use tracing::{debug, info};

use super::OutboundBroadcaster;
use crate::contracts::bridge::VirtualBankMultiSig;
use crate::error::{classify_error, EngineError};
use crate::types::{BroadcastPayload, WaitingBroadcastRecord};

/// Sends `createOrSign*` calls to the multisig bridge as this committee member
pub struct EvmBroadcaster {
    signer: PrivateKeySigner,
    rpc_url: reqwest::Url,
    bridge_address: Address,
}

impl EvmBroadcaster {
    pub fn new(rpc_url: &str, bridge_address: &str, private_key: &str) -> Result<Self> {
        let bridge_address =
            Address::from_str(bridge_address).wrap_err("Invalid bridge address")?;
        let signer: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;
        let rpc_url = rpc_url.parse().wrap_err("Invalid RPC URL")?;

        info!(
            member_address = %signer.address(),
            bridge_address = %bridge_address,
            "EVM broadcaster initialized"
        );

        Ok(Self {
            signer,
            rpc_url,
            bridge_address,
        })
    }
}

fn send_error(e: impl std::fmt::Display) -> EngineError {
    classify_error(&format!("Failed to send transaction: {}", e))
}

#[async_trait]
impl OutboundBroadcaster for EvmBroadcaster {
    fn sender_address(&self) -> Address {
        self.signer.address()
    }

    async fn broadcast(
        &self,
        record: &WaitingBroadcastRecord,
        fee_rate: u128,
    ) -> Result<B256, EngineError> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());
        let contract = VirtualBankMultiSig::new(self.bridge_address, &provider);
        let tx_key = record.nerve_tx_hash.clone();
        let signatures = record.signatures.clone();

        debug!(
            nerve_tx_hash = %record.nerve_tx_hash,
            tx_type = %record.tx_type,
            fee_rate,
            "Broadcasting multisig transaction"
        );

        let pending = match &record.payload {
            BroadcastPayload::Withdraw {
                to,
                amount,
                is_contract_asset,
                erc20,
            } => contract
                .createOrSignWithdraw(tx_key, *to, *amount, *is_contract_asset, *erc20, signatures)
                .gas_price(fee_rate)
                .send()
                .await
                .map_err(send_error)?,
            BroadcastPayload::Change {
                adds,
                removes,
                count,
            }
            | BroadcastPayload::Recovery {
                adds,
                removes,
                count,
            } => contract
                .createOrSignManagerChange(tx_key, adds.clone(), removes.clone(), *count, signatures)
                .gas_price(fee_rate)
                .send()
                .await
                .map_err(send_error)?,
            BroadcastPayload::Upgrade { contract: target } => contract
                .createOrSignUpgrade(tx_key, *target, signatures)
                .gas_price(fee_rate)
                .send()
                .await
                .map_err(send_error)?,
        };

        let tx_hash = *pending.tx_hash();
        info!(
            tx_hash = %tx_hash,
            nerve_tx_hash = %record.nerve_tx_hash,
            "Multisig transaction sent"
        );
        Ok(tx_hash)
    }
}
