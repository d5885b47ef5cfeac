//! JSON-RPC client for the home chain node

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use super::{AssetInfo, ConfirmedBroadcast, DepositSubmission, HomeChain};
use crate::error::{classify_error, EngineError};

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Home node client; every call is scoped to one external chain id
pub struct HomeRpcClient {
    rpc_url: String,
    chain_id: u64,
    client: Client,
}

impl HomeRpcClient {
    pub fn new(rpc_url: impl Into<String>, chain_id: u64) -> eyre::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            rpc_url: rpc_url.into(),
            chain_id,
            client,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, EngineError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .json::<RpcResponse<T>>()
            .await?;

        if let Some(error) = response.error {
            return Err(classify_error(&format!(
                "{}: {} - {}",
                method, error.code, error.message
            )));
        }

        Ok(response.result)
    }

    async fn call_required<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, EngineError> {
        self.call(method, params)
            .await?
            .ok_or_else(|| EngineError::Transient(format!("{} returned no result", method)))
    }
}

#[async_trait]
impl HomeChain for HomeRpcClient {
    async fn current_height(&self) -> Result<u64, EngineError> {
        self.call_required("cv_currentHeight", serde_json::json!([]))
            .await
    }

    async fn is_virtual_bank_member(&self, member: &Address) -> Result<bool, EngineError> {
        self.call_required(
            "cv_isVirtualBankMember",
            serde_json::json!([self.chain_id, member]),
        )
        .await
    }

    async fn has_pending_roster_change(&self) -> Result<bool, EngineError> {
        self.call_required("cv_hasPendingRosterChange", serde_json::json!([]))
            .await
    }

    async fn asset_info(
        &self,
        contract: Option<Address>,
    ) -> Result<Option<AssetInfo>, EngineError> {
        self.call("cv_assetInfo", serde_json::json!([self.chain_id, contract]))
            .await
    }

    async fn pending_deposit(&self, deposit: &DepositSubmission) -> Result<(), EngineError> {
        let _: Option<serde_json::Value> = self
            .call("cv_pendingDeposit", serde_json::json!([self.chain_id, deposit]))
            .await?;
        Ok(())
    }

    async fn submit_deposit(&self, deposit: &DepositSubmission) -> Result<String, EngineError> {
        self.call_required("cv_submitDeposit", serde_json::json!([self.chain_id, deposit]))
            .await
    }

    async fn confirmed(&self, broadcast: &ConfirmedBroadcast) -> Result<(), EngineError> {
        let _: Option<serde_json::Value> = self
            .call(
                "cv_confirmBroadcast",
                serde_json::json!([self.chain_id, broadcast]),
            )
            .await?;
        Ok(())
    }

    async fn pending_withdraw(
        &self,
        nerve_tx_hash: &str,
        external_tx_hash: B256,
    ) -> Result<(), EngineError> {
        let _: Option<serde_json::Value> = self
            .call(
                "cv_pendingWithdraw",
                serde_json::json!([self.chain_id, nerve_tx_hash, external_tx_hash]),
            )
            .await?;
        Ok(())
    }

    async fn is_finalized(&self, nerve_tx_hash: &str) -> Result<bool, EngineError> {
        self.call_required(
            "cv_isFinalized",
            serde_json::json!([self.chain_id, nerve_tx_hash]),
        )
        .await
    }

    async fn regain_signatures(
        &self,
        nerve_tx_hash: &str,
        max_signers: usize,
    ) -> Result<Bytes, EngineError> {
        self.call_required(
            "cv_regainSignatures",
            serde_json::json!([self.chain_id, nerve_tx_hash, max_signers]),
        )
        .await
    }
}
