//! JSON-RPC read client for EVM chains

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use super::ExternalChainRpc;
use crate::error::{classify_error, EngineError};
use crate::types::{ExternalBlock, ExternalBlockHeader, ExternalTx, TxLog, TxReceipt};

/// EVM RPC response wrapper
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

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcHeader {
    number: String,
    hash: B256,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: String,
    hash: B256,
    parent_hash: B256,
    timestamp: String,
    #[serde(default)]
    transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: B256,
    from: Address,
    to: Option<Address>,
    value: String,
    input: Bytes,
    block_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    block_number: Option<String>,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Debug, Deserialize)]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
}

fn parse_quantity(hex: &str) -> Result<u64, EngineError> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| EngineError::Transient(format!("bad quantity {}: {}", hex, e)))
}

fn parse_u256(hex: &str) -> Result<U256, EngineError> {
    U256::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| EngineError::Transient(format!("bad value {}: {}", hex, e)))
}

impl RpcTransaction {
    fn into_external(self) -> Result<ExternalTx, EngineError> {
        Ok(ExternalTx {
            hash: self.hash,
            from: self.from,
            to: self.to,
            value: parse_u256(&self.value)?,
            input: self.input,
            block_height: self.block_number.as_deref().map(parse_quantity).transpose()?,
        })
    }
}

/// Read-side client speaking plain Ethereum JSON-RPC
///
/// Endpoints are tried in order; a transport failure moves on to the next
/// one. Errors reported by a node are returned as-is.
pub struct EvmJsonRpc {
    rpc_urls: Vec<String>,
    client: Client,
}

impl EvmJsonRpc {
    pub fn new(rpc_urls: Vec<String>) -> eyre::Result<Self> {
        if rpc_urls.is_empty() {
            return Err(eyre::eyre!("At least one RPC URL is required"));
        }
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self { rpc_urls, client })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<RpcResponse<T>, reqwest::Error> {
        self.client
            .post(url)
            .json(body)
            .send()
            .await?
            .json::<RpcResponse<T>>()
            .await
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

        let mut last_error = None;
        for (endpoint, url) in self.rpc_urls.iter().enumerate() {
            let response = match self.post::<T>(url, &body).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(endpoint, method, error = %e, "RPC endpoint unreachable, trying next");
                    last_error = Some(e);
                    continue;
                }
            };

            if let Some(error) = response.error {
                return Err(classify_error(&format!(
                    "{}: RPC error {} - {}",
                    method, error.code, error.message
                )));
            }
            return Ok(response.result);
        }

        Err(match last_error {
            Some(e) => e.into(),
            None => EngineError::Transient(format!("{}: no RPC endpoint answered", method)),
        })
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
impl ExternalChainRpc for EvmJsonRpc {
    async fn current_height(&self) -> Result<u64, EngineError> {
        let hex: String = self
            .call_required("eth_blockNumber", serde_json::json!([]))
            .await?;
        parse_quantity(&hex)
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<ExternalBlock>, EngineError> {
        let block: Option<RpcBlock> = self
            .call(
                "eth_getBlockByNumber",
                serde_json::json!([format!("{:#x}", height), true]),
            )
            .await?;

        let Some(block) = block else {
            return Ok(None);
        };

        let transactions = block
            .transactions
            .into_iter()
            .map(RpcTransaction::into_external)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ExternalBlock {
            height: parse_quantity(&block.number)?,
            hash: block.hash,
            parent_hash: block.parent_hash,
            timestamp: parse_quantity(&block.timestamp)?,
            transactions,
        }))
    }

    async fn header_by_height(
        &self,
        height: u64,
    ) -> Result<Option<ExternalBlockHeader>, EngineError> {
        let header: Option<RpcHeader> = self
            .call(
                "eth_getBlockByNumber",
                serde_json::json!([format!("{:#x}", height), false]),
            )
            .await?;

        header
            .map(|h| {
                Ok(ExternalBlockHeader {
                    height: parse_quantity(&h.number)?,
                    hash: h.hash,
                })
            })
            .transpose()
    }

    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<ExternalTx>, EngineError> {
        let tx: Option<RpcTransaction> = self
            .call("eth_getTransactionByHash", serde_json::json!([hash]))
            .await?;
        tx.map(RpcTransaction::into_external).transpose()
    }

    async fn receipt_by_hash(&self, hash: B256) -> Result<Option<TxReceipt>, EngineError> {
        let receipt: Option<RpcReceipt> = self
            .call("eth_getTransactionReceipt", serde_json::json!([hash]))
            .await?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        // Pending receipts from some nodes carry no block number
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        Ok(Some(TxReceipt {
            tx_hash: receipt.transaction_hash,
            block_height: parse_quantity(&block_number)?,
            success: receipt.status.as_deref() == Some("0x1"),
            logs: receipt
                .logs
                .into_iter()
                .map(|log| TxLog {
                    address: log.address,
                    topics: log.topics,
                    data: log.data,
                })
                .collect(),
        }))
    }

    async fn call_view(&self, contract: Address, data: Bytes) -> Result<Bytes, EngineError> {
        self.call_required(
            "eth_call",
            serde_json::json!([{ "to": contract, "data": data }, "latest"]),
        )
        .await
    }

    async fn current_fee_rate(&self) -> Result<u128, EngineError> {
        let hex: String = self.call_required("eth_gasPrice", serde_json::json!([])).await?;
        u128::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|e| EngineError::Transient(format!("bad gas price {}: {}", hex, e)))
    }
}
