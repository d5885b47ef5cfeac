//! Home chain collaborator
//!
//! Everything the engine needs from the home network: committee membership,
//! asset registry lookups, deposit submission and broadcast confirmation.
//! Every call is idempotent from the engine's side; a duplicate submission
//! surfaces as [`EngineError::AlreadyExists`].

pub mod rpc;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::TxType;

pub use rpc::HomeRpcClient;

/// Home-chain registration of an external asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInfo {
    pub asset_id: u32,
    pub decimals: u8,
    /// Bound assets are minted by the bridge and must be registered as minters on chain
    pub bound: bool,
}

/// Deposit handed to the home chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositSubmission {
    pub external_tx_hash: B256,
    pub height: u64,
    pub from: String,
    pub to: String,
    pub value: U256,
    pub tx_time: u64,
    pub decimals: u8,
    pub is_contract_asset: bool,
    pub contract_address: Option<String>,
    pub asset_id: u32,
}

/// Final on-chain state of an outbound broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedBroadcast {
    pub tx_type: TxType,
    pub nerve_tx_hash: String,
    pub external_tx_hash: B256,
    pub height: u64,
    pub tx_time: u64,
    pub multisig_address: String,
    pub signers: Vec<String>,
}

#[async_trait]
pub trait HomeChain: Send + Sync {
    async fn current_height(&self) -> Result<u64, EngineError>;

    /// Whether `member` currently sits on the virtual bank committee
    async fn is_virtual_bank_member(&self, member: &Address) -> Result<bool, EngineError>;

    /// Whether a committee change is in flight
    async fn has_pending_roster_change(&self) -> Result<bool, EngineError>;

    /// `None` for the native asset
    async fn asset_info(&self, contract: Option<Address>)
        -> Result<Option<AssetInfo>, EngineError>;

    /// Early notice of a deposit that has not reached confirmation depth
    async fn pending_deposit(&self, deposit: &DepositSubmission) -> Result<(), EngineError>;

    /// Submit a confirmed deposit, returning the home-chain transaction hash
    async fn submit_deposit(&self, deposit: &DepositSubmission) -> Result<String, EngineError>;

    async fn confirmed(&self, broadcast: &ConfirmedBroadcast) -> Result<(), EngineError>;

    async fn pending_withdraw(
        &self,
        nerve_tx_hash: &str,
        external_tx_hash: B256,
    ) -> Result<(), EngineError>;

    /// Whether the home chain already records the outbound transaction as final
    async fn is_finalized(&self, nerve_tx_hash: &str) -> Result<bool, EngineError>;

    /// Ask the rest of the committee for counter-signatures
    async fn regain_signatures(
        &self,
        nerve_tx_hash: &str,
        max_signers: usize,
    ) -> Result<Bytes, EngineError>;
}
