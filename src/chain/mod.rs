//! External chain collaborators
//!
//! The engine is generic over three seams:
//! - [`ExternalChainRpc`]: wire-level reads and raw submission
//! - [`ChainCapability`]: pure per-family decoding of calldata and events
//! - [`OutboundBroadcaster`]: signing and sending a committee transaction
//!
//! The EVM family implements all three.

pub mod broadcaster;
pub mod evm;
pub mod fee;
pub mod rpc;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::error::EngineError;
use crate::types::{
    ExternalBlock, ExternalBlockHeader, ExternalTx, TxReceipt, TxType, WaitingBroadcastRecord,
};

pub use broadcaster::EvmBroadcaster;
pub use evm::EvmCapability;
pub use fee::FeePolicy;
pub use rpc::EvmJsonRpc;

/// Read and submit access to an external chain
#[async_trait]
pub trait ExternalChainRpc: Send + Sync {
    async fn current_height(&self) -> Result<u64, EngineError>;

    async fn block_by_height(&self, height: u64) -> Result<Option<ExternalBlock>, EngineError>;

    async fn header_by_height(
        &self,
        height: u64,
    ) -> Result<Option<ExternalBlockHeader>, EngineError>;

    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<ExternalTx>, EngineError>;

    async fn receipt_by_hash(&self, hash: B256) -> Result<Option<TxReceipt>, EngineError>;

    /// Read-only contract call
    async fn call_view(&self, contract: Address, data: Bytes) -> Result<Bytes, EngineError>;

    async fn current_fee_rate(&self) -> Result<u128, EngineError>;
}

/// Arguments of a deposit made through the bridge contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositCall {
    /// Recipient on the home chain
    pub home_address: String,
    pub amount: U256,
    /// `None` for the native asset
    pub erc20: Option<Address>,
}

/// Deposit facts recovered from receipt logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositEvent {
    pub from: Address,
    pub amount: U256,
    pub erc20: Option<Address>,
    pub home_address: Option<String>,
}

/// Outbound broadcast recognised from calldata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastCall {
    pub tx_type: TxType,
    /// Home-chain transaction key
    pub nerve_tx_hash: String,
}

/// Per-family decoding rules the classifier and resend engine need
pub trait ChainCapability: Send + Sync {
    fn chain_name(&self) -> &str;

    fn bridge_address(&self) -> Address;

    /// Canonical textual form used towards the home chain
    fn format_address(&self, address: &Address) -> String;

    fn decode_bridge_deposit(&self, input: &[u8]) -> Option<DepositCall>;

    /// The bridge's deposit event in a receipt
    fn bridge_deposit_event(&self, receipt: &TxReceipt) -> Option<DepositEvent>;

    /// The bridge's "funds received" event for plain native transfers
    fn native_funds_event(&self, receipt: &TxReceipt) -> Option<DepositEvent>;

    /// `(recipient, amount)` of a token transfer call
    fn decode_token_transfer(&self, input: &[u8]) -> Option<(Address, U256)>;

    /// Amount moved by a `token` transfer log from `from` to `to`
    fn token_transfer_event(
        &self,
        receipt: &TxReceipt,
        token: Address,
        from: Address,
        to: Address,
    ) -> Option<U256>;

    fn decode_broadcast(&self, input: &[u8]) -> Option<BroadcastCall>;

    /// Signers from the completion event for `nerve_tx_hash`; `None` if not yet final
    fn completion_signers(
        &self,
        receipt: &TxReceipt,
        tx_type: TxType,
        nerve_tx_hash: &str,
    ) -> Option<Vec<Address>>;

    /// Calldata asking the bridge whether it mints `token`
    fn minter_query(&self, token: Address) -> Bytes;

    fn decode_minter_result(&self, data: &[u8]) -> Result<bool, EngineError>;

    fn escalate_fee(&self, base: u128, attempt: u32) -> u128;
}

/// Signs and sends an outbound committee transaction as this member
#[async_trait]
pub trait OutboundBroadcaster: Send + Sync {
    fn sender_address(&self) -> Address;

    async fn broadcast(
        &self,
        record: &WaitingBroadcastRecord,
        fee_rate: u128,
    ) -> Result<B256, EngineError>;
}
