//! Fake collaborators shared by the scenario tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, Bytes, LogData, B256, U256};
use async_trait::async_trait;

use vbank_relayer::chain::{EvmCapability, ExternalChainRpc, FeePolicy, OutboundBroadcaster};
use vbank_relayer::config::EngineConfig;
use vbank_relayer::engine::{Clock, Engine, EngineDeps, NativeAsset};
use vbank_relayer::error::EngineError;
use vbank_relayer::home::{AssetInfo, ConfirmedBroadcast, DepositSubmission, HomeChain};
use vbank_relayer::store::{MemoryStore, TxStore};
use vbank_relayer::types::{
    ExternalBlock, ExternalBlockHeader, ExternalTx, TxLog, TxReceipt, WaitingBroadcastRecord,
};

pub const CHAIN: &str = "ETH";

pub fn bridge() -> Address {
    Address::repeat_byte(0xbb)
}

pub fn member(n: u8) -> Address {
    Address::repeat_byte(n)
}

pub fn block_hash(height: u64, fork: u8) -> B256 {
    let mut bytes = [fork; 32];
    bytes[24..].copy_from_slice(&height.to_be_bytes());
    B256::from(bytes)
}

pub fn log_from(address: Address, data: LogData) -> TxLog {
    TxLog {
        address,
        topics: data.topics().to_vec(),
        data: data.data,
    }
}

pub fn receipt(tx_hash: B256, height: u64, success: bool, logs: Vec<TxLog>) -> TxReceipt {
    TxReceipt {
        tx_hash,
        block_height: height,
        success,
        logs,
    }
}

// ============================================================================
// Clock
// ============================================================================

pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self(AtomicU64::new(start_ms))
    }

    pub fn advance_ms(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_ms(secs * 1000);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// External chain
// ============================================================================

#[derive(Default)]
struct ChainState {
    height: u64,
    blocks: BTreeMap<u64, ExternalBlock>,
    receipts: HashMap<B256, TxReceipt>,
    mempool: HashMap<B256, ExternalTx>,
    minter: bool,
}

/// External chain whose blocks, receipts and height are set by the test
pub struct ScriptedChain {
    state: Mutex<ChainState>,
    fee_rate: u128,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState::default()),
            fee_rate: 1_000_000_000,
        }
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub fn set_minter(&self, minter: bool) {
        self.state.lock().unwrap().minter = minter;
    }

    /// Install a block at `height` on branch `fork`, chained to whatever sits at `height - 1`
    pub fn put_block(&self, height: u64, fork: u8, mut transactions: Vec<ExternalTx>) -> B256 {
        let mut state = self.state.lock().unwrap();
        let parent_hash = height
            .checked_sub(1)
            .and_then(|h| state.blocks.get(&h))
            .map(|b| b.hash)
            .unwrap_or_default();
        let hash = block_hash(height, fork);
        for tx in &mut transactions {
            tx.block_height = Some(height);
        }
        state.blocks.insert(
            height,
            ExternalBlock {
                height,
                hash,
                parent_hash,
                timestamp: 1_700_000_000 + height,
                transactions,
            },
        );
        if height > state.height {
            state.height = height;
        }
        hash
    }

    pub fn put_receipt(&self, receipt: TxReceipt) {
        self.state
            .lock()
            .unwrap()
            .receipts
            .insert(receipt.tx_hash, receipt);
    }

    pub fn remove_receipt(&self, tx_hash: B256) {
        self.state.lock().unwrap().receipts.remove(&tx_hash);
    }

    pub fn put_pending(&self, tx: ExternalTx) {
        self.state.lock().unwrap().mempool.insert(tx.hash, tx);
    }
}

#[async_trait]
impl ExternalChainRpc for ScriptedChain {
    async fn current_height(&self) -> Result<u64, EngineError> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<ExternalBlock>, EngineError> {
        Ok(self.state.lock().unwrap().blocks.get(&height).cloned())
    }

    async fn header_by_height(
        &self,
        height: u64,
    ) -> Result<Option<ExternalBlockHeader>, EngineError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .blocks
            .get(&height)
            .map(|b| b.header()))
    }

    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<ExternalTx>, EngineError> {
        let state = self.state.lock().unwrap();
        let mined = state
            .blocks
            .values()
            .flat_map(|b| b.transactions.iter())
            .find(|tx| tx.hash == hash)
            .cloned();
        Ok(mined.or_else(|| state.mempool.get(&hash).cloned()))
    }

    async fn receipt_by_hash(&self, hash: B256) -> Result<Option<TxReceipt>, EngineError> {
        Ok(self.state.lock().unwrap().receipts.get(&hash).cloned())
    }

    async fn call_view(&self, _contract: Address, _data: Bytes) -> Result<Bytes, EngineError> {
        let mut word = [0u8; 32];
        word[31] = self.state.lock().unwrap().minter as u8;
        Ok(Bytes::from(word.to_vec()))
    }

    async fn current_fee_rate(&self) -> Result<u128, EngineError> {
        Ok(self.fee_rate)
    }
}

// ============================================================================
// Home chain
// ============================================================================

#[derive(Default)]
struct HomeState {
    height: u64,
    not_member: bool,
    roster_change: bool,
    assets: HashMap<Address, AssetInfo>,
    on_chain_deposits: HashSet<B256>,
    submit_attempts: Vec<DepositSubmission>,
    pending_deposits: Vec<DepositSubmission>,
    confirmed: Vec<ConfirmedBroadcast>,
    pending_withdraws: Vec<(String, B256)>,
    finalized: HashSet<String>,
    regains: usize,
}

/// Home chain that records every callback
pub struct RecordingHome {
    state: Mutex<HomeState>,
}

impl RecordingHome {
    pub fn new(height: u64) -> Self {
        Self {
            state: Mutex::new(HomeState {
                height,
                ..Default::default()
            }),
        }
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub fn set_member(&self, member: bool) {
        self.state.lock().unwrap().not_member = !member;
    }

    pub fn register_asset(&self, token: Address, info: AssetInfo) {
        self.state.lock().unwrap().assets.insert(token, info);
    }

    /// Simulate another relayer having already submitted this deposit
    pub fn mark_deposited(&self, hash: B256) {
        self.state.lock().unwrap().on_chain_deposits.insert(hash);
    }

    pub fn finalize(&self, nerve_tx_hash: &str) {
        self.state
            .lock()
            .unwrap()
            .finalized
            .insert(nerve_tx_hash.to_string());
    }

    pub fn submit_attempts(&self) -> Vec<DepositSubmission> {
        self.state.lock().unwrap().submit_attempts.clone()
    }

    pub fn on_chain_deposits(&self) -> usize {
        self.state.lock().unwrap().on_chain_deposits.len()
    }

    pub fn pending_deposits(&self) -> usize {
        self.state.lock().unwrap().pending_deposits.len()
    }

    pub fn confirmations(&self) -> Vec<ConfirmedBroadcast> {
        self.state.lock().unwrap().confirmed.clone()
    }

    pub fn pending_withdraws(&self) -> Vec<(String, B256)> {
        self.state.lock().unwrap().pending_withdraws.clone()
    }

    pub fn regains(&self) -> usize {
        self.state.lock().unwrap().regains
    }
}

#[async_trait]
impl HomeChain for RecordingHome {
    async fn current_height(&self) -> Result<u64, EngineError> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn is_virtual_bank_member(&self, _member: &Address) -> Result<bool, EngineError> {
        Ok(!self.state.lock().unwrap().not_member)
    }

    async fn has_pending_roster_change(&self) -> Result<bool, EngineError> {
        Ok(self.state.lock().unwrap().roster_change)
    }

    async fn asset_info(
        &self,
        contract: Option<Address>,
    ) -> Result<Option<AssetInfo>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(contract.and_then(|c| state.assets.get(&c).cloned()))
    }

    async fn pending_deposit(&self, deposit: &DepositSubmission) -> Result<(), EngineError> {
        self.state
            .lock()
            .unwrap()
            .pending_deposits
            .push(deposit.clone());
        Ok(())
    }

    async fn submit_deposit(&self, deposit: &DepositSubmission) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.submit_attempts.push(deposit.clone());
        if !state.on_chain_deposits.insert(deposit.external_tx_hash) {
            return Err(EngineError::AlreadyExists(format!(
                "deposit {} already exists",
                deposit.external_tx_hash
            )));
        }
        Ok(format!("nerve-{}", deposit.external_tx_hash))
    }

    async fn confirmed(&self, broadcast: &ConfirmedBroadcast) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if state
            .confirmed
            .iter()
            .any(|c| c.nerve_tx_hash == broadcast.nerve_tx_hash)
        {
            return Err(EngineError::AlreadyExists("already confirmed".into()));
        }
        state.confirmed.push(broadcast.clone());
        Ok(())
    }

    async fn pending_withdraw(
        &self,
        nerve_tx_hash: &str,
        external_tx_hash: B256,
    ) -> Result<(), EngineError> {
        self.state
            .lock()
            .unwrap()
            .pending_withdraws
            .push((nerve_tx_hash.to_string(), external_tx_hash));
        Ok(())
    }

    async fn is_finalized(&self, nerve_tx_hash: &str) -> Result<bool, EngineError> {
        Ok(self.state.lock().unwrap().finalized.contains(nerve_tx_hash))
    }

    async fn regain_signatures(
        &self,
        _nerve_tx_hash: &str,
        _max_signers: usize,
    ) -> Result<Bytes, EngineError> {
        self.state.lock().unwrap().regains += 1;
        Ok(Bytes::from(vec![0xaa; 65 * 3]))
    }
}

// ============================================================================
// Broadcaster
// ============================================================================

/// Broadcaster replaying scripted outcomes; succeeds with a fresh hash once the script runs out
pub struct ScriptedBroadcaster {
    address: Address,
    script: Mutex<VecDeque<Result<B256, EngineError>>>,
    calls: Mutex<Vec<(String, u128)>>,
    counter: AtomicU64,
}

impl ScriptedBroadcaster {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn push(&self, outcome: Result<B256, EngineError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn fail_always(&self, error: EngineError, times: usize) {
        for _ in 0..times {
            self.push(Err(error.clone()));
        }
    }

    /// `(nerve_tx_hash, fee_rate)` of every attempt
    pub fn calls(&self) -> Vec<(String, u128)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundBroadcaster for ScriptedBroadcaster {
    fn sender_address(&self) -> Address {
        self.address
    }

    async fn broadcast(
        &self,
        record: &WaitingBroadcastRecord,
        fee_rate: u128,
    ) -> Result<B256, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .push((record.nerve_tx_hash.clone(), fee_rate));
        match self.script.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(B256::left_padding_from(&n.to_be_bytes()))
            }
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub chain: Arc<ScriptedChain>,
    pub home: Arc<RecordingHome>,
    pub broadcaster: Arc<ScriptedBroadcaster>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub engine: Engine,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        confirmations: 30,
        skip_backlog_on_start: false,
        resend_max: 3,
        ..EngineConfig::default()
    }
}

impl Harness {
    pub fn new(me: Address, config: EngineConfig) -> Self {
        Self::with_store(me, config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(me: Address, config: EngineConfig, store: Arc<MemoryStore>) -> Self {
        let chain = Arc::new(ScriptedChain::new());
        let home = Arc::new(RecordingHome::new(100));
        let broadcaster = Arc::new(ScriptedBroadcaster::new(me));
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let capability = Arc::new(EvmCapability::new(CHAIN, bridge(), FeePolicy::default()));

        let deps = EngineDeps {
            rpc: chain.clone(),
            home: home.clone(),
            capability,
            broadcaster: broadcaster.clone(),
            store: store.clone() as Arc<dyn TxStore>,
            clock: clock.clone(),
        };
        let native = NativeAsset {
            asset_id: 1,
            decimals: 18,
        };

        Self {
            chain,
            home,
            broadcaster,
            store,
            clock,
            engine: Engine::new(deps, config, native),
        }
    }
}

/// A plain value transfer into the bridge
pub fn native_transfer(hash: B256, from: Address, value: u64) -> ExternalTx {
    ExternalTx {
        hash,
        from,
        to: Some(bridge()),
        value: U256::from(value),
        input: Bytes::new(),
        block_height: None,
    }
}

pub fn call_to(hash: B256, from: Address, to: Address, input: Vec<u8>) -> ExternalTx {
    ExternalTx {
        hash,
        from,
        to: Some(to),
        value: U256::ZERO,
        input: Bytes::from(input),
        block_height: None,
    }
}
