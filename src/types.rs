//! Data model of the relay engine
//!
//! Canonical shapes for external-chain blocks and transactions, the records
//! tracked by the confirmation and waiting queues, and the committee roster
//! snapshot used to order outbound broadcasts.

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

// ============================================================================
// Transaction classification
// ============================================================================

/// Kind of bridge transaction observed on the external chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Deposit,
    Withdraw,
    Change,
    Upgrade,
    Recovery,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Deposit => "deposit",
            TxType::Withdraw => "withdraw",
            TxType::Change => "change",
            TxType::Upgrade => "upgrade",
            TxType::Recovery => "recovery",
        }
    }

    /// Outbound multisig broadcasts, as opposed to inbound deposits
    pub fn is_broadcast(&self) -> bool {
        !matches!(self, TxType::Deposit)
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TxType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TxType::Deposit),
            "withdraw" => Ok(TxType::Withdraw),
            "change" => Ok(TxType::Change),
            "upgrade" => Ok(TxType::Upgrade),
            "recovery" => Ok(TxType::Recovery),
            other => Err(EngineError::Fatal(format!("unknown tx type: {}", other))),
        }
    }
}

/// Lifecycle of an unconfirmed record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// Seen, not yet sent or completed
    Initial,
    /// A broadcast is in flight
    Doing,
    /// The broadcast failed on chain
    Failed,
    /// Needs to be sent again
    Resend,
    /// Final signed state observed on chain
    Completed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Initial => "initial",
            TxStatus::Doing => "doing",
            TxStatus::Failed => "failed",
            TxStatus::Resend => "resend",
            TxStatus::Completed => "completed",
        }
    }

    /// Transitions are monotonic: nothing moves back to `Initial`
    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        next != TxStatus::Initial || *self == TxStatus::Initial
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(TxStatus::Initial),
            "doing" => Ok(TxStatus::Doing),
            "failed" => Ok(TxStatus::Failed),
            "resend" => Ok(TxStatus::Resend),
            "completed" => Ok(TxStatus::Completed),
            other => Err(EngineError::Fatal(format!("unknown tx status: {}", other))),
        }
    }
}

// ============================================================================
// External chain shapes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalBlockHeader {
    pub height: u64,
    pub hash: B256,
}

/// A transaction as returned by the external chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTx {
    pub hash: B256,
    pub from: Address,
    /// `None` for contract creation
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub block_height: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalBlock {
    pub height: u64,
    pub hash: B256,
    pub parent_hash: B256,
    /// Block timestamp in unix seconds
    pub timestamp: u64,
    pub transactions: Vec<ExternalTx>,
}

impl ExternalBlock {
    pub fn header(&self) -> ExternalBlockHeader {
        ExternalBlockHeader {
            height: self.height,
            hash: self.hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_height: u64,
    pub success: bool,
    pub logs: Vec<TxLog>,
}

// ============================================================================
// Unconfirmed records
// ============================================================================

/// A matched external transaction waiting for confirmation depth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconfirmedTxRecord {
    pub external_tx_hash: B256,
    /// Home-chain key: assigned on submit for deposits, decoded from calldata for broadcasts
    pub nerve_tx_hash: Option<String>,
    pub tx_type: TxType,
    pub block_height: Option<u64>,
    pub from: Address,
    /// Recipient on the home chain, when the external transaction names one
    pub to: Option<String>,
    pub value: U256,
    pub decimals: u8,
    pub is_contract_asset: bool,
    pub contract_address: Option<Address>,
    pub asset_id: u32,
    /// Unix millis when this node first tracked the record
    pub create_time: u64,
    /// Block timestamp in unix seconds, once known
    pub tx_time: Option<u64>,
    pub status: TxStatus,
    pub validated: bool,
    pub skip_rounds: u32,
    pub resend_count: u32,
    pub delete_flag: bool,
    pub delete_height: Option<u64>,
    pub signers: Vec<Address>,
}

impl UnconfirmedTxRecord {
    pub fn new(external_tx_hash: B256, tx_type: TxType, from: Address, create_time: u64) -> Self {
        Self {
            external_tx_hash,
            nerve_tx_hash: None,
            tx_type,
            block_height: None,
            from,
            to: None,
            value: U256::ZERO,
            decimals: 0,
            is_contract_asset: false,
            contract_address: None,
            asset_id: 0,
            create_time,
            tx_time: None,
            status: TxStatus::Initial,
            validated: false,
            skip_rounds: 0,
            resend_count: 0,
            delete_flag: false,
            delete_height: None,
            signers: Vec::new(),
        }
    }

    pub fn set_status(&mut self, next: TxStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Validation(format!(
                "illegal status transition {} -> {} for {}",
                self.status, next, self.external_tx_hash
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Tombstone the record until the home chain passes `home_height + window`
    pub fn mark_deleted(&mut self, home_height: u64, window: u64) {
        self.delete_flag = true;
        self.delete_height = Some(home_height.saturating_add(window));
    }

    pub fn is_purgeable(&self, home_height: u64) -> bool {
        self.delete_flag && self.delete_height.map_or(true, |h| home_height > h)
    }

    /// Blocks of depth on top of the record's block, if its height is known
    pub fn depth(&self, current_height: u64) -> Option<u64> {
        self.block_height
            .map(|h| current_height.saturating_sub(h))
    }
}

// ============================================================================
// Committee roster
// ============================================================================

/// Snapshot of the committee with a dense 1..N send order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<Address>", try_from = "Vec<Address>")]
pub struct VirtualBankRoster {
    members: BTreeMap<Address, u32>,
}

impl VirtualBankRoster {
    /// Build from members listed in send order
    pub fn from_ordered(members: Vec<Address>) -> Result<Self, EngineError> {
        if members.is_empty() {
            return Err(EngineError::validation("roster cannot be empty"));
        }
        let mut map = BTreeMap::new();
        for (i, member) in members.into_iter().enumerate() {
            if map.insert(member, i as u32 + 1).is_some() {
                return Err(EngineError::Validation(format!(
                    "duplicate roster member {}",
                    member
                )));
            }
        }
        Ok(Self { members: map })
    }

    /// Build from an explicit member → order map, which must be dense 1..N
    pub fn from_orders(members: BTreeMap<Address, u32>) -> Result<Self, EngineError> {
        let mut orders: Vec<u32> = members.values().copied().collect();
        orders.sort_unstable();
        let dense = orders
            .iter()
            .enumerate()
            .all(|(i, order)| *order == i as u32 + 1);
        if members.is_empty() || !dense {
            return Err(EngineError::validation("roster send orders must be dense 1..N"));
        }
        Ok(Self { members })
    }

    pub fn send_order(&self, member: &Address) -> Option<u32> {
        self.members.get(member).copied()
    }

    pub fn size(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn member_at(&self, order: u32) -> Option<Address> {
        self.members
            .iter()
            .find(|(_, o)| **o == order)
            .map(|(addr, _)| *addr)
    }

    /// Members sorted by send order
    pub fn ordered(&self) -> Vec<Address> {
        let mut members: Vec<(Address, u32)> =
            self.members.iter().map(|(a, o)| (*a, *o)).collect();
        members.sort_by_key(|(_, o)| *o);
        members.into_iter().map(|(a, _)| a).collect()
    }

    pub fn contains(&self, member: &Address) -> bool {
        self.members.contains_key(member)
    }
}

impl From<VirtualBankRoster> for Vec<Address> {
    fn from(roster: VirtualBankRoster) -> Self {
        roster.ordered()
    }
}

impl TryFrom<Vec<Address>> for VirtualBankRoster {
    type Error = EngineError;

    fn try_from(members: Vec<Address>) -> Result<Self, Self::Error> {
        Self::from_ordered(members)
    }
}

// ============================================================================
// Outbound broadcasts
// ============================================================================

/// Logical content of an outbound multisig transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastPayload {
    Withdraw {
        to: Address,
        amount: U256,
        is_contract_asset: bool,
        erc20: Address,
    },
    Change {
        adds: Vec<Address>,
        removes: Vec<Address>,
        count: u8,
    },
    Upgrade {
        contract: Address,
    },
    /// Committee recovery, executed on chain as a manager change
    Recovery {
        adds: Vec<Address>,
        removes: Vec<Address>,
        count: u8,
    },
}

impl BroadcastPayload {
    pub fn tx_type(&self) -> TxType {
        match self {
            BroadcastPayload::Withdraw { .. } => TxType::Withdraw,
            BroadcastPayload::Change { .. } => TxType::Change,
            BroadcastPayload::Upgrade { .. } => TxType::Upgrade,
            BroadcastPayload::Recovery { .. } => TxType::Recovery,
        }
    }
}

/// Request from the home chain for this committee to broadcast a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundJob {
    pub nerve_tx_hash: String,
    pub payload: BroadcastPayload,
    pub signatures: Bytes,
    /// Committee members in send order
    pub roster: Vec<Address>,
}

/// An outbound broadcast this node is responsible for in its turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingBroadcastRecord {
    pub nerve_tx_hash: String,
    pub tx_type: TxType,
    pub payload: BroadcastPayload,
    pub signatures: Bytes,
    pub current_node_send_order: u32,
    /// Unix millis from which this node may broadcast
    pub waiting_end_time: u64,
    /// Unix millis after which the ladder restarts from order 1
    pub max_waiting_end_time: u64,
    /// External height that must be reached before a sent record may restart
    pub validate_height: Option<u64>,
    pub roster: VirtualBankRoster,
    /// Members observed broadcasting this job
    pub sent_by: BTreeSet<Address>,
    pub sent_by_current_node: bool,
    pub resend_count: u32,
    /// Signatures were regained during the current ladder cycle
    #[serde(default)]
    pub signatures_regained: bool,
}

impl WaitingBroadcastRecord {
    pub fn new(
        job: OutboundJob,
        current_node: &Address,
        now: u64,
        interval_ms: u64,
    ) -> Result<Self, EngineError> {
        let roster = VirtualBankRoster::from_ordered(job.roster)?;
        let order = roster.send_order(current_node).ok_or_else(|| {
            EngineError::Validation(format!(
                "{} is not a member of the roster for {}",
                current_node, job.nerve_tx_hash
            ))
        })?;
        let mut record = Self {
            nerve_tx_hash: job.nerve_tx_hash,
            tx_type: job.payload.tx_type(),
            payload: job.payload,
            signatures: job.signatures,
            current_node_send_order: order,
            waiting_end_time: 0,
            max_waiting_end_time: 0,
            validate_height: None,
            roster,
            sent_by: BTreeSet::new(),
            sent_by_current_node: false,
            resend_count: 0,
            signatures_regained: false,
        };
        record.reset_timers(now, interval_ms);
        Ok(record)
    }

    /// Restart the ladder timers from `now`
    pub fn reset_timers(&mut self, now: u64, interval_ms: u64) {
        let order = u64::from(self.current_node_send_order.max(1));
        let size = u64::from(self.roster.size().max(1));
        self.waiting_end_time = now.saturating_add(interval_ms.saturating_mul(order - 1));
        self.max_waiting_end_time = now.saturating_add(interval_ms.saturating_mul(size - 1));
        self.validate_height = None;
    }

    pub fn is_first_in_order(&self) -> bool {
        self.current_node_send_order == 1
    }

    /// Whether a member ahead of this node was observed broadcasting
    pub fn lower_order_member_sent(&self) -> bool {
        self.sent_by.iter().any(|member| {
            self.roster
                .send_order(member)
                .map_or(false, |order| order < self.current_node_send_order)
        })
    }

    pub fn clear_sent(&mut self) {
        self.sent_by.clear();
        self.sent_by_current_node = false;
    }

    /// Start a fresh ladder cycle from order 1
    pub fn restart_cycle(&mut self, now: u64, interval_ms: u64) {
        self.clear_sent();
        self.signatures_regained = false;
        self.reset_timers(now, interval_ms);
    }
}
