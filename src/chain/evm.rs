//! EVM family decoding rules
//!
//! Calldata and event decoding for the multisig bridge and ERC-20 tokens.
//! Everything here is pure; network access lives in [`super::rpc`].

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolEvent};

use super::{BroadcastCall, ChainCapability, DepositCall, DepositEvent, FeePolicy};
use crate::contracts::bridge::{IERC20, VirtualBankMultiSig};
use crate::error::EngineError;
use crate::types::{TxLog, TxReceipt, TxType};

/// Decoding capability for one EVM chain
#[derive(Debug, Clone)]
pub struct EvmCapability {
    name: String,
    bridge: Address,
    fee_policy: FeePolicy,
}

impl EvmCapability {
    pub fn new(name: impl Into<String>, bridge: Address, fee_policy: FeePolicy) -> Self {
        Self {
            name: name.into(),
            bridge,
            fee_policy,
        }
    }

    /// Logs emitted by the bridge whose first topic is `signature`
    fn bridge_logs<'a>(
        &'a self,
        receipt: &'a TxReceipt,
        signature: B256,
    ) -> impl Iterator<Item = &'a TxLog> + 'a {
        receipt.logs.iter().filter(move |log| {
            log.address == self.bridge && log.topics.first() == Some(&signature)
        })
    }
}

/// Split event data into 32-byte words
fn data_words(data: &[u8]) -> Option<Vec<B256>> {
    if data.is_empty() || data.len() % 32 != 0 {
        return None;
    }
    Some(data.chunks(32).map(B256::from_slice).collect())
}

fn non_zero(address: Address) -> Option<Address> {
    if address == Address::ZERO {
        None
    } else {
        Some(address)
    }
}

impl ChainCapability for EvmCapability {
    fn chain_name(&self) -> &str {
        &self.name
    }

    fn bridge_address(&self) -> Address {
        self.bridge
    }

    fn format_address(&self, address: &Address) -> String {
        format!("{:#x}", address)
    }

    fn decode_bridge_deposit(&self, input: &[u8]) -> Option<DepositCall> {
        let call = VirtualBankMultiSig::crossOutCall::abi_decode(input, true).ok()?;
        Some(DepositCall {
            home_address: call.to,
            amount: call.amount,
            erc20: non_zero(call.erc20),
        })
    }

    fn bridge_deposit_event(&self, receipt: &TxReceipt) -> Option<DepositEvent> {
        self.bridge_logs(receipt, VirtualBankMultiSig::CrossOutFunds::SIGNATURE_HASH)
            .find_map(|log| {
                VirtualBankMultiSig::CrossOutFunds::decode_raw_log(
                    log.topics.iter().copied(),
                    &log.data,
                    true,
                )
                .ok()
            })
            .map(|event| DepositEvent {
                from: event.from,
                amount: event.amount,
                erc20: non_zero(event.erc20),
                home_address: Some(event.to),
            })
    }

    fn native_funds_event(&self, receipt: &TxReceipt) -> Option<DepositEvent> {
        self.bridge_logs(receipt, VirtualBankMultiSig::DepositFunds::SIGNATURE_HASH)
            .find_map(|log| {
                // The event carries exactly (from, amount)
                let words = data_words(&log.data)?;
                if words.len() != 2 {
                    return None;
                }
                Some(DepositEvent {
                    from: Address::from_word(words[0]),
                    amount: U256::from_be_slice(words[1].as_slice()),
                    erc20: None,
                    home_address: None,
                })
            })
    }

    fn decode_token_transfer(&self, input: &[u8]) -> Option<(Address, U256)> {
        let call = IERC20::transferCall::abi_decode(input, true).ok()?;
        Some((call.to, call.value))
    }

    fn token_transfer_event(
        &self,
        receipt: &TxReceipt,
        token: Address,
        from: Address,
        to: Address,
    ) -> Option<U256> {
        receipt
            .logs
            .iter()
            .filter(|log| {
                log.address == token
                    && log.topics.first() == Some(&IERC20::Transfer::SIGNATURE_HASH)
            })
            .filter_map(|log| {
                IERC20::Transfer::decode_raw_log(log.topics.iter().copied(), &log.data, true).ok()
            })
            .find(|event| event.from == from && event.to == to)
            .map(|event| event.value)
    }

    fn decode_broadcast(&self, input: &[u8]) -> Option<BroadcastCall> {
        if input.len() < 4 {
            return None;
        }
        let selector = &input[..4];

        if selector == VirtualBankMultiSig::createOrSignWithdrawCall::SELECTOR.as_slice() {
            let call =
                VirtualBankMultiSig::createOrSignWithdrawCall::abi_decode(input, true).ok()?;
            Some(BroadcastCall {
                tx_type: TxType::Withdraw,
                nerve_tx_hash: call.txKey,
            })
        } else if selector
            == VirtualBankMultiSig::createOrSignManagerChangeCall::SELECTOR.as_slice()
        {
            let call =
                VirtualBankMultiSig::createOrSignManagerChangeCall::abi_decode(input, true).ok()?;
            Some(BroadcastCall {
                tx_type: TxType::Change,
                nerve_tx_hash: call.txKey,
            })
        } else if selector == VirtualBankMultiSig::createOrSignUpgradeCall::SELECTOR.as_slice() {
            let call =
                VirtualBankMultiSig::createOrSignUpgradeCall::abi_decode(input, true).ok()?;
            Some(BroadcastCall {
                tx_type: TxType::Upgrade,
                nerve_tx_hash: call.txKey,
            })
        } else {
            None
        }
    }

    fn completion_signers(
        &self,
        receipt: &TxReceipt,
        tx_type: TxType,
        nerve_tx_hash: &str,
    ) -> Option<Vec<Address>> {
        let decode = |log: &TxLog| -> Option<(String, Vec<Address>)> {
            let topics = log.topics.iter().copied();
            match tx_type {
                TxType::Withdraw => {
                    VirtualBankMultiSig::TxWithdrawCompleted::decode_raw_log(topics, &log.data, true)
                        .ok()
                        .map(|e| (e.txKey, e.signers))
                }
                TxType::Change | TxType::Recovery => {
                    VirtualBankMultiSig::TxManagerChangeCompleted::decode_raw_log(
                        topics, &log.data, true,
                    )
                    .ok()
                    .map(|e| (e.txKey, e.signers))
                }
                TxType::Upgrade => {
                    VirtualBankMultiSig::TxUpgradeCompleted::decode_raw_log(topics, &log.data, true)
                        .ok()
                        .map(|e| (e.txKey, e.signers))
                }
                TxType::Deposit => None,
            }
        };

        let signature = match tx_type {
            TxType::Withdraw => VirtualBankMultiSig::TxWithdrawCompleted::SIGNATURE_HASH,
            TxType::Change | TxType::Recovery => {
                VirtualBankMultiSig::TxManagerChangeCompleted::SIGNATURE_HASH
            }
            TxType::Upgrade => VirtualBankMultiSig::TxUpgradeCompleted::SIGNATURE_HASH,
            TxType::Deposit => return None,
        };

        self.bridge_logs(receipt, signature)
            .filter_map(decode)
            .find(|(key, _)| key == nerve_tx_hash)
            .map(|(_, signers)| signers)
    }

    fn minter_query(&self, token: Address) -> Bytes {
        VirtualBankMultiSig::isMinterERC20Call { erc20: token }
            .abi_encode()
            .into()
    }

    fn decode_minter_result(&self, data: &[u8]) -> Result<bool, EngineError> {
        VirtualBankMultiSig::isMinterERC20Call::abi_decode_returns(data, true)
            .map(|ret| ret._0)
            .map_err(|e| EngineError::Transient(format!("isMinterERC20 result: {}", e)))
    }

    fn escalate_fee(&self, base: u128, attempt: u32) -> u128 {
        self.fee_policy.fee_for_attempt(base, attempt)
    }
}
