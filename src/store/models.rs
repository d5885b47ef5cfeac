use alloy::primitives::{Address, B256, U256};
use eyre::{eyre, Result, WrapErr};
use sqlx::FromRow;
use std::str::FromStr;

use crate::types::{UnconfirmedTxRecord, WaitingBroadcastRecord};

// Hashes and addresses are stored as lowercase 0x text. `value` is NUMERIC(78,0);
// it is bound as text cast to NUMERIC and read back through `value::TEXT`.

#[derive(Debug, Clone, FromRow)]
pub struct HeaderRow {
    pub height: i64,
    pub hash: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct UnconfirmedRow {
    pub external_tx_hash: String,
    pub nerve_tx_hash: Option<String>,
    pub tx_type: String,
    pub block_height: Option<i64>,
    pub from_address: String,
    pub to_address: Option<String>,
    pub value: String,
    pub decimals: i16,
    pub is_contract_asset: bool,
    pub contract_address: Option<String>,
    pub asset_id: i64,
    pub create_time: i64,
    pub tx_time: Option<i64>,
    pub status: String,
    pub validated: bool,
    pub skip_rounds: i32,
    pub resend_count: i32,
    pub delete_flag: bool,
    pub delete_height: Option<i64>,
    /// JSON array of addresses
    pub signers: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct WaitingRow {
    pub nerve_tx_hash: String,
    /// Full record as JSON
    pub record: String,
}

pub fn hash_text(hash: &B256) -> String {
    format!("{:#x}", hash)
}

pub fn address_text(address: &Address) -> String {
    format!("{:#x}", address)
}

fn parse_address(text: &str) -> Result<Address> {
    Address::from_str(text).wrap_err_with(|| format!("Invalid address in store: {}", text))
}

impl TryFrom<HeaderRow> for crate::types::ExternalBlockHeader {
    type Error = eyre::Report;

    fn try_from(row: HeaderRow) -> Result<Self> {
        Ok(Self {
            height: row.height as u64,
            hash: B256::from_str(&row.hash)
                .wrap_err_with(|| format!("Invalid header hash at {}", row.height))?,
        })
    }
}

impl TryFrom<UnconfirmedRow> for UnconfirmedTxRecord {
    type Error = eyre::Report;

    fn try_from(row: UnconfirmedRow) -> Result<Self> {
        Ok(Self {
            external_tx_hash: B256::from_str(&row.external_tx_hash)
                .wrap_err("Invalid external tx hash in store")?,
            nerve_tx_hash: row.nerve_tx_hash,
            tx_type: row.tx_type.parse().map_err(|e| eyre!("{}", e))?,
            block_height: row.block_height.map(|h| h as u64),
            from: parse_address(&row.from_address)?,
            to: row.to_address,
            value: U256::from_str(&row.value)
                .map_err(|e| eyre!("Invalid value {}: {}", row.value, e))?,
            decimals: row.decimals as u8,
            is_contract_asset: row.is_contract_asset,
            contract_address: row
                .contract_address
                .as_deref()
                .map(parse_address)
                .transpose()?,
            asset_id: row.asset_id as u32,
            create_time: row.create_time as u64,
            tx_time: row.tx_time.map(|t| t as u64),
            status: row.status.parse().map_err(|e| eyre!("{}", e))?,
            validated: row.validated,
            skip_rounds: row.skip_rounds.max(0) as u32,
            resend_count: row.resend_count.max(0) as u32,
            delete_flag: row.delete_flag,
            delete_height: row.delete_height.map(|h| h as u64),
            signers: serde_json::from_str(&row.signers).wrap_err("Invalid signers in store")?,
        })
    }
}

impl TryFrom<WaitingRow> for WaitingBroadcastRecord {
    type Error = eyre::Report;

    fn try_from(row: WaitingRow) -> Result<Self> {
        serde_json::from_str(&row.record)
            .wrap_err_with(|| format!("Invalid waiting record {}", row.nerve_tx_hash))
    }
}
