use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::Result;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::TxStore;
use crate::types::{ExternalBlockHeader, UnconfirmedTxRecord, WaitingBroadcastRecord};

#[derive(Default)]
struct Tables {
    headers: BTreeMap<u64, ExternalBlockHeader>,
    latest: Option<u64>,
    unconfirmed: HashMap<B256, UnconfirmedTxRecord>,
    waiting: HashMap<String, WaitingBroadcastRecord>,
    /// external hash → (home hash, sent at)
    relations: HashMap<B256, (String, u64)>,
}

/// Process-local store; state is lost on restart
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TxStore for MemoryStore {
    async fn latest_header(&self) -> Result<Option<ExternalBlockHeader>> {
        let tables = self.tables.read().await;
        Ok(tables
            .latest
            .and_then(|h| tables.headers.get(&h).copied()))
    }

    async fn save_header(&self, header: &ExternalBlockHeader) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.headers.insert(header.height, *header);
        tables.latest = Some(header.height);
        Ok(())
    }

    async fn header_by_height(&self, height: u64) -> Result<Option<ExternalBlockHeader>> {
        Ok(self.tables.read().await.headers.get(&height).copied())
    }

    async fn roll_back_header(&self, height: u64) -> Result<Option<ExternalBlockHeader>> {
        let mut tables = self.tables.write().await;
        tables.headers.remove(&height);
        let previous = height
            .checked_sub(1)
            .and_then(|prev| tables.headers.get(&prev).copied());
        tables.latest = previous.map(|h| h.height);
        Ok(previous)
    }

    async fn delete_all_headers(&self) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.headers.clear();
        tables.latest = None;
        Ok(())
    }

    async fn save_unconfirmed(&self, record: &UnconfirmedTxRecord) -> Result<()> {
        self.tables
            .write()
            .await
            .unconfirmed
            .insert(record.external_tx_hash, record.clone());
        Ok(())
    }

    async fn find_unconfirmed(
        &self,
        external_tx_hash: B256,
    ) -> Result<Option<UnconfirmedTxRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .unconfirmed
            .get(&external_tx_hash)
            .cloned())
    }

    async fn remove_unconfirmed(&self, external_tx_hash: B256) -> Result<()> {
        self.tables
            .write()
            .await
            .unconfirmed
            .remove(&external_tx_hash);
        Ok(())
    }

    async fn all_unconfirmed(&self) -> Result<Vec<UnconfirmedTxRecord>> {
        let mut records: Vec<_> = self
            .tables
            .read()
            .await
            .unconfirmed
            .values()
            .cloned()
            .collect();
        records.sort_by_key(|r| r.create_time);
        Ok(records)
    }

    async fn save_waiting(&self, record: &WaitingBroadcastRecord) -> Result<()> {
        self.tables
            .write()
            .await
            .waiting
            .insert(record.nerve_tx_hash.clone(), record.clone());
        Ok(())
    }

    async fn remove_waiting(&self, nerve_tx_hash: &str) -> Result<()> {
        self.tables.write().await.waiting.remove(nerve_tx_hash);
        Ok(())
    }

    async fn all_waiting(&self) -> Result<Vec<WaitingBroadcastRecord>> {
        let mut records: Vec<_> = self
            .tables
            .read()
            .await
            .waiting
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.nerve_tx_hash.cmp(&b.nerve_tx_hash));
        Ok(records)
    }

    async fn save_relation(
        &self,
        external_tx_hash: B256,
        nerve_tx_hash: &str,
        sent_at: u64,
    ) -> Result<()> {
        self.tables
            .write()
            .await
            .relations
            .insert(external_tx_hash, (nerve_tx_hash.to_string(), sent_at));
        Ok(())
    }

    async fn nerve_by_external(&self, external_tx_hash: B256) -> Result<Option<String>> {
        Ok(self
            .tables
            .read()
            .await
            .relations
            .get(&external_tx_hash)
            .map(|(nerve, _)| nerve.clone()))
    }

    async fn remove_relations(&self, nerve_tx_hash: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .relations
            .retain(|_, (nerve, _)| nerve != nerve_tx_hash);
        Ok(())
    }
}
