//! Unconfirmed transaction store
//!
//! Records live in a map keyed by external tx hash and are visited through a
//! round queue of keys. Every mutation writes through to the persistent store
//! before the in-memory copy is replaced.

use alloy::primitives::B256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{MutexGuard, RwLock};

use super::locks::KeyedLocks;
use super::queue::RoundQueue;
use crate::error::EngineError;
use crate::store::TxStore;
use crate::types::UnconfirmedTxRecord;

pub struct UnconfirmedTxStore {
    store: Arc<dyn TxStore>,
    records: RwLock<HashMap<B256, UnconfirmedTxRecord>>,
    queue: RoundQueue<B256>,
    locks: KeyedLocks,
}

impl UnconfirmedTxStore {
    pub fn new(store: Arc<dyn TxStore>) -> Self {
        Self {
            store,
            records: RwLock::new(HashMap::new()),
            queue: RoundQueue::new(),
            locks: KeyedLocks::default(),
        }
    }

    /// Reload persisted records and queue them; returns how many were loaded
    pub async fn load(&self) -> eyre::Result<usize> {
        let persisted = self.store.all_unconfirmed().await?;
        let mut records = self.records.write().await;
        let count = persisted.len();
        for record in persisted {
            self.queue.push(record.external_tx_hash);
            records.insert(record.external_tx_hash, record);
        }
        Ok(count)
    }

    /// Serialise work on one record across tasks
    pub async fn lock(&self, hash: &B256) -> MutexGuard<'_, ()> {
        self.locks.lock(hash).await
    }

    pub async fn contains(&self, hash: &B256) -> bool {
        self.records.read().await.contains_key(hash)
    }

    pub async fn get(&self, hash: &B256) -> Option<UnconfirmedTxRecord> {
        self.records.read().await.get(hash).cloned()
    }

    /// Track a new record; `false` if the hash is already tracked
    pub async fn insert_new(&self, record: UnconfirmedTxRecord) -> Result<bool, EngineError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.external_tx_hash) {
            return Ok(false);
        }
        self.store.save_unconfirmed(&record).await?;
        self.queue.push(record.external_tx_hash);
        records.insert(record.external_tx_hash, record);
        Ok(true)
    }

    /// Persist and replace an existing record
    pub async fn update(&self, record: &UnconfirmedTxRecord) -> Result<(), EngineError> {
        self.store.save_unconfirmed(record).await?;
        self.records
            .write()
            .await
            .insert(record.external_tx_hash, record.clone());
        Ok(())
    }

    pub async fn remove(&self, hash: &B256) -> Result<(), EngineError> {
        self.store.remove_unconfirmed(*hash).await?;
        self.records.write().await.remove(hash);
        self.queue.remove(hash);
        Ok(())
    }

    pub fn pop(&self) -> Option<B256> {
        self.queue.pop()
    }

    pub fn requeue(&self, hash: B256) {
        self.queue.push(hash);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<UnconfirmedTxRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.create_time);
        records
    }
}
