//! Signature coordination / waiting queue
//!
//! Each outbound job carries a deterministic send order. The first member
//! broadcasts at once; member `k` waits `(k - 1)` intervals and only steps in
//! if nobody ahead of it was seen broadcasting. When the whole ladder has
//! elapsed without the home chain finalizing the job, the "who has sent"
//! bookkeeping is cleared and the ladder restarts from order 1.

use alloy::primitives::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{MutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::locks::KeyedLocks;
use super::queue::RoundQueue;
use super::resend::{ResendEngine, SendOutcome};
use super::EngineContext;
use crate::error::EngineError;
use crate::metrics;
use crate::store::TxStore;
use crate::types::WaitingBroadcastRecord;

pub struct WaitingTxStore {
    store: Arc<dyn TxStore>,
    records: RwLock<HashMap<String, WaitingBroadcastRecord>>,
    queue: RoundQueue<String>,
    locks: KeyedLocks,
}

impl WaitingTxStore {
    pub fn new(store: Arc<dyn TxStore>) -> Self {
        Self {
            store,
            records: RwLock::new(HashMap::new()),
            queue: RoundQueue::new(),
            locks: KeyedLocks::default(),
        }
    }

    pub async fn load(&self) -> eyre::Result<usize> {
        let persisted = self.store.all_waiting().await?;
        let mut records = self.records.write().await;
        let count = persisted.len();
        for record in persisted {
            self.queue.push(record.nerve_tx_hash.clone());
            records.insert(record.nerve_tx_hash.clone(), record);
        }
        Ok(count)
    }

    pub async fn lock(&self, nerve_tx_hash: &str) -> MutexGuard<'_, ()> {
        self.locks.lock(nerve_tx_hash).await
    }

    /// Track a new job; `false` if it is already waiting
    pub async fn enqueue(&self, record: WaitingBroadcastRecord) -> Result<bool, EngineError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.nerve_tx_hash) {
            return Ok(false);
        }
        self.store.save_waiting(&record).await?;
        self.queue.push(record.nerve_tx_hash.clone());
        records.insert(record.nerve_tx_hash.clone(), record);
        Ok(true)
    }

    pub async fn get(&self, nerve_tx_hash: &str) -> Option<WaitingBroadcastRecord> {
        self.records.read().await.get(nerve_tx_hash).cloned()
    }

    pub async fn update(&self, record: &WaitingBroadcastRecord) -> Result<(), EngineError> {
        self.store.save_waiting(record).await?;
        self.records
            .write()
            .await
            .insert(record.nerve_tx_hash.clone(), record.clone());
        Ok(())
    }

    pub async fn remove(&self, nerve_tx_hash: &str) -> Result<(), EngineError> {
        self.store.remove_waiting(nerve_tx_hash).await?;
        self.records.write().await.remove(nerve_tx_hash);
        self.queue.remove(&nerve_tx_hash.to_string());
        Ok(())
    }

    /// Record that `sender` was seen broadcasting this job
    pub async fn mark_observed_sender(
        &self,
        nerve_tx_hash: &str,
        sender: Address,
        is_current_node: bool,
    ) -> Result<bool, EngineError> {
        let _guard = self.lock(nerve_tx_hash).await;
        let Some(mut record) = self.get(nerve_tx_hash).await else {
            return Ok(false);
        };
        if !record.roster.contains(&sender) {
            return Ok(false);
        }
        let changed = record.sent_by.insert(sender)
            || (is_current_node && !record.sent_by_current_node);
        if is_current_node {
            record.sent_by_current_node = true;
        }
        if changed {
            self.update(&record).await?;
        }
        Ok(changed)
    }

    pub fn pop(&self) -> Option<String> {
        self.queue.pop()
    }

    pub fn requeue(&self, nerve_tx_hash: String) {
        self.queue.push(nerve_tx_hash);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<WaitingBroadcastRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.nerve_tx_hash.cmp(&b.nerve_tx_hash));
        records
    }
}

/// Drives the send-order ladder one round at a time
pub struct WaitingScheduler {
    ctx: Arc<EngineContext>,
    waiting: Arc<WaitingTxStore>,
    resend: Arc<ResendEngine>,
}

impl WaitingScheduler {
    pub fn new(
        ctx: Arc<EngineContext>,
        waiting: Arc<WaitingTxStore>,
        resend: Arc<ResendEngine>,
    ) -> Self {
        Self {
            ctx,
            waiting,
            resend,
        }
    }

    /// Visit every job queued at the start of the round once
    pub async fn round(&self) {
        let round_len = self.waiting.queue_len();
        let chain = self.ctx.chain();

        for _ in 0..round_len {
            let Some(key) = self.waiting.pop() else {
                break;
            };

            match self.process(&key).await {
                Ok(true) => self.waiting.requeue(key),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        nerve_tx_hash = %key,
                        error = %e,
                        "Waiting round interrupted"
                    );
                    metrics::ERRORS
                        .with_label_values(&[chain, "waiting", e.kind().as_str()])
                        .inc();
                    self.waiting.requeue(key);
                    break;
                }
            }
        }

        metrics::WAITING_QUEUE
            .with_label_values(&[chain])
            .set(self.waiting.len().await as f64);
    }

    /// Handle one job; `Ok(true)` keeps it queued
    pub async fn process(&self, nerve_tx_hash: &str) -> Result<bool, EngineError> {
        let _guard = self.waiting.lock(nerve_tx_hash).await;
        let Some(mut record) = self.waiting.get(nerve_tx_hash).await else {
            return Ok(false);
        };

        if self.ctx.home.is_finalized(nerve_tx_hash).await? {
            info!(nerve_tx_hash, "Broadcast finalized on home chain, leaving waiting queue");
            self.waiting.remove(nerve_tx_hash).await?;
            return Ok(false);
        }

        if record.resend_count >= self.ctx.config.resend_max {
            warn!(
                nerve_tx_hash,
                resend_count = record.resend_count,
                "Resend cap reached, discarding waiting broadcast"
            );
            metrics::RESEND_EXHAUSTED
                .with_label_values(&[self.ctx.chain()])
                .inc();
            self.waiting.remove(nerve_tx_hash).await?;
            return Ok(false);
        }

        let now = self.ctx.now();
        if now < record.waiting_end_time {
            return Ok(true);
        }

        if !record.sent_by_current_node && !record.lower_order_member_sent() {
            debug!(
                nerve_tx_hash,
                send_order = record.current_node_send_order,
                "Our turn to broadcast"
            );
            let result = self.resend.send(&mut record).await;
            return match result {
                Ok(SendOutcome::Exhausted) => {
                    self.waiting.remove(nerve_tx_hash).await?;
                    Ok(false)
                }
                Ok(_) => {
                    self.waiting.update(&record).await?;
                    Ok(true)
                }
                Err(e @ EngineError::Transient(_)) => {
                    self.waiting.update(&record).await?;
                    Err(e)
                }
                Err(e) => {
                    warn!(nerve_tx_hash, error = %e, "Broadcast attempt failed");
                    self.waiting.update(&record).await?;
                    Ok(true)
                }
            };
        }

        if now >= record.max_waiting_end_time && self.validate_height_reached(&record).await? {
            info!(
                nerve_tx_hash,
                observed_senders = record.sent_by.len(),
                "Waiting ladder elapsed without finalization, restarting from first member"
            );
            record.restart_cycle(now, self.ctx.config.wait_interval_ms());
            self.waiting.update(&record).await?;
        }

        Ok(true)
    }

    async fn validate_height_reached(
        &self,
        record: &WaitingBroadcastRecord,
    ) -> Result<bool, EngineError> {
        match record.validate_height {
            None => Ok(true),
            Some(height) => Ok(self.ctx.rpc.current_height().await? >= height),
        }
    }
}
