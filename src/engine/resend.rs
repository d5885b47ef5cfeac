//! Resend / escalation engine
//!
//! Rebuilds and submits an outbound committee transaction with an escalated
//! fee. A failure reported as insufficient signatures triggers one signature
//! regain per ladder cycle before the send is retried.

use alloy::primitives::B256;
use std::sync::Arc;
use tracing::{info, warn};

use super::unconfirmed::UnconfirmedTxStore;
use super::waiting::WaitingTxStore;
use super::EngineContext;
use crate::error::EngineError;
use crate::metrics;
use crate::types::{TxStatus, UnconfirmedTxRecord, WaitingBroadcastRecord};

/// Result of a send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Submitted; the external hash is now tracked as a self-broadcast
    Sent(B256),
    /// The chain already holds the completed transaction
    AlreadyCompleted,
    /// The resend cap was reached; nothing was sent
    Exhausted,
}

pub struct ResendEngine {
    ctx: Arc<EngineContext>,
    waiting: Arc<WaitingTxStore>,
    unconfirmed: Arc<UnconfirmedTxStore>,
}

impl ResendEngine {
    pub fn new(
        ctx: Arc<EngineContext>,
        waiting: Arc<WaitingTxStore>,
        unconfirmed: Arc<UnconfirmedTxStore>,
    ) -> Self {
        Self {
            ctx,
            waiting,
            unconfirmed,
        }
    }

    /// Send `record` now. The caller persists the mutated record.
    pub async fn send(
        &self,
        record: &mut WaitingBroadcastRecord,
    ) -> Result<SendOutcome, EngineError> {
        let chain = self.ctx.chain();

        loop {
            if record.resend_count >= self.ctx.config.resend_max {
                warn!(
                    nerve_tx_hash = %record.nerve_tx_hash,
                    resend_count = record.resend_count,
                    "Resend cap reached, not sending"
                );
                metrics::RESEND_EXHAUSTED.with_label_values(&[chain]).inc();
                return Ok(SendOutcome::Exhausted);
            }

            let base_fee = self.ctx.rpc.current_fee_rate().await?;
            let fee_rate = self
                .ctx
                .capability
                .escalate_fee(base_fee, record.resend_count);
            record.resend_count += 1;

            match self.ctx.broadcaster.broadcast(record, fee_rate).await {
                Ok(tx_hash) => {
                    metrics::RESENDS.with_label_values(&[chain, "sent"]).inc();
                    self.track_sent(record, tx_hash).await?;
                    return Ok(SendOutcome::Sent(tx_hash));
                }
                Err(EngineError::AlreadyExists(msg)) => {
                    info!(
                        nerve_tx_hash = %record.nerve_tx_hash,
                        reason = %msg,
                        "Broadcast already completed on chain"
                    );
                    metrics::RESENDS
                        .with_label_values(&[chain, "already_completed"])
                        .inc();
                    return Ok(SendOutcome::AlreadyCompleted);
                }
                Err(EngineError::InsufficientSignatures(msg)) if !record.signatures_regained => {
                    warn!(
                        nerve_tx_hash = %record.nerve_tx_hash,
                        reason = %msg,
                        "Insufficient signatures, regaining from committee"
                    );
                    record.signatures = self
                        .ctx
                        .home
                        .regain_signatures(
                            &record.nerve_tx_hash,
                            self.ctx.config.max_committee_size,
                        )
                        .await?;
                    record.signatures_regained = true;
                    record.reset_timers(self.ctx.now(), self.ctx.config.wait_interval_ms());
                }
                Err(e) => {
                    metrics::RESENDS.with_label_values(&[chain, "failed"]).inc();
                    return Err(e);
                }
            }
        }
    }

    /// Resend the waiting job behind `nerve_tx_hash`, persisting the outcome
    pub async fn resend(&self, nerve_tx_hash: &str) -> Result<SendOutcome, EngineError> {
        let _guard = self.waiting.lock(nerve_tx_hash).await;
        let Some(mut record) = self.waiting.get(nerve_tx_hash).await else {
            return Err(EngineError::Validation(format!(
                "no waiting broadcast for {}",
                nerve_tx_hash
            )));
        };

        let result = self.send(&mut record).await;
        match result {
            Ok(SendOutcome::Exhausted) => self.waiting.remove(nerve_tx_hash).await?,
            _ => self.waiting.update(&record).await?,
        }
        result
    }

    /// Bookkeeping after this node submitted a transaction
    async fn track_sent(
        &self,
        record: &mut WaitingBroadcastRecord,
        tx_hash: B256,
    ) -> Result<(), EngineError> {
        let me = self.ctx.broadcaster.sender_address();
        let now = self.ctx.now();

        record.sent_by_current_node = true;
        record.sent_by.insert(me);
        record.validate_height = match self.ctx.rpc.current_height().await {
            Ok(height) => Some(height + self.ctx.config.validate_blocks),
            Err(e) => {
                warn!(error = %e, "Could not read height for broadcast validation window");
                None
            }
        };

        self.ctx
            .store
            .save_relation(tx_hash, &record.nerve_tx_hash, now)
            .await?;

        let mut tracked = UnconfirmedTxRecord::new(tx_hash, record.tx_type, me, now);
        tracked.nerve_tx_hash = Some(record.nerve_tx_hash.clone());
        tracked.status = TxStatus::Initial;
        self.unconfirmed.insert_new(tracked).await?;

        info!(
            tx_hash = %tx_hash,
            nerve_tx_hash = %record.nerve_tx_hash,
            resend_count = record.resend_count,
            "Tracking self-broadcast"
        );
        Ok(())
    }
}
