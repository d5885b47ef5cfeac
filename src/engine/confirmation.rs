//! Confirmation queue
//!
//! Each round visits every record queued at its start once. Deposits are
//! submitted to the home chain at confirmation depth; outbound broadcasts are
//! dispatched by status. Handled records stay as tombstones until the home
//! chain passes the rollback-safety window.

use alloy::primitives::B256;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::classifier::deposit_submission;
use super::resend::ResendEngine;
use super::unconfirmed::UnconfirmedTxStore;
use super::waiting::WaitingTxStore;
use super::EngineContext;
use crate::error::EngineError;
use crate::home::ConfirmedBroadcast;
use crate::metrics;
use crate::types::{TxStatus, TxType, UnconfirmedTxRecord};

/// Rounds a record sits out after the chain could not yet answer for it
const SKIP_ROUNDS_ON_GAP: u32 = 2;

/// Heights observed at the start of a round
#[derive(Debug, Clone, Copy)]
struct RoundHeights {
    home: u64,
    external: u64,
}

pub struct ConfirmationScheduler {
    ctx: Arc<EngineContext>,
    unconfirmed: Arc<UnconfirmedTxStore>,
    waiting: Arc<WaitingTxStore>,
    resend: Arc<ResendEngine>,
}

impl ConfirmationScheduler {
    pub fn new(
        ctx: Arc<EngineContext>,
        unconfirmed: Arc<UnconfirmedTxStore>,
        waiting: Arc<WaitingTxStore>,
        resend: Arc<ResendEngine>,
    ) -> Self {
        Self {
            ctx,
            unconfirmed,
            waiting,
            resend,
        }
    }

    pub async fn round(&self) {
        let chain = self.ctx.chain();
        let heights = match self.heights().await {
            Ok(heights) => heights,
            Err(e) => {
                warn!(error = %e, "Skipping confirmation round, heights unavailable");
                metrics::ERRORS
                    .with_label_values(&[chain, "confirmation", e.kind().as_str()])
                    .inc();
                return;
            }
        };

        let round_len = self.unconfirmed.queue_len();
        for _ in 0..round_len {
            let Some(hash) = self.unconfirmed.pop() else {
                break;
            };

            match self.process(hash, heights).await {
                Ok(true) => self.unconfirmed.requeue(hash),
                Ok(false) => {}
                Err(EngineError::Validation(reason)) => {
                    error!(tx_hash = %hash, reason = %reason, "Record failed validation, dropping");
                    self.drop_record(hash).await;
                }
                Err(EngineError::AlreadyExists(reason)) => {
                    info!(tx_hash = %hash, reason = %reason, "Already handled elsewhere, dropping");
                    self.drop_record(hash).await;
                }
                Err(e) => {
                    warn!(tx_hash = %hash, error = %e, "Confirmation round interrupted");
                    metrics::ERRORS
                        .with_label_values(&[chain, "confirmation", e.kind().as_str()])
                        .inc();
                    self.unconfirmed.requeue(hash);
                    break;
                }
            }
        }

        metrics::UNCONFIRMED_QUEUE
            .with_label_values(&[chain])
            .set(self.unconfirmed.len().await as f64);
    }

    async fn heights(&self) -> Result<RoundHeights, EngineError> {
        Ok(RoundHeights {
            home: self.ctx.home.current_height().await?,
            external: self.ctx.rpc.current_height().await?,
        })
    }

    async fn drop_record(&self, hash: B256) {
        let tx_type = self
            .unconfirmed
            .get(&hash)
            .await
            .map(|r| r.tx_type)
            .unwrap_or(TxType::Deposit);
        metrics::RECORDS_DROPPED
            .with_label_values(&[self.ctx.chain(), tx_type.as_str()])
            .inc();
        if let Err(e) = self.unconfirmed.remove(&hash).await {
            warn!(tx_hash = %hash, error = %e, "Failed to drop record, keeping it queued");
            self.unconfirmed.requeue(hash);
        }
    }

    /// Handle one record; `Ok(true)` keeps it queued
    async fn process(&self, hash: B256, heights: RoundHeights) -> Result<bool, EngineError> {
        let _guard = self.unconfirmed.lock(&hash).await;
        let Some(mut record) = self.unconfirmed.get(&hash).await else {
            return Ok(false);
        };

        if record.delete_flag {
            if record.is_purgeable(heights.home) {
                debug!(tx_hash = %hash, "Rollback window passed, purging record");
                self.unconfirmed.remove(&hash).await?;
                if record.tx_type.is_broadcast() {
                    if let Some(nerve_tx_hash) = &record.nerve_tx_hash {
                        self.ctx.store.remove_relations(nerve_tx_hash).await?;
                    }
                }
                return Ok(false);
            }
            return Ok(true);
        }

        if record.skip_rounds > 0 {
            record.skip_rounds -= 1;
            self.unconfirmed.update(&record).await?;
            return Ok(true);
        }

        if record.block_height.is_none() {
            if self.should_accelerate(&record) {
                return self.accelerate(record).await;
            }
            if !self.discover_height(&mut record).await? {
                return self.heal_unknown_height(record).await;
            }
            self.unconfirmed.update(&record).await?;
        }

        let depth = record.depth(heights.external).unwrap_or_default();
        if depth < self.ctx.config.confirmations {
            return Ok(true);
        }

        if record.tx_time.is_none() {
            self.fill_tx_time(&mut record).await?;
        }

        if record.tx_type == TxType::Deposit {
            return self.dispatch_deposit(record, heights).await;
        }
        self.dispatch_broadcast(record, heights).await
    }

    fn should_accelerate(&self, record: &UnconfirmedTxRecord) -> bool {
        let timeout = self.ctx.config.pending_timeout.as_millis() as u64;
        record.tx_type.is_broadcast()
            && record.from == self.ctx.me()
            && self.ctx.now().saturating_sub(record.create_time) > timeout
    }

    /// Look the transaction up on chain; `true` once its height is known
    async fn discover_height(&self, record: &mut UnconfirmedTxRecord) -> Result<bool, EngineError> {
        let hash = record.external_tx_hash;
        for attempt in 1..=self.ctx.config.height_lookup_retries.max(1) {
            match self.ctx.rpc.transaction_by_hash(hash).await {
                Ok(Some(tx)) => {
                    if let Some(height) = tx.block_height {
                        debug!(tx_hash = %hash, height, "Discovered block height");
                        record.block_height = Some(height);
                        return Ok(true);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(tx_hash = %hash, attempt, error = %e, "Height lookup failed"),
            }
        }
        Ok(false)
    }

    /// No height yet: drop the record if another member already finished the job
    async fn heal_unknown_height(&self, mut record: UnconfirmedTxRecord) -> Result<bool, EngineError> {
        if let Some(nerve_tx_hash) = record.nerve_tx_hash.as_deref() {
            if record.tx_type.is_broadcast() && self.ctx.home.is_finalized(nerve_tx_hash).await? {
                info!(
                    tx_hash = %record.external_tx_hash,
                    nerve_tx_hash,
                    "Broadcast finalized by another member, dropping local copy"
                );
                self.unconfirmed.remove(&record.external_tx_hash).await?;
                return Ok(false);
            }
        }
        record.skip_rounds = SKIP_ROUNDS_ON_GAP;
        self.unconfirmed.update(&record).await?;
        Ok(true)
    }

    /// Our own broadcast has been pending too long: resend with a higher fee unless it packed
    async fn accelerate(&self, mut record: UnconfirmedTxRecord) -> Result<bool, EngineError> {
        let hash = record.external_tx_hash;
        if let Some(tx) = self.ctx.rpc.transaction_by_hash(hash).await? {
            if let Some(height) = tx.block_height {
                record.block_height = Some(height);
                self.unconfirmed.update(&record).await?;
                return Ok(true);
            }
        }

        let Some(nerve_tx_hash) = record.nerve_tx_hash.clone() else {
            return Err(EngineError::Validation(format!(
                "self-broadcast {} has no home-chain key",
                hash
            )));
        };
        info!(tx_hash = %hash, nerve_tx_hash = %nerve_tx_hash, "Broadcast stuck in mempool, accelerating");
        let outcome = self.resend.resend(&nerve_tx_hash).await?;
        debug!(tx_hash = %hash, ?outcome, "Accelerated resend done");
        self.unconfirmed.remove(&hash).await?;
        Ok(false)
    }

    async fn fill_tx_time(&self, record: &mut UnconfirmedTxRecord) -> Result<(), EngineError> {
        let Some(height) = record.block_height else {
            return Ok(());
        };
        if let Some(block) = self.ctx.rpc.block_by_height(height).await? {
            record.tx_time = Some(block.timestamp);
            self.unconfirmed.update(record).await?;
        }
        Ok(())
    }

    async fn dispatch_deposit(
        &self,
        mut record: UnconfirmedTxRecord,
        heights: RoundHeights,
    ) -> Result<bool, EngineError> {
        let hash = record.external_tx_hash;

        if !record.validated {
            // At depth the receipt must exist; a missing one means the deposit left the chain
            let Some(receipt) = self.ctx.rpc.receipt_by_hash(hash).await? else {
                return Err(EngineError::Validation(format!(
                    "deposit {} has no receipt at confirmation depth",
                    hash
                )));
            };
            if !receipt.success {
                return Err(EngineError::Validation(format!("deposit {} reverted", hash)));
            }
            if record.is_contract_asset && receipt.logs.is_empty() {
                return Err(EngineError::Validation(format!(
                    "token deposit {} has no logs",
                    hash
                )));
            }
            record.validated = true;
            self.unconfirmed.update(&record).await?;
        }

        let submission = deposit_submission(&self.ctx, &record);
        let outcome = match self.ctx.home.submit_deposit(&submission).await {
            Ok(nerve_tx_hash) => {
                info!(
                    tx_hash = %hash,
                    nerve_tx_hash = %nerve_tx_hash,
                    amount = %record.value,
                    "Deposit submitted to home chain"
                );
                record.nerve_tx_hash = Some(nerve_tx_hash);
                "submitted"
            }
            Err(EngineError::AlreadyExists(reason)) => {
                info!(tx_hash = %hash, reason = %reason, "Deposit already on home chain");
                "already_exists"
            }
            Err(e) => return Err(e),
        };

        metrics::CALLBACKS
            .with_label_values(&[self.ctx.chain(), TxType::Deposit.as_str(), outcome])
            .inc();
        self.tombstone(record, heights).await
    }

    async fn dispatch_broadcast(
        &self,
        record: UnconfirmedTxRecord,
        heights: RoundHeights,
    ) -> Result<bool, EngineError> {
        match record.status {
            TxStatus::Initial => Ok(true),
            TxStatus::Failed | TxStatus::Doing => self.settle_unfinished(record).await,
            TxStatus::Resend => self.retry_broadcast(record).await,
            TxStatus::Completed => self.confirm_broadcast(record, heights).await,
        }
    }

    /// A failed or partially signed broadcast: make sure this node takes its turn, then forget it
    async fn settle_unfinished(&self, record: UnconfirmedTxRecord) -> Result<bool, EngineError> {
        let hash = record.external_tx_hash;
        if let Some(nerve_tx_hash) = record.nerve_tx_hash.as_deref() {
            let _waiting_guard = self.waiting.lock(nerve_tx_hash).await;
            if let Some(mut waiting) = self.waiting.get(nerve_tx_hash).await {
                if !waiting.sent_by_current_node
                    && !self.ctx.home.has_pending_roster_change().await?
                {
                    info!(
                        tx_hash = %hash,
                        nerve_tx_hash,
                        status = %record.status,
                        "Broadcast by another member did not finish, taking our turn"
                    );
                    waiting.waiting_end_time = self.ctx.now();
                    waiting.sent_by.clear();
                    self.waiting.update(&waiting).await?;
                }
            }
        }
        debug!(tx_hash = %hash, status = %record.status, "Dropping unfinished broadcast");
        self.unconfirmed.remove(&hash).await?;
        Ok(false)
    }

    async fn retry_broadcast(&self, mut record: UnconfirmedTxRecord) -> Result<bool, EngineError> {
        let hash = record.external_tx_hash;
        let Some(nerve_tx_hash) = record.nerve_tx_hash.clone() else {
            return Err(EngineError::Validation(format!(
                "broadcast {} has no home-chain key",
                hash
            )));
        };

        match self.resend.resend(&nerve_tx_hash).await {
            Ok(outcome) => {
                debug!(tx_hash = %hash, ?outcome, "Resend finished");
                self.unconfirmed.remove(&hash).await?;
                Ok(false)
            }
            Err(e) => {
                record.resend_count += 1;
                if record.resend_count > self.ctx.config.resend_max {
                    warn!(
                        tx_hash = %hash,
                        nerve_tx_hash = %nerve_tx_hash,
                        resend_count = record.resend_count,
                        error = %e,
                        "Resend cap reached, discarding broadcast"
                    );
                    metrics::RESEND_EXHAUSTED
                        .with_label_values(&[self.ctx.chain()])
                        .inc();
                    self.unconfirmed.remove(&hash).await?;
                    return Ok(false);
                }
                warn!(tx_hash = %hash, error = %e, "Resend failed, retrying next round");
                self.unconfirmed.update(&record).await?;
                Ok(true)
            }
        }
    }

    async fn confirm_broadcast(
        &self,
        mut record: UnconfirmedTxRecord,
        heights: RoundHeights,
    ) -> Result<bool, EngineError> {
        let hash = record.external_tx_hash;
        let receipt = self.ctx.rpc.receipt_by_hash(hash).await?;

        let broken = match &receipt {
            None => {
                let timeout = self.ctx.config.receipt_timeout.as_millis() as u64;
                if self.ctx.now().saturating_sub(record.create_time) <= timeout {
                    return Ok(true);
                }
                Some("receipt missing past timeout")
            }
            Some(receipt) if !receipt.success => Some("receipt reverted"),
            Some(receipt) if receipt.logs.is_empty() => Some("receipt has no logs"),
            Some(_) => None,
        };
        if let Some(reason) = broken {
            warn!(tx_hash = %hash, reason, "Completed broadcast failed re-validation, resending");
            record.set_status(TxStatus::Resend)?;
            self.unconfirmed.update(&record).await?;
            return Ok(true);
        }

        let Some(nerve_tx_hash) = record.nerve_tx_hash.clone() else {
            return Err(EngineError::Validation(format!(
                "broadcast {} has no home-chain key",
                hash
            )));
        };
        let capability = &self.ctx.capability;
        let confirmed = ConfirmedBroadcast {
            tx_type: record.tx_type,
            nerve_tx_hash: nerve_tx_hash.clone(),
            external_tx_hash: hash,
            height: record.block_height.unwrap_or_default(),
            tx_time: record.tx_time.unwrap_or_default(),
            multisig_address: capability.format_address(&capability.bridge_address()),
            signers: record
                .signers
                .iter()
                .map(|s| capability.format_address(s))
                .collect(),
        };

        let outcome = match self.ctx.home.confirmed(&confirmed).await {
            Ok(()) => "confirmed",
            Err(EngineError::AlreadyExists(_)) => "already_exists",
            Err(e) => return Err(e),
        };
        info!(
            tx_hash = %hash,
            nerve_tx_hash = %nerve_tx_hash,
            tx_type = %record.tx_type,
            outcome,
            "Broadcast confirmation delivered"
        );
        metrics::CALLBACKS
            .with_label_values(&[self.ctx.chain(), record.tx_type.as_str(), outcome])
            .inc();
        self.tombstone(record, heights).await
    }

    async fn tombstone(
        &self,
        mut record: UnconfirmedTxRecord,
        heights: RoundHeights,
    ) -> Result<bool, EngineError> {
        record.mark_deleted(heights.home, self.ctx.config.rollback_window);
        self.unconfirmed.update(&record).await?;
        Ok(true)
    }
}
