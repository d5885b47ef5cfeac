//! Block ingestion scheduler
//!
//! One round per tick. Blocks are classified strictly one at a time and the
//! header is persisted after each block, so a crash mid-sync resumes at the
//! first unprocessed height.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::classifier::{BlockContext, Classification, TxClassifier};
use super::header_cache::LocalHeaderCache;
use super::EngineContext;
use crate::error::EngineError;
use crate::metrics;
use crate::types::ExternalBlock;

/// What a round did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// This node is not on the committee
    Inactive,
    /// First sync anchored the local history at this height
    Anchored(u64),
    /// The local tip no longer matches the chain; this height was dropped
    ForkRolledBack(u64),
    /// Caught up to the external tip
    Synced(u64),
    /// A fetch failed; the next round resumes after this height
    Stopped(u64),
}

pub struct BlockIngestionScheduler {
    ctx: Arc<EngineContext>,
    headers: Arc<LocalHeaderCache>,
    classifier: Arc<TxClassifier>,
    first_cycle: AtomicBool,
    cleared_inactive: AtomicBool,
}

impl BlockIngestionScheduler {
    pub fn new(
        ctx: Arc<EngineContext>,
        headers: Arc<LocalHeaderCache>,
        classifier: Arc<TxClassifier>,
    ) -> Self {
        Self {
            ctx,
            headers,
            classifier,
            first_cycle: AtomicBool::new(true),
            cleared_inactive: AtomicBool::new(false),
        }
    }

    pub fn classifier(&self) -> &TxClassifier {
        &self.classifier
    }

    pub async fn round(&self) -> Result<IngestOutcome, EngineError> {
        let me = self.ctx.me();
        if !self.ctx.home.is_virtual_bank_member(&me).await? {
            if !self.cleared_inactive.swap(true, Ordering::SeqCst) {
                info!(member = %me, "Not a committee member, clearing local headers");
                self.headers.delete_all_and_rewind().await?;
            }
            return Ok(IngestOutcome::Inactive);
        }
        self.cleared_inactive.store(false, Ordering::SeqCst);

        let tip = self.ctx.rpc.current_height().await?;
        let first_cycle = self.first_cycle.swap(false, Ordering::SeqCst);

        let local = match self.headers.get_latest().await {
            Some(local)
                if first_cycle
                    && self.ctx.config.skip_backlog_on_start
                    && tip.saturating_sub(local.height) >= 2 =>
            {
                info!(
                    local_height = local.height,
                    tip,
                    "Local history lags the chain, skipping backlog"
                );
                self.headers.delete_all_and_rewind().await?;
                return self.anchor(tip).await;
            }
            Some(local) => local,
            None => {
                let start = self.ctx.config.start_height.unwrap_or(tip).min(tip);
                return self.anchor(start).await;
            }
        };

        // Tip check: does the chain still agree with our newest header?
        match self.ctx.rpc.header_by_height(local.height).await? {
            Some(remote) if remote.hash == local.hash => {}
            Some(remote) => {
                return self.roll_back(local.height, remote.hash.to_string()).await;
            }
            None => {
                debug!(height = local.height, "Local tip not yet visible on chain");
                return Ok(IngestOutcome::Stopped(local.height));
            }
        }

        let mut current = local;
        for height in (local.height + 1)..=tip {
            let block = match self.ctx.rpc.block_by_height(height).await {
                Ok(Some(block)) => block,
                Ok(None) => {
                    debug!(height, "Block not available yet");
                    return Ok(IngestOutcome::Stopped(current.height));
                }
                Err(e) => {
                    warn!(height, error = %e, "Block fetch failed, resuming next round");
                    return Ok(IngestOutcome::Stopped(current.height));
                }
            };

            if block.parent_hash != current.hash {
                return self
                    .roll_back(current.height, block.parent_hash.to_string())
                    .await;
            }

            self.process_block(&block).await?;
            self.headers.save(block.header()).await?;
            self.record_progress(block.height);
            current = block.header();
        }

        Ok(IngestOutcome::Synced(current.height))
    }

    /// Classify every transaction of `block`
    pub async fn process_block(&self, block: &ExternalBlock) -> Result<(), EngineError> {
        let context = BlockContext {
            height: block.height,
            timestamp: block.timestamp,
        };
        let mut matched = 0usize;
        for tx in &block.transactions {
            match self.classifier.classify(tx, context).await? {
                Classification::Irrelevant | Classification::Rejected(_) => {}
                Classification::Deposit(_) | Classification::Broadcast { .. } => matched += 1,
            }
        }
        if matched > 0 {
            debug!(
                height = block.height,
                txs = block.transactions.len(),
                matched,
                "Block classified"
            );
        }
        Ok(())
    }

    async fn anchor(&self, height: u64) -> Result<IngestOutcome, EngineError> {
        let Some(block) = self.ctx.rpc.block_by_height(height).await? else {
            return Err(EngineError::Transient(format!(
                "block {} not available for first sync",
                height
            )));
        };
        self.process_block(&block).await?;
        self.headers.save(block.header()).await?;
        self.record_progress(block.height);
        info!(height = block.height, hash = %block.hash, "Local history anchored");
        Ok(IngestOutcome::Anchored(block.height))
    }

    async fn roll_back(&self, height: u64, remote: String) -> Result<IngestOutcome, EngineError> {
        warn!(height, remote_hash = %remote, "Fork detected, rolling back one block");
        metrics::FORKS_DETECTED
            .with_label_values(&[self.ctx.chain()])
            .inc();
        self.headers.delete_by_height(height).await?;
        Ok(IngestOutcome::ForkRolledBack(height))
    }

    fn record_progress(&self, height: u64) {
        let chain = self.ctx.chain();
        metrics::BLOCKS_PROCESSED.with_label_values(&[chain]).inc();
        metrics::LATEST_BLOCK
            .with_label_values(&[chain])
            .set(height as f64);
    }
}
