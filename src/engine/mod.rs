//! Relay & confirmation engine
//!
//! Three periodic tasks share one [`EngineContext`]:
//! - block ingestion feeds new external blocks to the classifier
//! - the confirmation queue dispatches records once they are deep enough
//! - the waiting queue runs the committee send-order ladder
//!
//! None of them starts before [`Engine::start_up`] has reloaded persisted
//! state and opened the startup gate.

pub mod classifier;
pub mod confirmation;
pub mod gate;
pub mod header_cache;
pub mod ingestion;
pub mod locks;
pub mod queue;
pub mod resend;
pub mod unconfirmed;
pub mod waiting;

use alloy::primitives::Address;
use eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainCapability, ExternalChainRpc, OutboundBroadcaster};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::home::HomeChain;
use crate::metrics;
use crate::store::TxStore;
use crate::types::{
    ExternalBlockHeader, OutboundJob, UnconfirmedTxRecord, WaitingBroadcastRecord,
};

pub use classifier::{BlockContext, Classification, TxClassifier};
pub use confirmation::ConfirmationScheduler;
pub use gate::StartupGate;
pub use header_cache::LocalHeaderCache;
pub use ingestion::{BlockIngestionScheduler, IngestOutcome};
pub use resend::{ResendEngine, SendOutcome};
pub use unconfirmed::UnconfirmedTxStore;
pub use waiting::{WaitingScheduler, WaitingTxStore};

/// Source of wall-clock time in unix milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Home-chain registration of the external chain's native coin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeAsset {
    pub asset_id: u32,
    pub decimals: u8,
}

/// Collaborators the engine is built from
#[derive(Clone)]
pub struct EngineDeps {
    pub rpc: Arc<dyn ExternalChainRpc>,
    pub home: Arc<dyn HomeChain>,
    pub capability: Arc<dyn ChainCapability>,
    pub broadcaster: Arc<dyn OutboundBroadcaster>,
    pub store: Arc<dyn TxStore>,
    pub clock: Arc<dyn Clock>,
}

/// Shared, read-only view handed to every engine component
pub struct EngineContext {
    pub rpc: Arc<dyn ExternalChainRpc>,
    pub home: Arc<dyn HomeChain>,
    pub capability: Arc<dyn ChainCapability>,
    pub broadcaster: Arc<dyn OutboundBroadcaster>,
    pub store: Arc<dyn TxStore>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub native: NativeAsset,
}

impl EngineContext {
    pub fn new(deps: EngineDeps, config: EngineConfig, native: NativeAsset) -> Self {
        Self {
            rpc: deps.rpc,
            home: deps.home,
            capability: deps.capability,
            broadcaster: deps.broadcaster,
            store: deps.store,
            clock: deps.clock,
            config,
            native,
        }
    }

    /// Chain label for logs and metrics
    pub fn chain(&self) -> &str {
        self.capability.chain_name()
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// This member's signing address
    pub fn me(&self) -> Address {
        self.broadcaster.sender_address()
    }
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub chain: String,
    pub gate_open: bool,
    pub latest_header: Option<ExternalBlockHeader>,
    pub unconfirmed: usize,
    pub waiting: usize,
}

/// Records currently held by the engine
#[derive(Debug, Clone, Serialize)]
pub struct PendingRecords {
    pub unconfirmed: Vec<UnconfirmedTxRecord>,
    pub waiting: Vec<WaitingBroadcastRecord>,
}

pub struct Engine {
    ctx: Arc<EngineContext>,
    gate: StartupGate,
    headers: Arc<LocalHeaderCache>,
    unconfirmed: Arc<UnconfirmedTxStore>,
    waiting: Arc<WaitingTxStore>,
    ingestion: BlockIngestionScheduler,
    confirmation: ConfirmationScheduler,
    waiting_scheduler: WaitingScheduler,
}

impl Engine {
    pub fn new(deps: EngineDeps, config: EngineConfig, native: NativeAsset) -> Self {
        let ctx = Arc::new(EngineContext::new(deps, config, native));
        let store = Arc::clone(&ctx.store);

        let headers = Arc::new(LocalHeaderCache::new(Arc::clone(&store)));
        let unconfirmed = Arc::new(UnconfirmedTxStore::new(Arc::clone(&store)));
        let waiting = Arc::new(WaitingTxStore::new(store));
        let resend = Arc::new(ResendEngine::new(
            Arc::clone(&ctx),
            Arc::clone(&waiting),
            Arc::clone(&unconfirmed),
        ));
        let classifier = Arc::new(TxClassifier::new(
            Arc::clone(&ctx),
            Arc::clone(&unconfirmed),
            Arc::clone(&waiting),
        ));

        let ingestion =
            BlockIngestionScheduler::new(Arc::clone(&ctx), Arc::clone(&headers), classifier);
        let confirmation = ConfirmationScheduler::new(
            Arc::clone(&ctx),
            Arc::clone(&unconfirmed),
            Arc::clone(&waiting),
            Arc::clone(&resend),
        );
        let waiting_scheduler =
            WaitingScheduler::new(Arc::clone(&ctx), Arc::clone(&waiting), resend);

        Self {
            ctx,
            gate: StartupGate::new(),
            headers,
            unconfirmed,
            waiting,
            ingestion,
            confirmation,
            waiting_scheduler,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn ingestion(&self) -> &BlockIngestionScheduler {
        &self.ingestion
    }

    pub fn classifier(&self) -> &TxClassifier {
        self.ingestion.classifier()
    }

    pub fn confirmation(&self) -> &ConfirmationScheduler {
        &self.confirmation
    }

    pub fn waiting_scheduler(&self) -> &WaitingScheduler {
        &self.waiting_scheduler
    }

    pub fn headers(&self) -> &LocalHeaderCache {
        &self.headers
    }

    pub fn unconfirmed(&self) -> &UnconfirmedTxStore {
        &self.unconfirmed
    }

    pub fn waiting(&self) -> &WaitingTxStore {
        &self.waiting
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_open()
    }

    /// Reload persisted state, then open the gate for the periodic tasks
    pub async fn start_up(&self) -> Result<()> {
        let latest = self.headers.load().await?;
        let unconfirmed = self.unconfirmed.load().await?;
        let waiting = self.waiting.load().await?;

        info!(
            chain = %self.ctx.chain(),
            latest_height = ?latest.map(|h| h.height),
            unconfirmed,
            waiting,
            "Engine state restored"
        );
        self.gate.open();
        Ok(())
    }

    /// Accept an outbound job from the home chain
    ///
    /// Returns `false` if the job was already waiting. A member first in send
    /// order broadcasts right away once the engine is started.
    pub async fn submit_outbound(&self, job: OutboundJob) -> Result<bool, EngineError> {
        let record = WaitingBroadcastRecord::new(
            job,
            &self.ctx.me(),
            self.ctx.now(),
            self.ctx.config.wait_interval_ms(),
        )?;
        let nerve_tx_hash = record.nerve_tx_hash.clone();
        let first = record.is_first_in_order();

        if !self.waiting.enqueue(record).await? {
            debug!(nerve_tx_hash = %nerve_tx_hash, "Outbound job already waiting");
            return Ok(false);
        }
        info!(
            nerve_tx_hash = %nerve_tx_hash,
            first_in_order = first,
            "Outbound job accepted"
        );

        if first && self.gate.is_open() {
            // Failures stay queued for the waiting task to retry
            if let Err(e) = self.waiting_scheduler.process(&nerve_tx_hash).await {
                warn!(nerve_tx_hash = %nerve_tx_hash, error = %e, "Immediate broadcast failed");
            }
        }
        Ok(true)
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            chain: self.ctx.chain().to_string(),
            gate_open: self.gate.is_open(),
            latest_header: self.headers.get_latest().await,
            unconfirmed: self.unconfirmed.len().await,
            waiting: self.waiting.len().await,
        }
    }

    pub async fn pending(&self) -> PendingRecords {
        PendingRecords {
            unconfirmed: self.unconfirmed.snapshot().await,
            waiting: self.waiting.snapshot().await,
        }
    }

    /// Run the periodic tasks until shutdown or a task dies
    pub async fn run(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();

        let engine = Arc::clone(&self);
        join_set.spawn(async move {
            let interval = engine.ctx.config.ingest_interval;
            engine.gate.wait().await;
            info!(chain = %engine.ctx.chain(), "Block ingestion started");
            loop {
                match engine.ingestion.round().await {
                    Ok(outcome) => debug!(?outcome, "Ingestion round"),
                    Err(e) => {
                        warn!(error = %e, "Ingestion round failed");
                        metrics::ERRORS
                            .with_label_values(&[engine.ctx.chain(), "ingestion", e.kind().as_str()])
                            .inc();
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        let engine = Arc::clone(&self);
        join_set.spawn(async move {
            let interval = engine.ctx.config.confirm_interval;
            engine.gate.wait().await;
            info!(chain = %engine.ctx.chain(), "Confirmation queue started");
            loop {
                engine.confirmation.round().await;
                tokio::time::sleep(interval).await;
            }
        });

        let engine = Arc::clone(&self);
        join_set.spawn(async move {
            let interval = engine.ctx.config.waiting_interval;
            engine.gate.wait().await;
            info!(chain = %engine.ctx.chain(), "Waiting queue started");
            loop {
                engine.waiting_scheduler.round().await;
                tokio::time::sleep(interval).await;
            }
        });

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping engine tasks");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Ok(())) => {
                        error!("An engine task exited unexpectedly");
                        Err(eyre::eyre!("engine task exited unexpectedly"))
                    }
                    Some(Err(e)) => {
                        error!("An engine task panicked: {:?}", e);
                        Err(eyre::eyre!("engine task panicked: {}", e))
                    }
                    None => Err(eyre::eyre!("no engine tasks running")),
                }
            }
        }
    }
}
