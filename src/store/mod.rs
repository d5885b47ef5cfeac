//! Persistence for headers, unconfirmed records, waiting broadcasts and
//! the external ↔ home transaction relation.
//!
//! The engine writes every field update through this trait in the same step
//! that reinserts the in-memory record, so a restart reloads a consistent view.

pub mod memory;
pub mod models;
pub mod pg;

use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::Result;

use crate::types::{ExternalBlockHeader, UnconfirmedTxRecord, WaitingBroadcastRecord};

pub use memory::MemoryStore;
pub use pg::PgStore;

#[async_trait]
pub trait TxStore: Send + Sync {
    // Block headers

    async fn latest_header(&self) -> Result<Option<ExternalBlockHeader>>;

    /// Persist a header and point "latest" at it
    async fn save_header(&self, header: &ExternalBlockHeader) -> Result<()>;

    async fn header_by_height(&self, height: u64) -> Result<Option<ExternalBlockHeader>>;

    /// Delete `height` and point "latest" at `height - 1` in one step.
    /// Returns the new latest header, `None` if `height - 1` is not stored.
    async fn roll_back_header(&self, height: u64) -> Result<Option<ExternalBlockHeader>>;

    async fn delete_all_headers(&self) -> Result<()>;

    // Unconfirmed records, keyed by external tx hash

    async fn save_unconfirmed(&self, record: &UnconfirmedTxRecord) -> Result<()>;

    async fn find_unconfirmed(&self, external_tx_hash: B256)
        -> Result<Option<UnconfirmedTxRecord>>;

    async fn remove_unconfirmed(&self, external_tx_hash: B256) -> Result<()>;

    async fn all_unconfirmed(&self) -> Result<Vec<UnconfirmedTxRecord>>;

    // Waiting broadcasts, keyed by home tx hash

    async fn save_waiting(&self, record: &WaitingBroadcastRecord) -> Result<()>;

    async fn remove_waiting(&self, nerve_tx_hash: &str) -> Result<()>;

    async fn all_waiting(&self) -> Result<Vec<WaitingBroadcastRecord>>;

    // Transactions sent by this node

    async fn save_relation(&self, external_tx_hash: B256, nerve_tx_hash: &str, sent_at: u64)
        -> Result<()>;

    async fn nerve_by_external(&self, external_tx_hash: B256) -> Result<Option<String>>;

    async fn remove_relations(&self, nerve_tx_hash: &str) -> Result<()>;
}
