//! Local header cache
//!
//! In-memory pointer to the newest synced external header, backed by the
//! header table of the store. Used for fork detection and rollback.

use eyre::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::store::TxStore;
use crate::types::ExternalBlockHeader;

pub struct LocalHeaderCache {
    store: Arc<dyn TxStore>,
    latest: RwLock<Option<ExternalBlockHeader>>,
}

impl LocalHeaderCache {
    pub fn new(store: Arc<dyn TxStore>) -> Self {
        Self {
            store,
            latest: RwLock::new(None),
        }
    }

    /// Reload the latest pointer from the store
    pub async fn load(&self) -> Result<Option<ExternalBlockHeader>> {
        let latest = self.store.latest_header().await?;
        *self.latest.write().await = latest;
        Ok(latest)
    }

    pub async fn get_latest(&self) -> Option<ExternalBlockHeader> {
        *self.latest.read().await
    }

    pub async fn save(&self, header: ExternalBlockHeader) -> Result<()> {
        self.store.save_header(&header).await?;
        *self.latest.write().await = Some(header);
        Ok(())
    }

    pub async fn find_by_height(&self, height: u64) -> Result<Option<ExternalBlockHeader>> {
        if let Some(latest) = self.get_latest().await {
            if latest.height == height {
                return Ok(Some(latest));
            }
        }
        self.store.header_by_height(height).await
    }

    /// Remove `height` and re-point latest to `height - 1`, or clear it if that header is absent
    pub async fn delete_by_height(&self, height: u64) -> Result<()> {
        let previous = self.store.roll_back_header(height).await?;
        *self.latest.write().await = previous;

        debug!(
            height,
            new_latest = ?previous.map(|h| h.height),
            "Header rolled back"
        );
        Ok(())
    }

    /// Drop all local history; the next sync starts fresh
    pub async fn delete_all_and_rewind(&self) -> Result<()> {
        self.store.delete_all_headers().await?;
        *self.latest.write().await = None;
        Ok(())
    }
}
