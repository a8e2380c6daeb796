use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::engine::EngineError;
use crate::store::Store;

/// Per-user active-reservation limit, cached in front of the store.
///
/// Write-through: the store is authoritative and the cache only changes after
/// a successful write. The cache lock is held across the store write so no
/// reader observes the old value after the new one is durable.
pub struct QuotaPolicy {
    store: Arc<Store>,
    cached: RwLock<Option<u32>>,
    default_limit: u32,
}

impl QuotaPolicy {
    /// `default_limit` applies until an administrator persists a value.
    pub fn new(store: Arc<Store>, default_limit: u32) -> Self {
        Self {
            store,
            cached: RwLock::new(None),
            default_limit: default_limit.max(1),
        }
    }

    pub async fn max_active_reservations(&self) -> u32 {
        if let Some(limit) = *self.cached.read().await {
            return limit;
        }
        let mut cached = self.cached.write().await;
        if let Some(limit) = *cached {
            return limit;
        }
        let limit = self
            .store
            .read_quota_limit()
            .await
            .unwrap_or(self.default_limit);
        *cached = Some(limit);
        limit
    }

    pub async fn set_max_active_reservations(&self, limit: i64) -> Result<(), EngineError> {
        let limit = u32::try_from(limit)
            .ok()
            .filter(|l| *l > 0)
            .ok_or(EngineError::InvalidQuotaLimit(limit))?;
        let mut cached = self.cached.write().await;
        self.store.write_quota_limit(limit).await?;
        *cached = Some(limit);
        info!(limit, "max active reservations per user updated");
        Ok(())
    }

    /// Force the next read to go to the store.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}
