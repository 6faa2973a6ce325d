use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per asset id, serialising manifest rebuild and upload
/// within this process.
#[derive(Debug, Default, Clone)]
pub struct AssetLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl AssetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, asset_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(asset_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_asset_waits() {
        let locks = AssetLocks::new();
        let held = locks.acquire("asset-1").await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), locks.acquire("asset-1")).await;
        assert!(blocked.is_err());
        drop(held);
        let acquired =
            tokio::time::timeout(Duration::from_millis(50), locks.acquire("asset-1")).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn different_assets_do_not_block() {
        let locks = AssetLocks::new();
        let _first = locks.acquire("asset-1").await;
        let second =
            tokio::time::timeout(Duration::from_millis(50), locks.acquire("asset-2")).await;
        assert!(second.is_ok());
    }
}
