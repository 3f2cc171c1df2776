//! Switch controller.
//!
//! - [`dispatcher`]: applies switch reports to the key directory
//! - [`reports`]: UDP loop feeding the dispatcher
//!
//! Startup helpers program the hash units and warm the cache from a file.

pub mod dispatcher;
pub mod reports;

use bytes::Bytes;
use tracing::{info, warn};

use crate::cache::directory::SharedDirectory;
use crate::config::SwitchConfig;
use crate::protocol::CacheKey;
use crate::switch::control::{ControlError, SwitchControlPort};

/// Program every configured hash unit.
pub async fn configure_switch(
    port: &dyn SwitchControlPort,
    cfg: &SwitchConfig,
) -> Result<(), ControlError> {
    for hash in &cfg.hashes {
        port.configure_hash(hash).await?;
    }
    info!(hashes = cfg.hashes.len(), "Configured switch hash units");
    Ok(())
}

/// Place pairs in the switch cache. Keys that do not fit are logged and
/// skipped. Returns how many were cached.
pub async fn warm_cache(directory: &SharedDirectory, pairs: &[(CacheKey, Bytes)]) -> usize {
    let mut directory = directory.lock().await;
    let mut cached = 0;
    for (key, value) in pairs {
        match directory.insert(*key, value).await {
            Ok(_) => cached += 1,
            Err(e) => warn!(%key, "Not cached at startup: {e}"),
        }
    }
    info!(cached, skipped = pairs.len() - cached, "Warmed switch cache");
    cached
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::directory::new_shared_directory;
    use crate::switch::memory::InMemorySwitch;

    #[tokio::test]
    async fn test_configure_switch_programs_hashes() {
        let cfg = SwitchConfig::default();
        let sw = InMemorySwitch::from_config(&cfg);
        configure_switch(&sw, &cfg).await.unwrap();
        assert_eq!(sw.configured_hashes().await, cfg.hashes);
    }

    #[tokio::test]
    async fn test_warm_cache_skips_what_does_not_fit() {
        let cfg = SwitchConfig {
            lines: 1,
            max_ids: 8,
            ..Default::default()
        };
        let sw = Arc::new(InMemorySwitch::from_config(&cfg));
        let directory = new_shared_directory(sw, cfg);

        let pairs: Vec<(CacheKey, Bytes)> = [("a", 40), ("b", 32), ("c", 24)]
            .into_iter()
            .map(|(k, n)| (k.parse().unwrap(), Bytes::from(vec![b'x'; n])))
            .collect();
        // 5 slots, then 4 does not fit, then 3 fills the line.
        assert_eq!(warm_cache(&directory, &pairs).await, 2);
        assert_eq!(directory.lock().await.stats().free_slots, 0);
    }
}
