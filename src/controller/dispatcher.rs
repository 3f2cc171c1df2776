//! Routing of switch reports to the key directory.
//!
//! The switch sends three kinds of report: a hot key it wants cached (the
//! backend's HotRead reply carries the value), a completed delete, and a
//! completed update. Updates are acknowledged back to the backend so its
//! coherency coordinator can reopen.

use tracing::{debug, info, warn};

use crate::cache::directory::{DirectoryError, SharedDirectory};
use crate::metrics::Metrics;
use crate::protocol::{Opcode, WireMessage};

/// What handling a report did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A hot key was placed in the switch cache.
    Promoted,
    /// A delete was applied; `false` if the key was not cached.
    Evicted(bool),
    /// An update was applied; send this ack to the backend.
    Acknowledge(WireMessage),
    /// Nothing to do.
    Ignored,
}

pub struct ReportDispatcher {
    directory: SharedDirectory,
    metrics: Metrics,
}

impl ReportDispatcher {
    pub fn new(directory: SharedDirectory, metrics: Metrics) -> Self {
        Self { directory, metrics }
    }

    pub fn directory(&self) -> &SharedDirectory {
        &self.directory
    }

    /// Apply one report. Errors are returned for logging; the caller keeps
    /// serving.
    pub async fn handle_report(
        &self,
        msg: &WireMessage,
    ) -> Result<DispatchOutcome, DirectoryError> {
        let result = self.dispatch(msg).await;
        let outcome = match &result {
            Ok(DispatchOutcome::Ignored) => "ignored",
            Ok(_) => "ok",
            Err(_) => "error",
        };
        self.metrics
            .reports
            .with_label_values(&[msg.op.name(), outcome])
            .inc();
        self.refresh_gauges().await;
        result
    }

    async fn dispatch(&self, msg: &WireMessage) -> Result<DispatchOutcome, DirectoryError> {
        let key = msg.key;
        match msg.op {
            Opcode::HotRead if msg.value.is_empty() => {
                debug!(%key, "Hot key has no backend value");
                Ok(DispatchOutcome::Ignored)
            }
            Opcode::HotRead => {
                let mut directory = self.directory.lock().await;
                if directory.contains(&key) {
                    debug!(%key, "Hot key already cached");
                    return Ok(DispatchOutcome::Ignored);
                }
                directory.insert(key, &msg.value).await?;
                info!(%key, "Promoted hot key");
                Ok(DispatchOutcome::Promoted)
            }
            Opcode::DeleteComplete => {
                let evicted = self.directory.lock().await.evict(&key).await?;
                Ok(DispatchOutcome::Evicted(evicted))
            }
            Opcode::UpdateComplete => {
                let mut directory = self.directory.lock().await;
                match directory.update(key, &msg.value).await {
                    Ok(_) => {}
                    // The stale entry is gone, so the backend may reopen even
                    // though the key was not re-cached. A failed evict leaves
                    // the key cached and goes unacknowledged.
                    Err(e) if !directory.contains(&key) => {
                        warn!(%key, "Updated key left uncached: {e}");
                    }
                    Err(e) => return Err(e),
                }
                Ok(DispatchOutcome::Acknowledge(
                    msg.reply(Opcode::UpdateCompleteAck, bytes::Bytes::new()),
                ))
            }
            Opcode::KeyNotFound => {
                debug!(%key, "Probe for key the backend does not hold");
                Ok(DispatchOutcome::Ignored)
            }
            other => {
                warn!(op = %other, %key, "Unexpected report dropped");
                Ok(DispatchOutcome::Ignored)
            }
        }
    }

    async fn refresh_gauges(&self) {
        let stats = self.directory.lock().await.stats();
        self.metrics.cached_keys.set(stats.keys as i64);
        self.metrics.free_slots.set(stats.free_slots as i64);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::cache::directory::new_shared_directory;
    use crate::config::SwitchConfig;
    use crate::protocol::CacheKey;
    use crate::switch::memory::InMemorySwitch;

    fn setup() -> (ReportDispatcher, Arc<InMemorySwitch>) {
        let cfg = SwitchConfig {
            lines: 2,
            max_ids: 8,
            ..Default::default()
        };
        let switch = Arc::new(InMemorySwitch::from_config(&cfg));
        let directory = new_shared_directory(switch.clone(), cfg);
        (
            ReportDispatcher::new(directory, Metrics::new().unwrap()),
            switch,
        )
    }

    fn key(s: &str) -> CacheKey {
        s.parse().unwrap()
    }

    fn report(op: Opcode, k: &str, v: &'static [u8]) -> WireMessage {
        WireMessage::new(op, 7, key(k), Bytes::from_static(v))
    }

    #[tokio::test]
    async fn test_hot_read_promotes() {
        let (d, _) = setup();
        let outcome = d.handle_report(&report(Opcode::HotRead, "hot", b"value")).await;
        assert_eq!(outcome.unwrap(), DispatchOutcome::Promoted);

        let dir = d.directory().lock().await;
        assert_eq!(&dir.read(&key("hot")).await.unwrap()[..], b"value");
    }

    #[tokio::test]
    async fn test_hot_read_twice_is_ignored() {
        let (d, _) = setup();
        d.handle_report(&report(Opcode::HotRead, "hot", b"v")).await.unwrap();
        let again = d.handle_report(&report(Opcode::HotRead, "hot", b"v")).await;
        assert_eq!(again.unwrap(), DispatchOutcome::Ignored);
        assert_eq!(d.directory().lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_hot_read_and_key_not_found_are_noops() {
        let (d, _) = setup();
        for msg in [
            report(Opcode::HotRead, "cold", b""),
            report(Opcode::KeyNotFound, "cold", b""),
            report(Opcode::MetricsReport, "cold", b""),
        ] {
            assert_eq!(d.handle_report(&msg).await.unwrap(), DispatchOutcome::Ignored);
        }
        assert!(d.directory().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_complete_evicts() {
        let (d, _) = setup();
        d.handle_report(&report(Opcode::HotRead, "k", b"v")).await.unwrap();
        let outcome = d.handle_report(&report(Opcode::DeleteComplete, "k", b"")).await;
        assert_eq!(outcome.unwrap(), DispatchOutcome::Evicted(true));
        let outcome = d.handle_report(&report(Opcode::DeleteComplete, "k", b"")).await;
        assert_eq!(outcome.unwrap(), DispatchOutcome::Evicted(false));
    }

    #[tokio::test]
    async fn test_update_complete_refreshes_and_acks() {
        let (d, _) = setup();
        d.handle_report(&report(Opcode::HotRead, "ten", b"v")).await.unwrap();

        let outcome = d
            .handle_report(&report(Opcode::UpdateComplete, "ten", b"newvalue"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Acknowledge(WireMessage::bare(
                Opcode::UpdateCompleteAck,
                7,
                key("ten")
            ))
        );
        let dir = d.directory().lock().await;
        assert_eq!(&dir.read(&key("ten")).await.unwrap()[..], b"newvalue");
    }

    #[tokio::test]
    async fn test_update_complete_failed_evict_is_not_acked() {
        let (d, switch) = setup();
        d.handle_report(&report(Opcode::HotRead, "k", b"v")).await.unwrap();
        switch.fail_after(0).await;

        let result = d.handle_report(&report(Opcode::UpdateComplete, "k", b"v2")).await;
        assert!(matches!(result, Err(DirectoryError::SwitchUnavailable(_))));
        switch.recover().await;
        assert!(d.directory().lock().await.contains(&key("k")));
    }

    #[tokio::test]
    async fn test_update_complete_acked_when_reinsert_fails() {
        let (d, _) = setup();
        d.handle_report(&report(Opcode::HotRead, "k", b"v")).await.unwrap();

        // Empty value cannot be re-cached, but the stale copy is gone.
        let outcome = d
            .handle_report(&report(Opcode::UpdateComplete, "k", b""))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Acknowledge(_)));
        assert!(!d.directory().lock().await.contains(&key("k")));
    }

    #[tokio::test]
    async fn test_gauges_follow_directory() {
        let (d, _) = setup();
        d.handle_report(&report(Opcode::HotRead, "a", b"12345678")).await.unwrap();
        assert_eq!(d.metrics.cached_keys.get(), 1);
        assert_eq!(d.metrics.free_slots.get(), 15);
    }
}
