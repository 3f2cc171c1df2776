//! Prometheus metrics.
//!
//! Every backend/controller pairing owns its own registry, so several
//! instances can live in one process (tests do exactly that).

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

const PREFIX: &str = "netcache";

fn name(suffix: &str) -> String {
    format!("{PREFIX}_{suffix}")
}

/// Metric handles for one instance.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Requests received, by opcode and channel (`udp`/`tcp`).
    pub requests: IntCounterVec,

    /// Datagrams or requests dropped, by reason.
    pub dropped: IntCounterVec,

    /// Requests currently waiting behind a switch update.
    pub deferred: IntGauge,

    /// Completed update handshakes.
    pub handshakes: IntCounter,

    /// Handshakes abandoned after the ack timeout.
    pub coherency_timeouts: IntCounter,

    /// Switch reports handled, by opcode and outcome (`ok`/`error`/`ignored`).
    pub reports: IntCounterVec,

    /// Keys resident in the switch cache.
    pub cached_keys: IntGauge,

    /// Unassigned value-table slots.
    pub free_slots: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(name("requests_total"), "Requests received (labels: op, channel)"),
            &["op", "channel"],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new(name("dropped_total"), "Messages dropped (label: reason)"),
            &["reason"],
        )?;
        let deferred = IntGauge::new(
            name("deferred_requests"),
            "Requests queued behind an in-flight switch update",
        )?;
        let handshakes = IntCounter::new(
            name("coherency_handshakes_total"),
            "Update handshakes completed by an acknowledgment",
        )?;
        let coherency_timeouts = IntCounter::new(
            name("coherency_timeouts_total"),
            "Update handshakes force-completed after the ack timeout",
        )?;
        let reports = IntCounterVec::new(
            Opts::new(name("reports_total"), "Switch reports handled (labels: op, outcome)"),
            &["op", "outcome"],
        )?;
        let cached_keys = IntGauge::new(name("cached_keys"), "Keys resident in the switch cache")?;
        let free_slots = IntGauge::new(name("free_slots"), "Unassigned value-table slots")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(deferred.clone()))?;
        registry.register(Box::new(handshakes.clone()))?;
        registry.register(Box::new(coherency_timeouts.clone()))?;
        registry.register(Box::new(reports.clone()))?;
        registry.register(Box::new(cached_keys.clone()))?;
        registry.register(Box::new(free_slots.clone()))?;

        Ok(Self {
            registry,
            requests,
            dropped,
            deferred,
            handshakes,
            coherency_timeouts,
            reports,
            cached_keys,
            free_slots,
        })
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.handshakes.inc();
        assert_eq!(a.handshakes.get(), 1);
        assert_eq!(b.handshakes.get(), 0);
    }

    #[test]
    fn test_render() {
        let m = Metrics::new().unwrap();
        m.requests.with_label_values(&["read", "udp"]).inc();
        let text = m.render().unwrap();
        assert!(text.contains("netcache_requests_total"));
        assert!(text.contains("op=\"read\""));
    }
}
