//! Periodic reset of switch-side measurement registers.
//!
//! Query counters, count-min sketches and bloom filters in the data plane
//! only describe the recent window, so they are cleared on a fixed interval.

use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::SwitchConfig;
use crate::switch::control::SharedControlPort;

/// Clears a fixed set of registers on every tick.
pub struct MeasurementReset {
    port: SharedControlPort,
    registers: Vec<String>,
    interval: Duration,
}

impl MeasurementReset {
    pub fn new(port: SharedControlPort, cfg: &SwitchConfig) -> Self {
        Self {
            port,
            registers: cfg.measurement_registers.clone(),
            interval: Duration::from_millis(cfg.reset_interval_ms),
        }
    }

    /// Reset every register once. Returns how many resets failed.
    pub async fn reset_all(&self) -> usize {
        let results = join_all(
            self.registers
                .iter()
                .map(|name| async move { (name, self.port.reset_register(name).await) }),
        )
        .await;

        let mut failed = 0;
        for (name, result) in results {
            if let Err(e) = result {
                warn!(register = %name, "Measurement reset failed: {e}");
                failed += 1;
            }
        }
        debug!(
            registers = self.registers.len(),
            failed, "Measurement registers reset"
        );
        failed
    }

    /// Run forever. Failures are logged; the next tick retries.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.reset_all().await;
        }
    }
}
