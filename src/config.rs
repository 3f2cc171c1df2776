//! Runtime configuration for netcache-ctl.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Switch geometry (lines, slots, slot width), wire widths, table and register
//! names and coherency timeouts all live here.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::ensure;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::switch::control::HashConfig;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "netcache-ctl", about = "In-network key-value cache backend and controller")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override the backend listen address (UDP and TCP share it).
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// `key=value` files loaded into the backend store at startup.
    #[arg(short, long)]
    pub data: Vec<PathBuf>,

    /// `key=value` file whose pairs are also placed in the switch cache.
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend server configuration.
    pub server: ServerConfig,

    /// Wire protocol widths.
    pub protocol: ProtocolConfig,

    /// Switch geometry and P4 object names.
    pub switch: SwitchConfig,

    /// Controller (report consumer) configuration.
    pub controller: ControllerConfig,

    /// Coherency handshake tuning.
    pub coherency: CoherencyConfig,
}

/// Backend server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for both the UDP and the TCP channel.
    pub listen: SocketAddr,

    /// Admin HTTP listen address (health, stats, metrics).
    pub admin_listen: SocketAddr,

    /// Where UpdateComplete messages go; `None` replies to the sender.
    pub update_target: Option<SocketAddr>,

    /// Receive buffer size for datagrams and TCP requests.
    pub max_datagram: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 50000)),
            admin_listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            update_target: None,
            max_datagram: 2048,
        }
    }
}

/// Wire protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Width of the value field in bytes.
    pub value_width: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { value_width: 64 }
    }
}

/// Switch geometry and names of the P4 objects the controller drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Number of lines (index positions across the value tables).
    pub lines: usize,

    /// Slots per line, one per value table (at most 8).
    pub slots_per_line: usize,

    /// Bytes held by one slot.
    pub slot_width: usize,

    /// Capacity of the counter/validity register arrays.
    pub max_ids: u32,

    /// Exact-match lookup table keyed by the canonical key.
    pub lookup_table: String,

    /// Action installed for cached keys.
    pub lookup_action: String,

    /// Prefix of the value table registers (`{prefix}{index}`).
    pub value_table_prefix: String,

    /// Per-key validity register.
    pub validity_register: String,

    /// Per-key query counter.
    pub counter_register: String,

    /// Measurement registers cleared periodically (counters, sketches, filters).
    pub measurement_registers: Vec<String>,

    /// Interval between measurement resets, in milliseconds.
    pub reset_interval_ms: u64,

    /// Hash units configured at controller startup.
    pub hashes: Vec<HashConfig>,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            lines: 1024,
            slots_per_line: 8,
            slot_width: 8,
            max_ids: 8192,
            lookup_table: "lookup_table".to_string(),
            lookup_action: "set_lookup_metadata".to_string(),
            value_table_prefix: "vt".to_string(),
            validity_register: "cache_status".to_string(),
            counter_register: "query_freq_cnt".to_string(),
            measurement_registers: vec![
                "query_freq_cnt".to_string(),
                "sketch1".to_string(),
                "sketch2".to_string(),
                "sketch3".to_string(),
                "sketch4".to_string(),
                "bloom1".to_string(),
                "bloom2".to_string(),
                "bloom3".to_string(),
            ],
            reset_interval_ms: 5_000,
            hashes: vec![
                HashConfig::crc32("hash_sketch1", 0x04C1_1DB7),
                HashConfig::crc32("hash_sketch2", 0x1EDC_6F41),
                HashConfig::crc32("hash_sketch3", 0xA833_982B),
                HashConfig::crc32("hash_sketch4", 0x8141_41AB),
            ],
        }
    }
}

impl SwitchConfig {
    /// Name of the register backing value table `index`.
    pub fn value_table(&self, index: usize) -> String {
        format!("{}{}", self.value_table_prefix, index)
    }

    /// Largest value a single key can occupy.
    pub fn max_value_size(&self) -> usize {
        self.slots_per_line * self.slot_width
    }
}

/// Controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// UDP address on which switch reports arrive.
    pub report_listen: SocketAddr,

    /// Backend address that receives UpdateCompleteAck messages.
    pub backend_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            report_listen: SocketAddr::from(([0, 0, 0, 0], 50001)),
            backend_addr: SocketAddr::from(([127, 0, 0, 1], 50000)),
        }
    }
}

/// Coherency handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoherencyConfig {
    /// Force-unblock after waiting this long for an UpdateCompleteAck
    /// (0 disables the timeout).
    pub ack_timeout_ms: u64,
}

impl Default for CoherencyConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2_000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the switch geometry and wire widths are consistent.
    pub fn validate(&self) -> anyhow::Result<()> {
        let sw = &self.switch;
        ensure!(
            (1..=8).contains(&sw.slots_per_line),
            "slots_per_line must be in 1..=8, got {}",
            sw.slots_per_line
        );
        ensure!(sw.slot_width > 0, "slot_width must be positive");
        ensure!(sw.lines > 0, "switch must have at least one line");
        ensure!(sw.max_ids > 0, "max_ids must be positive");
        ensure!(
            self.protocol.value_width > 0,
            "value_width must be positive"
        );
        ensure!(
            self.protocol.value_width <= sw.max_value_size(),
            "value_width {} exceeds slots_per_line * slot_width = {}",
            self.protocol.value_width,
            sw.max_value_size()
        );
        let full_message = crate::protocol::codec::HEADER_LEN + self.protocol.value_width;
        ensure!(
            self.server.max_datagram >= full_message,
            "max_datagram is smaller than a full message"
        );
        ensure!(sw.reset_interval_ms > 0, "reset_interval_ms must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.server.listen.port(), 50000);
        assert_eq!(cfg.switch.slots_per_line, 8);
        assert_eq!(cfg.protocol.value_width, 64);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_value_table_names() {
        let cfg = SwitchConfig::default();
        assert_eq!(cfg.value_table(0), "vt0");
        assert_eq!(cfg.value_table(7), "vt7");
        assert_eq!(cfg.max_value_size(), 64);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{ "switch": { "lines": 4, "slot_width": 16 } }"#).unwrap();
        assert_eq!(cfg.switch.lines, 4);
        assert_eq!(cfg.switch.slot_width, 16);
        assert_eq!(cfg.switch.slots_per_line, 8);
        assert_eq!(cfg.coherency.ack_timeout_ms, 2_000);
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let mut cfg = Config::default();
        cfg.switch.slots_per_line = 9;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.protocol.value_width = 128;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_reset_interval() {
        let mut cfg = Config::default();
        cfg.switch.reset_interval_ms = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("reset_interval_ms"));
    }

    #[test]
    fn test_load_rejects_zero_reset_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netcache.json");
        std::fs::write(&path, r#"{ "switch": { "reset_interval_ms": 0 } }"#).unwrap();
        assert!(Config::load(&path).is_err());
    }
}
