//! In-memory switch model.
//!
//! Holds tables, registers and counters the way a software switch would, so
//! the controller can run without hardware. Tests use the fault injection
//! hooks to exercise `SwitchUnavailable` paths.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::SwitchConfig;
use crate::switch::control::{ControlError, EntryHandle, HashConfig, SwitchControlPort};

/// An installed table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub handle: EntryHandle,
    pub action: String,
    pub match_fields: Vec<u128>,
    pub action_params: Vec<u64>,
}

#[derive(Debug, Default)]
struct SwitchState {
    tables: HashMap<String, Vec<TableEntry>>,
    registers: HashMap<String, Vec<Bytes>>,
    counters: HashMap<String, Vec<u64>>,
    hashes: Vec<HashConfig>,
    resets: HashMap<String, u64>,
    next_handle: EntryHandle,

    /// Remaining RPCs before the switch stops answering.
    budget: Option<usize>,

    /// Registers whose writes are rejected.
    failing: HashSet<String>,
}

impl SwitchState {
    fn spend(&mut self) -> Result<(), ControlError> {
        match self.budget.as_mut() {
            Some(0) => Err(ControlError::Rpc("switch unreachable".to_string())),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn writable(&mut self, name: &str) -> Result<&mut Vec<Bytes>, ControlError> {
        if self.failing.contains(name) {
            return Err(ControlError::Rpc(format!("write to {name} rejected")));
        }
        self.register_mut(name)
    }

    fn register_mut(&mut self, name: &str) -> Result<&mut Vec<Bytes>, ControlError> {
        self.registers
            .get_mut(name)
            .ok_or_else(|| ControlError::UnknownRegister(name.to_string()))
    }
}

/// Software model of the switch's control surface.
#[derive(Debug, Default)]
pub struct InMemorySwitch {
    state: Mutex<SwitchState>,
}

impl InMemorySwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the tables and registers named in the switch configuration.
    pub fn from_config(cfg: &SwitchConfig) -> Self {
        let mut state = SwitchState::default();
        state.tables.insert(cfg.lookup_table.clone(), Vec::new());
        for t in 0..cfg.slots_per_line {
            state
                .registers
                .insert(cfg.value_table(t), vec![Bytes::new(); cfg.lines]);
        }
        let ids = cfg.max_ids as usize;
        state
            .registers
            .insert(cfg.validity_register.clone(), vec![Bytes::new(); ids]);
        for name in &cfg.measurement_registers {
            state
                .registers
                .entry(name.clone())
                .or_insert_with(|| vec![Bytes::new(); ids]);
        }
        state.counters.insert(cfg.counter_register.clone(), vec![0; ids]);

        Self {
            state: Mutex::new(state),
        }
    }

    /// Let `calls` more RPCs succeed, then fail every call after that.
    pub async fn fail_after(&self, calls: usize) {
        self.state.lock().await.budget = Some(calls);
    }

    /// Reject every write to one register.
    pub async fn fail_register(&self, name: &str) {
        self.state.lock().await.failing.insert(name.to_string());
    }

    /// Restore normal operation after injected failures.
    pub async fn recover(&self) {
        let mut state = self.state.lock().await;
        state.budget = None;
        state.failing.clear();
    }

    /// Entries currently installed in a table.
    pub async fn table_entries(&self, table: &str) -> Vec<TableEntry> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Entry whose first match field equals `key`.
    pub async fn lookup(&self, table: &str, key: u128) -> Option<TableEntry> {
        self.state
            .lock()
            .await
            .tables
            .get(table)?
            .iter()
            .find(|e| e.match_fields.first() == Some(&key))
            .cloned()
    }

    /// Raw register cell.
    pub async fn register(&self, name: &str, index: u32) -> Option<Bytes> {
        self.state
            .lock()
            .await
            .registers
            .get(name)?
            .get(index as usize)
            .cloned()
    }

    /// Simulate data-plane traffic hitting a counter.
    pub async fn bump_counter(&self, name: &str, index: u32, by: u64) {
        let mut state = self.state.lock().await;
        if let Some(cell) = state
            .counters
            .get_mut(name)
            .and_then(|c| c.get_mut(index as usize))
        {
            *cell += by;
        }
    }

    /// How many times a register has been reset.
    pub async fn reset_count(&self, name: &str) -> u64 {
        self.state
            .lock()
            .await
            .resets
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub async fn configured_hashes(&self) -> Vec<HashConfig> {
        self.state.lock().await.hashes.clone()
    }
}

#[async_trait]
impl SwitchControlPort for InMemorySwitch {
    async fn add_table_entry(
        &self,
        table: &str,
        action: &str,
        match_fields: &[u128],
        action_params: &[u64],
    ) -> Result<EntryHandle, ControlError> {
        let mut state = self.state.lock().await;
        state.spend()?;

        let handle = state.next_handle;
        let entries = state
            .tables
            .get_mut(table)
            .ok_or_else(|| ControlError::UnknownTable(table.to_string()))?;
        if entries.iter().any(|e| e.match_fields == match_fields) {
            return Err(ControlError::Rpc(format!(
                "duplicate match key in table {table}"
            )));
        }
        entries.push(TableEntry {
            handle,
            action: action.to_string(),
            match_fields: match_fields.to_vec(),
            action_params: action_params.to_vec(),
        });
        state.next_handle += 1;

        debug!(table, handle, "Added table entry");
        Ok(handle)
    }

    async fn delete_table_entry(
        &self,
        table: &str,
        handle: EntryHandle,
    ) -> Result<(), ControlError> {
        let mut state = self.state.lock().await;
        state.spend()?;

        let entries = state
            .tables
            .get_mut(table)
            .ok_or_else(|| ControlError::UnknownTable(table.to_string()))?;
        let before = entries.len();
        entries.retain(|e| e.handle != handle);
        if entries.len() == before {
            return Err(ControlError::Rpc(format!(
                "no entry with handle {handle} in table {table}"
            )));
        }
        Ok(())
    }

    async fn write_register(
        &self,
        name: &str,
        index: u32,
        value: Bytes,
    ) -> Result<(), ControlError> {
        let mut state = self.state.lock().await;
        state.spend()?;

        let cell = state
            .writable(name)?
            .get_mut(index as usize)
            .ok_or_else(|| ControlError::IndexOutOfRange {
                name: name.to_string(),
                index,
            })?;
        *cell = value;
        Ok(())
    }

    async fn read_register(&self, name: &str, index: u32) -> Result<Bytes, ControlError> {
        let mut state = self.state.lock().await;
        state.spend()?;

        state
            .register_mut(name)?
            .get(index as usize)
            .cloned()
            .ok_or_else(|| ControlError::IndexOutOfRange {
                name: name.to_string(),
                index,
            })
    }

    async fn reset_register(&self, name: &str) -> Result<(), ControlError> {
        let mut state = self.state.lock().await;
        state.spend()?;

        if let Some(counters) = state.counters.get_mut(name) {
            counters.iter_mut().for_each(|c| *c = 0);
        } else {
            state
                .register_mut(name)?
                .iter_mut()
                .for_each(|cell| *cell = Bytes::new());
        }
        *state.resets.entry(name.to_string()).or_default() += 1;
        Ok(())
    }

    async fn read_counter(&self, name: &str, index: u32) -> Result<u64, ControlError> {
        let mut state = self.state.lock().await;
        state.spend()?;

        state
            .counters
            .get(name)
            .ok_or_else(|| ControlError::UnknownRegister(name.to_string()))?
            .get(index as usize)
            .copied()
            .ok_or_else(|| ControlError::IndexOutOfRange {
                name: name.to_string(),
                index,
            })
    }

    async fn configure_hash(&self, params: &HashConfig) -> Result<(), ControlError> {
        let mut state = self.state.lock().await;
        state.spend()?;

        state.hashes.retain(|h| h.name != params.name);
        state.hashes.push(params.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switch() -> InMemorySwitch {
        let cfg = SwitchConfig {
            lines: 4,
            max_ids: 4,
            ..Default::default()
        };
        InMemorySwitch::from_config(&cfg)
    }

    #[tokio::test]
    async fn test_register_write_and_read() {
        let sw = switch();
        sw.write_register("vt0", 2, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(&sw.read_register("vt0", 2).await.unwrap()[..], b"abc");
        assert!(matches!(
            sw.write_register("vt0", 4, Bytes::new()).await,
            Err(ControlError::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            sw.read_register("nope", 0).await,
            Err(ControlError::UnknownRegister(_))
        ));
    }

    #[tokio::test]
    async fn test_table_entries() {
        let sw = switch();
        let h = sw
            .add_table_entry("lookup_table", "set_lookup_metadata", &[7], &[128, 0, 0])
            .await
            .unwrap();
        assert!(sw
            .add_table_entry("lookup_table", "set_lookup_metadata", &[7], &[])
            .await
            .is_err());
        assert_eq!(sw.lookup("lookup_table", 7).await.unwrap().handle, h);

        sw.delete_table_entry("lookup_table", h).await.unwrap();
        assert!(sw.lookup("lookup_table", 7).await.is_none());
        assert!(sw.delete_table_entry("lookup_table", h).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_after() {
        let sw = switch();
        sw.fail_after(1).await;
        assert!(sw.write_register("vt0", 0, Bytes::new()).await.is_ok());
        assert!(matches!(
            sw.write_register("vt0", 1, Bytes::new()).await,
            Err(ControlError::Rpc(_))
        ));
        sw.recover().await;
        assert!(sw.write_register("vt0", 1, Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_counter_reset() {
        let sw = switch();
        sw.bump_counter("query_freq_cnt", 1, 5).await;
        assert_eq!(sw.read_counter("query_freq_cnt", 1).await.unwrap(), 5);
        sw.reset_register("query_freq_cnt").await.unwrap();
        assert_eq!(sw.read_counter("query_freq_cnt", 1).await.unwrap(), 0);
        assert_eq!(sw.reset_count("query_freq_cnt").await, 1);
    }
}
