//! Key directory: which keys live in the switch cache, and where.
//!
//! The directory is the only writer of the switch cache. Inserting a key:
//! 1. Claims slots from the [`SlotAllocator`] and an id from the [`IdPool`]
//! 2. Stripes the value over the value tables, one register write per slot
//! 3. Publishes a lookup-table entry `key -> (bitmap, line, id)`
//! 4. Marks the key's validity register valid
//!
//! Register writes issued before a failed RPC are not rolled back. The
//! directory releases its own bookkeeping so the key simply reads as a miss.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::allocator::{Allocation, AllocatorError, SlotAllocator};
use crate::cache::ids::IdPool;
use crate::config::SwitchConfig;
use crate::protocol::key::strip_padding;
use crate::protocol::CacheKey;
use crate::switch::control::{ControlError, EntryHandle, SharedControlPort};

/// Validity register value for a servable key.
const VALID: &[u8] = &[1];

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error("Key {0} is not cached")]
    KeyNotFound(CacheKey),

    #[error("No free counter/validity index")]
    IdsExhausted,

    #[error("Switch unavailable: {0}")]
    SwitchUnavailable(#[from] ControlError),
}

/// A cached key's location on the switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyEntry {
    pub key: CacheKey,
    pub line: usize,
    pub bitmap: u8,
    /// Index into the counter and validity registers.
    pub id: u32,
    /// Lookup-table entry handle.
    pub handle: EntryHandle,
}

/// Occupancy summary.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryStats {
    pub keys: usize,
    pub lines: usize,
    pub lines_in_use: usize,
    pub total_slots: usize,
    pub free_slots: usize,
    pub utilization: f64,
    pub ids_in_use: usize,
}

/// Authoritative key -> switch location mapping.
pub struct KeyDirectory {
    allocator: SlotAllocator,
    ids: IdPool,
    entries: HashMap<CacheKey, KeyEntry>,
    port: SharedControlPort,
    switch: SwitchConfig,
}

impl KeyDirectory {
    pub fn new(port: SharedControlPort, switch: SwitchConfig) -> Self {
        Self {
            allocator: SlotAllocator::new(switch.lines, switch.slots_per_line, switch.slot_width),
            ids: IdPool::new(switch.max_ids),
            entries: HashMap::new(),
            port,
            switch,
        }
    }

    /// Place a key in the switch cache.
    pub async fn insert(
        &mut self,
        key: CacheKey,
        value: &[u8],
    ) -> Result<KeyEntry, DirectoryError> {
        let allocation = self.allocator.allocate(key, value.len())?;

        let Some(id) = self.ids.allocate() else {
            self.allocator.release(&key)?;
            return Err(DirectoryError::IdsExhausted);
        };

        match self.publish(key, value, allocation, id).await {
            Ok(handle) => {
                let entry = KeyEntry {
                    key,
                    line: allocation.line,
                    bitmap: allocation.bitmap,
                    id,
                    handle,
                };
                self.entries.insert(key, entry.clone());
                info!(
                    %key,
                    line = entry.line,
                    bitmap = entry.bitmap,
                    id,
                    "Inserted key into switch cache"
                );
                Ok(entry)
            }
            Err(e) => {
                self.allocator.release(&key)?;
                self.ids.release(id);
                warn!(
                    %key,
                    line = allocation.line,
                    "Switch insert failed, value registers may hold partial data: {e}"
                );
                Err(e.into())
            }
        }
    }

    /// Write the value registers, the lookup entry and the validity bit.
    async fn publish(
        &self,
        key: CacheKey,
        value: &[u8],
        allocation: Allocation,
        id: u32,
    ) -> Result<EntryHandle, ControlError> {
        let line = allocation.line as u32;
        let chunks = stripe(value, allocation.slots(), self.allocator.slot_width());
        let tables = self.allocator.value_tables(allocation.bitmap);

        for (table, chunk) in tables.into_iter().zip(chunks) {
            self.port
                .write_register(&self.switch.value_table(table), line, chunk)
                .await?;
        }

        let handle = self
            .port
            .add_table_entry(
                &self.switch.lookup_table,
                &self.switch.lookup_action,
                &[key.as_u128()],
                &[
                    u64::from(allocation.bitmap),
                    allocation.line as u64,
                    u64::from(id),
                ],
            )
            .await?;

        if let Err(e) = self
            .port
            .write_register(&self.switch.validity_register, id, Bytes::from_static(VALID))
            .await
        {
            if let Err(cleanup) = self
                .port
                .delete_table_entry(&self.switch.lookup_table, handle)
                .await
            {
                error!(%key, handle, "Could not withdraw lookup entry: {cleanup}");
            }
            return Err(e);
        }

        Ok(handle)
    }

    /// Remove a key from the switch cache. Absent keys are a successful no-op.
    ///
    /// Returns whether the key was cached.
    pub async fn evict(&mut self, key: &CacheKey) -> Result<bool, DirectoryError> {
        let Some(entry) = self.entries.get(key).cloned() else {
            debug!(%key, "Evict of uncached key ignored");
            return Ok(false);
        };

        self.port
            .delete_table_entry(&self.switch.lookup_table, entry.handle)
            .await?;

        self.entries.remove(key);
        self.allocator.release(key)?;
        self.ids.release(entry.id);

        // The next key to take this id starts out valid.
        if let Err(e) = self
            .port
            .write_register(&self.switch.validity_register, entry.id, Bytes::from_static(VALID))
            .await
        {
            warn!(%key, id = entry.id, "Could not reset validity register: {e}");
        }

        info!(%key, line = entry.line, bitmap = entry.bitmap, "Evicted key from switch cache");
        Ok(true)
    }

    /// Replace a cached value: evict, then insert.
    ///
    /// Not atomic. Readers may miss between the two steps, and if the insert
    /// fails the key stays uncached (the backend still serves it).
    pub async fn update(
        &mut self,
        key: CacheKey,
        value: &[u8],
    ) -> Result<KeyEntry, DirectoryError> {
        self.evict(&key).await?;
        self.insert(key, value).await.inspect_err(|e| {
            error!(%key, "Re-insert after eviction failed, key left uncached: {e}");
        })
    }

    /// Read a cached value back from the value tables.
    pub async fn read(&self, key: &CacheKey) -> Result<Bytes, DirectoryError> {
        let entry = self
            .entries
            .get(key)
            .ok_or(DirectoryError::KeyNotFound(*key))?;

        let mut value = BytesMut::new();
        for table in self.allocator.value_tables(entry.bitmap) {
            let chunk = self
                .port
                .read_register(&self.switch.value_table(table), entry.line as u32)
                .await?;
            value.extend_from_slice(&chunk);
        }
        Ok(Bytes::copy_from_slice(strip_padding(&value)))
    }

    /// Data-plane query count recorded for a cached key.
    pub async fn hits(&self, key: &CacheKey) -> Result<u64, DirectoryError> {
        let entry = self
            .entries
            .get(key)
            .ok_or(DirectoryError::KeyNotFound(*key))?;
        Ok(self
            .port
            .read_counter(&self.switch.counter_register, entry.id)
            .await?)
    }

    pub fn get(&self, key: &CacheKey) -> Option<&KeyEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Occupancy bitmap of every line.
    pub fn memory_pool(&self) -> &[u8] {
        self.allocator.lines()
    }

    pub fn stats(&self) -> DirectoryStats {
        DirectoryStats {
            keys: self.entries.len(),
            lines: self.allocator.lines().len(),
            lines_in_use: self.allocator.lines_in_use(),
            total_slots: self.allocator.total_slots(),
            free_slots: self.allocator.free_slots(),
            utilization: self.allocator.utilization(),
            ids_in_use: self.ids.in_use(),
        }
    }
}

/// Pad `value` on the high-order side to `slots * width` bytes and split it
/// into one chunk per slot.
fn stripe(value: &[u8], slots: usize, width: usize) -> Vec<Bytes> {
    let mut buf = BytesMut::zeroed(slots * width - value.len());
    buf.extend_from_slice(value);
    let mut buf = buf.freeze();
    (0..slots).map(|_| buf.split_to(width)).collect()
}

/// Thread-safe wrapper around the directory.
pub type SharedDirectory = Arc<Mutex<KeyDirectory>>;

/// Create a new thread-safe directory.
pub fn new_shared_directory(port: SharedControlPort, switch: SwitchConfig) -> SharedDirectory {
    Arc::new(Mutex::new(KeyDirectory::new(port, switch)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::memory::InMemorySwitch;

    fn setup(lines: usize) -> (Arc<InMemorySwitch>, KeyDirectory) {
        let cfg = SwitchConfig {
            lines,
            max_ids: 16,
            ..Default::default()
        };
        let sw = Arc::new(InMemorySwitch::from_config(&cfg));
        let dir = KeyDirectory::new(sw.clone(), cfg);
        (sw, dir)
    }

    fn key(s: &str) -> CacheKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_stripe_pads_high_order() {
        let chunks = stripe(b"abcdefghij", 2, 8);
        assert_eq!(&chunks[0][..], b"\0\0\0\0\0\0ab");
        assert_eq!(&chunks[1][..], b"cdefghij");
    }

    #[tokio::test]
    async fn test_insert_then_read() {
        let (sw, mut dir) = setup(4);
        let entry = dir.insert(key("one"), b"alpha").await.unwrap();
        assert_eq!(entry.line, 0);
        assert_eq!(entry.bitmap, 0b1000_0000);
        assert_eq!(entry.id, 0);

        assert_eq!(&dir.read(&key("one")).await.unwrap()[..], b"alpha");

        let published = sw.lookup("lookup_table", key("one").as_u128()).await.unwrap();
        assert_eq!(published.action, "set_lookup_metadata");
        assert_eq!(published.action_params, vec![0b1000_0000, 0, 0]);
        assert_eq!(&sw.register("cache_status", 0).await.unwrap()[..], VALID);
    }

    #[tokio::test]
    async fn test_multi_slot_value_is_striped_in_table_order() {
        let (sw, mut dir) = setup(1);
        dir.insert(key("a"), b"x").await.unwrap();
        let entry = dir.insert(key("b"), b"0123456789abcdef!").await.unwrap();
        assert_eq!(entry.bitmap, 0b0111_0000);

        // Tables 1..=3 hold the padded value in order.
        assert_eq!(&sw.register("vt1", 0).await.unwrap()[..], b"\0\0\0\0\0\0\0\x30");
        assert_eq!(&sw.register("vt2", 0).await.unwrap()[..], b"12345678");
        assert_eq!(&sw.register("vt3", 0).await.unwrap()[..], b"9abcdef!");
        assert_eq!(&dir.read(&key("b")).await.unwrap()[..], b"0123456789abcdef!");
    }

    #[tokio::test]
    async fn test_evict_restores_state() {
        let (sw, mut dir) = setup(2);
        dir.insert(key("keep"), b"v").await.unwrap();
        let pool = dir.memory_pool().to_vec();
        let ids = dir.stats().ids_in_use;

        dir.insert(key("tmp"), b"some longer value").await.unwrap();
        assert!(dir.evict(&key("tmp")).await.unwrap());

        assert_eq!(dir.memory_pool(), &pool[..]);
        assert_eq!(dir.stats().ids_in_use, ids);
        assert!(sw.lookup("lookup_table", key("tmp").as_u128()).await.is_none());
        assert_eq!(sw.table_entries("lookup_table").await.len(), 1);
    }

    #[tokio::test]
    async fn test_evict_missing_is_noop() {
        let (sw, mut dir) = setup(2);
        dir.insert(key("one"), b"alpha").await.unwrap();
        let pool = dir.memory_pool().to_vec();

        assert!(!dir.evict(&key("missing-key")).await.unwrap());
        assert_eq!(dir.memory_pool(), &pool[..]);
        assert_eq!(dir.len(), 1);
        assert_eq!(sw.table_entries("lookup_table").await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let (_sw, mut dir) = setup(2);
        dir.insert(key("one"), b"alpha").await.unwrap();
        let err = dir.insert(key("one"), b"beta").await.unwrap_err();
        assert!(matches!(
            err,
            DirectoryError::Allocator(AllocatorError::DuplicateKey(_))
        ));
        assert_eq!(&dir.read(&key("one")).await.unwrap()[..], b"alpha");
    }

    #[tokio::test]
    async fn test_update_replaces_value() {
        let (_sw, mut dir) = setup(1);
        let old = dir.insert(key("ten"), b"x").await.unwrap();
        let new = dir.update(key("ten"), b"newvalue").await.unwrap();
        assert_eq!(old.bitmap, new.bitmap);
        assert_eq!(dir.memory_pool()[0], 0b1000_0000);
        assert_eq!(&dir.read(&key("ten")).await.unwrap()[..], b"newvalue");
    }

    #[tokio::test]
    async fn test_ids_exhausted_releases_slots() {
        let cfg = SwitchConfig {
            lines: 4,
            max_ids: 1,
            ..Default::default()
        };
        let sw = Arc::new(InMemorySwitch::from_config(&cfg));
        let mut dir = KeyDirectory::new(sw, cfg);

        dir.insert(key("a"), b"1").await.unwrap();
        let pool = dir.memory_pool().to_vec();
        assert!(matches!(
            dir.insert(key("b"), b"2").await,
            Err(DirectoryError::IdsExhausted)
        ));
        assert_eq!(dir.memory_pool(), &pool[..]);
    }

    #[tokio::test]
    async fn test_switch_failure_mid_insert() {
        let (sw, mut dir) = setup(2);
        // Two value-register writes succeed, the third RPC fails.
        sw.fail_after(2).await;
        let err = dir.insert(key("big"), &[b'v'; 24]).await.unwrap_err();
        assert!(matches!(err, DirectoryError::SwitchUnavailable(_)));

        sw.recover().await;
        assert!(!dir.contains(&key("big")));
        assert_eq!(dir.memory_pool(), &[0, 0]);
        assert_eq!(dir.stats().ids_in_use, 0);
        // Partial data stays in the registers.
        assert_eq!(&sw.register("vt0", 0).await.unwrap()[..], &[b'v'; 8]);
    }

    #[tokio::test]
    async fn test_validity_failure_withdraws_entry() {
        let (sw, mut dir) = setup(2);
        sw.fail_register("cache_status").await;
        assert!(matches!(
            dir.insert(key("k"), b"v").await,
            Err(DirectoryError::SwitchUnavailable(_))
        ));
        assert!(sw.table_entries("lookup_table").await.is_empty());
        assert!(!dir.contains(&key("k")));
        assert_eq!(dir.memory_pool(), &[0, 0]);
    }

    #[tokio::test]
    async fn test_hits_reads_counter() {
        let (sw, mut dir) = setup(2);
        let entry = dir.insert(key("hot"), b"v").await.unwrap();
        sw.bump_counter("query_freq_cnt", entry.id, 3).await;
        assert_eq!(dir.hits(&key("hot")).await.unwrap(), 3);
        assert!(matches!(
            dir.hits(&key("cold")).await,
            Err(DirectoryError::KeyNotFound(_))
        ));
    }
}
