//! Authoritative in-memory key-value store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::protocol::CacheKey;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// The backend's full dataset.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: HashMap<CacheKey, Bytes>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&Bytes> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or overwrite. Returns the previous value.
    pub fn put(&mut self, key: CacheKey, value: Bytes) -> Option<Bytes> {
        self.entries.insert(key, value)
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<Bytes> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load `key=value` lines from a file.
    ///
    /// Stops at the first malformed line; pairs applied before it stay in the
    /// store. Returns the pairs that were applied, in file order.
    pub async fn populate_from_file(
        &mut self,
        path: &Path,
        max_value: usize,
    ) -> Result<Vec<(CacheKey, Bytes)>, LoadError> {
        let data = fs::read_to_string(path).await.map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut applied = Vec::new();
        for (idx, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed = parse_line(line, max_value).map_err(|reason| LoadError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                reason,
            });
            let (key, value) = match parsed {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(applied = applied.len(), "Aborting load: {e}");
                    return Err(e);
                }
            };
            self.put(key, value.clone());
            applied.push((key, value));
        }

        info!(path = %path.display(), pairs = applied.len(), "Loaded key-value pairs");
        Ok(applied)
    }
}

fn parse_line(line: &str, max_value: usize) -> Result<(CacheKey, Bytes), String> {
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| "expected key=value".to_string())?;
    let key = CacheKey::from_bytes(key.as_bytes()).map_err(|e| e.to_string())?;
    if value.len() > max_value {
        return Err(format!(
            "value of {} bytes exceeds the {max_value}-byte limit",
            value.len()
        ));
    }
    Ok((key, Bytes::copy_from_slice(value.as_bytes())))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn key(s: &str) -> CacheKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let mut store = KvStore::new();
        assert!(store.put(key("a"), Bytes::from_static(b"1")).is_none());
        assert_eq!(
            store.put(key("a"), Bytes::from_static(b"2")),
            Some(Bytes::from_static(b"1"))
        );
        assert_eq!(store.get(&key("a")).unwrap(), &Bytes::from_static(b"2"));
        assert!(store.remove(&key("a")).is_some());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_populate_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "one=alpha").unwrap();
        writeln!(file, "two=beta=gamma").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "ten=x").unwrap();

        let mut store = KvStore::new();
        let applied = store.populate_from_file(file.path(), 64).await.unwrap();
        assert_eq!(applied.len(), 3);
        assert_eq!(&store.get(&key("two")).unwrap()[..], b"beta=gamma");
    }

    #[tokio::test]
    async fn test_parse_failure_keeps_earlier_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "one=alpha").unwrap();
        writeln!(file, "broken line").unwrap();
        writeln!(file, "two=beta").unwrap();

        let mut store = KvStore::new();
        let err = store.populate_from_file(file.path(), 64).await.unwrap_err();
        assert!(matches!(err, LoadError::Parse { line: 2, .. }));
        assert!(store.contains(&key("one")));
        assert!(!store.contains(&key("two")));
    }

    #[tokio::test]
    async fn test_oversized_fields_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a-key-longer-than-16=v").unwrap();
        let mut store = KvStore::new();
        assert!(store.populate_from_file(file.path(), 64).await.is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "k=0123456789").unwrap();
        assert!(store.populate_from_file(file.path(), 4).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let mut store = KvStore::new();
        assert!(matches!(
            store
                .populate_from_file(Path::new("/nonexistent/data.txt"), 64)
                .await,
            Err(LoadError::Io { .. })
        ));
    }
}
