//! Persistent key/value store for instances, routing and secrets.
//!
//! ```text
//! protocol/<name>  ─▶ ProtocolInstance (secret slots only)
//! secret/<name>    ─▶ SecretBundle
//! routing          ─▶ RoutingConfig
//! dns              ─▶ last committed DnsMode
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

pub const ROUTING_KEY: &str = "routing";
pub const DNS_KEY: &str = "dns";

pub fn protocol_key(name: &str) -> String {
    format!("protocol/{name}")
}

pub fn secret_key(name: &str) -> String {
    format!("secret/{name}")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("value for {key} does not decode: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("value for {key} does not encode: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, sorted
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Is the backing medium usable right now?
    fn probe(&self) -> Result<(), StoreError>;
}

/// Typed helpers over any [`Store`]
pub trait StoreExt: Store {
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    fn put_as<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.put(key, value)
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn prefixed(map: &BTreeMap<String, Value>, prefix: &str) -> Vec<String> {
    map.keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect()
}

/// One JSON document on disk, rewritten atomically on every change
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileStore {
    /// Open `path`, starting empty if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        debug!("Opened store {:?} ({} keys)", path, entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Write to a sibling temp file, sync, then rename over the target
    fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec_pretty(entries).map_err(|source| StoreError::Encode {
            key: "*".to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(|e| self.io_error(e))?;
        file.write_all(&encoded).map_err(|e| self.io_error(e))?;
        file.sync_all().map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    /// Apply `change` and persist; memory is rolled back if the write fails
    fn mutate(&self, change: impl FnOnce(&mut BTreeMap<String, Value>)) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        let mut next = entries.clone();
        change(&mut next);
        if let Err(e) = self.persist(&next) {
            warn!("Store write failed: {}", e);
            return Err(e);
        }
        *entries = next;
        Ok(())
    }
}

impl Store for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value);
        })
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.mutate(|entries| {
            entries.remove(key);
        })
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(prefixed(&lock(&self.entries), prefix))
    }

    fn probe(&self) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let meta = fs::metadata(dir).map_err(|e| {
            StoreError::Unavailable(format!("{}: {}", dir.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        if meta.permissions().readonly() {
            return Err(StoreError::Unavailable(format!(
                "{} is read-only",
                dir.display()
            )));
        }
        Ok(())
    }
}

/// Volatile store; `set_available(false)` simulates losing the medium and
/// `reject_writes` a medium that still probes fine but refuses some writes
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
    unavailable: std::sync::atomic::AtomicBool,
    rejected_prefix: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable
            .store(!available, std::sync::atomic::Ordering::SeqCst);
    }

    /// Fail puts and deletes of keys under `prefix`; `None` lifts it
    pub fn reject_writes(&self, prefix: Option<&str>) {
        *lock(&self.rejected_prefix) = prefix.map(str::to_string);
    }

    fn check_write(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        match lock(&self.rejected_prefix).as_deref() {
            Some(prefix) if key.starts_with(prefix) => {
                Err(StoreError::Unavailable(format!("write to {key} rejected")))
            }
            _ => Ok(()),
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.check()?;
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.check_write(key)?;
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_write(key)?;
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        Ok(prefixed(&lock(&self.entries), prefix))
    }

    fn probe(&self) -> Result<(), StoreError> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStore::open(&path).unwrap();
        store.put(&protocol_key("home"), json!({"kind": "wireguard"})).unwrap();
        store.put(ROUTING_KEY, json!({"kill_switch": true})).unwrap();
        store.put(&protocol_key("work"), json!({})).unwrap();
        store.delete(&protocol_key("work")).unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.keys("protocol/").unwrap(), vec!["protocol/home".to_string()]);
        assert_eq!(
            reopened.get(ROUTING_KEY).unwrap(),
            Some(json!({"kill_switch": true}))
        );
        assert!(!dir.path().join("state.json.tmp").exists());
        assert!(reopened.probe().is_ok());
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(FileStore::open(&path), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_missing_directory_fails_probe_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone").join("state.json");
        let store = FileStore::open(&path).unwrap();
        assert!(matches!(store.probe(), Err(StoreError::Unavailable(_))));
        assert!(store.put("routing", json!({})).is_err());
        // Failed write left memory untouched
        assert_eq!(store.get("routing").unwrap(), None);
    }

    #[test]
    fn test_typed_helpers() {
        let store = MemoryStore::new();
        store.put_as("numbers", &vec![1, 2, 3]).unwrap();
        let back: Option<Vec<u32>> = store.get_as("numbers").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
        let wrong: Result<Option<String>, _> = store.get_as("numbers");
        assert!(matches!(wrong, Err(StoreError::Decode { .. })));

        store.reject_writes(Some("protocol/"));
        assert!(store.probe().is_ok());
        assert!(store.put(&protocol_key("home"), json!({})).is_err());
        assert!(store.delete(&protocol_key("home")).is_err());
        store.put(&secret_key("home"), json!({})).unwrap();
        store.reject_writes(None);
        store.put(&protocol_key("home"), json!({})).unwrap();

        store.set_available(false);
        assert!(store.probe().is_err());
        assert!(store.get("numbers").is_err());
    }
}
