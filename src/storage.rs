//! Persisted client-side key/value storage for session data.
//!
//! The session layer only ever touches three keys (`token`, `user`, `tenant`)
//! and always writes or clears them together through `set_many`/`remove_many`.
//! `MemoryStore` backs tests and embedded callers; `FileStore` keeps a session
//! across CLI invocations as one small JSON object on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::AppResult;

pub const TOKEN_KEY: &str = "token";
pub const USER_KEY: &str = "user";
pub const TENANT_KEY: &str = "tenant";
pub const SESSION_KEYS: [&str; 3] = [TOKEN_KEY, USER_KEY, TENANT_KEY];

pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> AppResult<()>;
    fn remove(&self, key: &str) -> AppResult<()>;

    fn set_many(&self, entries: &[(&str, String)]) -> AppResult<()> {
        for (k, v) in entries {
            self.set(k, v)?;
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> AppResult<()> {
        for k in keys {
            self.remove(k)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.map.read().is_empty() }

    pub fn keys(&self) -> Vec<String> { self.map.read().keys().cloned().collect() }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.map.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> AppResult<()> {
        let mut m = self.map.write();
        for (k, v) in entries {
            m.insert((*k).to_string(), v.clone());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> AppResult<()> {
        let mut m = self.map.write();
        for k in keys {
            m.remove(*k);
        }
        Ok(())
    }
}

/// JSON-file store. Every mutation rewrites the whole file via a temp file + rename,
/// so a crash never leaves a half-written token next to a stale user record.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let map = match std::fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => BTreeMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(target: "galley::storage", "opened session file {}", path.display());
        Ok(Self { path, map: Mutex::new(map) })
    }

    pub fn path(&self) -> &Path { &self.path }

    fn persist(&self, map: &BTreeMap<String, String>) -> AppResult<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> AppResult<()> {
        let mut guard = self.map.lock();
        let mut next = guard.clone();
        f(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.mutate(|m| {
            m.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        self.mutate(|m| {
            m.remove(key);
        })
    }

    fn set_many(&self, entries: &[(&str, String)]) -> AppResult<()> {
        self.mutate(|m| {
            for (k, v) in entries {
                m.insert((*k).to_string(), v.clone());
            }
        })
    }

    fn remove_many(&self, keys: &[&str]) -> AppResult<()> {
        self.mutate(|m| {
            for k in keys {
                m.remove(*k);
            }
        })
    }
}
