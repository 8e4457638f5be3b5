//! Persistent realm state, keyed by network id.
//!
//! | Key          | Value              |
//! |--------------|--------------------|
//! | `realm`      | last committed [`Realm`] |
//! | `candidates` | last known `Vec<Candidate>` |
//!
//! [`JsonFileCache`] stores one `serde_json` file per `(network, key)`
//! pair, named by the md5 of `"{network}:{key}"`.

use log::debug;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{CommsError, Result};
use crate::types::{Candidate, Realm};

const REALM_KEY: &str = "realm";
const CANDIDATES_KEY: &str = "candidates";

pub trait RealmCache: Send + Sync {
    fn load_realm(&self, network: &str) -> Result<Option<Realm>>;
    fn save_realm(&self, network: &str, realm: &Realm) -> Result<()>;
    fn load_candidates(&self, network: &str) -> Result<Option<Vec<Candidate>>>;
    fn save_candidates(&self, network: &str, candidates: &[Candidate]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// File cache
// ---------------------------------------------------------------------------

pub struct JsonFileCache {
    dir: PathBuf,
}

impl JsonFileCache {
    /// Creates `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, network: &str, key: &str) -> PathBuf {
        let digest = md5::compute(format!("{}:{}", network, key).as_bytes());
        self.dir.join(format!("{:x}.json", digest))
    }

    fn read<T: DeserializeOwned>(&self, network: &str, key: &str) -> Result<Option<T>> {
        let path = self.path_for(network, key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    fn write<T: Serialize + ?Sized>(&self, network: &str, key: &str, value: &T) -> Result<()> {
        let path = self.path_for(network, key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        debug!("cache: wrote {}/{} to {}", network, key, path.display());
        Ok(())
    }
}

impl RealmCache for JsonFileCache {
    fn load_realm(&self, network: &str) -> Result<Option<Realm>> {
        self.read(network, REALM_KEY)
    }

    fn save_realm(&self, network: &str, realm: &Realm) -> Result<()> {
        self.write(network, REALM_KEY, realm)
    }

    fn load_candidates(&self, network: &str) -> Result<Option<Vec<Candidate>>> {
        self.read(network, CANDIDATES_KEY)
    }

    fn save_candidates(&self, network: &str, candidates: &[Candidate]) -> Result<()> {
        self.write(network, CANDIDATES_KEY, candidates)
    }
}

// ---------------------------------------------------------------------------
// Memory cache
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(String, String), serde_json::Value>>,
    fail_writes: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save fail, as a full disk would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read<T: DeserializeOwned>(&self, network: &str, key: &str) -> Result<Option<T>> {
        let entries = self.entries.lock();
        match entries.get(&(network.to_string(), key.to_string())) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize + ?Sized>(&self, network: &str, key: &str, value: &T) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CommsError::Cache("memory cache set to fail".into()));
        }
        let value = serde_json::to_value(value)?;
        self.entries
            .lock()
            .insert((network.to_string(), key.to_string()), value);
        Ok(())
    }
}

impl RealmCache for MemoryCache {
    fn load_realm(&self, network: &str) -> Result<Option<Realm>> {
        self.read(network, REALM_KEY)
    }

    fn save_realm(&self, network: &str, realm: &Realm) -> Result<()> {
        self.write(network, REALM_KEY, realm)
    }

    fn load_candidates(&self, network: &str) -> Result<Option<Vec<Candidate>>> {
        self.read(network, CANDIDATES_KEY)
    }

    fn save_candidates(&self, network: &str, candidates: &[Candidate]) -> Result<()> {
        self.write(network, CANDIDATES_KEY, candidates)
    }
}
