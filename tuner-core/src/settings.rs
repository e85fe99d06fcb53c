//! # Settings Storage Module
//!
//! Small key/value store for user settings (numeric only). One trait, one
//! implementation per backend, and a factory that picks the backend when the
//! application starts.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, TunerError};

/// Capability set every settings backend provides.
pub trait ConfigStorage: Send {
    fn set_double(&mut self, key: &str, value: f64) -> Result<()>;
    fn get_double(&self, key: &str) -> Option<f64>;
    /// Returns whether the key was present.
    fn remove(&mut self, key: &str) -> Result<bool>;
    fn clear(&mut self) -> Result<()>;
}

/// Backend selection for [`create_config_storage`].
#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    /// Process-lifetime only. Used on desktop and in tests.
    Memory,
    /// Persisted as pretty-printed JSON at the given path.
    JsonFile(PathBuf),
}

/// Creates the settings store for the selected backend.
///
/// # Returns
/// * `Ok(store)` - Ready-to-use store
/// * `Err(TunerError)` - The JSON file exists but could not be read or parsed
pub fn create_config_storage(backend: StorageBackend) -> Result<Box<dyn ConfigStorage>> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryStorage::default())),
        StorageBackend::JsonFile(path) => Ok(Box::new(JsonFileStorage::open(path)?)),
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: BTreeMap<String, f64>,
}

impl ConfigStorage for MemoryStorage {
    fn set_double(&mut self, key: &str, value: f64) -> Result<()> {
        self.values.insert(key.to_owned(), value);
        Ok(())
    }

    fn get_double(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        Ok(self.values.remove(key).is_some())
    }

    fn clear(&mut self) -> Result<()> {
        self.values.clear();
        Ok(())
    }
}

/// Settings file backed store. Every mutation is written through to disk.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    values: BTreeMap<String, f64>,
}

impl JsonFileStorage {
    /// Opens the store at `path`, starting empty when the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let mut file = File::open(&path)?;
            let mut data = String::new();
            file.read_to_string(&mut data)?;
            serde_json::from_str(&data)?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = values.len(), "opened settings file");
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json_string = serde_json::to_string_pretty(&self.values)?;
        let mut file = File::create(&self.path)?;
        file.write_all(json_string.as_bytes())?;
        Ok(())
    }
}

impl ConfigStorage for JsonFileStorage {
    fn set_double(&mut self, key: &str, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(TunerError::Storage(format!("refusing to store non-finite value for {key}")));
        }
        self.values.insert(key.to_owned(), value);
        self.save()
    }

    fn get_double(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        let existed = self.values.remove(key).is_some();
        if existed {
            self.save()?;
        }
        Ok(existed)
    }

    fn clear(&mut self) -> Result<()> {
        self.values.clear();
        self.save()
    }
}
