//! Persistence for directory configs: a JSON file holding every registered
//! directory, its port, and its proxy rules. The store is deliberately dumb
//! — it owns the records and the `is_active` display flag, but liveness
//! truth always comes from the registry, never from here.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{DirectoryConfig, ProxyRule};
use crate::error::StoreError;

/// On-disk shape of the store file
#[derive(Debug, Serialize, Deserialize, Default)]
struct StoreFile {
    #[serde(default)]
    dirs: Vec<DirectoryConfig>,
}

/// Fields accepted when registering a new directory
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDirectory {
    pub name: String,
    pub path: String,
    pub port: u16,
    #[serde(default)]
    pub proxy_rules: Vec<ProxyRule>,
}

/// Partial update for an existing directory; absent fields are kept
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUpdate {
    pub name: Option<String>,
    pub path: Option<String>,
    pub port: Option<u16>,
    pub proxy_rules: Option<Vec<ProxyRule>>,
}

/// JSON-file-backed store of directory configs
pub struct ConfigStore {
    path: PathBuf,
    dirs: RwLock<Vec<DirectoryConfig>>,
}

impl ConfigStore {
    /// Open a store, loading existing records. A missing file is an empty
    /// store; it is created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let dirs = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let file: StoreFile =
                    serde_json::from_str(&content).map_err(StoreError::Parse)?;
                file.dirs
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StoreError::Read(e)),
        };

        info!(path = %path.display(), count = dirs.len(), "Directory store opened");
        Ok(Self {
            path,
            dirs: RwLock::new(dirs),
        })
    }

    /// All registered directories
    pub fn all(&self) -> Vec<DirectoryConfig> {
        self.dirs.read().clone()
    }

    /// A single directory config by id
    pub fn get(&self, id: &str) -> Option<DirectoryConfig> {
        self.dirs.read().iter().find(|d| d.id == id).cloned()
    }

    /// Register a new directory. Ids are generated here and never reused.
    pub fn add(&self, new: NewDirectory) -> Result<DirectoryConfig, StoreError> {
        let now = now_millis();
        let config = DirectoryConfig {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            path: new.path,
            port: new.port,
            proxy_rules: new.proxy_rules,
            is_active: false,
            created_at: now,
            updated_at: now,
        };

        let mut dirs = self.dirs.write();
        dirs.push(config.clone());
        self.persist(&dirs)?;
        info!(id = %config.id, name = %config.name, "Directory registered");
        Ok(config)
    }

    /// Apply a partial update to an existing directory
    pub fn update(&self, id: &str, update: DirectoryUpdate) -> Result<DirectoryConfig, StoreError> {
        let mut dirs = self.dirs.write();
        let entry = dirs
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| StoreError::UnknownId(id.to_string()))?;

        if let Some(name) = update.name {
            entry.name = name;
        }
        if let Some(path) = update.path {
            entry.path = path;
        }
        if let Some(port) = update.port {
            entry.port = port;
        }
        if let Some(proxy_rules) = update.proxy_rules {
            entry.proxy_rules = proxy_rules;
        }
        entry.updated_at = now_millis();

        let updated = entry.clone();
        self.persist(&dirs)?;
        Ok(updated)
    }

    /// Remove a directory config entirely
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut dirs = self.dirs.write();
        let before = dirs.len();
        dirs.retain(|d| d.id != id);
        if dirs.len() == before {
            return Err(StoreError::UnknownId(id.to_string()));
        }
        self.persist(&dirs)?;
        info!(id, "Directory removed");
        Ok(())
    }

    /// Record the last-known running state after a start/stop completes.
    /// Display-only; the registry remains the liveness truth.
    pub fn set_active_flag(&self, id: &str, active: bool) -> Result<(), StoreError> {
        let mut dirs = self.dirs.write();
        let entry = dirs
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| StoreError::UnknownId(id.to_string()))?;

        entry.is_active = active;
        entry.updated_at = now_millis();
        let result = self.persist(&dirs);
        debug!(id, active, "Active flag updated");
        result
    }

    /// Write the full record set atomically: temp file in the same
    /// directory, then rename over the store file.
    fn persist(&self, dirs: &[DirectoryConfig]) -> Result<(), StoreError> {
        let file = StoreFile {
            dirs: dirs.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(StoreError::Parse)?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(StoreError::Write)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(StoreError::Write)?;
        tmp.write_all(json.as_bytes()).map_err(StoreError::Write)?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Write(e.error))?;
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
