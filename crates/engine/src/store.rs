//! Named slots that keep a granted handle across restarts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::capability::HandleRecord;
use crate::error::{Result, SyncError};
use crate::lock;

/// Which document a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HandleRole {
    ActiveFile,
    VaultRoot,
}

impl HandleRole {
    pub fn key(self) -> &'static str {
        match self {
            Self::ActiveFile => "active-file",
            Self::VaultRoot => "vault-root",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "active-file" => Some(Self::ActiveFile),
            "vault-root" => Some(Self::VaultRoot),
            _ => None,
        }
    }
}

impl fmt::Display for HandleRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[async_trait]
pub trait HandleStore: Send + Sync {
    /// Overwrites whatever the slot held before.
    async fn save(&self, role: HandleRole, record: &HandleRecord) -> Result<()>;

    async fn load(&self, role: HandleRole) -> Result<Option<HandleRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryHandleStore {
    slots: Mutex<BTreeMap<HandleRole, HandleRecord>>,
}

#[async_trait]
impl HandleStore for MemoryHandleStore {
    async fn save(&self, role: HandleRole, record: &HandleRecord) -> Result<()> {
        lock(&self.slots).insert(role, record.clone());
        Ok(())
    }

    async fn load(&self, role: HandleRole) -> Result<Option<HandleRecord>> {
        Ok(lock(&self.slots).get(&role).cloned())
    }
}

/// All slots in one JSON object keyed by role, rewritten atomically on
/// every save.
#[derive(Debug, Clone)]
pub struct JsonHandleStore {
    path: PathBuf,
}

impl JsonHandleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_err(&self, message: impl fmt::Display) -> SyncError {
        SyncError::Store {
            path: self.path.clone(),
            message: message.to_string(),
        }
    }

    async fn read_slots(&self) -> Result<BTreeMap<String, HandleRecord>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| self.store_err(err)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(self.store_err(err)),
        }
    }

    /// Every populated slot, for display.
    pub async fn entries(&self) -> Result<Vec<(HandleRole, HandleRecord)>> {
        Ok(self
            .read_slots()
            .await?
            .into_iter()
            .filter_map(|(key, record)| HandleRole::from_key(&key).map(|role| (role, record)))
            .collect())
    }

    async fn write_slots(&self, slots: &BTreeMap<String, HandleRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.store_err(err))?;
        }
        let rendered = serde_json::to_string_pretty(slots).map_err(|err| self.store_err(err))?;

        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "handles.json".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: std::io::Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            file.write_all(rendered.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(self.store_err(err));
        }
        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(self.store_err(err));
        }
        Ok(())
    }
}

#[async_trait]
impl HandleStore for JsonHandleStore {
    async fn save(&self, role: HandleRole, record: &HandleRecord) -> Result<()> {
        let mut slots = self.read_slots().await?;
        slots.insert(role.key().to_string(), record.clone());
        self.write_slots(&slots).await?;
        debug!(%role, path = %record.path.display(), "handle saved");
        Ok(())
    }

    async fn load(&self, role: HandleRole) -> Result<Option<HandleRecord>> {
        Ok(self.read_slots().await?.remove(role.key()))
    }
}
