use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{
    AccessMode, CapabilityHandle, ChangeSignature, HandleKind, HandleRecord, PermissionState,
};
use crate::error::{Result, SyncError};
use crate::lock;

/// Answers permission prompts for [`FsHandle`]s.  The CLI plugs in a
/// terminal prompt; tests and headless runs use [`StaticBroker`].
#[async_trait]
pub trait PermissionBroker: Send + Sync {
    async fn decide(&self, path: &Path, mode: AccessMode) -> PermissionState;
}

/// Broker that gives the same answer to every prompt.
#[derive(Debug, Clone, Copy)]
pub struct StaticBroker(pub PermissionState);

impl StaticBroker {
    pub fn grant() -> Self {
        Self(PermissionState::Granted)
    }

    pub fn deny() -> Self {
        Self(PermissionState::Denied)
    }

    /// Behaves like a prompt the user closed without answering.
    pub fn dismiss() -> Self {
        Self(PermissionState::Prompt)
    }
}

#[async_trait]
impl PermissionBroker for StaticBroker {
    async fn decide(&self, _path: &Path, _mode: AccessMode) -> PermissionState {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Permissions {
    read: PermissionState,
    write: PermissionState,
}

impl Permissions {
    fn get(&self, mode: AccessMode) -> PermissionState {
        match mode {
            AccessMode::Read if self.write == PermissionState::Granted => PermissionState::Granted,
            AccessMode::Read => self.read,
            AccessMode::ReadWrite => self.write,
        }
    }

    fn set(&mut self, mode: AccessMode, state: PermissionState) {
        match mode {
            AccessMode::Read => self.read = state,
            AccessMode::ReadWrite => {
                self.write = state;
                if state == PermissionState::Granted {
                    self.read = state;
                }
            }
        }
    }
}

/// A file or directory on the local filesystem.
///
/// Handles resolved from a directory share its permission state, the way a
/// directory grant covers everything below it.
#[derive(Clone)]
pub struct FsHandle {
    path: PathBuf,
    kind: HandleKind,
    broker: Arc<dyn PermissionBroker>,
    permissions: Arc<Mutex<Permissions>>,
}

impl std::fmt::Debug for FsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsHandle")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl FsHandle {
    /// A handle freshly chosen through the picker: read access is implied by
    /// the selection, write still needs a prompt.
    pub async fn picked(
        path: impl Into<PathBuf>,
        broker: Arc<dyn PermissionBroker>,
    ) -> Result<Self> {
        let path = path.into();
        let kind = probe_kind(&path).await?;
        info!(path = %path.display(), ?kind, "capability picked");
        Ok(Self {
            path,
            kind,
            broker,
            permissions: Arc::new(Mutex::new(Permissions {
                read: PermissionState::Granted,
                write: PermissionState::Prompt,
            })),
        })
    }

    /// Rehydrate a stored record.  Every mode starts unrequested; the entry
    /// itself is only checked on first use.
    pub fn from_record(record: &HandleRecord, broker: Arc<dyn PermissionBroker>) -> Self {
        Self {
            path: record.path.clone(),
            kind: record.kind,
            broker,
            permissions: Arc::new(Mutex::new(Permissions {
                read: PermissionState::Prompt,
                write: PermissionState::Prompt,
            })),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a file below this directory handle.  The relative path is
    /// normalized lexically and may not leave the directory.
    pub fn file(&self, relative: &str) -> Result<FsHandle> {
        if self.kind != HandleKind::Directory {
            return Err(SyncError::invalid(
                self.name(),
                "only directory handles can resolve children",
            ));
        }
        let path = checked_path(&self.path, relative).ok_or_else(|| {
            SyncError::invalid(relative, "path escapes the granted directory")
        })?;
        Ok(FsHandle {
            path,
            kind: HandleKind::File,
            broker: self.broker.clone(),
            permissions: self.permissions.clone(),
        })
    }

    fn require(&self, mode: AccessMode) -> Result<()> {
        match lock(&self.permissions).get(mode) {
            PermissionState::Granted => Ok(()),
            PermissionState::Denied => Err(SyncError::PermissionDenied {
                mode,
                name: self.name(),
            }),
            PermissionState::Prompt => Err(SyncError::PermissionUnresolved {
                mode,
                name: self.name(),
            }),
        }
    }

    fn require_file(&self) -> Result<()> {
        if self.kind == HandleKind::Directory {
            return Err(SyncError::invalid(
                self.name(),
                "directory handles have no text content",
            ));
        }
        Ok(())
    }

    fn map_io(&self, err: std::io::Error) -> SyncError {
        if err.kind() == std::io::ErrorKind::NotFound {
            SyncError::invalid(self.name(), "entry no longer exists")
        } else {
            SyncError::io(&self.path, err)
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let filename = self
            .path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());
        self.path.with_file_name(format!(".{filename}.vaultsync.tmp"))
    }
}

#[async_trait]
impl CapabilityHandle for FsHandle {
    fn kind(&self) -> HandleKind {
        self.kind
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn record(&self) -> HandleRecord {
        HandleRecord {
            kind: self.kind,
            path: self.path.clone(),
        }
    }

    async fn query_permission(&self, mode: AccessMode) -> Result<PermissionState> {
        Ok(lock(&self.permissions).get(mode))
    }

    async fn request_permission(&self, mode: AccessMode) -> Result<PermissionState> {
        let current = lock(&self.permissions).get(mode);
        if current == PermissionState::Granted {
            return Ok(current);
        }
        // The entry must still exist before we bother the user.
        tokio::fs::metadata(&self.path)
            .await
            .map_err(|err| self.map_io(err))?;
        let answer = self.broker.decide(&self.path, mode).await;
        debug!(path = %self.path.display(), %mode, ?answer, "permission prompt answered");
        if answer != PermissionState::Prompt {
            lock(&self.permissions).set(mode, answer);
        }
        Ok(answer)
    }

    async fn read_text(&self) -> Result<String> {
        self.require_file()?;
        self.require(AccessMode::Read)?;
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| self.map_io(err))
    }

    async fn write_text(&self, content: &str) -> Result<()> {
        self.require_file()?;
        self.require(AccessMode::ReadWrite)?;
        // Writing to a deleted entry must not silently recreate it.
        tokio::fs::metadata(&self.path)
            .await
            .map_err(|err| self.map_io(err))?;

        let tmp_path = self.tmp_path();
        let write_result: std::io::Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(SyncError::io(&tmp_path, err));
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(SyncError::io(&self.path, err));
        }
        Ok(())
    }

    async fn signature(&self) -> Result<ChangeSignature> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .map_err(|err| self.map_io(err))?;
        let modified = meta
            .modified()
            .map_err(|err| SyncError::io(&self.path, err))?;
        Ok(ChangeSignature {
            modified_at: DateTime::<Utc>::from(modified),
            size_bytes: meta.len(),
        })
    }
}

async fn probe_kind(path: &Path) -> Result<HandleKind> {
    let meta = tokio::fs::metadata(path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            SyncError::invalid(path.display().to_string(), "entry does not exist")
        } else {
            SyncError::io(path, err)
        }
    })?;
    Ok(if meta.is_dir() {
        HandleKind::Directory
    } else {
        HandleKind::File
    })
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn checked_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative.is_absolute() {
        return None;
    }
    let normalized = normalize_path(&root.join(relative));
    let root_normalized = normalize_path(root);
    if normalized == root_normalized || !normalized.starts_with(&root_normalized) {
        return None;
    }
    Some(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn granting() -> Arc<dyn PermissionBroker> {
        Arc::new(StaticBroker::grant())
    }

    #[tokio::test]
    async fn picked_file_reads_without_prompt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("todo.md");
        std::fs::write(&path, "- [ ] a").unwrap();

        let handle = FsHandle::picked(&path, Arc::new(StaticBroker::deny()))
            .await
            .unwrap();
        assert_eq!(handle.kind(), HandleKind::File);
        assert_eq!(
            handle.query_permission(AccessMode::Read).await.unwrap(),
            PermissionState::Granted
        );
        assert_eq!(handle.read_text().await.unwrap(), "- [ ] a");
    }

    #[tokio::test]
    async fn write_requires_grant_then_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("todo.md");
        std::fs::write(&path, "old").unwrap();
        let handle = FsHandle::picked(&path, granting()).await.unwrap();

        let err = handle.write_text("new").await.unwrap_err();
        assert!(matches!(err, SyncError::PermissionUnresolved { .. }));

        assert_eq!(
            handle
                .request_permission(AccessMode::ReadWrite)
                .await
                .unwrap(),
            PermissionState::Granted
        );
        handle.write_text("new").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        assert!(!handle.tmp_path().exists(), "temp file must be renamed away");
    }

    #[tokio::test]
    async fn denied_prompt_is_remembered_until_asked_again() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("todo.md");
        std::fs::write(&path, "").unwrap();
        let handle = FsHandle::picked(&path, Arc::new(StaticBroker::deny()))
            .await
            .unwrap();
        assert_eq!(
            handle
                .request_permission(AccessMode::ReadWrite)
                .await
                .unwrap(),
            PermissionState::Denied
        );
        assert_eq!(
            handle
                .query_permission(AccessMode::ReadWrite)
                .await
                .unwrap(),
            PermissionState::Denied
        );
        let err = handle.write_text("x").await.unwrap_err();
        assert!(matches!(err, SyncError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn deleted_file_becomes_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("todo.md");
        std::fs::write(&path, "x").unwrap();
        let handle = FsHandle::picked(&path, granting()).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            handle.read_text().await.unwrap_err(),
            SyncError::CapabilityInvalid { .. }
        ));
        assert!(matches!(
            handle.signature().await.unwrap_err(),
            SyncError::CapabilityInvalid { .. }
        ));
        assert!(matches!(
            handle
                .request_permission(AccessMode::ReadWrite)
                .await
                .unwrap_err(),
            SyncError::CapabilityInvalid { .. }
        ));
    }

    #[tokio::test]
    async fn missing_path_cannot_be_picked() {
        let dir = TempDir::new().unwrap();
        let err = FsHandle::picked(dir.path().join("nope.md"), granting())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CapabilityInvalid { .. }));
    }

    #[tokio::test]
    async fn signature_tracks_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("todo.md");
        std::fs::write(&path, "abc").unwrap();
        let handle = FsHandle::picked(&path, granting()).await.unwrap();
        let first = handle.signature().await.unwrap();
        assert_eq!(first.size_bytes, 3);
        std::fs::write(&path, "abcdef").unwrap();
        let second = handle.signature().await.unwrap();
        assert!(second.diverges_from(&first));
    }

    #[tokio::test]
    async fn rehydrated_record_starts_unrequested() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("todo.md");
        std::fs::write(&path, "x").unwrap();
        let picked = FsHandle::picked(&path, granting()).await.unwrap();
        let restored = FsHandle::from_record(&picked.record(), granting());
        assert_eq!(
            restored.query_permission(AccessMode::Read).await.unwrap(),
            PermissionState::Prompt
        );
        assert!(matches!(
            restored.read_text().await.unwrap_err(),
            SyncError::PermissionUnresolved { .. }
        ));
        restored.request_permission(AccessMode::Read).await.unwrap();
        assert_eq!(restored.read_text().await.unwrap(), "x");
    }

    #[tokio::test]
    async fn directory_children_share_grant_and_stay_inside() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        std::fs::write(dir.path().join("notes/today.md"), "- [ ] a").unwrap();

        let root = FsHandle::picked(dir.path(), granting()).await.unwrap();
        assert_eq!(root.kind(), HandleKind::Directory);
        assert!(root.read_text().await.is_err());

        let child = root.file("notes/./today.md").unwrap();
        assert_eq!(child.read_text().await.unwrap(), "- [ ] a");
        root
            .request_permission(AccessMode::ReadWrite)
            .await
            .unwrap();
        child.write_text("- [x] a").await.unwrap();

        assert!(root.file("../outside.md").is_err());
        assert!(root.file("notes/../../outside.md").is_err());
        assert!(root.file("/etc/passwd").is_err());
        assert!(child.file("x.md").is_err());
    }

    #[test]
    fn normalize_resolves_dots() {
        assert_eq!(
            normalize_path(Path::new("/a/b/./c/../d")),
            PathBuf::from("/a/b/d")
        );
    }
}
