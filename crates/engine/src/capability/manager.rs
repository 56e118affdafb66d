use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{AccessMode, CapabilityHandle, ChangeSignature, PermissionState};
use crate::error::{Result, SyncError};
use crate::lock;

/// Result of a [`CapabilityManager::write`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed,
    /// Another write was already in flight; this content was not persisted.
    Skipped,
}

/// Owns the currently bound handle and gates reads and writes behind its
/// permission state.
#[derive(Debug, Default)]
pub struct CapabilityManager {
    handle: Mutex<Option<Arc<dyn CapabilityHandle>>>,
    writing: AtomicBool,
}

struct WriteGuard<'a>(&'a AtomicBool);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CapabilityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt `handle` as current.  Permission is not checked here.
    pub fn bind(&self, handle: Arc<dyn CapabilityHandle>) {
        info!(name = %handle.name(), kind = ?handle.kind(), "capability bound");
        *lock(&self.handle) = Some(handle);
    }

    /// Drop the reference to the bound handle.  Host permission is left as
    /// is.
    pub fn release(&self) -> Option<Arc<dyn CapabilityHandle>> {
        let released = lock(&self.handle).take();
        if let Some(handle) = &released {
            debug!(name = %handle.name(), "capability released");
        }
        released
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.handle).is_some()
    }

    pub fn handle(&self) -> Result<Arc<dyn CapabilityHandle>> {
        lock(&self.handle).clone().ok_or(SyncError::NotBound)
    }

    pub async fn permission(&self, mode: AccessMode) -> Result<PermissionState> {
        self.handle()?.query_permission(mode).await
    }

    /// Check read access without prompting.
    pub async fn ensure_readable(&self) -> Result<()> {
        let handle = self.handle()?;
        match handle.query_permission(AccessMode::Read).await? {
            PermissionState::Granted => Ok(()),
            PermissionState::Denied => Err(SyncError::PermissionDenied {
                mode: AccessMode::Read,
                name: handle.name(),
            }),
            PermissionState::Prompt => Err(SyncError::PermissionUnresolved {
                mode: AccessMode::Read,
                name: handle.name(),
            }),
        }
    }

    /// Check read access, prompting if it has not been decided yet.
    pub async fn request_readable(&self) -> Result<()> {
        self.request(AccessMode::Read).await
    }

    /// Check write access, prompting if it is not granted.
    ///
    /// `PermissionDenied` means the user said no; `PermissionUnresolved`
    /// means the prompt closed without an answer.
    pub async fn request_writable(&self) -> Result<()> {
        self.request(AccessMode::ReadWrite).await
    }

    async fn request(&self, mode: AccessMode) -> Result<()> {
        let handle = self.handle()?;
        if handle.query_permission(mode).await? == PermissionState::Granted {
            return Ok(());
        }
        info!(name = %handle.name(), %mode, "requesting permission");
        match handle.request_permission(mode).await? {
            PermissionState::Granted => Ok(()),
            PermissionState::Denied => {
                warn!(name = %handle.name(), %mode, "permission denied");
                Err(SyncError::PermissionDenied {
                    mode,
                    name: handle.name(),
                })
            }
            PermissionState::Prompt => Err(SyncError::PermissionUnresolved {
                mode,
                name: handle.name(),
            }),
        }
    }

    /// Read the full content.  Does not touch any change baseline.
    pub async fn read(&self) -> Result<String> {
        self.ensure_readable().await?;
        self.handle()?.read_text().await
    }

    /// Replace the full content.
    ///
    /// Only one write runs at a time per manager: a call that arrives while
    /// another is in flight returns [`WriteOutcome::Skipped`] immediately.
    pub async fn write(&self, content: &str) -> Result<WriteOutcome> {
        let handle = self.handle()?;
        if self
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(name = %handle.name(), "write already in flight, skipping");
            return Ok(WriteOutcome::Skipped);
        }
        let _guard = WriteGuard(&self.writing);

        self.request_writable().await?;
        handle.write_text(content).await?;
        debug!(name = %handle.name(), bytes = content.len(), "content written");
        Ok(WriteOutcome::Committed)
    }

    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    pub async fn signature(&self) -> Result<ChangeSignature> {
        self.handle()?.signature().await
    }
}
