//! Permission-scoped access to a single file or directory.
//!
//! A [`CapabilityHandle`] is what the picker hands over.  The engine never
//! opens paths on its own; everything flows through a bound handle held by a
//! [`CapabilityManager`].

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

mod fs;
mod manager;
mod memory;

pub use fs::{FsHandle, PermissionBroker, StaticBroker};
pub use manager::{CapabilityManager, WriteOutcome};
pub use memory::MemoryHandle;

/// Host permission state for one access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    /// Not asked yet, or the prompt was dismissed.
    Prompt,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    ReadWrite,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::ReadWrite => f.write_str("read-write"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    File,
    Directory,
}

/// Persistable value of a handle, stored in a [`crate::store::HandleStore`]
/// slot and rehydrated in a later session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRecord {
    pub kind: HandleKind,
    pub path: PathBuf,
}

/// Cheap "has this changed" proxy: modification time plus size.  Not a
/// content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeSignature {
    pub modified_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl ChangeSignature {
    /// True when `self` should count as an external change relative to
    /// `baseline`: the timestamp moved forward or the size changed.
    pub fn diverges_from(&self, baseline: &ChangeSignature) -> bool {
        self.modified_at > baseline.modified_at || self.size_bytes != baseline.size_bytes
    }
}

#[async_trait]
pub trait CapabilityHandle: Send + Sync + fmt::Debug {
    fn kind(&self) -> HandleKind;

    /// Display name used in logs and error messages.
    fn name(&self) -> String;

    fn record(&self) -> HandleRecord;

    async fn query_permission(&self, mode: AccessMode) -> Result<PermissionState>;

    /// Ask the host for `mode`, prompting the user if needed.
    async fn request_permission(&self, mode: AccessMode) -> Result<PermissionState>;

    async fn read_text(&self) -> Result<String>;

    /// Replace the full content.  A concurrent reader sees either the old or
    /// the new content.
    async fn write_text(&self, content: &str) -> Result<()>;

    async fn signature(&self) -> Result<ChangeSignature>;
}
