use std::path::PathBuf;

use thiserror::Error;

use crate::capability::AccessMode;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// A checklist grammar violation at a specific 1-indexed line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct LineError {
    pub line: usize,
    pub message: String,
}

/// Every failure the engine can report.  Nothing is escalated as a panic;
/// the orchestrator is the only layer that turns these into user-visible
/// state.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The user answered a capability prompt with "no".  Recoverable through
    /// an explicit re-request.
    #[error("{mode} permission denied for {name}")]
    PermissionDenied { mode: AccessMode, name: String },

    /// The prompt was dismissed without a decision.
    #[error("{mode} permission for {name} was not granted (prompt dismissed)")]
    PermissionUnresolved { mode: AccessMode, name: String },

    /// The handle no longer resolves.  Terminal for this handle.
    #[error("capability {name} is no longer valid: {reason}")]
    CapabilityInvalid { name: String, reason: String },

    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checklist format error at {0}")]
    Format(#[from] LineError),

    #[error("no capability handle is bound")]
    NotBound,

    #[error("handle store failure at {path}: {message}")]
    Store { path: PathBuf, message: String },
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CapabilityInvalid {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True for failures that will not go away by retrying with the same
    /// handle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CapabilityInvalid { .. } | Self::NotBound)
    }

    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::PermissionUnresolved { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_error_renders_line_and_message() {
        let err = LineError {
            line: 3,
            message: "expected `- [ ] `".to_string(),
        };
        assert_eq!(err.to_string(), "line 3: expected `- [ ] `");
        let wrapped = SyncError::from(err);
        assert!(wrapped.to_string().contains("line 3"));
    }

    #[test]
    fn classification_helpers() {
        assert!(SyncError::invalid("a.md", "gone").is_terminal());
        assert!(SyncError::NotBound.is_terminal());
        let denied = SyncError::PermissionDenied {
            mode: AccessMode::ReadWrite,
            name: "a.md".to_string(),
        };
        assert!(denied.is_permission());
        assert!(!denied.is_terminal());
    }
}
