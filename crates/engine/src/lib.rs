pub mod autosave;
pub mod capability;
pub mod codec;
pub mod error;
pub mod orchestrator;
pub mod poller;
pub mod scanner;
pub mod store;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use autosave::AutosaveCoordinator;
pub use capability::{
    AccessMode, CapabilityHandle, CapabilityManager, ChangeSignature, FsHandle, HandleKind,
    HandleRecord, MemoryHandle, PermissionBroker, PermissionState, StaticBroker, WriteOutcome,
};
pub use codec::{ChecklistDocument, ChecklistItem, DocumentView, ItemId};
pub use error::{LineError, Result, SyncError};
pub use orchestrator::{ConflictPolicy, SyncEvent, SyncOrchestrator, SyncPhase, SyncSettings};
pub use poller::ChangePoller;
pub use scanner::{ScanOptions, VaultTask, VaultTasks, scan_vault};
pub use store::{HandleRole, HandleStore, JsonHandleStore, MemoryHandleStore};

/// State behind these mutexes stays consistent between statements, so a
/// poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
