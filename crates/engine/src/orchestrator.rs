//! Per-document sync state machine.
//!
//! ```text
//! Unbound -> PermissionPending -> Bound -> Watching <-> Reloading
//!                                             \-> Unbound (handle invalidated)
//! ```
//!
//! The orchestrator owns the bound handle, the poller baseline and the
//! autosave session for one document.  The document itself is only ever
//! replaced wholesale: by the caller through [`SyncOrchestrator::edit`] or by
//! a reload after an external change.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::autosave::{AutosaveCoordinator, CommitFn, ContentSource, EnabledCondition};
use crate::capability::{CapabilityHandle, CapabilityManager, ChangeSignature, WriteOutcome};
use crate::codec::{ChecklistDocument, DocumentView};
use crate::error::{LineError, Result, SyncError};
use crate::lock;
use crate::poller::{ChangeCallback, ChangePoller};

/// What happens to pending local edits when an external change lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Reload the external version.  Dropped local text is reported through
    /// [`SyncEvent::LocalEditsDiscarded`].
    #[default]
    PreferExternal,
    /// Skip the reload while a local save is pending; the save wins.
    KeepLocal,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub autosave_debounce: Duration,
    pub autosave_enabled: bool,
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            autosave_debounce: Duration::from_millis(800),
            autosave_enabled: true,
            conflict_policy: ConflictPolicy::PreferExternal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Unbound,
    PermissionPending,
    Bound,
    Watching,
    Reloading,
}

/// User-visible state changes, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Loaded {
        name: String,
        /// `None` when the document opened in raw-edit mode.
        items: Option<usize>,
    },
    FormatError(LineError),
    Reloaded {
        signature: ChangeSignature,
        items: Option<usize>,
    },
    ReloadFailed {
        message: String,
    },
    LocalEditsDiscarded {
        local_text: String,
    },
    Saved {
        signature: ChangeSignature,
    },
    SaveFailed {
        message: String,
    },
    WatchStopped {
        reason: String,
    },
    Unloaded,
}

struct DocState {
    phase: SyncPhase,
    view: Option<DocumentView>,
}

struct OrchestratorInner {
    settings: SyncSettings,
    capability: Arc<CapabilityManager>,
    poller: ChangePoller,
    autosave: AutosaveCoordinator,
    doc: Mutex<DocState>,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl OrchestratorInner {
    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn phase(&self) -> SyncPhase {
        lock(&self.doc).phase
    }

    fn set_phase(&self, phase: SyncPhase) {
        lock(&self.doc).phase = phase;
    }

    fn accepts_autosave(&self) -> bool {
        let doc = lock(&self.doc);
        doc.phase == SyncPhase::Watching && doc.view.is_some()
    }

    fn current_text(&self) -> Option<String> {
        lock(&self.doc).view.as_ref().map(DocumentView::to_text)
    }

    /// Stop watching and forget the handle.  The in-memory document is kept
    /// so nothing the user typed is lost.
    fn detach(&self, phase: SyncPhase) {
        self.poller.stop();
        self.autosave.cancel();
        self.capability.release();
        self.set_phase(phase);
    }

    fn watch_failed(&self, err: &SyncError) {
        if err.is_terminal() {
            warn!(error = %err, "watched document became unreachable");
            self.detach(SyncPhase::Unbound);
        } else {
            warn!(error = %err, "change polling halted");
            self.set_phase(SyncPhase::Bound);
        }
        self.emit(SyncEvent::WatchStopped {
            reason: err.to_string(),
        });
    }

    /// Undo a load that never got as far as reading the file.
    fn abandon_load(&self, err: &SyncError) {
        debug!(error = %err, "load abandoned before the document was read");
        self.capability.release();
        self.set_phase(SyncPhase::Unbound);
    }

    async fn load(self: &Arc<Self>, handle: Arc<dyn CapabilityHandle>) -> Result<DocumentView> {
        if self.capability.is_bound() {
            self.detach(SyncPhase::Unbound);
        }
        // The previous document must never reach the new handle.
        lock(&self.doc).view = None;

        let name = handle.name();
        self.capability.bind(handle);
        self.set_phase(SyncPhase::PermissionPending);
        if let Err(err) = self.capability.request_readable().await {
            self.abandon_load(&err);
            return Err(err);
        }
        self.set_phase(SyncPhase::Bound);

        let text = match self.capability.read().await {
            Ok(text) => text,
            Err(err) => {
                self.abandon_load(&err);
                return Err(err);
            }
        };
        let view = DocumentView::from_text(&text);
        lock(&self.doc).view = Some(view.clone());

        let weak = Arc::downgrade(self);
        let on_change: ChangeCallback = Arc::new(move |signature: ChangeSignature| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    if let Err(err) = inner.on_external_change(signature).await {
                        warn!(error = %err, "reload after external change failed");
                    }
                }
            }
            .boxed()
        });
        self.poller
            .start(self.capability.clone(), self.settings.poll_interval, on_change)
            .await?;
        self.set_phase(SyncPhase::Watching);

        let items = view.checklist().map(ChecklistDocument::len);
        info!(%name, items = ?items, "document loaded");
        if let Some(error) = view.format_error() {
            warn!(
                %name,
                line = error.line,
                message = %error.message,
                "document opened in raw-edit mode"
            );
            self.emit(SyncEvent::FormatError(error.clone()));
        }
        self.emit(SyncEvent::Loaded { name, items });
        Ok(view)
    }

    async fn on_external_change(self: &Arc<Self>, signature: ChangeSignature) -> Result<()> {
        let local_pending = self.autosave.is_pending();
        {
            let mut doc = lock(&self.doc);
            if doc.phase != SyncPhase::Watching {
                debug!(phase = ?doc.phase, "external change ignored outside watching phase");
                return Ok(());
            }
            if local_pending && self.settings.conflict_policy == ConflictPolicy::KeepLocal {
                info!("external change left in place: local edits pending and policy keeps local");
                return Ok(());
            }
            doc.phase = SyncPhase::Reloading;
        }

        let discarded = if local_pending {
            self.current_text()
        } else {
            None
        };
        self.autosave.cancel();

        let text = match self.capability.read().await {
            Ok(text) => text,
            Err(err) => {
                if err.is_terminal() {
                    self.watch_failed(&err);
                } else {
                    self.set_phase(SyncPhase::Watching);
                    self.emit(SyncEvent::ReloadFailed {
                        message: err.to_string(),
                    });
                }
                return Err(err);
            }
        };

        let mut view = DocumentView::from_text(&text);
        {
            let mut doc = lock(&self.doc);
            if let (Some(DocumentView::Items(previous)), DocumentView::Items(fresh)) =
                (doc.view.as_ref(), &mut view)
            {
                fresh.reconcile_ids(previous);
            }
            doc.view = Some(view.clone());
            doc.phase = SyncPhase::Watching;
        }
        self.poller.update_baseline(signature);

        if let Some(local_text) = discarded.filter(|local| *local != text) {
            warn!(bytes = local_text.len(), "local edits replaced by external change");
            self.emit(SyncEvent::LocalEditsDiscarded { local_text });
        }
        if let Some(error) = view.format_error() {
            self.emit(SyncEvent::FormatError(error.clone()));
        }
        let items = view.checklist().map(ChecklistDocument::len);
        info!(items = ?items, "document reloaded after external change");
        self.emit(SyncEvent::Reloaded { signature, items });
        Ok(())
    }

    async fn write_and_rebaseline(&self, text: &str) -> Result<WriteOutcome> {
        match self.capability.write(text).await {
            Ok(WriteOutcome::Committed) => {
                let signature = self.capability.signature().await?;
                self.poller.update_baseline(signature);
                self.emit(SyncEvent::Saved { signature });
                Ok(WriteOutcome::Committed)
            }
            Ok(WriteOutcome::Skipped) => Ok(WriteOutcome::Skipped),
            Err(err) => {
                self.emit(SyncEvent::SaveFailed {
                    message: err.to_string(),
                });
                if err.is_terminal() {
                    self.watch_failed(&err);
                }
                Err(err)
            }
        }
    }

    async fn commit_autosave(&self, content: String) -> Result<()> {
        if self.write_and_rebaseline(&content).await? == WriteOutcome::Skipped {
            // Another write owns the file right now; try again after it.
            debug!("autosave collided with an in-flight write, re-arming");
            self.autosave.notify_mutation();
        }
        Ok(())
    }
}

impl Drop for OrchestratorInner {
    fn drop(&mut self) {
        self.poller.stop();
    }
}

/// Keeps one checklist document in sync with the file behind a capability
/// handle.  Cheap to clone; clones share the same document.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl SyncOrchestrator {
    pub fn new(settings: SyncSettings) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let debounce = settings.autosave_debounce;
        let autosave_enabled = settings.autosave_enabled;

        let inner = Arc::new_cyclic(|weak: &Weak<OrchestratorInner>| {
            let source_ref = weak.clone();
            let source: ContentSource =
                Arc::new(move || source_ref.upgrade().and_then(|inner| inner.current_text()));

            let commit_ref = weak.clone();
            let commit: CommitFn = Arc::new(move |content: String| {
                let commit_ref = commit_ref.clone();
                async move {
                    match commit_ref.upgrade() {
                        Some(inner) => inner.commit_autosave(content).await,
                        None => Ok(()),
                    }
                }
                .boxed()
            });

            let enabled_ref = weak.clone();
            let enabled: EnabledCondition = Arc::new(move || {
                autosave_enabled
                    && enabled_ref
                        .upgrade()
                        .is_some_and(|inner| inner.accepts_autosave())
            });

            let poller = ChangePoller::new();
            let hook_ref = weak.clone();
            poller.set_failure_hook(Arc::new(move |err: &SyncError| {
                if let Some(inner) = hook_ref.upgrade() {
                    inner.watch_failed(err);
                }
            }));

            OrchestratorInner {
                settings,
                capability: Arc::new(CapabilityManager::new()),
                poller,
                autosave: AutosaveCoordinator::configure(source, commit, debounce, enabled),
                doc: Mutex::new(DocState {
                    phase: SyncPhase::Unbound,
                    view: None,
                }),
                events,
            }
        });
        (Self { inner }, receiver)
    }

    /// Bind `handle`, read and parse it, then start watching.  A document that
    /// does not follow the checklist grammar still loads, in raw-edit mode.
    ///
    /// The previous document is dropped first.  If permission or the read
    /// fails, the handle is released again and the phase is back to
    /// [`SyncPhase::Unbound`].
    pub async fn load(&self, handle: Arc<dyn CapabilityHandle>) -> Result<DocumentView> {
        self.inner.load(handle).await
    }

    /// Re-read after the poller reported `signature`.  External content wins
    /// unless the policy is [`ConflictPolicy::KeepLocal`] and a save is
    /// pending.
    pub async fn on_external_change(&self, signature: ChangeSignature) -> Result<()> {
        self.inner.on_external_change(signature).await
    }

    /// Force a reload from disk, regardless of the poller.
    pub async fn reload(&self) -> Result<()> {
        let signature = self.inner.capability.signature().await?;
        self.inner.on_external_change(signature).await
    }

    /// Take one poll sample now.  `Ok(Some(_))` means an external change was
    /// found and reconciled.
    pub async fn refresh(&self) -> Result<Option<ChangeSignature>> {
        self.inner.poller.poll_now().await
    }

    /// Write the current document and move the poller baseline past our own
    /// write.  Supersedes any pending autosave.  Refused with
    /// [`SyncError::NotBound`] unless a handle was fully loaded.
    pub async fn save(&self) -> Result<WriteOutcome> {
        let text = {
            let doc = lock(&self.inner.doc);
            if !matches!(doc.phase, SyncPhase::Bound | SyncPhase::Watching) {
                return Err(SyncError::NotBound);
            }
            doc.view
                .as_ref()
                .map(DocumentView::to_text)
                .ok_or(SyncError::NotBound)?
        };
        self.inner.autosave.cancel();
        self.inner.write_and_rebaseline(&text).await
    }

    /// Manual retry after a failed autosave.
    pub async fn retry_save(&self) -> Result<WriteOutcome> {
        self.inner.autosave.clear_retry();
        self.save().await
    }

    /// Explicit re-request after a denied write prompt.
    pub async fn request_write_access(&self) -> Result<()> {
        self.inner.capability.request_writable().await
    }

    /// Mutate the document and schedule an autosave.  `f` must not call back
    /// into the orchestrator.
    pub fn edit<R>(&self, f: impl FnOnce(&mut DocumentView) -> R) -> Result<R> {
        let result = {
            let mut doc = lock(&self.inner.doc);
            let view = doc.view.as_mut().ok_or(SyncError::NotBound)?;
            f(view)
        };
        self.inner.autosave.notify_mutation();
        Ok(result)
    }

    /// Item-level edit.  Refused with the stored [`LineError`] while the
    /// document is in raw-edit mode.
    pub fn edit_checklist<R>(&self, f: impl FnOnce(&mut ChecklistDocument) -> R) -> Result<R> {
        let result = {
            let mut doc = lock(&self.inner.doc);
            match doc.view.as_mut() {
                None => return Err(SyncError::NotBound),
                Some(DocumentView::Raw { error, .. }) => {
                    return Err(SyncError::Format(error.clone()));
                }
                Some(DocumentView::Items(checklist)) => f(checklist),
            }
        };
        self.inner.autosave.notify_mutation();
        Ok(result)
    }

    pub fn replace_document(&self, view: DocumentView) -> Result<()> {
        self.edit(|current| *current = view)
    }

    /// Stop watching, drop any pending autosave and release the handle.
    /// Host permission is not revoked.
    pub fn unload(&self) {
        let inner = &self.inner;
        inner.poller.stop();
        inner.autosave.cancel();
        inner.capability.release();
        {
            let mut doc = lock(&inner.doc);
            doc.phase = SyncPhase::Unbound;
            doc.view = None;
        }
        info!("document unloaded");
        inner.emit(SyncEvent::Unloaded);
    }

    pub fn document(&self) -> Option<DocumentView> {
        lock(&self.inner.doc).view.clone()
    }

    pub fn phase(&self) -> SyncPhase {
        self.inner.phase()
    }

    pub fn is_watching(&self) -> bool {
        self.inner.poller.is_running()
    }

    pub fn autosave_pending(&self) -> bool {
        self.inner.autosave.is_pending()
    }

    /// The last autosave failed and nothing has been saved since.
    pub fn needs_retry(&self) -> bool {
        self.inner.autosave.needs_retry()
    }

    pub fn baseline(&self) -> Option<ChangeSignature> {
        self.inner.poller.baseline()
    }

    pub fn capability(&self) -> &CapabilityManager {
        &self.inner.capability
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }
}
