//! Trailing-edge debounced autosave.
//!
//! `Idle -> Dirty` on a mutation while enabled, `Dirty -> Committing -> Idle`
//! when the debounce timer fires, `Dirty -> Idle` when the enable condition
//! turns false first.  The condition is checked again when the timer fires.
//! A failed commit is not retried; it only flips [`needs_retry`].
//!
//! [`needs_retry`]: AutosaveCoordinator::needs_retry

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::lock;

/// Produces the text to commit.  `None` means there is nothing to save.
pub type ContentSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

pub type CommitFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub type EnabledCondition = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct AutosaveState {
    generation: u64,
    pending: bool,
    timer: Option<JoinHandle<()>>,
    commits: u64,
    needs_retry: bool,
    last_error: Option<String>,
}

struct AutosaveInner {
    source: ContentSource,
    commit: CommitFn,
    enabled: EnabledCondition,
    debounce: Duration,
    state: Mutex<AutosaveState>,
}

impl AutosaveInner {
    async fn fire(self: Arc<Self>, generation: u64) {
        if lock(&self.state).generation != generation {
            return;
        }
        // Evaluated outside the lock: the condition may call back into the
        // owner, which may ask us for our state.
        let enabled = (self.enabled)();
        {
            let mut state = lock(&self.state);
            if state.generation != generation {
                return;
            }
            // Detach our own handle so a cancel from inside the commit cannot
            // abort the commit halfway.
            state.timer = None;
            state.pending = false;
            if !enabled {
                debug!("autosave skipped: disabled when the timer fired");
                return;
            }
        }

        let Some(content) = (self.source)() else {
            return;
        };
        let bytes = content.len();
        match (self.commit)(content).await {
            Ok(()) => {
                let mut state = lock(&self.state);
                state.commits += 1;
                state.needs_retry = false;
                state.last_error = None;
                debug!(bytes, "autosave committed");
            }
            Err(err) => {
                warn!(error = %err, "autosave commit failed; waiting for manual retry");
                let mut state = lock(&self.state);
                state.needs_retry = true;
                state.last_error = Some(err.to_string());
            }
        }
    }
}

/// Debounces content mutations into commits.
///
/// Dropping the coordinator cancels any pending timer.
pub struct AutosaveCoordinator {
    inner: Arc<AutosaveInner>,
}

impl AutosaveCoordinator {
    pub fn configure(
        source: ContentSource,
        commit: CommitFn,
        debounce: Duration,
        enabled: EnabledCondition,
    ) -> Self {
        Self {
            inner: Arc::new(AutosaveInner {
                source,
                commit,
                enabled,
                debounce,
                state: Mutex::new(AutosaveState::default()),
            }),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Record a content mutation: mark dirty and restart the countdown.
    /// Ignored (and any pending save dropped) while disabled.
    pub fn notify_mutation(&self) {
        if !(self.inner.enabled)() {
            self.cancel();
            return;
        }
        let mut state = lock(&self.inner.state);
        state.generation += 1;
        state.pending = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let generation = state.generation;
        let inner = self.inner.clone();
        let debounce = self.inner.debounce;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            inner.fire(generation).await;
        }));
    }

    /// Drop the pending save, if any.  Idempotent; safe from inside a commit.
    pub fn cancel(&self) {
        let mut state = lock(&self.inner.state);
        state.generation += 1;
        if state.pending {
            debug!("pending autosave cancelled");
        }
        state.pending = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Re-check the enable condition now and clear dirtiness if it no longer
    /// holds.  A later re-enable does not bring the old save back.
    pub fn reevaluate(&self) {
        if self.is_pending() && !(self.inner.enabled)() {
            self.cancel();
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.inner.state).pending
    }

    pub fn commit_count(&self) -> u64 {
        lock(&self.inner.state).commits
    }

    pub fn needs_retry(&self) -> bool {
        lock(&self.inner.state).needs_retry
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.state).last_error.clone()
    }

    pub fn clear_retry(&self) {
        let mut state = lock(&self.inner.state);
        state.needs_retry = false;
        state.last_error = None;
    }
}

impl Drop for AutosaveCoordinator {
    fn drop(&mut self) {
        self.cancel();
    }
}
