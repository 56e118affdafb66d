//! Poll-based external change detection.
//!
//! The host gives no change notifications for an arbitrary granted file, so
//! the watched file's [`ChangeSignature`] is sampled on a fixed interval and
//! compared against a baseline.  A different watcher can replace this one
//! behind [`SignatureSource`] and the same callback.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityManager, ChangeSignature};
use crate::error::{Result, SyncError};
use crate::lock;

/// Invoked once per detected divergence with the new signature.
pub type ChangeCallback = Arc<dyn Fn(ChangeSignature) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked once when the poller stops itself after a failed sample.
pub type FailureHook = Arc<dyn Fn(&SyncError) + Send + Sync>;

#[async_trait]
pub trait SignatureSource: Send + Sync {
    async fn sample(&self) -> Result<ChangeSignature>;
}

#[async_trait]
impl SignatureSource for CapabilityManager {
    async fn sample(&self) -> Result<ChangeSignature> {
        self.signature().await
    }
}

struct PollerRun {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    source: Arc<dyn SignatureSource>,
    on_change: ChangeCallback,
}

#[derive(Default)]
struct PollerShared {
    baseline: Mutex<Option<ChangeSignature>>,
    run: Mutex<Option<PollerRun>>,
    failure_hook: Mutex<Option<FailureHook>>,
}

impl PollerShared {
    /// Sample once and adopt the result as baseline if it diverged.
    async fn check(&self, source: &dyn SignatureSource) -> Result<Option<ChangeSignature>> {
        let current = source.sample().await?;
        let mut baseline = lock(&self.baseline);
        match *baseline {
            Some(known) if current.diverges_from(&known) => {
                *baseline = Some(current);
                Ok(Some(current))
            }
            Some(_) => Ok(None),
            None => {
                *baseline = Some(current);
                Ok(None)
            }
        }
    }

    fn fail(&self, err: &SyncError) {
        warn!(error = %err, "change poller stopping after failed sample");
        if let Some(run) = lock(&self.run).take() {
            let _ = run.stop_tx.send(true);
        }
        let hook = lock(&self.failure_hook).clone();
        if let Some(hook) = hook {
            hook(err);
        }
    }
}

/// Samples a file's signature every `interval` and reports divergence.
#[derive(Clone, Default)]
pub struct ChangePoller {
    shared: Arc<PollerShared>,
}

impl ChangePoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once, from the poll task, when sampling fails and the poller
    /// gives up.
    pub fn set_failure_hook(&self, hook: FailureHook) {
        *lock(&self.shared.failure_hook) = Some(hook);
    }

    /// Sample the baseline now, then sample again every `interval`.
    ///
    /// Restarts cleanly if already running.  Fails without starting when the
    /// baseline sample cannot be taken.
    pub async fn start(
        &self,
        source: Arc<dyn SignatureSource>,
        interval: Duration,
        on_change: ChangeCallback,
    ) -> Result<()> {
        self.stop();
        let baseline = source.sample().await?;
        *lock(&self.shared.baseline) = Some(baseline);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let task_source = source.clone();
        let task_callback = on_change.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the baseline is already taken.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if *stop_rx.borrow() {
                    break;
                }
                match shared.check(task_source.as_ref()).await {
                    Ok(Some(signature)) => {
                        info!(
                            size = signature.size_bytes,
                            modified_at = %signature.modified_at,
                            "external change detected"
                        );
                        task_callback(signature).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        shared.fail(&err);
                        break;
                    }
                }
            }
            debug!("change poller task exited");
        });

        *lock(&self.shared.run) = Some(PollerRun {
            stop_tx,
            task,
            source,
            on_change,
        });
        info!(interval_ms = interval.as_millis() as u64, "change poller started");
        Ok(())
    }

    /// Cancel polling.  Safe to call repeatedly and from inside the change
    /// callback; a callback already running finishes first.
    pub fn stop(&self) {
        if let Some(run) = lock(&self.shared.run).take() {
            let _ = run.stop_tx.send(true);
            debug!("change poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.run)
            .as_ref()
            .is_some_and(|run| !run.task.is_finished())
    }

    /// Reset the baseline after the owner reconciled content itself.
    pub fn update_baseline(&self, signature: ChangeSignature) {
        *lock(&self.shared.baseline) = Some(signature);
    }

    pub fn baseline(&self) -> Option<ChangeSignature> {
        *lock(&self.shared.baseline)
    }

    /// Take one sample right now, outside the timer.  Fires the change
    /// callback on divergence exactly like a timed poll.  Returns `Ok(None)`
    /// when nothing changed or the poller is not running.
    pub async fn poll_now(&self) -> Result<Option<ChangeSignature>> {
        let active = lock(&self.shared.run)
            .as_ref()
            .map(|run| (run.source.clone(), run.on_change.clone()));
        let Some((source, on_change)) = active else {
            return Ok(None);
        };
        match self.shared.check(source.as_ref()).await {
            Ok(Some(signature)) => {
                on_change(signature).await;
                Ok(Some(signature))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.shared.fail(&err);
                Err(err)
            }
        }
    }
}
