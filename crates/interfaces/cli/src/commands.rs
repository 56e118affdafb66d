use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use vaultsync_config::AppConfig;
use vaultsync_engine::{
    CapabilityHandle, ChecklistDocument, DocumentView, FsHandle, HandleKind, HandleRole,
    HandleStore, JsonHandleStore, PermissionBroker, ScanOptions, SyncEvent, SyncOrchestrator,
    SyncPhase, VaultTasks, scan_vault,
};

use crate::prompt::broker_for;

pub(crate) struct Session {
    config: AppConfig,
    store: JsonHandleStore,
    broker: Arc<dyn PermissionBroker>,
}

impl Session {
    pub(crate) fn new(config: AppConfig) -> Self {
        let store = JsonHandleStore::new(config.handles_path());
        let broker = broker_for(config.permissions.mode);
        Self {
            config,
            store,
            broker,
        }
    }

    /// `path` when given, otherwise the stored active file.
    async fn resolve_file(&self, path: Option<PathBuf>) -> Result<FsHandle> {
        let handle = match path {
            Some(path) => FsHandle::picked(path, self.broker.clone()).await?,
            None => {
                let record = self
                    .store
                    .load(HandleRole::ActiveFile)
                    .await?
                    .context("no active file; run `vaultsync open <path>` first")?;
                FsHandle::from_record(&record, self.broker.clone())
            }
        };
        if handle.kind() != HandleKind::File {
            bail!("{} is a directory, not a note", handle.path().display());
        }
        Ok(handle)
    }

    async fn load(
        &self,
        path: Option<PathBuf>,
    ) -> Result<(SyncOrchestrator, UnboundedReceiver<SyncEvent>, DocumentView)> {
        let handle = self.resolve_file(path).await?;
        let (sync, events) = SyncOrchestrator::new(self.config.sync_settings());
        let view = sync.load(Arc::new(handle)).await?;
        Ok((sync, events, view))
    }

    pub(crate) async fn open(&self, path: PathBuf) -> Result<()> {
        let handle = FsHandle::picked(path, self.broker.clone()).await?;
        let role = match handle.kind() {
            HandleKind::File => HandleRole::ActiveFile,
            HandleKind::Directory => HandleRole::VaultRoot,
        };
        self.store.save(role, &handle.record()).await?;
        println!("{role}: {}", handle.path().display());
        Ok(())
    }

    pub(crate) async fn show(&self, path: Option<PathBuf>) -> Result<()> {
        let (sync, _events, view) = self.load(path).await?;
        print_view(&view);
        sync.unload();
        Ok(())
    }

    /// Apply one item-level edit, save it and print the result.
    pub(crate) async fn mutate<F>(&self, path: Option<PathBuf>, edit: F) -> Result<()>
    where
        F: FnOnce(&mut ChecklistDocument) -> Result<String>,
    {
        let (sync, _events, _view) = self.load(path).await?;
        let message = sync.edit_checklist(edit)??;
        sync.save().await?;
        info!(%message, "checklist updated");
        println!("{message}");
        if let Some(view) = sync.document() {
            print_view(&view);
        }
        sync.unload();
        Ok(())
    }

    pub(crate) async fn watch(&self, path: Option<PathBuf>) -> Result<()> {
        let (sync, mut events, view) = self.load(path).await?;
        print_view(&view);
        println!(
            "watching every {} ms; press Ctrl-C to stop",
            sync.settings().poll_interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    report(&event);
                    if matches!(event, SyncEvent::Reloaded { .. }) {
                        if let Some(view) = sync.document() {
                            print_view(&view);
                        }
                    }
                    if matches!(event, SyncEvent::WatchStopped { .. })
                        && sync.phase() == SyncPhase::Unbound
                    {
                        break;
                    }
                }
            }
        }

        if sync.needs_retry() {
            warn!("last autosave failed; saving once more before exit");
            if let Err(err) = sync.retry_save().await {
                warn!(error = %err, "final save failed");
            }
        }
        sync.unload();
        Ok(())
    }

    async fn scan_root(&self, root: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(root) = root.or_else(|| self.config.vault_root()) {
            return Ok(root);
        }
        let record = self
            .store
            .load(HandleRole::VaultRoot)
            .await?
            .context("no vault root; pass one, set vault.root or `vaultsync open <dir>`")?;
        Ok(record.path)
    }

    pub(crate) async fn scan(
        &self,
        root: Option<PathBuf>,
        open_only: bool,
        json: bool,
    ) -> Result<()> {
        let root = self.scan_root(root).await?;
        let options = ScanOptions {
            extension: self.config.vault.note_extension.clone(),
            vault_name: self.config.vault_name(),
        };
        let scan_path = root.clone();
        let mut tasks = tokio::task::spawn_blocking(move || scan_vault(&scan_path, &options))
            .await
            .context("vault scan task failed")??;
        if open_only {
            retain_open(&mut tasks);
        }

        if json {
            println!("{}", serde_json::to_string_pretty(&tasks)?);
            return Ok(());
        }
        print_tasks(&root, &tasks);
        Ok(())
    }

    pub(crate) async fn handles(&self) -> Result<()> {
        let entries = self.store.entries().await?;
        if entries.is_empty() {
            println!("no stored handles in {}", self.store.path().display());
            return Ok(());
        }
        for (role, record) in entries {
            let kind = match record.kind {
                HandleKind::File => "file",
                HandleKind::Directory => "directory",
            };
            println!("{role:<12} {kind:<9} {}", record.path.display());
        }
        Ok(())
    }
}

/// 1-based position as printed by `show`.
pub(crate) fn index_of(doc: &ChecklistDocument, position: usize) -> Result<usize> {
    if position == 0 || position > doc.len() {
        bail!("no item {position}; the list has {} items", doc.len());
    }
    Ok(position - 1)
}

pub(crate) fn toggle(doc: &mut ChecklistDocument, position: usize) -> Result<String> {
    let index = index_of(doc, position)?;
    let id = doc.at(index).map(|item| item.id).context("item vanished")?;
    let done = doc.toggle(id).context("item vanished")?;
    Ok(format!(
        "item {position} marked {}",
        if done { "done" } else { "open" }
    ))
}

pub(crate) fn add(doc: &mut ChecklistDocument, text: &str) -> Result<String> {
    doc.push(text)?;
    Ok(format!("added item {}", doc.len()))
}

pub(crate) fn remove(doc: &mut ChecklistDocument, position: usize) -> Result<String> {
    let index = index_of(doc, position)?;
    let id = doc.at(index).map(|item| item.id).context("item vanished")?;
    let removed = doc.remove(id).context("item vanished")?;
    Ok(format!("removed \"{}\"", removed.text))
}

pub(crate) fn rename(doc: &mut ChecklistDocument, position: usize, text: &str) -> Result<String> {
    let index = index_of(doc, position)?;
    let id = doc.at(index).map(|item| item.id).context("item vanished")?;
    doc.rename(id, text)?;
    Ok(format!("item {position} renamed"))
}

fn retain_open(tasks: &mut VaultTasks) {
    for found in tasks.notes.values_mut() {
        found.retain(|task| !task.completed);
    }
    tasks.notes.retain(|_, found| !found.is_empty());
}

fn print_view(view: &DocumentView) {
    match view {
        DocumentView::Items(doc) => {
            if doc.is_empty() {
                println!("(empty checklist)");
            }
            for (index, item) in doc.items().iter().enumerate() {
                let mark = if item.completed { 'x' } else { ' ' };
                println!("{:>3}. [{mark}] {}", index + 1, item.text);
            }
        }
        DocumentView::Raw { text, error } => {
            println!("(not a checklist: {error}; showing raw text)");
            println!("{text}");
        }
    }
}

fn print_tasks(root: &Path, tasks: &VaultTasks) {
    println!(
        "vault {} ({}): {} tasks, {} open",
        tasks.vault,
        root.display(),
        tasks.task_count(),
        tasks.open_count()
    );
    for (note, found) in &tasks.notes {
        println!("\n{note}");
        for task in found {
            let mark = if task.completed { 'x' } else { ' ' };
            println!("  {:>4}: [{mark}] {}", task.line, task.text);
        }
        if let Some(first) = found.first() {
            println!("        {}", first.link);
        }
    }
}

fn report(event: &SyncEvent) {
    match event {
        SyncEvent::Loaded { name, items } => match items {
            Some(count) => println!("loaded {name} ({count} items)"),
            None => println!("loaded {name} (raw text)"),
        },
        SyncEvent::FormatError(error) => println!("format error: {error}"),
        SyncEvent::Reloaded { signature, .. } => {
            println!("reloaded: changed on disk at {}", signature.modified_at);
        }
        SyncEvent::ReloadFailed { message } => println!("reload failed: {message}"),
        SyncEvent::LocalEditsDiscarded { local_text } => {
            println!("local edits discarded ({} bytes)", local_text.len());
        }
        SyncEvent::Saved { .. } => println!("saved"),
        SyncEvent::SaveFailed { message } => println!("save failed: {message}"),
        SyncEvent::WatchStopped { reason } => println!("stopped watching: {reason}"),
        SyncEvent::Unloaded => println!("unloaded"),
    }
}
