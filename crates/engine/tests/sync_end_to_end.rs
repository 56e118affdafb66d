use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use vaultsync_engine::{
    CapabilityHandle, ChecklistDocument, DocumentView, FsHandle, HandleRole, HandleStore,
    JsonHandleStore, MemoryHandle, PermissionState, StaticBroker, SyncError, SyncEvent,
    SyncOrchestrator, SyncPhase, SyncSettings, WriteOutcome,
};

fn drain(rx: &mut UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Polling and autosave far enough out that only explicit calls move state.
fn manual_settings() -> SyncSettings {
    SyncSettings {
        poll_interval: Duration::from_secs(3600),
        autosave_debounce: Duration::from_secs(3600),
        ..SyncSettings::default()
    }
}

#[test]
fn toggle_then_serialize() {
    let mut doc = ChecklistDocument::parse("- [ ] buy milk\n- [x] pay rent").unwrap();
    assert_eq!(doc.len(), 2);
    assert_eq!(doc.at(0).unwrap().text, "buy milk");
    assert!(!doc.at(0).unwrap().completed);
    assert!(doc.at(1).unwrap().completed);

    let first = doc.at(0).unwrap().id;
    assert_eq!(doc.toggle(first), Some(true));
    assert_eq!(doc.to_text(), "- [x] buy milk\n- [x] pay rent");
}

#[test]
fn malformed_line_is_reported_by_number() {
    let err = ChecklistDocument::parse("- [ ] ok\n* bad").unwrap_err();
    assert_eq!(err.line, 2);
}

#[tokio::test]
async fn filesystem_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("todo.md");
    std::fs::write(&path, "- [ ] buy milk\n- [x] pay rent").unwrap();

    let handle = FsHandle::picked(&path, Arc::new(StaticBroker::grant()))
        .await
        .unwrap();
    let (sync, mut rx) = SyncOrchestrator::new(manual_settings());
    sync.load(Arc::new(handle)).await.unwrap();
    assert_eq!(sync.phase(), SyncPhase::Watching);

    let loaded = sync.document().unwrap();
    let milk = loaded.checklist().unwrap().at(0).unwrap().id;
    sync.edit_checklist(|doc| doc.toggle(milk)).unwrap();
    assert_eq!(sync.save().await.unwrap(), WriteOutcome::Committed);
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "- [x] buy milk\n- [x] pay rent"
    );
    assert!(!path.with_file_name(".todo.md.vaultsync.tmp").exists());

    // Our own write is not an external change.
    assert_eq!(sync.refresh().await.unwrap(), None);

    std::fs::write(&path, "- [x] buy milk\n- [x] pay rent\n- [ ] call mum").unwrap();
    assert!(sync.refresh().await.unwrap().is_some());

    let doc = sync.document().unwrap();
    let checklist = doc.checklist().unwrap();
    assert_eq!(checklist.len(), 3);
    assert_eq!(checklist.at(0).unwrap().id, milk);
    assert_eq!(checklist.at(2).unwrap().text, "call mum");

    let events = drain(&mut rx);
    assert!(matches!(events.last(), Some(SyncEvent::Reloaded { items: Some(3), .. })));
    sync.unload();
}

#[tokio::test]
async fn deleted_file_unbinds_but_keeps_document() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("todo.md");
    std::fs::write(&path, "- [ ] a").unwrap();

    let handle = FsHandle::picked(&path, Arc::new(StaticBroker::grant()))
        .await
        .unwrap();
    let (sync, _rx) = SyncOrchestrator::new(manual_settings());
    sync.load(Arc::new(handle)).await.unwrap();

    std::fs::remove_file(&path).unwrap();
    let err = sync.refresh().await.unwrap_err();
    assert!(matches!(err, SyncError::CapabilityInvalid { .. }));
    assert_eq!(sync.phase(), SyncPhase::Unbound);
    assert_eq!(sync.document().unwrap().to_text(), "- [ ] a");
    // Saving must not recreate the file behind the user's back.
    assert!(sync.save().await.is_err());
    assert!(!path.exists());
}

#[tokio::test]
async fn stored_handle_reopens_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("todo.md");
    std::fs::write(&path, "- [ ] a").unwrap();
    let store = JsonHandleStore::new(dir.path().join(".vaultsync/handles.json"));

    let picked = FsHandle::picked(&path, Arc::new(StaticBroker::grant()))
        .await
        .unwrap();
    store
        .save(HandleRole::ActiveFile, &picked.record())
        .await
        .unwrap();

    let record = store.load(HandleRole::ActiveFile).await.unwrap().unwrap();

    // A dismissed prompt leaves the document unloaded.
    let dismissed = FsHandle::from_record(&record, Arc::new(StaticBroker::dismiss()));
    let (sync, _rx) = SyncOrchestrator::new(manual_settings());
    let err = sync.load(Arc::new(dismissed)).await.unwrap_err();
    assert!(err.is_permission());
    assert_eq!(sync.phase(), SyncPhase::Unbound);

    let granted = FsHandle::from_record(&record, Arc::new(StaticBroker::grant()));
    let view = sync.load(Arc::new(granted)).await.unwrap();
    assert_eq!(view.to_text(), "- [ ] a");
    assert_eq!(sync.phase(), SyncPhase::Watching);
}

#[tokio::test]
async fn switching_files_never_carries_content_across() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.md");
    let second = dir.path().join("second.md");
    std::fs::write(&first, "- [ ] secret from first").unwrap();
    std::fs::write(&second, "- [ ] second").unwrap();

    let (sync, _rx) = SyncOrchestrator::new(manual_settings());
    let handle = FsHandle::picked(&first, Arc::new(StaticBroker::grant()))
        .await
        .unwrap();
    sync.load(Arc::new(handle)).await.unwrap();

    let record = FsHandle::picked(&second, Arc::new(StaticBroker::grant()))
        .await
        .unwrap()
        .record();
    let dismissed = FsHandle::from_record(&record, Arc::new(StaticBroker::dismiss()));
    let err = sync.load(Arc::new(dismissed)).await.unwrap_err();
    assert!(err.is_permission());

    assert!(matches!(sync.save().await, Err(SyncError::NotBound)));
    assert_eq!(std::fs::read_to_string(&second).unwrap(), "- [ ] second");
    assert_eq!(
        std::fs::read_to_string(&first).unwrap(),
        "- [ ] secret from first"
    );
}

#[tokio::test]
async fn raw_document_round_trips_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notes.md");
    std::fs::write(&path, "# Notes\n- [ ] a").unwrap();

    let handle = FsHandle::picked(&path, Arc::new(StaticBroker::grant()))
        .await
        .unwrap();
    let (sync, mut rx) = SyncOrchestrator::new(manual_settings());
    let view = sync.load(Arc::new(handle)).await.unwrap();
    assert!(view.is_raw());
    assert_eq!(view.format_error().unwrap().line, 1);
    assert!(matches!(
        drain(&mut rx).first(),
        Some(SyncEvent::FormatError(error)) if error.line == 1
    ));

    assert!(matches!(
        sync.edit_checklist(|doc| doc.len()).unwrap_err(),
        SyncError::Format(_)
    ));

    sync.edit(|view| view.set_raw_text("- [ ] a\n- [ ] b")).unwrap();
    sync.save().await.unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "- [ ] a\n- [ ] b");
}

#[tokio::test(start_paused = true)]
async fn burst_of_edits_writes_once() {
    let handle = Arc::new(
        MemoryHandle::new("todo.md", "- [ ] a")
            .with_permissions(PermissionState::Granted, PermissionState::Granted),
    );
    let settings = SyncSettings {
        poll_interval: Duration::from_millis(500),
        autosave_debounce: Duration::from_millis(200),
        ..SyncSettings::default()
    };
    let (sync, _rx) = SyncOrchestrator::new(settings);
    sync.load(handle.clone()).await.unwrap();

    for i in 0..8 {
        sync.replace_document(DocumentView::from_text(&format!("- [ ] edit {i}")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(handle.write_count(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(handle.write_count(), 1);
    assert_eq!(handle.content(), "- [ ] edit 7");

    // The poller does not mistake the autosave for an external edit.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(sync.refresh().await.unwrap(), None);
    assert_eq!(sync.document().unwrap().to_text(), "- [ ] edit 7");
}
