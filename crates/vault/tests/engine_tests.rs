//! End-to-end engine tests: mock remote on one side, a real file store
//! in a tempdir on the other.

use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use tempfile::TempDir;

use vault::{
    CancelToken, FileLinkStore, LabelType, LinkStore, MailRemote, MailboxEngine, MockRemote,
    RecordId, RecordKind, RestoreFilter,
};

fn setup(email: &str) -> (TempDir, Arc<FileLinkStore>, Arc<MockRemote>, MailboxEngine) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileLinkStore::new(dir.path()).unwrap());
    let remote = Arc::new(MockRemote::new());
    let engine = MailboxEngine::new(email, store.clone(), remote.clone()).with_workers(2);
    (dir, store, remote, engine)
}

// version tokens have millisecond resolution; successive passes in a
// test can otherwise land on the same token
fn next_version_tick() {
    sleep(Duration::from_millis(5));
}

#[test]
fn test_backup_empty_account_stores_only_label_snapshot() {
    let (_dir, store, remote, engine) = setup("a@example.com");
    remote.add_label("a@example.com", "INBOX", "INBOX", LabelType::System);

    let stats = engine.backup(None, &CancelToken::new()).unwrap();
    assert_eq!(stats.remote_messages, 0);
    assert_eq!(stats.payload_writes, 0);

    let links = store.find();
    assert_eq!(links.len(), 1);
    let snapshot = links.iter().next().unwrap();
    assert!(snapshot.id().is_system());
    assert_eq!(snapshot.kind(), RecordKind::Metadata);
}

#[test]
fn test_backup_single_message_then_idempotent_second_pass() {
    let (_dir, store, remote, engine) = setup("a@example.com");
    remote.add_label("a@example.com", "INBOX", "INBOX", LabelType::System);
    remote.add_message(
        "a@example.com",
        "m1",
        b"From: x@y\r\n\r\nhello",
        &["INBOX"],
        1_700_000_000_000,
        "hello",
    );

    let stats = engine.backup(None, &CancelToken::new()).unwrap();
    assert_eq!(stats.remote_messages, 1);
    assert_eq!(stats.payload_writes, 1);
    assert_eq!(stats.metadata_writes, 1);

    // label snapshot + metadata + object
    let links = store.find();
    assert_eq!(links.len(), 3);
    let object = links
        .find(|l| l.id() == &RecordId::item("m1") && l.kind() == RecordKind::Object)
        .unwrap();
    assert!(object.content_hash().is_some());
    assert_eq!(store.get(object).unwrap(), b"From: x@y\r\n\r\nhello");

    next_version_tick();
    let stats = engine.backup(None, &CancelToken::new()).unwrap();
    assert_eq!(stats.payload_writes, 0);
    assert_eq!(stats.metadata_writes, 0);
    assert_eq!(stats.tombstoned, 0);
    assert_eq!(store.find().len(), 3);
}

#[test]
fn test_backup_tombstones_remotely_deleted_items() {
    let (_dir, store, remote, engine) = setup("a@example.com");
    remote.add_message("a@example.com", "m1", b"payload", &[], 1_700_000_000_000, "");
    engine.backup(None, &CancelToken::new()).unwrap();

    remote.remove_message("a@example.com", "m1");
    next_version_tick();
    let stats = engine.backup(None, &CancelToken::new()).unwrap();
    assert_eq!(stats.tombstoned, 1);

    let links = store.find();
    let metadata = links
        .find(|l| l.id() == &RecordId::item("m1") && l.kind() == RecordKind::Metadata)
        .unwrap();
    assert!(metadata.is_deleted());
    let object = links
        .find(|l| l.id() == &RecordId::item("m1") && l.kind() == RecordKind::Object)
        .unwrap();
    assert!(object.is_deleted());

    // history is preserved under the tombstones
    let versions = links
        .iter()
        .filter(|l| l.id() == &RecordId::item("m1"))
        .count();
    assert_eq!(versions, 4);
}

#[test]
fn test_backup_keeps_local_copies_when_any_task_fails() {
    let (_dir, store, remote, engine) = setup("a@example.com");
    remote.add_message("a@example.com", "m1", b"one", &[], 1_700_000_000_000, "");
    remote.add_message("a@example.com", "m2", b"two", &[], 1_700_000_000_000, "");
    engine.backup(None, &CancelToken::new()).unwrap();

    // m2 disappears remotely while m1 starts failing; the failed pass
    // must not tombstone anything
    remote.remove_message("a@example.com", "m2");
    remote.fail_on("m1");
    next_version_tick();
    assert!(engine.backup(None, &CancelToken::new()).is_err());

    let links = store.find();
    let m2 = links
        .find(|l| l.id() == &RecordId::item("m2") && l.kind() == RecordKind::Metadata)
        .unwrap();
    assert!(!m2.is_deleted());

    // once the failure clears, the next pass tombstones m2
    remote.clear_failures();
    next_version_tick();
    let stats = engine.backup(None, &CancelToken::new()).unwrap();
    assert_eq!(stats.tombstoned, 1);
}

#[test]
fn test_quick_sync_narrows_query_and_skips_tombstoning() {
    let (_dir, store, remote, engine) = setup("a@example.com");
    remote.add_message("a@example.com", "m1", b"payload", &[], 1_700_000_000_000, "");
    engine.backup(None, &CancelToken::new()).unwrap();

    remote.remove_message("a@example.com", "m1");
    next_version_tick();
    let stats = engine.backup(Some(3), &CancelToken::new()).unwrap();
    assert_eq!(stats.tombstoned, 0);

    let queries = remote.queries();
    assert_eq!(queries[0], "label:all");
    assert!(queries[1].starts_with("label:all after:"));

    let links = store.find();
    let metadata = links
        .find(|l| l.id() == &RecordId::item("m1") && l.kind() == RecordKind::Metadata)
        .unwrap();
    assert!(!metadata.is_deleted());
}

#[test]
fn test_restore_creates_missing_label_and_remaps() {
    let (_dir, _store, remote, engine) = setup("a@example.com");
    remote.add_label("a@example.com", "INBOX", "INBOX", LabelType::System);
    remote.add_label("a@example.com", "Label_10", "Projects", LabelType::User);
    remote.add_message(
        "a@example.com",
        "m1",
        b"From: x@y\r\n\r\nproject mail",
        &["Label_10", "INBOX"],
        1_700_000_000_000,
        "project mail",
    );
    engine.backup(None, &CancelToken::new()).unwrap();

    remote.add_label("b@example.com", "INBOX", "INBOX", LabelType::System);
    let filter = RestoreFilter::new().with_match_missing(true);
    let stats = engine
        .restore(&filter, Some("b@example.com"), &[], &CancelToken::new())
        .unwrap();
    assert_eq!(stats.candidates, 1);
    assert_eq!(stats.uploaded, 1);

    let created = remote.created_labels();
    assert_eq!(created, vec![("b@example.com".to_string(), "Projects".to_string())]);

    let projects_id = remote
        .list_labels("b@example.com")
        .unwrap()
        .into_iter()
        .find(|l| l.name == "Projects")
        .unwrap()
        .id;

    let inserted = remote.inserted();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].0, "b@example.com");
    assert!(inserted[0].1.label_ids.contains(&projects_id));
    assert!(inserted[0].1.label_ids.contains(&"INBOX".to_string()));
}

#[test]
fn test_restore_missing_uploads_only_absent_items() {
    let (_dir, _store, remote, engine) = setup("a@example.com");
    remote.add_message("a@example.com", "m1", b"gone", &[], 1_700_000_000_000, "");
    remote.add_message("a@example.com", "m2", b"kept", &[], 1_700_000_000_000, "");
    engine.backup(None, &CancelToken::new()).unwrap();

    remote.remove_message("a@example.com", "m1");
    let filter = RestoreFilter::new().with_match_missing(true);
    let stats = engine
        .restore(&filter, None, &[], &CancelToken::new())
        .unwrap();
    assert_eq!(stats.candidates, 1);
    assert_eq!(stats.uploaded, 1);

    let inserted = remote.inserted();
    assert_eq!(inserted.len(), 1);
    assert_eq!(
        vault::remote::decode_base64url(&inserted[0].1.raw).unwrap(),
        b"gone"
    );
}

#[test]
fn test_restore_deleted_round_trips_tombstoned_payload() {
    let (_dir, _store, remote, engine) = setup("a@example.com");
    remote.add_label("a@example.com", "INBOX", "INBOX", LabelType::System);
    remote.add_message(
        "a@example.com",
        "m1",
        b"deleted mail body",
        &["INBOX"],
        1_700_000_000_000,
        "",
    );
    engine.backup(None, &CancelToken::new()).unwrap();

    remote.remove_message("a@example.com", "m1");
    next_version_tick();
    engine.backup(None, &CancelToken::new()).unwrap();

    let filter = RestoreFilter::new().with_match_deleted(true);
    let stats = engine
        .restore(&filter, None, &[], &CancelToken::new())
        .unwrap();
    assert_eq!(stats.uploaded, 1);

    let inserted = remote.inserted();
    assert_eq!(
        vault::remote::decode_base64url(&inserted[0].1.raw).unwrap(),
        b"deleted mail body"
    );
}

#[test]
fn test_restore_skips_chat_messages() {
    let (_dir, _store, remote, engine) = setup("a@example.com");
    remote.add_message(
        "a@example.com",
        "m1",
        b"chat transcript",
        &["CHAT"],
        1_700_000_000_000,
        "",
    );
    engine.backup(None, &CancelToken::new()).unwrap();

    let filter = RestoreFilter::new().with_match_missing(true);
    let stats = engine
        .restore(&filter, Some("b@example.com"), &[], &CancelToken::new())
        .unwrap();
    assert_eq!(stats.skipped_chat, 1);
    assert_eq!(stats.uploaded, 0);
    assert!(remote.inserted().is_empty());
}

#[test]
fn test_restore_add_labels_are_created_once() {
    let (_dir, _store, remote, engine) = setup("a@example.com");
    remote.add_message("a@example.com", "m1", b"one", &[], 1_700_000_000_000, "");
    remote.add_message("a@example.com", "m2", b"two", &[], 1_700_000_000_000, "");
    engine.backup(None, &CancelToken::new()).unwrap();

    let filter = RestoreFilter::new().with_match_missing(true);
    let stats = engine
        .restore(
            &filter,
            Some("b@example.com"),
            &["restored".to_string()],
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(stats.uploaded, 2);

    // both uploads share the one created "restored" label
    assert_eq!(remote.created_labels().len(), 1);
    let restored_id = remote
        .list_labels("b@example.com")
        .unwrap()
        .into_iter()
        .find(|l| l.name == "restored")
        .unwrap()
        .id;
    for (_, message) in remote.inserted() {
        assert!(message.label_ids.contains(&restored_id));
    }
}

#[test]
fn test_restore_with_noop_filter_does_nothing() {
    let (_dir, _store, remote, engine) = setup("a@example.com");
    remote.add_message("a@example.com", "m1", b"x", &[], 1_700_000_000_000, "");
    engine.backup(None, &CancelToken::new()).unwrap();

    let stats = engine
        .restore(&RestoreFilter::new(), None, &[], &CancelToken::new())
        .unwrap();
    assert_eq!(stats.candidates, 0);
    assert!(remote.inserted().is_empty());
}

#[test]
fn test_dry_run_backup_writes_nothing() {
    let (_dir, store, remote, _engine) = setup("a@example.com");
    remote.add_message("a@example.com", "m1", b"payload", &[], 1_700_000_000_000, "");

    let engine = MailboxEngine::new("a@example.com", store.clone(), remote.clone())
        .with_workers(2)
        .with_dry_run(true);
    let stats = engine.backup(None, &CancelToken::new()).unwrap();
    assert_eq!(stats.remote_messages, 1);
    assert_eq!(store.find().len(), 0);
}

#[test]
fn test_dry_run_restore_uploads_nothing() {
    let (_dir, store, remote, engine) = setup("a@example.com");
    remote.add_message("a@example.com", "m1", b"payload", &[], 1_700_000_000_000, "");
    engine.backup(None, &CancelToken::new()).unwrap();

    let engine = MailboxEngine::new("a@example.com", store, remote.clone())
        .with_workers(2)
        .with_dry_run(true);
    let filter = RestoreFilter::new().with_match_missing(true);
    remote.remove_message("a@example.com", "m1");
    let stats = engine.restore(&filter, None, &[], &CancelToken::new()).unwrap();
    assert_eq!(stats.uploaded, 1);
    assert!(remote.inserted().is_empty());
}

#[test]
fn test_cancelled_backup_fails_without_tombstoning() {
    let (_dir, store, remote, engine) = setup("a@example.com");
    remote.add_message("a@example.com", "m1", b"payload", &[], 1_700_000_000_000, "");
    engine.backup(None, &CancelToken::new()).unwrap();

    remote.remove_message("a@example.com", "m1");
    let cancel = CancelToken::new();
    cancel.cancel();
    next_version_tick();
    assert!(engine.backup(None, &cancel).is_err());

    let links = store.find();
    let metadata = links
        .find(|l| l.id() == &RecordId::item("m1") && l.kind() == RecordKind::Metadata)
        .unwrap();
    assert!(!metadata.is_deleted());
}
