//! End-to-end tests: a parent agent driving the real helper binary.

#![cfg(unix)]

use async_trait::async_trait;
use localsync_core::{
    CredentialProvider, LocalSyncError, ParentAgent, ParentConfig, PasswordKey, SourceConfig,
    SuspendFlags, SyncMode, SyncStatus, TransportAgent, TransportConfig, TransportStatus,
};
use localsync_helper::{
    ItemBatch, SourceChanges, ITEMS_CONTENT_TYPE, PASSWORD_PROMPT_PROPERTY, SESSION_LOG_FILE,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const HELPER: &str = env!("CARGO_BIN_EXE_localsync-helper");

/// Root with a `@backup` context holding an `addressbook` source.
fn fixture(items: &[(&str, &str)]) -> (TempDir, PathBuf) {
    let root = TempDir::new().unwrap();
    let addressbook = root.path().join("backup").join("addressbook");
    std::fs::create_dir_all(&addressbook).unwrap();
    for (id, content) in items {
        std::fs::write(addressbook.join(id), content).unwrap();
    }
    (root, addressbook)
}

fn config(root: &Path, mode: SyncMode) -> ParentConfig {
    ParentConfig::new("server", "@backup", root)
        .with_source(SourceConfig::new("contacts", "addressbook", mode))
        .with_max_message_size(1024)
        .with_helper(HELPER)
}

async fn next_reply(agent: &mut ParentAgent) -> (String, Vec<u8>) {
    assert_eq!(agent.wait(false).await.unwrap(), TransportStatus::GotReply);
    let reply = agent.get_reply().unwrap();
    (reply.content_type.to_string(), reply.data.to_vec())
}

async fn exchange(agent: &mut ParentAgent, content_type: &str, data: &[u8]) -> (String, Vec<u8>) {
    let mut message = agent.allocate_for_send(data.len()).unwrap();
    message.copy_from_slice(data);
    agent.set_content_type(content_type);
    agent.send(&message).await.unwrap();
    let reply = next_reply(agent).await;
    drop(message);
    reply
}

async fn first_batch(agent: &mut ParentAgent) -> ItemBatch {
    let (content_type, data) = next_reply(agent).await;
    assert_eq!(content_type, ITEMS_CONTENT_TYPE);
    ItemBatch::from_bytes(&data).unwrap()
}

async fn finish(agent: &mut ParentAgent, changes: SourceChanges) {
    let batch = ItemBatch {
        is_final: true,
        sources: BTreeMap::from([("contacts".to_string(), changes)]),
    };
    let (content_type, _) = exchange(agent, ITEMS_CONTENT_TYPE, &batch.to_bytes().unwrap()).await;
    assert_eq!(content_type, TransportConfig::SHUTDOWN_CONTENT_TYPE);
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hello_ping_with_empty_source() {
    let (root, _) = fixture(&[]);
    let mut agent = ParentAgent::new(config(root.path(), SyncMode::RefreshFromRemote)).unwrap();
    agent.start().await.unwrap();

    let first = first_batch(&mut agent).await;
    assert!(first.sources["contacts"].items.is_empty());

    let (content_type, echo) = exchange(&mut agent, "text/plain", b"HELLO-PING").await;
    assert_eq!(content_type, "text/plain");
    assert_eq!(echo, b"HELLO-PING");

    finish(&mut agent, SourceChanges::default()).await;

    // Shutdown returns only after the child is gone.
    assert!(agent.child_exit().unwrap().success());
    assert_eq!(agent.status(), TransportStatus::Closed);
    let report = agent.last_report();
    assert_eq!(report.status, SyncStatus::OK);
    assert_eq!(report.total_changes(), 0);

    // Parent does not log, so the child writes next to the parent's logs.
    assert!(root.path().join("logs").join("child").join(SESSION_LOG_FILE).exists());
}

#[tokio::test]
async fn test_two_way_round_trip() {
    let (root, addressbook) = fixture(&[("john", "John Doe"), ("jane", "Jane Doe")]);
    let mut agent = ParentAgent::new(config(root.path(), SyncMode::TwoWay)).unwrap();
    agent.start().await.unwrap();

    let first = first_batch(&mut agent).await;
    let items = &first.sources["contacts"].items;
    assert_eq!(items.len(), 2);
    assert_eq!(items["john"], "John Doe");

    finish(
        &mut agent,
        SourceChanges {
            items: BTreeMap::from([("bob".to_string(), "Bob".to_string())]),
            removed: vec!["jane".to_string()],
        },
    )
    .await;

    assert_eq!(std::fs::read_to_string(addressbook.join("bob")).unwrap(), "Bob");
    assert!(addressbook.join("john").exists());
    assert!(!addressbook.join("jane").exists());

    let report = agent.last_report();
    assert!(report.is_success());
    let source = &report.sources["addressbook"];
    assert_eq!(source.mode, SyncMode::TwoWay);
    assert_eq!((source.local.added, source.local.removed), (1, 1));
    assert_eq!(source.remote.added, 2);
}

#[tokio::test]
async fn test_directions_are_inverted_in_child() {
    let (root, addressbook) = fixture(&[("stale", "Stale")]);
    let mut agent = ParentAgent::new(config(root.path(), SyncMode::RefreshFromLocal)).unwrap();
    agent.start().await.unwrap();

    // Child refreshes from remote: it sends nothing.
    let first = first_batch(&mut agent).await;
    assert!(first.sources.is_empty());

    finish(
        &mut agent,
        SourceChanges {
            items: BTreeMap::from([("fresh".to_string(), "Fresh".to_string())]),
            removed: Vec::new(),
        },
    )
    .await;

    assert!(!addressbook.join("stale").exists());
    assert!(addressbook.join("fresh").exists());
    let source = &agent.last_report().sources["addressbook"];
    assert_eq!(source.mode, SyncMode::RefreshFromRemote);
}

#[tokio::test]
async fn test_unknown_target_is_reported() {
    let (root, _) = fixture(&[]);
    let config = ParentConfig::new("server", "@backup", root.path())
        .with_source(SourceConfig::new("calendar", "calendar", SyncMode::TwoWay))
        .with_helper(HELPER);
    let mut agent = ParentAgent::new(config).unwrap();
    agent.start().await.unwrap();

    let result = agent.wait(false).await;
    assert!(matches!(result, Ok(TransportStatus::Failed) | Err(_)));
    agent.shutdown().await.unwrap();

    // Report arrives before the child exits.
    let report = agent.last_report();
    assert!(!report.is_success());
    assert!(report
        .error
        .as_deref()
        .unwrap()
        .contains("@backup/calendar: source not configured"));
    assert!(!agent.child_exit().unwrap().success());
}

#[tokio::test]
async fn test_child_death_fails_wait() {
    let (root, _) = fixture(&[]);
    let mut agent = ParentAgent::new(config(root.path(), SyncMode::TwoWay)).unwrap();
    agent.start().await.unwrap();
    first_batch(&mut agent).await;

    let pid = agent.child_pid().unwrap();
    localsync_core::platform::terminate_process(pid).unwrap();

    let mut message = agent.allocate_for_send(4).unwrap();
    message.copy_from_slice(b"PING");
    agent.set_content_type("text/plain");
    if agent.send(&message).await.is_ok() {
        // Either the connection or the exit is noticed first.
        match agent.wait(false).await {
            Ok(status) => assert_eq!(status, TransportStatus::Failed),
            Err(e) => assert!(e.to_string().contains("child process quit")),
        }
    }
    assert_eq!(agent.status(), TransportStatus::Failed);

    agent.shutdown().await.unwrap();
    assert!(!agent.child_exit().unwrap().success());
    assert_eq!(agent.status(), TransportStatus::Failed);
}

#[tokio::test]
async fn test_abort_cancels_running_child() {
    let (root, _) = fixture(&[]);
    let flags = SuspendFlags::new();
    let mut agent = ParentAgent::new(config(root.path(), SyncMode::TwoWay))
        .unwrap()
        .with_suspend_flags(flags.clone());
    agent.start().await.unwrap();

    flags.abort();
    assert!(matches!(agent.wait(false).await, Err(LocalSyncError::Aborted)));
    assert_eq!(agent.status(), TransportStatus::Canceled);

    agent.shutdown().await.unwrap();
    assert!(agent.child_exit().is_some());
    assert_eq!(agent.status(), TransportStatus::Canceled);
}

struct FixedPassword(&'static str);

#[async_trait]
impl CredentialProvider for FixedPassword {
    async fn ask_password(&self, _name: &str, _description: &str, _key: &PasswordKey) -> localsync_core::Result<String> {
        Ok(self.0.to_string())
    }
}

#[tokio::test]
async fn test_password_request_reaches_parent_ui() {
    let (root, _) = fixture(&[]);
    let config = config(root.path(), SyncMode::TwoWay).with_property(PASSWORD_PROMPT_PROPERTY, "addressbook");
    let mut agent = ParentAgent::new(config)
        .unwrap()
        .with_credential_provider(Arc::new(FixedPassword("secret")));
    agent.start().await.unwrap();

    first_batch(&mut agent).await;
    finish(&mut agent, SourceChanges::default()).await;
    assert!(agent.last_report().is_success());
}

#[tokio::test]
async fn test_password_request_without_ui_fails_child() {
    let (root, _) = fixture(&[]);
    let config = config(root.path(), SyncMode::TwoWay).with_property(PASSWORD_PROMPT_PROPERTY, "addressbook");
    let mut agent = ParentAgent::new(config).unwrap();
    agent.start().await.unwrap();

    let result = agent.wait(false).await;
    assert!(matches!(result, Ok(TransportStatus::Failed) | Err(_)));
    agent.shutdown().await.unwrap();

    let report = agent.last_report();
    assert!(!report.is_success());
    assert!(report.error.as_deref().unwrap().contains("not connected to UI"));
}
