//! Reference item exchange, run by the helper against its own context.
//!
//! The child answers the parent's `startSync` with its local items, then
//! applies each batch the parent sends. A final batch ends the session.
//! Messages of any other content type are echoed back unchanged.

use crate::source::{revision, DirectorySource};
use localsync_core::{
    ChildSource, DataSource, LocalSyncError, Result, SessionContext, SessionFactory, SessionSetup,
    SourceReport, SyncMode, SyncReport, SyncSession, SyncStatus, TransportAgent, TransportStatus,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Content type of [`ItemBatch`] messages.
pub const ITEMS_CONTENT_TYPE: &str = "application/vnd.localsync.items+json";

/// Session property naming a password to request from the parent's UI.
pub const PASSWORD_PROMPT_PROPERTY: &str = "password-prompt";

/// File written to the child log directory at the end of a session.
pub const SESSION_LOG_FILE: &str = "sync-report.json";

/// Items of one source in a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceChanges {
    /// Item id → content.
    #[serde(default)]
    pub items: BTreeMap<String, String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

/// One message of the item exchange, keyed by the receiver's remote name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemBatch {
    #[serde(rename = "final", default)]
    pub is_final: bool,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceChanges>,
}

impl SourceChanges {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.removed.is_empty()
    }
}

impl ItemBatch {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn item_count(&self) -> usize {
        self.sources.values().map(|changes| changes.items.len()).sum()
    }
}

struct ActiveSource {
    config: ChildSource,
    store: Box<dyn DataSource>,
    report: SourceReport,
    wiped: bool,
}

/// Child half of the reference session.
pub struct ItemExchangeSession {
    sources: Vec<ActiveSource>,
    password_prompt: Option<String>,
    log_dir: Option<PathBuf>,
}

impl ItemExchangeSession {
    /// One [`DirectorySource`] per configured source below the context's data directory.
    pub fn new(setup: &SessionSetup) -> Self {
        let sources = setup
            .sources
            .iter()
            .map(|source| {
                let store: Box<dyn DataSource> =
                    Box::new(DirectorySource::new(setup.data_dir.join(&source.name)));
                (source.clone(), store)
            })
            .collect();
        let mut session = Self::with_sources(sources);
        session.password_prompt = setup.properties.get(PASSWORD_PROMPT_PROPERTY).cloned();
        session.log_dir = setup.log_dir.clone();
        session
    }

    pub fn with_sources(sources: Vec<(ChildSource, Box<dyn DataSource>)>) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|(config, store)| ActiveSource {
                    report: SourceReport::new(config.mode),
                    config,
                    store,
                    wiped: false,
                })
                .collect(),
            password_prompt: None,
            log_dir: None,
        }
    }

    /// Local items of every source that sends data.
    fn local_changes(&mut self) -> Result<ItemBatch> {
        let mut batch = ItemBatch::default();
        for source in self.sources.iter_mut().filter(|s| s.config.mode.sends_local_data()) {
            let mut changes = SourceChanges::default();
            for id in source.store.enumerate()?.into_keys() {
                let data = source.store.read(&id)?;
                changes
                    .items
                    .insert(id, String::from_utf8_lossy(&data).into_owned());
            }
            source.report.remote.added += changes.items.len() as u64;
            batch.sources.insert(source.config.remote.clone(), changes);
        }
        Ok(batch)
    }

    fn apply(&mut self, batch: &ItemBatch) -> Result<()> {
        for source in self.sources.iter_mut() {
            if source.config.mode == SyncMode::RefreshFromRemote && !source.wiped {
                for id in source.store.enumerate()?.into_keys() {
                    source.store.remove(&id)?;
                    source.report.local.removed += 1;
                }
                source.wiped = true;
                debug!("{}: removed all local items for refresh", source.config.name);
            }
        }

        for (remote, changes) in &batch.sources {
            let Some(source) = self.sources.iter_mut().find(|s| &s.config.remote == remote) else {
                return Err(LocalSyncError::ProtocolViolation(format!(
                    "items for unknown source {}",
                    remote
                )));
            };
            if !source.config.mode.receives_remote_data() {
                if changes.is_empty() {
                    continue;
                }
                warn!(
                    "{}: ignoring {} items, mode {} does not accept data",
                    source.config.name,
                    changes.items.len(),
                    source.config.mode
                );
                continue;
            }

            let existing = source.store.enumerate()?;
            for (id, content) in &changes.items {
                match existing.get(id) {
                    Some(current) if *current == revision(content.as_bytes()) => {}
                    Some(_) => {
                        source.store.write(Some(id), content.as_bytes())?;
                        source.report.local.updated += 1;
                    }
                    None => {
                        source.store.write(Some(id), content.as_bytes())?;
                        source.report.local.added += 1;
                    }
                }
            }
            for id in &changes.removed {
                if existing.contains_key(id) {
                    source.store.remove(id)?;
                    source.report.local.removed += 1;
                }
            }
        }
        Ok(())
    }

    fn report(&self) -> SyncReport {
        SyncReport {
            status: SyncStatus::OK,
            sources: self
                .sources
                .iter()
                .map(|source| (source.config.name.clone(), source.report.clone()))
                .collect(),
            ..Default::default()
        }
    }
}

async fn send_message(transport: &mut dyn TransportAgent, content_type: &str, data: &[u8]) -> Result<()> {
    let mut message = transport.allocate_for_send(data.len())?;
    message.copy_from_slice(data);
    transport.set_content_type(content_type);
    transport.send(&message).await
}

async fn send_batch(transport: &mut dyn TransportAgent, batch: &ItemBatch) -> Result<()> {
    send_message(transport, ITEMS_CONTENT_TYPE, &batch.to_bytes()?).await
}

fn write_session_log(dir: &Path, report: &SyncReport) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| LocalSyncError::io_with_path(e, dir))?;
    let path = dir.join(SESSION_LOG_FILE);
    std::fs::write(&path, report.to_text()?).map_err(|e| LocalSyncError::io_with_path(e, path))
}

#[async_trait]
impl SyncSession for ItemExchangeSession {
    async fn run(
        &mut self,
        transport: &mut dyn TransportAgent,
        context: SessionContext<'_>,
    ) -> Result<SyncReport> {
        if let Some(name) = self.password_prompt.clone() {
            let description = format!("password for {}", name);
            context
                .credentials
                .ask_password(&name, &description, &Default::default())
                .await?;
            debug!("got password {} from parent", name);
        }

        for source in self.sources.iter_mut() {
            source.store.open()?;
        }

        let first = self.local_changes()?;
        info!(
            "sending {} local items of {} sources",
            first.item_count(),
            first.sources.len()
        );
        send_batch(transport, &first).await?;

        loop {
            context.flags.check_for_abort()?;
            let status = transport.wait(false).await?;
            if status != TransportStatus::GotReply {
                return Err(LocalSyncError::Transport(format!(
                    "message exchange ended while {}",
                    status
                )));
            }
            let (content_type, data) = {
                let reply = transport.get_reply()?;
                (reply.content_type.to_string(), reply.data.to_vec())
            };

            if content_type != ITEMS_CONTENT_TYPE {
                debug!("echoing {} bytes of {}", data.len(), content_type);
                send_message(transport, &content_type, &data).await?;
                continue;
            }

            let batch = ItemBatch::from_bytes(&data)?;
            debug!("received {} items, final = {}", batch.item_count(), batch.is_final);
            self.apply(&batch)?;
            if batch.is_final {
                break;
            }
            send_batch(transport, &ItemBatch::default()).await?;
        }

        for source in self.sources.iter_mut() {
            source.store.close()?;
        }
        transport.shutdown().await?;

        let report = self.report();
        if let Some(dir) = &self.log_dir {
            if let Err(e) = write_session_log(dir, &report) {
                warn!("Cannot write session log: {}", e);
            }
        }
        info!("item exchange done, {} local changes", report.total_changes());
        Ok(report)
    }
}

/// Creates an [`ItemExchangeSession`] for each start request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemExchangeFactory;

impl SessionFactory for ItemExchangeFactory {
    fn create(&self, setup: &SessionSetup) -> Result<Box<dyn SyncSession>> {
        Ok(Box::new(ItemExchangeSession::new(setup)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localsync_core::{CredentialProvider, PasswordKey, Reply, SuspendFlags};
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Plays the parent: hands out queued messages and records what was sent.
    #[derive(Default)]
    struct ScriptedTransport {
        content_type: String,
        incoming: VecDeque<(String, Vec<u8>)>,
        current: Option<(String, Vec<u8>)>,
        sent: Vec<(String, Vec<u8>)>,
        status: TransportStatus,
    }

    impl ScriptedTransport {
        fn push_batch(&mut self, batch: ItemBatch) {
            self.incoming
                .push_back((ITEMS_CONTENT_TYPE.to_string(), batch.to_bytes().unwrap()));
        }

        fn sent_batch(&self, index: usize) -> ItemBatch {
            ItemBatch::from_bytes(&self.sent[index].1).unwrap()
        }
    }

    #[async_trait]
    impl TransportAgent for ScriptedTransport {
        fn set_content_type(&mut self, content_type: &str) {
            self.content_type = content_type.to_string();
        }

        async fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent.push((self.content_type.clone(), data.to_vec()));
            self.status = TransportStatus::Active;
            Ok(())
        }

        async fn wait(&mut self, _no_reply: bool) -> Result<TransportStatus> {
            self.current = self.incoming.pop_front();
            self.status = if self.current.is_some() {
                TransportStatus::GotReply
            } else {
                TransportStatus::Failed
            };
            Ok(self.status)
        }

        fn get_reply(&self) -> Result<Reply<'_>> {
            let (content_type, data) = self
                .current
                .as_ref()
                .ok_or_else(|| LocalSyncError::ProtocolViolation("no reply".to_string()))?;
            Ok(Reply { data, content_type })
        }

        async fn cancel(&mut self) -> Result<()> {
            self.status = TransportStatus::Canceled;
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.status = TransportStatus::Closed;
            Ok(())
        }

        fn set_timeout(&mut self, _seconds: u32) {}

        fn status(&self) -> TransportStatus {
            self.status
        }
    }

    struct NoCredentials;

    #[async_trait]
    impl CredentialProvider for NoCredentials {
        async fn ask_password(&self, _: &str, _: &str, _: &PasswordKey) -> Result<String> {
            Err(LocalSyncError::Other("no UI".to_string()))
        }
    }

    fn session(dir: &TempDir, mode: SyncMode, items: &[(&str, &str)]) -> ItemExchangeSession {
        let path = dir.path().join("addressbook");
        std::fs::create_dir_all(&path).unwrap();
        for (id, content) in items {
            std::fs::write(path.join(id), content).unwrap();
        }
        let source = ChildSource {
            name: "addressbook".to_string(),
            remote: "contacts".to_string(),
            mode,
        };
        ItemExchangeSession::with_sources(vec![(source, Box::new(DirectorySource::new(path)))])
    }

    fn final_batch(items: &[(&str, &str)], removed: &[&str]) -> ItemBatch {
        let changes = SourceChanges {
            items: items
                .iter()
                .map(|(id, content)| (id.to_string(), content.to_string()))
                .collect(),
            removed: removed.iter().map(|id| id.to_string()).collect(),
        };
        ItemBatch {
            is_final: true,
            sources: BTreeMap::from([("contacts".to_string(), changes)]),
        }
    }

    async fn run(session: &mut ItemExchangeSession, transport: &mut ScriptedTransport) -> Result<SyncReport> {
        let flags = SuspendFlags::new();
        let context = SessionContext {
            credentials: &NoCredentials,
            flags: &flags,
        };
        session.run(transport, context).await
    }

    #[tokio::test]
    async fn test_refresh_from_local_sends_all_items() {
        let dir = TempDir::new().unwrap();
        let mut session = session(&dir, SyncMode::RefreshFromLocal, &[("john", "John"), ("jane", "Jane")]);
        let mut transport = ScriptedTransport::default();
        transport.push_batch(final_batch(&[], &[]));

        let report = run(&mut session, &mut transport).await.unwrap();

        let first = transport.sent_batch(0);
        assert_eq!(transport.sent[0].0, ITEMS_CONTENT_TYPE);
        assert_eq!(first.sources["contacts"].items["john"], "John");
        assert_eq!(first.item_count(), 2);
        assert_eq!(report.status, SyncStatus::OK);
        assert_eq!(report.sources["addressbook"].remote.added, 2);
        assert_eq!(transport.status, TransportStatus::Closed);
    }

    #[tokio::test]
    async fn test_refresh_from_remote_replaces_local_items() {
        let dir = TempDir::new().unwrap();
        let mut session = session(&dir, SyncMode::RefreshFromRemote, &[("old", "Old")]);
        let mut transport = ScriptedTransport::default();
        transport.push_batch(final_batch(&[("new", "New")], &[]));

        let report = run(&mut session, &mut transport).await.unwrap();

        assert!(transport.sent_batch(0).sources.is_empty());
        let path = dir.path().join("addressbook");
        assert!(!path.join("old").exists());
        assert_eq!(std::fs::read_to_string(path.join("new")).unwrap(), "New");
        let counts = report.sources["addressbook"].local;
        assert_eq!((counts.added, counts.updated, counts.removed), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_two_way_updates_and_removes() {
        let dir = TempDir::new().unwrap();
        let mut session = session(
            &dir,
            SyncMode::TwoWay,
            &[("same", "Same"), ("changed", "Before"), ("gone", "Gone")],
        );
        let mut transport = ScriptedTransport::default();
        transport.push_batch(ItemBatch::default());
        transport.push_batch(final_batch(&[("same", "Same"), ("changed", "After")], &["gone"]));

        let report = run(&mut session, &mut transport).await.unwrap();

        // Non-final batch is acknowledged with an empty one.
        assert_eq!(transport.sent.len(), 2);
        assert_eq!(transport.sent_batch(1), ItemBatch::default());
        let counts = report.sources["addressbook"].local;
        assert_eq!((counts.added, counts.updated, counts.removed), (0, 1, 1));
        assert_eq!(report.total_changes(), 3 + 2);
    }

    #[tokio::test]
    async fn test_other_content_is_echoed() {
        let dir = TempDir::new().unwrap();
        let mut session = session(&dir, SyncMode::RefreshFromLocal, &[]);
        let mut transport = ScriptedTransport::default();
        transport
            .incoming
            .push_back(("text/plain".to_string(), b"HELLO-PING".to_vec()));
        transport.push_batch(final_batch(&[], &[]));

        run(&mut session, &mut transport).await.unwrap();

        assert_eq!(transport.sent[1], ("text/plain".to_string(), b"HELLO-PING".to_vec()));
    }

    #[tokio::test]
    async fn test_unknown_source_is_protocol_violation() {
        let dir = TempDir::new().unwrap();
        let mut session = session(&dir, SyncMode::TwoWay, &[]);
        let mut transport = ScriptedTransport::default();
        let mut batch = final_batch(&[], &[]);
        batch.sources = BTreeMap::from([("calendar".to_string(), SourceChanges::default())]);
        transport.push_batch(batch);

        let err = run(&mut session, &mut transport).await.unwrap_err();
        assert!(matches!(err, LocalSyncError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_lost_peer_fails_session() {
        let dir = TempDir::new().unwrap();
        let mut session = session(&dir, SyncMode::TwoWay, &[]);
        let mut transport = ScriptedTransport::default();
        assert!(run(&mut session, &mut transport).await.is_err());
    }

    #[tokio::test]
    async fn test_password_prompt_failure_fails_session() {
        let dir = TempDir::new().unwrap();
        let mut session = session(&dir, SyncMode::TwoWay, &[]);
        session.password_prompt = Some("addressbook".to_string());
        let mut transport = ScriptedTransport::default();
        let err = run(&mut session, &mut transport).await.unwrap_err();
        assert!(err.to_string().contains("no UI"));
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn test_batch_wire_names() {
        let json = String::from_utf8(final_batch(&[("a", "A")], &["b"]).to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"final\":true"));
        assert!(json.contains("\"removed\":[\"b\"]"));
    }
}
