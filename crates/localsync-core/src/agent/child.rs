//! Child side of the local transport.
//!
//! The helper connects to its parent, waits for the start parameters, and
//! runs the second half of the session with itself as transport. Messages
//! from the parent arrive as `sendMsg` calls; the reply to the pending call
//! (initially `startSync`) carries the next message back.
//!
//! Whatever happens to the session, the child tries to hand its sync report
//! to the parent before it exits.

use super::environment::ChildEnvironment;
use crate::config::{context_data_dir, normalize_context, ControlConfig, TransportConfig};
use crate::engine::{CredentialProvider, PasswordKey, SessionContext, SessionFactory, SessionSetup};
use crate::error::{LocalSyncError, Result};
use crate::ipc::messages::{
    methods, FreezeParams, Hello, MessageRef, PasswordReply, PasswordRequest, ReportParams,
    StartParams,
};
use crate::ipc::{CallSlot, ControlChannel, IncomingCall, ReplySlot};
use crate::platform::signals::install_child_policy;
use crate::report::{SyncReport, SyncStatus};
use crate::shm::{OutgoingMessage, SharedMessageBuffer};
use crate::suspend::SuspendFlags;
use crate::transport::{Reply, TransportAgent, TransportStatus};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

enum Event {
    Incoming(Option<IncomingCall>),
    ReportAck(Result<serde_json::Value>),
    Tick,
}

fn parent_lost() -> LocalSyncError {
    LocalSyncError::channel_lost("local transport child no longer has a parent, terminating")
}

/// Transport agent of the helper process.
pub struct ChildAgent {
    buffer: Arc<SharedMessageBuffer>,
    channel: ControlChannel,
    incoming: Option<mpsc::UnboundedReceiver<IncomingCall>>,
    flags: SuspendFlags,
    /// INACTIVE until started, ACTIVE after sending and while waiting,
    /// GOT_REPLY with a message to process, FAILED when broken.
    status: TransportStatus,
    content_type: String,
    /// The parent's pending call whose reply carries our next message.
    message_reply: ReplySlot,
    received: Option<MessageRef>,
    setup: Option<SessionSetup>,
    start_failed: bool,
    frozen: bool,
    report: SyncReport,
    report_call: CallSlot,
    report_acked: bool,
}

impl ChildAgent {
    /// Attach to the parent's shared buffer and connect the control channel.
    pub async fn connect(env: &ChildEnvironment) -> Result<Self> {
        let buffer = SharedMessageBuffer::attach_child_side(env.max_message_size, &env.regions)?;
        let (channel, incoming) = ControlChannel::connect(env.control_addr).await?;

        let hello = Hello {
            token: env.token.clone(),
            pid: std::process::id(),
        };
        let call = channel.call(methods::HELLO, &hello)?;
        tokio::time::timeout(ControlConfig::HELLO_TIMEOUT, call)
            .await
            .map_err(|_| LocalSyncError::channel_lost("parent did not answer hello"))??;
        debug!("child connected to parent");

        Ok(Self {
            buffer: Arc::new(buffer),
            channel,
            incoming: Some(incoming),
            flags: SuspendFlags::global().clone(),
            status: TransportStatus::Inactive,
            content_type: String::new(),
            message_reply: ReplySlot::new("message"),
            received: None,
            setup: None,
            start_failed: false,
            frozen: false,
            report: SyncReport::default(),
            report_call: CallSlot::new("sync report"),
            report_acked: false,
        })
    }

    /// Watch `flags` instead of the process-wide suspend flags.
    pub fn with_suspend_flags(mut self, flags: SuspendFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    /// Session setup, known once `startSync` succeeded.
    pub fn setup(&self) -> Option<&SessionSetup> {
        self.setup.as_ref()
    }

    pub fn report(&self) -> &SyncReport {
        &self.report
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Run the child to completion and return the process exit code.
    ///
    /// Waits for the start parameters, runs the session created by
    /// `factory` with this agent as its transport, and delivers the report.
    pub async fn run(mut self, factory: &dyn SessionFactory) -> i32 {
        while self.setup.is_none() && !self.start_failed {
            if !self.flags.is_normal() {
                debug!("aborted, returning while waiting for startSync call from parent");
                return 1;
            }
            if let Err(e) = self.step("waiting for startSync call from parent").await {
                error!("{}", e);
                return 1;
            }
        }

        let Some(setup) = self.setup.clone() else {
            self.deliver_report(true).await;
            return 1;
        };

        if let Err(e) = install_child_policy() {
            warn!("Cannot install signal policy: {}", e);
        }
        info!("target side of local sync ready");

        let started = chrono::Utc::now();
        match self.run_session(factory, &setup).await {
            Ok(mut report) => {
                if report.status == SyncStatus::UNKNOWN {
                    report.status = SyncStatus::OK;
                }
                report.start.get_or_insert(started);
                report.end.get_or_insert_with(chrono::Utc::now);
                self.report = report;
                self.deliver_report(false).await;
                0
            }
            Err(e) => {
                error!("{}", e);
                self.report.record_failure(e.status(), e.to_string());
                self.report.start.get_or_insert(started);
                self.report.end = Some(chrono::Utc::now());
                self.deliver_report(true).await;
                1
            }
        }
    }

    async fn run_session(&mut self, factory: &dyn SessionFactory, setup: &SessionSetup) -> Result<SyncReport> {
        let mut session = factory.create(setup)?;
        let credentials = ParentCredentials::new(self.channel.clone(), self.flags.clone());
        let flags = self.flags.clone();
        let context = SessionContext {
            credentials: &credentials,
            flags: &flags,
        };
        match AssertUnwindSafe(session.run(self, context)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(LocalSyncError::Other(format!(
                "sync session panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    /// Send the report and wait for the acknowledgement.
    ///
    /// After a failure the wait is bounded; otherwise it ends when the parent
    /// acknowledges, goes away, or the user aborts.
    async fn deliver_report(&mut self, after_failure: bool) {
        if self.incoming.is_none() || self.channel.is_closed() {
            debug!("parent gone, sync report not delivered");
            return;
        }
        let text = match self.report.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("Cannot encode sync report: {}", e);
                return;
            }
        };
        debug!(
            "child sending sync report{}:\n{}",
            if after_failure { " after failure" } else { "" },
            text
        );
        match self
            .channel
            .call(methods::STORE_SYNC_REPORT, &ReportParams { report: text })
        {
            Ok(call) => self.report_call.install(call),
            Err(e) => {
                debug!("sync report not delivered: {}", e);
                return;
            }
        }

        if after_failure {
            let wait_once = async {
                while !self.report_acked {
                    if self.step("waiting for parent's ACK for sync report").await.is_err() {
                        break;
                    }
                }
            };
            if tokio::time::timeout(ControlConfig::FAILURE_ACK_WAIT, wait_once)
                .await
                .is_err()
            {
                debug!("no ACK for sync report, giving up");
            }
        } else {
            while !self.report_acked && self.flags.is_normal() {
                if let Err(e) = self.step("waiting for parent's ACK for sync report").await {
                    debug!("{}", e);
                    break;
                }
            }
        }
    }

    /// One loop iteration.
    async fn step(&mut self, what: &str) -> Result<()> {
        debug!("local transport: {}", what);
        if self.incoming.is_none() {
            return Err(parent_lost());
        }
        let event = tokio::select! {
            biased;
            call = next_incoming(&mut self.incoming) => Event::Incoming(call),
            result = self.report_call.response() => Event::ReportAck(result),
            _ = tokio::time::sleep(ControlConfig::LOOP_TICK) => Event::Tick,
        };

        match event {
            Event::Incoming(Some(call)) => self.dispatch(call),
            Event::Incoming(None) => {
                self.incoming = None;
                self.message_reply.take();
                return Err(parent_lost());
            }
            Event::ReportAck(result) => {
                self.report_acked = true;
                match result {
                    Ok(_) => debug!("sending sync report to parent: done"),
                    Err(e) => debug!("sending sync report to parent: {}", e),
                }
            }
            Event::Tick => {}
        }
        Ok(())
    }

    fn dispatch(&mut self, call: IncomingCall) {
        match call.method.as_str() {
            methods::START_SYNC => self.start_sync(call),
            methods::SEND_MSG => self.send_msg(call),
            methods::SET_FREEZE => self.set_freeze(call),
            other => {
                warn!("Parent called unknown method {}", other);
                if let Some(reply) = call.reply {
                    reply.failed(&LocalSyncError::ProtocolViolation(format!(
                        "unknown method {}",
                        other
                    )));
                }
            }
        }
    }

    fn start_sync(&mut self, call: IncomingCall) {
        let Some(reply) = call.reply else { return };
        if self.setup.is_some() || self.start_failed {
            reply.failed(&LocalSyncError::ProtocolViolation(
                "startSync was already called".to_string(),
            ));
            return;
        }
        debug!("startSync called, starting the sync");

        let setup = serde_json::from_value::<StartParams>(call.params)
            .map_err(LocalSyncError::from)
            .and_then(build_setup);
        match setup {
            Ok(setup) => {
                info!(
                    "local sync of {} with {} sources, parent config {}",
                    setup.context,
                    setup.sources.len(),
                    setup.parent_config
                );
                self.message_reply.install(reply, "startSync was called");
                self.setup = Some(setup);
                self.status = TransportStatus::Active;
            }
            Err(e) => {
                error!("{}", e);
                self.report.record_failure(e.status(), e.to_string());
                self.start_failed = true;
                reply.failed(&e);
            }
        }
    }

    fn send_msg(&mut self, call: IncomingCall) {
        let Some(reply) = call.reply else { return };
        self.message_reply.fail("sendMsg was called");
        if self.status != TransportStatus::Active || self.received.is_some() {
            reply.failed(&LocalSyncError::Transport(
                "child not expecting any message".to_string(),
            ));
            return;
        }
        let message: MessageRef = match serde_json::from_value(call.params) {
            Ok(message) => message,
            Err(e) => {
                reply.failed(&e.into());
                return;
            }
        };
        if let Err(e) = self.buffer.view_at(message.offset, message.length) {
            reply.failed(&e);
            return;
        }
        debug!("child got message of {} bytes", message.length);
        self.message_reply.install(reply, "sendMsg was called");
        self.received = Some(message);
    }

    fn set_freeze(&mut self, call: IncomingCall) {
        let Some(reply) = call.reply else { return };
        match serde_json::from_value::<FreezeParams>(call.params) {
            Ok(params) => {
                debug!("local sync child: freeze = {}", params.freeze);
                self.frozen = params.freeze;
                reply.done(&serde_json::json!({}));
            }
            Err(e) => reply.failed(&e.into()),
        }
    }
}

/// Turn the parent's start parameters into the child's session setup.
fn build_setup(params: StartParams) -> Result<SessionSetup> {
    let context = normalize_context(&params.client_context);
    let data_dir = context_data_dir(&params.root, &context);
    let available = configured_sources(&data_dir)?;
    let sources = params
        .sources
        .apply_to_child(&context, &params.parent_config, &available)?;

    // Without a parent log, write the child's log next to where it would be.
    let log_dir = (!params.do_logging).then(|| params.log_dir.join("child"));

    Ok(SessionSetup {
        context,
        parent_config: params.parent_config,
        data_dir,
        sources,
        credentials: params.credentials,
        properties: params.properties,
        log_dir,
    })
}

/// Sources of a context: one subdirectory each.
fn configured_sources(data_dir: &Path) -> Result<BTreeSet<String>> {
    if !data_dir.exists() {
        return Ok(BTreeSet::new());
    }
    let mut sources = BTreeSet::new();
    let entries = std::fs::read_dir(data_dir).map_err(|e| LocalSyncError::io_with_path(e, data_dir))?;
    for entry in entries {
        let entry = entry.map_err(|e| LocalSyncError::io_with_path(e, data_dir))?;
        if entry.path().is_dir() {
            sources.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(sources)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn next_incoming(
    incoming: &mut Option<mpsc::UnboundedReceiver<IncomingCall>>,
) -> Option<IncomingCall> {
    match incoming {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl TransportAgent for ChildAgent {
    fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_string();
    }

    fn allocate_for_send(&mut self, len: usize) -> Result<OutgoingMessage> {
        self.buffer.allocate_for_send(len)
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        debug!("child local transport sending {} bytes", data.len());
        if self.status.is_terminal() {
            return Err(LocalSyncError::Transport(format!(
                "cannot send message: transport is {}",
                self.status
            )));
        }
        let Some(reply) = self.message_reply.take() else {
            self.status = TransportStatus::Failed;
            return Err(LocalSyncError::Transport(
                "cannot send data to parent because parent is not waiting for message".to_string(),
            ));
        };
        let offset = match self.buffer.to_offset(data) {
            Ok(offset) => offset,
            Err(e) => {
                self.status = TransportStatus::Failed;
                reply.failed(&e);
                return Err(e);
            }
        };

        self.received = None;
        self.status = TransportStatus::Active;
        reply.done(&MessageRef {
            content_type: self.content_type.clone(),
            offset,
            length: data.len(),
        });
        Ok(())
    }

    async fn wait(&mut self, no_reply: bool) -> Result<TransportStatus> {
        if self.status == TransportStatus::Active && no_reply {
            self.status = TransportStatus::Inactive;
            return Ok(self.status);
        }

        while self.status == TransportStatus::Active {
            if self.received.is_some() && !self.frozen {
                self.status = TransportStatus::GotReply;
                break;
            }
            self.flags.check_for_abort()?;
            if let Err(e) = self.step("waiting for next message").await {
                self.status = TransportStatus::Failed;
                return Err(e);
            }
        }
        Ok(self.status)
    }

    fn get_reply(&self) -> Result<Reply<'_>> {
        match (&self.received, self.status) {
            (Some(message), TransportStatus::GotReply) => {
                debug!("processing {} bytes in child", message.length);
                Ok(Reply {
                    data: self.buffer.view_at(message.offset, message.length)?,
                    content_type: &message.content_type,
                })
            }
            _ => Err(LocalSyncError::ProtocolViolation(
                "get_reply() called in child when no reply available".to_string(),
            )),
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.status = TransportStatus::Canceled;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        debug!("child local transport shutting down");
        if let Some(reply) = self.message_reply.take() {
            // Unblocks the parent's wait; content is ignored there.
            reply.done(&MessageRef {
                content_type: TransportConfig::SHUTDOWN_CONTENT_TYPE.to_string(),
                offset: 0,
                length: 0,
            });
        }
        if self.status != TransportStatus::Failed {
            self.status = TransportStatus::Closed;
        }
        Ok(())
    }

    fn set_timeout(&mut self, _seconds: u32) {}

    fn status(&self) -> TransportStatus {
        self.status
    }
}

impl std::fmt::Debug for ChildAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildAgent")
            .field("peer", &self.channel.peer_addr())
            .field("status", &self.status)
            .field("frozen", &self.frozen)
            .field("context", &self.setup.as_ref().map(|s| s.context.as_str()))
            .finish()
    }
}

/// Password prompts of the child session, answered by the parent's UI.
#[derive(Debug, Clone)]
pub struct ParentCredentials {
    channel: ControlChannel,
    flags: SuspendFlags,
}

impl ParentCredentials {
    pub fn new(channel: ControlChannel, flags: SuspendFlags) -> Self {
        Self { channel, flags }
    }
}

#[async_trait]
impl CredentialProvider for ParentCredentials {
    async fn ask_password(&self, name: &str, description: &str, key: &PasswordKey) -> Result<String> {
        debug!("local transport child: requesting password {}, {} via parent", name, description);
        let request = PasswordRequest {
            name: name.to_string(),
            description: description.to_string(),
            key: key.clone(),
        };
        let mut call = self.channel.call(methods::ASK_PASSWORD, &request)?;
        loop {
            tokio::select! {
                result = &mut call => {
                    let reply: PasswordReply = serde_json::from_value(result?)?;
                    return Ok(reply.password);
                }
                _ = tokio::time::sleep(ControlConfig::LOOP_TICK) => {
                    self.flags.check_for_abort()?;
                }
            }
        }
    }
}
