//! Parent side of the local transport.
//!
//! The parent spawns the helper, hands it the start parameters once it has
//! connected, and from then on acts as a transport agent for the local sync
//! engine. Every message the engine sends is placed in the shared buffer and
//! announced with a `sendMsg` call; the child's answer to that call is the
//! next reply.
//!
//! The helper's exit is authoritative. After it, the control channel is
//! dropped and the agent stays in a terminal state.

use super::environment::ChildEnvironment;
use crate::config::{ControlConfig, ParentConfig};
use crate::engine::CredentialProvider;
use crate::error::{LocalSyncError, Result};
use crate::ipc::messages::{
    methods, FreezeParams, Hello, LogOutput, MessageRef, PasswordReply, PasswordRequest,
    ReportParams, StartParams,
};
use crate::ipc::{CallSlot, ControlChannel, IncomingCall};
use crate::platform::process::{spawn_child, ChildExit, ChildProcess};
use crate::report::SyncReport;
use crate::shm::{OutgoingMessage, SharedMessageBuffer};
use crate::sources::ActiveSourceMap;
use crate::suspend::{SuspendFlags, SuspendState};
use crate::transport::{Reply, TransportAgent, TransportStatus};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What woke up one loop iteration.
enum Event {
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Incoming(Option<IncomingCall>),
    Reply(Result<serde_json::Value>),
    ChildExited(ChildExit),
    Tick,
}

/// Transport agent that runs the peer session in a helper process.
pub struct ParentAgent {
    config: ParentConfig,
    /// Normalized client context, known after `start`.
    client_context: String,
    buffer: Arc<SharedMessageBuffer>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    flags: SuspendFlags,
    status: TransportStatus,
    content_type: String,
    started: bool,
    token: String,
    listener: Option<TcpListener>,
    child: Option<ChildProcess>,
    child_exit: Option<ChildExit>,
    channel: Option<ControlChannel>,
    incoming: Option<mpsc::UnboundedReceiver<IncomingCall>>,
    /// Outstanding `startSync` or `sendMsg`; its result is the next reply.
    message_call: CallSlot,
    reply: Option<MessageRef>,
    report: SyncReport,
    freeze_relayed: bool,
}

impl ParentAgent {
    /// Create the agent and its shared buffer. Nothing is spawned yet.
    pub fn new(config: ParentConfig) -> Result<Self> {
        let buffer = SharedMessageBuffer::create_parent_side(config.max_message_size)?;
        Ok(Self {
            config,
            client_context: String::new(),
            buffer: Arc::new(buffer),
            credentials: None,
            flags: SuspendFlags::global().clone(),
            status: TransportStatus::Inactive,
            content_type: String::new(),
            started: false,
            token: uuid::Uuid::new_v4().to_string(),
            listener: None,
            child: None,
            child_exit: None,
            channel: None,
            incoming: None,
            message_call: CallSlot::new("message"),
            reply: None,
            report: SyncReport::default(),
            freeze_relayed: false,
        })
    }

    /// Answer password requests of the child with `provider`.
    pub fn with_credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Watch `flags` instead of the process-wide suspend flags.
    pub fn with_suspend_flags(mut self, flags: SuspendFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Spawn the helper.
    ///
    /// The helper connects back on its own; its first message arrives as the
    /// reply to the start parameters, so the engine calls `wait` next.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(LocalSyncError::Transport(
                "local transport already started".to_string(),
            ));
        }
        self.client_context = self.config.validate_client_context()?;
        self.buffer.reset()?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let environment = ChildEnvironment {
            control_addr: listener.local_addr()?,
            token: self.token.clone(),
            max_message_size: self.config.max_message_size,
            regions: self.buffer.handles().clone(),
        };
        let mut env = self.config.env_vars.clone();
        env.extend(environment.to_env_vars());

        info!(
            "Starting local sync of {} with {} via {}",
            self.config.config_name,
            self.client_context,
            self.config.helper.display()
        );
        self.started = true;
        let child = match spawn_child(&self.config.helper, &[], &env) {
            Ok(child) => child,
            Err(e) => {
                self.status = TransportStatus::Failed;
                return Err(e);
            }
        };

        self.listener = Some(listener);
        self.child = Some(child);
        self.status = TransportStatus::Active;
        Ok(())
    }

    /// The last sync report received from the child.
    pub fn last_report(&self) -> &SyncReport {
        &self.report
    }

    pub fn client_context(&self) -> &str {
        &self.client_context
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().map(|child| child.pid())
    }

    pub fn child_exit(&self) -> Option<ChildExit> {
        self.child_exit
    }

    /// Ask the child to stop (or resume) handing messages to its engine.
    pub fn set_freeze(&mut self, freeze: bool) -> Result<()> {
        let channel = self.channel.as_ref().ok_or_else(|| {
            LocalSyncError::Transport("child process is not connected".to_string())
        })?;
        let call = channel.call(methods::SET_FREEZE, &FreezeParams { freeze })?;
        tokio::spawn(async move {
            if let Err(e) = call.await {
                debug!("setFreeze({}) failed: {}", freeze, e);
            }
        });
        Ok(())
    }

    /// One loop iteration: wait for the next event and handle it.
    async fn step(&mut self, what: &str) -> Result<()> {
        debug!("local transport parent: {}", what);
        let event = tokio::select! {
            biased;
            call = next_incoming(&mut self.incoming) => Event::Incoming(call),
            result = self.message_call.response() => Event::Reply(result),
            accepted = accept(self.listener.as_ref()) => Event::Accepted(accepted),
            exit = child_exited(self.child.as_ref()), if self.child_exit.is_none() => Event::ChildExited(exit),
            _ = tokio::time::sleep(ControlConfig::LOOP_TICK) => Event::Tick,
        };

        match event {
            Event::Accepted(Ok((stream, peer))) => {
                if let Err(e) = self.accept_child(stream).await {
                    warn!("Rejected control connection from {}: {}", peer, e);
                }
            }
            Event::Accepted(Err(e)) => {
                error!("Control listener accept error: {}", e);
            }
            Event::Incoming(Some(call)) => self.dispatch(call),
            Event::Incoming(None) => {
                debug!("Control channel to child closed");
                self.incoming = None;
            }
            Event::Reply(result) => self.store_reply(result),
            Event::ChildExited(exit) => self.on_child_quit(exit).await,
            Event::Tick => {}
        }
        Ok(())
    }

    /// Verify the hello frame and send the start parameters.
    async fn accept_child(&mut self, stream: TcpStream) -> Result<()> {
        let (channel, mut incoming) = ControlChannel::from_stream(stream)?;
        let first = tokio::time::timeout(ControlConfig::HELLO_TIMEOUT, incoming.recv())
            .await
            .map_err(|_| LocalSyncError::channel_lost("no hello from child"))?
            .ok_or_else(|| LocalSyncError::channel_lost("child closed before hello"))?;

        let Some(reply) = first.reply else {
            return Err(LocalSyncError::ProtocolViolation(format!(
                "expected hello call, got {} notification",
                first.method
            )));
        };
        if first.method != methods::HELLO {
            let err = LocalSyncError::ProtocolViolation(format!(
                "expected hello, got {}",
                first.method
            ));
            reply.failed(&err);
            return Err(err);
        }
        let hello: Hello = match serde_json::from_value(first.params) {
            Ok(hello) => hello,
            Err(e) => {
                let err = LocalSyncError::from(e);
                reply.failed(&err);
                return Err(err);
            }
        };
        if hello.token != self.token {
            let err = LocalSyncError::Validation {
                field: "token".to_string(),
                message: "unknown connection token".to_string(),
            };
            reply.failed(&err);
            return Err(err);
        }
        reply.done(&serde_json::json!({}));

        debug!("Child PID {} connected", hello.pid);
        self.listener = None;
        self.incoming = Some(incoming);
        self.channel = Some(channel);
        self.on_child_connect()
    }

    fn on_child_connect(&mut self) -> Result<()> {
        let params = StartParams {
            client_context: self.client_context.clone(),
            parent_config: self.config.config_name.clone(),
            root: self.config.root.clone(),
            log_dir: self.config.log_dir.clone(),
            do_logging: self.config.do_logging,
            credentials: self.config.credentials.clone(),
            properties: self.config.properties.clone(),
            sources: ActiveSourceMap::from_sources(&self.config.sources),
        };
        debug!(
            "Sending start parameters for {} sources to child",
            params.sources.len()
        );
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| LocalSyncError::channel_lost("child not connected"))?;
        let call = channel.call(methods::START_SYNC, &params)?;
        self.message_call.install(call);
        Ok(())
    }

    fn dispatch(&mut self, call: IncomingCall) {
        match call.method.as_str() {
            methods::ASK_PASSWORD => self.ask_password(call),
            methods::STORE_SYNC_REPORT => self.store_sync_report(call),
            methods::LOG_OUTPUT => self.log_output(&call),
            other => {
                warn!("Child called unknown method {}", other);
                if let Some(reply) = call.reply {
                    reply.failed(&LocalSyncError::ProtocolViolation(format!(
                        "unknown method {}",
                        other
                    )));
                }
            }
        }
    }

    fn ask_password(&self, call: IncomingCall) {
        let Some(reply) = call.reply else { return };
        let request: PasswordRequest = match serde_json::from_value(call.params) {
            Ok(request) => request,
            Err(e) => {
                reply.failed(&e.into());
                return;
            }
        };
        debug!(
            "local sync parent: asked for password {}, {}",
            request.name, request.description
        );
        let Some(provider) = self.credentials.clone() else {
            debug!("local sync parent: password request failed because no UI");
            reply.failed(&LocalSyncError::Transport("not connected to UI".to_string()));
            return;
        };
        // The UI may take a while; keep serving the channel meanwhile.
        tokio::spawn(async move {
            match provider
                .ask_password(&request.name, &request.description, &request.key)
                .await
            {
                Ok(password) => reply.done(&PasswordReply { password }),
                Err(e) => reply.failed(&e),
            }
        });
    }

    fn store_sync_report(&mut self, call: IncomingCall) {
        let parsed = call
            .params::<ReportParams>()
            .and_then(|params| SyncReport::from_text(&params.report));
        match parsed {
            Ok(report) => {
                debug!("got child sync report with status {}", report.status);
                self.report = report;
                if let Some(reply) = call.reply {
                    reply.done(&serde_json::json!({}));
                }
            }
            Err(e) => {
                warn!("Invalid sync report from child: {}", e);
                if let Some(reply) = call.reply {
                    reply.failed(&e);
                }
            }
        }
    }

    fn log_output(&self, call: &IncomingCall) {
        let output: LogOutput = match call.params() {
            Ok(output) => output,
            Err(e) => {
                debug!("Invalid log output from child: {}", e);
                return;
            }
        };
        let context = self.client_context.as_str();
        match output.level.as_str() {
            "ERROR" => error!(target: "localsync::child", context, source = %output.target, "{}", output.message),
            "WARN" => warn!(target: "localsync::child", context, source = %output.target, "{}", output.message),
            "INFO" => info!(target: "localsync::child", context, source = %output.target, "{}", output.message),
            _ => debug!(target: "localsync::child", context, source = %output.target, "{}", output.message),
        }
    }

    fn store_reply(&mut self, result: Result<serde_json::Value>) {
        let message = result.and_then(|value| Ok(serde_json::from_value::<MessageRef>(value)?));
        match message {
            Ok(message) => {
                debug!(
                    "child replied with {} bytes of {}",
                    message.length, message.content_type
                );
                if self.status == TransportStatus::Active {
                    self.reply = Some(message);
                    self.status = TransportStatus::GotReply;
                }
            }
            // Only an error if the child hasn't finished normally.
            Err(e) if self.report.is_empty() => {
                error!("sending message to child failed: {}", e);
                self.status = TransportStatus::Failed;
            }
            Err(e) => {
                debug!("message exchange ended after child report: {}", e);
            }
        }
    }

    async fn on_child_quit(&mut self, exit: ChildExit) {
        info!("Local sync child process has quit: {}", exit);
        self.child_exit = Some(exit);

        // Frames the child sent before exiting may still be in flight; read
        // until the connection closes, bounded.
        if self.incoming.is_some() {
            let drain = async {
                loop {
                    tokio::select! {
                        biased;
                        call = next_incoming(&mut self.incoming) => match call {
                            Some(call) => self.dispatch(call),
                            None => break,
                        },
                        result = self.message_call.response() => {
                            if result.is_ok() {
                                self.store_reply(result);
                            }
                        }
                    }
                }
            };
            if tokio::time::timeout(ControlConfig::LOOP_TICK * 10, drain)
                .await
                .is_err()
            {
                debug!("Control channel still open after child exit");
            }
        }

        self.message_call.clear();
        self.incoming = None;
        self.channel = None;
        self.listener = None;
    }

    /// Error describing why the child quit while a reply was outstanding.
    fn quit_failure(&self) -> LocalSyncError {
        if let Some(err) = self.report.target_failure(&self.client_context) {
            return err;
        }
        LocalSyncError::Transport("child process quit without sending its message".to_string())
    }

    /// Relay the user's suspend/abort request to the child.
    async fn relay_suspend(&mut self) -> Result<()> {
        match self.flags.state() {
            SuspendState::Abort => {
                info!("Aborting local sync as requested by user");
                self.cancel().await?;
                return Err(LocalSyncError::Aborted);
            }
            SuspendState::Suspend if !self.freeze_relayed && self.channel.is_some() => {
                self.freeze_relayed = true;
                self.set_freeze(true)?;
            }
            SuspendState::Normal if self.freeze_relayed && self.channel.is_some() => {
                self.freeze_relayed = false;
                self.set_freeze(false)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl TransportAgent for ParentAgent {
    fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_string();
    }

    fn allocate_for_send(&mut self, len: usize) -> Result<OutgoingMessage> {
        self.buffer.allocate_for_send(len)
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.status.is_terminal() {
            return Err(LocalSyncError::Transport(format!(
                "cannot send message: transport is {}",
                self.status
            )));
        }
        if self.status == TransportStatus::Active {
            return Err(LocalSyncError::TransportBusy);
        }
        let offset = self.buffer.to_offset(data)?;
        let Some(channel) = self.channel.as_ref() else {
            self.status = TransportStatus::Failed;
            return Err(LocalSyncError::Transport(
                "cannot send message because child process is gone".to_string(),
            ));
        };

        let message = MessageRef {
            content_type: self.content_type.clone(),
            offset,
            length: data.len(),
        };
        debug!("sending {} bytes of {} to child", message.length, message.content_type);
        match channel.call(methods::SEND_MSG, &message) {
            Ok(call) => {
                self.message_call.install(call);
                self.reply = None;
                self.status = TransportStatus::Active;
                Ok(())
            }
            Err(e) => {
                self.status = TransportStatus::Failed;
                Err(e)
            }
        }
    }

    async fn wait(&mut self, no_reply: bool) -> Result<TransportStatus> {
        if self.status == TransportStatus::Active && no_reply {
            self.message_call.clear();
            self.status = TransportStatus::Inactive;
            return Ok(self.status);
        }

        while self.status == TransportStatus::Active {
            if self.child_exit.is_some() {
                self.status = TransportStatus::Failed;
                return Err(self.quit_failure());
            }
            self.relay_suspend().await?;
            self.step("waiting for child to send message").await?;
        }
        Ok(self.status)
    }

    fn get_reply(&self) -> Result<Reply<'_>> {
        match (&self.reply, self.status) {
            (Some(message), TransportStatus::GotReply) => Ok(Reply {
                data: self.buffer.view_at(message.offset, message.length)?,
                content_type: &message.content_type,
            }),
            _ => Err(LocalSyncError::ProtocolViolation(format!(
                "get_reply() called in parent while {}",
                self.status
            ))),
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        if let Some(child) = &self.child {
            debug!("killing local transport child in cancel()");
            child.terminate()?;
        }
        self.status = TransportStatus::Canceled;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        debug!("parent is shutting down");
        // Don't kill the child: it completes by itself after delivering its report.
        while self.child.is_some() && self.child_exit.is_none() {
            self.step("waiting for child to stop").await?;
        }
        self.message_call.clear();
        self.channel = None;
        self.incoming = None;
        if !self.status.is_terminal() {
            self.status = TransportStatus::Closed;
        }
        Ok(())
    }

    fn set_timeout(&mut self, _seconds: u32) {}

    fn status(&self) -> TransportStatus {
        self.status
    }
}

impl Drop for ParentAgent {
    fn drop(&mut self) {
        if let Some(child) = &self.child {
            if self.child_exit.is_none() && !child.has_exited() {
                debug!("Transport dropped while child PID {} runs, terminating it", child.pid());
                if let Err(e) = child.terminate() {
                    warn!("{}", e);
                }
            }
        }
    }
}

async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
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

async fn child_exited(child: Option<&ChildProcess>) -> ChildExit {
    match child {
        Some(child) => child.exited().await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for ParentAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentAgent")
            .field("config", &self.config.config_name)
            .field("client_context", &self.client_context)
            .field("status", &self.status)
            .field("child_pid", &self.child_pid())
            .field("child_exit", &self.child_exit)
            .finish()
    }
}
