//! Bidirectional JSON-RPC peer over one loopback TCP connection.
//!
//! Unlike a plain client/server pair, both ends call methods on each other.
//! A reader task routes responses to the caller waiting for them and hands
//! requests to the owner of the channel as [`IncomingCall`]s; a writer task
//! serializes everything going out.
//!
//! # Failure model
//!
//! When the connection drops, every outstanding [`PendingCall`] fails at once
//! with [`LocalSyncError::ChannelLost`], the incoming call stream ends, and
//! [`ControlChannel::closed`] completes. Nothing is retried.

use super::protocol::{parse_frame, read_frame, write_frame, IpcFrame, IpcRequest, IpcResponse};
use crate::config::ControlConfig;
use crate::error::{LocalSyncError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type ResponseSender = oneshot::Sender<Result<serde_json::Value>>;

#[derive(Debug, Default)]
struct PendingMap {
    calls: HashMap<u64, ResponseSender>,
    /// Set once the connection is gone; no new calls are registered after that.
    closed_reason: Option<String>,
}

#[derive(Debug)]
struct Shared {
    pending: Mutex<PendingMap>,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        // A poisoned map only means another task panicked mid-update; the
        // map itself is still consistent.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self, reason: &str) {
        let dropped = {
            let mut pending = self.lock();
            if pending.closed_reason.is_none() {
                pending.closed_reason = Some(reason.to_string());
            }
            std::mem::take(&mut pending.calls)
        };
        if !dropped.is_empty() {
            debug!("Control channel closed with {} calls outstanding", dropped.len());
        }
        // Dropping the senders fails every waiting PendingCall.
        drop(dropped);
        // send_replace updates the value even with no receiver subscribed.
        self.closed_tx.send_replace(true);
    }

    fn closed_reason(&self) -> Option<String> {
        self.lock().closed_reason.clone()
    }
}

#[derive(Debug)]
struct Inner {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    next_id: AtomicU64,
    peer: SocketAddr,
    reader_task: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.shared.close("control channel dropped");
    }
}

/// One end of the control channel. Clones share the connection.
#[derive(Debug, Clone)]
pub struct ControlChannel {
    inner: Arc<Inner>,
}

/// A request or notification received from the peer.
#[derive(Debug)]
pub struct IncomingCall {
    pub method: String,
    pub params: serde_json::Value,
    /// `None` for notifications.
    pub reply: Option<ReplyHandle>,
}

impl IncomingCall {
    /// Decode the parameters.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.params.clone()).map_err(|e| LocalSyncError::Json {
            message: format!("Invalid params for {}: {}", self.method, e),
            source: Some(e),
        })
    }
}

impl ControlChannel {
    /// Connect to a listening parent.
    pub async fn connect(addr: SocketAddr) -> Result<(Self, mpsc::UnboundedReceiver<IncomingCall>)> {
        let stream = tokio::time::timeout(ControlConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| LocalSyncError::channel_lost(format!("timed out connecting to {}", addr)))?
            .map_err(|e| LocalSyncError::channel_lost(format!("cannot connect to {}: {}", addr, e)))?;
        Self::from_stream(stream)
    }

    /// Take over an established connection.
    pub fn from_stream(stream: TcpStream) -> Result<(Self, mpsc::UnboundedReceiver<IncomingCall>)> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingMap::default()),
            closed_tx,
        });
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(writer, outgoing_rx, Arc::clone(&shared)));
        let reader_task = tokio::spawn(read_loop(
            reader,
            incoming_tx,
            outgoing_tx.clone(),
            Arc::clone(&shared),
        ));

        debug!("Control channel established with {}", peer);

        let channel = Self {
            inner: Arc::new(Inner {
                shared,
                outgoing: outgoing_tx,
                next_id: AtomicU64::new(1),
                peer,
                reader_task,
            }),
        };
        Ok((channel, incoming_rx))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Start a call. The returned [`PendingCall`] resolves with the peer's reply.
    pub fn call<P: Serialize>(&self, method: &str, params: &P) -> Result<PendingCall> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = IpcRequest::new(method, serde_json::to_value(params)?, id);
        let bytes = serde_json::to_vec(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.shared.lock();
            if let Some(reason) = &pending.closed_reason {
                return Err(LocalSyncError::channel_lost(reason.clone()));
            }
            pending.calls.insert(id, tx);
        }

        if self.inner.outgoing.send(bytes).is_err() {
            self.inner.shared.close("control channel writer stopped");
            return Err(self.lost());
        }

        debug!("Control call {} #{} sent", method, id);
        Ok(PendingCall {
            id,
            method: method.to_string(),
            rx,
            shared: Arc::downgrade(&self.inner.shared),
        })
    }

    /// Call and wait for the reply.
    pub async fn call_and_wait<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R> {
        let value = self.call(method, params)?.await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a notification; there is no reply.
    pub fn notify<P: Serialize>(&self, method: &str, params: &P) -> Result<()> {
        if let Some(reason) = self.inner.shared.closed_reason() {
            return Err(LocalSyncError::channel_lost(reason));
        }
        let note = IpcRequest::notification(method, serde_json::to_value(params)?);
        self.inner
            .outgoing
            .send(serde_json::to_vec(&note)?)
            .map_err(|_| self.lost())
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shared.closed_tx.borrow()
    }

    /// Completes once the connection is gone.
    pub async fn closed(&self) {
        let mut rx = self.inner.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// The error callers see after the connection is gone.
    pub fn lost(&self) -> LocalSyncError {
        LocalSyncError::channel_lost(
            self.inner
                .shared
                .closed_reason()
                .unwrap_or_else(|| "control channel closed".to_string()),
        )
    }
}

/// An outstanding call. Await it (or a `&mut` to it) for the reply.
///
/// Dropping it forgets the call; a late reply is then discarded.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Result<serde_json::Value>>,
    shared: Weak<Shared>,
}

impl PendingCall {
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Future for PendingCall {
    type Output = Result<serde_json::Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                let reason = self
                    .shared
                    .upgrade()
                    .and_then(|shared| shared.closed_reason())
                    .unwrap_or_else(|| "control channel closed".to_string());
                Poll::Ready(Err(LocalSyncError::channel_lost(format!(
                    "{} (while waiting for {})",
                    reason, self.method
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.lock().calls.remove(&self.id);
        }
    }
}

/// The obligation to answer one incoming request.
///
/// Dropping it without answering sends an error reply, so the peer is never
/// left waiting.
#[derive(Debug)]
pub struct ReplyHandle {
    id: u64,
    method: String,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    answered: bool,
}

impl ReplyHandle {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Answer with a result.
    pub fn done<T: Serialize>(mut self, result: &T) {
        let response = match serde_json::to_value(result) {
            Ok(value) => IpcResponse::success(Some(self.id), value),
            Err(e) => IpcResponse::error(Some(self.id), -32603, format!("Internal error: {}", e)),
        };
        self.send(response);
    }

    /// Answer with an error.
    pub fn failed(mut self, error: &LocalSyncError) {
        let response = IpcResponse::error(Some(self.id), error.to_rpc_error_code(), error.to_string());
        self.send(response);
    }

    fn send(&mut self, response: IpcResponse) {
        self.answered = true;
        match serde_json::to_vec(&response) {
            Ok(bytes) => {
                if self.outgoing.send(bytes).is_err() {
                    debug!("Reply to {} #{} dropped: channel closed", self.method, self.id);
                }
            }
            Err(e) => warn!("Cannot encode reply to {}: {}", self.method, e),
        }
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if !self.answered {
            let response = IpcResponse::error(
                Some(self.id),
                -32603,
                format!("{} was dropped without a reply", self.method),
            );
            self.send(response);
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("Control channel write failed: {}", e);
            shared.close(&format!("write failed: {}", e));
            return;
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    incoming: mpsc::UnboundedSender<IncomingCall>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Shared>,
) {
    let reason = loop {
        let payload = match read_frame(&mut reader).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break "peer closed the connection".to_string(),
            Err(e) => break format!("read failed: {}", e),
        };

        let frame = match parse_frame(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding malformed control frame: {}", e);
                let response = IpcResponse::error(None, -32700, format!("Parse error: {}", e));
                if let Ok(bytes) = serde_json::to_vec(&response) {
                    let _ = outgoing.send(bytes);
                }
                continue;
            }
        };

        match frame {
            IpcFrame::Request(request) => {
                debug!("Control request {} received", request.method);
                let reply = request.id.map(|id| ReplyHandle {
                    id,
                    method: request.method.clone(),
                    outgoing: outgoing.clone(),
                    answered: false,
                });
                let call = IncomingCall {
                    method: request.method,
                    params: request.params.unwrap_or(serde_json::Value::Null),
                    reply,
                };
                // If nobody listens anymore the ReplyHandle drop answers with an error.
                let _ = incoming.send(call);
            }
            IpcFrame::Response(response) => {
                let Some(id) = response.id else {
                    warn!(
                        "Peer reported an error without call id: {}",
                        response.error.map(|e| e.message).unwrap_or_default()
                    );
                    continue;
                };
                let Some(tx) = shared.lock().calls.remove(&id) else {
                    debug!("Discarding reply to forgotten call #{}", id);
                    continue;
                };
                let result = match (response.error, response.result) {
                    (Some(err), _) => Err(LocalSyncError::Transport(err.message)),
                    (None, Some(value)) => Ok(value),
                    (None, None) => Ok(serde_json::Value::Null),
                };
                let _ = tx.send(result);
            }
        }
    };

    debug!("Control channel reader stopped: {}", reason);
    shared.close(&reason);
}
