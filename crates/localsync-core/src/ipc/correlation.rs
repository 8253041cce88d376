//! At most one outstanding call per purpose.
//!
//! Both directions of the control channel follow the same rule: installing a
//! new call or reply for a purpose gives up on the previous one. Making that
//! explicit here keeps the agents free of ad-hoc bookkeeping.

use super::channel::{PendingCall, ReplyHandle};
use crate::error::{LocalSyncError, Result};
use tracing::debug;

/// A reply this side owes the peer, e.g. the answer to the parent's `sendMsg`.
#[derive(Debug)]
pub struct ReplySlot {
    purpose: &'static str,
    pending: Option<ReplyHandle>,
}

impl ReplySlot {
    pub fn new(purpose: &'static str) -> Self {
        Self {
            purpose,
            pending: None,
        }
    }

    /// Remember `reply`; a previous one is failed with `reason`.
    pub fn install(&mut self, reply: ReplyHandle, reason: &str) {
        self.fail(reason);
        self.pending = Some(reply);
    }

    /// Fail the pending reply, if any.
    pub fn fail(&mut self, reason: &str) {
        if let Some(previous) = self.pending.take() {
            debug!("Cancelling {} reply: {}", self.purpose, reason);
            previous.failed(&LocalSyncError::Transport(format!(
                "cancelling message: {}",
                reason
            )));
        }
    }

    pub fn take(&mut self) -> Option<ReplyHandle> {
        self.pending.take()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// A call this side waits on, e.g. the parent's outstanding `sendMsg`.
#[derive(Debug)]
pub struct CallSlot {
    purpose: &'static str,
    pending: Option<PendingCall>,
}

impl CallSlot {
    pub fn new(purpose: &'static str) -> Self {
        Self {
            purpose,
            pending: None,
        }
    }

    /// Wait on `call`; a previous call is forgotten.
    pub fn install(&mut self, call: PendingCall) {
        if let Some(previous) = self.pending.replace(call) {
            debug!(
                "Forgetting {} call {} for a newer one",
                self.purpose,
                previous.method()
            );
        }
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Result of the outstanding call. Never completes while the slot is empty.
    ///
    /// Cancel safe: if the future is dropped early, the call stays installed.
    pub async fn response(&mut self) -> Result<serde_json::Value> {
        match self.pending.as_mut() {
            Some(call) => {
                let result = call.await;
                self.pending = None;
                result
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel::{ControlChannel, IncomingCall};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn pair() -> (
        (ControlChannel, mpsc::UnboundedReceiver<IncomingCall>),
        (ControlChannel, mpsc::UnboundedReceiver<IncomingCall>),
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), ControlChannel::connect(addr));
        let (stream, _) = accepted.unwrap();
        (ControlChannel::from_stream(stream).unwrap(), connected.unwrap())
    }

    #[tokio::test]
    async fn test_new_reply_fails_previous() {
        let ((parent, _parent_calls), (_child, mut child_calls)) = pair().await;
        let first = parent.call("sendMsg", &1).unwrap();
        let second = parent.call("sendMsg", &2).unwrap();

        let mut slot = ReplySlot::new("message");
        slot.install(child_calls.recv().await.unwrap().reply.unwrap(), "new message");
        slot.install(child_calls.recv().await.unwrap().reply.unwrap(), "new message");
        slot.take().unwrap().done(&"ok");

        let err = first.await.unwrap_err();
        assert!(err.to_string().contains("cancelling message: new message"));
        assert_eq!(second.await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_empty_call_slot_never_completes() {
        let mut slot = CallSlot::new("message");
        let result = tokio::time::timeout(Duration::from_millis(50), slot.response()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_call_slot_survives_cancelled_wait() {
        let ((parent, _parent_calls), (_child, mut child_calls)) = pair().await;
        let mut slot = CallSlot::new("message");
        slot.install(parent.call("sendMsg", &1).unwrap());

        let early = tokio::time::timeout(Duration::from_millis(20), slot.response()).await;
        assert!(early.is_err());
        assert!(slot.is_pending());

        child_calls.recv().await.unwrap().reply.unwrap().done(&"reply");
        assert_eq!(slot.response().await.unwrap(), "reply");
        assert!(!slot.is_pending());
    }
}
