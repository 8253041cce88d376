//! Engine-facing transport contract.
//!
//! The sync engine drives every transport the same way: `send` a message,
//! `wait` for the reply, read it with `get_reply`, repeat. Whether the peer
//! sits behind HTTP or in a helper process is invisible to it.

use crate::error::Result;
use crate::shm::OutgoingMessage;
use async_trait::async_trait;
use std::fmt;

/// State of one transport agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    /// Nothing pending.
    #[default]
    Inactive,
    /// Message sent, reply outstanding.
    Active,
    /// Reply available via `get_reply`.
    GotReply,
    /// Permanently broken.
    Failed,
    /// Canceled by the user or the engine.
    Canceled,
    /// Shut down normally.
    Closed,
    /// Reply did not arrive in time.
    TimeOut,
}

impl TransportStatus {
    /// Terminal states are sticky.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportStatus::Failed
                | TransportStatus::Canceled
                | TransportStatus::Closed
                | TransportStatus::TimeOut
        )
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportStatus::Inactive => "inactive",
            TransportStatus::Active => "active",
            TransportStatus::GotReply => "got reply",
            TransportStatus::Failed => "failed",
            TransportStatus::Canceled => "canceled",
            TransportStatus::Closed => "closed",
            TransportStatus::TimeOut => "timed out",
        };
        write!(f, "{}", name)
    }
}

/// A received message. Valid until the next `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply<'a> {
    pub data: &'a [u8],
    pub content_type: &'a str,
}

/// Request/reply exchange with one peer.
#[async_trait]
pub trait TransportAgent: Send {
    /// Tag the next outgoing message.
    fn set_content_type(&mut self, content_type: &str);

    /// Storage for the next outgoing message.
    ///
    /// Transports with a shared buffer hand out a slice of it so the engine
    /// writes the message in place.
    fn allocate_for_send(&mut self, len: usize) -> Result<OutgoingMessage> {
        Ok(OutgoingMessage::owned(len))
    }

    /// Start sending `data`. It must stay alive until the reply arrived.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Block until the pending operation completes.
    ///
    /// With `no_reply` no answer is expected and the call returns at once.
    async fn wait(&mut self, no_reply: bool) -> Result<TransportStatus>;

    /// The received message; only valid in [`TransportStatus::GotReply`].
    fn get_reply(&self) -> Result<Reply<'_>>;

    /// Stop the exchange with the peer.
    async fn cancel(&mut self) -> Result<()>;

    /// Normal shutdown.
    async fn shutdown(&mut self) -> Result<()>;

    /// Give up on replies after `seconds`; zero disables the timeout.
    fn set_timeout(&mut self, seconds: u32);

    fn status(&self) -> TransportStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TransportStatus::Failed.is_terminal());
        assert!(TransportStatus::Canceled.is_terminal());
        assert!(TransportStatus::Closed.is_terminal());
        assert!(TransportStatus::TimeOut.is_terminal());
        assert!(!TransportStatus::Active.is_terminal());
        assert!(!TransportStatus::GotReply.is_terminal());
        assert!(!TransportStatus::Inactive.is_terminal());
    }

    #[test]
    fn test_owned_message_by_default() {
        struct Null;

        #[async_trait]
        impl TransportAgent for Null {
            fn set_content_type(&mut self, _content_type: &str) {}
            async fn send(&mut self, _data: &[u8]) -> Result<()> {
                Ok(())
            }
            async fn wait(&mut self, _no_reply: bool) -> Result<TransportStatus> {
                Ok(TransportStatus::Inactive)
            }
            fn get_reply(&self) -> Result<Reply<'_>> {
                Err(crate::LocalSyncError::ProtocolViolation("no reply".into()))
            }
            async fn cancel(&mut self) -> Result<()> {
                Ok(())
            }
            async fn shutdown(&mut self) -> Result<()> {
                Ok(())
            }
            fn set_timeout(&mut self, _seconds: u32) {}
            fn status(&self) -> TransportStatus {
                TransportStatus::Inactive
            }
        }

        let mut agent = Null;
        let message = agent.allocate_for_send(4).unwrap();
        assert!(!message.is_shared());
        assert_eq!(message.len(), 4);
    }
}
