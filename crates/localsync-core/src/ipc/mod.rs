//! Control channel between parent and helper.
//!
//! Carries method calls and `(offset, length)` handoffs; message bytes travel
//! through the [`SharedMessageBuffer`](crate::shm::SharedMessageBuffer).

pub mod channel;
pub mod correlation;
pub mod messages;
pub mod protocol;

pub use channel::{ControlChannel, IncomingCall, PendingCall, ReplyHandle};
pub use correlation::{CallSlot, ReplySlot};
pub use messages::methods;
