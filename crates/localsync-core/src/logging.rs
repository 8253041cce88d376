//! Forward the helper's log output to the parent.
//!
//! The helper installs [`ForwardingLayer`] next to its own formatter before
//! the control channel exists; once connected, [`LogForwarder::attach`] starts
//! shipping every event as a `logOutput` notification, and the parent
//! re-emits it as part of its own session output.

use crate::ipc::messages::{methods, LogOutput};
use crate::ipc::ControlChannel;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Control channel traffic is not forwarded; it would feed back into itself.
const SKIPPED_TARGET: &str = "localsync_core::ipc";

/// Tracing layer sending events to the parent.
#[derive(Debug, Clone)]
pub struct ForwardingLayer {
    channel: Arc<OnceLock<ControlChannel>>,
}

/// Connects a [`ForwardingLayer`] to the control channel once it exists.
#[derive(Debug, Clone)]
pub struct LogForwarder {
    channel: Arc<OnceLock<ControlChannel>>,
}

/// Create a layer and the handle that activates it.
pub fn forwarding_layer() -> (ForwardingLayer, LogForwarder) {
    let channel = Arc::new(OnceLock::new());
    (
        ForwardingLayer {
            channel: Arc::clone(&channel),
        },
        LogForwarder { channel },
    )
}

impl LogForwarder {
    /// Start forwarding. Only the first channel counts.
    pub fn attach(&self, channel: ControlChannel) {
        let _ = self.channel.set(channel);
    }

    pub fn is_attached(&self) -> bool {
        self.channel.get().is_some()
    }
}

impl<S: Subscriber> Layer<S> for ForwardingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(channel) = self.channel.get() else {
            return;
        };
        let metadata = event.metadata();
        if metadata.target().starts_with(SKIPPED_TARGET) || channel.is_closed() {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let output = LogOutput {
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        };
        // Parent gone: nothing left to report to.
        let _ = channel.notify(methods::LOG_OUTPUT, &output);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
