//! Message extensions and the ordered chain that applies them.
//!
//! Outgoing hooks run on every message immediately before it is handed to a
//! transport; incoming hooks run on every inbound message before dispatch.
//! Returning `Ok(None)` suppresses the message. An `Err` drops that one
//! message and is logged; the chain and later messages are unaffected.

use crate::channel::Operation;
use crate::error::CometResult;
use crate::message::Message;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// A transform over inbound and outbound messages.
///
/// The `*_meta` hooks see `/meta/*` messages, the others see everything
/// else. Every hook defaults to passing the message through.
pub trait Extension: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    fn receive(&self, message: Message) -> CometResult<Option<Message>> {
        Ok(Some(message))
    }

    fn receive_meta(&self, message: Message) -> CometResult<Option<Message>> {
        Ok(Some(message))
    }

    fn send(&self, message: Message) -> CometResult<Option<Message>> {
        Ok(Some(message))
    }

    fn send_meta(&self, message: Message) -> CometResult<Option<Message>> {
        Ok(Some(message))
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Incoming,
    Outgoing,
}

/// Extensions in registration order.
#[derive(Clone, Default)]
pub struct ExtensionChain {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Arc<dyn Extension>) {
        self.extensions.push(extension);
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Run the outgoing hooks. `None` means the message must not be sent.
    pub fn apply_outgoing(&self, message: Message) -> Option<Message> {
        self.apply(message, Direction::Outgoing)
    }

    /// Run the incoming hooks. `None` means the message must not be dispatched.
    pub fn apply_incoming(&self, message: Message) -> Option<Message> {
        self.apply(message, Direction::Incoming)
    }

    fn apply(&self, mut message: Message, direction: Direction) -> Option<Message> {
        let meta = Operation::resolve(&message.channel).is_meta();
        for ext in &self.extensions {
            let channel = message.channel.clone();
            let result = match (direction, meta) {
                (Direction::Incoming, false) => ext.receive(message),
                (Direction::Incoming, true) => ext.receive_meta(message),
                (Direction::Outgoing, false) => ext.send(message),
                (Direction::Outgoing, true) => ext.send_meta(message),
            };
            message = match result {
                Ok(Some(next)) => next,
                Ok(None) => return None,
                Err(e) => {
                    warn!(
                        extension = ext.name(),
                        channel = %channel,
                        direction = ?direction,
                        error = %e,
                        "extension failed, message dropped"
                    );
                    return None;
                }
            };
        }
        Some(message)
    }
}

impl std::fmt::Debug for ExtensionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.extensions.iter().map(|e| e.name()))
            .finish()
    }
}

/// Stamps a `timestamp` (milliseconds since the Unix epoch) on outgoing
/// messages that do not carry one.
#[derive(Debug, Default)]
pub struct TimestampExtension;

impl TimestampExtension {
    fn stamp(mut message: Message) -> Message {
        if message.timestamp.is_none() {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            message.timestamp = Some(millis.to_string());
        }
        message
    }
}

impl Extension for TimestampExtension {
    fn name(&self) -> &str {
        "timestamp"
    }

    fn send(&self, message: Message) -> CometResult<Option<Message>> {
        Ok(Some(Self::stamp(message)))
    }

    fn send_meta(&self, message: Message) -> CometResult<Option<Message>> {
        Ok(Some(Self::stamp(message)))
    }
}
