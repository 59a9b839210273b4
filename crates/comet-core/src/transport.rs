//! Transport contracts between the long-poll core and the host engine.
//!
//! The host engine owns the actual request/response exchange and hands the
//! core a [`ReplySink`] for it. The negotiated [`TransportKind`] decides how
//! the reply is framed and whether the client keeps polling afterwards.

use crate::codec::is_valid_callback;
use crate::error::{CometError, CometResult};
use crate::message::Message;

pub const LONG_POLLING: &str = "long-polling";
pub const CALLBACK_POLLING: &str = "callback-polling";

/// Connection types advertised in the handshake reply.
pub const SUPPORTED_CONNECTION_TYPES: &[&str] = &[LONG_POLLING, CALLBACK_POLLING];

/// The outbound half of one request/response exchange.
pub trait ReplySink: Send {
    /// Append one message to the reply.
    fn write(&mut self, message: &Message) -> CometResult<()>;

    /// Finish the reply. Called at most once per exchange.
    fn close(&mut self) -> CometResult<()>;
}

/// Negotiated polling sub-protocol of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain JSON array replies over XHR.
    LongPolling,
    /// Replies wrapped in a JSONP callback.
    CallbackPolling { callback: String },
}

impl TransportKind {
    /// Pick the transport for a connection: a `jsonp` parameter always
    /// selects callback polling, and must name a usable callback.
    pub fn negotiate(jsonp: Option<&str>) -> CometResult<Self> {
        match jsonp {
            Some(callback) if !is_valid_callback(callback) => Err(CometError::InvalidMessage(
                format!("invalid jsonp callback: {callback}"),
            )),
            Some(callback) => Ok(TransportKind::CallbackPolling {
                callback: callback.to_string(),
            }),
            None => Ok(TransportKind::LongPolling),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::LongPolling => LONG_POLLING,
            TransportKind::CallbackPolling { .. } => CALLBACK_POLLING,
        }
    }

    /// Whether the client keeps a poll outstanding after this reply.
    ///
    /// Callback-polling replies are one-shot script loads, so every
    /// connection on them is expected to answer.
    pub fn resume_poll(&self) -> bool {
        matches!(self, TransportKind::LongPolling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonp_selects_callback_polling() {
        let kind = TransportKind::negotiate(Some("cb")).unwrap();
        assert_eq!(kind.name(), CALLBACK_POLLING);
        assert!(!kind.resume_poll());

        let kind = TransportKind::negotiate(None).unwrap();
        assert_eq!(kind.name(), LONG_POLLING);
        assert!(kind.resume_poll());
    }

    #[test]
    fn bad_callback_is_refused() {
        assert!(TransportKind::negotiate(Some("alert(1)")).is_err());
        assert!(TransportKind::negotiate(Some("")).is_err());
        assert!(TransportKind::negotiate(Some("jQuery.cb_1")).is_ok());
    }
}
