//! Per-connection transport.
//!
//! A [`Transport`] binds one in-flight exchange to the host engine's
//! [`ReplySink`]. It is created fresh for every connection, carries the
//! pending `/meta/connect` reply while a poll is suspended, and is rebound to
//! a new sink when the poll resumes.

use crate::suspend::ConnectionId;
use comet_core::{CometError, CometResult, Message, ReplySink, TransportKind};
use std::fmt;
use tokio::sync::oneshot;
use tracing::debug;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First time this connection is processed.
    Initial,
    /// Continuation of a suspended connection.
    Resumed,
    /// At least one message has been written.
    Replying,
    /// The reply is finished.
    Complete,
}

pub struct Transport {
    connection: ConnectionId,
    kind: TransportKind,
    sink: Box<dyn ReplySink>,
    poll_reply: Option<Message>,
    polled: bool,
    state: ConnectionState,
}

impl Transport {
    pub fn new(kind: TransportKind, sink: Box<dyn ReplySink>) -> Self {
        Self {
            connection: ConnectionId::next(),
            kind,
            sink,
            poll_reply: None,
            polled: false,
            state: ConnectionState::Initial,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the client keeps a poll outstanding after this reply.
    pub fn resume_poll(&self) -> bool {
        self.kind.resume_poll()
    }

    /// Hold back the `/meta/connect` reply until the poll is answered.
    pub fn set_poll_reply(&mut self, reply: Message) {
        self.poll_reply = Some(reply);
        self.polled = true;
    }

    pub fn take_poll_reply(&mut self) -> Option<Message> {
        self.poll_reply.take()
    }

    /// Whether this connection carried a `/meta/connect`.
    pub fn is_poll(&self) -> bool {
        self.polled
    }

    /// Attach the sink of the exchange that resumes this connection.
    pub fn rebind(&mut self, sink: Box<dyn ReplySink>) {
        self.sink = sink;
        self.state = ConnectionState::Resumed;
    }

    pub fn send(&mut self, message: &Message) -> CometResult<()> {
        if self.state == ConnectionState::Complete {
            return Err(CometError::Transport(format!(
                "{} already complete",
                self.connection
            )));
        }
        self.state = ConnectionState::Replying;
        self.sink.write(message)
    }

    /// Finish the reply. Later calls are no-ops.
    pub fn complete(&mut self) -> CometResult<()> {
        if self.state == ConnectionState::Complete {
            return Ok(());
        }
        self.state = ConnectionState::Complete;
        debug!(connection = %self.connection, transport = self.kind.name(), "complete");
        self.sink.close()
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("connection", &self.connection)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("poll_reply", &self.poll_reply.is_some())
            .finish()
    }
}

/// Collects a reply and hands it to the waiting request handler on close.
pub struct BufferedSink {
    messages: Vec<Message>,
    tx: Option<oneshot::Sender<Vec<Message>>>,
}

impl BufferedSink {
    pub fn channel() -> (Self, oneshot::Receiver<Vec<Message>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                messages: Vec::new(),
                tx: Some(tx),
            },
            rx,
        )
    }
}

impl ReplySink for BufferedSink {
    fn write(&mut self, message: &Message) -> CometResult<()> {
        if self.tx.is_none() {
            return Err(CometError::Transport("reply already closed".into()));
        }
        self.messages.push(message.clone());
        Ok(())
    }

    fn close(&mut self) -> CometResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| CometError::Transport("reply already closed".into()))?;
        tx.send(std::mem::take(&mut self.messages))
            .map_err(|_| CometError::Transport("request handler went away".into()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// What a [`RecordingSink`] saw.
    #[derive(Debug, Default)]
    pub struct Recorded {
        pub messages: Vec<Message>,
        pub closed: usize,
    }

    /// Test sink that records writes and can fail after N of them.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub recorded: Arc<Mutex<Recorded>>,
        fail_after: Option<usize>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_after(writes: usize) -> Self {
            Self {
                fail_after: Some(writes),
                ..Self::default()
            }
        }

        pub fn boxed(&self) -> Box<dyn ReplySink> {
            Box::new(self.clone())
        }

        pub fn channels(&self) -> Vec<String> {
            self.recorded
                .lock()
                .unwrap()
                .messages
                .iter()
                .map(|m| m.channel.clone())
                .collect()
        }

        pub fn messages(&self) -> Vec<Message> {
            self.recorded.lock().unwrap().messages.clone()
        }

        pub fn closed(&self) -> usize {
            self.recorded.lock().unwrap().closed
        }
    }

    impl ReplySink for RecordingSink {
        fn write(&mut self, message: &Message) -> CometResult<()> {
            let mut recorded = self.recorded.lock().unwrap();
            if self.fail_after.is_some_and(|n| recorded.messages.len() >= n) {
                return Err(CometError::Transport("connection reset".into()));
            }
            recorded.messages.push(message.clone());
            Ok(())
        }

        fn close(&mut self) -> CometResult<()> {
            self.recorded.lock().unwrap().closed += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let sink = RecordingSink::new();
        let mut transport = Transport::new(TransportKind::LongPolling, sink.boxed());
        assert_eq!(transport.state(), ConnectionState::Initial);

        transport.rebind(sink.boxed());
        assert_eq!(transport.state(), ConnectionState::Resumed);

        transport.send(&Message::new("/a")).unwrap();
        assert_eq!(transport.state(), ConnectionState::Replying);

        transport.complete().unwrap();
        transport.complete().unwrap();
        assert_eq!(transport.state(), ConnectionState::Complete);
        assert_eq!(sink.closed(), 1);
        assert!(transport.send(&Message::new("/b")).is_err());
    }

    #[test]
    fn poll_reply_marks_connection_as_poll() {
        let mut transport = Transport::new(TransportKind::LongPolling, RecordingSink::new().boxed());
        assert!(!transport.is_poll());
        transport.set_poll_reply(Message::new("/meta/connect"));
        assert!(transport.is_poll());
        assert!(transport.take_poll_reply().is_some());
        assert!(transport.take_poll_reply().is_none());
        assert!(transport.is_poll());
    }

    #[tokio::test]
    async fn buffered_sink_hands_over_on_close() {
        let (mut sink, rx) = BufferedSink::channel();
        sink.write(&Message::new("/a")).unwrap();
        sink.write(&Message::new("/b")).unwrap();
        sink.close().unwrap();

        let messages = rx.await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(sink.write(&Message::new("/c")).is_err());
        assert!(sink.close().is_err());
    }
}
