//! Long-poll controller: the suspend/resume state machine.
//!
//! [`LongPollController::service`] processes a fresh connection. A lone
//! `/meta/connect` that finds an empty mailbox is parked and handed back to
//! the host as a [`SuspendedPoll`]; everything else replies at once. The host
//! awaits [`SuspendedPoll::wait`] and passes the result to
//! [`LongPollController::resume`], which always replies and never parks
//! again.
//!
//! The mailbox check that leads to parking and the flush both run under the
//! session lock, and deliveries wake under the same lock, so a message
//! published between "mailbox empty" and "park" cannot be missed.

use crate::bayeux::Bayeux;
use crate::session::ClientSession;
use crate::suspend::{self, ConnectionId, Resumption, Suspension, WakeReason};
use crate::transport::Transport;
use comet_core::{Advice, CometError, CometResult, Message, Operation, ReplySink};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One inbound request, already decoded by the host.
#[derive(Debug, Default)]
pub struct PollRequest {
    pub messages: Vec<Message>,
    /// JSONP callback requested through the query string.
    pub jsonp: Option<String>,
    pub browser_id: Option<String>,
}

impl PollRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_jsonp(mut self, callback: impl Into<String>) -> Self {
        self.jsonp = Some(callback.into());
        self
    }

    pub fn with_browser_id(mut self, browser_id: impl Into<String>) -> Self {
        self.browser_id = Some(browser_id.into());
        self
    }
}

/// Result of servicing a fresh connection.
#[derive(Debug)]
pub enum Outcome {
    /// The reply was written and the sink closed.
    Completed,
    /// The connection is parked; await it and hand it back to
    /// [`LongPollController::resume`].
    Suspended(SuspendedPoll),
}

/// A parked poll connection, with everything needed to finish it later.
#[derive(Debug)]
pub struct SuspendedPoll {
    session: Arc<ClientSession>,
    transport: Transport,
    suspension: Suspension,
}

impl SuspendedPoll {
    pub fn connection(&self) -> ConnectionId {
        self.transport.connection()
    }

    pub fn client_id(&self) -> &str {
        self.session.id()
    }

    /// Time left before the poll times out.
    pub fn timeout(&self) -> Duration {
        self.suspension
            .deadline()
            .saturating_duration_since(tokio::time::Instant::now())
    }

    /// Wait for a wake or the deadline, whichever comes first.
    pub async fn wait(self) -> ResumedPoll {
        let resumption = self.suspension.resumed().await;
        ResumedPoll {
            session: self.session,
            transport: self.transport,
            resumption,
        }
    }
}

/// A parked connection that has come back and must now reply.
#[derive(Debug)]
pub struct ResumedPoll {
    session: Arc<ClientSession>,
    transport: Transport,
    resumption: Resumption,
}

impl ResumedPoll {
    pub fn resumption(&self) -> Resumption {
        self.resumption
    }
}

pub struct LongPollController {
    bayeux: Arc<Bayeux>,
}

impl LongPollController {
    pub fn new(bayeux: Arc<Bayeux>) -> Self {
        Self { bayeux }
    }

    pub fn bayeux(&self) -> &Arc<Bayeux> {
        &self.bayeux
    }

    /// Process a fresh connection.
    ///
    /// An `Err` means the JSONP callback was refused (nothing is dispatched)
    /// or the sink failed; the mailbox is left as it was and the host should
    /// fail the exchange.
    pub async fn service(
        &self,
        request: PollRequest,
        sink: Box<dyn ReplySink>,
    ) -> CometResult<Outcome> {
        let PollRequest {
            messages,
            jsonp,
            browser_id,
        } = request;
        let batch_size = messages.len();
        let mut transport = self.bayeux.new_transport(jsonp.as_deref(), sink)?;

        let mut session: Option<Arc<ClientSession>> = None;
        let mut pending: Option<Arc<ClientSession>> = None;
        let mut connect = false;

        let dispatched = async {
            for message in messages {
                let message = match jsonp.as_deref() {
                    Some(callback) => message.with_field("jsonp", callback),
                    None => message,
                };
                let Some(message) = self.bayeux.extensions().apply_incoming(message) else {
                    continue;
                };

                // Messages without a clientId ride on the session this batch
                // already resolved (e.g. one created by a leading handshake).
                let found = match message.client_id.as_deref() {
                    Some(id) => self.bayeux.session(Some(id)),
                    None => session.clone(),
                };

                match found {
                    Some(current) => {
                        if !transport.resume_poll() && pending.is_none() {
                            current.response_pending().await;
                            pending = Some(Arc::clone(&current));
                        }
                        if let Some(browser_id) = browser_id.as_deref() {
                            current.set_browser_id(browser_id).await;
                        }
                        let op = self
                            .bayeux
                            .handle(Some(&current), &mut transport, message, browser_id.as_deref())
                            .await?;
                        connect |= op == Operation::Connect;
                        session = Some(current);
                    }
                    None => {
                        if let Some(created) = self
                            .bayeux
                            .establish(&mut transport, message, browser_id.as_deref())
                            .await?
                        {
                            session = Some(created);
                        }
                    }
                }
            }
            Ok::<_, CometError>(())
        }
        .await;

        if let Some(pending) = pending {
            pending.responded().await;
        }
        if let Err(e) = dispatched {
            return Err(abort(&mut transport, e));
        }

        let Some(session) = session else {
            transport.complete()?;
            return Ok(Outcome::Completed);
        };
        session.access().await;

        if connect {
            let timeout = session.timeout().await.unwrap_or(self.bayeux.timeout());
            {
                let mut state = session.lock().await;
                if !state.has_messages()
                    && batch_size <= 1
                    && !state.is_suspended()
                    && !state.is_disconnected()
                {
                    let (handle, suspension) = suspend::suspend(transport.connection(), timeout);
                    state.suspend(handle);
                    debug!(
                        client_id = %session.id(),
                        connection = %transport.connection(),
                        timeout_ms = timeout.as_millis() as u64,
                        "poll suspended"
                    );
                    drop(state);
                    return Ok(Outcome::Suspended(SuspendedPoll {
                        session,
                        transport,
                        suspension,
                    }));
                }
            }
            if let Err(e) = self.send_poll_reply(&mut transport) {
                return Err(abort(&mut transport, e));
            }
        }

        if let Err(e) = self.flush(&session, &mut transport).await {
            return Err(abort(&mut transport, e));
        }
        Ok(Outcome::Completed)
    }

    /// Finish a parked connection on a new sink: send the held poll reply
    /// and whatever is queued.
    pub async fn resume(&self, poll: ResumedPoll, sink: Box<dyn ReplySink>) -> CometResult<()> {
        let ResumedPoll {
            session,
            mut transport,
            resumption,
        } = poll;
        transport.rebind(sink);
        session.access().await;
        debug!(
            client_id = %session.id(),
            connection = %transport.connection(),
            ?resumption,
            "poll resumed"
        );

        if let Some(mut reply) = transport.take_poll_reply() {
            match resumption {
                Resumption::Woken(WakeReason::Disconnected) => reply.advice = Some(Advice::none()),
                Resumption::Abandoned => reply.advice = Some(Advice::handshake()),
                _ => {}
            }
            if let Err(e) = self.bayeux.send_reply(&mut transport, reply) {
                return Err(abort(&mut transport, e));
            }
        }

        if let Err(e) = self.flush(&session, &mut transport).await {
            return Err(abort(&mut transport, e));
        }
        Ok(())
    }

    fn send_poll_reply(&self, transport: &mut Transport) -> CometResult<()> {
        match transport.take_poll_reply() {
            Some(reply) => self.bayeux.send_reply(transport, reply),
            None => Ok(()),
        }
    }

    /// Send the mailbox in order, complete the reply, and only then clear the
    /// mailbox.
    async fn flush(&self, session: &ClientSession, transport: &mut Transport) -> CometResult<()> {
        {
            let mut state = session.lock().await;
            state.clear_suspension(transport.connection());
            let mut sent = 0usize;
            for queued in state.mailbox() {
                if let Some(out) = self.bayeux.extensions().apply_outgoing(Message::clone(queued)) {
                    transport.send(&out)?;
                    sent += 1;
                }
            }
            transport.complete()?;
            state.clear_mailbox();
            debug!(client_id = %session.id(), connection = %transport.connection(), sent, "flushed");
        }
        if transport.resume_poll() && transport.is_poll() && session.resume().await {
            debug!(client_id = %session.id(), "superseded parked poll");
        }
        Ok(())
    }
}

/// Complete a failed connection and hand back the error that failed it.
fn abort(transport: &mut Transport, error: CometError) -> CometError {
    warn!(connection = %transport.connection(), error = %error, "reply aborted");
    if let Err(e) = transport.complete() {
        debug!(connection = %transport.connection(), error = %e, "close after failure");
    }
    error
}
