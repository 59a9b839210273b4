//! Dispatch core: resolves inbound messages to client sessions and applies
//! their protocol-level effects.
//!
//! Owns the `clientId` → session map, channel subscriptions, the extension
//! chain and the message pool. The long-poll controller drives it one
//! message at a time and uses the returned [`Operation`] to decide whether a
//! poll was established.

use crate::channels::ChannelRegistry;
use crate::config::ServerConfig;
use crate::session::{ClientSession, SessionStore};
use crate::transport::Transport;
use comet_core::channel::{self, Operation};
use comet_core::transport::SUPPORTED_CONNECTION_TYPES;
use comet_core::{
    generate_id, Advice, CometError, CometResult, ExtensionChain, Message, MessagePool,
    ReplySink, TimestampExtension, TransportKind, BAYEUX_VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Recycled message allocations kept around for publish fan-out.
const POOL_CAPACITY: usize = 1024;

/// Server-wide protocol settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct BayeuxOptions {
    /// Poll timeout for sessions that did not ask for their own.
    pub timeout: Duration,
    pub interval: Duration,
    pub max_interval: Duration,
    pub max_sessions: usize,
}

impl From<&ServerConfig> for BayeuxOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            timeout: config.timeout,
            interval: config.interval,
            max_interval: config.max_interval,
            max_sessions: config.max_sessions,
        }
    }
}

impl Default for BayeuxOptions {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Build a failure reply in the Bayeux `code:args:message` error format.
fn failure(request: &Message, code: u16, arg: &str, text: &str) -> Message {
    let mut reply = Message::reply_to(request);
    reply.client_id = request.client_id.clone();
    reply.successful = Some(false);
    reply.error = Some(format!("{code}:{arg}:{text}"));
    reply
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub struct Bayeux {
    sessions: SessionStore,
    channels: ChannelRegistry,
    extensions: ExtensionChain,
    pool: MessagePool,
    options: BayeuxOptions,
}

impl Bayeux {
    pub fn new(options: BayeuxOptions, extensions: ExtensionChain) -> Self {
        Self {
            sessions: SessionStore::new(options.max_sessions),
            channels: ChannelRegistry::new(),
            extensions,
            pool: MessagePool::new(POOL_CAPACITY),
            options,
        }
    }

    /// Build from server configuration, registering configured extensions.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut extensions = ExtensionChain::new();
        if config.timestamp_extension {
            extensions.register(Arc::new(TimestampExtension));
        }
        info!(extensions = ?extensions, "extensions registered");
        Self::new(BayeuxOptions::from(config), extensions)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn extensions(&self) -> &ExtensionChain {
        &self.extensions
    }

    /// Server default poll timeout.
    pub fn timeout(&self) -> Duration {
        self.options.timeout
    }

    /// Look up the session a message belongs to.
    pub fn session(&self, client_id: Option<&str>) -> Option<Arc<ClientSession>> {
        client_id.and_then(|id| self.sessions.get(id))
    }

    /// Create the transport for a new connection. Fails on an unusable
    /// JSONP callback.
    pub fn new_transport(
        &self,
        jsonp: Option<&str>,
        sink: Box<dyn ReplySink>,
    ) -> CometResult<Transport> {
        Ok(Transport::new(TransportKind::negotiate(jsonp)?, sink))
    }

    /// Handle one inbound message and return the operation it performed.
    ///
    /// With no session the message must be a handshake; anything else is
    /// answered with an unknown-client failure.
    pub async fn handle(
        &self,
        session: Option<&Arc<ClientSession>>,
        transport: &mut Transport,
        message: Message,
        browser_id: Option<&str>,
    ) -> CometResult<Operation> {
        let operation = Operation::resolve(&message.channel);
        match session {
            None => {
                self.establish(transport, message, browser_id).await?;
            }
            Some(session) => self.dispatch(session, operation, transport, message).await?,
        }
        Ok(operation)
    }

    /// Handle a message that matched no session. Returns the session a
    /// successful handshake created.
    pub async fn establish(
        &self,
        transport: &mut Transport,
        message: Message,
        browser_id: Option<&str>,
    ) -> CometResult<Option<Arc<ClientSession>>> {
        if Operation::resolve(&message.channel) != Operation::Handshake {
            let client_id = message.client_id.clone().unwrap_or_default();
            debug!(client_id = %client_id, channel = %message.channel, "unknown client");
            let mut reply = failure(&message, 402, &client_id, "Unknown client");
            reply.advice = Some(Advice::handshake());
            self.send_reply(transport, reply)?;
            return Ok(None);
        }
        self.handshake(transport, &message, browser_id).await
    }

    async fn handshake(
        &self,
        transport: &mut Transport,
        message: &Message,
        browser_id: Option<&str>,
    ) -> CometResult<Option<Arc<ClientSession>>> {
        let browser_id = browser_id.map(str::to_string).unwrap_or_else(generate_id);
        let session = Arc::new(ClientSession::new(generate_id(), Some(browser_id)));

        if let Err(e) = self.sessions.insert(Arc::clone(&session)) {
            warn!(error = %e, "handshake rejected");
            let reply = failure(message, 503, "", "Too many sessions");
            self.send_reply(transport, reply)?;
            return Ok(None);
        }

        let mut reply = Message::reply_to(message);
        reply.client_id = Some(session.id().to_string());
        reply.successful = Some(true);
        reply.version = Some(BAYEUX_VERSION.to_string());
        reply.supported_connection_types = Some(
            SUPPORTED_CONNECTION_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
        );
        reply.advice = Some(Advice::retry(
            millis(self.options.interval),
            millis(self.options.timeout),
        ));
        self.send_reply(transport, reply)?;
        Ok(Some(session))
    }

    async fn dispatch(
        &self,
        session: &Arc<ClientSession>,
        operation: Operation,
        transport: &mut Transport,
        message: Message,
    ) -> CometResult<()> {
        match operation {
            Operation::Handshake => {
                let browser_id = session.browser_id().await;
                self.handshake(transport, &message, browser_id.as_deref())
                    .await
                    .map(|_| ())
            }
            Operation::Connect => self.connect(session, transport, &message).await,
            Operation::Disconnect => {
                self.disconnect(session.id()).await;
                let mut reply = Message::reply_to(&message);
                reply.client_id = Some(session.id().to_string());
                reply.successful = Some(true);
                self.send_reply(transport, reply)
            }
            Operation::Subscribe | Operation::Unsubscribe => {
                self.subscription(session, operation, transport, &message)
                    .await
            }
            Operation::UnknownMeta => {
                let reply = failure(&message, 404, &message.channel, "Unknown channel");
                self.send_reply(transport, reply)
            }
            Operation::Service => self.acknowledge(transport, &message),
            Operation::Publish => {
                if !channel::is_valid(&message.channel) || message.channel.contains('*') {
                    let reply = failure(&message, 400, &message.channel, "Invalid channel");
                    return self.send_reply(transport, reply);
                }
                let delivered = self.publish(&message).await;
                debug!(channel = %message.channel, delivered, "published");
                self.acknowledge(transport, &message)
            }
        }
    }

    async fn connect(
        &self,
        session: &Arc<ClientSession>,
        transport: &mut Transport,
        message: &Message,
    ) -> CometResult<()> {
        if let Some(ms) = message.advice.as_ref().and_then(|a| a.timeout) {
            session.set_timeout(Duration::from_millis(ms)).await;
        }
        let timeout = session.timeout().await.unwrap_or(self.options.timeout);

        let mut reply = Message::reply_to(message);
        reply.client_id = Some(session.id().to_string());
        reply.successful = Some(true);
        reply.advice = Some(Advice::retry(millis(self.options.interval), millis(timeout)));
        transport.set_poll_reply(reply);
        Ok(())
    }

    async fn subscription(
        &self,
        session: &Arc<ClientSession>,
        operation: Operation,
        transport: &mut Transport,
        message: &Message,
    ) -> CometResult<()> {
        let Some(pattern) = message.subscription.as_deref() else {
            let reply = failure(message, 400, "", "Missing subscription");
            return self.send_reply(transport, reply);
        };
        if !channel::is_valid(pattern) || Operation::resolve(pattern).is_meta() {
            let reply = failure(message, 403, pattern, "Invalid subscription");
            return self.send_reply(transport, reply);
        }

        // Held across the registry update so a concurrent disconnect either
        // sees this subscription in its sweep of the registry or rejects it.
        let state = session.lock().await;
        if state.is_disconnected() {
            drop(state);
            let mut reply = failure(message, 402, session.id(), "Unknown client");
            reply.advice = Some(Advice::handshake());
            return self.send_reply(transport, reply);
        }
        if operation == Operation::Subscribe {
            self.channels.subscribe(pattern, session.id()).await;
        } else {
            self.channels.unsubscribe(pattern, session.id()).await;
        }
        drop(state);

        let mut reply = Message::reply_to(message);
        reply.client_id = Some(session.id().to_string());
        reply.subscription = Some(pattern.to_string());
        reply.successful = Some(true);
        self.send_reply(transport, reply)
    }

    fn acknowledge(&self, transport: &mut Transport, message: &Message) -> CometResult<()> {
        let mut reply = Message::reply_to(message);
        reply.successful = Some(true);
        self.send_reply(transport, reply)
    }

    /// Run a reply through the extension chain and send it.
    pub fn send_reply(&self, transport: &mut Transport, reply: Message) -> CometResult<()> {
        match self.extensions.apply_outgoing(reply) {
            Some(out) => transport.send(&out),
            None => Ok(()),
        }
    }

    /// Deliver a message to every subscriber of its channel. Returns the
    /// number of mailboxes it reached.
    pub async fn publish(&self, message: &Message) -> usize {
        let recipients = self.channels.subscribers(&message.channel).await;
        if recipients.is_empty() {
            return 0;
        }

        let mut delivery = self.pool.take();
        delivery.channel.push_str(&message.channel);
        delivery.id = message.id.clone();
        delivery.data = message.data.clone();
        let shared = self.pool.share(delivery);

        let mut delivered = 0;
        for client_id in recipients {
            if let Some(session) = self.sessions.get(&client_id) {
                if session.deliver(shared.acquire()).await {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Queue a message for one client directly.
    pub async fn deliver(&self, client_id: &str, message: Message) -> CometResult<()> {
        let session = self.sessions.require(client_id)?;
        if !session.deliver(self.pool.share(message)).await {
            return Err(CometError::SessionNotFound(client_id.to_string()));
        }
        Ok(())
    }

    /// Tear a session down: forget it, drop its subscriptions and mailbox,
    /// and release any suspended poll.
    ///
    /// The session is marked disconnected before its subscriptions are
    /// dropped, so a subscribe racing with this cannot outlive it.
    pub async fn disconnect(&self, client_id: &str) -> bool {
        let Some(session) = self.sessions.remove(client_id) else {
            return false;
        };
        session.disconnect().await;
        self.channels.unsubscribe_all(client_id).await;
        true
    }

    /// Disconnect sessions that stopped polling. Returns their ids.
    ///
    /// A session may go quiet for its own poll timeout plus `max_interval`.
    pub async fn sweep(&self) -> Vec<String> {
        let mut removed = Vec::new();
        let idle = self
            .sessions
            .idle(self.options.timeout, self.options.max_interval)
            .await;
        for session in idle {
            warn!(client_id = %session.id(), "session expired (idle)");
            if self.disconnect(session.id()).await {
                removed.push(session.id().to_string());
            }
        }
        removed
    }
}
