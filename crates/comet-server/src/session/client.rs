//! Per-client session state.
//!
//! Everything that the long-poll controller and the publish path race on
//! (mailbox, suspended connection, pending-response count, liveness) lives
//! behind a single lock, so "mailbox is empty, so suspend" and "enqueue,
//! then wake the suspended poll" can never interleave.

use crate::suspend::{ConnectionId, ResumeHandle, WakeReason};
use comet_core::MessageRef;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// Lock-protected part of a [`ClientSession`].
#[derive(Debug)]
pub struct SessionState {
    browser_id: Option<String>,
    /// Pending messages, oldest first.
    mailbox: VecDeque<MessageRef>,
    /// Client-requested poll timeout.
    timeout: Option<Duration>,
    last_access: Instant,
    /// Connections currently expected to answer; while non-zero, deliveries
    /// do not wake the suspended poll.
    response_pending: u32,
    suspended: Option<ResumeHandle>,
    disconnected: bool,
}

impl SessionState {
    pub fn has_messages(&self) -> bool {
        !self.mailbox.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.mailbox.len()
    }

    /// Pending messages in delivery order.
    pub fn mailbox(&self) -> impl Iterator<Item = &MessageRef> {
        self.mailbox.iter()
    }

    /// Drop every pending message, releasing the mailbox's references.
    pub fn clear_mailbox(&mut self) {
        self.mailbox.clear();
    }

    /// Whether a live connection is parked on this session.
    pub fn is_suspended(&self) -> bool {
        self.suspended
            .as_ref()
            .is_some_and(|handle| !handle.is_abandoned())
    }

    /// Park a connection. Replaces a handle whose connection is already gone.
    pub fn suspend(&mut self, handle: ResumeHandle) {
        debug_assert!(!self.is_suspended(), "second live suspension");
        self.suspended = Some(handle);
    }

    /// Forget the parked handle if it belongs to `connection`.
    pub fn clear_suspension(&mut self, connection: ConnectionId) {
        if self
            .suspended
            .as_ref()
            .is_some_and(|handle| handle.connection() == connection)
        {
            self.suspended = None;
        }
    }

    /// Wake the parked connection, if any. Returns `true` if one was woken.
    pub fn wake(&mut self, reason: WakeReason) -> bool {
        match self.suspended.take() {
            Some(handle) => handle.wake(reason),
            None => false,
        }
    }

    pub fn is_response_pending(&self) -> bool {
        self.response_pending > 0
    }

    pub fn browser_id(&self) -> Option<&str> {
        self.browser_id.as_deref()
    }

    /// Client-requested poll timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}

/// A connected Bayeux client.
#[derive(Debug)]
pub struct ClientSession {
    id: String,
    state: Mutex<SessionState>,
}

impl ClientSession {
    pub fn new(id: String, browser_id: Option<String>) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                browser_id,
                mailbox: VecDeque::new(),
                timeout: None,
                last_access: Instant::now(),
                response_pending: 0,
                suspended: None,
                disconnected: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Take the session's exclusive lock.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Queue a message for this client and wake its suspended poll unless a
    /// reply is already on its way.
    ///
    /// Returns `false` if the session is disconnected and the message was
    /// dropped.
    pub async fn deliver(&self, message: MessageRef) -> bool {
        let mut state = self.state.lock().await;
        if state.disconnected {
            return false;
        }
        state.mailbox.push_back(message);
        if !state.is_response_pending() && state.wake(WakeReason::Delivery) {
            debug!(client_id = %self.id, "woke suspended poll");
        }
        true
    }

    /// A connection for this client is about to reply; hold wakes until
    /// [`responded`](Self::responded).
    pub async fn response_pending(&self) {
        self.state.lock().await.response_pending += 1;
    }

    pub async fn responded(&self) {
        let mut state = self.state.lock().await;
        state.response_pending = state.response_pending.saturating_sub(1);
    }

    /// Record client activity.
    pub async fn access(&self) {
        self.state.lock().await.last_access = Instant::now();
    }

    /// Release any parked poll so the session may suspend again.
    ///
    /// Returns `true` if another connection was parked and got woken.
    pub async fn resume(&self) -> bool {
        self.state.lock().await.wake(WakeReason::Superseded)
    }

    /// Mark the session gone: drop its mailbox and release any parked poll.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.disconnected = true;
        state.mailbox.clear();
        state.wake(WakeReason::Disconnected);
    }

    pub async fn timeout(&self) -> Option<Duration> {
        self.state.lock().await.timeout()
    }

    pub async fn set_timeout(&self, timeout: Duration) {
        self.state.lock().await.timeout = Some(timeout);
    }

    pub async fn browser_id(&self) -> Option<String> {
        self.state.lock().await.browser_id().map(str::to_string)
    }

    /// Adopt `browser_id` if it differs from the stored one.
    pub async fn set_browser_id(&self, browser_id: &str) {
        let mut state = self.state.lock().await;
        if state.browser_id.as_deref() != Some(browser_id) {
            state.browser_id = Some(browser_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend::{suspend, Resumption};
    use comet_core::Message;

    fn message(channel: &str) -> MessageRef {
        MessageRef::new(Message::new(channel))
    }

    #[tokio::test]
    async fn delivery_keeps_fifo_order() {
        let session = ClientSession::new("c1".into(), None);
        for ch in ["/a", "/b", "/c"] {
            assert!(session.deliver(message(ch)).await);
        }

        let state = session.lock().await;
        let channels: Vec<_> = state.mailbox().map(|m| m.channel.clone()).collect();
        assert_eq!(channels, ["/a", "/b", "/c"]);
    }

    #[tokio::test]
    async fn delivery_wakes_suspended_poll() {
        let session = ClientSession::new("c1".into(), None);
        let (handle, suspension) = suspend(ConnectionId::next(), Duration::from_secs(5));
        session.lock().await.suspend(handle);

        session.deliver(message("/a")).await;

        assert_eq!(
            suspension.resumed().await,
            Resumption::Woken(WakeReason::Delivery)
        );
        assert!(!session.lock().await.is_suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_response_holds_the_wake() {
        let session = ClientSession::new("c1".into(), None);
        let (handle, suspension) = suspend(ConnectionId::next(), Duration::from_secs(1));
        session.lock().await.suspend(handle);

        session.response_pending().await;
        session.deliver(message("/a")).await;
        session.responded().await;

        assert_eq!(suspension.resumed().await, Resumption::TimedOut);
        assert_eq!(session.lock().await.queued(), 1);
    }

    #[tokio::test]
    async fn abandoned_handle_does_not_count_as_suspended() {
        let session = ClientSession::new("c1".into(), None);
        let (handle, suspension) = suspend(ConnectionId::next(), Duration::from_secs(5));
        session.lock().await.suspend(handle);
        assert!(session.lock().await.is_suspended());

        drop(suspension);
        assert!(!session.lock().await.is_suspended());
    }

    #[tokio::test]
    async fn clear_suspension_only_matches_own_connection() {
        let session = ClientSession::new("c1".into(), None);
        let conn = ConnectionId::next();
        let (handle, _suspension) = suspend(conn, Duration::from_secs(5));
        let mut state = session.lock().await;
        state.suspend(handle);

        state.clear_suspension(ConnectionId::next());
        assert!(state.is_suspended());
        state.clear_suspension(conn);
        assert!(!state.is_suspended());
    }

    #[tokio::test]
    async fn disconnect_drops_mailbox_and_wakes() {
        let session = ClientSession::new("c1".into(), None);
        let queued = message("/a");
        let held = queued.acquire();
        session.deliver(queued).await;
        let (handle, suspension) = suspend(ConnectionId::next(), Duration::from_secs(5));
        session.lock().await.suspend(handle);

        session.disconnect().await;

        assert_eq!(held.refs(), 1);
        assert_eq!(
            suspension.resumed().await,
            Resumption::Woken(WakeReason::Disconnected)
        );
        assert!(!session.deliver(message("/b")).await);
        assert!(session.lock().await.is_disconnected());
    }

    #[tokio::test]
    async fn browser_id_is_replaced_when_different() {
        let session = ClientSession::new("c1".into(), Some("b1".into()));
        session.set_browser_id("b2").await;
        assert_eq!(session.browser_id().await.as_deref(), Some("b2"));
    }
}
