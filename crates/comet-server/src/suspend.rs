//! Cooperative suspension of poll connections.
//!
//! Suspending a connection splits it into two halves: a [`ResumeHandle`]
//! parked on the client session, and a [`Suspension`] the host engine
//! awaits. The connection resumes exactly once, when the first of these
//! happens: the handle is woken (delivery, supersession, disconnect), the
//! deadline passes, or the handle is dropped. A wake that loses the race is
//! a no-op.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Identifies one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a suspended connection was woken before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A message reached the session's mailbox.
    Delivery,
    /// Another poll connection for the same session replied.
    Superseded,
    /// The session was disconnected.
    Disconnected,
}

/// How a suspended connection came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    Woken(WakeReason),
    TimedOut,
    /// The resume handle was dropped without a wake (session discarded).
    Abandoned,
}

/// Session-side half of a suspended connection.
#[derive(Debug)]
pub struct ResumeHandle {
    connection: ConnectionId,
    tx: oneshot::Sender<WakeReason>,
}

impl ResumeHandle {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Wake the connection. Returns `false` if it already resumed or was
    /// dropped by the host.
    pub fn wake(self, reason: WakeReason) -> bool {
        self.tx.send(reason).is_ok()
    }

    /// Whether the host side is gone, i.e. the connection already resumed
    /// or was closed abruptly.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Host-side half of a suspended connection.
#[derive(Debug)]
pub struct Suspension {
    rx: oneshot::Receiver<WakeReason>,
    deadline: Instant,
}

impl Suspension {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait until the connection is woken or its deadline passes.
    pub async fn resumed(self) -> Resumption {
        match tokio::time::timeout_at(self.deadline, self.rx).await {
            Ok(Ok(reason)) => Resumption::Woken(reason),
            Ok(Err(_)) => Resumption::Abandoned,
            Err(_) => Resumption::TimedOut,
        }
    }
}

/// Suspend `connection` for at most `timeout`.
pub fn suspend(connection: ConnectionId, timeout: Duration) -> (ResumeHandle, Suspension) {
    let (tx, rx) = oneshot::channel();
    (
        ResumeHandle { connection, tx },
        Suspension {
            rx,
            deadline: Instant::now() + timeout,
        },
    )
}
