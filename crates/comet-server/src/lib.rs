//! comet-server: Bayeux long-poll server.
//!
//! Holds client sessions and their mailboxes, dispatches Bayeux messages,
//! parks idle poll connections until a message arrives or they time out,
//! and serves all of it over HTTP.

pub mod bayeux;
pub mod channels;
pub mod config;
pub mod longpoll;
pub mod server;
pub mod session;
pub mod suspend;
pub mod transport;

pub use bayeux::{Bayeux, BayeuxOptions};
pub use config::ServerConfig;
pub use longpoll::{LongPollController, Outcome, PollRequest, ResumedPoll, SuspendedPoll};
pub use server::CometServer;
