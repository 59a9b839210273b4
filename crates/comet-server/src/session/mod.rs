//! Client sessions: per-client mailbox and suspension state, and the store
//! that maps client ids to them.

pub mod client;
pub mod store;

pub use client::{ClientSession, SessionState};
pub use store::{SessionInfo, SessionStore};
