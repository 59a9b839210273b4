//! comet-core: Shared protocol library for the comet long-poll server.
//!
//! Provides Bayeux message types with reference-counted delivery handles,
//! the JSON batch codec, channel/operation resolution, the extension chain,
//! and the transport contracts the long-poll core is written against.

pub mod channel;
pub mod codec;
pub mod error;
pub mod extension;
pub mod identity;
pub mod message;
pub mod transport;

// Re-export commonly used items at crate root.
pub use channel::Operation;
pub use codec::{batch_decode, batch_encode, jsonp_encode};
pub use error::{CometError, CometResult};
pub use extension::{Extension, ExtensionChain, TimestampExtension};
pub use identity::generate_id;
pub use message::{Advice, Message, MessagePool, MessageRef};
pub use transport::{ReplySink, TransportKind};

/// Bayeux protocol version spoken by this server.
pub const BAYEUX_VERSION: &str = "1.0";
