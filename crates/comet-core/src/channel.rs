//! Channel names and the operation each inbound message performs.

pub const META_HANDSHAKE: &str = "/meta/handshake";
pub const META_CONNECT: &str = "/meta/connect";
pub const META_DISCONNECT: &str = "/meta/disconnect";
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";

const META_PREFIX: &str = "/meta/";
const SERVICE_PREFIX: &str = "/service/";

/// What an inbound message asks the server to do.
///
/// Resolved once per message from its channel; everything downstream
/// matches on this instead of comparing channel strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Handshake,
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
    /// A `/meta/*` channel the server does not implement.
    UnknownMeta,
    /// A `/service/**` message: acknowledged, never broadcast.
    Service,
    Publish,
}

const META_OPERATIONS: &[(&str, Operation)] = &[
    (META_HANDSHAKE, Operation::Handshake),
    (META_CONNECT, Operation::Connect),
    (META_DISCONNECT, Operation::Disconnect),
    (META_SUBSCRIBE, Operation::Subscribe),
    (META_UNSUBSCRIBE, Operation::Unsubscribe),
];

impl Operation {
    pub fn resolve(channel: &str) -> Self {
        if channel.starts_with(META_PREFIX) {
            return META_OPERATIONS
                .iter()
                .find(|(name, _)| *name == channel)
                .map(|(_, op)| *op)
                .unwrap_or(Operation::UnknownMeta);
        }
        if channel.starts_with(SERVICE_PREFIX) {
            return Operation::Service;
        }
        Operation::Publish
    }

    /// Whether the message travels on a `/meta/*` channel.
    pub fn is_meta(self) -> bool {
        matches!(
            self,
            Operation::Handshake
                | Operation::Connect
                | Operation::Disconnect
                | Operation::Subscribe
                | Operation::Unsubscribe
                | Operation::UnknownMeta
        )
    }
}

/// Whether a subscription pattern matches a concrete channel.
///
/// `/a/*` matches exactly one trailing segment, `/a/**` matches one or more.
pub fn matches(pattern: &str, channel: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return channel
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/'));
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return channel.strip_prefix(prefix).is_some_and(|rest| {
            rest.len() > 1 && rest.starts_with('/') && !rest[1..].contains('/')
        });
    }
    pattern == channel
}

/// Whether a channel name is acceptable as a publish or subscribe target.
pub fn is_valid(channel: &str) -> bool {
    channel.len() > 1 && channel.starts_with('/') && !channel.contains("//")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_meta_channels() {
        assert_eq!(Operation::resolve("/meta/handshake"), Operation::Handshake);
        assert_eq!(Operation::resolve("/meta/connect"), Operation::Connect);
        assert_eq!(Operation::resolve("/meta/disconnect"), Operation::Disconnect);
        assert_eq!(Operation::resolve("/meta/subscribe"), Operation::Subscribe);
        assert_eq!(Operation::resolve("/meta/unsubscribe"), Operation::Unsubscribe);
        assert_eq!(Operation::resolve("/meta/bogus"), Operation::UnknownMeta);
    }

    #[test]
    fn resolves_service_and_publish() {
        assert_eq!(Operation::resolve("/service/echo"), Operation::Service);
        assert_eq!(Operation::resolve("/chat/room"), Operation::Publish);
        assert!(!Operation::Publish.is_meta());
        assert!(Operation::Connect.is_meta());
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches("/chat", "/chat"));
        assert!(!matches("/chat", "/chat/a"));

        assert!(matches("/chat/*", "/chat/a"));
        assert!(!matches("/chat/*", "/chat/a/b"));
        assert!(!matches("/chat/*", "/chat"));

        assert!(matches("/chat/**", "/chat/a"));
        assert!(matches("/chat/**", "/chat/a/b"));
        assert!(!matches("/chat/**", "/chatter/a"));
    }

    #[test]
    fn channel_validity() {
        assert!(is_valid("/a/b"));
        assert!(!is_valid("/"));
        assert!(!is_valid("a/b"));
        assert!(!is_valid("/a//b"));
    }
}
