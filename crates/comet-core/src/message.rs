//! Bayeux wire messages and their reference-counted, poolable handles.
//!
//! A [`Message`] is a plain value while it is being built or dispatched by a
//! single connection. Once it is queued for delivery it is wrapped in a
//! [`MessageRef`], which is immutable and counts its holders: every mailbox
//! and every in-flight delivery owns exactly one reference, and dropping the
//! handle releases it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Reconnect advice sent to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Advice {
    pub fn retry(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            reconnect: Some("retry".into()),
            interval: Some(interval_ms),
            timeout: Some(timeout_ms),
        }
    }

    pub fn handshake() -> Self {
        Self {
            reconnect: Some("handshake".into()),
            ..Self::default()
        }
    }

    pub fn none() -> Self {
        Self {
            reconnect: Some("none".into()),
            ..Self::default()
        }
    }
}

/// A single Bayeux message.
///
/// Fields the server does not interpret are kept in `fields` and written
/// back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Correlation id; clients send strings or numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Message {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Start a reply to `request`: same channel and correlation id.
    pub fn reply_to(request: &Message) -> Self {
        Self {
            channel: request.channel.clone(),
            id: request.id.clone(),
            ..Self::default()
        }
    }

    /// Stamp an extra top-level field onto this message.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.put(key, value);
        self
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Look up an extra top-level field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Whether this is a reply that reports failure.
    pub fn is_failure(&self) -> bool {
        self.successful == Some(false)
    }

    /// Reset every field while keeping allocations for reuse.
    fn clear(&mut self) {
        self.channel.clear();
        self.client_id = None;
        self.id = None;
        self.data = None;
        self.ext = None;
        self.timestamp = None;
        self.successful = None;
        self.error = None;
        self.subscription = None;
        self.advice = None;
        self.connection_type = None;
        self.supported_connection_types = None;
        self.version = None;
        self.minimum_version = None;
        self.fields.clear();
    }
}

struct Shared {
    message: Message,
    refs: AtomicUsize,
    pool: Option<MessagePool>,
}

/// A counted, read-only handle to a queued message.
///
/// `Clone` acquires a new reference; dropping (or [`release`](Self::release))
/// gives it back. When the last reference of a pooled message goes away the
/// message is returned to its [`MessagePool`].
pub struct MessageRef {
    shared: Arc<Shared>,
    released: bool,
}

impl MessageRef {
    /// Wrap a message that does not belong to any pool.
    pub fn new(message: Message) -> Self {
        Self::with_pool(message, None)
    }

    fn with_pool(message: Message, pool: Option<MessagePool>) -> Self {
        Self {
            shared: Arc::new(Shared {
                message,
                refs: AtomicUsize::new(1),
                pool,
            }),
            released: false,
        }
    }

    /// Take an additional reference to the same message.
    pub fn acquire(&self) -> MessageRef {
        self.shared.refs.fetch_add(1, Ordering::Relaxed);
        MessageRef {
            shared: Arc::clone(&self.shared),
            released: false,
        }
    }

    /// Give this reference back. Returns `true` if it was the last one.
    pub fn release(mut self) -> bool {
        self.decrement()
    }

    /// Number of live references.
    pub fn refs(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }

    fn decrement(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        if self.shared.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }

        // Another holder may still be between its decrement and dropping its
        // Arc; recycling is skipped in that case and the message is freed.
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            if let Some(pool) = shared.pool.take() {
                pool.recycle(std::mem::take(&mut shared.message));
            }
        }
        true
    }
}

impl Clone for MessageRef {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl Drop for MessageRef {
    fn drop(&mut self) {
        self.decrement();
    }
}

impl Deref for MessageRef {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.shared.message
    }
}

impl std::fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRef")
            .field("refs", &self.refs())
            .field("message", &self.shared.message)
            .finish()
    }
}

/// Bounded free list of message allocations.
#[derive(Clone)]
pub struct MessagePool {
    free: Arc<Mutex<Vec<Message>>>,
    capacity: usize,
}

impl MessagePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            capacity,
        }
    }

    /// Get an empty message, reusing a recycled one when available.
    pub fn take(&self) -> Message {
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_default()
    }

    /// Wrap a message in a counted handle that returns to this pool.
    pub fn share(&self, message: Message) -> MessageRef {
        MessageRef::with_pool(message, Some(self.clone()))
    }

    /// Number of recycled messages waiting for reuse.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn recycle(&self, mut message: Message) {
        message.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.capacity {
            free.push(message);
        }
    }
}

impl std::fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePool")
            .field("available", &self.available())
            .field("capacity", &self.capacity)
            .finish()
    }
}
