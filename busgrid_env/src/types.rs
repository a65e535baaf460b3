//! Common types for the BusGrid transport abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a transport client.
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Creates a new random ClientId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic ClientId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Inputs needed to open a session with a broker.
///
/// Supplied by the caller; nothing in BusGrid reads credentials itself.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    /// Broker endpoint, e.g. `wss://broker.example:443`
    pub host: String,

    /// Message VPN (virtual broker namespace)
    pub vpn_name: String,

    /// Client username
    pub username: String,

    /// Client password
    pub password: String,
}

impl ConnectionProperties {
    pub fn new(
        host: impl Into<String>,
        vpn_name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            vpn_name: vpn_name.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

// Hand-written so the password never reaches a log line.
impl std::fmt::Debug for ConnectionProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProperties")
            .field("host", &self.host)
            .field("vpn_name", &self.vpn_name)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A message delivered on a subscribed topic.
///
/// The payload is opaque bytes; decoding belongs to the receiving engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Concrete topic the message was published to
    pub topic: String,

    /// The raw payload bytes
    pub payload: Vec<u8>,

    /// Publisher-assigned application message ID, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_message_id: Option<String>,
}

impl InboundMessage {
    /// Creates a message from topic and payload bytes.
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            application_message_id: None,
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Everything a transport can report to the session that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection established and ready for subscriptions
    Up,

    /// Connection attempt failed; carries the provider's diagnostic
    ConnectFailed { info: String },

    /// Connection went down (remote drop or after `disconnect()`)
    Disconnected,

    /// Subscription acknowledged
    SubscriptionOk { correlation_key: String },

    /// Subscription rejected or acknowledgement timed out
    SubscriptionError { correlation_key: String, info: String },

    /// Message received on a subscribed topic
    Message(InboundMessage),
}

impl SessionEvent {
    /// Short event name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Up => "up",
            SessionEvent::ConnectFailed { .. } => "connect_failed",
            SessionEvent::Disconnected => "disconnected",
            SessionEvent::SubscriptionOk { .. } => "subscription_ok",
            SessionEvent::SubscriptionError { .. } => "subscription_error",
            SessionEvent::Message(_) => "message",
        }
    }
}
