//! Pub/sub transport abstraction for BusGrid sessions.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::EnvError;
use crate::topic::TopicFilter;
use crate::types::{ClientId, ConnectionProperties, SessionEvent};

/// Client side of a pub/sub provider, as seen by one session.
///
/// # Implementations
///
/// - **Production**: wraps a broker SDK session object
/// - **Simulation**: `busgrid_sim::SimTransport`, channel-based with fault injection
///
/// # Event Flow
///
/// ```text
/// Session                    Transport                   Broker
///   |-- connect(props) -------->|                          |
///   |                           |-- [handshake] ---------->|
///   |                           |<-------------------------|
///   |<-- recv() -> Up ----------|                          |
///   |-- subscribe("a/b/>") ---->|------------------------->|
///   |<-- recv() -> SubscriptionOk / SubscriptionError -----|
///   |<-- recv() -> Message ... -|<-- publish --------------|
/// ```
///
/// Request methods must not block; they only fail synchronously when the
/// request cannot even be issued.
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    /// Starts connecting with the given properties.
    ///
    /// # Returns
    /// * `Ok(())` - Attempt started; expect `Up` or `ConnectFailed`
    /// * `Err(EnvError)` - The attempt could not be started at all
    fn connect(&self, props: &ConnectionProperties) -> Result<(), EnvError>;

    /// Requests a subscription to `filter`.
    ///
    /// The provider answers with `SubscriptionOk` or `SubscriptionError`
    /// tagged with `correlation_key`; if no acknowledgement arrives within
    /// `timeout` the provider reports `SubscriptionError` itself.
    fn subscribe(
        &self,
        filter: &TopicFilter,
        correlation_key: &str,
        timeout: Duration,
    ) -> Result<(), EnvError>;

    /// Starts an orderly disconnect. A `Disconnected` event follows.
    fn disconnect(&self);

    /// Releases the underlying connection handle.
    ///
    /// A later `connect()` acquires a fresh handle.
    fn dispose(&self);

    /// Receives the next event for this session.
    ///
    /// # Returns
    /// * `Some(event)` - An event was delivered
    /// * `None` - The event channel closed (provider shut down)
    async fn recv(&self) -> Option<SessionEvent>;

    /// Returns the next already-delivered event without waiting.
    fn try_recv(&self) -> Option<SessionEvent>;

    /// Returns this client's ID.
    fn client_id(&self) -> ClientId;
}

/// Publishing side of a pub/sub provider.
pub trait TopicPublisher: Send + Sync {
    /// Publishes `payload` to a concrete topic.
    ///
    /// # Returns
    /// Number of subscribers the message was routed to. Delivery is
    /// best-effort; zero is not an error.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize, EnvError>;
}
