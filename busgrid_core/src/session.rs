//! The Session Lifecycle Controller.
//!
//! Drives one client connection through its lifecycle and feeds inbound
//! cell snapshots into the [`StateMerger`].
//!
//! # State Machine
//!
//! ```text
//!                 open()                 Up (→ subscribe once)
//!  Disconnected ─────────► Connecting ───────────────────────► Connected
//!       ▲   ▲                  │                                   │
//!       │   │                  │ ConnectFailed(info)               │ Disconnected
//!       │   │ open()           ▼                                   │ (handle released)
//!       │   └────────────── Failed(info)                           │
//!       └──────────────────────────────────────────────────────────┘
//!                      close() from any state → Disconnected
//! ```
//!
//! The controller is re-entered once per transport event and never awaits
//! inside a handler. Subscription failures leave the session Connected
//! without live data. Per-message failures (bad topic, bad payload) are
//! logged and dropped; they never change the session state.

use busgrid_env::{
    ConnectionProperties, EnvError, InboundMessage, PubSubTransport, SessionEvent, TopicFilter,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::codec::{self, DecodeError};
use crate::merger::{AggregateState, StateMerger};
use crate::record::VehicleRecord;
use crate::router::{self, MalformedTopicError, PartitionKey, GRID_WILDCARD};

/// Connection status of a session, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connect attempt failed; carries the transport's diagnostic
    Failed(String),
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Failed(info) => write!(f, "Connection failed: {}", info),
        }
    }
}

/// State of the session's single wildcard subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubscriptionStatus {
    /// No subscription issued on the current connection
    #[default]
    Inactive,
    /// Issued, waiting for the acknowledgement
    Pending,
    /// Acknowledged by the broker
    Active,
    /// Rejected or timed out; the session keeps running without data
    Failed(String),
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Filter covering every grid cell (default: `buses/grid/>`)
    pub subscription: String,

    /// Correlation key attached to the subscribe request (default: `buses`)
    pub correlation_key: String,

    /// How long the transport waits for the subscribe ack (default: 10s)
    pub subscribe_timeout: Duration,

    /// Forget all cells when re-entering Connected after a drop (default: false)
    ///
    /// When false the view keeps every cell it had before the drop until a
    /// fresh update replaces it. `FleetPublisher` announces an emptied cell
    /// only once, so a cell that empties while the session is offline keeps
    /// showing its old vehicles indefinitely. Set this when stale vehicles
    /// are worse than a briefly empty map.
    pub clear_on_reconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            subscription: GRID_WILDCARD.to_string(),
            correlation_key: "buses".to_string(),
            subscribe_timeout: Duration::from_secs(10),
            clear_on_reconnect: false,
        }
    }
}

impl SessionConfig {
    pub fn with_subscription(mut self, filter: impl Into<String>) -> Self {
        self.subscription = filter.into();
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn with_clear_on_reconnect(mut self, clear: bool) -> Self {
        self.clear_on_reconnect = clear;
        self
    }
}

/// Session-level errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connect attempt could not be started
    #[error("Connect failure: {0}")]
    ConnectFailure(String),

    /// Request not valid in the current state
    #[error("Cannot {request} while {state}")]
    InvalidTransition {
        state: SessionState,
        request: &'static str,
    },

    /// Configured subscription is not a valid filter
    #[error("Invalid subscription filter: {0}")]
    InvalidFilter(#[source] EnvError),
}

/// Why a single inbound message was dropped.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Topic(#[from] MalformedTopicError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Counters kept over the session's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connect_attempts: u64,
    pub subscribe_calls: u64,
    pub subscribe_failures: u64,
    pub messages_applied: u64,
    pub messages_dropped: u64,
    pub topic_errors: u64,
    pub decode_errors: u64,
    pub disposals: u64,
}

/// Routes and decodes one message without touching any state.
pub fn process_message(
    message: &InboundMessage,
) -> Result<(PartitionKey, Vec<VehicleRecord>), MessageError> {
    let key = router::route(&message.topic)?;
    let records = codec::decode(&message.payload)?;
    Ok((key, records))
}

/// One client connection and the live view it maintains.
///
/// Generic over the transport so the same controller runs against a broker
/// SDK or the in-memory simulation. Dropping the session closes it.
pub struct Session<T: PubSubTransport> {
    transport: Arc<T>,
    props: ConnectionProperties,
    config: SessionConfig,
    filter: TopicFilter,

    state: SessionState,
    status_tx: watch::Sender<SessionState>,
    subscription: SubscriptionStatus,
    merger: StateMerger,

    /// A connection handle is held and must be disposed
    handle_live: bool,

    /// Reached Connected at least once (reconnect detection)
    was_connected: bool,

    stats: SessionStats,
}

impl<T: PubSubTransport> Session<T> {
    /// Creates a Disconnected session. Nothing is sent until [`open`](Self::open).
    pub fn new(
        transport: Arc<T>,
        props: ConnectionProperties,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let filter = TopicFilter::parse(&config.subscription).map_err(SessionError::InvalidFilter)?;
        let (status_tx, _rx) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            transport,
            props,
            config,
            filter,
            state: SessionState::Disconnected,
            status_tx,
            subscription: SubscriptionStatus::Inactive,
            merger: StateMerger::new(),
            handle_live: false,
            was_connected: false,
            stats: SessionStats::default(),
        })
    }

    /// Starts connecting. Valid from Disconnected or Failed.
    pub fn open(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disconnected | SessionState::Failed(_) => {}
            _ => {
                return Err(SessionError::InvalidTransition {
                    state: self.state.clone(),
                    request: "open",
                })
            }
        }

        info!(
            client = %self.transport.client_id(),
            host = %self.props.host,
            vpn = %self.props.vpn_name,
            "Opening session"
        );

        self.stats.connect_attempts += 1;
        self.handle_live = true;
        self.set_state(SessionState::Connecting);

        if let Err(e) = self.transport.connect(&self.props) {
            let info = e.to_string();
            error!(reason = %info, "Connect attempt rejected by transport");
            self.set_state(SessionState::Failed(info.clone()));
            self.release_handle();
            return Err(SessionError::ConnectFailure(info));
        }

        Ok(())
    }

    /// Closes the session from any state. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.handle_live {
            if matches!(self.state, SessionState::Connecting | SessionState::Connected) {
                self.transport.disconnect();
            }
            self.release_handle();
        }

        self.subscription = SubscriptionStatus::Inactive;
        if self.state != SessionState::Disconnected {
            self.set_state(SessionState::Disconnected);
        }
    }

    /// Handles one transport event.
    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Up => self.on_up(),
            SessionEvent::ConnectFailed { info } => self.on_connect_failed(info),
            SessionEvent::Disconnected => self.on_disconnected(),
            SessionEvent::SubscriptionOk { correlation_key } => {
                self.on_subscription_ok(&correlation_key)
            }
            SessionEvent::SubscriptionError {
                correlation_key,
                info,
            } => self.on_subscription_error(&correlation_key, info),
            SessionEvent::Message(message) => self.on_message(message),
        }
    }

    /// Handles every event already delivered by the transport.
    ///
    /// Returns the number of events handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.transport.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Handles events until the transport's event channel closes.
    pub async fn run(&mut self) {
        while let Some(event) = self.transport.recv().await {
            self.handle_event(event);
        }
        debug!("Transport event channel closed");
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn subscription(&self) -> &SubscriptionStatus {
        &self.subscription
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Observes status changes (for a UI status line).
    pub fn status(&self) -> watch::Receiver<SessionState> {
        self.status_tx.subscribe()
    }

    /// Observes the merged view after every applied update.
    pub fn aggregate(&self) -> watch::Receiver<AggregateState> {
        self.merger.subscribe()
    }

    /// Copy of the merged view.
    pub fn snapshot(&self) -> AggregateState {
        self.merger.snapshot()
    }

    /// Runs `f` against the merged view without cloning it.
    pub fn with_state<R>(&self, f: impl FnOnce(&AggregateState) -> R) -> R {
        self.merger.with_state(f)
    }

    fn on_up(&mut self) {
        if self.state != SessionState::Connecting {
            debug!(state = %self.state, "Ignoring stray up notice");
            return;
        }

        if self.was_connected && self.config.clear_on_reconnect {
            info!("Reconnected, clearing cached cells");
            self.merger.clear();
        }

        self.was_connected = true;
        self.set_state(SessionState::Connected);
        self.subscribe();
    }

    fn on_connect_failed(&mut self, info: String) {
        if self.state != SessionState::Connecting {
            debug!(state = %self.state, reason = %info, "Ignoring stray connect failure");
            return;
        }

        error!(reason = %info, "Connection failed");
        self.set_state(SessionState::Failed(info));
        self.release_handle();
    }

    fn on_disconnected(&mut self) {
        if !matches!(self.state, SessionState::Connecting | SessionState::Connected) {
            debug!(state = %self.state, "Ignoring disconnect notice");
            return;
        }

        info!("Disconnected");
        self.subscription = SubscriptionStatus::Inactive;
        self.set_state(SessionState::Disconnected);
        self.release_handle();
    }

    fn subscribe(&mut self) {
        self.stats.subscribe_calls += 1;
        self.subscription = SubscriptionStatus::Pending;

        info!(filter = %self.filter, timeout_ms = self.config.subscribe_timeout.as_millis() as u64, "Subscribing");

        if let Err(e) = self.transport.subscribe(
            &self.filter,
            &self.config.correlation_key,
            self.config.subscribe_timeout,
        ) {
            self.subscribe_failed(e.to_string());
        }
    }

    fn on_subscription_ok(&mut self, correlation_key: &str) {
        if correlation_key != self.config.correlation_key
            || self.subscription != SubscriptionStatus::Pending
        {
            debug!(correlation_key, "Ignoring unexpected subscription ack");
            return;
        }

        info!(filter = %self.filter, "Subscription active");
        self.subscription = SubscriptionStatus::Active;
    }

    fn on_subscription_error(&mut self, correlation_key: &str, info: String) {
        if correlation_key != self.config.correlation_key
            || self.subscription != SubscriptionStatus::Pending
        {
            debug!(correlation_key, reason = %info, "Ignoring unexpected subscription error");
            return;
        }

        self.subscribe_failed(info);
    }

    fn subscribe_failed(&mut self, info: String) {
        warn!(filter = %self.filter, reason = %info, "Subscription failed, session stays connected without data");
        self.stats.subscribe_failures += 1;
        self.subscription = SubscriptionStatus::Failed(info);
    }

    fn on_message(&mut self, message: InboundMessage) {
        if self.state != SessionState::Connected {
            debug!(topic = %message.topic, state = %self.state, "Dropping message outside Connected");
            self.stats.messages_dropped += 1;
            return;
        }

        match process_message(&message) {
            Ok((key, records)) => {
                self.merger.apply(key, records);
                self.stats.messages_applied += 1;
            }
            Err(e) => {
                match e {
                    MessageError::Topic(_) => self.stats.topic_errors += 1,
                    MessageError::Decode(_) => self.stats.decode_errors += 1,
                }
                self.stats.messages_dropped += 1;
                warn!(
                    topic = %message.topic,
                    bytes = message.size(),
                    payload = %codec::payload_excerpt(&message.payload),
                    error = %e,
                    "Dropping message"
                );
            }
        }
    }

    fn set_state(&mut self, next: SessionState) {
        info!(from = %self.state, to = %next, "Session state changed");
        self.state = next.clone();
        self.status_tx.send_replace(next);
    }

    /// Disposes the connection handle at most once per acquisition.
    fn release_handle(&mut self) {
        if !self.handle_live {
            return;
        }

        self.transport.dispose();
        self.handle_live = false;
        self.stats.disposals += 1;

        // Anything still queued belongs to the released handle
        let mut discarded = 0;
        while let Some(event) = self.transport.try_recv() {
            debug!(event = event.kind(), "Discarding event from released handle");
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "Discarded stale events");
        }
    }
}

impl<T: PubSubTransport> Drop for Session<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use busgrid_env::ClientId;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport double: records requests, replays queued events.
    #[derive(Default)]
    struct MockTransport {
        events: Mutex<VecDeque<SessionEvent>>,
        connects: Mutex<u32>,
        subscribes: Mutex<Vec<(String, String, Duration)>>,
        disconnects: Mutex<u32>,
        disposes: Mutex<u32>,
        refuse_connect: Option<String>,
        refuse_subscribe: Option<String>,
    }

    impl MockTransport {
        fn push(&self, event: SessionEvent) {
            self.events.lock().unwrap().push_back(event);
        }

        fn subscribe_count(&self) -> usize {
            self.subscribes.lock().unwrap().len()
        }

        fn dispose_count(&self) -> u32 {
            *self.disposes.lock().unwrap()
        }
    }

    #[async_trait]
    impl PubSubTransport for MockTransport {
        fn connect(&self, _props: &ConnectionProperties) -> Result<(), EnvError> {
            *self.connects.lock().unwrap() += 1;
            match &self.refuse_connect {
                Some(reason) => Err(EnvError::transport(reason.clone())),
                None => Ok(()),
            }
        }

        fn subscribe(
            &self,
            filter: &TopicFilter,
            correlation_key: &str,
            timeout: Duration,
        ) -> Result<(), EnvError> {
            self.subscribes
                .lock()
                .unwrap()
                .push((filter.to_string(), correlation_key.to_string(), timeout));
            match &self.refuse_subscribe {
                Some(reason) => Err(EnvError::transport(reason.clone())),
                None => Ok(()),
            }
        }

        fn disconnect(&self) {
            *self.disconnects.lock().unwrap() += 1;
        }

        fn dispose(&self) {
            *self.disposes.lock().unwrap() += 1;
        }

        async fn recv(&self) -> Option<SessionEvent> {
            self.try_recv()
        }

        fn try_recv(&self) -> Option<SessionEvent> {
            self.events.lock().unwrap().pop_front()
        }

        fn client_id(&self) -> ClientId {
            ClientId::from_seed(1)
        }
    }

    fn props() -> ConnectionProperties {
        ConnectionProperties::new("ws://localhost:8008", "default", "viewer", "secret")
    }

    fn session_with(transport: Arc<MockTransport>) -> Session<MockTransport> {
        Session::new(transport, props(), SessionConfig::default()).unwrap()
    }

    fn message(topic: &str, payload: &str) -> SessionEvent {
        SessionEvent::Message(InboundMessage::new(topic, payload.as_bytes().to_vec()))
    }

    const BUS_42: &str =
        r#"[{"id":"42","latitude":45.42,"longitude":-75.69,"route_id":"95","speed":12.3}]"#;

    fn connected(transport: &Arc<MockTransport>) -> Session<MockTransport> {
        let mut session = session_with(transport.clone());
        session.open().unwrap();
        transport.push(SessionEvent::Up);
        transport.push(SessionEvent::SubscriptionOk {
            correlation_key: "buses".into(),
        });
        session.process_pending();
        session
    }

    #[test]
    fn test_starts_disconnected() {
        let transport = Arc::new(MockTransport::default());
        let session = session_with(transport);

        assert_eq!(session.state(), &SessionState::Disconnected);
        assert!(session.snapshot().is_empty());
    }

    #[test]
    fn test_connect_failure_never_subscribes() {
        let transport = Arc::new(MockTransport::default());
        let mut session = session_with(transport.clone());

        session.open().unwrap();
        assert_eq!(session.state(), &SessionState::Connecting);

        transport.push(SessionEvent::ConnectFailed {
            info: "401 Unauthorized".into(),
        });
        session.process_pending();

        assert_eq!(session.state(), &SessionState::Failed("401 Unauthorized".into()));
        assert_eq!(session.state().to_string(), "Connection failed: 401 Unauthorized");
        assert_eq!(transport.subscribe_count(), 0);
        assert_eq!(transport.dispose_count(), 1);
    }

    #[test]
    fn test_reopen_after_failure_subscribes_exactly_once() {
        let transport = Arc::new(MockTransport::default());
        let mut session = session_with(transport.clone());

        session.open().unwrap();
        transport.push(SessionEvent::ConnectFailed { info: "refused".into() });
        session.process_pending();

        session.open().unwrap();
        transport.push(SessionEvent::Up);
        session.process_pending();

        assert_eq!(session.state(), &SessionState::Connected);
        assert_eq!(session.subscription(), &SubscriptionStatus::Pending);

        let subscribes = transport.subscribes.lock().unwrap().clone();
        assert_eq!(
            subscribes,
            vec![("buses/grid/>".to_string(), "buses".to_string(), Duration::from_secs(10))]
        );
        assert_eq!(session.stats().connect_attempts, 2);
    }

    #[test]
    fn test_sync_connect_rejection_fails_session() {
        let transport = Arc::new(MockTransport {
            refuse_connect: Some("bad url".into()),
            ..Default::default()
        });
        let mut session = session_with(transport.clone());

        let err = session.open().unwrap_err();

        assert!(matches!(err, SessionError::ConnectFailure(_)));
        assert!(matches!(session.state(), SessionState::Failed(_)));
        assert_eq!(transport.dispose_count(), 1);
    }

    #[test]
    fn test_open_while_connected_is_rejected() {
        let transport = Arc::new(MockTransport::default());
        let mut session = connected(&transport);

        let err = session.open().unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition { request: "open", .. }
        ));
        assert_eq!(*transport.connects.lock().unwrap(), 1);
    }

    #[test]
    fn test_end_to_end_replace_semantics() {
        let transport = Arc::new(MockTransport::default());
        let mut session = connected(&transport);
        assert_eq!(session.subscription(), &SubscriptionStatus::Active);

        transport.push(message("buses/grid/A1", BUS_42));
        session.process_pending();

        let state = session.snapshot();
        let cell = state.get(&"A1".into()).unwrap();
        assert_eq!(cell.len(), 1);
        assert_eq!(cell[0], VehicleRecord::new("42", 45.42, -75.69, "95", 12.3));

        transport.push(message("buses/grid/A1", "[]"));
        session.process_pending();

        let state = session.snapshot();
        assert_eq!(state.get(&"A1".into()).unwrap().len(), 0);
        assert_eq!(state.partition_count(), 1);
        assert_eq!(session.stats().messages_applied, 2);
    }

    #[test]
    fn test_malformed_topic_never_reaches_merger() {
        let transport = Arc::new(MockTransport::default());
        let mut session = connected(&transport);

        transport.push(message("buses/A1", BUS_42));
        session.process_pending();

        assert!(session.snapshot().is_empty());
        assert_eq!(session.stats().topic_errors, 1);
        assert_eq!(session.stats().messages_dropped, 1);
        assert_eq!(session.state(), &SessionState::Connected);
    }

    #[test]
    fn test_decode_error_leaves_state_unchanged() {
        let transport = Arc::new(MockTransport::default());
        let mut session = connected(&transport);

        transport.push(message("buses/grid/A1", BUS_42));
        session.process_pending();
        let before = session.snapshot();

        transport.push(message(
            "buses/grid/A1",
            r#"[{"id":"42","longitude":-75.69,"route_id":"95","speed":12.3}]"#,
        ));
        session.process_pending();

        assert_eq!(session.snapshot(), before);
        assert_eq!(session.stats().decode_errors, 1);
        assert_eq!(session.state(), &SessionState::Connected);
    }

    #[test]
    fn test_messages_outside_connected_are_dropped() {
        let transport = Arc::new(MockTransport::default());
        let mut session = session_with(transport.clone());

        session.open().unwrap();
        session.handle_event(message("buses/grid/A1", BUS_42));

        assert!(session.snapshot().is_empty());
        assert_eq!(session.stats().messages_dropped, 1);
    }

    #[test]
    fn test_subscription_error_keeps_session_connected() {
        let transport = Arc::new(MockTransport::default());
        let mut session = session_with(transport.clone());

        session.open().unwrap();
        transport.push(SessionEvent::Up);
        transport.push(SessionEvent::SubscriptionError {
            correlation_key: "buses".into(),
            info: "timed out after 10000ms".into(),
        });
        session.process_pending();

        assert_eq!(session.state(), &SessionState::Connected);
        assert_eq!(
            session.subscription(),
            &SubscriptionStatus::Failed("timed out after 10000ms".into())
        );
        assert_eq!(session.stats().subscribe_failures, 1);
    }

    #[test]
    fn test_sync_subscribe_rejection_keeps_session_connected() {
        let transport = Arc::new(MockTransport {
            refuse_subscribe: Some("permission denied".into()),
            ..Default::default()
        });
        let mut session = session_with(transport.clone());

        session.open().unwrap();
        transport.push(SessionEvent::Up);
        session.process_pending();

        assert_eq!(session.state(), &SessionState::Connected);
        assert!(matches!(session.subscription(), SubscriptionStatus::Failed(_)));
    }

    #[test]
    fn test_remote_disconnect_disposes_once() {
        let transport = Arc::new(MockTransport::default());
        let mut session = connected(&transport);

        transport.push(SessionEvent::Disconnected);
        session.process_pending();

        assert_eq!(session.state(), &SessionState::Disconnected);
        assert_eq!(session.subscription(), &SubscriptionStatus::Inactive);
        assert_eq!(transport.dispose_count(), 1);

        session.close();
        session.close();
        assert_eq!(transport.dispose_count(), 1);
        assert_eq!(*transport.disconnects.lock().unwrap(), 0);
    }

    #[test]
    fn test_close_is_idempotent_from_every_state() {
        // From Connecting
        let transport = Arc::new(MockTransport::default());
        let mut session = session_with(transport.clone());
        session.open().unwrap();
        session.close();
        session.close();
        assert_eq!(session.state(), &SessionState::Disconnected);
        assert_eq!(transport.dispose_count(), 1);
        assert_eq!(*transport.disconnects.lock().unwrap(), 1);

        // From Connected
        let transport = Arc::new(MockTransport::default());
        let mut session = connected(&transport);
        session.close();
        session.close();
        assert_eq!(transport.dispose_count(), 1);

        // From Disconnected (never opened)
        let transport = Arc::new(MockTransport::default());
        let mut session = session_with(transport.clone());
        session.close();
        assert_eq!(transport.dispose_count(), 0);
        assert_eq!(session.state(), &SessionState::Disconnected);
    }

    #[test]
    fn test_close_discards_queued_events() {
        let transport = Arc::new(MockTransport::default());
        let mut session = connected(&transport);

        transport.push(message("buses/grid/A1", BUS_42));
        session.close();

        assert!(transport.try_recv().is_none());
        assert!(session.snapshot().is_empty());
    }

    #[test]
    fn test_drop_releases_connection() {
        let transport = Arc::new(MockTransport::default());
        {
            let _session = connected(&transport);
        }
        assert_eq!(transport.dispose_count(), 1);
        assert_eq!(*transport.disconnects.lock().unwrap(), 1);
    }

    #[test]
    fn test_reconnect_preserves_cells_by_default() {
        let transport = Arc::new(MockTransport::default());
        let mut session = connected(&transport);
        transport.push(message("buses/grid/A1", BUS_42));
        transport.push(SessionEvent::Disconnected);
        session.process_pending();

        session.open().unwrap();
        transport.push(SessionEvent::Up);
        session.process_pending();

        assert_eq!(session.state(), &SessionState::Connected);
        assert_eq!(session.snapshot().vehicle_count(), 1);
        assert_eq!(transport.subscribe_count(), 2);
    }

    #[test]
    fn test_reconnect_clears_cells_when_configured() {
        let transport = Arc::new(MockTransport::default());
        let mut session = Session::new(
            transport.clone(),
            props(),
            SessionConfig::default().with_clear_on_reconnect(true),
        )
        .unwrap();

        session.open().unwrap();
        transport.push(SessionEvent::Up);
        transport.push(message("buses/grid/A1", BUS_42));
        transport.push(SessionEvent::Disconnected);
        session.process_pending();
        assert_eq!(session.snapshot().vehicle_count(), 1);

        session.open().unwrap();
        transport.push(SessionEvent::Up);
        session.process_pending();

        assert!(session.snapshot().is_empty());
    }

    #[test]
    fn test_invalid_subscription_filter() {
        let transport = Arc::new(MockTransport::default());
        let result = Session::new(
            transport,
            props(),
            SessionConfig::default().with_subscription("buses/>/grid"),
        );
        assert!(matches!(result, Err(SessionError::InvalidFilter(_))));
    }

    #[test]
    fn test_status_and_aggregate_observers() {
        let transport = Arc::new(MockTransport::default());
        let mut session = session_with(transport.clone());
        let status = session.status();
        let mut aggregate = session.aggregate();

        session.open().unwrap();
        transport.push(SessionEvent::Up);
        transport.push(message("buses/grid/4,3", BUS_42));
        session.process_pending();

        assert_eq!(*status.borrow(), SessionState::Connected);
        assert!(aggregate.has_changed().unwrap());
        assert_eq!(aggregate.borrow_and_update().vehicle_count(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_until_channel_closes() {
        let transport = Arc::new(MockTransport::default());
        let mut session = session_with(transport.clone());

        session.open().unwrap();
        transport.push(SessionEvent::Up);
        transport.push(message("buses/grid/A1", BUS_42));
        transport.push(message("buses/grid/B2", "[]"));

        session.run().await;

        assert_eq!(session.with_state(|s| s.partition_count()), 2);
    }

    #[test]
    fn test_process_message_is_pure() {
        let msg = InboundMessage::new("buses/grid/A1", BUS_42.as_bytes().to_vec());
        let (key, records) = process_message(&msg).unwrap();
        assert_eq!(key.as_str(), "A1");
        assert_eq!(records.len(), 1);

        let bad = InboundMessage::new("buses", b"[]".to_vec());
        assert!(matches!(process_message(&bad), Err(MessageError::Topic(_))));
    }
}
