//! In-memory pub/sub broker with fault injection.
//!
//! `SimBroker` routes published messages to every connected client whose
//! subscriptions match the topic. Each client gets one ordered event
//! channel, so per-topic publish order is preserved for every subscriber.

use async_trait::async_trait;
use busgrid_env::{
    ClientId, ConnectionProperties, EnvError, InboundMessage, PubSubTransport, SessionEvent,
    TopicFilter, TopicPublisher,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::context::SimClock;

/// Application message ID stamped on every simulated publish.
pub const SIM_MESSAGE_ID: &str = "BUSGRID-SIM-UPDATE";

/// Per-client bookkeeping, visible to tests through [`ClientReport`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientReport {
    pub connected: bool,
    pub connect_calls: u64,
    pub subscribe_calls: u64,
    pub disconnect_calls: u64,
    pub dispose_calls: u64,
    pub active_subscriptions: usize,
    pub pending_acks: usize,
}

/// Broker-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
}

struct PendingAck {
    filter: TopicFilter,
    correlation_key: String,
    timeout: Duration,
    deadline: Duration,
}

struct ClientSlot {
    events: mpsc::UnboundedSender<SessionEvent>,
    subscriptions: Vec<TopicFilter>,
    pending: Vec<PendingAck>,
    report: ClientReport,
}

impl ClientSlot {
    fn emit(&self, event: SessionEvent) {
        // Receiver gone means the client was dropped; nothing to tell it
        let _ = self.events.send(event);
    }

    fn reset_connection(&mut self) {
        self.report.connected = false;
        self.subscriptions.clear();
        self.pending.clear();
        self.report.active_subscriptions = 0;
        self.report.pending_acks = 0;
    }
}

#[derive(Default)]
struct Faults {
    refuse_connect: Option<String>,
    reject_subscribe: Option<String>,
    withhold_acks: bool,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<ClientId, ClientSlot>,
    faults: Faults,
    stats: BrokerStats,
}

/// The simulated broker. Clones share the same broker.
#[derive(Clone)]
pub struct SimBroker {
    state: Arc<Mutex<BrokerState>>,
    clock: SimClock,
}

impl SimBroker {
    /// Creates a broker driven by `clock`.
    pub fn new(clock: SimClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            clock,
        }
    }

    /// Registers a client and returns its transport.
    pub fn client(&self, id: ClientId) -> SimTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().clients.insert(
            id,
            ClientSlot {
                events: tx,
                subscriptions: Vec::new(),
                pending: Vec::new(),
                report: ClientReport::default(),
            },
        );

        SimTransport {
            id,
            broker: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Returns a publisher handle.
    pub fn publisher(&self) -> SimPublisher {
        SimPublisher {
            broker: self.clone(),
        }
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    /// Makes every following connect attempt fail with `reason` (`None` heals).
    pub fn refuse_connections(&self, reason: Option<&str>) {
        self.lock().faults.refuse_connect = reason.map(str::to_owned);
    }

    /// Makes every following subscribe fail with `reason` (`None` heals).
    pub fn reject_subscriptions(&self, reason: Option<&str>) {
        self.lock().faults.reject_subscribe = reason.map(str::to_owned);
    }

    /// Stops acknowledging subscriptions; they time out on the virtual clock.
    pub fn withhold_acks(&self, withhold: bool) {
        self.lock().faults.withhold_acks = withhold;
    }

    /// Drops every connected client, as a broker restart would.
    ///
    /// Returns the number of clients disconnected.
    pub fn drop_connections(&self) -> usize {
        let mut state = self.lock();
        let mut dropped = 0;

        for slot in state.clients.values_mut().filter(|s| s.report.connected) {
            slot.reset_connection();
            slot.emit(SessionEvent::Disconnected);
            dropped += 1;
        }

        debug!(dropped, "Dropped client connections");
        dropped
    }

    /// Advances the virtual clock and fails any overdue subscribe acks.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
        let now = self.clock.now();
        let mut state = self.lock();

        for slot in state.clients.values_mut() {
            let (expired, waiting): (Vec<_>, Vec<_>) =
                slot.pending.drain(..).partition(|p| p.deadline <= now);
            slot.pending = waiting;
            slot.report.pending_acks = slot.pending.len();

            for ack in expired {
                debug!(filter = %ack.filter, "Subscribe acknowledgement timed out");
                slot.emit(SessionEvent::SubscriptionError {
                    correlation_key: ack.correlation_key,
                    info: format!(
                        "subscribe to {}: {}",
                        ack.filter,
                        EnvError::Timeout(ack.timeout.as_millis() as u64)
                    ),
                });
            }
        }
    }

    /// Closes every client's event channel; pending `recv()` calls return `None`.
    pub fn shutdown(&self) {
        self.lock().clients.clear();
    }

    pub fn client_report(&self, id: ClientId) -> Option<ClientReport> {
        self.lock().clients.get(&id).map(|s| s.report.clone())
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, topic: &str, payload: Vec<u8>) -> usize {
        let mut state = self.lock();
        let mut delivered = 0;

        for slot in state.clients.values().filter(|s| s.report.connected) {
            if slot.subscriptions.iter().any(|f| f.matches(topic)) {
                slot.emit(SessionEvent::Message(InboundMessage {
                    topic: topic.to_owned(),
                    payload: payload.clone(),
                    application_message_id: Some(SIM_MESSAGE_ID.to_owned()),
                }));
                delivered += 1;
            }
        }

        state.stats.published += 1;
        state.stats.delivered += delivered as u64;
        delivered
    }
}

/// One client's view of the broker.
pub struct SimTransport {
    id: ClientId,
    broker: SimBroker,

    /// Receiver for session events (behind tokio mutex for async)
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl SimTransport {
    fn with_slot<R>(&self, f: impl FnOnce(&mut ClientSlot, &Faults, Duration) -> R) -> Option<R> {
        let now = self.broker.clock.now();
        let mut state = self.broker.lock();
        let BrokerState { clients, faults, .. } = &mut *state;
        clients.get_mut(&self.id).map(|slot| f(slot, faults, now))
    }
}

#[async_trait]
impl PubSubTransport for SimTransport {
    fn connect(&self, props: &ConnectionProperties) -> Result<(), EnvError> {
        if props.host.is_empty() {
            return Err(EnvError::transport("no broker host configured"));
        }

        self.with_slot(|slot, faults, _| {
            slot.report.connect_calls += 1;
            if slot.report.connected {
                return Err(EnvError::transport("already connected"));
            }

            match &faults.refuse_connect {
                Some(reason) => slot.emit(SessionEvent::ConnectFailed {
                    info: reason.clone(),
                }),
                None => {
                    slot.report.connected = true;
                    slot.emit(SessionEvent::Up);
                }
            }
            Ok(())
        })
        .unwrap_or(Err(EnvError::Disposed))
    }

    fn subscribe(
        &self,
        filter: &TopicFilter,
        correlation_key: &str,
        timeout: Duration,
    ) -> Result<(), EnvError> {
        self.with_slot(|slot, faults, now| {
            if !slot.report.connected {
                return Err(EnvError::NotConnected);
            }
            slot.report.subscribe_calls += 1;

            if let Some(reason) = &faults.reject_subscribe {
                slot.emit(SessionEvent::SubscriptionError {
                    correlation_key: correlation_key.to_owned(),
                    info: reason.clone(),
                });
            } else if faults.withhold_acks {
                slot.pending.push(PendingAck {
                    filter: filter.clone(),
                    correlation_key: correlation_key.to_owned(),
                    timeout,
                    deadline: now + timeout,
                });
                slot.report.pending_acks = slot.pending.len();
            } else {
                slot.subscriptions.push(filter.clone());
                slot.report.active_subscriptions = slot.subscriptions.len();
                slot.emit(SessionEvent::SubscriptionOk {
                    correlation_key: correlation_key.to_owned(),
                });
            }
            Ok(())
        })
        .unwrap_or(Err(EnvError::Disposed))
    }

    fn disconnect(&self) {
        self.with_slot(|slot, _, _| {
            slot.report.disconnect_calls += 1;
            if slot.report.connected {
                slot.reset_connection();
                slot.emit(SessionEvent::Disconnected);
            }
        });
    }

    fn dispose(&self) {
        self.with_slot(|slot, _, _| {
            slot.report.dispose_calls += 1;
            slot.reset_connection();
        });
    }

    async fn recv(&self) -> Option<SessionEvent> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn try_recv(&self) -> Option<SessionEvent> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    fn client_id(&self) -> ClientId {
        self.id
    }
}

/// Publishing handle onto a [`SimBroker`].
#[derive(Clone)]
pub struct SimPublisher {
    broker: SimBroker,
}

impl TopicPublisher for SimPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize, EnvError> {
        // Publish destinations are concrete topics, never filters
        if topic.is_empty() || topic.split('/').any(|l| l.is_empty() || l == "*" || l == ">") {
            return Err(EnvError::invalid_topic(topic));
        }
        Ok(self.broker.route(topic, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn props() -> ConnectionProperties {
        ConnectionProperties::new("sim://broker", "default", "viewer", "secret")
    }

    fn grid_filter() -> TopicFilter {
        TopicFilter::parse("buses/grid/>").unwrap()
    }

    fn drain(transport: &SimTransport) -> Vec<SessionEvent> {
        std::iter::from_fn(|| transport.try_recv()).collect()
    }

    #[test]
    fn test_connect_and_subscribe() {
        let broker = SimBroker::new(SimClock::new());
        let client = broker.client(ClientId::from_seed(1));

        client.connect(&props()).unwrap();
        client.subscribe(&grid_filter(), "buses", Duration::from_secs(10)).unwrap();

        assert_eq!(
            drain(&client),
            vec![
                SessionEvent::Up,
                SessionEvent::SubscriptionOk { correlation_key: "buses".into() },
            ]
        );

        let report = broker.client_report(client.client_id()).unwrap();
        assert!(report.connected);
        assert_eq!(report.subscribe_calls, 1);
        assert_eq!(report.active_subscriptions, 1);
    }

    #[test]
    fn test_empty_host_is_rejected_synchronously() {
        let broker = SimBroker::new(SimClock::new());
        let client = broker.client(ClientId::from_seed(1));

        let props = ConnectionProperties::default();
        assert!(client.connect(&props).is_err());
        assert!(drain(&client).is_empty());
    }

    #[test]
    fn test_refused_connection() {
        let broker = SimBroker::new(SimClock::new());
        let client = broker.client(ClientId::from_seed(1));
        broker.refuse_connections(Some("invalid credentials"));

        client.connect(&props()).unwrap();

        assert_eq!(
            drain(&client),
            vec![SessionEvent::ConnectFailed { info: "invalid credentials".into() }]
        );
        assert!(matches!(
            client.subscribe(&grid_filter(), "buses", Duration::from_secs(10)),
            Err(EnvError::NotConnected)
        ));
    }

    #[test]
    fn test_routing_respects_filters() {
        let broker = SimBroker::new(SimClock::new());
        let client = broker.client(ClientId::from_seed(1));
        let publisher = broker.publisher();

        client.connect(&props()).unwrap();
        client.subscribe(&grid_filter(), "buses", Duration::from_secs(10)).unwrap();
        drain(&client);

        assert_eq!(publisher.publish("buses/grid/4,3", b"[]".to_vec()).unwrap(), 1);
        assert_eq!(publisher.publish("trains/grid/4,3", b"[]".to_vec()).unwrap(), 0);
        assert!(publisher.publish("buses/grid/>", b"[]".to_vec()).is_err());

        let events = drain(&client);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::Message(msg) => {
                assert_eq!(msg.topic, "buses/grid/4,3");
                assert_eq!(msg.application_message_id.as_deref(), Some(SIM_MESSAGE_ID));
            }
            other => panic!("expected message, got {:?}", other),
        }
        assert_eq!(broker.stats(), BrokerStats { published: 2, delivered: 1 });
    }

    #[test]
    fn test_withheld_ack_times_out_on_virtual_clock() {
        let broker = SimBroker::new(SimClock::new());
        let client = broker.client(ClientId::from_seed(1));
        broker.withhold_acks(true);

        client.connect(&props()).unwrap();
        client.subscribe(&grid_filter(), "buses", Duration::from_secs(10)).unwrap();
        assert_eq!(drain(&client), vec![SessionEvent::Up]);

        broker.advance_time(Duration::from_secs(9));
        assert!(drain(&client).is_empty());

        broker.advance_time(Duration::from_secs(1));
        match drain(&client).as_slice() {
            [SessionEvent::SubscriptionError { correlation_key, info }] => {
                assert_eq!(correlation_key, "buses");
                assert!(info.ends_with("Timeout after 10000ms"), "{}", info);
            }
            other => panic!("expected timeout, got {:?}", other),
        }

        // No subscription was installed
        assert_eq!(broker.publisher().publish("buses/grid/A1", b"[]".to_vec()).unwrap(), 0);
    }

    #[test]
    fn test_drop_connections_and_dispose() {
        let broker = SimBroker::new(SimClock::new());
        let client = broker.client(ClientId::from_seed(1));

        client.connect(&props()).unwrap();
        drain(&client);

        assert_eq!(broker.drop_connections(), 1);
        assert_eq!(drain(&client), vec![SessionEvent::Disconnected]);

        client.dispose();
        let report = broker.client_report(client.client_id()).unwrap();
        assert!(!report.connected);
        assert_eq!(report.dispose_calls, 1);

        // A fresh connect works after dispose
        client.connect(&props()).unwrap();
        assert_eq!(drain(&client), vec![SessionEvent::Up]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_event_channel() {
        let broker = SimBroker::new(SimClock::new());
        let client = broker.client(ClientId::from_seed(1));

        client.connect(&props()).unwrap();
        broker.shutdown();

        assert_eq!(client.recv().await, Some(SessionEvent::Up));
        assert_eq!(client.recv().await, None);
    }

    proptest! {
        #[test]
        fn prop_per_topic_publish_order_preserved(cells in proptest::collection::vec(0u8..4, 1..40)) {
            let broker = SimBroker::new(SimClock::new());
            let client = broker.client(ClientId::from_seed(1));
            let publisher = broker.publisher();

            client.connect(&props()).unwrap();
            client.subscribe(&grid_filter(), "buses", Duration::from_secs(10)).unwrap();
            drain(&client);

            for (seq, cell) in cells.iter().enumerate() {
                publisher.publish(&format!("buses/grid/{cell}"), seq.to_string().into_bytes()).unwrap();
            }

            let received: Vec<(String, usize)> = drain(&client)
                .into_iter()
                .filter_map(|e| match e {
                    SessionEvent::Message(m) => Some((
                        m.topic,
                        String::from_utf8(m.payload).unwrap().parse().unwrap(),
                    )),
                    _ => None,
                })
                .collect();

            prop_assert_eq!(received.len(), cells.len());
            for cell in 0u8..4 {
                let topic = format!("buses/grid/{cell}");
                let seqs: Vec<usize> = received.iter().filter(|(t, _)| *t == topic).map(|(_, s)| *s).collect();
                prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}
