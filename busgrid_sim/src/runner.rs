//! Scenario runner - drives a publisher, the simulated broker and one
//! session through each scenario and checks the session's view.

use crate::context::SimClock;
use crate::exporter::{FleetExport, FleetFrame};
use crate::network::{SimBroker, SimPublisher, SimTransport};
use crate::oracle::FleetOracle;
use crate::scenarios::ScenarioId;

use busgrid_core::{
    AggregateState, FleetPublisher, GridSpec, PartitionKey, Partitioned, PublishReport, Session,
    SessionConfig, SessionState, SubscriptionStatus, VehicleRecord,
};
use busgrid_env::{ClientId, ConnectionProperties, TopicPublisher};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total publish ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Vehicles in the session's view at the end
    pub final_vehicle_count: usize,

    /// Final session status line
    pub final_status: String,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Messages handed to the broker
    pub messages_published: u64,

    /// Broker deliveries to the session
    pub messages_delivered: u64,

    /// Cell updates merged into the view
    pub messages_applied: u64,

    /// Messages dropped by the session (bad topic, bad payload, not connected)
    pub messages_dropped: u64,

    /// Cells published empty after their last bus left
    pub cells_cleared: u64,

    pub connect_attempts: u64,
    pub subscribe_calls: u64,
    pub disposals: u64,
}

/// Outcome of replaying one recorded fleet snapshot.
#[derive(Debug, Clone, Default)]
pub struct ReplayResult {
    /// What the publisher sent
    pub publish: PublishReport,

    /// Vehicles the session ended up showing
    pub vehicles_shown: usize,

    /// Cells the session ended up knowing
    pub cells_shown: usize,

    pub failure_reason: Option<String>,
}

impl ReplayResult {
    pub fn passed(&self) -> bool {
        self.failure_reason.is_none()
    }
}

/// Runs scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Fleet size
    num_buses: usize,

    /// Seconds between fleet snapshots
    tick_secs: f64,

    /// Maximum duration in seconds
    max_duration_secs: f64,

    /// Inputs handed to `Session::new`
    connection: ConnectionProperties,

    /// Subscribe acknowledgement timeout
    subscribe_timeout: Duration,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_buses: usize) -> Self {
        Self {
            seed,
            num_buses,
            tick_secs: 1.0,
            max_duration_secs: 60.0,
            connection: ConnectionProperties::new("sim://local", "default", "busgrid", "busgrid"),
            subscribe_timeout: SessionConfig::default().subscribe_timeout,
        }
    }

    /// Sets the snapshot interval.
    pub fn with_tick_interval(mut self, secs: f64) -> Self {
        self.tick_secs = secs;
        self
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Sets the connection inputs.
    pub fn with_connection(mut self, connection: ConnectionProperties) -> Self {
        self.connection = connection;
        self
    }

    /// Sets how long the broker may take to acknowledge the subscription.
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, false).0
    }

    /// Runs a scenario, also recording the view at every tick.
    pub fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, FleetExport) {
        self.execute(scenario, true)
    }

    fn target_ticks(&self) -> u64 {
        ((self.max_duration_secs / self.tick_secs) as u64).max(3)
    }

    fn execute(&self, scenario: ScenarioId, record: bool) -> (ScenarioResult, FleetExport) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        if scenario.is_fault() {
            warn!("Injecting connection fault: {}", scenario.description());
        }

        let config = match scenario {
            // Wider filter lets short topics through so the router has to reject them
            ScenarioId::MalformedTraffic => SessionConfig::default().with_subscription("buses/>"),
            // Cells emptied during the outage are never re-cleared by the publisher
            ScenarioId::Reconnect => SessionConfig::default().with_clear_on_reconnect(true),
            _ => SessionConfig::default(),
        }
        .with_subscribe_timeout(self.subscribe_timeout);

        let mut harness = match Harness::new(self, config, record) {
            Ok(h) => h,
            Err(reason) => {
                let result = ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_secs: 0.0,
                    final_vehicle_count: 0,
                    final_status: SessionState::Disconnected.to_string(),
                    failure_reason: Some(reason),
                    metrics: ScenarioMetrics::default(),
                };
                return (result, FleetExport::new(scenario.name(), self.seed));
            }
        };

        let ticks = self.target_ticks();
        let outcome = match scenario {
            ScenarioId::Steady => self.run_steady(&mut harness, ticks),
            ScenarioId::CellHandoff => self.run_cell_handoff(&mut harness, ticks),
            ScenarioId::MalformedTraffic => self.run_malformed_traffic(&mut harness, ticks),
            ScenarioId::ConnectRefused => self.run_connect_refused(&mut harness, ticks),
            ScenarioId::SubscribeTimeout => self.run_subscribe_timeout(&mut harness, ticks),
            ScenarioId::Reconnect => self.run_reconnect(&mut harness, ticks),
        };

        match &outcome {
            Ok(()) => info!("✓ {} complete after {} ticks", scenario.name(), harness.ticks),
            Err(reason) => warn!("✗ {} failed: {}", scenario.name(), reason),
        }

        harness.finish(scenario, self.seed, outcome.err())
    }

    /// Publishes one recorded snapshot (e.g. a decoded GTFS-realtime feed)
    /// and checks that a fresh session shows exactly its publishable part.
    pub fn replay_snapshot(&self, fleet: Vec<VehicleRecord>) -> ReplayResult {
        info!("Replaying snapshot of {} vehicles (seed={})", fleet.len(), self.seed);

        let mut result = ReplayResult::default();
        let broker = SimBroker::new(SimClock::new());
        let grid = GridSpec::default();
        let mut publisher = FleetPublisher::new(broker.publisher(), grid.clone());

        let config = SessionConfig::default().with_subscribe_timeout(self.subscribe_timeout);
        let transport = Arc::new(broker.client(ClientId::from_seed(self.seed)));
        let mut session = match Session::new(transport, self.connection.clone(), config) {
            Ok(session) => session,
            Err(e) => {
                result.failure_reason = Some(e.to_string());
                return result;
            }
        };

        if let Err(e) = session.open() {
            result.failure_reason = Some(e.to_string());
            return result;
        }
        session.process_pending();
        if session.subscription() != &SubscriptionStatus::Active {
            result.failure_reason = Some(format!(
                "subscription not active: {:?}",
                session.subscription()
            ));
            return result;
        }

        // The publisher skips out-of-range records, so the truth does too
        let truth = grid.partition(
            fleet
                .iter()
                .filter(|r| r.range_violation().is_none())
                .cloned(),
        );
        result.publish = publisher.publish_snapshot(fleet);
        session.process_pending();

        result.vehicles_shown = session.with_state(AggregateState::vehicle_count);
        result.cells_shown = session.with_state(AggregateState::partition_count);
        result.failure_reason = session.with_state(|view| verify_view(view, &truth)).err();

        info!(
            cells = result.cells_shown,
            vehicles = result.vehicles_shown,
            invalid = result.publish.invalid,
            outside_grid = result.publish.outside_grid,
            "Replay complete"
        );
        result
    }

    fn run_steady(&self, h: &mut Harness, ticks: u64) -> Result<(), String> {
        h.connect()?;

        for _ in 0..ticks {
            h.tick(self.tick_secs);
            h.publish();
            h.pump();
            h.verify_against_truth()?;
        }

        ensure(h.session.subscription() == &SubscriptionStatus::Active, || {
            format!("subscription not active: {:?}", h.session.subscription())
        })
    }

    fn run_cell_handoff(&self, h: &mut Harness, ticks: u64) -> Result<(), String> {
        h.connect()?;

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ 0x00c0_ffee);
        let (rows, cols) = h.oracle.grid().dimensions();

        for tick in 0..ticks {
            h.tick(self.tick_secs);

            for id in 0..self.num_buses as u64 {
                if (tick + id) % 3 != 0 {
                    continue;
                }
                let key = PartitionKey::new(format!(
                    "{},{}",
                    rng.gen_range(0..rows),
                    rng.gen_range(0..cols)
                ));
                let center = h.oracle.grid().cell_center(&key);
                if let Some((lat, lon)) = center {
                    h.oracle.teleport(id, lat, lon);
                }
            }

            h.publish();
            h.pump();
            h.verify_against_truth()?;

            if let Some(id) = h.session.with_state(duplicate_vehicle) {
                return Err(format!("vehicle {} shown in two cells at tick {}", id, tick));
            }
        }

        ensure(h.metrics.cells_cleared > 0, || {
            "no cell was ever emptied; handoff not exercised".to_string()
        })
    }

    fn run_malformed_traffic(&self, h: &mut Harness, ticks: u64) -> Result<(), String> {
        h.connect()?;
        let rogue = h.broker.publisher();

        for _ in 0..ticks {
            h.tick(self.tick_secs);
            h.publish();

            let target = h
                .oracle
                .partitioned(0)
                .cells
                .keys()
                .next()
                .map(|k| format!("buses/grid/{}", k))
                .unwrap_or_else(|| "buses/grid/0,0".to_string());

            h.rogue_publish(&rogue, "buses/A1", br#"[]"#);
            h.rogue_publish(&rogue, &target, b"<html>502 Bad Gateway</html>");
            h.rogue_publish(
                &rogue,
                &target,
                br#"[{"id":"x","longitude":-75.6,"route_id":"1","speed":3.0}]"#,
            );

            h.pump();
            h.verify_against_truth()?;
        }

        let stats = h.session.stats().clone();
        ensure(stats.topic_errors == ticks, || {
            format!("expected {} topic errors, saw {}", ticks, stats.topic_errors)
        })?;
        ensure(stats.decode_errors == 2 * ticks, || {
            format!("expected {} decode errors, saw {}", 2 * ticks, stats.decode_errors)
        })?;
        ensure(h.session.state() == &SessionState::Connected, || {
            format!("session left Connected: {}", h.session.state())
        })
    }

    fn run_connect_refused(&self, h: &mut Harness, ticks: u64) -> Result<(), String> {
        h.broker.refuse_connections(Some("401 Unauthorized"));
        h.session.open().map_err(|e| e.to_string())?;
        h.pump();

        ensure(
            h.session.state() == &SessionState::Failed("401 Unauthorized".into()),
            || format!("expected Failed, got {}", h.session.state()),
        )?;
        ensure(h.session.stats().subscribe_calls == 0, || {
            "subscribe attempted after connect failure".to_string()
        })?;

        info!("  ✓ Refused as expected, retrying with healed broker");
        h.broker.refuse_connections(None);
        h.connect()?;

        ensure(h.session.stats().subscribe_calls == 1, || {
            format!("expected one subscribe call, saw {}", h.session.stats().subscribe_calls)
        })?;

        for _ in 0..ticks {
            h.tick(self.tick_secs);
            h.publish();
            h.pump();
            h.verify_against_truth()?;
        }
        Ok(())
    }

    fn run_subscribe_timeout(&self, h: &mut Harness, ticks: u64) -> Result<(), String> {
        h.broker.withhold_acks(true);
        h.session.open().map_err(|e| e.to_string())?;
        h.pump();

        ensure(h.session.state() == &SessionState::Connected, || {
            format!("expected Connected, got {}", h.session.state())
        })?;

        for _ in 0..ticks {
            h.tick(self.tick_secs);
            h.publish();
            h.pump();
        }

        // Short runs may end before the acknowledgement deadline
        if h.session.subscription() == &SubscriptionStatus::Pending {
            h.broker.advance_time(h.session.config().subscribe_timeout);
            h.pump();
        }

        ensure(
            matches!(h.session.subscription(), SubscriptionStatus::Failed(_)),
            || format!("expected failed subscription, got {:?}", h.session.subscription()),
        )?;
        ensure(h.session.state() == &SessionState::Connected, || {
            format!("subscribe failure changed session state to {}", h.session.state())
        })?;
        ensure(h.session.with_state(AggregateState::is_empty), || {
            "view received data without a subscription".to_string()
        })
    }

    fn run_reconnect(&self, h: &mut Harness, ticks: u64) -> Result<(), String> {
        h.connect()?;

        let drop_at = ticks / 3;
        let reopen_at = 2 * ticks / 3;
        let mut cached: Option<AggregateState> = None;

        for tick in 0..ticks {
            if tick == drop_at {
                info!("  ⚡ Broker drops connections at tick {}", tick);
                h.broker.drop_connections();
                h.pump();
                ensure(h.session.state() == &SessionState::Disconnected, || {
                    format!("expected Disconnected, got {}", h.session.state())
                })?;
                cached = Some(h.session.snapshot());
            }

            if tick == reopen_at {
                info!("  ✓ Reopening session at tick {}", tick);
                h.connect()?;
            }

            h.tick(self.tick_secs);
            h.publish();
            h.pump();

            match (&cached, h.session.state()) {
                (Some(cache), SessionState::Disconnected) => {
                    // Offline: the view is a best-effort cache of pre-drop cells
                    ensure(&h.session.snapshot() == cache, || {
                        "view changed while disconnected".to_string()
                    })?;
                }
                _ => h.verify_against_truth()?,
            }
        }

        let stats = h.session.stats().clone();
        ensure(stats.subscribe_calls == 2, || {
            format!("expected two subscribe calls, saw {}", stats.subscribe_calls)
        })?;
        ensure(stats.disposals == 1, || {
            format!("expected one disposal, saw {}", stats.disposals)
        })
    }
}

/// One broker, one publisher, one session.
struct Harness {
    clock: SimClock,
    broker: SimBroker,
    oracle: FleetOracle,
    publisher: FleetPublisher<SimPublisher>,
    session: Session<SimTransport>,
    client_id: ClientId,
    metrics: ScenarioMetrics,
    ticks: u64,
    export: Option<FleetExport>,
}

impl Harness {
    fn new(runner: &ScenarioRunner, config: SessionConfig, record: bool) -> Result<Self, String> {
        let clock = SimClock::new();
        let broker = SimBroker::new(clock.clone());
        let grid = GridSpec::default();

        // Separate seeds so fleet motion doesn't depend on client identity
        let fleet_seed = runner.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let mut oracle = FleetOracle::new(fleet_seed, grid.clone());
        oracle.spawn_fleet(runner.num_buses);

        let client_id = ClientId::from_seed(runner.seed);
        let transport = Arc::new(broker.client(client_id));
        let session = Session::new(transport, runner.connection.clone(), config)
            .map_err(|e| e.to_string())?;

        Ok(Self {
            publisher: FleetPublisher::new(broker.publisher(), grid),
            clock,
            broker,
            oracle,
            session,
            client_id,
            metrics: ScenarioMetrics::default(),
            ticks: 0,
            export: record.then(|| FleetExport::new("", runner.seed)),
        })
    }

    /// Opens the session and handles the broker's answer.
    fn connect(&mut self) -> Result<(), String> {
        self.session.open().map_err(|e| e.to_string())?;
        self.pump();

        ensure(self.session.state() == &SessionState::Connected, || {
            format!("expected Connected after open, got {}", self.session.state())
        })
    }

    fn tick(&mut self, dt: f64) {
        self.oracle.step(dt);
        self.broker.advance_time(Duration::from_secs_f64(dt));
        self.ticks += 1;
    }

    fn publish(&mut self) -> PublishReport {
        let report = self.publisher.publish_snapshot(self.oracle.snapshot(self.clock.unix_secs()));
        self.metrics.messages_published += (report.cells_published + report.cells_cleared) as u64;
        self.metrics.messages_delivered += report.deliveries as u64;
        self.metrics.cells_cleared += report.cells_cleared as u64;
        report
    }

    fn rogue_publish(&mut self, rogue: &SimPublisher, topic: &str, payload: &[u8]) {
        match rogue.publish(topic, payload.to_vec()) {
            Ok(delivered) => {
                self.metrics.messages_published += 1;
                self.metrics.messages_delivered += delivered as u64;
            }
            Err(e) => debug!(topic, error = %e, "Rogue publish refused by broker"),
        }
    }

    fn pump(&mut self) {
        let handled = self.session.process_pending();
        if handled > 0 {
            debug!(handled, status = %self.session.state(), "Pumped session events");
        }

        if let Some(export) = self.export.as_mut() {
            let frame = self.session.with_state(|state| {
                FleetFrame::from_state(self.oracle.time(), &self.session.state().to_string(), state)
            });
            export.add_frame(frame);
        }
    }

    fn verify_against_truth(&self) -> Result<(), String> {
        let truth = self.oracle.partitioned(self.clock.unix_secs());
        self.session
            .with_state(|view| verify_view(view, &truth))
            .map_err(|e| format!("t={:.1}s: {}", self.oracle.time(), e))
    }

    fn finish(
        mut self,
        scenario: ScenarioId,
        seed: u64,
        failure_reason: Option<String>,
    ) -> (ScenarioResult, FleetExport) {
        let stats = self.session.stats().clone();
        self.metrics.messages_applied = stats.messages_applied;
        self.metrics.messages_dropped = stats.messages_dropped;
        self.metrics.connect_attempts = stats.connect_attempts;
        self.metrics.subscribe_calls = stats.subscribe_calls;
        self.metrics.disposals = stats.disposals;

        if let Some(report) = self.broker.client_report(self.client_id) {
            debug!(?report, "Broker view of the client");
        }

        let result = ScenarioResult {
            scenario,
            seed,
            passed: failure_reason.is_none(),
            total_ticks: self.ticks,
            final_time_secs: self.oracle.time(),
            final_vehicle_count: self.session.with_state(AggregateState::vehicle_count),
            final_status: self.session.state().to_string(),
            failure_reason,
            metrics: self.metrics.clone(),
        };

        let mut export = self
            .export
            .take()
            .unwrap_or_else(|| FleetExport::new(scenario.name(), seed));
        export.scenario = scenario.name().to_string();
        export.finalize(result.passed, result.failure_reason.clone());

        (result, export)
    }
}

fn ensure(condition: bool, reason: impl FnOnce() -> String) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(reason())
    }
}

/// Checks a session's view against what the publisher last sent.
///
/// Every populated truth cell must match exactly; any other cell the view
/// knows must be empty.
pub fn verify_view(view: &AggregateState, truth: &Partitioned) -> Result<(), String> {
    for (cell, records) in &truth.cells {
        match view.get(cell) {
            Some(shown) if shown == records.as_slice() => {}
            Some(shown) => {
                return Err(format!(
                    "cell {} shows {} vehicles, truth has {}",
                    cell,
                    shown.len(),
                    records.len()
                ))
            }
            None => return Err(format!("cell {} missing from view", cell)),
        }
    }

    for (cell, shown) in view.cells() {
        if !truth.cells.contains_key(cell) && !shown.is_empty() {
            return Err(format!("cell {} shows {} stale vehicles", cell, shown.len()));
        }
    }

    Ok(())
}

/// Returns a vehicle ID that appears more than once in the view.
pub fn duplicate_vehicle(view: &AggregateState) -> Option<String> {
    let mut seen = HashSet::new();
    view.vehicles()
        .find(|r| !seen.insert(r.id.as_str()))
        .map(|r| r.id.clone())
}
