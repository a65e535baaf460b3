//! Fault scenarios for the session and merge pipeline.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: Healthy broker, moving fleet, view must track ground truth
    Steady,

    /// SIM-002: Buses jump across cell boundaries every tick
    CellHandoff,

    /// SIM-003: Rogue publisher mixes bad topics and bad payloads in
    MalformedTraffic,

    /// SIM-004: Broker refuses the first connect, the retry succeeds
    ConnectRefused,

    /// SIM-005: Broker never acknowledges the subscription
    SubscribeTimeout,

    /// SIM-006: Broker drops the connection mid-run, client reopens
    Reconnect,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Steady,
            ScenarioId::CellHandoff,
            ScenarioId::MalformedTraffic,
            ScenarioId::ConnectRefused,
            ScenarioId::SubscribeTimeout,
            ScenarioId::Reconnect,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Steady => "steady",
            ScenarioId::CellHandoff => "cell_handoff",
            ScenarioId::MalformedTraffic => "malformed_traffic",
            ScenarioId::ConnectRefused => "connect_refused",
            ScenarioId::SubscribeTimeout => "subscribe_timeout",
            ScenarioId::Reconnect => "reconnect",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Steady => "Moving fleet on a healthy broker, view matches ground truth every tick",
            ScenarioId::CellHandoff => "Buses teleport between cells, no vehicle may appear in two cells",
            ScenarioId::MalformedTraffic => "Bad topics and payloads are dropped without disturbing the view",
            ScenarioId::ConnectRefused => "First connect refused (Failed, no subscribe), retry connects and subscribes once",
            ScenarioId::SubscribeTimeout => "Subscription ack withheld past its deadline, session stays Connected with no data",
            ScenarioId::Reconnect => "Connection dropped mid-run, cached cells kept, view converges after reopen",
        }
    }

    /// Returns true if the scenario injects a connection-level fault.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            ScenarioId::ConnectRefused | ScenarioId::SubscribeTimeout | ScenarioId::Reconnect
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady" | "sim-001" => Ok(ScenarioId::Steady),
            "cell_handoff" | "cellhandoff" | "sim-002" => Ok(ScenarioId::CellHandoff),
            "malformed_traffic" | "malformedtraffic" | "sim-003" => Ok(ScenarioId::MalformedTraffic),
            "connect_refused" | "connectrefused" | "sim-004" => Ok(ScenarioId::ConnectRefused),
            "subscribe_timeout" | "subscribetimeout" | "sim-005" => Ok(ScenarioId::SubscribeTimeout),
            "reconnect" | "sim-006" => Ok(ScenarioId::Reconnect),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
