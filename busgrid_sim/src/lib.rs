//! Busgrid Deterministic Simulation Harness
//!
//! A controlled environment where a fleet publisher, an in-memory broker
//! and a [`busgrid_core::Session`] run together with no real network.
//!
//! # Core Principle: Nothing Happens Unless the Runner Says So
//!
//! - **Time**: a virtual clock advances only on explicit ticks; subscribe
//!   acknowledgement deadlines run on it
//! - **Broker**: topic routing with injectable faults (refused connects,
//!   rejected or unacknowledged subscribes, dropped connections)
//! - **Randomness**: fleet motion derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  snapshot   ┌────────────────┐  buses/grid/<cell>  ┌─────────────┐
//! │ FleetOracle  │────────────►│ FleetPublisher │────────────────────►│  SimBroker  │
//! │ (truth)      │             └────────────────┘                     └──────┬──────┘
//! └──────┬───────┘                                                           │ events
//!        │ partitioned()                                              ┌──────▼──────┐
//!        └────────────────────────── compare ────────────────────────►│   Session   │
//!                                                                     └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use busgrid_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 50).with_duration(30.0).run(ScenarioId::Reconnect);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod network;
mod oracle;
mod runner;
pub mod scenarios;

pub use context::SimClock;
pub use exporter::{FleetExport, FleetFrame, Marker};
pub use network::{BrokerStats, ClientReport, SimBroker, SimPublisher, SimTransport, SIM_MESSAGE_ID};
pub use oracle::{FleetOracle, SimBus};
pub use runner::{
    duplicate_vehicle, verify_view, ReplayResult, ScenarioMetrics, ScenarioResult, ScenarioRunner,
};
