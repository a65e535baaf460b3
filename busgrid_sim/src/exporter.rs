//! JSON exporter for map rendering.
//!
//! Exports what a session's view showed at each tick as a list of map
//! markers, so a renderer can replay a scenario.

use busgrid_core::AggregateState;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// One vehicle marker on the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub route_id: String,
    pub speed: f64,
    pub cell: String,
}

/// A single frame of the rendered view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Connection status line as a UI would show it
    pub status: String,

    /// Number of cells the view knows about (including empty ones)
    pub cells: usize,

    /// Flattened fleet
    pub markers: Vec<Marker>,
}

impl FleetFrame {
    /// Flattens a view into markers, ordered by cell then feed order.
    pub fn from_state(time_sec: f64, status: &str, state: &AggregateState) -> Self {
        let markers = state
            .sorted_cells()
            .into_iter()
            .flat_map(|(cell, records)| {
                records.iter().map(move |r| Marker {
                    id: r.id.clone(),
                    latitude: r.latitude,
                    longitude: r.longitude,
                    route_id: r.route_id.clone(),
                    speed: r.speed,
                    cell: cell.to_string(),
                })
            })
            .collect();

        Self {
            time_sec,
            status: status.to_string(),
            cells: state.partition_count(),
            markers,
        }
    }
}

/// Complete scenario export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<FleetFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl FleetExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: FleetFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
