//! Publisher side: shard a fleet snapshot by grid cell and send one
//! message per cell.
//!
//! Subscribers replace a cell's list wholesale, so a cell that empties out
//! must be announced explicitly. `FleetPublisher` remembers which cells it
//! populated last time and sends `[]` to the ones that are now empty.

use busgrid_env::TopicPublisher;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::codec;
use crate::grid::GridSpec;
use crate::record::VehicleRecord;
use crate::router::{topic_for, PartitionKey};

/// Outcome of one [`FleetPublisher::publish_snapshot`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishReport {
    /// Cells published with at least one vehicle
    pub cells_published: usize,

    /// Previously populated cells published as empty
    pub cells_cleared: usize,

    /// Vehicles placed in a cell
    pub vehicles: usize,

    /// Published vehicles whose cell lies outside the grid bounds
    pub outside_grid: usize,

    /// Vehicles skipped because no cell could be computed for them
    pub unplaced: usize,

    /// Vehicles skipped because a field was out of range
    pub invalid: usize,

    /// Total subscriber deliveries reported by the transport
    pub deliveries: usize,

    /// Cells that could not be published, with the reason
    pub failures: Vec<(PartitionKey, String)>,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Publishes fleet snapshots as per-cell messages.
pub struct FleetPublisher<P: TopicPublisher> {
    publisher: P,
    grid: GridSpec,

    /// Cells that held vehicles after the last publish
    populated: BTreeSet<PartitionKey>,
}

impl<P: TopicPublisher> FleetPublisher<P> {
    pub fn new(publisher: P, grid: GridSpec) -> Self {
        Self {
            publisher,
            grid,
            populated: BTreeSet::new(),
        }
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    /// Publishes a complete fleet snapshot.
    ///
    /// A failure on one cell is logged and recorded; the other cells are
    /// still published.
    pub fn publish_snapshot<I>(&mut self, fleet: I) -> PublishReport
    where
        I: IntoIterator<Item = VehicleRecord>,
    {
        let mut report = PublishReport::default();

        let valid = fleet.into_iter().filter(|record| match record.range_violation() {
            Some((field, value)) => {
                warn!(vehicle = %record.id, field, value, "Vehicle has out-of-range field, not published");
                report.invalid += 1;
                false
            }
            None => true,
        });
        let split = self.grid.partition(valid);

        report.unplaced = split.unplaced.len();
        for record in &split.unplaced {
            warn!(
                vehicle = %record.id,
                latitude = record.latitude,
                longitude = record.longitude,
                "No grid cell for vehicle, not published"
            );
        }

        let mut populated = BTreeSet::new();

        for (key, records) in &split.cells {
            populated.insert(key.clone());
            match self.publish_cell(key, records) {
                Ok(delivered) => {
                    report.cells_published += 1;
                    report.vehicles += records.len();
                    report.deliveries += delivered;

                    let outside = records
                        .iter()
                        .filter(|r| !self.grid.contains(r.latitude, r.longitude))
                        .count();
                    if outside > 0 {
                        debug!(cell = %key, outside, "Publishing vehicles outside the grid bounds");
                        report.outside_grid += outside;
                    }
                }
                Err(reason) => report.failures.push((key.clone(), reason)),
            }
        }

        for key in self.populated.difference(&split.cells.keys().cloned().collect()) {
            match self.publish_cell(key, &[]) {
                Ok(delivered) => {
                    report.cells_cleared += 1;
                    report.deliveries += delivered;
                }
                Err(reason) => {
                    // Try clearing it again next snapshot
                    populated.insert(key.clone());
                    report.failures.push((key.clone(), reason));
                }
            }
        }

        self.populated = populated;

        info!(
            cells = report.cells_published,
            cleared = report.cells_cleared,
            vehicles = report.vehicles,
            skipped = report.invalid + report.unplaced,
            failures = report.failures.len(),
            "Published fleet snapshot"
        );

        report
    }

    fn publish_cell(&self, key: &PartitionKey, records: &[VehicleRecord]) -> Result<usize, String> {
        let topic = topic_for(key);

        let payload = codec::encode(records).map_err(|e| {
            warn!(topic = %topic, error = %e, "Failed to encode cell");
            e.to_string()
        })?;

        self.publisher.publish(&topic, payload).map_err(|e| {
            warn!(topic = %topic, error = %e, "Failed to publish cell");
            e.to_string()
        })
    }
}
