//! The State Merger - last-writer-wins per grid cell.
//!
//! Publishers send full cell snapshots, never deltas, so merging is a plain
//! replace-by-key:
//! - Updating one cell never touches another (updates to different cells commute)
//! - A second update to the same cell fully replaces the first
//! - An empty snapshot is stored as an empty cell, not removed
//!
//! No per-vehicle timestamp is consulted. Ordering within a cell is whatever
//! order the transport delivered that cell's topic in.

use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::record::VehicleRecord;
use crate::router::PartitionKey;

/// Every grid cell's current vehicle list.
///
/// The union of all cells is the fleet a consumer renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateState {
    partitions: HashMap<PartitionKey, Vec<VehicleRecord>>,
}

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state with `key`'s list replaced by `records`.
    pub fn apply(mut self, key: PartitionKey, records: Vec<VehicleRecord>) -> Self {
        self.replace(key, records);
        self
    }

    /// Replaces `key`'s list in place, returning the previous list if any.
    pub fn replace(
        &mut self,
        key: PartitionKey,
        records: Vec<VehicleRecord>,
    ) -> Option<Vec<VehicleRecord>> {
        self.partitions.insert(key, records)
    }

    /// Returns the records stored for a cell.
    pub fn get(&self, key: &PartitionKey) -> Option<&[VehicleRecord]> {
        self.partitions.get(key).map(Vec::as_slice)
    }

    /// Returns true if the cell has been reported at least once.
    pub fn contains(&self, key: &PartitionKey) -> bool {
        self.partitions.contains_key(key)
    }

    /// Number of known cells, including empty ones.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Number of vehicles across all cells.
    pub fn vehicle_count(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Iterates over cells in no particular order.
    pub fn cells(&self) -> impl Iterator<Item = (&PartitionKey, &[VehicleRecord])> {
        self.partitions.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Cells sorted by key, for stable output.
    pub fn sorted_cells(&self) -> Vec<(&PartitionKey, &[VehicleRecord])> {
        let mut cells: Vec<_> = self.cells().collect();
        cells.sort_by(|a, b| a.0.cmp(b.0));
        cells
    }

    /// Flattens all cells into the fleet.
    pub fn vehicles(&self) -> impl Iterator<Item = &VehicleRecord> {
        self.partitions.values().flatten()
    }

    /// Looks up a vehicle by ID in any cell.
    pub fn find_vehicle(&self, id: &str) -> Option<(&PartitionKey, &VehicleRecord)> {
        self.partitions
            .iter()
            .find_map(|(k, v)| v.iter().find(|r| r.id == id).map(|r| (k, r)))
    }

    /// Forgets every cell.
    pub fn clear(&mut self) {
        self.partitions.clear();
    }
}

/// Applies one cell update: `apply(state, key, records) -> new state`.
pub fn apply(
    state: AggregateState,
    key: PartitionKey,
    records: Vec<VehicleRecord>,
) -> AggregateState {
    state.apply(key, records)
}

/// Owns the live [`AggregateState`] and publishes every change.
///
/// Updates go through a `watch` channel: a reader's `borrow()` sees the
/// whole state either before or after an update, never half of one.
pub struct StateMerger {
    tx: watch::Sender<AggregateState>,

    /// Number of updates applied since creation
    updates: u64,
}

impl StateMerger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AggregateState::default());
        Self { tx, updates: 0 }
    }

    /// Returns a receiver that observes every published state.
    pub fn subscribe(&self) -> watch::Receiver<AggregateState> {
        self.tx.subscribe()
    }

    /// Replaces one cell's records and publishes the new state.
    pub fn apply(&mut self, key: PartitionKey, records: Vec<VehicleRecord>) {
        let count = records.len();
        self.tx.send_modify(|state| {
            state.replace(key.clone(), records);
        });
        self.updates += 1;

        debug!(partition = %key, records = count, "Applied cell update");
    }

    /// Drops every cell and publishes the empty state.
    pub fn clear(&mut self) {
        self.tx.send_modify(AggregateState::clear);
    }

    /// Runs `f` against the current state without cloning it.
    pub fn with_state<R>(&self, f: impl FnOnce(&AggregateState) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> AggregateState {
        self.tx.borrow().clone()
    }

    pub fn update_count(&self) -> u64 {
        self.updates
    }
}

impl Default for StateMerger {
    fn default() -> Self {
        Self::new()
    }
}
