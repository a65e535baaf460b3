//! The Partition Router - topic strings to grid-cell partition keys.
//!
//! Topics have the fixed shape `<namespace>/<qualifier>/<partitionKey>`,
//! e.g. `buses/grid/4,3`. The key's naming scheme belongs to the publisher;
//! the router accepts any string in the third level.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic namespace for vehicle positions.
pub const TOPIC_NAMESPACE: &str = "buses";

/// Qualifier level under the namespace.
pub const TOPIC_QUALIFIER: &str = "grid";

/// Wildcard filter covering every grid cell.
pub const GRID_WILDCARD: &str = "buses/grid/>";

/// Identifies one spatial grid cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PartitionKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Topic does not have the three levels a partition topic needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed topic '{topic}': expected <namespace>/<qualifier>/<partition>, got {levels} level(s)")]
pub struct MalformedTopicError {
    pub topic: String,
    pub levels: usize,
}

/// Extracts the partition key from a topic.
///
/// Levels past the third (reachable through a `>` subscription) are ignored.
pub fn route(topic: &str) -> Result<PartitionKey, MalformedTopicError> {
    let mut levels = topic.split('/');

    match (levels.next(), levels.next(), levels.next()) {
        (Some(_), Some(_), Some(key)) => Ok(PartitionKey::new(key)),
        _ => Err(MalformedTopicError {
            topic: topic.to_owned(),
            levels: topic.split('/').count(),
        }),
    }
}

/// Builds the concrete topic a publisher sends a cell's snapshot to.
pub fn topic_for(key: &PartitionKey) -> String {
    format!("{TOPIC_NAMESPACE}/{TOPIC_QUALIFIER}/{key}")
}
