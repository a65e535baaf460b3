//! Vehicle position records as carried in grid-cell payloads.

use serde::{Deserialize, Serialize};

/// One vehicle's last reported position.
///
/// Records are values: a later record with the same `id` supersedes this
/// one, it never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    /// Vehicle identifier, unique within a cell's active set
    pub id: String,

    /// WGS84 latitude in degrees [-90, 90]
    pub latitude: f64,

    /// WGS84 longitude in degrees [-180, 180]
    pub longitude: f64,

    /// Route the vehicle is serving
    pub route_id: String,

    /// Ground speed in m/s (non-negative)
    pub speed: f64,

    /// Trip the vehicle is running, when the feed provides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,

    /// Feed timestamp of the position fix (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl VehicleRecord {
    /// Creates a record with the required fields only.
    pub fn new(
        id: impl Into<String>,
        latitude: f64,
        longitude: f64,
        route_id: impl Into<String>,
        speed: f64,
    ) -> Self {
        Self {
            id: id.into(),
            latitude,
            longitude,
            route_id: route_id.into(),
            speed,
            trip_id: None,
            timestamp: None,
        }
    }

    /// Sets the trip ID.
    pub fn with_trip(mut self, trip_id: impl Into<String>) -> Self {
        self.trip_id = Some(trip_id.into());
        self
    }

    /// Sets the feed timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Returns the first field whose value is outside its valid range.
    pub fn range_violation(&self) -> Option<(&'static str, f64)> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Some(("latitude", self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Some(("longitude", self.longitude));
        }
        if !self.speed.is_finite() || self.speed < 0.0 {
            return Some(("speed", self.speed));
        }
        None
    }
}
