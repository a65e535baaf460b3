//! Turns a GTFS-realtime vehicle-positions feed into [`VehicleRecord`]s.
//!
//! Pure: takes feed bytes already fetched by the caller and returns the
//! fleet snapshot to hand to [`crate::FleetPublisher`].

use prost::Message;
use thiserror::Error;
use tracing::debug;

use crate::gtfs_rt::{FeedEntity, FeedMessage};
use crate::record::VehicleRecord;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid GTFS-realtime feed: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Decodes a protobuf-encoded `FeedMessage`.
pub fn decode_feed(bytes: &[u8]) -> Result<FeedMessage, FeedError> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Extracts one record per vehicle position in the feed.
///
/// Entities without a vehicle position (trip updates, alerts) or without a
/// reported position are skipped, as are deleted entities. Records keep
/// feed order.
pub fn vehicle_records(feed: &FeedMessage) -> Vec<VehicleRecord> {
    let records: Vec<VehicleRecord> = feed.entity.iter().filter_map(vehicle_record).collect();

    debug!(
        entities = feed.entity.len(),
        vehicles = records.len(),
        "Extracted vehicle positions from feed"
    );
    records
}

/// Decodes feed bytes straight into a fleet snapshot.
pub fn records_from_bytes(bytes: &[u8]) -> Result<Vec<VehicleRecord>, FeedError> {
    decode_feed(bytes).map(|feed| vehicle_records(&feed))
}

fn vehicle_record(entity: &FeedEntity) -> Option<VehicleRecord> {
    if entity.is_deleted == Some(true) {
        return None;
    }
    let vehicle = entity.vehicle.as_ref()?;
    let position = vehicle.position.as_ref()?;

    // Feeds may omit the vehicle descriptor; the entity id is always present
    let id = vehicle
        .vehicle
        .as_ref()
        .and_then(|v| v.id.clone())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| entity.id.clone());

    let trip = vehicle.trip.as_ref();
    let route_id = trip.and_then(|t| t.route_id.clone()).unwrap_or_default();

    let mut record = VehicleRecord::new(
        id,
        f64::from(position.latitude),
        f64::from(position.longitude),
        route_id,
        f64::from(position.speed.unwrap_or(0.0)),
    );
    record.trip_id = trip.and_then(|t| t.trip_id.clone());
    record.timestamp = vehicle.timestamp;
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{FeedHeader, Position, TripDescriptor, VehicleDescriptor, VehiclePosition};

    fn bus(entity_id: &str, vehicle_id: Option<&str>, lat: f32, lon: f32) -> FeedEntity {
        FeedEntity {
            id: entity_id.into(),
            vehicle: Some(VehiclePosition {
                trip: Some(TripDescriptor {
                    trip_id: Some(format!("trip-{entity_id}")),
                    route_id: Some("95".into()),
                    ..Default::default()
                }),
                position: Some(Position {
                    latitude: lat,
                    longitude: lon,
                    speed: Some(8.5),
                    ..Default::default()
                }),
                timestamp: Some(1_704_067_200),
                vehicle: vehicle_id.map(|id| VehicleDescriptor {
                    id: Some(id.into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn feed(entity: Vec<FeedEntity>) -> FeedMessage {
        FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".into(),
                timestamp: Some(1_704_067_205),
                ..Default::default()
            },
            entity,
        }
    }

    #[test]
    fn test_maps_vehicle_fields() {
        let records = vehicle_records(&feed(vec![bus("e1", Some("4402"), 45.5, -75.25)]));

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.id, "4402");
        assert_eq!(r.route_id, "95");
        assert_eq!(r.trip_id.as_deref(), Some("trip-e1"));
        assert_eq!(r.timestamp, Some(1_704_067_200));
        // Values exactly representable in f32
        assert_eq!(r.latitude, 45.5);
        assert_eq!(r.longitude, -75.25);
        assert_eq!(r.speed, 8.5);
    }

    #[test]
    fn test_skips_entities_without_vehicle_position() {
        let alert_only = FeedEntity {
            id: "alert-1".into(),
            ..Default::default()
        };
        let no_position = FeedEntity {
            id: "e3".into(),
            vehicle: Some(VehiclePosition::default()),
            ..Default::default()
        };
        let deleted = FeedEntity {
            is_deleted: Some(true),
            ..bus("e4", Some("9"), 45.5, -75.5)
        };

        let records = vehicle_records(&feed(vec![
            bus("e1", Some("1"), 45.5, -75.5),
            alert_only,
            no_position,
            deleted,
            bus("e2", Some("2"), 45.25, -75.75),
        ]));

        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_missing_vehicle_id_falls_back_to_entity_id() {
        let records = vehicle_records(&feed(vec![
            bus("e1", None, 45.5, -75.5),
            bus("e2", Some(""), 45.5, -75.5),
        ]));

        assert_eq!(records[0].id, "e1");
        assert_eq!(records[1].id, "e2");
    }

    #[test]
    fn test_records_from_encoded_feed() {
        let bytes = feed(vec![bus("e1", Some("4402"), 45.5, -75.25)]).encode_to_vec();

        let records = records_from_bytes(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "4402");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            records_from_bytes(b"<html>502</html>"),
            Err(FeedError::Protobuf(_))
        ));
    }
}
