//! BusGrid Core - Live Partitioned Fleet View over Pub/Sub
//!
//! This library keeps a live "which vehicles are where, right now" view fed
//! by per-cell snapshots published on a hierarchical topic space:
//! 1. **Router**: `buses/grid/<cell>` topics to partition keys
//! 2. **Codec**: JSON cell payloads to typed vehicle records, failing closed
//! 3. **Merger**: last-writer-wins replace per cell, published atomically
//! 4. **Session**: connect / subscribe / disconnect state machine driving the pipeline
//!
//! The publisher side (`feed`, `grid`, `publisher`) turns a GTFS-realtime
//! vehicle-positions feed into a fleet snapshot and shards it into the same
//! cells.

pub mod codec;
pub mod feed;
pub mod grid;
pub mod gtfs_rt;
pub mod merger;
pub mod publisher;
pub mod record;
pub mod router;
pub mod session;

// Re-export key types for convenience
pub use codec::{decode, encode, DecodeError, EncodeError};
pub use feed::{decode_feed, records_from_bytes, vehicle_records, FeedError};
pub use grid::{GridError, GridSpec, Partitioned};
pub use merger::{AggregateState, StateMerger};
pub use publisher::{FleetPublisher, PublishReport};
pub use record::VehicleRecord;
pub use router::{route, topic_for, MalformedTopicError, PartitionKey, GRID_WILDCARD};
pub use session::{
    process_message, MessageError, Session, SessionConfig, SessionError, SessionState,
    SessionStats, SubscriptionStatus,
};
