//! BusGrid Transport Abstraction Layer
//!
//! This crate provides the seam between the BusGrid session engine and
//! whatever pub/sub provider actually moves the bytes: a broker SDK in
//! production, or the in-memory `SimBroker` from `busgrid_sim` in tests.
//!
//! # Core Concept: Requests Out, Events In
//!
//! The session engine never blocks on the transport:
//! - Requests (`connect()`, `subscribe()`, `disconnect()`, `dispose()`) return
//!   immediately; their outcome arrives later as a [`SessionEvent`]
//! - Events (`Up`, `ConnectFailed`, `Disconnected`, `Message`, subscription
//!   acks) are drained from a channel with `recv()` / `try_recv()`
//!
//! # Example
//!
//! ```ignore
//! use busgrid_env::{PubSubTransport, SessionEvent};
//!
//! async fn pump<T: PubSubTransport>(transport: &T) {
//!     while let Some(event) = transport.recv().await {
//!         match event {
//!             SessionEvent::Up => subscribe(transport),
//!             SessionEvent::Message(msg) => handle(msg),
//!             _ => {}
//!         }
//!     }
//! }
//! ```

mod error;
mod network;
mod topic;
mod types;

pub use error::EnvError;
pub use network::{PubSubTransport, TopicPublisher};
pub use topic::TopicFilter;
pub use types::{ClientId, ConnectionProperties, InboundMessage, SessionEvent};
