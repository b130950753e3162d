//! # Topic Stream
//!
//! Client-side streaming subscriptions over a single duplex connection to a
//! pub/sub broker.
//!
//! ## Core Concepts
//!
//! - **Connection**: one transport plus a delivery loop routing broker frames
//! - **Pull subscriptions**: `receive` one envelope at a time, acknowledge explicitly
//! - **Push subscriptions**: a handler per envelope, its return value is the acknowledgment
//! - **Registry**: at most one live subscription per (pubsub name, topic)
//!
//! ## Example
//!
//! ```ignore
//! use topicstream::{
//!     AckStatus, Connection, ConnectionConfig, Envelope, ShutdownError, SubscriptionOptions,
//! };
//!
//! let conn = Connection::connect("127.0.0.1:50001", ConnectionConfig::default())?;
//!
//! let stop = conn
//!     .subscribe_with_handler(
//!         SubscriptionOptions::new("messages", "sendorder"),
//!         |e: &Envelope| {
//!             println!("{}: {:?}", e.id(), e.raw_data());
//!             AckStatus::Success
//!         },
//!     )?
//!     .into_stop_fn();
//!
//! let sub = conn.subscribe(SubscriptionOptions::new("messages", "neworder"))?;
//! let msg = sub.receive()?;
//! msg.success()?;
//!
//! ShutdownError::from_results([stop(), sub.close()])?;
//! ```

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod ingest;
pub mod registry;
pub mod subscriptions;
pub mod types;
pub mod wire;

// Re-exports
pub use config::{ConnectionConfig, SubscriptionOptions};
pub use connection::{Connection, Incoming, MemoryBroker, MemoryTransport, RecordedAck, TcpTransport, Transport};
pub use envelope::Envelope;
pub use error::{
    AcknowledgeError, CloseError, ConnectionError, Operation, ReceiveError, ShutdownError,
    SubscribeError, TimeoutError,
};
pub use ingest::{InboundEvent, IngestError};
pub use registry::{DuplicateSubscription, Registry, SubscriptionHandle};
pub use subscriptions::{Handler, PullSubscription, PushSubscription};
pub use types::*;
pub use wire::Frame;
