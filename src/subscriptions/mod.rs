//! Pull and push subscriptions over a broker connection.
//!
//! Both kinds share the same lifecycle (`Opening -> Active -> Closing ->
//! Closed`) and the same acknowledgment bookkeeping:
//! - Pull: the consumer calls `receive` and acknowledges each envelope
//! - Push: a dedicated worker invokes a [`Handler`] per envelope and sends
//!   its return value as the acknowledgment
//!
//! Each (pubsub name, topic) key can be held by one subscription at a time.
//!
//! # Example
//!
//! ```ignore
//! // Push: handler invoked for every message on "sendorder"
//! let push = conn.subscribe_with_handler(
//!     SubscriptionOptions::new("messages", "sendorder"),
//!     |envelope: &Envelope| {
//!         println!("got {}", envelope.id());
//!         AckStatus::Success
//!     },
//! )?;
//!
//! // Pull: explicit receive loop on "neworder"
//! let pull = conn.subscribe(SubscriptionOptions::new("messages", "neworder"))?;
//! for _ in 0..3 {
//!     let envelope = pull.receive()?;
//!     envelope.success()?;
//! }
//!
//! ShutdownError::from_results([push.stop(), pull.close()])?;
//! ```

mod pull;
mod push;
mod stream;

pub use pull::PullSubscription;
pub use push::{Handler, PushSubscription};
pub(crate) use stream::StreamCore;
