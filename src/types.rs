//! Core types shared by the connection, the registry and subscriptions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a subscription target: a topic within a pubsub component.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicKey {
    pub pubsub_name: String,
    pub topic: String,
}

impl TopicKey {
    pub fn new(pubsub_name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            pubsub_name: pubsub_name.into(),
            topic: topic.into(),
        }
    }
}

impl fmt::Debug for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicKey({}/{})", self.pubsub_name, self.topic)
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pubsub_name, self.topic)
    }
}

/// Consumer's verdict on a delivered envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckStatus {
    /// Processed; the broker may forget the message.
    Success,
    /// Not processed; the broker should redeliver.
    Retry,
    /// Not processed and never will be; the broker should discard it.
    Drop,
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckStatus::Success => "success",
            AckStatus::Retry => "retry",
            AckStatus::Drop => "drop",
        };
        f.write_str(name)
    }
}

/// How envelopes reach the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionMode {
    /// The consumer calls `receive` for each envelope.
    Pull,
    /// A registered handler is invoked for each envelope.
    Push,
}

/// Lifecycle of a subscription handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Opening,
    Active,
    Closing,
    Closed,
}

impl SubscriptionState {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// `Opening -> Closed` covers a subscribe that failed before the broker
    /// confirmed it. `Closing -> Closed` is the only way out of `Closing`.
    pub fn can_transition_to(self, next: SubscriptionState) -> bool {
        use SubscriptionState::*;
        matches!(
            (self, next),
            (Opening, Active) | (Opening, Closed) | (Active, Closing) | (Closing, Closed)
        )
    }

    /// No new deliveries may start in this state.
    pub fn is_terminating(self) -> bool {
        matches!(self, SubscriptionState::Closing | SubscriptionState::Closed)
    }
}

/// Connection-scoped identifier of one topic stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates a client request with the broker's reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

/// Registry-assigned identifier of a subscription handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);
