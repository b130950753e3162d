//! Connection and subscription configuration.

use crate::types::TopicKey;
use std::collections::HashMap;
use std::time::Duration;

/// Connection configuration.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// How long `connect` may take to establish the TCP stream.
    /// Default: 10s
    pub connect_timeout: Duration,

    /// How long to wait for the broker to confirm a subscribe.
    /// Default: 5s
    pub subscribe_timeout: Duration,

    /// How long to wait for the broker to confirm an acknowledgment.
    /// Default: 5s
    pub ack_timeout: Duration,

    /// How long `close`/`stop` waits for the unsubscribe confirmation.
    /// Default: 5s
    pub close_timeout: Duration,

    /// Largest encoded frame accepted from or sent to the broker.
    /// Default: 16MB
    pub max_frame_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
            max_frame_bytes: 16 * 1024 * 1024, // 16MB
        }
    }
}

/// What to subscribe to.
#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    /// Name of the pubsub component.
    pub pubsub_name: String,

    /// Topic within the component.
    pub topic: String,

    /// Component-specific subscription metadata, passed through to the broker.
    pub metadata: HashMap<String, String>,

    /// Where the broker should route messages acknowledged with `Drop`.
    pub dead_letter_topic: Option<String>,
}

impl SubscriptionOptions {
    pub fn new(pubsub_name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            pubsub_name: pubsub_name.into(),
            topic: topic.into(),
            metadata: HashMap::new(),
            dead_letter_topic: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    /// Registry key for these options.
    pub fn key(&self) -> TopicKey {
        TopicKey::new(self.pubsub_name.clone(), self.topic.clone())
    }
}
