//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use topicstream::{Connection, ConnectionConfig, Envelope, MemoryBroker, SubscriptionOptions};

pub const PUBSUB: &str = "messages";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        subscribe_timeout: Duration::from_secs(2),
        ack_timeout: Duration::from_secs(2),
        close_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Config with short broker timeouts, for tests that expect them to fire.
pub fn impatient_config() -> ConnectionConfig {
    ConnectionConfig {
        subscribe_timeout: Duration::from_millis(150),
        ack_timeout: Duration::from_millis(150),
        close_timeout: Duration::from_millis(150),
        ..Default::default()
    }
}

pub fn connect_with(broker: &MemoryBroker, config: ConnectionConfig) -> Connection {
    init_tracing();
    let transport = broker.connect(config.max_frame_bytes).unwrap();
    Connection::with_transport(Arc::new(transport), config).unwrap()
}

pub fn connect(broker: &MemoryBroker) -> Connection {
    connect_with(broker, test_config())
}

pub fn options(topic: &str) -> SubscriptionOptions {
    SubscriptionOptions::new(PUBSUB, topic)
}

pub fn publish(broker: &MemoryBroker, topic: &str, id: &str) -> usize {
    broker.publish(Envelope::new(PUBSUB, topic, id, format!("payload of {}", id).into_bytes()))
}

/// Poll `condition` until it holds or two seconds pass.
pub fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
