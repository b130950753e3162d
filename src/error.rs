//! Error types for connections and subscriptions.

use crate::types::{SubscriptionMode, TopicKey};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failure. Not recoverable by this crate.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not resolve endpoint: {0}")]
    Resolve(String),

    #[error("Connection closed")]
    Closed,

    #[error("Frame too large: {len} bytes (limit {limit})")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<rmp_serde::encode::Error> for ConnectionError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ConnectionError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ConnectionError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ConnectionError::Deserialization(e.to_string())
    }
}

/// The broker round-trip a timeout applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Subscribe,
    Acknowledge,
    Unsubscribe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Subscribe => "subscribe",
            Operation::Acknowledge => "acknowledge",
            Operation::Unsubscribe => "unsubscribe",
        };
        f.write_str(name)
    }
}

/// The broker did not confirm a request in time.
#[derive(Debug, Error)]
#[error("Timed out after {after:?} waiting for {operation} confirmation on {key}")]
pub struct TimeoutError {
    pub operation: Operation,
    pub key: TopicKey,
    pub after: Duration,
}

/// Subscribe failed. Always leaves no registry entry behind.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("Duplicate subscription on {key} (held by a {existing:?} subscription)")]
    Duplicate {
        key: TopicKey,
        existing: SubscriptionMode,
    },

    #[error("Broker rejected subscription on {key}: {reason}")]
    Rejected { key: TopicKey, reason: String },

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("Connection error while subscribing to {key}: {source}")]
    Connection {
        key: TopicKey,
        #[source]
        source: ConnectionError,
    },

    #[error("Could not start delivery worker for {key}: {source}")]
    Worker {
        key: TopicKey,
        #[source]
        source: std::io::Error,
    },
}

/// `receive` failed.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Terminal for the subscription.
    #[error("Subscription {key} is closed")]
    Closed { key: TopicKey },

    #[error("Transport failure on {key}: {source}")]
    Transport {
        key: TopicKey,
        #[source]
        source: Arc<ConnectionError>,
    },
}

/// Acknowledging an envelope failed.
#[derive(Debug, Error)]
pub enum AcknowledgeError {
    #[error("Envelope {id} is not outstanding on {key}")]
    UnknownEnvelope { key: TopicKey, id: String },

    #[error("Cannot acknowledge envelope {id}: subscription {key} is closed")]
    Closed { key: TopicKey, id: String },

    #[error("Broker rejected acknowledgment of {id} on {key}: {reason}")]
    Rejected {
        key: TopicKey,
        id: String,
        reason: String,
    },

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("Connection error acknowledging {id} on {key}: {source}")]
    Connection {
        key: TopicKey,
        id: String,
        #[source]
        source: ConnectionError,
    },
}

/// Closing a subscription failed. The handle stays `Closing`.
#[derive(Debug, Error)]
pub enum CloseError {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("Broker rejected unsubscribe on {key}: {reason}")]
    Rejected { key: TopicKey, reason: String },

    #[error("Connection error closing {key}: {source}")]
    Connection {
        key: TopicKey,
        #[source]
        source: ConnectionError,
    },
}

impl CloseError {
    /// The subscription this failure belongs to.
    pub fn key(&self) -> &TopicKey {
        match self {
            CloseError::Timeout(e) => &e.key,
            CloseError::Rejected { key, .. } => key,
            CloseError::Connection { key, .. } => key,
        }
    }
}

/// Every failure collected while shutting a connection down.
#[derive(Debug, Default)]
pub struct ShutdownError {
    /// Subscriptions that could not be closed.
    pub failures: Vec<CloseError>,
    /// Failure to shut the transport itself down.
    pub transport: Option<ConnectionError>,
}

impl ShutdownError {
    /// Collect the failures out of a batch of close results.
    ///
    /// Returns `Ok(())` when every close succeeded.
    pub fn from_results<I>(results: I) -> Result<(), ShutdownError>
    where
        I: IntoIterator<Item = Result<(), CloseError>>,
    {
        let failures: Vec<CloseError> = results.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError {
                failures,
                transport: None,
            })
        }
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty() && self.transport.is_none()
    }

    /// All underlying causes, subscriptions first.
    pub fn errors(&self) -> impl Iterator<Item = &(dyn std::error::Error + 'static)> {
        self.failures
            .iter()
            .map(|e| e as &(dyn std::error::Error + 'static))
            .chain(
                self.transport
                    .iter()
                    .map(|e| e as &(dyn std::error::Error + 'static)),
            )
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shutdown failed ({} error(s))", self.errors().count())?;
        for err in self.errors() {
            write!(f, "; {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout(topic: &str) -> CloseError {
        CloseError::Timeout(TimeoutError {
            operation: Operation::Unsubscribe,
            key: TopicKey::new("messages", topic),
            after: Duration::from_millis(10),
        })
    }

    #[test]
    fn test_shutdown_error_keeps_every_cause() {
        let err = ShutdownError::from_results(vec![
            Ok(()),
            Err(timeout("neworder")),
            Err(CloseError::Connection {
                key: TopicKey::new("messages", "sendorder"),
                source: ConnectionError::Closed,
            }),
        ])
        .unwrap_err();

        assert_eq!(err.failures.len(), 2);
        assert_eq!(err.failures[0].key().topic, "neworder");
        assert_eq!(err.failures[1].key().topic, "sendorder");
        assert!(err.to_string().starts_with("Shutdown failed (2 error(s))"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_shutdown_error_all_ok() {
        assert!(ShutdownError::from_results(vec![Ok(()), Ok(())]).is_ok());
        assert!(ShutdownError::default().is_empty());
    }
}
