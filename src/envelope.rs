//! The delivered message and its acknowledgment sink.

use crate::error::AcknowledgeError;
use crate::types::{AckStatus, TopicKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Receives the acknowledgment for a delivered envelope.
pub(crate) trait AckSink: Send + Sync {
    fn acknowledge(&self, id: &str, status: AckStatus) -> Result<(), AcknowledgeError>;
}

/// One delivered message plus its routing metadata.
///
/// Fields are read-only once constructed. Envelopes handed out by a
/// subscription carry a sink back to it, so `success`/`retry`/`drop_message`
/// acknowledge directly.
#[derive(Clone, Serialize, Deserialize)]
pub struct Envelope {
    pubsub_name: String,
    topic: String,
    id: String,
    raw_data: Vec<u8>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(skip)]
    sink: Option<Arc<dyn AckSink>>,
}

impl Envelope {
    pub fn new(
        pubsub_name: impl Into<String>,
        topic: impl Into<String>,
        id: impl Into<String>,
        raw_data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            pubsub_name: pubsub_name.into(),
            topic: topic.into(),
            id: id.into(),
            raw_data: raw_data.into(),
            metadata: HashMap::new(),
            content_type: None,
            sink: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn pubsub_name(&self) -> &str {
        &self.pubsub_name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn key(&self) -> TopicKey {
        TopicKey::new(self.pubsub_name.clone(), self.topic.clone())
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.raw_data)
    }

    /// Acknowledge with `Success`.
    pub fn success(&self) -> Result<(), AcknowledgeError> {
        self.acknowledge(AckStatus::Success)
    }

    /// Acknowledge with `Retry`.
    pub fn retry(&self) -> Result<(), AcknowledgeError> {
        self.acknowledge(AckStatus::Retry)
    }

    /// Acknowledge with `Drop`.
    pub fn drop_message(&self) -> Result<(), AcknowledgeError> {
        self.acknowledge(AckStatus::Drop)
    }

    /// Send `status` back through the subscription that delivered this envelope.
    pub fn acknowledge(&self, status: AckStatus) -> Result<(), AcknowledgeError> {
        match &self.sink {
            Some(sink) => sink.acknowledge(&self.id, status),
            None => Err(AcknowledgeError::UnknownEnvelope {
                key: self.key(),
                id: self.id.clone(),
            }),
        }
    }

    pub(crate) fn attach_sink(&mut self, sink: Arc<dyn AckSink>) {
        self.sink = Some(sink);
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("pubsub_name", &self.pubsub_name)
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("raw_data_len", &self.raw_data.len())
            .field("metadata", &self.metadata)
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.pubsub_name == other.pubsub_name
            && self.topic == other.topic
            && self.id == other.id
            && self.raw_data == other.raw_data
            && self.metadata == other.metadata
            && self.content_type == other.content_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct RecordingSink(Mutex<Vec<(String, AckStatus)>>);

    impl AckSink for RecordingSink {
        fn acknowledge(&self, id: &str, status: AckStatus) -> Result<(), AcknowledgeError> {
            self.0.lock().push((id.to_string(), status));
            Ok(())
        }
    }

    #[test]
    fn test_detached_envelope_cannot_be_acknowledged() {
        let envelope = Envelope::new("messages", "neworder", "e1", b"{}".to_vec());
        let result = envelope.success();
        assert!(matches!(
            result,
            Err(AcknowledgeError::UnknownEnvelope { ref id, .. }) if id == "e1"
        ));
    }

    #[test]
    fn test_acknowledge_goes_through_sink() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let mut envelope = Envelope::new("messages", "neworder", "e1", Vec::new());
        envelope.attach_sink(sink.clone());

        envelope.retry().unwrap();
        envelope.drop_message().unwrap();

        let seen = sink.0.lock();
        assert_eq!(
            *seen,
            vec![
                ("e1".to_string(), AckStatus::Retry),
                ("e1".to_string(), AckStatus::Drop)
            ]
        );
    }

    #[test]
    fn test_json_payload() {
        let payload = serde_json::to_vec(&json!({"orderId": 7})).unwrap();
        let envelope = Envelope::new("messages", "neworder", "e1", payload)
            .with_content_type("application/json")
            .with_metadata("source", "test");

        let value: serde_json::Value = envelope.json().unwrap();
        assert_eq!(value["orderId"], 7);
        assert_eq!(envelope.content_type(), Some("application/json"));
        assert_eq!(envelope.metadata().get("source").map(String::as_str), Some("test"));
    }
}
