//! Broker wire frames and their byte-stream encoding.
//!
//! Frames are MessagePack-encoded. On byte-stream transports each frame is
//! written as:
//!
//! ```text
//! | len: u32 LE | payload: len bytes | crc32(payload): u32 LE |
//! ```

use crate::envelope::Envelope;
use crate::error::ConnectionError;
use crate::types::{AckStatus, RequestId, StreamId, SubscriptionMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};

/// Frames exchanged with the broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    // --- Client to broker ---
    /// Open a topic stream.
    Subscribe {
        request_id: RequestId,
        stream: StreamId,
        pubsub_name: String,
        topic: String,
        mode: SubscriptionMode,
        metadata: HashMap<String, String>,
        dead_letter_topic: Option<String>,
    },

    /// Verdict for one delivered envelope.
    Ack {
        request_id: RequestId,
        stream: StreamId,
        envelope_id: String,
        status: AckStatus,
    },

    /// Tear a topic stream down.
    Unsubscribe {
        request_id: RequestId,
        stream: StreamId,
    },

    // --- Broker to client ---
    /// A request succeeded.
    Confirm { request_id: RequestId },

    /// A request failed.
    Reject { request_id: RequestId, reason: String },

    /// A message on an open stream.
    Deliver { stream: StreamId, envelope: Envelope },
}

impl Frame {
    /// Request id of a reply frame.
    pub fn reply_to(&self) -> Option<RequestId> {
        match self {
            Frame::Confirm { request_id } | Frame::Reject { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Subscribe { .. } => "subscribe",
            Frame::Ack { .. } => "ack",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Confirm { .. } => "confirm",
            Frame::Reject { .. } => "reject",
            Frame::Deliver { .. } => "deliver",
        }
    }
}

/// Encode a frame payload (no length prefix or checksum).
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ConnectionError> {
    Ok(rmp_serde::to_vec(frame)?)
}

/// Decode a frame payload produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Frame, ConnectionError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Write one length-prefixed, checksummed frame.
pub fn write_frame<W: Write>(
    writer: &mut W,
    frame: &Frame,
    max_len: usize,
) -> Result<(), ConnectionError> {
    let encoded = encode(frame)?;
    if encoded.len() > max_len {
        return Err(ConnectionError::FrameTooLarge {
            len: encoded.len(),
            limit: max_len,
        });
    }

    let len = encoded.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&encoded)?;

    let checksum = crc32fast::hash(&encoded);
    writer.write_all(&checksum.to_le_bytes())?;

    Ok(())
}

/// Read one frame written by [`write_frame`].
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Option<Frame>, ConnectionError> {
    let mut len_bytes = [0u8; 4];

    // Only an end of stream before the first header byte is clean.
    loop {
        match reader.read(&mut len_bytes[..1]) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    reader.read_exact(&mut len_bytes[1..])?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > max_len {
        return Err(ConnectionError::FrameTooLarge {
            len,
            limit: max_len,
        });
    }

    let mut encoded = vec![0u8; len];
    reader.read_exact(&mut encoded)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    let computed_checksum = crc32fast::hash(&encoded);
    if stored_checksum != computed_checksum {
        return Err(ConnectionError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    decode(&encoded).map(Some)
}
