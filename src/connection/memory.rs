//! In-process transport and loopback broker.
//!
//! `MemoryBroker` speaks the same frame protocol as a remote broker but lives
//! in the current process. Frames cross the in-memory channel encoded, so
//! the codec is exercised exactly as on a socket. Used by tests, benchmarks
//! and local demos.

use crate::envelope::Envelope;
use crate::error::ConnectionError;
use crate::types::{AckStatus, RequestId, StreamId, TopicKey};
use crate::wire::{self, Frame};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use super::transport::Transport;

/// Client side of an in-memory broker link.
pub struct MemoryTransport {
    to_broker: Mutex<Option<Sender<Vec<u8>>>>,
    from_broker: Receiver<Vec<u8>>,
    /// Dropped on shutdown to wake a blocked `recv`.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    max_frame_bytes: usize,
}

impl Transport for MemoryTransport {
    fn send(&self, frame: &Frame) -> Result<(), ConnectionError> {
        let encoded = wire::encode(frame)?;
        if encoded.len() > self.max_frame_bytes {
            return Err(ConnectionError::FrameTooLarge {
                len: encoded.len(),
                limit: self.max_frame_bytes,
            });
        }

        let to_broker = self.to_broker.lock();
        match to_broker.as_ref() {
            Some(tx) => tx.send(encoded).map_err(|_| ConnectionError::Closed),
            None => Err(ConnectionError::Closed),
        }
    }

    fn recv(&self) -> Result<Option<Frame>, ConnectionError> {
        select! {
            recv(self.from_broker) -> msg => match msg {
                Ok(bytes) => wire::decode(&bytes).map(Some),
                Err(_) => Ok(None),
            },
            recv(self.shutdown_rx) -> _ => Ok(None),
        }
    }

    fn shutdown(&self) -> Result<(), ConnectionError> {
        self.to_broker.lock().take();
        self.shutdown_tx.lock().take();
        Ok(())
    }
}

/// One acknowledgment as seen by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedAck {
    pub key: Option<TopicKey>,
    pub envelope_id: String,
    pub status: AckStatus,
}

type ConnId = u64;

#[derive(Default)]
struct Holds {
    subscribe: bool,
    ack: bool,
    unsubscribe: bool,
}

#[derive(Default)]
struct BrokerState {
    /// Outbound channel per client connection.
    clients: HashMap<ConnId, Sender<Vec<u8>>>,
    /// Open streams and the key each one is subscribed to.
    streams: HashMap<(ConnId, StreamId), TopicKey>,
    /// Topics whose subscribe requests are rejected, with the reason.
    rejected: HashMap<String, String>,
    /// Reason every ack is rejected with, if set.
    ack_rejection: Option<String>,
    /// Every frame received from clients, in arrival order.
    frames: Vec<Frame>,
    acks: Vec<RecordedAck>,
    holds: Holds,
    /// Replies withheld while a hold is in place.
    held: Vec<(ConnId, RequestId)>,
}

/// An in-process broker serving any number of `MemoryTransport` clients.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_conn: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client link. The broker serves it on its own thread until
    /// either side hangs up.
    pub fn connect(&self, max_frame_bytes: usize) -> Result<MemoryTransport, ConnectionError> {
        let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
        let (client_tx, broker_rx) = unbounded::<Vec<u8>>();
        let (broker_tx, client_rx) = unbounded::<Vec<u8>>();
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();

        self.state.lock().clients.insert(conn, broker_tx);

        let broker = self.clone();
        thread::Builder::new()
            .name(format!("memory-broker-{}", conn))
            .spawn(move || broker.serve(conn, broker_rx))?;

        Ok(MemoryTransport {
            to_broker: Mutex::new(Some(client_tx)),
            from_broker: client_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            max_frame_bytes,
        })
    }

    fn serve(&self, conn: ConnId, inbound: Receiver<Vec<u8>>) {
        while let Ok(bytes) = inbound.recv() {
            match wire::decode(&bytes) {
                Ok(frame) => self.handle(conn, frame),
                Err(e) => tracing::warn!(conn, error = %e, "broker dropped undecodable frame"),
            }
        }

        let mut state = self.state.lock();
        state.clients.remove(&conn);
        state.streams.retain(|(c, _), _| *c != conn);
        tracing::debug!(conn, "broker connection closed");
    }

    fn handle(&self, conn: ConnId, frame: Frame) {
        let mut state = self.state.lock();
        state.frames.push(frame.clone());

        let (request_id, held) = match frame {
            Frame::Subscribe {
                request_id,
                stream,
                pubsub_name,
                topic,
                ..
            } => {
                if let Some(reason) = state.rejected.get(&topic).cloned() {
                    Self::reply(&state, conn, Frame::Reject { request_id, reason });
                    return;
                }
                state
                    .streams
                    .insert((conn, stream), TopicKey::new(pubsub_name, topic));
                (request_id, state.holds.subscribe)
            }
            Frame::Ack {
                request_id,
                stream,
                envelope_id,
                status,
            } => {
                if let Some(reason) = state.ack_rejection.clone() {
                    Self::reply(&state, conn, Frame::Reject { request_id, reason });
                    return;
                }
                let key = state.streams.get(&(conn, stream)).cloned();
                state.acks.push(RecordedAck {
                    key,
                    envelope_id,
                    status,
                });
                (request_id, state.holds.ack)
            }
            Frame::Unsubscribe { request_id, stream } => {
                state.streams.remove(&(conn, stream));
                (request_id, state.holds.unsubscribe)
            }
            other => {
                tracing::warn!(conn, kind = other.kind(), "broker ignoring unexpected frame");
                return;
            }
        };

        if held {
            state.held.push((conn, request_id));
        } else {
            Self::reply(&state, conn, Frame::Confirm { request_id });
        }
    }

    fn reply(state: &BrokerState, conn: ConnId, frame: Frame) {
        let Some(tx) = state.clients.get(&conn) else {
            return;
        };
        match wire::encode(&frame) {
            Ok(bytes) => {
                let _ = tx.send(bytes);
            }
            Err(e) => tracing::warn!(conn, error = %e, "broker failed to encode reply"),
        }
    }

    /// Deliver `envelope` to every stream subscribed to its key.
    ///
    /// Returns the number of streams it was sent to.
    pub fn publish(&self, envelope: Envelope) -> usize {
        let state = self.state.lock();
        let key = envelope.key();

        let mut targets: Vec<(ConnId, StreamId)> = state
            .streams
            .iter()
            .filter(|(_, k)| **k == key)
            .map(|(target, _)| *target)
            .collect();
        targets.sort();

        for (conn, stream) in &targets {
            Self::reply(
                &state,
                *conn,
                Frame::Deliver {
                    stream: *stream,
                    envelope: envelope.clone(),
                },
            );
        }
        targets.len()
    }

    /// Send a raw frame to every connected client.
    pub fn broadcast_frame(&self, frame: Frame) {
        let state = self.state.lock();
        for conn in state.clients.keys() {
            Self::reply(&state, *conn, frame.clone());
        }
    }

    /// Reject future subscribe requests for `topic`.
    pub fn reject_topic(&self, topic: impl Into<String>, reason: impl Into<String>) {
        self.state.lock().rejected.insert(topic.into(), reason.into());
    }

    /// Reject every ack until [`accept_acks`](Self::accept_acks). Rejected
    /// acks are not recorded in [`acks`](Self::acks).
    pub fn reject_acks(&self, reason: impl Into<String>) {
        self.state.lock().ack_rejection = Some(reason.into());
    }

    pub fn accept_acks(&self) {
        self.state.lock().ack_rejection = None;
    }

    /// Withhold subscribe confirmations until [`release_held`](Self::release_held).
    pub fn hold_subscribes(&self) {
        self.state.lock().holds.subscribe = true;
    }

    /// Withhold ack confirmations until [`release_held`](Self::release_held).
    pub fn hold_acks(&self) {
        self.state.lock().holds.ack = true;
    }

    /// Withhold unsubscribe confirmations until [`release_held`](Self::release_held).
    pub fn hold_unsubscribes(&self) {
        self.state.lock().holds.unsubscribe = true;
    }

    /// Lift all holds and confirm everything withheld so far.
    pub fn release_held(&self) {
        let mut state = self.state.lock();
        state.holds = Holds::default();
        let held = std::mem::take(&mut state.held);
        for (conn, request_id) in held {
            Self::reply(&state, conn, Frame::Confirm { request_id });
        }
    }

    /// Hang up on every client.
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock();
        state.clients.clear();
        state.streams.clear();
    }

    /// Every frame received from clients so far.
    pub fn frames(&self) -> Vec<Frame> {
        self.state.lock().frames.clone()
    }

    /// Number of received frames of the given kind (see [`Frame::kind`]).
    pub fn frame_count(&self, kind: &str) -> usize {
        self.state
            .lock()
            .frames
            .iter()
            .filter(|f| f.kind() == kind)
            .count()
    }

    pub fn acks(&self) -> Vec<RecordedAck> {
        self.state.lock().acks.clone()
    }

    /// Number of open streams across all clients.
    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024 * 1024;

    fn recv_within(transport: &MemoryTransport) -> Option<Frame> {
        transport.recv().unwrap()
    }

    fn subscribe(request_id: u64, stream: u64, topic: &str) -> Frame {
        Frame::Subscribe {
            request_id: RequestId(request_id),
            stream: StreamId(stream),
            pubsub_name: "messages".into(),
            topic: topic.into(),
            mode: crate::types::SubscriptionMode::Pull,
            metadata: HashMap::new(),
            dead_letter_topic: None,
        }
    }

    #[test]
    fn test_subscribe_publish_ack() {
        let broker = MemoryBroker::new();
        let transport = broker.connect(LIMIT).unwrap();

        transport.send(&subscribe(1, 7, "neworder")).unwrap();
        assert_eq!(
            recv_within(&transport),
            Some(Frame::Confirm {
                request_id: RequestId(1)
            })
        );

        let delivered = broker.publish(Envelope::new("messages", "neworder", "e1", b"x".to_vec()));
        assert_eq!(delivered, 1);
        match recv_within(&transport) {
            Some(Frame::Deliver { stream, envelope }) => {
                assert_eq!(stream, StreamId(7));
                assert_eq!(envelope.id(), "e1");
            }
            other => panic!("Expected Deliver, got {:?}", other),
        }

        transport
            .send(&Frame::Ack {
                request_id: RequestId(2),
                stream: StreamId(7),
                envelope_id: "e1".into(),
                status: AckStatus::Success,
            })
            .unwrap();
        assert!(recv_within(&transport).is_some());
        assert_eq!(
            broker.acks(),
            vec![RecordedAck {
                key: Some(TopicKey::new("messages", "neworder")),
                envelope_id: "e1".into(),
                status: AckStatus::Success,
            }]
        );
    }

    #[test]
    fn test_rejected_topic() {
        let broker = MemoryBroker::new();
        broker.reject_topic("forbidden", "not allowed");
        let transport = broker.connect(LIMIT).unwrap();

        transport.send(&subscribe(1, 1, "forbidden")).unwrap();
        assert_eq!(
            recv_within(&transport),
            Some(Frame::Reject {
                request_id: RequestId(1),
                reason: "not allowed".into()
            })
        );
        assert_eq!(broker.stream_count(), 0);
    }

    #[test]
    fn test_rejected_ack_not_recorded() {
        let broker = MemoryBroker::new();
        let transport = broker.connect(LIMIT).unwrap();
        transport.send(&subscribe(1, 7, "neworder")).unwrap();
        recv_within(&transport);

        broker.reject_acks("ack refused");
        transport
            .send(&Frame::Ack {
                request_id: RequestId(2),
                stream: StreamId(7),
                envelope_id: "e1".into(),
                status: AckStatus::Success,
            })
            .unwrap();
        assert_eq!(
            recv_within(&transport),
            Some(Frame::Reject {
                request_id: RequestId(2),
                reason: "ack refused".into()
            })
        );
        assert!(broker.acks().is_empty());
        assert_eq!(broker.frame_count("ack"), 1);
    }

    #[test]
    fn test_shutdown_unblocks_recv_and_fails_send() {
        let broker = MemoryBroker::new();
        let transport = broker.connect(LIMIT).unwrap();

        transport.shutdown().unwrap();
        assert!(matches!(transport.recv(), Ok(None)));
        assert!(matches!(
            transport.send(&subscribe(1, 1, "neworder")),
            Err(ConnectionError::Closed)
        ));
    }
}
