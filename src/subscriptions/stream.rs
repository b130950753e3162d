//! One topic stream: subscribe handshake, delivery bookkeeping, teardown.
//!
//! Pull and push subscriptions are thin fronts over `StreamCore`. The core
//! owns the stream's delivery channel, the set of envelopes handed out but
//! not yet acknowledged, and the close protocol:
//!
//! 1. `Active -> Closing`; the closing signal is dropped, waking every
//!    blocked `receive` (and the push worker).
//! 2. Wait on the gate for the in-flight `receive` or handler call.
//! 3. Return every outstanding or queued envelope to the broker as `Retry`.
//!    An envelope whose acknowledgment is still in flight is left to that
//!    call, which returns it the same way if the broker does not confirm.
//! 4. Send one unsubscribe and wait for its confirmation. On failure the
//!    handle stays `Closing` and the request is kept, so a retry waits on
//!    the same confirmation instead of sending a second unsubscribe.
//! 5. Drop the route, `Closing -> Closed`, deregister.

use crate::config::SubscriptionOptions;
use crate::connection::{Inbound, PendingReply, RequestError, Shared};
use crate::envelope::{AckSink, Envelope};
use crate::error::{
    AcknowledgeError, CloseError, ConnectionError, Operation, ReceiveError, SubscribeError,
    TimeoutError,
};
use crate::registry::SubscriptionHandle;
use crate::types::{AckStatus, StreamId, SubscriptionMode, SubscriptionState, TopicKey};
use crate::wire::Frame;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// An envelope handed out and not yet acknowledged.
struct Outstanding {
    id: String,
    /// An acknowledgment for it awaits the broker's reply.
    acking: bool,
}

pub(crate) struct StreamCore {
    shared: Arc<Shared>,
    handle: Arc<SubscriptionHandle>,
    stream: StreamId,
    deliveries: Receiver<Inbound>,
    /// Dropped when closing begins or the connection fails.
    closing_tx: Mutex<Option<Sender<()>>>,
    closing_rx: Receiver<()>,
    /// Shared by each in-flight `receive` or handler call; close takes it
    /// exclusively to wait them out.
    gate: RwLock<()>,
    /// Envelopes handed to the consumer and not yet acknowledged.
    outstanding: Mutex<Vec<Outstanding>>,
    /// Unsubscribe request of a close attempt that has not completed.
    unsubscribe: Mutex<Option<PendingReply>>,
    /// Serializes close attempts.
    close_lock: Mutex<()>,
    /// First transport fault seen on this stream.
    fault: Mutex<Option<Arc<ConnectionError>>>,
    /// Thread running the push handler, if any.
    worker: Mutex<Option<ThreadId>>,
}

impl StreamCore {
    /// Register, subscribe, and wait for the broker to confirm.
    pub(crate) fn open(
        shared: &Arc<Shared>,
        options: &SubscriptionOptions,
        mode: SubscriptionMode,
    ) -> Result<Arc<Self>, SubscribeError> {
        let handle = shared
            .registry
            .register(options.key(), mode)
            .map_err(|dup| SubscribeError::Duplicate {
                key: dup.key,
                existing: dup.existing.mode(),
            })?;

        let stream = shared.next_stream_id();
        let (deliveries_tx, deliveries) = unbounded();
        let (closing_tx, closing_rx) = bounded(0);

        let core = Arc::new(Self {
            shared: Arc::clone(shared),
            handle,
            stream,
            deliveries,
            closing_tx: Mutex::new(Some(closing_tx)),
            closing_rx,
            gate: RwLock::new(()),
            outstanding: Mutex::new(Vec::new()),
            unsubscribe: Mutex::new(None),
            close_lock: Mutex::new(()),
            fault: Mutex::new(None),
            worker: Mutex::new(None),
        });

        // Routed before the request goes out so no delivery can race the confirmation.
        shared.add_route(stream, deliveries_tx, Arc::downgrade(&core));

        if let Err(e) = core.handshake(options, mode) {
            core.abandon();
            tracing::warn!(
                pubsub = %options.pubsub_name,
                topic = %options.topic,
                error = %e,
                "subscribe failed"
            );
            return Err(e);
        }

        if let Err(current) = core.handle.transition(SubscriptionState::Active) {
            // Torn down locally while the handshake was in flight
            core.abandon();
            tracing::warn!(topic = %core.key(), ?current, "subscription closed before it became active");
            return Err(SubscribeError::Connection {
                key: core.key().clone(),
                source: ConnectionError::Closed,
            });
        }
        tracing::info!(
            pubsub = %options.pubsub_name,
            topic = %options.topic,
            %stream,
            ?mode,
            "subscription active"
        );
        Ok(core)
    }

    fn handshake(
        &self,
        options: &SubscriptionOptions,
        mode: SubscriptionMode,
    ) -> Result<(), SubscribeError> {
        let stream = self.stream;
        let pending = self
            .shared
            .start_request(|request_id| Frame::Subscribe {
                request_id,
                stream,
                pubsub_name: options.pubsub_name.clone(),
                topic: options.topic.clone(),
                mode,
                metadata: options.metadata.clone(),
                dead_letter_topic: options.dead_letter_topic.clone(),
            })
            .map_err(|source| SubscribeError::Connection {
                key: self.key().clone(),
                source,
            })?;

        let timeout = self.shared.config.subscribe_timeout;
        match pending.wait(timeout) {
            Ok(()) => Ok(()),
            Err(RequestError::Rejected(reason)) => Err(SubscribeError::Rejected {
                key: self.key().clone(),
                reason,
            }),
            Err(RequestError::Connection(source)) => Err(SubscribeError::Connection {
                key: self.key().clone(),
                source,
            }),
            Err(RequestError::Timeout) => {
                self.shared.forget(pending);
                // The broker may still open the stream; ask it not to.
                let _ = self
                    .shared
                    .send_unconfirmed(|request_id| Frame::Unsubscribe { request_id, stream });
                Err(SubscribeError::Timeout(TimeoutError {
                    operation: Operation::Subscribe,
                    key: self.key().clone(),
                    after: timeout,
                }))
            }
        }
    }

    /// Undo a subscribe that never became active.
    fn abandon(&self) {
        self.shared.remove_route(self.stream);
        self.closing_tx.lock().take();
        self.release_queued();
        self.handle.mark_closed();
        self.shared.registry.deregister(&self.handle);
    }

    pub(crate) fn key(&self) -> &TopicKey {
        self.handle.key()
    }

    pub(crate) fn handle(&self) -> &Arc<SubscriptionHandle> {
        &self.handle
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        self.handle.state()
    }

    pub(crate) fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Hold off a concurrent close while delivering one envelope.
    pub(crate) fn gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read()
    }

    pub(crate) fn set_worker(&self, id: ThreadId) {
        *self.worker.lock() = Some(id);
    }

    fn on_worker_thread(&self) -> bool {
        *self.worker.lock() == Some(thread::current().id())
    }

    fn closed_error(&self) -> ReceiveError {
        ReceiveError::Closed {
            key: self.key().clone(),
        }
    }

    fn fault_error(&self) -> Option<ReceiveError> {
        let fault = self.fault.lock().clone()?;
        Some(ReceiveError::Transport {
            key: self.key().clone(),
            source: fault,
        })
    }

    /// Why the closing signal fired: a close, or a transport fault.
    fn wake_error(&self) -> ReceiveError {
        if self.state().is_terminating() {
            return self.closed_error();
        }
        self.fault_error().unwrap_or_else(|| self.closed_error())
    }

    /// Keep the first fault and wake every blocked `receive`; only one of
    /// them takes the fault off the channel.
    fn record_fault(&self, fault: Arc<ConnectionError>) {
        self.fault.lock().get_or_insert(fault);
        self.closing_tx.lock().take();
    }

    // --- Delivery ---

    /// Block for the next envelope, up to `timeout` if given.
    ///
    /// `Ok(None)` only when the timeout elapsed.
    pub(crate) fn receive(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, ReceiveError> {
        let _gate = self.gate();
        self.next_envelope(timeout.map(|t| Instant::now() + t))
    }

    /// Take the next envelope off the stream. Callers hold the gate.
    pub(crate) fn next_envelope(
        self: &Arc<Self>,
        deadline: Option<Instant>,
    ) -> Result<Option<Envelope>, ReceiveError> {
        loop {
            if self.state().is_terminating() {
                return Err(self.closed_error());
            }
            if let Some(error) = self.fault_error() {
                return Err(error);
            }

            let inbound = match deadline {
                None => select! {
                    recv(self.deliveries) -> msg => msg.ok(),
                    recv(self.closing_rx) -> _ => return Err(self.wake_error()),
                },
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    select! {
                        recv(self.deliveries) -> msg => msg.ok(),
                        recv(self.closing_rx) -> _ => return Err(self.wake_error()),
                        default(remaining) => return Ok(None),
                    }
                }
            };

            match inbound {
                Some(Inbound::Deliver(envelope)) => {
                    if let Some(envelope) = self.hand_out(envelope)? {
                        return Ok(Some(envelope));
                    }
                }
                Some(Inbound::Fault(fault)) => self.record_fault(fault),
                // Route dropped: the stream is being torn down.
                None => return Err(self.closed_error()),
            }
        }
    }

    /// Record `envelope` as outstanding and attach its ack sink.
    ///
    /// Returns `Ok(None)` for a redelivery of an id that is still
    /// outstanding; the pending acknowledgment covers it.
    fn hand_out(self: &Arc<Self>, mut envelope: Envelope) -> Result<Option<Envelope>, ReceiveError> {
        let mut outstanding = self.outstanding.lock();

        if self.state().is_terminating() {
            drop(outstanding);
            self.return_to_broker(envelope.id());
            return Err(self.closed_error());
        }

        if outstanding.iter().any(|entry| entry.id == envelope.id()) {
            tracing::warn!(
                pubsub = %self.key().pubsub_name,
                topic = %self.key().topic,
                envelope = envelope.id(),
                "duplicate delivery of an outstanding envelope ignored"
            );
            return Ok(None);
        }

        outstanding.push(Outstanding {
            id: envelope.id().to_string(),
            acking: false,
        });
        envelope.attach_sink(Arc::clone(self) as Arc<dyn AckSink>);
        Ok(Some(envelope))
    }

    /// Hand an envelope back to the broker for redelivery without waiting
    /// for confirmation.
    fn return_to_broker(&self, envelope_id: &str) {
        let stream = self.stream;
        let result = self.shared.send_unconfirmed(|request_id| Frame::Ack {
            request_id,
            stream,
            envelope_id: envelope_id.to_string(),
            status: AckStatus::Retry,
        });
        if let Err(e) = result {
            tracing::warn!(
                topic = %self.key(),
                envelope = envelope_id,
                error = %e,
                "failed to return envelope to broker"
            );
        }
    }

    /// Return every envelope with no acknowledgment in flight. The others
    /// are settled by their `acknowledge_id` call.
    fn release_outstanding(&self) {
        let ids: Vec<String> = {
            let mut outstanding = self.outstanding.lock();
            let (acking, idle): (Vec<_>, Vec<_>) =
                outstanding.drain(..).partition(|entry| entry.acking);
            *outstanding = acking;
            idle.into_iter().map(|entry| entry.id).collect()
        };
        for id in &ids {
            self.return_to_broker(id);
        }
        if !ids.is_empty() {
            tracing::debug!(topic = %self.key(), count = ids.len(), "returned unacknowledged envelopes");
        }
    }

    fn release_queued(&self) {
        while let Ok(inbound) = self.deliveries.try_recv() {
            match inbound {
                Inbound::Deliver(envelope) => self.return_to_broker(envelope.id()),
                Inbound::Fault(fault) => self.record_fault(fault),
            }
        }
    }

    // --- Acknowledgment ---

    pub(crate) fn acknowledge_id(&self, id: &str, status: AckStatus) -> Result<(), AcknowledgeError> {
        let key = self.key();
        let state = self.state();
        if state == SubscriptionState::Closed {
            return Err(AcknowledgeError::Closed {
                key: key.clone(),
                id: id.to_string(),
            });
        }

        {
            let mut outstanding = self.outstanding.lock();
            match outstanding.iter_mut().find(|entry| entry.id == id) {
                Some(entry) if !entry.acking => entry.acking = true,
                // Another acknowledgment for it is on its way
                Some(_) => {
                    return Err(AcknowledgeError::UnknownEnvelope {
                        key: key.clone(),
                        id: id.to_string(),
                    })
                }
                // Close already returned it
                None if state.is_terminating() => {
                    return Err(AcknowledgeError::Closed {
                        key: key.clone(),
                        id: id.to_string(),
                    })
                }
                None => {
                    return Err(AcknowledgeError::UnknownEnvelope {
                        key: key.clone(),
                        id: id.to_string(),
                    })
                }
            }
        }

        let result = self.send_ack(id, status);
        self.settle(id, result.is_ok());
        result
    }

    fn send_ack(&self, id: &str, status: AckStatus) -> Result<(), AcknowledgeError> {
        let key = self.key();
        let stream = self.stream;
        let pending = self
            .shared
            .start_request(|request_id| Frame::Ack {
                request_id,
                stream,
                envelope_id: id.to_string(),
                status,
            })
            .map_err(|source| AcknowledgeError::Connection {
                key: key.clone(),
                id: id.to_string(),
                source,
            })?;

        let timeout = self.shared.config.ack_timeout;
        match pending.wait(timeout) {
            Ok(()) => {
                tracing::trace!(topic = %key, envelope = id, %status, "acknowledged");
                Ok(())
            }
            Err(RequestError::Rejected(reason)) => Err(AcknowledgeError::Rejected {
                key: key.clone(),
                id: id.to_string(),
                reason,
            }),
            Err(RequestError::Connection(source)) => Err(AcknowledgeError::Connection {
                key: key.clone(),
                id: id.to_string(),
                source,
            }),
            Err(RequestError::Timeout) => {
                self.shared.forget(pending);
                Err(AcknowledgeError::Timeout(TimeoutError {
                    operation: Operation::Acknowledge,
                    key: key.clone(),
                    after: timeout,
                }))
            }
        }
    }

    /// Finish an acknowledgment attempt. A confirmed envelope is done. An
    /// unconfirmed one stays outstanding so the caller can acknowledge it
    /// again, unless the stream is closing, in which case it goes back to
    /// the broker like every other unacknowledged envelope.
    fn settle(&self, id: &str, confirmed: bool) {
        let returned = {
            let mut outstanding = self.outstanding.lock();
            let Some(index) = outstanding.iter().position(|entry| entry.id == id) else {
                return;
            };
            if confirmed || self.state().is_terminating() {
                outstanding.remove(index);
                !confirmed
            } else {
                outstanding[index].acking = false;
                false
            }
        };

        if returned {
            self.return_to_broker(id);
        }
    }

    // --- Teardown ---

    pub(crate) fn close(&self) -> Result<(), CloseError> {
        let _close = self.close_lock.lock();

        match self.state() {
            SubscriptionState::Closed => return Ok(()),
            // Still in its subscribe handshake; that call owns the outcome.
            SubscriptionState::Opening => return Ok(()),
            SubscriptionState::Active => {
                let _ = self.handle.transition(SubscriptionState::Closing);
                tracing::debug!(topic = %self.key(), stream = %self.stream, "closing subscription");
            }
            SubscriptionState::Closing => {
                tracing::debug!(topic = %self.key(), "retrying close");
            }
        }

        self.quiesce();

        let timeout = self.shared.config.close_timeout;
        let mut unsubscribe = self.unsubscribe.lock();
        let pending = match unsubscribe.take() {
            Some(pending) => pending,
            None => {
                let stream = self.stream;
                self.shared
                    .start_request(|request_id| Frame::Unsubscribe { request_id, stream })
                    .map_err(|source| CloseError::Connection {
                        key: self.key().clone(),
                        source,
                    })?
            }
        };

        match pending.wait(timeout) {
            Ok(()) => {}
            Err(RequestError::Timeout) => {
                *unsubscribe = Some(pending);
                return Err(CloseError::Timeout(TimeoutError {
                    operation: Operation::Unsubscribe,
                    key: self.key().clone(),
                    after: timeout,
                }));
            }
            Err(RequestError::Rejected(reason)) => {
                return Err(CloseError::Rejected {
                    key: self.key().clone(),
                    reason,
                })
            }
            Err(RequestError::Connection(source)) => {
                return Err(CloseError::Connection {
                    key: self.key().clone(),
                    source,
                })
            }
        }
        drop(unsubscribe);

        self.finish();
        Ok(())
    }

    /// Tear the stream down locally without waiting for the broker.
    pub(crate) fn force_close(&self) {
        let _close = self.close_lock.lock();
        if self.state() == SubscriptionState::Closed {
            return;
        }
        if self.state() == SubscriptionState::Active {
            let _ = self.handle.transition(SubscriptionState::Closing);
        }

        self.quiesce();
        if let Some(pending) = self.unsubscribe.lock().take() {
            self.shared.forget(pending);
        } else {
            let stream = self.stream;
            let _ = self
                .shared
                .send_unconfirmed(|request_id| Frame::Unsubscribe { request_id, stream });
        }

        tracing::warn!(topic = %self.key(), "subscription force-closed");
        self.finish();
    }

    /// Stop deliveries, wait out in-flight consumers, return what they
    /// never acknowledged.
    fn quiesce(&self) {
        self.closing_tx.lock().take();

        // A handler stopping its own subscription already holds the gate.
        let _gate = if self.on_worker_thread() {
            None
        } else {
            Some(self.gate.write())
        };

        self.release_outstanding();
        self.release_queued();
    }

    fn finish(&self) {
        self.shared.remove_route(self.stream);
        // Anything routed between quiesce and route removal
        self.release_queued();
        self.handle.mark_closed();
        self.shared.registry.deregister(&self.handle);
        tracing::info!(topic = %self.key(), stream = %self.stream, "subscription closed");
    }
}

impl AckSink for StreamCore {
    fn acknowledge(&self, id: &str, status: AckStatus) -> Result<(), AcknowledgeError> {
        self.acknowledge_id(id, status)
    }
}
