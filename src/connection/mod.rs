//! Broker connection and its delivery loop.
//!
//! A `Connection` owns one [`Transport`] and one delivery-loop thread. The
//! loop is the only reader of the transport: it resolves request waiters on
//! `Confirm`/`Reject` and routes `Deliver` frames to the channel of the
//! subscription that owns the stream. Sends happen directly from the
//! calling thread.
//!
//! # Example
//!
//! ```ignore
//! let conn = Connection::connect("127.0.0.1:50001", ConnectionConfig::default())?;
//!
//! let sub = conn.subscribe(SubscriptionOptions::new("messages", "neworder"))?;
//! let envelope = sub.receive()?;
//! envelope.success()?;
//! sub.close()?;
//! ```

mod memory;
mod transport;

pub use memory::{MemoryBroker, MemoryTransport, RecordedAck};
pub use transport::{Incoming, TcpTransport, Transport};

use crate::config::{ConnectionConfig, SubscriptionOptions};
use crate::envelope::Envelope;
use crate::error::{ConnectionError, ShutdownError, SubscribeError};
use crate::registry::Registry;
use crate::subscriptions::{Handler, PullSubscription, PushSubscription, StreamCore};
use crate::types::{AckStatus, RequestId, StreamId};
use crate::wire::Frame;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Broker verdict on a request.
type Reply = Result<(), String>;

/// What the delivery loop hands to a subscription.
pub(crate) enum Inbound {
    Deliver(Envelope),
    /// The connection is gone; nothing more will arrive.
    Fault(Arc<ConnectionError>),
}

/// Routing entry for one open stream.
struct Route {
    deliveries: Sender<Inbound>,
    core: Weak<StreamCore>,
}

/// Failure of a request-reply round trip.
pub(crate) enum RequestError {
    Connection(ConnectionError),
    Rejected(String),
    Timeout,
}

/// A request that has been sent and awaits the broker's reply.
pub(crate) struct PendingReply {
    request_id: RequestId,
    reply: Receiver<Reply>,
}

impl PendingReply {
    /// Wait up to `timeout` for the reply. May be called again after a
    /// timeout; the request stays registered until answered or forgotten.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<(), RequestError> {
        match self.reply.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(RequestError::Rejected(reason)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(RequestError::Timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(RequestError::Connection(ConnectionError::Closed))
            }
        }
    }
}

/// State shared between a connection, its delivery loop and its subscriptions.
pub(crate) struct Shared {
    transport: Arc<dyn Transport>,
    pub(crate) config: ConnectionConfig,
    pub(crate) registry: Arc<Registry>,
    /// Requests awaiting a reply.
    pending: Mutex<HashMap<RequestId, Sender<Reply>>>,
    /// Open streams.
    routes: RwLock<HashMap<StreamId, Route>>,
    next_request: AtomicU64,
    next_stream: AtomicU64,
    connected: AtomicBool,
}

impl Shared {
    pub(crate) fn next_stream_id(&self) -> StreamId {
        StreamId(self.next_stream.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a request built around a fresh request id and register for
    /// its reply.
    pub(crate) fn start_request<F>(&self, build: F) -> Result<PendingReply, ConnectionError>
    where
        F: FnOnce(RequestId) -> Frame,
    {
        let request_id = RequestId(self.next_request.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = bounded(1);
        self.pending.lock().insert(request_id, tx);

        // The delivery loop clears `pending` after flipping `connected`, so a
        // request registered after that would never be answered.
        if !self.is_connected() {
            self.pending.lock().remove(&request_id);
            return Err(ConnectionError::Closed);
        }

        if let Err(e) = self.transport.send(&build(request_id)) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        Ok(PendingReply {
            request_id,
            reply: rx,
        })
    }

    /// Send a request whose reply nobody waits for.
    pub(crate) fn send_unconfirmed<F>(&self, build: F) -> Result<(), ConnectionError>
    where
        F: FnOnce(RequestId) -> Frame,
    {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }
        let request_id = RequestId(self.next_request.fetch_add(1, Ordering::SeqCst));
        self.transport.send(&build(request_id))
    }

    /// Stop waiting for a reply.
    pub(crate) fn forget(&self, pending: PendingReply) {
        self.pending.lock().remove(&pending.request_id);
    }

    pub(crate) fn add_route(&self, stream: StreamId, deliveries: Sender<Inbound>, core: Weak<StreamCore>) {
        self.routes.write().insert(stream, Route { deliveries, core });
    }

    pub(crate) fn remove_route(&self, stream: StreamId) {
        self.routes.write().remove(&stream);
    }

    /// Subscriptions that are still routed.
    fn live_streams(&self) -> Vec<Arc<StreamCore>> {
        let routes = self.routes.read();
        let mut streams: Vec<(StreamId, Arc<StreamCore>)> = routes
            .iter()
            .filter_map(|(id, route)| route.core.upgrade().map(|core| (*id, core)))
            .collect();
        streams.sort_by_key(|(id, _)| *id);
        streams.into_iter().map(|(_, core)| core).collect()
    }

    fn resolve(&self, request_id: RequestId, reply: Reply) {
        match self.pending.lock().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::trace!(?request_id, "reply for a request nobody waits on"),
        }
    }

    fn route(&self, stream: StreamId, envelope: Envelope) {
        let undelivered = {
            let routes = self.routes.read();
            match routes.get(&stream) {
                Some(route) => match route.deliveries.send(Inbound::Deliver(envelope)) {
                    Ok(()) => None,
                    Err(crossbeam_channel::SendError(Inbound::Deliver(envelope))) => Some(envelope),
                    Err(_) => None,
                },
                None => Some(envelope),
            }
        };

        // Nobody will see this delivery; hand it back so it can be redelivered.
        if let Some(envelope) = undelivered {
            tracing::debug!(
                %stream,
                envelope = envelope.id(),
                "delivery for a closed stream, returning it to the broker"
            );
            let result = self.send_unconfirmed(|request_id| Frame::Ack {
                request_id,
                stream,
                envelope_id: envelope.id().to_string(),
                status: AckStatus::Retry,
            });
            if let Err(e) = result {
                tracing::warn!(%stream, error = %e, "failed to return undeliverable envelope");
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Confirm { request_id } => self.resolve(request_id, Ok(())),
            Frame::Reject { request_id, reason } => self.resolve(request_id, Err(reason)),
            Frame::Deliver { stream, envelope } => self.route(stream, envelope),
            other => tracing::warn!(kind = other.kind(), "unexpected frame from broker"),
        }
    }

    /// Fail every waiter and stream after the transport is gone.
    fn fail_all(&self, fault: Option<ConnectionError>) {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().clear();

        let fault = Arc::new(fault.unwrap_or(ConnectionError::Closed));
        for route in self.routes.read().values() {
            let _ = route.deliveries.send(Inbound::Fault(Arc::clone(&fault)));
        }
    }
}

/// The delivery loop: drain the transport until it ends.
fn run_delivery_loop(shared: Arc<Shared>) {
    let mut incoming = Incoming::new(Arc::clone(&shared.transport));
    for frame in &mut incoming {
        shared.dispatch(frame);
    }

    let fault = incoming.into_fault();
    match &fault {
        Some(e) => tracing::warn!(error = %e, "broker connection failed"),
        None => tracing::info!("broker connection closed"),
    }
    shared.fail_all(fault);
}

/// A connection to a broker.
///
/// Dropping the connection shuts the transport down; subscriptions that
/// outlive it observe a transport fault.
pub struct Connection {
    shared: Arc<Shared>,
    delivery_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to a broker at `endpoint` (`host:port`) over TCP.
    pub fn connect(endpoint: &str, config: ConnectionConfig) -> Result<Self, ConnectionError> {
        let transport =
            TcpTransport::connect(endpoint, config.connect_timeout, config.max_frame_bytes)?;
        tracing::info!(endpoint, "connected to broker");
        Self::with_transport(Arc::new(transport), config)
    }

    /// Run a connection over an already established transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        Self::with_registry(transport, Arc::new(Registry::new()), config)
    }

    /// Run a connection that records its subscriptions in `registry`.
    ///
    /// Sharing one registry between connections makes duplicate detection
    /// span all of them.
    pub fn with_registry(
        transport: Arc<dyn Transport>,
        registry: Arc<Registry>,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        let shared = Arc::new(Shared {
            transport,
            config,
            registry,
            pending: Mutex::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            next_stream: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        });

        let loop_shared = Arc::clone(&shared);
        let delivery_loop = thread::Builder::new()
            .name("pubsub-delivery".to_string())
            .spawn(move || run_delivery_loop(loop_shared))?;

        Ok(Self {
            shared,
            delivery_loop: Mutex::new(Some(delivery_loop)),
        })
    }

    /// Open a pull subscription.
    pub fn subscribe(&self, options: SubscriptionOptions) -> Result<PullSubscription, SubscribeError> {
        PullSubscription::open(&self.shared, options)
    }

    /// Open a push subscription that invokes `handler` for each envelope.
    pub fn subscribe_with_handler<H>(
        &self,
        options: SubscriptionOptions,
        handler: H,
    ) -> Result<PushSubscription, SubscribeError>
    where
        H: Handler,
    {
        PushSubscription::open(&self.shared, options, Box::new(handler))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Whether the delivery loop is still reading from the broker.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Close every open subscription, then the transport.
    ///
    /// Every failure is collected; a failing subscription does not stop the
    /// others from being closed.
    pub fn shutdown(&self) -> Result<(), ShutdownError> {
        let streams = self.shared.live_streams();
        tracing::info!(subscriptions = streams.len(), "shutting down connection");

        let mut error = match ShutdownError::from_results(streams.iter().map(|core| core.close())) {
            Ok(()) => ShutdownError::default(),
            Err(e) => e,
        };

        if let Err(e) = self.shared.transport.shutdown() {
            error.transport = Some(e);
        }
        if let Some(handle) = self.delivery_loop.lock().take() {
            let _ = handle.join();
        }

        if error.is_empty() {
            Ok(())
        } else {
            Err(error)
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.shared.transport.shutdown() {
            tracing::debug!(error = %e, "transport shutdown on drop failed");
        }
    }
}
