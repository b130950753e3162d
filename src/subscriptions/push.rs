//! Push subscriptions: a handler is invoked for each envelope.

use crate::config::SubscriptionOptions;
use crate::connection::Shared;
use crate::envelope::Envelope;
use crate::error::{AcknowledgeError, CloseError, ReceiveError, SubscribeError};
use crate::registry::SubscriptionHandle;
use crate::types::{AckStatus, SubscriptionMode, SubscriptionState, TopicKey};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use super::stream::StreamCore;

/// Processes envelopes of a push subscription.
///
/// The returned status is sent to the broker as the envelope's
/// acknowledgment. Calls for one subscription never overlap. A handler
/// should return in bounded time: closing the subscription waits for the
/// call in progress.
pub trait Handler: Send + 'static {
    fn handle(&mut self, envelope: &Envelope) -> AckStatus;
}

impl<F> Handler for F
where
    F: FnMut(&Envelope) -> AckStatus + Send + 'static,
{
    fn handle(&mut self, envelope: &Envelope) -> AckStatus {
        self(envelope)
    }
}

/// A running push subscription.
///
/// Dropping it stops the subscription unless it was converted with
/// [`into_stop_fn`](Self::into_stop_fn).
pub struct PushSubscription {
    core: Arc<StreamCore>,
    stop_on_drop: bool,
}

impl PushSubscription {
    pub(crate) fn open(
        shared: &Arc<Shared>,
        options: SubscriptionOptions,
        handler: Box<dyn Handler>,
    ) -> Result<Self, SubscribeError> {
        let core = StreamCore::open(shared, &options, SubscriptionMode::Push)?;

        let worker_core = Arc::clone(&core);
        let spawned = thread::Builder::new()
            .name(format!("push-{}", core.key()))
            .spawn(move || run_worker(worker_core, handler));

        if let Err(source) = spawned {
            core.force_close();
            return Err(SubscribeError::Worker {
                key: core.key().clone(),
                source,
            });
        }

        Ok(Self {
            core,
            stop_on_drop: true,
        })
    }

    /// Stop delivering to the handler and close the stream. Idempotent.
    ///
    /// An envelope already inside the handler is allowed to finish. May be
    /// called from within the handler itself; the envelope being handled
    /// is then returned to the broker with `Retry`.
    pub fn stop(&self) -> Result<(), CloseError> {
        self.core.close()
    }

    /// A cloneable closure that stops this subscription.
    pub fn stop_fn(&self) -> impl Fn() -> Result<(), CloseError> + Send + Sync + Clone + 'static {
        let core = Arc::clone(&self.core);
        move || core.close()
    }

    /// Give up the RAII guard: the subscription keeps running until the
    /// returned closure is called.
    pub fn into_stop_fn(mut self) -> impl Fn() -> Result<(), CloseError> + Send + Sync + Clone + 'static {
        self.stop_on_drop = false;
        self.stop_fn()
    }

    /// Close locally without waiting for the broker's confirmation.
    pub fn force_stop(&self) {
        self.core.force_close()
    }

    pub fn state(&self) -> SubscriptionState {
        self.core.state()
    }

    pub fn key(&self) -> &TopicKey {
        self.core.key()
    }

    pub fn handle(&self) -> &Arc<SubscriptionHandle> {
        self.core.handle()
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        if !self.stop_on_drop || self.core.state() == SubscriptionState::Closed {
            return;
        }
        if let Err(e) = self.core.close() {
            tracing::warn!(topic = %self.core.key(), error = %e, "stop on drop failed");
        }
    }
}

/// Delivery worker: one handler call at a time, in arrival order.
fn run_worker(core: Arc<StreamCore>, mut handler: Box<dyn Handler>) {
    core.set_worker(thread::current().id());
    tracing::debug!(topic = %core.key(), "push worker started");

    loop {
        let _gate = core.gate();
        let envelope = match core.next_envelope(None) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(ReceiveError::Closed { .. }) => break,
            Err(e @ ReceiveError::Transport { .. }) => {
                tracing::warn!(topic = %core.key(), error = %e, "push worker stopping on transport failure");
                break;
            }
        };

        let status = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&envelope))) {
            Ok(status) => status,
            Err(_) => {
                tracing::error!(
                    topic = %core.key(),
                    envelope = envelope.id(),
                    "handler panicked, requesting redelivery"
                );
                AckStatus::Retry
            }
        };

        match core.acknowledge_id(envelope.id(), status) {
            Ok(()) => {}
            // The handler acknowledged through the envelope itself
            Err(AcknowledgeError::UnknownEnvelope { .. }) => {
                tracing::debug!(envelope = envelope.id(), "envelope already acknowledged by handler");
            }
            // The handler stopped its own subscription
            Err(AcknowledgeError::Closed { .. }) => {
                tracing::debug!(envelope = envelope.id(), "subscription closed during handler");
            }
            Err(e) => tracing::warn!(topic = %core.key(), error = %e, "acknowledgment failed"),
        }
    }

    tracing::debug!(topic = %core.key(), "push worker stopped");
}
