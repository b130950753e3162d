//! Pull subscriptions: the consumer asks for each envelope.

use crate::config::SubscriptionOptions;
use crate::connection::Shared;
use crate::envelope::Envelope;
use crate::error::{AcknowledgeError, CloseError, ReceiveError, SubscribeError};
use crate::registry::SubscriptionHandle;
use crate::types::{AckStatus, SubscriptionMode, SubscriptionState, TopicKey};
use std::sync::Arc;
use std::time::Duration;

use super::stream::StreamCore;

/// A subscription whose consumer calls [`receive`](Self::receive) and
/// acknowledges each envelope.
///
/// Several envelopes may be outstanding at once. Whatever is still
/// unacknowledged when the subscription closes is returned to the broker
/// with `Retry`. Dropping an open subscription closes it.
pub struct PullSubscription {
    core: Arc<StreamCore>,
}

impl PullSubscription {
    pub(crate) fn open(
        shared: &Arc<Shared>,
        options: SubscriptionOptions,
    ) -> Result<Self, SubscribeError> {
        let core = StreamCore::open(shared, &options, SubscriptionMode::Pull)?;
        Ok(Self { core })
    }

    /// Block until the next envelope arrives.
    ///
    /// Fails with `Closed` once the subscription is closing, including when
    /// the close happens while this call is blocked.
    pub fn receive(&self) -> Result<Envelope, ReceiveError> {
        match self.core.receive(None)? {
            Some(envelope) => Ok(envelope),
            None => Err(ReceiveError::Closed {
                key: self.key().clone(),
            }),
        }
    }

    /// Like [`receive`](Self::receive), but gives up after `timeout` with `Ok(None)`.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, ReceiveError> {
        self.core.receive(Some(timeout))
    }

    /// Send `status` for an envelope this subscription delivered and wait
    /// for the broker to confirm it.
    pub fn acknowledge(&self, envelope: &Envelope, status: AckStatus) -> Result<(), AcknowledgeError> {
        let key = self.key();
        if envelope.pubsub_name() != key.pubsub_name || envelope.topic() != key.topic {
            return Err(AcknowledgeError::UnknownEnvelope {
                key: key.clone(),
                id: envelope.id().to_string(),
            });
        }
        self.core.acknowledge_id(envelope.id(), status)
    }

    /// Close the subscription. Idempotent.
    ///
    /// On error the subscription stays `Closing` and `close` may be retried.
    pub fn close(&self) -> Result<(), CloseError> {
        self.core.close()
    }

    /// Close locally without waiting for the broker's confirmation.
    pub fn force_close(&self) {
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

    /// Envelopes received but not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.core.outstanding_count()
    }
}

impl Drop for PullSubscription {
    fn drop(&mut self) {
        if self.core.state() == SubscriptionState::Closed {
            return;
        }
        if let Err(e) = self.core.close() {
            tracing::warn!(topic = %self.core.key(), error = %e, "close on drop failed");
        }
    }
}
