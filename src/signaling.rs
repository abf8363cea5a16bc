//! Offer/answer exchange over a party's relay channel.

use std::sync::Arc;

use log::{debug, warn};
use partymic_core::{
    GuestId, Nonce, OfferDedup, PartyId, SIGNAL_EVENT, SessionDescriptor, SignalKind,
    SignalingMessage,
};

use crate::relay::{RelayError, SignalingRelay, Subscription, SubscriptionHandle};

/// The signaling channel of one party, `webrtc-party-{partyId}`.
#[derive(Clone)]
pub struct PartyChannel {
    relay: Arc<dyn SignalingRelay>,
    party_id: PartyId,
    channel: String,
}

impl PartyChannel {
    pub fn new(relay: Arc<dyn SignalingRelay>, party_id: PartyId) -> Self {
        let channel = party_id.channel_name();
        Self {
            relay,
            party_id,
            channel,
        }
    }

    pub fn party_id(&self) -> &PartyId {
        &self.party_id
    }

    pub fn name(&self) -> &str {
        &self.channel
    }

    pub fn relay(&self) -> &Arc<dyn SignalingRelay> {
        &self.relay
    }

    /// Publish a fresh offer and return the message that was sent.
    pub async fn publish_offer(
        &self,
        descriptor: SessionDescriptor,
        guest_id: GuestId,
        nonce: Nonce,
    ) -> Result<SignalingMessage, RelayError> {
        let message = SignalingMessage::offer(descriptor, guest_id, nonce);
        self.publish(&message).await?;
        Ok(message)
    }

    /// Publish the answer to `offer`, echoing its routing fields.
    pub async fn publish_answer(
        &self,
        offer: &SignalingMessage,
        descriptor: SessionDescriptor,
    ) -> Result<SignalingMessage, RelayError> {
        let message = SignalingMessage::answer_to(offer, descriptor);
        self.publish(&message).await?;
        Ok(message)
    }

    async fn publish(&self, message: &SignalingMessage) -> Result<(), RelayError> {
        debug!(
            "Publishing {} on {} (nonce {:?})",
            message.kind, self.channel, message.nonce
        );
        self.relay
            .publish(&self.channel, SIGNAL_EVENT, message.encode())
            .await
    }

    /// Offers on this channel, each distinct offer yielded once.
    pub async fn on_offer(&self) -> Result<SignalStream, RelayError> {
        let subscription = self.relay.subscribe(&self.channel, SIGNAL_EVENT).await?;
        Ok(SignalStream::new(
            SignalKind::Offer,
            subscription,
            Some(OfferDedup::default()),
        ))
    }

    /// Answers on this channel. Correlation with the pending offer is left to
    /// the caller.
    pub async fn on_answer(&self) -> Result<SignalStream, RelayError> {
        let subscription = self.relay.subscribe(&self.channel, SIGNAL_EVENT).await?;
        Ok(SignalStream::new(SignalKind::Answer, subscription, None))
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.relay.unsubscribe(handle);
    }
}

/// Decoded signaling messages of one kind. Malformed payloads and messages of
/// the other kind are skipped.
pub struct SignalStream {
    kind: SignalKind,
    subscription: Subscription,
    dedup: Option<OfferDedup>,
}

impl SignalStream {
    fn new(kind: SignalKind, subscription: Subscription, dedup: Option<OfferDedup>) -> Self {
        Self {
            kind,
            subscription,
            dedup,
        }
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        self.subscription.handle()
    }

    /// Next message of this stream's kind. `None` once the subscription ends.
    pub async fn next(&mut self) -> Option<SignalingMessage> {
        loop {
            let payload = self.subscription.recv().await?;
            let message = match SignalingMessage::decode(&payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping malformed signaling payload: {e}");
                    continue;
                }
            };
            if message.kind != self.kind {
                continue;
            }
            if let Some(dedup) = &mut self.dedup
                && !dedup.first_sighting(&message)
            {
                debug!(
                    "Ignoring redelivered {} (nonce {:?})",
                    message.kind, message.nonce
                );
                continue;
            }
            return Some(message);
        }
    }
}
