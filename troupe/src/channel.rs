//! Addressed channel
//!
//! Point-to-point delivery to one agent. The endpoint is always derived from
//! the recipient's identity, and sending to an agent type the runtime does
//! not know is an error rather than a silent drop.
//!
//! A send completes once the envelope is in the recipient's mailbox; the
//! recipient is activated first if needed. Delivery is at-least-once and
//! FIFO per sender and recipient pair.

use futures::future::join_all;
use tracing::{debug, trace};

use crate::error::DeliveryError;
use crate::event::Envelope;
use crate::runtime::{Runtime, DELIVERY_ATTEMPTS};
use crate::types::{AgentId, Endpoint};

/// Point-to-point transport over the runtime's activations
#[derive(Clone)]
pub struct AddressedChannel {
    runtime: Runtime,
}

impl AddressedChannel {
    pub(crate) fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    /// Deliver `envelope` to the agent named by `to`
    pub async fn send(&self, envelope: Envelope, to: &AgentId) -> Result<(), DeliveryError> {
        for attempt in 1..=DELIVERY_ATTEMPTS {
            let handle = self.runtime.resolve(to).await?;
            if handle.mailbox().deliver(envelope.clone()) {
                self.runtime.counters().record_delivery();
                trace!(
                    to = %to,
                    event_type = %envelope.event_type,
                    correlation_id = %envelope.correlation_id,
                    "Delivered envelope"
                );
                return Ok(());
            }
            debug!(to = %to, attempt, "Mailbox closed during delivery, re-resolving");
        }
        Err(DeliveryError::Closed(to.clone()))
    }

    /// Deliver to an endpoint previously derived with [`Endpoint::of`]
    pub async fn send_to(&self, envelope: Envelope, endpoint: &Endpoint) -> Result<(), DeliveryError> {
        let agent = endpoint
            .agent_id()
            .ok_or_else(|| DeliveryError::InvalidEndpoint(endpoint.clone()))?;
        self.send(envelope, &agent).await
    }

    /// Deliver copies of `envelope` to several agents independently
    pub async fn send_all(
        &self,
        envelope: &Envelope,
        targets: Vec<AgentId>,
    ) -> Vec<(AgentId, Result<(), DeliveryError>)> {
        let sends = targets.into_iter().map(|target| {
            let envelope = envelope.clone();
            async move {
                let result = self.send(envelope, &target).await;
                (target, result)
            }
        });
        join_all(sends).await
    }
}
