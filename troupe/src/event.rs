//! Events and envelopes
//!
//! Every message that crosses an agent boundary travels as an [`Envelope`]:
//! the serialized event plus a correlation id, the sender and the route it
//! took. Handlers receive the typed view, [`EventEnvelope<E>`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::HandlerError;
use crate::types::{AgentId, CorrelationId, StreamId};

/// A domain event that can be carried in an envelope
///
/// The event type name keys handler dispatch and broadcast streams. It
/// defaults to the unqualified Rust type name.
pub trait Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn event_type() -> &'static str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }
}

/// Who sent an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    /// Sent by an agent from inside its execution slot
    Agent(AgentId),
    /// Sent from outside the runtime (API layer, tests, the host binary)
    External,
}

impl Sender {
    pub fn agent(&self) -> Option<&AgentId> {
        match self {
            Sender::Agent(id) => Some(id),
            Sender::External => None,
        }
    }
}

/// How an envelope reached its recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    /// Point-to-point send
    Direct,
    /// Published on a broadcast stream
    Broadcast { stream: StreamId },
    /// Fanned out by a parent to its children
    Hierarchy { parent: AgentId },
}

/// Type-erased envelope as it sits in a mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: CorrelationId,
    pub sender: Sender,
    pub route: Route,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Wrap an event with a fresh correlation id
    pub fn wrap<E: Event>(event: &E, sender: Sender, route: Route) -> Result<Self, serde_json::Error> {
        Self::wrap_raw(E::event_type(), event, sender, route)
    }

    /// Wrap a payload under an explicit event type name
    pub(crate) fn wrap_raw<T: Serialize>(
        event_type: &str,
        payload: &T,
        sender: Sender,
        route: Route,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            correlation_id: CorrelationId::new(),
            sender,
            route,
            event_type: event_type.to_string(),
            payload: serde_json::to_value(payload)?,
            sent_at: Utc::now(),
        })
    }

    /// Replace the correlation id, e.g. to keep the one being handled
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    /// Decode the payload as `E`
    pub fn decode<E: Event>(self) -> Result<EventEnvelope<E>, HandlerError> {
        let event = serde_json::from_value(self.payload).map_err(|source| HandlerError::Decode {
            event_type: self.event_type.clone(),
            source,
        })?;
        Ok(EventEnvelope {
            correlation_id: self.correlation_id,
            sender: self.sender,
            route: self.route,
            sent_at: self.sent_at,
            event,
        })
    }

    /// Key used to recognize redeliveries of this envelope
    pub fn dedup_key(&self) -> (CorrelationId, String) {
        (self.correlation_id, self.event_type.clone())
    }
}

/// Typed view of an envelope handed to [`Handles::handle`](crate::agent::Handles::handle)
#[derive(Debug, Clone)]
pub struct EventEnvelope<E> {
    pub correlation_id: CorrelationId,
    pub sender: Sender,
    pub route: Route,
    pub sent_at: DateTime<Utc>,
    pub event: E,
}

impl<E> EventEnvelope<E> {
    /// Broadcast stream this envelope arrived on, if any
    pub fn stream(&self) -> Option<&StreamId> {
        match &self.route {
            Route::Broadcast { stream } => Some(stream),
            _ => None,
        }
    }

    pub fn into_event(self) -> E {
        self.event
    }
}
