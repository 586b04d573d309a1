//! Broadcast channel registry
//!
//! Channels are logical publisher names, independent of any agent address.
//! Each `(channel, event type)` pair is a stream with its own subscriber set.
//! The sets are shared by every activation and mutated concurrently, so they
//! live in a concurrent map; a publish takes a snapshot of the set and
//! delivers from that, never holding a lock across a send.
//!
//! Delivery is at-least-once per subscriber with no atomicity across
//! subscribers. An agent joining while a publish is in flight may or may not
//! see that publish.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::channel::AddressedChannel;
use crate::error::DeliveryError;
use crate::event::{Envelope, Route};
use crate::types::{AgentId, CorrelationId, StreamId, SubscriptionId};

/// Subscriber sets for every broadcast stream
#[derive(Debug, Default)]
pub struct BroadcastRegistry {
    streams: DashMap<StreamId, HashMap<AgentId, SubscriptionId>>,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `agent` to the stream; subscribing twice keeps the first id
    pub fn subscribe(&self, stream: StreamId, agent: AgentId) -> SubscriptionId {
        let mut subscribers = self.streams.entry(stream.clone()).or_default();
        let id = *subscribers.entry(agent.clone()).or_insert_with(SubscriptionId::new);
        debug!(stream = %stream, agent = %agent, subscription = %id, "Subscribed");
        id
    }

    /// Remove `agent` from the stream; returns whether it was subscribed
    pub fn unsubscribe(&self, stream: &StreamId, agent: &AgentId) -> bool {
        let removed = match self.streams.get_mut(stream) {
            Some(mut subscribers) => subscribers.remove(agent).is_some(),
            None => false,
        };
        self.streams.remove_if(stream, |_, subscribers| subscribers.is_empty());
        if removed {
            debug!(stream = %stream, agent = %agent, "Unsubscribed");
        }
        removed
    }

    /// Snapshot of the current subscribers of a stream
    pub fn subscribers(&self, stream: &StreamId) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self
            .streams
            .get(stream)
            .map(|subscribers| subscribers.keys().cloned().collect())
            .unwrap_or_default();
        agents.sort();
        agents
    }

    pub fn is_subscribed(&self, stream: &StreamId, agent: &AgentId) -> bool {
        self.streams
            .get(stream)
            .is_some_and(|subscribers| subscribers.contains_key(agent))
    }

    /// Number of streams with at least one subscriber
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Total subscriptions across all streams
    pub fn subscription_count(&self) -> usize {
        self.streams.iter().map(|entry| entry.value().len()).sum()
    }
}

/// Outcome of one publish
#[derive(Debug)]
pub struct PublishReport {
    pub stream: StreamId,
    pub correlation_id: CorrelationId,
    pub delivered: Vec<AgentId>,
    pub failed: Vec<(AgentId, DeliveryError)>,
}

impl PublishReport {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Deliver `envelope` to every current subscriber of `stream`
pub(crate) async fn publish(
    registry: &BroadcastRegistry,
    channel: &AddressedChannel,
    stream: StreamId,
    envelope: Envelope,
) -> PublishReport {
    let envelope = envelope.with_route(Route::Broadcast {
        stream: stream.clone(),
    });
    let subscribers = registry.subscribers(&stream);

    let mut report = PublishReport {
        stream,
        correlation_id: envelope.correlation_id,
        delivered: Vec::new(),
        failed: Vec::new(),
    };
    if subscribers.is_empty() {
        debug!(stream = %report.stream, "Published with no subscribers");
        return report;
    }

    for (agent, result) in channel.send_all(&envelope, subscribers).await {
        match result {
            Ok(()) => report.delivered.push(agent),
            Err(e) => {
                warn!(stream = %report.stream, subscriber = %agent, error = %e, "Broadcast delivery failed");
                report.failed.push((agent, e));
            }
        }
    }

    debug!(
        stream = %report.stream,
        correlation_id = %report.correlation_id,
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "Published"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn stream() -> StreamId {
        StreamId::new("X", "Tick")
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let registry = BroadcastRegistry::new();
        let agent = AgentId::new("user", "a");

        let first = registry.subscribe(stream(), agent.clone());
        let second = registry.subscribe(stream(), agent.clone());
        assert_eq!(first, second);
        assert_eq!(registry.subscribers(&stream()), vec![agent]);
        assert_eq!(registry.subscription_count(), 1);
    }

    #[test]
    fn test_streams_are_per_event_type() {
        let registry = BroadcastRegistry::new();
        let agent = AgentId::new("user", "a");
        registry.subscribe(StreamId::new("X", "Tick"), agent.clone());

        assert!(registry.is_subscribed(&StreamId::new("X", "Tick"), &agent));
        assert!(!registry.is_subscribed(&StreamId::new("X", "Tock"), &agent));
        assert!(registry.subscribers(&StreamId::new("Y", "Tick")).is_empty());
    }

    #[test]
    fn test_unsubscribe_drops_empty_streams() {
        let registry = BroadcastRegistry::new();
        let agent = AgentId::new("user", "a");
        registry.subscribe(stream(), agent.clone());

        assert!(registry.unsubscribe(&stream(), &agent));
        assert!(!registry.unsubscribe(&stream(), &agent));
        assert_eq!(registry.stream_count(), 0);
    }

    #[test]
    fn test_snapshot_is_stable_under_concurrent_changes() {
        let registry = Arc::new(BroadcastRegistry::new());
        for i in 0..10 {
            registry.subscribe(stream(), AgentId::new("user", i.to_string()));
        }
        let snapshot = registry.subscribers(&stream());

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.unsubscribe(&stream(), &AgentId::new("user", i.to_string()));
                    registry.subscribe(stream(), AgentId::new("user", format!("late-{i}")));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(snapshot.len(), 10);
        let now = registry.subscribers(&stream());
        assert_eq!(now.len(), 10);
        assert!(now.iter().all(|a| a.key().starts_with("late-")));
    }
}
