//! Parent/child composition
//!
//! A parent keeps the set of its children in its persisted record, so the
//! edges survive deactivation. Registration goes through the commit
//! protocol: a child counts as registered only once that commit lands.
//! Children learn about their parent through a [`HierarchyNotice`] and record
//! it in their own log.
//!
//! Fan-out enumerates the children once, then sends to each one
//! independently; one failing edge never stops delivery to the others.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::AddressedChannel;
use crate::error::DeliveryError;
use crate::event::{Envelope, Route};
use crate::state::SystemEvent;
use crate::types::{AgentId, CorrelationId};

/// Event type name of hierarchy notices
pub(crate) const HIERARCHY_NOTICE: &str = "troupe.HierarchyNotice";

/// Hierarchy edges as seen from one agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyState {
    #[serde(default)]
    children: BTreeSet<AgentId>,
    #[serde(default)]
    parent: Option<AgentId>,
}

impl HierarchyState {
    pub fn children(&self) -> &BTreeSet<AgentId> {
        &self.children
    }

    pub fn parent(&self) -> Option<&AgentId> {
        self.parent.as_ref()
    }

    pub fn has_child(&self, child: &AgentId) -> bool {
        self.children.contains(child)
    }

    /// Fold a hierarchy event, or `None` if it changes nothing
    pub(crate) fn apply(&self, event: &SystemEvent) -> Option<Self> {
        let mut next = self.clone();
        let changed = match event {
            SystemEvent::ChildrenAdded(children) => children
                .iter()
                .fold(false, |changed, child| next.children.insert(child.clone()) || changed),
            SystemEvent::ChildRemoved(child) => next.children.remove(child),
            SystemEvent::ParentSet(parent) => {
                let changed = next.parent.as_ref() != Some(parent);
                next.parent = Some(parent.clone());
                changed
            }
            SystemEvent::ParentCleared(parent) => {
                // Only the current parent may release us
                if next.parent.as_ref() == Some(parent) {
                    next.parent = None;
                    true
                } else {
                    false
                }
            }
            SystemEvent::Subscribed(_) | SystemEvent::Unsubscribed(_) => false,
        };
        changed.then_some(next)
    }
}

/// Sent by a parent to a child when the edge between them changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum HierarchyNotice {
    Adopted { parent: AgentId },
    Released { parent: AgentId },
}

impl HierarchyNotice {
    pub(crate) fn into_system_event(self) -> SystemEvent {
        match self {
            HierarchyNotice::Adopted { parent } => SystemEvent::ParentSet(parent),
            HierarchyNotice::Released { parent } => SystemEvent::ParentCleared(parent),
        }
    }
}

/// Outcome of one fan-out
#[derive(Debug, Default)]
pub struct FanOutReport {
    /// Correlation id shared by every copy of this publish
    pub correlation_id: Option<CorrelationId>,
    pub delivered: Vec<AgentId>,
    pub failed: Vec<(AgentId, DeliveryError)>,
}

impl FanOutReport {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Send `envelope` to every child in the snapshot
pub(crate) async fn fan_out(
    channel: &AddressedChannel,
    parent: &AgentId,
    children: Vec<AgentId>,
    envelope: Envelope,
) -> FanOutReport {
    let envelope = envelope.with_route(Route::Hierarchy {
        parent: parent.clone(),
    });
    let correlation_id = envelope.correlation_id;

    let mut report = FanOutReport {
        correlation_id: Some(correlation_id),
        ..Default::default()
    };
    for (child, result) in channel.send_all(&envelope, children).await {
        match result {
            Ok(()) => report.delivered.push(child),
            Err(e) => {
                warn!(parent = %parent, child = %child, error = %e, "Fan-out to child failed");
                report.failed.push((child, e));
            }
        }
    }

    debug!(
        parent = %parent,
        event_type = %envelope.event_type,
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "Fanned out to children"
    );
    report
}
