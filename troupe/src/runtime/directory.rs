//! Directory of live activations
//!
//! Maps each endpoint to the one activation currently serving it. Creating
//! an activation is a claim on the endpoint; exactly one claimant wins and
//! every other caller uses the winner's handle.
//!
//! An entry stays in place while its activation deactivates. It is either
//! released or handed over to a successor that already holds the leftover
//! mail, and only then does the old activation report `Stopped`.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::DeliveryError;
use crate::event::Envelope;
use crate::placement::ExecutionGroup;
use crate::types::{AgentId, Endpoint};

/// Type-erased sending half of an activation's mailbox
pub(crate) trait Mailbox: Send + Sync {
    /// Enqueue an envelope; false if the mailbox is closed
    fn deliver(&self, envelope: Envelope) -> bool;

    fn is_closed(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ActivationStatus {
    Loading,
    Ready,
    /// Deactivated; the entry has been released or handed over
    Stopped,
    Failed(String),
}

/// Shared handle to one activation
#[derive(Clone)]
pub(crate) struct ActivationHandle {
    id: AgentId,
    generation: u64,
    group: ExecutionGroup,
    mailbox: Arc<dyn Mailbox>,
    status: watch::Receiver<ActivationStatus>,
}

impl ActivationHandle {
    pub(crate) fn new(
        id: AgentId,
        generation: u64,
        group: ExecutionGroup,
        mailbox: Arc<dyn Mailbox>,
        status: watch::Receiver<ActivationStatus>,
    ) -> Self {
        Self {
            id,
            generation,
            group,
            mailbox,
            status,
        }
    }

    pub(crate) fn id(&self) -> &AgentId {
        &self.id
    }

    pub(crate) fn group(&self) -> &ExecutionGroup {
        &self.group
    }

    pub(crate) fn mailbox(&self) -> &dyn Mailbox {
        self.mailbox.as_ref()
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.mailbox.is_closed()
    }

    /// Wait until the record is restored and `on_activate` has run
    pub(crate) async fn ready(&self) -> Result<(), DeliveryError> {
        let mut status = self.status.clone();
        let status = match status.wait_for(|s| *s != ActivationStatus::Loading).await {
            Ok(status) => status.clone(),
            Err(_) => {
                return Err(DeliveryError::Activation {
                    agent: self.id.clone(),
                    reason: "activation ended before it was ready".into(),
                })
            }
        };
        match status {
            ActivationStatus::Failed(reason) => Err(DeliveryError::Activation {
                agent: self.id.clone(),
                reason,
            }),
            _ => Ok(()),
        }
    }

    /// The activation has finished with its directory entry
    pub(crate) fn is_stopped(&self) -> bool {
        let finished = matches!(
            *self.status.borrow(),
            ActivationStatus::Stopped | ActivationStatus::Failed(_)
        );
        finished || self.status.has_changed().is_err()
    }

    /// Wait until the activation has released or handed over its entry
    pub(crate) async fn stopped(&self) {
        let mut status = self.status.clone();
        // A dropped sender means the task is gone, which counts as stopped
        let _ = status
            .wait_for(|s| matches!(s, ActivationStatus::Stopped | ActivationStatus::Failed(_)))
            .await;
    }
}

pub(crate) enum Claim {
    /// The caller's handle now serves the endpoint
    Won(ActivationHandle),
    /// Another live activation already serves it
    Lost(ActivationHandle),
}

#[derive(Default)]
pub(crate) struct Directory {
    entries: DashMap<Endpoint, ActivationHandle>,
    generations: AtomicU64,
}

impl Directory {
    /// The activation holding an endpoint, possibly still deactivating
    pub(crate) fn lookup(&self, endpoint: &Endpoint) -> Option<ActivationHandle> {
        self.entries
            .get(endpoint)
            .filter(|handle| !handle.is_stopped())
            .map(|handle| handle.value().clone())
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn claim(&self, endpoint: Endpoint, handle: ActivationHandle) -> Claim {
        match self.entries.entry(endpoint) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_stopped() {
                    existing.insert(handle.clone());
                    Claim::Won(handle)
                } else {
                    Claim::Lost(existing.get().clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(handle.clone());
                Claim::Won(handle)
            }
        }
    }

    /// Remove the entry if it still belongs to `generation`
    pub(crate) fn release(&self, endpoint: &Endpoint, generation: u64) -> bool {
        self.entries
            .remove_if(endpoint, |_, handle| handle.generation == generation)
            .is_some()
    }

    /// Swap in the successor built by `successor` if the entry still belongs
    /// to `generation`
    ///
    /// The successor is built while the entry is locked, so no caller can
    /// see it before it is fully set up.
    pub(crate) fn hand_over<F>(&self, endpoint: &Endpoint, generation: u64, successor: F) -> bool
    where
        F: FnOnce() -> ActivationHandle,
    {
        match self.entries.get_mut(endpoint) {
            Some(mut entry) if entry.generation == generation => {
                *entry = successor();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.entries.iter().map(|e| e.value().id.clone()).collect();
        ids.sort();
        ids
    }

    /// Drop every handle; activations drain and deactivate
    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Slot {
        closed: AtomicBool,
    }

    impl Mailbox for Slot {
        fn deliver(&self, _envelope: Envelope) -> bool {
            !self.is_closed()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn handle(
        directory: &Directory,
    ) -> (ActivationHandle, Arc<Slot>, watch::Sender<ActivationStatus>) {
        let slot = Arc::new(Slot::default());
        let (status, status_rx) = watch::channel(ActivationStatus::Ready);
        let handle = ActivationHandle::new(
            AgentId::new("user", "alice"),
            directory.next_generation(),
            ExecutionGroup::new("User-1"),
            slot.clone(),
            status_rx,
        );
        (handle, slot, status)
    }

    fn endpoint() -> Endpoint {
        Endpoint::of(&AgentId::new("user", "alice"))
    }

    #[test]
    fn test_deactivating_entry_is_not_reclaimed() {
        let directory = Directory::default();
        let (first, slot, status) = handle(&directory);
        assert!(matches!(directory.claim(endpoint(), first), Claim::Won(_)));

        // Closed but not yet stopped: still holds the endpoint
        slot.closed.store(true, Ordering::SeqCst);
        let (second, _, _second_status) = handle(&directory);
        assert!(matches!(directory.claim(endpoint(), second), Claim::Lost(_)));
        assert!(directory.lookup(&endpoint()).is_some());

        status.send(ActivationStatus::Stopped).unwrap();
        assert!(directory.lookup(&endpoint()).is_none());
        let (third, _, _third_status) = handle(&directory);
        assert!(matches!(directory.claim(endpoint(), third), Claim::Won(_)));
    }

    #[test]
    fn test_hand_over_checks_generation() {
        let directory = Directory::default();
        let (first, _, _status) = handle(&directory);
        let generation = first.generation;
        directory.claim(endpoint(), first);

        let (stale, _, _stale_status) = handle(&directory);
        assert!(!directory.hand_over(&endpoint(), generation + 100, || stale));

        let (successor, _, _successor_status) = handle(&directory);
        let next = successor.generation;
        assert!(directory.hand_over(&endpoint(), generation, || successor));
        assert!(!directory.release(&endpoint(), generation));
        assert!(directory.release(&endpoint(), next));
    }

    #[tokio::test]
    async fn test_stopped_returns_once_the_task_is_gone() {
        let directory = Directory::default();
        let (handle, _, status) = handle(&directory);
        assert!(!handle.is_stopped());
        drop(status);
        assert!(handle.is_stopped());
        handle.stopped().await;
        assert!(handle.ready().await.is_ok());
    }
}
