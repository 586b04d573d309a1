//! Agent state and its reducer
//!
//! An agent's state changes only by folding events through
//! [`AgentState::reduce`]. The persisted unit is an [`AgentRecord`]: the
//! domain state plus the runtime's own bookkeeping (hierarchy edges and
//! broadcast subscriptions), which is mutated through the same event log.

pub mod file;
pub mod log;
pub mod storage;

use std::collections::BTreeSet;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::hierarchy::HierarchyState;
use crate::types::{AgentId, StreamId};

pub use file::FileStorage;
pub use log::{EventLog, StateChanged, VersionTracker};
pub use storage::{MemoryStorage, StateStorage, StoredState};

/// Domain state owned by one agent
///
/// `reduce` is a pure fold over a closed set of event variants. It returns
/// `None` for an event it does not recognize; such events never change the
/// state and never advance the version.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use troupe::state::AgentState;
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Counter {
///     total: u64,
/// }
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// enum CounterEvent {
///     Added(u64),
///     Reset,
///     Unused,
/// }
///
/// impl AgentState for Counter {
///     type Event = CounterEvent;
///
///     fn reduce(&self, event: &CounterEvent) -> Option<Self> {
///         match event {
///             CounterEvent::Added(n) => Some(Counter { total: self.total + n }),
///             CounterEvent::Reset => Some(Counter::default()),
///             CounterEvent::Unused => None,
///         }
///     }
/// }
///
/// let s = Counter::default().reduce(&CounterEvent::Added(3)).unwrap();
/// assert_eq!(s.total, 3);
/// assert!(s.reduce(&CounterEvent::Unused).is_none());
/// ```
pub trait AgentState: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Events this state folds
    type Event: Clone + Debug + Send + Sync + 'static;

    /// Fold one event into a new state, or `None` if it is not recognized
    fn reduce(&self, event: &Self::Event) -> Option<Self>;
}

/// Runtime bookkeeping events recorded alongside domain events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    ChildrenAdded(Vec<AgentId>),
    ChildRemoved(AgentId),
    ParentSet(AgentId),
    ParentCleared(AgentId),
    Subscribed(Vec<StreamId>),
    Unsubscribed(StreamId),
}

/// An entry in the pending queue
#[derive(Debug, Clone)]
pub enum LogEvent<E> {
    Domain(E),
    System(SystemEvent),
}

/// The persisted unit for one agent identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRecord<S> {
    pub state: S,
    #[serde(default)]
    pub hierarchy: HierarchyState,
    #[serde(default)]
    pub subscriptions: BTreeSet<StreamId>,
}

impl<S: AgentState> AgentRecord<S> {
    /// Fold one log event, or `None` if it changes nothing
    pub fn apply(&self, event: &LogEvent<S::Event>) -> Option<Self> {
        match event {
            LogEvent::Domain(e) => {
                let state = self.state.reduce(e)?;
                Some(Self {
                    state,
                    hierarchy: self.hierarchy.clone(),
                    subscriptions: self.subscriptions.clone(),
                })
            }
            LogEvent::System(SystemEvent::Subscribed(streams)) => {
                let fresh: Vec<_> = streams
                    .iter()
                    .filter(|s| !self.subscriptions.contains(*s))
                    .cloned()
                    .collect();
                if fresh.is_empty() {
                    return None;
                }
                let mut next = self.clone();
                next.subscriptions.extend(fresh);
                Some(next)
            }
            LogEvent::System(SystemEvent::Unsubscribed(stream)) => {
                if !self.subscriptions.contains(stream) {
                    return None;
                }
                let mut next = self.clone();
                next.subscriptions.remove(stream);
                Some(next)
            }
            LogEvent::System(system) => {
                let hierarchy = self.hierarchy.apply(system)?;
                Some(Self {
                    state: self.state.clone(),
                    hierarchy,
                    subscriptions: self.subscriptions.clone(),
                })
            }
        }
    }
}
