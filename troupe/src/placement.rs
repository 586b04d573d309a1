//! Role-based placement
//!
//! An agent type may declare a role pattern. When a new activation is
//! created, the director narrows the configured execution groups to those
//! whose name satisfies the pattern; the selector then picks one of them.
//! Matching is a case-insensitive prefix match, so a `Scheduler` role runs
//! on `scheduler`, `Scheduler-1`, `scheduler-east` and so on.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PlacementError;

/// Placement constraint declared by an agent type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Any execution group will do
    #[default]
    Unconstrained,
    /// Only groups whose name matches this role pattern
    Role(String),
}

impl Placement {
    pub fn role(pattern: impl Into<String>) -> Self {
        Placement::Role(pattern.into())
    }

    /// Does a group with this name satisfy the constraint?
    pub fn admits(&self, group: &ExecutionGroup) -> bool {
        match self {
            Placement::Unconstrained => true,
            Placement::Role(pattern) => {
                let pattern = pattern.trim();
                !pattern.is_empty()
                    && group
                        .name()
                        .to_ascii_lowercase()
                        .starts_with(&pattern.to_ascii_lowercase())
            }
        }
    }
}

/// A named pool of capacity that can host activations
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionGroup(String);

impl ExecutionGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Filters execution groups by placement constraint
#[derive(Debug, Clone)]
pub struct PlacementDirector {
    groups: Vec<ExecutionGroup>,
}

impl PlacementDirector {
    pub const DEFAULT_GROUP: &'static str = "default";

    /// A director over the given groups; an empty list means one default group
    pub fn new(groups: Vec<ExecutionGroup>) -> Self {
        let groups = if groups.is_empty() {
            vec![ExecutionGroup::new(Self::DEFAULT_GROUP)]
        } else {
            groups
        };
        Self { groups }
    }

    pub fn groups(&self) -> &[ExecutionGroup] {
        &self.groups
    }

    /// Every group compatible with the constraint, in configuration order
    pub fn candidates(
        &self,
        agent_type: &str,
        placement: &Placement,
    ) -> Result<Vec<&ExecutionGroup>, PlacementError> {
        if let Placement::Role(pattern) = placement {
            if pattern.trim().is_empty() {
                return Err(PlacementError::BlankPattern {
                    agent_type: agent_type.to_string(),
                });
            }
        }

        let matching: Vec<_> = self.groups.iter().filter(|g| placement.admits(g)).collect();
        if matching.is_empty() {
            let pattern = match placement {
                Placement::Role(pattern) => pattern.clone(),
                Placement::Unconstrained => String::new(),
            };
            return Err(PlacementError::NoMatchingGroup {
                agent_type: agent_type.to_string(),
                pattern,
            });
        }
        Ok(matching)
    }

    /// Check a constraint without placing anything
    pub fn validate(&self, agent_type: &str, placement: &Placement) -> Result<(), PlacementError> {
        self.candidates(agent_type, placement).map(|_| ())
    }
}

/// Chooses among compatible groups, round robin
#[derive(Debug, Default)]
pub struct GroupSelector {
    next: AtomicUsize,
}

impl GroupSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an activation of `agent_type`
    pub fn place(
        &self,
        director: &PlacementDirector,
        agent_type: &str,
        placement: &Placement,
    ) -> Result<ExecutionGroup, PlacementError> {
        let candidates = director.candidates(agent_type, placement)?;
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let group = candidates[index].clone();
        debug!(agent_type, group = %group, candidates = candidates.len(), "Placed activation");
        Ok(group)
    }
}
