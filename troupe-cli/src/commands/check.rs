//! Validate a runtime configuration against the sample agent types.

use anyhow::{bail, Result};
use serde::Serialize;
use std::path::Path;
use troupe::{Placement, PlacementDirector, Runtime, RuntimeSettings, StorageSettings};

use super::{load_settings, sample_runtime};

#[derive(Debug, Serialize)]
pub struct TypeCheck {
    pub agent_type: &'static str,
    pub placement: String,
    /// Groups an activation of this type may be placed on
    pub groups: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckSummary {
    pub groups: Vec<String>,
    pub storage: String,
    pub types: Vec<TypeCheck>,
}

impl CheckSummary {
    pub fn failures(&self) -> usize {
        self.types.iter().filter(|t| t.error.is_some()).count()
    }
}

/// Check every sample type's placement against the configured groups.
pub fn check_config(config_path: &Path, json: bool) -> Result<()> {
    let settings = load_settings(config_path)?;
    let summary = run_check(settings)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Execution groups: {}", summary.groups.join(", "));
        println!("Storage: {}", summary.storage);
        for check in &summary.types {
            match &check.error {
                None => println!(
                    "- {} ({}) -> {}",
                    check.agent_type,
                    check.placement,
                    check.groups.join(", ")
                ),
                Some(error) => println!("- {} ({}) -> ERROR: {}", check.agent_type, check.placement, error),
            }
        }
    }

    let failures = summary.failures();
    if failures > 0 {
        bail!("{failures} agent type(s) cannot be placed");
    }
    Ok(())
}

pub fn run_check(settings: RuntimeSettings) -> Result<CheckSummary> {
    let storage = describe_storage(&settings.storage);
    let runtime = sample_runtime(settings)?;
    let director = PlacementDirector::new(runtime.execution_groups().to_vec());

    let types = runtime
        .agent_types()
        .into_iter()
        .map(|name| check_type(&runtime, &director, name))
        .collect();

    Ok(CheckSummary {
        groups: runtime
            .execution_groups()
            .iter()
            .map(|g| g.name().to_string())
            .collect(),
        storage,
        types,
    })
}

fn check_type(runtime: &Runtime, director: &PlacementDirector, name: &'static str) -> TypeCheck {
    let placement = runtime.placement_of(name).cloned().unwrap_or_default();
    let (groups, error) = match director.candidates(name, &placement) {
        Ok(groups) => (groups.iter().map(|g| g.name().to_string()).collect(), None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    };
    TypeCheck {
        agent_type: name,
        placement: describe_placement(&placement),
        groups,
        error,
    }
}

fn describe_placement(placement: &Placement) -> String {
    match placement {
        Placement::Unconstrained => "any group".to_string(),
        Placement::Role(pattern) => format!("role {pattern:?}"),
    }
}

fn describe_storage(storage: &StorageSettings) -> String {
    match storage {
        StorageSettings::Memory => "memory".to_string(),
        StorageSettings::File { path } => format!("file ({})", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_groups_place_every_type() {
        let settings = RuntimeSettings::from_yaml("execution_groups: [Scheduler-1, User-1, User-2]").unwrap();
        let summary = run_check(settings).unwrap();

        assert_eq!(summary.failures(), 0);
        let user = summary.types.iter().find(|t| t.agent_type == "user").unwrap();
        assert_eq!(user.groups, vec!["User-1", "User-2"]);
        let layer = summary.types.iter().find(|t| t.agent_type == "layer").unwrap();
        assert_eq!(layer.groups.len(), 3);
    }

    #[test]
    fn test_missing_role_group_is_reported() {
        let settings = RuntimeSettings::from_yaml("execution_groups: [User-1]").unwrap();
        let summary = run_check(settings).unwrap();

        assert_eq!(summary.failures(), 1);
        let scheduler = summary
            .types
            .iter()
            .find(|t| t.agent_type == "scheduler")
            .unwrap();
        assert!(scheduler.groups.is_empty());
        assert!(scheduler.error.as_deref().unwrap().contains("Scheduler"));
    }
}
