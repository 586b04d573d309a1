//! Integration tests for role-pattern placement

mod common;

use std::collections::BTreeSet;

use common::{builder, runtime, Blank, Misplaced, Scheduler, User, Worker};
use troupe::{DeliveryError, PlacementError, RuntimeError};

#[tokio::test]
async fn test_activations_land_on_matching_groups() {
    let runtime = runtime();

    let mut user_groups = BTreeSet::new();
    for i in 0..6 {
        let user = runtime.agent::<User>(format!("user-{i}"));
        let group = user.group().await.unwrap();
        assert!(group.name().starts_with("User-"), "user placed on {group}");
        user_groups.insert(group.name().to_string());
    }
    assert_eq!(user_groups.len(), 2);

    let scheduler = runtime.agent::<Scheduler>("main");
    assert_eq!(scheduler.group().await.unwrap().name(), "Scheduler-1");
    assert_eq!(
        runtime.placement_for(scheduler.id()).map(|g| g.name().to_string()),
        Some("Scheduler-1".to_string())
    );
}

#[tokio::test]
async fn test_unconstrained_type_may_use_any_group() {
    let runtime = runtime();
    let worker = runtime.agent::<Worker>("w");
    let group = worker.group().await.unwrap();
    assert!(runtime.execution_groups().contains(&group));
}

#[tokio::test]
async fn test_unsatisfiable_role_fails_activation() {
    let runtime = builder().register::<Misplaced>().build().unwrap();

    let err = runtime.agent::<Misplaced>("m").activate().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Delivery(DeliveryError::Placement(PlacementError::NoMatchingGroup { .. }))
    ));
    assert!(runtime.active_agents().is_empty());
}

#[tokio::test]
async fn test_blank_role_is_a_configuration_error() {
    let runtime = builder().register::<Blank>().build().unwrap();

    let err = runtime.agent::<Blank>("b").activate().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Delivery(DeliveryError::Placement(PlacementError::BlankPattern { .. }))
    ));
}

#[test]
fn test_validate_placement_reports_first_violation() {
    assert!(runtime().validate_placement().is_ok());

    let runtime = builder().register::<Misplaced>().build().unwrap();
    assert_eq!(
        runtime.validate_placement(),
        Err(PlacementError::NoMatchingGroup {
            agent_type: "misplaced".into(),
            pattern: "Gpu".into(),
        })
    );
}
