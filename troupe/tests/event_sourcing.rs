//! Integration tests for raise/commit semantics

mod common;

use common::{runtime, TallyEvent, User};
use proptest::prelude::*;
use tokio::sync::broadcast::error::TryRecvError;
use troupe::Version;

#[tokio::test]
async fn test_raise_is_invisible_until_commit() {
    let runtime = runtime();
    let alice = runtime.agent::<User>("alice");

    alice.raise(TallyEvent::Add(5)).await.unwrap();
    assert_eq!(alice.state().await.unwrap().total, 0);
    assert_eq!(alice.version().await.unwrap(), Version::genesis());

    assert_eq!(alice.commit().await.unwrap(), Some(Version(1)));
    assert_eq!(alice.state().await.unwrap().total, 5);
}

#[tokio::test]
async fn test_commit_notifies_exactly_once() {
    let runtime = runtime();
    let mut feed = runtime.watch();
    let alice = runtime.agent::<User>("alice");

    alice.raise(TallyEvent::Add(1)).await.unwrap();
    alice.raise(TallyEvent::Add(2)).await.unwrap();
    alice.raise(TallyEvent::Note("batch".into())).await.unwrap();
    alice.commit().await.unwrap();

    let changed = feed.try_recv().unwrap();
    assert_eq!(changed.agent, *alice.id());
    assert_eq!(changed.version, Version(1));
    assert_eq!(changed.events, 3);
    assert!(matches!(feed.try_recv(), Err(TryRecvError::Empty)));

    let state = alice.state().await.unwrap();
    assert_eq!(state.total, 3);
    assert_eq!(state.notes, vec!["batch".to_string()]);
}

#[tokio::test]
async fn test_unrecognized_events_change_nothing() {
    let runtime = runtime();
    let mut feed = runtime.watch();
    let alice = runtime.agent::<User>("alice");

    alice.raise(TallyEvent::Unknown).await.unwrap();
    assert_eq!(alice.commit().await.unwrap(), None);

    assert_eq!(alice.version().await.unwrap(), Version::genesis());
    assert!(matches!(feed.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(runtime.stats().commits, 0);
}

#[tokio::test]
async fn test_empty_commit_is_noop() {
    let runtime = runtime();
    let alice = runtime.agent::<User>("alice");

    assert_eq!(alice.commit().await.unwrap(), None);
    assert_eq!(alice.version().await.unwrap(), Version::genesis());
}

#[tokio::test]
async fn test_on_state_changed_runs_once_per_commit() {
    let runtime = runtime();
    let alice = runtime.agent::<User>("alice");

    alice.raise_and_commit(TallyEvent::Add(1)).await.unwrap();
    alice.raise(TallyEvent::Add(1)).await.unwrap();
    alice.raise(TallyEvent::Add(1)).await.unwrap();
    alice.commit().await.unwrap();

    let seen = alice
        .ask(|agent, _| Box::pin(async move { agent.changes.clone() }))
        .await
        .unwrap();
    assert_eq!(seen, vec![Version(1), Version(2)]);
}

#[tokio::test]
async fn test_identities_are_independent() {
    let runtime = runtime();
    let alice = runtime.agent::<User>("alice");
    let bob = runtime.agent::<User>("bob");

    alice.raise_and_commit(TallyEvent::Add(4)).await.unwrap();

    assert_eq!(alice.state().await.unwrap().total, 4);
    assert_eq!(bob.state().await.unwrap().total, 0);
    assert_eq!(bob.version().await.unwrap(), Version::genesis());
}

fn to_event(code: u8) -> TallyEvent {
    match code {
        0 => TallyEvent::Unknown,
        n => TallyEvent::Add(n as u64),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_version_counts_effective_commits(
        batches in prop::collection::vec(prop::collection::vec(0u8..4, 0..5), 1..8)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (version, total, notifications, expected_version, expected_total) = rt.block_on(async {
            let runtime = runtime();
            let mut feed = runtime.watch();
            let agent = runtime.agent::<User>("prop");

            let mut expected_version = 0u64;
            let mut expected_total = 0u64;
            for batch in &batches {
                for code in batch {
                    agent.raise(to_event(*code)).await.unwrap();
                }
                let committed = agent.commit().await.unwrap();
                if batch.iter().any(|c| *c > 0) {
                    expected_version += 1;
                    prop_assert_eq!(committed, Some(Version(expected_version)));
                } else {
                    prop_assert_eq!(committed, None);
                }
                expected_total += batch.iter().map(|c| *c as u64).sum::<u64>();
            }

            let mut notifications = 0;
            while feed.try_recv().is_ok() {
                notifications += 1;
            }
            let state = agent.state().await.unwrap();
            let version = agent.version().await.unwrap();
            Ok((version, state.total, notifications, expected_version, expected_total))
        })?;

        prop_assert_eq!(version, Version(expected_version));
        prop_assert_eq!(total, expected_total);
        prop_assert_eq!(notifications as u64, expected_version);
    }
}
