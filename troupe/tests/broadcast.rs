//! Integration tests for broadcast delivery

mod common;

use common::{eventually, runtime, Flaky, Ping, Scheduler, Tick, Trigger, User};
use troupe::{Envelope, Route, Sender, StreamId};

fn clock() -> StreamId {
    StreamId::new("clock", "Tick")
}

#[tokio::test]
async fn test_publish_reaches_each_subscriber_once() {
    let runtime = runtime();
    let users: Vec<_> = ["alice", "bob", "carol"]
        .into_iter()
        .map(|key| runtime.agent::<User>(key))
        .collect();
    for user in &users {
        user.subscribe::<Tick>("clock").await.unwrap();
    }

    let report = runtime.publish("clock", &Tick { amount: 3 }).await.unwrap();
    assert_eq!(report.stream, clock());
    assert_eq!(report.delivered_count(), 3);
    assert!(report.is_complete());

    for user in &users {
        assert_eq!(user.state().await.unwrap().total, 3);
    }
}

#[tokio::test]
async fn test_redelivery_is_absorbed() {
    let runtime = runtime();
    let alice = runtime.agent::<User>("alice");
    alice.subscribe::<Tick>("clock").await.unwrap();

    let envelope = Envelope::wrap(
        &Tick { amount: 4 },
        Sender::External,
        Route::Broadcast { stream: clock() },
    )
    .unwrap();
    let channel = runtime.channel();
    channel.send(envelope.clone(), alice.id()).await.unwrap();
    channel.send(envelope, alice.id()).await.unwrap();

    assert_eq!(alice.state().await.unwrap().total, 4);
    assert_eq!(runtime.stats().duplicates, 1);
}

#[tokio::test]
async fn test_unsubscribed_agent_receives_nothing() {
    let runtime = runtime();
    let alice = runtime.agent::<User>("alice");
    let bob = runtime.agent::<User>("bob");
    alice.subscribe::<Tick>("clock").await.unwrap();
    bob.subscribe::<Tick>("clock").await.unwrap();

    assert!(bob.unsubscribe::<Tick>("clock").await.unwrap());
    assert!(!bob.unsubscribe::<Tick>("clock").await.unwrap());

    let report = runtime.publish("clock", &Tick { amount: 2 }).await.unwrap();
    assert_eq!(report.delivered, vec![alice.id().clone()]);
    assert_eq!(alice.state().await.unwrap().total, 2);
    assert_eq!(bob.state().await.unwrap().total, 0);
    assert_eq!(runtime.broadcast().subscribers(&clock()), vec![alice.id().clone()]);
}

#[tokio::test]
async fn test_late_broadcast_after_unsubscribe_is_dropped() {
    let runtime = runtime();
    let alice = runtime.agent::<User>("alice");
    alice.subscribe::<Tick>("clock").await.unwrap();
    alice.unsubscribe::<Tick>("clock").await.unwrap();

    // A copy scheduled by a publish that started before the unsubscribe
    let late = Envelope::wrap(
        &Tick { amount: 9 },
        Sender::External,
        Route::Broadcast { stream: clock() },
    )
    .unwrap();
    runtime.channel().send(late, alice.id()).await.unwrap();

    assert_eq!(alice.state().await.unwrap().total, 0);
    assert_eq!(runtime.stats().dropped, 1);
}

#[tokio::test]
async fn test_streams_are_keyed_by_event_type() {
    let runtime = runtime();
    let alice = runtime.agent::<User>("alice");
    alice.subscribe::<Tick>("clock").await.unwrap();

    let report = runtime.publish("clock", &Ping).await.unwrap();
    assert_eq!(report.delivered_count(), 0);
    assert_eq!(report.stream, StreamId::new("clock", "Ping"));
}

#[tokio::test]
async fn test_subscribe_many_commits_once() {
    let runtime = runtime();
    let alice = runtime.agent::<User>("alice");

    let ids = alice
        .ask(|_, ctx| {
            Box::pin(async move { ctx.subscribe_many::<Tick>(&["clock", "alarm", "timer"]).await.unwrap() })
        })
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);
    assert_eq!(alice.version().await.unwrap().get(), 1);

    runtime.publish("alarm", &Tick { amount: 1 }).await.unwrap();
    runtime.publish("timer", &Tick { amount: 1 }).await.unwrap();
    assert_eq!(alice.state().await.unwrap().total, 2);
}

#[tokio::test]
async fn test_failed_handler_is_retried_on_redelivery() {
    let runtime = runtime();
    let alice = runtime.agent::<User>("alice");
    let envelope = Envelope::wrap(&Flaky, Sender::External, Route::Direct).unwrap();
    let channel = runtime.channel();

    channel.send(envelope.clone(), alice.id()).await.unwrap();
    channel.send(envelope.clone(), alice.id()).await.unwrap();
    channel.send(envelope, alice.id()).await.unwrap();

    assert_eq!(alice.state().await.unwrap().notes, vec!["flaky".to_string()]);
    let stats = runtime.stats();
    assert_eq!(stats.handler_failures, 1);
    assert_eq!(stats.duplicates, 1);
}

#[tokio::test]
async fn test_scheduler_publishes_to_users() {
    let runtime = runtime();
    let users: Vec<_> = (0..4).map(|i| runtime.agent::<User>(format!("user-{i}"))).collect();
    for user in &users {
        user.subscribe::<Tick>("BroadcastScheduleAgent").await.unwrap();
    }

    let scheduler = runtime.agent::<Scheduler>("main");
    scheduler
        .send(&Trigger {
            channel: "BroadcastScheduleAgent".into(),
            amount: 5,
        })
        .await
        .unwrap();

    for user in &users {
        eventually(|| async { user.state().await.unwrap().total == 5 }).await;
    }

    // Every copy of one publish shares a correlation id
    let mut correlations = Vec::new();
    for user in &users {
        let seen = user
            .ask(|agent, _| Box::pin(async move { agent.last_correlation }))
            .await
            .unwrap();
        correlations.push(seen.unwrap());
    }
    correlations.dedup();
    assert_eq!(correlations.len(), 1);
}
