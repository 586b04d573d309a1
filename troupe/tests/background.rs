//! Integration tests for work offloaded from the execution slot

mod common;

use std::time::{Duration, Instant};

use common::{builder, eventually, runtime, Ping, Stall, StartWork, Worker};
use troupe::RuntimeError;

#[tokio::test]
async fn test_slot_is_free_while_work_runs() {
    let runtime = runtime();
    let worker = runtime.agent::<Worker>("w");
    worker.activate().await.unwrap();

    let started = Instant::now();
    worker.send(&StartWork { millis: 400 }).await.unwrap();
    worker.send(&Ping).await.unwrap();
    let notes = worker.state().await.unwrap().notes;

    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(notes, vec!["started".to_string(), "ping".to_string()]);

    eventually(|| async { worker.state().await.unwrap().notes.len() == 3 }).await;
    assert_eq!(worker.state().await.unwrap().notes[2], "done");
}

#[tokio::test]
async fn test_result_arrives_with_fresh_correlation() {
    let runtime = runtime();
    let worker = runtime.agent::<Worker>("w");
    worker.send(&StartWork { millis: 10 }).await.unwrap();

    eventually(|| async {
        worker
            .ask(|agent, _| Box::pin(async move { agent.finished_with.is_some() }))
            .await
            .unwrap()
    })
    .await;

    let (started, finished) = worker
        .ask(|agent, _| Box::pin(async move { (agent.started_with, agent.finished_with) }))
        .await
        .unwrap();
    assert_ne!(started, finished);
}

#[tokio::test]
async fn test_call_times_out_behind_a_stalled_handler() {
    let runtime = builder()
        .call_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let worker = runtime.agent::<Worker>("w");

    worker.send(&Stall { millis: 300 }).await.unwrap();
    let err = worker.state().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Timeout { .. }));

    // The slot frees up once the handler returns
    eventually(|| async { worker.state().await.is_ok() }).await;
}
