//! Run the bundled sample topologies and report per-agent results.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use troupe::{Agent, AgentId, AgentRef, RuntimeSettings, RuntimeStats, VersionTracker};

use super::{load_settings, sample_runtime};
use crate::samples::{Beat, Layer, Listener, Pulse, Schedule, Scheduler, SCHEDULE_CHANNEL};

/// Delay between completion checks
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Consecutive checks without progress before the run counts as stalled
const STALL_CHECKS: u32 = 40;

#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub agent: String,
    pub group: String,
    pub version: u64,
    pub count: u64,
    pub last_seq: Option<u64>,
    pub parent: Option<String>,
    pub children: usize,
}

#[derive(Debug, Serialize)]
pub struct DemoSummary {
    pub topology: &'static str,
    pub expected: u64,
    pub observed: u64,
    /// State-change notifications seen on the change feed
    pub notifications: usize,
    pub agents: Vec<AgentSummary>,
    pub stats: RuntimeStats,
}

pub async fn demo_broadcast(config_path: &Path, listeners: usize, rounds: u64, json: bool) -> Result<()> {
    let settings = load_settings(config_path)?;
    let summary = run_broadcast(settings, listeners, rounds).await?;
    print_summary(&summary, json)
}

pub async fn demo_hierarchy(config_path: &Path, fanout: usize, depth: usize, json: bool) -> Result<()> {
    let settings = load_settings(config_path)?;
    let summary = run_hierarchy(settings, fanout, depth).await?;
    print_summary(&summary, json)
}

/// One scheduler publishes `rounds` beats to `listeners` subscribers
pub async fn run_broadcast(settings: RuntimeSettings, listeners: usize, rounds: u64) -> Result<DemoSummary> {
    let runtime = sample_runtime(settings)?;
    runtime
        .validate_placement()
        .context("Sample agents cannot be placed on the configured groups")?;
    let mut feed = runtime.watch();

    let listeners: Vec<AgentRef<Listener>> = (0..listeners)
        .map(|i| runtime.agent::<Listener>(format!("listener-{i}")))
        .collect();
    for listener in &listeners {
        listener.subscribe::<Beat>(SCHEDULE_CHANNEL).await?;
    }
    info!(listeners = listeners.len(), rounds, "Subscribed listeners");

    let scheduler = runtime.agent::<Scheduler>("main");
    for seq in 1..=rounds {
        scheduler.send(&Schedule { seq }).await?;
    }

    let expected = listeners.len() as u64 * rounds;
    let observed = await_completion(expected, || async {
        let mut total = 0;
        for listener in &listeners {
            total += listener.state().await?.count;
        }
        Ok(total)
    })
    .await?;

    let mut agents = Vec::with_capacity(listeners.len() + 1);
    agents.push(summarize(&scheduler).await?);
    for listener in &listeners {
        agents.push(summarize(listener).await?);
    }

    let notifications = drain_feed(&mut feed);
    let stats = runtime.stats();
    runtime.shutdown();
    Ok(DemoSummary {
        topology: "broadcast",
        expected,
        observed,
        notifications,
        agents,
        stats,
    })
}

/// A tree of layers `depth` levels below the root, `fanout` children each
pub async fn run_hierarchy(settings: RuntimeSettings, fanout: usize, depth: usize) -> Result<DemoSummary> {
    let runtime = sample_runtime(settings)?;
    runtime
        .validate_placement()
        .context("Sample agents cannot be placed on the configured groups")?;
    let mut feed = runtime.watch();

    let root = runtime.agent::<Layer>("0");
    let mut nodes = vec![root.id().clone()];
    let mut level = vec![root.id().clone()];
    for _ in 0..depth {
        let mut next = Vec::with_capacity(level.len() * fanout);
        for parent in &level {
            let children: Vec<AgentId> = (0..fanout)
                .map(|i| AgentId::new(Layer::AGENT_TYPE, format!("{}.{}", parent.key(), i)))
                .collect();
            let added = runtime
                .agent::<Layer>(parent.key())
                .register_children(children.clone())
                .await?;
            debug!(parent = %parent, added, "Registered layer children");
            next.extend(children);
        }
        nodes.extend(next.iter().cloned());
        level = next;
    }
    info!(nodes = nodes.len(), fanout, depth, "Built layer tree");

    root.send(&Pulse { seq: 1, value: 1 }).await?;

    let layers: Vec<AgentRef<Layer>> = nodes.iter().map(|id| runtime.agent::<Layer>(id.key())).collect();
    let expected = layers.len() as u64;
    let observed = await_completion(expected, || async {
        let mut total = 0;
        for layer in &layers {
            total += layer.state().await?.count;
        }
        Ok(total)
    })
    .await?;

    let mut agents = Vec::with_capacity(layers.len());
    for layer in &layers {
        agents.push(summarize(layer).await?);
    }

    let notifications = drain_feed(&mut feed);
    let stats = runtime.stats();
    runtime.shutdown();
    Ok(DemoSummary {
        topology: "hierarchy",
        expected,
        observed,
        notifications,
        agents,
        stats,
    })
}

/// Poll `progress` until it reaches `expected`
///
/// A run that makes no progress for `STALL_CHECKS` consecutive checks is
/// reported as stalled; the work may still complete later.
async fn await_completion<F, Fut>(expected: u64, mut progress: F) -> Result<u64>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    let mut last = None;
    let mut idle_checks = 0;
    loop {
        let observed = progress().await?;
        if observed >= expected {
            return Ok(observed);
        }
        if last == Some(observed) {
            idle_checks += 1;
            if idle_checks >= STALL_CHECKS {
                bail!("Stalled at {observed}/{expected} after {STALL_CHECKS} checks without progress");
            }
        } else {
            last = Some(observed);
            idle_checks = 0;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn summarize<A>(agent: &AgentRef<A>) -> Result<AgentSummary>
where
    A: Agent<State = crate::samples::Counter>,
{
    let summary = agent
        .ask(|_, ctx| {
            Box::pin(async move {
                AgentSummary {
                    agent: ctx.id().to_string(),
                    group: ctx.group().to_string(),
                    version: ctx.version().get(),
                    count: ctx.state().count,
                    last_seq: ctx.state().last_seq,
                    parent: ctx.parent().map(|p| p.to_string()),
                    children: ctx.child_count(),
                }
            })
        })
        .await?;
    Ok(summary)
}

/// Count notifications, skipping any replayed version
fn drain_feed(feed: &mut tokio::sync::broadcast::Receiver<troupe::StateChanged>) -> usize {
    let mut tracker = VersionTracker::new();
    let mut fresh = 0;
    while let Ok(changed) = feed.try_recv() {
        if tracker.observe(&changed) {
            fresh += 1;
        }
    }
    fresh
}

fn print_summary(summary: &DemoSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!(
        "{} demo: {}/{} deliveries observed, {} state changes",
        summary.topology, summary.observed, summary.expected, summary.notifications
    );
    for agent in &summary.agents {
        let parent = agent
            .parent
            .as_deref()
            .map(|p| format!(" parent={p}"))
            .unwrap_or_default();
        let children = if agent.children > 0 {
            format!(" children={}", agent.children)
        } else {
            String::new()
        };
        println!(
            "- {} [{}] v{} count={}{}{}",
            agent.agent, agent.group, agent.version, agent.count, parent, children
        );
    }
    let stats = &summary.stats;
    println!(
        "Runtime: {} activations, {} delivered, {} duplicates, {} commits",
        stats.activations, stats.delivered, stats.duplicates, stats.commits
    );
    Ok(())
}
