//! Activation task
//!
//! Each activation is one tokio task that owns the agent value and its
//! context and drains a mailbox one item at a time. Nothing else can touch
//! the agent, so handlers never race each other.
//!
//! Lifecycle: wait for the directory claim, restore the record, resume
//! subscriptions, run `on_activate`, serve the mailbox until idle (unless the
//! type is keep-alive), run `on_deactivate`, then close the mailbox. Mail
//! still queued at that point goes to a successor activation that takes over
//! the directory entry with the mail already in its mailbox, ahead of
//! anything sent later. With nothing queued the entry is simply released.

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::directory::{ActivationHandle, ActivationStatus, Mailbox};
use super::Runtime;
use crate::agent::{Agent, AgentContext, Handlers};
use crate::event::{Envelope, Route};
use crate::hierarchy::HIERARCHY_NOTICE;
use crate::placement::ExecutionGroup;
use crate::state::EventLog;
use crate::types::{AgentId, Endpoint};

/// Closure run inside an activation's execution slot
pub(crate) type CallFn<A> =
    Box<dyn for<'a> FnOnce(&'a mut A, &'a mut AgentContext<A>) -> BoxFuture<'a, ()> + Send>;

pub(crate) fn call_fn<A, F>(f: F) -> CallFn<A>
where
    A: Agent,
    F: for<'a> FnOnce(&'a mut A, &'a mut AgentContext<A>) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

pub(crate) enum Mail<A: Agent> {
    Deliver(Envelope),
    Call(CallFn<A>),
}

/// Typed sending half of a mailbox
pub(crate) struct MailboxSender<A: Agent>(mpsc::UnboundedSender<Mail<A>>);

impl<A: Agent> MailboxSender<A> {
    /// Enqueue, handing the mail back if the mailbox is closed
    pub(crate) fn send(&self, mail: Mail<A>) -> Result<(), Mail<A>> {
        self.0.send(mail).map_err(|rejected| rejected.0)
    }
}

impl<A: Agent> Mailbox for MailboxSender<A> {
    fn deliver(&self, envelope: Envelope) -> bool {
        self.0.send(Mail::Deliver(envelope)).is_ok()
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Signature of [`launch`] once the agent type is erased
pub(crate) type LaunchFn =
    fn(&Runtime, AgentId, ExecutionGroup, u64) -> (ActivationHandle, oneshot::Sender<()>);

/// Spawn the task for a new activation
///
/// The task idles until the returned sender fires; dropping the sender
/// instead (a lost directory claim) ends it without touching storage.
pub(crate) fn launch<A: Agent>(
    runtime: &Runtime,
    id: AgentId,
    group: ExecutionGroup,
    generation: u64,
) -> (ActivationHandle, oneshot::Sender<()>) {
    launch_with::<A>(runtime, id, group, generation, Vec::new())
}

/// Like [`launch`], with `queued` already in the new mailbox
fn launch_with<A: Agent>(
    runtime: &Runtime,
    id: AgentId,
    group: ExecutionGroup,
    generation: u64,
    queued: Vec<Mail<A>>,
) -> (ActivationHandle, oneshot::Sender<()>) {
    let (mail_tx, mail_rx) = mpsc::unbounded_channel();
    for mail in queued {
        // The receiver is alive until the task below ends
        let _ = mail_tx.send(mail);
    }
    let (status_tx, status_rx) = watch::channel(ActivationStatus::Loading);
    let (start_tx, start_rx) = oneshot::channel();

    let handle = ActivationHandle::new(
        id.clone(),
        generation,
        group.clone(),
        Arc::new(MailboxSender::<A>(mail_tx)),
        status_rx,
    );
    let activation = Activation::<A> {
        runtime: runtime.clone(),
        endpoint: Endpoint::of(&id),
        id,
        group,
        generation,
        _agent: std::marker::PhantomData,
    };
    tokio::spawn(activation.run(mail_rx, status_tx, start_rx));

    (handle, start_tx)
}

struct Activation<A: Agent> {
    runtime: Runtime,
    id: AgentId,
    endpoint: Endpoint,
    group: ExecutionGroup,
    generation: u64,
    _agent: std::marker::PhantomData<fn() -> A>,
}

impl<A: Agent> Activation<A> {
    async fn run(
        self,
        mut mailbox: mpsc::UnboundedReceiver<Mail<A>>,
        status: watch::Sender<ActivationStatus>,
        start: oneshot::Receiver<()>,
    ) {
        if start.await.is_err() {
            return;
        }

        let log = match EventLog::<A::State>::restore(
            self.id.clone(),
            self.runtime.storage(),
            self.runtime.change_feed(),
        )
        .await
        {
            Ok(log) => log,
            Err(e) => return self.fail(&status, mailbox, format!("restore failed: {e}")),
        };

        let mut ctx = AgentContext::<A>::new(
            self.id.clone(),
            self.group.clone(),
            self.runtime.clone(),
            log,
        );
        let mut agent = A::create(&self.id);
        ctx.resume_subscriptions();

        if let Err(e) = agent.on_activate(&mut ctx).await {
            return self.fail(&status, mailbox, format!("on_activate failed: {e}"));
        }
        flush_changes(&mut agent, &mut ctx);

        self.runtime.counters().record_activation();
        info!(
            agent = %self.id,
            group = %self.group,
            version = %ctx.version(),
            "Activated"
        );
        // Receivers may all be gone already
        let _ = status.send(ActivationStatus::Ready);

        let handlers = Handlers::<A>::collect();
        let idle = if A::keep_alive() {
            None
        } else {
            self.runtime.settings().idle_timeout()
        };

        loop {
            let next = match idle {
                Some(idle) => match tokio::time::timeout(idle, mailbox.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(agent = %self.id, idle = ?idle, "Idle, deactivating");
                        break;
                    }
                },
                None => mailbox.recv().await,
            };
            let Some(mail) = next else {
                break;
            };

            match mail {
                Mail::Call(call) => call(&mut agent, &mut ctx).await,
                Mail::Deliver(envelope) => self.dispatch(&mut agent, &mut ctx, &handlers, envelope).await,
            }
            flush_changes(&mut agent, &mut ctx);
        }

        self.deactivate(agent, ctx, mailbox, status).await;
    }

    async fn dispatch(
        &self,
        agent: &mut A,
        ctx: &mut AgentContext<A>,
        handlers: &Handlers<A>,
        envelope: Envelope,
    ) {
        let counters = self.runtime.counters();

        if envelope.event_type == HIERARCHY_NOTICE {
            ctx.apply_hierarchy_notice(envelope).await;
            return;
        }

        if let Route::Broadcast { stream } = &envelope.route {
            if !ctx.is_subscribed(stream) {
                counters.record_dropped();
                debug!(agent = %self.id, stream = %stream, "Dropping broadcast for a stream no longer subscribed");
                return;
            }
        }

        if ctx.already_processed(&envelope) {
            counters.record_duplicate();
            debug!(
                agent = %self.id,
                event_type = %envelope.event_type,
                correlation_id = %envelope.correlation_id,
                "Discarding redelivered envelope"
            );
            return;
        }

        let Some(handler) = handlers.get(&envelope.event_type) else {
            counters.record_unhandled();
            warn!(agent = %self.id, event_type = %envelope.event_type, "No handler for event type");
            return;
        };

        let key = envelope.dedup_key();
        ctx.set_current(Some(envelope.correlation_id));
        let result = handler(agent, ctx, envelope).await;
        ctx.set_current(None);

        match result {
            Ok(()) => ctx.mark_processed(key),
            Err(e) => {
                counters.record_handler_failure();
                warn!(
                    agent = %self.id,
                    event_type = %key.1,
                    correlation_id = %key.0,
                    error = %e,
                    "Handler failed"
                );
            }
        }
    }

    async fn deactivate(
        &self,
        mut agent: A,
        mut ctx: AgentContext<A>,
        mut mailbox: mpsc::UnboundedReceiver<Mail<A>>,
        status: watch::Sender<ActivationStatus>,
    ) {
        if let Err(e) = agent.on_deactivate(&mut ctx).await {
            warn!(agent = %self.id, error = %e, "on_deactivate failed");
        }
        flush_changes(&mut agent, &mut ctx);
        self.runtime.counters().record_deactivation();

        // No awaits from here until the entry is released or handed over
        mailbox.close();
        let mut leftovers = Vec::new();
        while let Ok(mail) = mailbox.try_recv() {
            leftovers.push(mail);
        }
        let forwarded = leftovers.len();

        if leftovers.is_empty() {
            self.runtime.directory().release(&self.endpoint, self.generation);
        } else {
            self.hand_over(&mut leftovers);
        }

        info!(
            agent = %self.id,
            version = %ctx.version(),
            forwarded,
            "Deactivated"
        );
        // Callers waiting on this activation move on to the successor
        let _ = status.send(ActivationStatus::Stopped);

        if !leftovers.is_empty() {
            // The entry was no longer ours; order relative to newer mail is lost
            warn!(agent = %self.id, count = leftovers.len(), "Entry replaced during deactivation, re-sending leftover mail");
            let runtime = self.runtime.clone();
            let id = self.id.clone();
            tokio::spawn(async move {
                for mail in leftovers {
                    if let Err(e) = runtime.enqueue::<A>(&id, mail).await {
                        warn!(agent = %id, error = %e, "Failed to forward mail after deactivation");
                    }
                }
            });
        }
    }

    /// Replace this activation's entry with a successor holding `leftovers`
    ///
    /// Leaves `leftovers` untouched if the entry no longer belongs to this
    /// activation.
    fn hand_over(&self, leftovers: &mut Vec<Mail<A>>) {
        let directory = self.runtime.directory();
        let mut start = None;
        directory.hand_over(&self.endpoint, self.generation, || {
            let generation = directory.next_generation();
            let (handle, start_tx) = launch_with::<A>(
                &self.runtime,
                self.id.clone(),
                self.group.clone(),
                generation,
                std::mem::take(leftovers),
            );
            start = Some(start_tx);
            debug!(agent = %self.id, generation, "Handing leftover mail to successor");
            handle
        });
        if let Some(start) = start {
            // The successor task is alive until it is started or dropped
            let _ = start.send(());
        }
    }

    fn fail(
        &self,
        status: &watch::Sender<ActivationStatus>,
        mut mailbox: mpsc::UnboundedReceiver<Mail<A>>,
        reason: String,
    ) {
        error!(agent = %self.id, reason = %reason, "Activation failed");
        let _ = status.send(ActivationStatus::Failed(reason));
        self.runtime.directory().release(&self.endpoint, self.generation);
        mailbox.close();
    }
}

/// Run `on_state_changed` once per commit made during the last turn
fn flush_changes<A: Agent>(agent: &mut A, ctx: &mut AgentContext<A>) {
    for changed in ctx.take_committed() {
        agent.on_state_changed(ctx, &changed);
    }
}
