//! The execution engine: one run's queue, causal tree and emit path.
//!
//! Emit → record owner → deliver to streams → on-emit hooks → queue and
//! match → launch. Launches that settle synchronously feed their output back
//! before `emit` returns; pending results re-enter from their spawned task
//! when they resolve. The run mutex is only held for bookkeeping. Handler
//! code and hooks always run outside it.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::anyhow;
use cascade_events::{EventId, WorkflowEvent};
use futures::{Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::abort::{AbortController, AbortSignal};
use crate::context::{ContextId, ContextNode, HandlerContext, HandlerMeta};
use crate::error::WorkflowError;
use crate::handler::{Handler, HandlerOutput};
use crate::matching;
use crate::middleware::{Dispatch, DispatchHook, EmitHook, Hooks, Next};
use crate::snapshot::RunSnapshot;
use crate::stream::{EventStream, StreamItem, Subscriber};
use crate::workflow::WorkflowInner;

// ---------------------------------------------------------------------------
// RunState: everything the run mutex guards
// ---------------------------------------------------------------------------

pub(crate) struct RunState {
    pub queue: VecDeque<WorkflowEvent>,
    pub contexts: Vec<ContextNode>,
    /// Causal owner of every emitted instance. Written once per instance.
    pub owners: HashMap<EventId, ContextId>,
    /// Invocation that consumed an instance as input. Written once per instance.
    pub consumers: HashMap<EventId, ContextId>,
    pub subscribers: Vec<Subscriber>,
    pub failure: Option<WorkflowError>,
}

impl RunState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            contexts: vec![ContextNode::root()],
            owners: HashMap::new(),
            consumers: HashMap::new(),
            subscribers: Vec::new(),
            failure: None,
        }
    }

    /// Walk `node`'s parent chain looking for `ancestor`.
    pub fn is_descendant(&self, node: ContextId, ancestor: ContextId) -> bool {
        is_descendant_in(&self.contexts, node, ancestor)
    }

    fn deliver(&mut self, event: &WorkflowEvent, owner: ContextId) {
        let contexts = &self.contexts;
        self.subscribers.retain(|sub| {
            if !is_descendant_in(contexts, owner, sub.anchor) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(StreamItem::Event(event.clone())).is_ok()
        });
    }
}

fn is_descendant_in(contexts: &[ContextNode], node: ContextId, ancestor: ContextId) -> bool {
    if ancestor.is_root() {
        return true;
    }
    let mut current = Some(node);
    while let Some(id) = current {
        if id == ancestor {
            return true;
        }
        current = contexts[id.index()].parent;
    }
    false
}

/// A launch decided by a matching pass, executed after the lock is released.
struct Launch {
    context: ContextId,
    handler: Handler,
    inputs: Vec<WorkflowEvent>,
}

/// Launches one matching pass decided, with the hooks in force when it ran.
struct Frame {
    hooks: Hooks,
    launches: VecDeque<Launch>,
}

// ---------------------------------------------------------------------------
// RunShared
// ---------------------------------------------------------------------------

pub(crate) struct RunShared {
    pub run_id: Uuid,
    workflow: Arc<WorkflowInner>,
    hooks: RwLock<Hooks>,
    state: Mutex<RunState>,
    runtime: Option<Handle>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl RunShared {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&RunState) -> R) -> R {
        f(&self.lock())
    }

    fn hooks(&self) -> Hooks {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn emit(self: &Arc<Self>, producer: ContextId, events: Vec<WorkflowEvent>) {
        for event in events {
            self.emit_one(producer, event);
        }
    }

    /// Enqueue `event` and run every synchronous invocation it triggers.
    ///
    /// Events returned by synchronous handlers are fed back through an
    /// explicit frame stack rather than by recursion, so a sync chain of any
    /// length runs in constant native stack. The top frame is drained first,
    /// which gives the same depth-first order as re-entering `emit`.
    fn emit_one(self: &Arc<Self>, producer: ContextId, event: WorkflowEvent) {
        let mut frames = vec![self.enqueue(producer, event)];
        while let Some(frame) = frames.last_mut() {
            let Some(launch) = frame.launches.pop_front() else {
                frames.pop();
                continue;
            };
            let hooks = frame.hooks.clone();
            let returned = self.launch(launch, hooks.dispatch_hooks());
            if returned.is_empty() {
                continue;
            }

            let mut next = Frame {
                hooks: self.hooks(),
                launches: VecDeque::new(),
            };
            for (context, event) in returned {
                next.launches.extend(self.enqueue(context, event).launches);
            }
            // Tail position: a drained frame has nothing left to order.
            if frames.last().is_some_and(|f| f.launches.is_empty()) {
                frames.pop();
            }
            frames.push(next);
        }
    }

    /// Record `event`, deliver it and run the on-emit hooks, then queue it
    /// and run one matching pass. Queueing and matching share a single
    /// critical section, so the instance is only ever claimed by the pass
    /// its own emit triggers (or, if it is left waiting for a partner, by a
    /// later one).
    fn enqueue(self: &Arc<Self>, producer: ContextId, event: WorkflowEvent) -> Frame {
        let hooks = self.hooks();
        let event = {
            let mut state = self.lock();
            let event = if state.owners.contains_key(&event.id()) {
                debug!(
                    run_id = %self.run_id,
                    event = %event.key(),
                    "re-emitted instance restamped"
                );
                event.restamp()
            } else {
                event
            };
            state.owners.insert(event.id(), producer);
            state.contexts[producer.index()].outputs.push(event.clone());
            state.deliver(&event, producer);
            event
        };

        if !hooks.emit_hooks().is_empty() {
            let producer_ctx = HandlerContext::new(Arc::clone(self), producer);
            for hook in hooks.emit_hooks() {
                hook.on_emit(&event, &producer_ctx);
            }
        }

        if self.workflow.config.warn_unmatched
            && !self
                .workflow
                .registrations
                .iter()
                .any(|r| r.types.contains(&event.key()))
        {
            warn!(
                run_id = %self.run_id,
                event = %event.key(),
                "no registration requires this event type"
            );
        }

        let launches = {
            let mut state = self.lock();
            state.queue.push_back(event);
            self.match_queue(&mut state, producer)
        };
        Frame { hooks, launches }
    }

    /// One matching pass, in registration order, against the live queue.
    fn match_queue(&self, state: &mut RunState, trigger: ContextId) -> VecDeque<Launch> {
        let mut launches = VecDeque::new();

        for registration in &self.workflow.registrations {
            let Some(inputs) = matching::claim(&mut state.queue, &registration.types) else {
                continue;
            };

            for handler in &registration.handlers {
                let id = ContextId::from_index(state.contexts.len());
                state.contexts.push(ContextNode::child(
                    trigger,
                    HandlerMeta {
                        id: handler.id(),
                        name: handler.shared_name(),
                    },
                    Arc::clone(&registration.types),
                    inputs.clone(),
                ));
                state.contexts[trigger.index()].children.push(id);
                for input in &inputs {
                    state.consumers.entry(input.id()).or_insert(id);
                }
                launches.push_back(Launch {
                    context: id,
                    handler: handler.clone(),
                    inputs: inputs.clone(),
                });
            }
        }

        launches
    }

    /// Run `launch` through the pre-dispatch chain. Returns the events its
    /// handler produced synchronously, for the caller to enqueue.
    fn launch(
        self: &Arc<Self>,
        launch: Launch,
        hooks: &[Arc<dyn DispatchHook>],
    ) -> Vec<(ContextId, WorkflowEvent)> {
        let Launch {
            context,
            handler,
            inputs,
        } = launch;

        let span = info_span!(
            "invocation",
            run_id = %self.run_id,
            handler = handler.name(),
            context = %context,
        );
        let _entered = span.enter();

        if self.workflow.config.trace_dispatch {
            let types: Vec<String> = inputs.iter().map(|e| e.key().to_string()).collect();
            debug!(inputs = ?types, "dispatching handler");
        }

        let dispatch = Dispatch {
            context: HandlerContext::new(Arc::clone(self), context),
            handler,
            inputs,
        };
        let returned = RefCell::new(Vec::new());
        {
            let terminal = |dispatch: Dispatch| {
                if let Some(output) = self.execute(dispatch, span.clone()) {
                    returned.borrow_mut().push(output);
                }
            };
            Next::new(hooks, &terminal).run(dispatch);
        }
        returned.into_inner()
    }

    /// Final link of the pre-dispatch chain: call the effective handler.
    fn execute(
        self: &Arc<Self>,
        dispatch: Dispatch,
        span: tracing::Span,
    ) -> Option<(ContextId, WorkflowEvent)> {
        let Dispatch {
            context,
            handler,
            inputs,
        } = dispatch;

        match handler.call(context.clone(), inputs) {
            Ok(HandlerOutput::Ready(Some(event))) => return Some((context.id, event)),
            Ok(HandlerOutput::Ready(None)) => {}
            Ok(HandlerOutput::Pending(pending)) => {
                let Some(runtime) = self.runtime() else {
                    self.fail(
                        context.id,
                        anyhow!("handler returned a pending result outside a tokio runtime"),
                    );
                    return None;
                };
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                let task_ctx = context.clone();
                let handle = runtime.spawn(
                    async move {
                        match pending.await {
                            Ok(Some(event)) => task_ctx.emit(event),
                            Ok(None) => {}
                            Err(err) => task_ctx.shared.fail(task_ctx.id, err),
                        }
                        task_ctx.shared.settle();
                    }
                    .instrument(span),
                );
                let mut state = self.lock();
                let node = &mut state.contexts[context.id.index()];
                node.asynchronous = true;
                node.pending = Some(handle);
            }
            Err(err) => self.fail(context.id, err),
        }
        None
    }

    /// Runtime pending results are spawned onto: the caller's, else the one
    /// the run was created in.
    fn runtime(&self) -> Option<Handle> {
        Handle::try_current().ok().or_else(|| self.runtime.clone())
    }

    fn settle(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Failure policy: abort the invocation's own controller when someone
    /// created it, otherwise the failure is fatal for the run.
    pub(crate) fn fail(&self, context: ContextId, err: anyhow::Error) {
        let reason = Arc::new(err);
        let mut state = self.lock();
        let node = &state.contexts[context.index()];
        let handler = node.handler_name().to_string();

        if let Some(controller) = node.abort.clone() {
            drop(state);
            warn!(
                run_id = %self.run_id,
                handler = handler.as_str(),
                context = %context,
                error = %reason,
                "handler failed, aborting its signal"
            );
            controller.abort_shared(reason);
            return;
        }

        error!(
            run_id = %self.run_id,
            handler = handler.as_str(),
            context = %context,
            error = %reason,
            "unhandled handler failure"
        );
        let failure = WorkflowError::HandlerFailed {
            handler,
            context,
            reason,
        };
        if state.failure.is_none() {
            state.failure = Some(failure.clone());
        }
        state.subscribers.retain(|sub| {
            if sub.anchor.is_root() {
                let _ = sub.tx.send(StreamItem::Failed(failure.clone()));
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn controller(&self, context: ContextId) -> AbortController {
        let mut state = self.lock();
        state.contexts[context.index()]
            .abort
            .get_or_insert_with(AbortController::new)
            .clone()
    }

    pub(crate) fn subscribe(&self, anchor: ContextId) -> EventStream {
        let (subscriber, stream) = EventStream::channel(anchor);
        let mut state = self.lock();
        let failure = if anchor.is_root() {
            state.failure.clone()
        } else {
            None
        };
        match failure {
            // Already failed: deliver the outcome and let the stream end.
            Some(failure) => {
                let _ = subscriber.tx.send(StreamItem::Failed(failure));
            }
            None => state.subscribers.push(subscriber),
        }
        stream
    }

    /// Context an anchor event stands for in a substream: whoever consumed
    /// it, or whoever produced it while it is still queued.
    fn anchor_of(&self, event: EventId) -> Option<ContextId> {
        let state = self.lock();
        state
            .consumers
            .get(&event)
            .or_else(|| state.owners.get(&event))
            .copied()
    }
}

// ---------------------------------------------------------------------------
// Run: the public handle
// ---------------------------------------------------------------------------

/// One independent execution of a workflow: its own queue, causal tree
/// and hooks. Dropping every handle (and letting pending handlers finish)
/// discards all of it and closes its streams.
pub struct Run {
    shared: Arc<RunShared>,
}

impl Run {
    pub(crate) fn start(workflow: Arc<WorkflowInner>) -> Self {
        let mut hooks = workflow.hooks.clone();
        for extension in &workflow.extensions {
            extension.install(&mut hooks);
        }

        let run_id = Uuid::new_v4();
        debug!(
            run_id = %run_id,
            registrations = workflow.registrations.len(),
            dispatch_hooks = hooks.dispatch_hooks().len(),
            emit_hooks = hooks.emit_hooks().len(),
            "run created"
        );

        Self {
            shared: Arc::new(RunShared {
                run_id,
                workflow,
                hooks: RwLock::new(hooks),
                state: Mutex::new(RunState::new()),
                runtime: Handle::try_current().ok(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.run_id
    }

    /// The synthetic root context.
    pub fn root(&self) -> HandlerContext {
        HandlerContext::new(Arc::clone(&self.shared), ContextId::ROOT)
    }

    /// Inject a stimulus as the root context. Synchronous handlers it
    /// triggers have all run when this returns. Pending results are spawned
    /// onto the current tokio runtime, or the one the run was created in;
    /// with neither, such an invocation fails.
    pub fn send(&self, event: WorkflowEvent) {
        self.shared.emit(ContextId::ROOT, vec![event]);
    }

    pub fn send_all(&self, events: impl IntoIterator<Item = WorkflowEvent>) {
        self.shared
            .emit(ContextId::ROOT, events.into_iter().collect());
    }

    /// Every event of the run, from now on. Subscribe before `send`.
    pub fn stream(&self) -> EventStream {
        self.shared.subscribe(ContextId::ROOT)
    }

    pub fn signal(&self) -> AbortSignal {
        self.root().signal()
    }

    /// Register a pre-dispatch hook for the rest of this run.
    pub fn add_dispatch_hook(&self, hook: Arc<dyn DispatchHook>) {
        self.shared
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_dispatch(hook);
    }

    /// Register an on-emit hook for the rest of this run.
    pub fn add_emit_hook(&self, hook: Arc<dyn EmitHook>) {
        self.shared
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_emit(hook);
    }

    /// Resolves once no pending handler result is outstanding.
    pub async fn idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// The run-fatal failure, if one happened.
    pub fn failure(&self) -> Option<WorkflowError> {
        self.shared.read(|state| state.failure.clone())
    }

    /// Causal owner of `event`, once it has been emitted in this run.
    pub fn owner_of(&self, event: &WorkflowEvent) -> Option<ContextId> {
        self.shared
            .read(|state| state.owners.get(&event.id()).copied())
    }

    /// Handle for any context of this run's tree.
    pub fn context(&self, id: ContextId) -> Option<HandlerContext> {
        let exists = self.shared.read(|state| id.index() < state.contexts.len());
        exists.then(|| HandlerContext::new(Arc::clone(&self.shared), id))
    }

    /// Instances emitted but not yet consumed by any registration.
    pub fn queued(&self) -> Vec<WorkflowEvent> {
        self.shared
            .read(|state| state.queue.iter().cloned().collect())
    }

    /// Filter `stream` down to events causally downstream of `anchor`:
    /// produced by the invocation that consumed it (or, while it is still
    /// queued, by its producer) or any descendant of that invocation.
    pub fn substream<S>(
        &self,
        anchor: &WorkflowEvent,
        stream: S,
    ) -> impl Stream<Item = Result<WorkflowEvent, WorkflowError>> + Send
    where
        S: Stream<Item = Result<WorkflowEvent, WorkflowError>> + Send,
    {
        let shared = Arc::downgrade(&self.shared);
        let anchor = anchor.id();
        if self.shared.anchor_of(anchor).is_none() {
            warn!(run_id = %self.shared.run_id, anchor = %anchor, "substream anchor was never emitted in this run");
        }

        stream.filter(move |item| {
            let keep = match item {
                Err(_) => true,
                Ok(event) => shared.upgrade().is_some_and(|shared| {
                    let Some(anchor_ctx) = shared.anchor_of(anchor) else {
                        return false;
                    };
                    shared.read(|state| {
                        state
                            .owners
                            .get(&event.id())
                            .is_some_and(|&owner| state.is_descendant(owner, anchor_ctx))
                    })
                }),
            };
            futures::future::ready(keep)
        })
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.shared
            .read(|state| RunSnapshot::capture(self.shared.run_id, state))
    }
}

impl Clone for Run {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}
