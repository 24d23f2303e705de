//! Event tracing and handler decorators.
//!
//! Every run gets its own [`TraceSession`]: an on-emit hook records which
//! invocation produced each event, and a pre-dispatch hook records which one
//! consumed it, then wraps opted-in handlers with their registered
//! decorators. Decorator state is per run and keyed by
//! (input tuple, handler, decorator name).

mod decorator;
mod run_once;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use cascade_engine::{
    ContextId, Dispatch, DispatchHook, EmitHook, EventId, EventKey, Extension, Handler,
    HandlerContext, HandlerId, HandlerOutput, Hooks, Next, Run, WorkflowEvent,
};
use tracing::{debug, warn};

pub use decorator::Decorator;
pub use run_once::RunOnce;

use decorator::{ErasedDecorator, ErasedState};

// ---------------------------------------------------------------------------
// Decorator registry
// ---------------------------------------------------------------------------

struct Registered {
    name: Arc<str>,
    decorator: Arc<dyn ErasedDecorator>,
    handlers: HashSet<HandlerId>,
}

#[derive(Default)]
struct Registry {
    decorators: RwLock<Vec<Registered>>,
}

impl Registry {
    /// Decorators `handler` opted into, in registration order.
    fn applied_to(&self, handler: HandlerId) -> Vec<(Arc<str>, Arc<dyn ErasedDecorator>)> {
        self.decorators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.handlers.contains(&handler))
            .map(|r| (Arc::clone(&r.name), Arc::clone(&r.decorator)))
            .collect()
    }
}

/// Handle returned by [`TraceEvents::register`].
#[derive(Clone)]
pub struct DecoratorRef {
    name: Arc<str>,
    registry: Arc<Registry>,
}

impl DecoratorRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opt `handler` into this decorator. Returns it unchanged, so the call
    /// can wrap a handler inline at registration.
    pub fn apply(&self, handler: Handler) -> Handler {
        let mut decorators = self
            .registry
            .decorators
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(registered) = decorators.iter_mut().find(|r| r.name == self.name) {
            registered.handlers.insert(handler.id());
        }
        handler
    }
}

// ---------------------------------------------------------------------------
// TraceEvents: the extension
// ---------------------------------------------------------------------------

/// Tracing extension. Cheap to clone; clones share the decorator registry.
#[derive(Clone, Default)]
pub struct TraceEvents {
    registry: Arc<Registry>,
}

impl TraceEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `decorator` under `name`. Registering a name again replaces
    /// the decorator and forgets which handlers opted into the old one.
    pub fn register(&self, name: &str, decorator: impl Decorator) -> DecoratorRef {
        let name: Arc<str> = Arc::from(name);
        let mut decorators = self
            .registry
            .decorators
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        decorators.retain(|r| r.name != name);
        decorators.push(Registered {
            name: Arc::clone(&name),
            decorator: Arc::new(decorator),
            handlers: HashSet::new(),
        });
        debug!(decorator = &*name, "decorator registered");

        DecoratorRef {
            name,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Start tracing an already running run. Events it emitted before this
    /// call are unknown to the session and reported when consumed.
    pub fn attach(&self, run: &Run) -> TraceSession {
        let session = self.session();
        run.add_emit_hook(Arc::new(session.clone()));
        run.add_dispatch_hook(Arc::new(session.clone()));
        session
    }

    fn session(&self) -> TraceSession {
        TraceSession {
            inner: Arc::new(SessionInner {
                registry: Arc::clone(&self.registry),
                producers: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                states: Arc::new(Mutex::new(HashMap::new())),
                unregistered: AtomicUsize::new(0),
            }),
        }
    }
}

impl Extension for TraceEvents {
    fn install(&self, hooks: &mut Hooks) {
        let session = self.session();
        hooks.add_emit(Arc::new(session.clone()));
        hooks.add_dispatch(Arc::new(session));
    }
}

// ---------------------------------------------------------------------------
// TraceSession: per-run state
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, Hash)]
struct StateKey {
    input_types: Arc<[EventKey]>,
    handler: HandlerId,
    decorator: Arc<str>,
}

type States = Arc<Mutex<HashMap<StateKey, ErasedState>>>;

struct SessionInner {
    registry: Arc<Registry>,
    producers: Mutex<HashMap<EventId, ContextId>>,
    consumers: Mutex<HashMap<EventId, ContextId>>,
    states: States,
    unregistered: AtomicUsize,
}

/// Tracing state of one run.
#[derive(Clone)]
pub struct TraceSession {
    inner: Arc<SessionInner>,
}

impl TraceSession {
    pub fn producer_of(&self, event: &WorkflowEvent) -> Option<ContextId> {
        self.inner
            .producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.id())
            .copied()
    }

    pub fn consumer_of(&self, event: &WorkflowEvent) -> Option<ContextId> {
        self.inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.id())
            .copied()
    }

    /// Inputs dispatched without this session having seen them emitted.
    pub fn unregistered_inputs(&self) -> usize {
        self.inner.unregistered.load(Ordering::Relaxed)
    }

    fn record_inputs(&self, dispatch: &Dispatch) {
        let producers = self
            .inner
            .producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut consumers = self
            .inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for input in &dispatch.inputs {
            if !producers.contains_key(&input.id()) {
                warn!(
                    run_id = %dispatch.context.run_id(),
                    handler = dispatch.handler.name(),
                    event = %input.key(),
                    "unregistered event detected"
                );
                self.inner.unregistered.fetch_add(1, Ordering::Relaxed);
            }
            consumers.insert(input.id(), dispatch.context.id());
        }
    }

    /// Apply every decorator `dispatch.handler` opted into and arrange for
    /// their after-hooks to run once the invocation settles.
    fn decorate(&self, dispatch: &Dispatch) -> Option<Handler> {
        let applied = self.inner.registry.applied_to(dispatch.handler.id());
        if applied.is_empty() {
            return None;
        }

        let input_types = dispatch.context.input_types();
        let keys: Vec<StateKey> = applied
            .iter()
            .map(|(name, _)| StateKey {
                input_types: Arc::clone(&input_types),
                handler: dispatch.handler.id(),
                decorator: Arc::clone(name),
            })
            .collect();

        // First registered decorator ends up innermost.
        let mut wrapped = dispatch.handler.clone();
        {
            let mut states = self
                .inner
                .states
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for ((_, decorator), key) in applied.iter().zip(&keys) {
                let state = states
                    .entry(key.clone())
                    .or_insert_with(|| decorator.initial_state());
                wrapped = decorator.before_handler(wrapped, &dispatch.context, state);
            }
        }

        let settle = Settle {
            states: Arc::clone(&self.inner.states),
            hooks: applied
                .into_iter()
                .map(|(_, decorator)| decorator)
                .zip(keys)
                .collect(),
        };
        let settle = Arc::new(settle);

        Some(dispatch.handler.with_body(move |ctx, inputs| {
            match wrapped.call(ctx, inputs)? {
                HandlerOutput::Ready(output) => {
                    settle.run();
                    Ok(HandlerOutput::Ready(output))
                }
                HandlerOutput::Pending(pending) => {
                    let settle = Arc::clone(&settle);
                    Ok(HandlerOutput::Pending(Box::pin(async move {
                        let output = pending.await;
                        if output.is_ok() {
                            settle.run();
                        }
                        output
                    })))
                }
            }
        }))
    }
}

/// After-hooks of one invocation.
struct Settle {
    states: States,
    hooks: Vec<(Arc<dyn ErasedDecorator>, StateKey)>,
}

impl Settle {
    fn run(&self) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        for (decorator, key) in &self.hooks {
            if let Some(state) = states.remove(key) {
                states.insert(key.clone(), decorator.after_handler(state));
            }
        }
    }
}

impl EmitHook for TraceSession {
    fn on_emit(&self, event: &WorkflowEvent, producer: &HandlerContext) {
        self.inner
            .producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.id(), producer.id());
    }
}

impl DispatchHook for TraceSession {
    fn before_dispatch(&self, mut dispatch: Dispatch, next: Next<'_>) {
        self.record_inputs(&dispatch);
        if let Some(handler) = self.decorate(&dispatch) {
            dispatch.handler = handler;
        }
        next.run(dispatch);
    }
}
