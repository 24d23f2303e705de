//! Middleware protocol: the two interception points every run exposes.
//!
//! * **Pre-dispatch** hooks form a chain around each handler call. A hook
//!   receives the [`Dispatch`] and a [`Next`]; it may swap the handler, call
//!   `next.run(..)` to continue, or return without calling it to skip.
//! * **On-emit** hooks observe every enqueued event together with the
//!   context that produced it.
//!
//! Extensions only ever talk to the engine through these two lists, which is
//! what lets them stack in any order.

use std::sync::Arc;

use cascade_events::WorkflowEvent;

use crate::context::HandlerContext;
use crate::handler::Handler;

/// One pending handler call, as seen by pre-dispatch hooks.
pub struct Dispatch {
    pub context: HandlerContext,
    pub handler: Handler,
    pub inputs: Vec<WorkflowEvent>,
}

/// The rest of the pre-dispatch chain.
pub struct Next<'a> {
    hooks: &'a [Arc<dyn DispatchHook>],
    terminal: &'a (dyn Fn(Dispatch) + 'a),
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        hooks: &'a [Arc<dyn DispatchHook>],
        terminal: &'a (dyn Fn(Dispatch) + 'a),
    ) -> Self {
        Self { hooks, terminal }
    }

    /// Hand the dispatch to the next hook, or to the handler itself.
    pub fn run(self, dispatch: Dispatch) {
        match self.hooks.split_first() {
            Some((hook, rest)) => hook.before_dispatch(
                dispatch,
                Next {
                    hooks: rest,
                    terminal: self.terminal,
                },
            ),
            None => (self.terminal)(dispatch),
        }
    }
}

pub trait DispatchHook: Send + Sync {
    fn before_dispatch(&self, dispatch: Dispatch, next: Next<'_>);
}

impl<F> DispatchHook for F
where
    F: Fn(Dispatch, Next<'_>) + Send + Sync,
{
    fn before_dispatch(&self, dispatch: Dispatch, next: Next<'_>) {
        self(dispatch, next)
    }
}

pub trait EmitHook: Send + Sync {
    fn on_emit(&self, event: &WorkflowEvent, producer: &HandlerContext);
}

impl<F> EmitHook for F
where
    F: Fn(&WorkflowEvent, &HandlerContext) + Send + Sync,
{
    fn on_emit(&self, event: &WorkflowEvent, producer: &HandlerContext) {
        self(event, producer)
    }
}

/// Installs hooks into every run created from a workflow. Called once per
/// run, so per-run state belongs in the hook objects it registers.
pub trait Extension: Send + Sync {
    fn install(&self, hooks: &mut Hooks);
}

/// The two ordered hook lists of a run. Adding a hook that is already
/// present (same `Arc`) is a no-op.
#[derive(Clone, Default)]
pub struct Hooks {
    dispatch: Vec<Arc<dyn DispatchHook>>,
    emit: Vec<Arc<dyn EmitHook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dispatch(&mut self, hook: Arc<dyn DispatchHook>) -> &mut Self {
        if !self.dispatch.iter().any(|h| same_hook(h, &hook)) {
            self.dispatch.push(hook);
        }
        self
    }

    pub fn add_emit(&mut self, hook: Arc<dyn EmitHook>) -> &mut Self {
        if !self.emit.iter().any(|h| same_hook(h, &hook)) {
            self.emit.push(hook);
        }
        self
    }

    /// Append `other`'s hooks after ours, skipping duplicates.
    pub fn merge(&mut self, other: &Hooks) -> &mut Self {
        for hook in &other.dispatch {
            self.add_dispatch(Arc::clone(hook));
        }
        for hook in &other.emit {
            self.add_emit(Arc::clone(hook));
        }
        self
    }

    pub fn dispatch_hooks(&self) -> &[Arc<dyn DispatchHook>] {
        &self.dispatch
    }

    pub fn emit_hooks(&self) -> &[Arc<dyn EmitHook>] {
        &self.emit
    }
}

fn same_hook<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_hooks_are_merged_once() {
        let dispatch: Arc<dyn DispatchHook> = Arc::new(|d: Dispatch, next: Next<'_>| next.run(d));
        let emit: Arc<dyn EmitHook> = Arc::new(|_: &WorkflowEvent, _: &HandlerContext| {});

        let mut root = Hooks::new();
        root.add_dispatch(Arc::clone(&dispatch)).add_emit(Arc::clone(&emit));

        let mut nested = Hooks::new();
        nested.add_dispatch(Arc::clone(&dispatch));
        nested.add_emit(Arc::new(|_: &WorkflowEvent, _: &HandlerContext| {}));

        root.merge(&nested);
        assert_eq!(root.dispatch_hooks().len(), 1);
        assert_eq!(root.emit_hooks().len(), 2);
    }
}
