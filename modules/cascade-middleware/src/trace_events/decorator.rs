use std::any::Any;

use cascade_engine::{Handler, HandlerContext};

/// A named behavior wrapped around opted-in handlers.
///
/// State is kept per run for each (input tuple, handler) pair the decorator
/// sees, created by [`initial_state`](Self::initial_state) on first dispatch.
pub trait Decorator: Send + Sync + 'static {
    type State: Send + 'static;

    fn initial_state(&self) -> Self::State;

    /// Wrap `next`, the handler about to run. Returning `next` untouched is a
    /// pass-through; returning a different body short-circuits or transforms
    /// the call. Attribution stays with the original handler either way.
    fn before_handler(&self, next: Handler, ctx: &HandlerContext, state: &Self::State) -> Handler;

    /// Called once the invocation settled successfully, after its pending
    /// result resolved for asynchronous handlers.
    fn after_handler(&self, state: Self::State) -> Self::State;
}

pub(crate) type ErasedState = Box<dyn Any + Send>;

/// Object-safe view of a [`Decorator`], with its state boxed.
pub(crate) trait ErasedDecorator: Send + Sync {
    fn initial_state(&self) -> ErasedState;
    fn before_handler(&self, next: Handler, ctx: &HandlerContext, state: &ErasedState) -> Handler;
    fn after_handler(&self, state: ErasedState) -> ErasedState;
}

impl<D: Decorator> ErasedDecorator for D {
    fn initial_state(&self) -> ErasedState {
        Box::new(Decorator::initial_state(self))
    }

    fn before_handler(&self, next: Handler, ctx: &HandlerContext, state: &ErasedState) -> Handler {
        match state.downcast_ref::<D::State>() {
            Some(state) => Decorator::before_handler(self, next, ctx, state),
            None => next,
        }
    }

    fn after_handler(&self, state: ErasedState) -> ErasedState {
        match state.downcast::<D::State>() {
            Ok(state) => Box::new(Decorator::after_handler(self, *state)),
            Err(state) => state,
        }
    }
}
