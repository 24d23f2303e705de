//! Event-driven workflow execution engine.
//!
//! A [`Workflow`] binds tuples of event types to handlers. Each
//! [`Run`] owns a queue and a causal tree: emitted events are matched
//! against the registrations, matches launch handler invocations, and every
//! invocation becomes a child of the context whose emit triggered it.
//! Streams project that tree back out, per context.
//!
//! Cross-cutting behavior plugs in through the middleware protocol
//! ([`DispatchHook`], [`EmitHook`], [`Extension`]) without touching the engine.

pub mod abort;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
mod matching;
pub mod middleware;
pub mod run;
pub mod snapshot;
pub mod stream;
pub mod workflow;

pub use abort::{AbortController, AbortSignal};
pub use cascade_events::{EventId, EventKey, EventType, WorkflowEvent};
pub use config::EngineConfig;
pub use context::{ContextId, HandlerContext};
pub use error::WorkflowError;
pub use handler::{EventHandler, Handler, HandlerId, HandlerOutput};
pub use middleware::{Dispatch, DispatchHook, EmitHook, Extension, Hooks, Next};
pub use run::Run;
pub use snapshot::{ContextSnapshot, EventSummary, RunSnapshot};
pub use stream::EventStream;
pub use workflow::{HandlerRef, Workflow, WorkflowBuilder};
