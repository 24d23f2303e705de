//! Extensions built purely on the engine's middleware protocol.
//!
//! - [`GraphValidator`] checks every emitted event against a declared
//!   transition table and records advisory diagnostics.
//! - [`TraceEvents`] tracks which invocation produced and consumed each event
//!   and runs named [`Decorator`]s around opted-in handlers, with state that
//!   persists across invocations within a run. [`RunOnce`] is built on it.
//!
//! Both only register dispatch and emit hooks, so they compose in any order.

pub mod directed_graph;
pub mod trace_events;

pub use directed_graph::{Diagnostic, GraphValidator};
pub use trace_events::{Decorator, DecoratorRef, RunOnce, TraceEvents, TraceSession};
