//! Event model for cascade workflows.
//!
//! An [`EventType`] is an identity token and a factory. Calling
//! [`EventType::with`] stamps a payload into an immutable [`WorkflowEvent`].
//! Types are compared by identity, never by structure: two types declared
//! with the same label and payload shape are still different types.
//!
//! This crate knows nothing about handlers, queues or contexts.

pub mod types;

pub use types::{EventId, EventKey, EventType, Payload, WorkflowEvent};
