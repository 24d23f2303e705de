//! Core types for the event model.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

static NEXT_EVENT_KEY: AtomicU64 = AtomicU64::new(1);
static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// EventKey: erased identity of an event type
// ---------------------------------------------------------------------------

/// Type-erased identity of an [`EventType`]. Used for registration tuples
/// and side tables. Equality and hashing use the identity only; the label
/// is for humans.
#[derive(Clone, Copy, Serialize)]
pub struct EventKey {
    id: u64,
    label: Option<&'static str>,
}

impl EventKey {
    fn allocate(label: Option<&'static str>) -> Self {
        Self {
            id: NEXT_EVENT_KEY.fetch_add(1, Ordering::Relaxed),
            label,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> Option<&'static str> {
        self.label
    }
}

impl PartialEq for EventKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventKey {}

impl Hash for EventKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label {
            Some(label) => write!(f, "{label}"),
            None => write!(f, "event#{}", self.id),
        }
    }
}

// ---------------------------------------------------------------------------
// EventType<T>
// ---------------------------------------------------------------------------

/// An event type: identity token plus a factory for instances carrying `T`.
pub struct EventType<T> {
    key: EventKey,
    _payload: PhantomData<fn() -> T>,
}

impl<T> EventType<T>
where
    T: fmt::Debug + Send + Sync + 'static,
{
    /// Declare a new, unlabeled event type.
    pub fn new() -> Self {
        Self {
            key: EventKey::allocate(None),
            _payload: PhantomData,
        }
    }

    /// Declare a new event type with a debug label.
    pub fn labeled(label: &'static str) -> Self {
        Self {
            key: EventKey::allocate(Some(label)),
            _payload: PhantomData,
        }
    }

    /// Stamp `payload` into a new instance of this type.
    pub fn with(&self, payload: T) -> WorkflowEvent {
        WorkflowEvent {
            id: EventId::allocate(),
            key: self.key,
            payload: Arc::new(payload),
            created_at: Utc::now(),
        }
    }

    /// True when `event` was produced by this type. Identity, not structure.
    pub fn includes(&self, event: &WorkflowEvent) -> bool {
        event.key == self.key
    }

    /// Typed view of the payload, if `event` belongs to this type.
    pub fn payload<'a>(&self, event: &'a WorkflowEvent) -> Option<&'a T> {
        if !self.includes(event) {
            return None;
        }
        (*event.payload).as_any().downcast_ref::<T>()
    }

    pub fn key(&self) -> EventKey {
        self.key
    }

    pub fn label(&self) -> Option<&'static str> {
        self.key.label
    }
}

impl<T> Default for EventType<T>
where
    T: fmt::Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EventType<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for EventType<T> {}

impl<T> PartialEq for EventType<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for EventType<T> {}

impl<T> fmt::Debug for EventType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventType").field(&self.key).finish()
    }
}

impl<T> From<EventType<T>> for EventKey {
    fn from(ty: EventType<T>) -> Self {
        ty.key
    }
}

impl<T> From<&EventType<T>> for EventKey {
    fn from(ty: &EventType<T>) -> Self {
        ty.key
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Anything that can ride inside a [`WorkflowEvent`].
pub trait Payload: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T> Payload for T
where
    T: Any + fmt::Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowEvent: immutable instance
// ---------------------------------------------------------------------------

/// Stable identifier of one event instance. Side tables key on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EventId(u64);

impl EventId {
    fn allocate() -> Self {
        Self(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable (type, payload) pair. Cloning is cheap and keeps the id:
/// a clone is the same instance, not a new one.
#[derive(Clone)]
pub struct WorkflowEvent {
    id: EventId,
    key: EventKey,
    payload: Arc<dyn Payload>,
    created_at: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn key(&self) -> EventKey {
        self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Untyped payload access. Prefer [`EventType::payload`].
    pub fn payload_any(&self) -> &dyn Any {
        (*self.payload).as_any()
    }

    /// `Debug` rendering of the payload, for diagnostics and logs.
    pub fn payload_debug(&self) -> String {
        format!("{:?}", self.payload)
    }

    /// A new instance of the same type and payload with a fresh id.
    pub fn restamp(&self) -> WorkflowEvent {
        WorkflowEvent {
            id: EventId::allocate(),
            key: self.key,
            payload: Arc::clone(&self.payload),
            created_at: Utc::now(),
        }
    }

    /// Same instance (same id), regardless of payload equality.
    pub fn same_instance(&self, other: &WorkflowEvent) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEvent")
            .field("id", &self.id)
            .field("type", &self.key)
            .field("payload", &self.payload)
            .finish()
    }
}
