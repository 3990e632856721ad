//! Event system shared by the gatehouse components.
//!
//! Every gatehouse component that emits lifecycle or decision events does so
//! through an [`EventListeners`] collection. Listeners are isolated from one
//! another: a panicking listener is caught and logged, and the remaining
//! listeners still observe the event.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Trait for events emitted by gatehouse components.
pub trait GatehouseEvent: Send + Sync + fmt::Debug {
    /// Returns the type of event (e.g. "denied", "job.completed").
    fn event_type(&self) -> &'static str;

    /// Returns when this event occurred.
    fn timestamp(&self) -> Instant;

    /// Returns the name of the component instance that emitted this event.
    fn component(&self) -> &str;
}

/// Trait for listening to gatehouse events.
pub trait Listener<E: GatehouseEvent>: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &E);
}

/// Type alias for shared event listeners.
pub type BoxedListener<E> = Arc<dyn Listener<E>>;

/// A collection of event listeners.
#[derive(Clone)]
pub struct EventListeners<E: GatehouseEvent> {
    listeners: Vec<BoxedListener<E>>,
}

impl<E: GatehouseEvent> EventListeners<E> {
    /// Creates a new empty event listener collection.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Adds a listener to the collection.
    pub fn add<L>(&mut self, listener: L)
    where
        L: Listener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Emits an event to all registered listeners.
    ///
    /// A panicking listener is caught and logged; the remaining listeners
    /// still receive the event.
    pub fn emit(&self, event: &E) {
        for (index, listener) in self.listeners.iter().enumerate() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));

            if let Err(payload) = result {
                let panic_message = payload
                    .downcast_ref::<&'static str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());

                tracing::warn!(
                    listener_index = index,
                    component = event.component(),
                    event_type = event.event_type(),
                    panic_message = %panic_message,
                    "gatehouse event listener panicked"
                );
            }
        }
    }

    /// Returns true if there are no listeners.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Returns the number of listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: GatehouseEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A simple function-based event listener.
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _phantom: std::marker::PhantomData<E>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    /// Creates a new function-based listener.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<E, F> Listener<E> for FnListener<E, F>
where
    E: GatehouseEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}
