//! Fire-and-forget dispatch of security events to registered sinks.

use crate::event::SecurityEvent;
use std::sync::{Arc, RwLock};

/// A consumer of security events (log shipper, alerting hook, monitor).
pub trait SecuritySink: Send + Sync + 'static {
    /// Called once per emitted event.
    fn receive(&self, event: &SecurityEvent);
}

/// Function-based sink.
struct FnSink<F>(F);

impl<F> SecuritySink for FnSink<F>
where
    F: Fn(&SecurityEvent) + Send + Sync + 'static,
{
    fn receive(&self, event: &SecurityEvent) {
        (self.0)(event)
    }
}

/// Dispatches each emitted event to every registered sink.
///
/// Inside a tokio runtime, one task is spawned per sink per event and the
/// emitter never waits; outside a runtime, sinks run inline. Sinks are
/// isolated: a panicking sink is caught and logged without affecting the
/// others.
#[derive(Clone, Default)]
pub struct SecurityEventBus {
    sinks: Arc<RwLock<Vec<Arc<dyn SecuritySink>>>>,
}

impl SecurityEventBus {
    /// Creates a bus with no sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink.
    pub fn subscribe<S: SecuritySink>(&self, sink: S) {
        self.subscribe_arc(Arc::new(sink));
    }

    /// Registers an already-shared sink.
    pub fn subscribe_arc(&self, sink: Arc<dyn SecuritySink>) {
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    /// Registers a function as a sink.
    pub fn subscribe_fn<F>(&self, f: F)
    where
        F: Fn(&SecurityEvent) + Send + Sync + 'static,
    {
        self.subscribe(FnSink(f));
    }

    /// Number of registered sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emits `event` to every sink without waiting for any of them.
    pub fn emit(&self, event: SecurityEvent) {
        let sinks: Vec<Arc<dyn SecuritySink>> = self
            .sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(Arc::clone)
            .collect();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                for sink in sinks {
                    let event = event.clone();
                    handle.spawn(async move {
                        deliver(&*sink, &event);
                    });
                }
            }
            Err(_) => {
                for sink in sinks {
                    deliver(&*sink, &event);
                }
            }
        }
    }
}

fn deliver(sink: &dyn SecuritySink, event: &SecurityEvent) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        sink.receive(event);
    }));
    if result.is_err() {
        tracing::warn!(
            kind = ?event.kind,
            "security sink panicked while handling event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{SecurityAction, SecurityEventKind, Severity};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn event() -> SecurityEvent {
        SecurityEvent::new(
            SecurityEventKind::SuspiciousRequest,
            Severity::Medium,
            SecurityAction::Monitored,
            "test",
        )
    }

    #[tokio::test]
    async fn every_sink_observes_the_event() {
        let bus = SecurityEventBus::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let a_clone = Arc::clone(&a);
        bus.subscribe_fn(move |_| {
            a_clone.fetch_add(1, Ordering::SeqCst);
        });
        let b_clone = Arc::clone(&b);
        bus.subscribe_fn(move |_| {
            b_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(event());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_sink_does_not_stop_the_others() {
        let bus = SecurityEventBus::new();
        let survivor = Arc::new(AtomicUsize::new(0));

        bus.subscribe_fn(|_| panic!("boom"));
        let survivor_clone = Arc::clone(&survivor);
        bus.subscribe_fn(move |_| {
            survivor_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(event());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(survivor.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn without_a_runtime_sinks_run_inline() {
        let bus = SecurityEventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        bus.subscribe_fn(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
