use std::io;
use std::sync::Arc;

use crate::cancel::Latch;

/// How a connection ended from the host's point of view.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Closed,
    Failed(Arc<io::Error>),
}

/// Close and error notifications of one connection.
///
/// Only the first event counts. Subscribers registered after it run immediately.
#[derive(Clone)]
pub struct Lifecycle {
    event: Arc<Latch<LifecycleEvent>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self { event: Arc::new(Latch::new()) }
    }

    pub fn close(&self) {
        self.emit(LifecycleEvent::Closed);
    }

    pub fn fail(&self, error: io::Error) {
        self.emit(LifecycleEvent::Failed(Arc::new(error)));
    }

    pub fn is_terminated(&self) -> bool {
        self.event.is_set()
    }

    pub fn event(&self) -> Option<LifecycleEvent> {
        self.event.get()
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: FnOnce(&LifecycleEvent) + Send + 'static,
    {
        self.event.subscribe(listener);
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Some(listeners) = self.event.set(event) {
            listeners.notify();
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle").field("event", &self.event()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_event_wins() {
        let lifecycle = Lifecycle::new();
        lifecycle.fail(io::Error::from(io::ErrorKind::BrokenPipe));
        lifecycle.close();

        assert!(lifecycle.is_terminated());
        assert!(matches!(lifecycle.event(), Some(LifecycleEvent::Failed(e)) if e.kind() == io::ErrorKind::BrokenPipe));
    }
}
