use std::sync::{Mutex, MutexGuard, PoisonError};

type Listener<T> = Box<dyn FnOnce(&T) + Send>;

/// A value that is set at most once, with listeners notified of it exactly once.
///
/// Listeners registered before the value is set run in registration order when it is set;
/// listeners registered afterwards run immediately on the registering thread.
pub(crate) struct Latch<T> {
    state: Mutex<LatchState<T>>,
}

enum LatchState<T> {
    Pending(Vec<Listener<T>>),
    Set(T),
}

impl<T: Clone> Latch<T> {
    pub(crate) fn new() -> Self {
        Self { state: Mutex::new(LatchState::Pending(Vec::new())) }
    }

    fn lock(&self) -> MutexGuard<'_, LatchState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value` if nothing was stored yet and hands back the listeners still to be run.
    ///
    /// Returns `None` when the latch was already set; the value is then discarded.
    pub(crate) fn set(&self, value: T) -> Option<Listeners<T>> {
        let mut state = self.lock();
        if matches!(*state, LatchState::Set(_)) {
            return None;
        }

        match std::mem::replace(&mut *state, LatchState::Set(value.clone())) {
            LatchState::Pending(listeners) => Some(Listeners { value, listeners }),
            LatchState::Set(_) => None,
        }
    }

    pub(crate) fn subscribe<F>(&self, listener: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let value = {
            let mut state = self.lock();
            match &mut *state {
                LatchState::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                }
                LatchState::Set(value) => value.clone(),
            }
        };

        // the lock is released so the listener may subscribe again
        listener(&value);
    }

    pub(crate) fn get(&self) -> Option<T> {
        match &*self.lock() {
            LatchState::Pending(_) => None,
            LatchState::Set(value) => Some(value.clone()),
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        matches!(*self.lock(), LatchState::Set(_))
    }
}

/// Listeners detached from a [`Latch`] that was just set, run outside the lock.
pub(crate) struct Listeners<T> {
    value: T,
    listeners: Vec<Listener<T>>,
}

impl<T> Listeners<T> {
    pub(crate) fn notify(self) {
        for listener in self.listeners {
            listener(&self.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn notifies_in_order_once() {
        let latch = Latch::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = Arc::clone(&seen);
            latch.subscribe(move |value: &u32| seen.lock().unwrap().push((i, *value)));
        }

        latch.set(7).expect("first set").notify();
        assert!(latch.set(8).is_none());

        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
        assert_eq!(latch.get(), Some(7));
    }

    #[test]
    fn late_subscriber_runs_immediately() {
        let latch = Latch::new();
        latch.set("closed").expect("first set").notify();

        let seen = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&seen);
        latch.subscribe(move |value| *captured.lock().unwrap() = Some(*value));

        assert_eq!(*seen.lock().unwrap(), Some("closed"));
    }
}
