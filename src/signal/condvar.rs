use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use super::Wake;
use crate::BackendSpecificError;

/// A waitable event built on a mutex and condition variable.
///
/// Cloning gives another handle to the same event.
#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

struct Inner {
    manual_reset: bool,
    state: Mutex<State>,
}

struct State {
    signaled: bool,
    // Waiters blocked on a set that includes this event.
    watchers: Vec<Weak<Bell>>,
}

/// Wakes a single waiter when any event it watches is set.
struct Bell {
    rung: Mutex<bool>,
    cv: Condvar,
}

impl Bell {
    fn new() -> Self {
        Bell {
            rung: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn ring(&self) {
        *self.rung.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }

    fn wait_until(&self, deadline: Instant) {
        let mut rung = self.rung.lock().unwrap_or_else(PoisonError::into_inner);
        while !*rung {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            rung = self
                .cv
                .wait_timeout(rung, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *rung = false;
    }
}

impl Event {
    pub fn new(manual_reset: bool, initial_state: bool) -> Result<Event, BackendSpecificError> {
        Ok(Event {
            inner: Arc::new(Inner {
                manual_reset,
                state: Mutex::new(State {
                    signaled: initial_state,
                    watchers: Vec::new(),
                }),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self) -> Result<(), BackendSpecificError> {
        let mut state = self.state();
        state.signaled = true;
        state.watchers.retain(|watcher| match watcher.upgrade() {
            Some(bell) => {
                bell.ring();
                true
            }
            None => false,
        });
        Ok(())
    }

    pub fn reset(&self) -> Result<(), BackendSpecificError> {
        self.state().signaled = false;
        Ok(())
    }

    /// Peeks at the signal without consuming it.
    pub fn is_set(&self) -> bool {
        self.state().signaled
    }

    /// Waits for the event, consuming the signal if the event is auto-reset.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, BackendSpecificError> {
        Ok(Event::wait_any(&[self], timeout)? == Wake::One(0))
    }

    /// Waits until any event in `events` is signaled. The first signaled event in slice order
    /// wins and only that one is consumed.
    pub fn wait_any(events: &[&Event], timeout: Duration) -> Result<Wake, BackendSpecificError> {
        Ok(Event::wait_with(events, timeout, |events| {
            events
                .iter()
                .position(|event| event.try_take())
                .map(Wake::One)
        }))
    }

    /// Waits until every event in `events` is signaled at once, then consumes them all.
    pub fn wait_all(events: &[&Event], timeout: Duration) -> Result<Wake, BackendSpecificError> {
        Ok(Event::wait_with(events, timeout, |events| {
            if events.iter().all(|event| event.is_set()) {
                for event in events {
                    event.try_take();
                }
                Some(Wake::All)
            } else {
                None
            }
        }))
    }

    fn wait_with<F>(events: &[&Event], timeout: Duration, mut ready: F) -> Wake
    where
        F: FnMut(&[&Event]) -> Option<Wake>,
    {
        let bell = Arc::new(Bell::new());
        let watcher = Arc::downgrade(&bell);
        for event in events {
            event.state().watchers.push(watcher.clone());
        }
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365));
        let wake = loop {
            if let Some(wake) = ready(events) {
                break wake;
            }
            if Instant::now() >= deadline {
                break Wake::TimedOut;
            }
            bell.wait_until(deadline);
        };
        for event in events {
            event
                .state()
                .watchers
                .retain(|w| w.strong_count() > 0 && !Weak::ptr_eq(w, &watcher));
        }
        wake
    }

    fn try_take(&self) -> bool {
        let mut state = self.state();
        if state.signaled {
            if !self.inner.manual_reset {
                state.signaled = false;
            }
            true
        } else {
            false
        }
    }
}
