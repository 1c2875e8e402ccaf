//! One-shot completion events.
//!
//! An [`Event`] settles exactly once, either signaled or failed, and every
//! waiter observes the same outcome. Waiting parks the thread on a condvar;
//! nothing here spins.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tidal_core::{Result, TidalError};

/// One-shot, edge-triggered completion signal shared across threads.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Default)]
struct EventInner {
    outcome: Mutex<Option<Result<()>>>,
    cv: Condvar,
}

impl Event {
    /// Create an unsettled event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an event that is already signaled.
    pub fn signaled() -> Self {
        let event = Self::new();
        event.signal();
        event
    }

    /// Settle successfully. Returns `false` if the event had already settled.
    pub fn signal(&self) -> bool {
        self.settle(Ok(()))
    }

    /// Settle with an error. Returns `false` if the event had already settled.
    pub fn fail(&self, err: TidalError) -> bool {
        self.settle(Err(err))
    }

    /// Settle with `outcome`; later calls are ignored.
    pub fn settle(&self, outcome: Result<()>) -> bool {
        let mut slot = self.inner.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.inner.cv.notify_all();
        true
    }

    /// Non-blocking poll. `None` while unsettled.
    pub fn query(&self) -> Option<Result<()>> {
        self.inner.outcome.lock().clone()
    }

    /// Whether the event has settled (successfully or not).
    pub fn is_settled(&self) -> bool {
        self.inner.outcome.lock().is_some()
    }

    /// Whether the event settled successfully.
    pub fn is_set(&self) -> bool {
        matches!(*self.inner.outcome.lock(), Some(Ok(())))
    }

    /// Block until the event settles and return its outcome.
    pub fn wait(&self) -> Result<()> {
        let mut slot = self.inner.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.inner.cv.wait(&mut slot);
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.query() {
            None => "pending",
            Some(Ok(())) => "signaled",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Event").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_settles_once() {
        let e = Event::new();
        assert!(e.query().is_none());
        assert!(e.signal());
        assert!(!e.fail(TidalError::Transfer("late".into())));
        assert_eq!(e.wait(), Ok(()));
        assert!(e.is_set());
    }

    #[test]
    fn test_failure_is_shared() {
        let e = Event::new();
        let clone = e.clone();
        clone.fail(TidalError::Transfer("dma fault".into()));
        assert!(e.is_settled());
        assert!(!e.is_set());
        assert_eq!(e.wait(), Err(TidalError::Transfer("dma fault".into())));
    }

    #[test]
    fn test_wait_across_threads() {
        let e = Event::new();
        let waiter = {
            let e = e.clone();
            thread::spawn(move || e.wait())
        };
        thread::sleep(Duration::from_millis(20));
        e.signal();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }
}
