use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A binary signaled event in the manual-reset or auto-reset flavor.
///
/// Manual-reset events stay signaled until `reset` is called; auto-reset
/// events are consumed by exactly one successful `wait`.
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
    manual_reset: bool,
}

impl Event {
    #[inline]
    pub fn manual(initially_set: bool) -> Event {
        Event {
            state: Mutex::new(initially_set),
            cond: Condvar::new(),
            manual_reset: true,
        }
    }

    #[inline]
    pub fn auto(initially_set: bool) -> Event {
        Event {
            state: Mutex::new(initially_set),
            cond: Condvar::new(),
            manual_reset: false,
        }
    }

    /// Signals the event, waking all waiters.
    pub fn set(&self) {
        let mut state = self.state.lock().unwrap();
        *state = true;
        self.cond.notify_all();
    }

    /// Clears the signal.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        *state = false;
    }

    /// Returns the current signal state without consuming it.
    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Waits until the event is signaled or the timeout elapses. Returns
    /// true if the event was signaled, false on timeout. `None` waits
    /// forever. An auto-reset event is cleared by the successful wait.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();

        while !*state {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, result) =
                        self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = next;
                    if result.timed_out() && !*state {
                        return false;
                    }
                }
                None => state = self.cond.wait(state).unwrap(),
            }
        }

        if !self.manual_reset {
            *state = false;
        }

        true
    }
}
