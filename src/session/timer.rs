use parking_lot::{Condvar, Mutex};

use std::time::{Duration, Instant};

/// A cancellable sleep shared between a waiting thread and whoever may
/// cancel it.
#[derive(Default)]
pub struct CancelToken {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Sleep for `duration`. Returns `true` if the full duration elapsed
    /// and `false` if the token was cancelled first.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.cancelled.lock();

        while !*cancelled {
            if self.cond.wait_until(&mut cancelled, deadline).timed_out() {
                return !*cancelled;
            }
        }

        false
    }
}
