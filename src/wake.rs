//! Consumer wake-up.
//!
//! Code on the overflow-interrupt path may only touch types implementing
//! [`NonBlocking`]. The interrupt side of the doorbell ([`Waker`]) is one of
//! them; waiting on the doorbell is not.

use parking_lot::{Condvar, Mutex};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Marker for types that never sleep or wait on a lock that a lower
/// priority context could hold. Only these may be composed into the
/// overflow-interrupt call graph.
pub trait NonBlocking {}

impl<T: NonBlocking + ?Sized> NonBlocking for &T {}
impl<T: NonBlocking + ?Sized> NonBlocking for std::sync::Arc<T> {}
impl<T: NonBlocking + ?Sized> NonBlocking for Box<T> {}

/// A coalescing wake flag between the interrupt path and the consumer.
#[derive(Default)]
pub struct Doorbell {
    pending: AtomicBool,
    rung: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waker(&self) -> Waker<'_> {
        Waker { bell: self }
    }

    /// Block until the doorbell rings or `timeout` passes. Returns whether
    /// a ring was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.pending.swap(false, Ordering::AcqRel) {
            return true;
        }

        let mut guard = self.lock.lock();
        let _ = self.cond.wait_for(&mut guard, timeout);

        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Number of times a ring moved the doorbell from idle to pending.
    pub fn rings(&self) -> u64 {
        self.rung.load(Ordering::Relaxed)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

/// Interrupt-side handle: sets the pending flag and nudges a waiter.
#[derive(Clone, Copy)]
pub struct Waker<'a> {
    bell: &'a Doorbell,
}

impl NonBlocking for Waker<'_> {}

impl Waker<'_> {
    /// At most one wake is pending at a time; repeated rings before the
    /// consumer runs are folded into one.
    pub fn ring(&self) {
        if !self.bell.pending.swap(true, Ordering::AcqRel) {
            self.bell.rung.fetch_add(1, Ordering::Relaxed);
            self.bell.cond.notify_one();
        }
    }
}
