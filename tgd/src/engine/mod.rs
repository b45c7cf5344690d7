// TGD - ENGINE MODULE
// Timing and background-task plumbing: clock, RT scheduling, queue-stats sampler.

pub mod clock;
pub mod sampler;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock that recovers the guard from a poisoned mutex.
#[inline(always)]
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
