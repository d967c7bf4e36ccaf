//! Cooperative cancellation shared between a lifecycle and its nested
//! placeholder loads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{LoadError, LoadResult};

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cloneable cancel flag. All clones observe the same state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake any sleeper. Returns true if this call
    /// performed the transition.
    pub fn cancel(&self) -> bool {
        let first = !self.state.cancelled.swap(true, Ordering::AcqRel);
        if first {
            let _guard = self.state.lock.lock();
            self.state.wake.notify_all();
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once the token has been signalled.
    pub fn check(&self) -> LoadResult<()> {
        if self.is_cancelled() {
            Err(LoadError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning early with `Err(Cancelled)` if the
    /// token is signalled meanwhile.
    pub fn sleep(&self, duration: Duration) -> LoadResult<()> {
        if duration.is_zero() {
            return self.check();
        }
        let deadline = Instant::now() + duration;
        let mut guard = self.state.lock.lock();
        while !self.is_cancelled() {
            if self.state.wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        drop(guard);
        self.check()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
