use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn from_raw(value: u64) -> TimerHandle {
        TimerHandle(value)
    }
}

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// One-shot timers.
///
/// NB: Callbacks must never be invoked synchronously from inside `schedule` or `cancel`:
///  callers typically hold a lock that the callback acquires.
#[cfg_attr(test, automock)]
pub trait TimerService: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Cancelling a timer that fired already (or was cancelled before) is a no-op
    fn cancel(&self, handle: TimerHandle);
}

/// Every timer is a spawned task that sleeps and then calls its callback, and cancelling a timer
///  aborts the task
pub struct TokioTimerService {
    runtime: Handle,
    next_id: AtomicU64,
    pending: Arc<Mutex<FxHashMap<TimerHandle, AbortHandle>>>,
}

impl TokioTimerService {
    pub fn new(runtime: Handle) -> TokioTimerService {
        TokioTimerService {
            runtime,
            next_id: AtomicU64::new(0),
            pending: Default::default(),
        }
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl TimerService for TokioTimerService {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));

        // NB: The lock is held while spawning so the task can not remove its entry before it is
        //      inserted
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let pending_for_task = self.pending.clone();
        let join_handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let still_pending = pending_for_task.lock().unwrap_or_else(PoisonError::into_inner)
                .remove(&handle)
                .is_some();
            if still_pending {
                callback();
            }
        });
        pending.insert(handle, join_handle.abort_handle());

        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        let removed = self.pending.lock().unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        if let Some(abort_handle) = removed {
            trace!("cancelling timer {:?}", handle);
            abort_handle.abort();
        }
    }
}

impl Drop for TokioTimerService {
    fn drop(&mut self) {
        for (_, abort_handle) in self.pending.lock().unwrap_or_else(PoisonError::into_inner).drain() {
            abort_handle.abort();
        }
    }
}
