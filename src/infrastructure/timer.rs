//! Timer primitive: `schedule(delay, task) -> handle`, `cancel(handle)`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

pub trait Timer: Send + Sync {
    /// Run `task` on the event loop after `delay`.
    ///
    /// A zero delay still defers the task: it never runs on the caller's
    /// stack.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;

    /// Cancel a pending task; false if it already ran or was unknown
    fn cancel(&self, handle: TimerHandle) -> bool;
}

/// Timer backed by tasks spawned on a tokio runtime
pub struct TokioTimer {
    handle: Handle,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl TokioTimer {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();

        // Hold the map lock across spawn so the task cannot finish and
        // remove itself before it is inserted.
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let join = self.handle.spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            let still_pending = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id)
                .is_some();
            if still_pending {
                trace!(timer = id, "Timer fired");
                task();
            }
        });
        map.insert(id, join.abort_handle());
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.0);
        match entry {
            Some(abort) => {
                abort.abort();
                true
            }
            None => false,
        }
    }
}
