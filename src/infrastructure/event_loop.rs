//! Event loop shared by every asynchronous operation of a context
//!
//! With zero worker threads the loop is a current-thread runtime that only
//! makes progress while the application polls it through
//! [`EventLoop::poll`] or [`EventLoop::block_on`]. With `n` workers it is a
//! multi-thread runtime and polling merely waits.

use crate::domain::Result;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

pub struct EventLoop {
    runtime: Runtime,
    workers: usize,
}

impl EventLoop {
    pub fn new(workers: usize) -> Result<Self> {
        let runtime = if workers == 0 {
            Builder::new_current_thread().enable_all().build()?
        } else {
            Builder::new_multi_thread()
                .worker_threads(workers)
                .thread_name("sipreach-worker")
                .enable_all()
                .build()?
        };
        info!("Event loop started with {} worker thread(s)", workers);
        Ok(Self { runtime, workers })
    }

    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Poll the loop for at most `max`.
    ///
    /// Must not be called from inside an async task.
    pub fn poll(&self, max: Duration) {
        self.runtime.block_on(async move { tokio::time::sleep(max).await });
    }

    /// Run a future to completion on this loop.
    ///
    /// Must not be called from inside an async task.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn shutdown(self, timeout: Duration) {
        debug!("Shutting down event loop");
        self.runtime.shutdown_timeout(timeout);
    }

    /// Shut down without waiting; safe to call from a runtime thread
    pub fn shutdown_background(self) {
        self.runtime.shutdown_background();
    }
}

/// Whether the current thread is executing inside a tokio runtime
pub fn in_async_context() -> bool {
    Handle::try_current().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_poll_drives_current_thread_loop() {
        let event_loop = EventLoop::new(0).unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        event_loop.handle().spawn(async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(!ran.load(Ordering::SeqCst));

        event_loop.poll(Duration::from_millis(10));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_worker_count() {
        let event_loop = EventLoop::new(2).unwrap();
        assert_eq!(event_loop.worker_count(), 2);
        assert_eq!(event_loop.block_on(async { 7 }), 7);
        assert!(!in_async_context());
    }
}
