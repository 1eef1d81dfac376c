//! Cancellable one-shot timers
//!
//! A [`Timer`] runs a closure once after a delay on the tokio runtime.
//! Dropping the handle cancels it, so a timer stored in a struct field is
//! cancelled when the field is overwritten or cleared.

use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Run `f` once after `delay`
    ///
    /// Returns `None` when called outside a tokio runtime.
    pub fn after<F>(delay: Duration, f: F) -> Option<Timer>
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = Handle::try_current().ok()?;
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        Some(Timer {
            handle: Some(handle),
        })
    }

    /// Abort the timer if it has not fired yet
    pub fn cancel(mut self) {
        self.abort();
    }

    /// Let the timer fire even though the handle goes away
    pub fn detach(mut self) {
        self.handle.take();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.abort();
    }
}
