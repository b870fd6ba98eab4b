use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Caller-supplied cancellation signal for long-running issuance calls.
/// Clones share the underlying flag; cancelling any clone wakes every
/// sleeper immediately.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = lock(&self.inner.cancelled);
        *cancelled = true;
        self.inner.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.cancelled)
    }

    /// Sleeps for `timeout` unless cancelled first. Returns true when the
    /// wait ended because of cancellation.
    pub(crate) fn sleep(&self, timeout: Duration) -> bool {
        let cancelled = lock(&self.inner.cancelled);
        let (cancelled, _) = self
            .inner
            .signal
            .wait_timeout_while(cancelled, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cancelled
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
