//! Write-once result cells with blocking waits.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Returned by [`Promise::result`] before the promise is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("promise is not complete yet")]
pub struct NotReady;

struct Shared<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

/// Reading side. Clones observe the same cell.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// Writing side. Only the first [`PromiseWriter::complete`] takes effect.
pub struct PromiseWriter<T> {
    shared: Arc<Shared<T>>,
    fallback: Option<Box<dyn FnOnce() -> T + Send>>,
}

/// Create a connected writer / reader pair.
pub fn promise<T>() -> (PromiseWriter<T>, Promise<T>) {
    let shared = Arc::new(Shared {
        value: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        PromiseWriter {
            shared: Arc::clone(&shared),
            fallback: None,
        },
        Promise { shared },
    )
}

impl<T> PromiseWriter<T> {
    /// Value written if this writer is dropped before completing.
    pub fn with_fallback(mut self, fallback: impl FnOnce() -> T + Send + 'static) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Store `value` and wake every waiter. Returns `false` if already complete.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.shared.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        drop(slot);
        self.shared.ready.notify_all();
        true
    }

    /// Whether a value has been stored.
    pub fn is_complete(&self) -> bool {
        self.shared.value.lock().is_some()
    }
}

impl<T> Drop for PromiseWriter<T> {
    fn drop(&mut self) {
        if let Some(fallback) = self.fallback.take() {
            if !self.is_complete() {
                self.complete(fallback());
            }
        }
    }
}

impl<T> fmt::Debug for PromiseWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseWriter")
            .field("complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Promise<T> {
    /// Whether a value has been stored.
    pub fn is_complete(&self) -> bool {
        self.shared.value.lock().is_some()
    }

    /// Block until complete.
    pub fn wait(&self) {
        let mut slot = self.shared.value.lock();
        while slot.is_none() {
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Block until complete or `timeout` elapses. Returns whether it completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.value.lock();
        while slot.is_none() {
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.is_some();
            }
        }
        true
    }
}

impl<T: Clone> Promise<T> {
    /// The stored value. Repeated calls return equal values.
    pub fn result(&self) -> Result<T, NotReady> {
        self.shared.value.lock().clone().ok_or(NotReady)
    }

    /// [`Promise::wait`] followed by [`Promise::result`].
    pub fn join(&self) -> T {
        let mut slot = self.shared.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.shared.ready.wait(&mut slot);
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn result_before_completion_is_not_ready() {
        let (_writer, promise) = promise::<u32>();
        assert_eq!(promise.result(), Err(NotReady));
        assert!(!promise.is_complete());
        assert!(!promise.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn only_the_first_completion_counts() {
        let (writer, promise) = promise();
        assert!(writer.complete("first"));
        assert!(!writer.complete("second"));
        assert_eq!(promise.result(), Ok("first"));
        assert_eq!(promise.result(), Ok("first"));
    }

    #[test]
    fn many_waiters_are_released_by_one_completion() {
        let (writer, promise) = promise::<u64>();
        let waiters: Vec<_> = (0..6)
            .map(|_| {
                let promise = promise.clone();
                thread::spawn(move || {
                    promise.wait();
                    promise.result().unwrap()
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        assert!(writer.complete(42));
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), 42);
        }
        assert!(promise.wait_timeout(Duration::ZERO));
        assert_eq!(promise.join(), 42);
    }

    #[test]
    fn dropped_writer_uses_its_fallback() {
        let (writer, abandoned) = promise::<Result<u8, String>>();
        let writer = writer.with_fallback(|| Err("abandoned".to_string()));
        drop(writer);
        assert_eq!(abandoned.result(), Ok(Err("abandoned".to_string())));

        let (writer, completed) = promise::<u8>();
        let writer = writer.with_fallback(|| 0);
        writer.complete(9);
        drop(writer);
        assert_eq!(completed.result(), Ok(9));
    }
}
