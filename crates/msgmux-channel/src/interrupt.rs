//! Explicit cancellation for blocking channel waits.
//!
//! An [`Interrupt`] is shared between the thread that blocks (for example in
//! [`Channel::open_outbound_message_interruptible`](crate::Channel::open_outbound_message_interruptible))
//! and whoever wants to cancel that wait. Triggering it wakes every wait
//! currently registered with it. The flag stays set until [`Interrupt::clear`]
//! is called, so the caller can still observe it after the wait failed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Waker = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    interrupted: AtomicBool,
    next_waker: AtomicU64,
    wakers: Mutex<HashMap<u64, Waker>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every registered wait.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        // Wakers take the channel lock; never call them under our own lock.
        let wakers: Vec<Waker> = self
            .inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for wake in wakers {
            wake();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Reset the flag so the handle can be reused.
    pub fn clear(&self) {
        self.inner.interrupted.store(false, Ordering::SeqCst);
    }

    /// Register `wake` until the returned guard is dropped.
    pub(crate) fn register(&self, wake: Waker) -> Registration {
        let key = self.inner.next_waker.fetch_add(1, Ordering::Relaxed);
        self.inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, wake);
        Registration {
            inner: Arc::clone(&self.inner),
            key,
        }
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

pub(crate) struct Registration {
    inner: Arc<Inner>,
    key: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
