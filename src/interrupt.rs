//! Cooperative thread interruption
//!
//! Rust threads cannot be interrupted from the outside, so every thread gets
//! an interrupt flag of its own. Interrupting a thread sets the flag, unparks
//! the thread and runs the wake-up callback the thread registered while it is
//! blocked on a condition variable.
//!
//! Lifecycle waits turn a pending interrupt into
//! [`LifecycleError::Interrupted`](crate::lifecycle::LifecycleError), and pool
//! workers observe it through [`is_interrupted`] and [`sleep`].
//!
//! # Example
//!
//! ```rust
//! use meshestra_runtime::interrupt::{self, InterruptHandle};
//! use std::time::Duration;
//!
//! let (tx, rx) = std::sync::mpsc::channel();
//! let worker = std::thread::spawn(move || {
//!     tx.send(InterruptHandle::current()).unwrap();
//!     interrupt::sleep(Duration::from_secs(60))
//! });
//!
//! rx.recv().unwrap().interrupt();
//! assert!(worker.join().unwrap().is_err());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use thiserror::Error;

type Waker = Arc<dyn Fn() + Send + Sync>;

/// Returned by interruptible operations when the calling thread was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("thread was interrupted")]
pub struct Interrupted;

struct Inner {
    flag: AtomicBool,
    waker: Mutex<Option<Waker>>,
    thread: Thread,
}

/// A handle that can interrupt one particular thread.
#[derive(Clone)]
pub struct InterruptHandle {
    inner: Arc<Inner>,
}

thread_local! {
    static CURRENT: InterruptHandle = InterruptHandle::for_thread(thread::current());
}

impl InterruptHandle {
    fn for_thread(thread: Thread) -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                waker: Mutex::new(None),
                thread,
            }),
        }
    }

    /// Handle for the calling thread.
    pub fn current() -> Self {
        CURRENT.with(Clone::clone)
    }

    /// Interrupts the thread behind this handle.
    ///
    /// The flag stays set until the thread clears it with [`interrupted`].
    pub fn interrupt(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let waker = self
            .inner
            .waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(waker) = waker {
            waker();
        }
        self.inner.thread.unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.inner.thread.name()
    }

    fn set_waker(&self, waker: Option<Waker>) {
        *self
            .inner
            .waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = waker;
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("thread", &self.inner.thread.name())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Keeps a wake-up callback registered for the current thread; dropping it
/// unregisters the callback.
pub(crate) struct WakerGuard {
    handle: InterruptHandle,
}

impl Drop for WakerGuard {
    fn drop(&mut self) {
        self.handle.set_waker(None);
    }
}

/// Registers `waker` to run whenever the current thread is interrupted.
///
/// The callback must notify whatever condition variable the thread is about
/// to block on, taking that condition variable's mutex first.
pub(crate) fn on_interrupt(waker: impl Fn() + Send + Sync + 'static) -> WakerGuard {
    let handle = InterruptHandle::current();
    handle.set_waker(Some(Arc::new(waker)));
    WakerGuard { handle }
}

/// Whether the current thread has a pending interrupt. Does not clear it.
pub fn is_interrupted() -> bool {
    CURRENT.with(|handle| handle.is_interrupted())
}

/// Tests and clears the current thread's interrupt flag.
pub fn interrupted() -> bool {
    CURRENT.with(|handle| handle.inner.flag.swap(false, Ordering::SeqCst))
}

/// Sets the current thread's interrupt flag again, for callers that consumed
/// an interrupt but must leave it visible to code further up the stack.
pub fn set_interrupted() {
    CURRENT.with(|handle| handle.inner.flag.store(true, Ordering::SeqCst));
}

/// Sleeps for `duration` unless the current thread is interrupted first.
///
/// Consumes the interrupt when it returns `Err`.
pub fn sleep(duration: Duration) -> Result<(), Interrupted> {
    let deadline = Instant::now() + duration;
    loop {
        if interrupted() {
            return Err(Interrupted);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::park_timeout(deadline - now);
    }
}
