/*!
Device synchronization primitives.

A [`Semaphore`] orders dispatches relative to one another: a submission
waits on semaphores before it runs and signals semaphores when it is done.
A [`Fence`] is the host-visible completion signal of one dispatch.

Both are cheap handles around shared state, cloning yields another handle
to the same primitive. Equality and hashing are by identity.
*/

use crate::error::Error;
use parking_lot::{Condvar, Mutex};
use std::{
    fmt::{self, Debug},
    hash::{Hash, Hasher},
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Default)]
struct SemaphoreInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// A binary semaphore signaled by the device.
#[derive(Clone, Default)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
    pub fn is_signaled(&self) -> bool {
        *self.inner.signaled.lock()
    }
    pub(crate) fn signal(&self) {
        let mut signaled = self.inner.signaled.lock();
        *signaled = true;
        self.inner.cond.notify_all();
    }
    /// Returns the semaphore to the unsignaled state.
    pub fn reset(&self) {
        *self.inner.signaled.lock() = false;
    }
    /// Blocks for at most `timeout`, returns whether the semaphore is signaled.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.inner.signaled.lock();
        if !*signaled {
            self.inner.cond.wait_for(&mut signaled, timeout);
        }
        *signaled
    }
    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl PartialEq for Semaphore {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Semaphore {}

impl Hash for Semaphore {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Semaphore({:#x})", self.id())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::IsVariant)]
enum FenceState {
    Unsignaled,
    Signaled,
    Failed,
}

struct FenceInner {
    state: Mutex<FenceState>,
    cond: Condvar,
}

/// A host-waitable completion signal.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                state: Mutex::new(FenceState::Unsignaled),
                cond: Condvar::new(),
            }),
        }
    }
    /** Polls or waits on the fence.

    With `timeout` of `None` the fence is polled once without blocking.

    **errors**
    - [`Error::FenceNotReady`] if the fence did not signal in time.
    - [`Error::FenceFailure`] if the guarded work failed. */
    pub fn try_wait(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if let Some(timeout) = timeout {
            let deadline = Instant::now().checked_add(timeout);
            while state.is_unsignaled() {
                match deadline {
                    Some(deadline) => {
                        if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                    None => self.inner.cond.wait(&mut state),
                }
            }
        }
        match *state {
            FenceState::Unsignaled => Err(Error::FenceNotReady),
            FenceState::Signaled => Ok(()),
            FenceState::Failed => Err(Error::FenceFailure),
        }
    }
    /// Blocks until the fence signals.
    pub fn wait(&self) -> Result<(), Error> {
        self.try_wait(Some(Duration::MAX))
    }
    pub fn reset(&self) {
        *self.inner.state.lock() = FenceState::Unsignaled;
    }
    pub(crate) fn signal(&self, failed: bool) {
        let mut state = self.inner.state.lock();
        *state = if failed {
            FenceState::Failed
        } else {
            FenceState::Signaled
        };
        self.inner.cond.notify_all();
    }
    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl PartialEq for Fence {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Fence {}

impl Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fence({:#x})", self.id())
    }
}
