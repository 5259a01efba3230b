/*!
Host-waitable fences with a cached status.

Once a [`Fence`] has been observed signaled the result is cached, later
queries return without polling the device fence.
*/

use crate::{error::Error, sync};
use parking_lot::Mutex;
use std::{
    fmt::{self, Debug},
    sync::Arc,
    time::{Duration, Instant},
};

/// Slice used to poll fences when the timeout is unbounded.
const POLL_SLICE: Duration = Duration::from_millis(1);

struct FenceInner {
    fence: sync::Fence,
    signaled: Mutex<bool>,
}

/// A fence, cloning yields another handle to the same fence.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub(crate) fn new(fence: sync::Fence) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                fence,
                signaled: Mutex::new(false),
            }),
        }
    }
    /// The device fence signaled by dispatches.
    pub(crate) fn device_fence(&self) -> &sync::Fence {
        &self.inner.fence
    }
    fn poll(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let mut signaled = self.inner.signaled.lock();
        if *signaled {
            return Ok(());
        }
        self.inner.fence.try_wait(timeout)?;
        *signaled = true;
        Ok(())
    }
    /** Non blocking status query.

    **errors**
    - [`Error::FenceNotReady`] if the fence has not signaled.
    - [`Error::FenceFailure`] if the guarded work failed. */
    pub fn get_status(&self) -> Result<(), Error> {
        self.poll(None)
    }
    /** Blocks for at most `timeout`.

    **errors**
    - [`Error::Timeout`] if the fence did not signal in time.
    - [`Error::FenceFailure`] if the guarded work failed. */
    pub fn wait(&self, timeout: Duration) -> Result<(), Error> {
        {
            if *self.inner.signaled.lock() {
                return Ok(());
            }
        }
        // The cache lock is not held while blocking.
        match self.inner.fence.try_wait(Some(timeout)) {
            Ok(()) => {
                *self.inner.signaled.lock() = true;
                Ok(())
            }
            Err(Error::FenceNotReady) => Err(Error::Timeout),
            Err(e) => Err(e),
        }
    }
    /// Returns the fence to the unsignaled state.
    pub fn reset(&self) {
        let mut signaled = self.inner.signaled.lock();
        self.inner.fence.reset();
        *signaled = false;
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
        f.debug_struct("Fence")
            .field("fence", &self.inner.fence)
            .field("signaled", &*self.inner.signaled.lock())
            .finish()
    }
}

/** Waits on several fences.

With `wait_all` false, returns as soon as any fence signals. The timeout is
divided evenly between the fences, so every fence gets observed within one
pass that never takes longer than `timeout`. A timeout of [`Duration::MAX`]
keeps polling until a fence signals.

With `wait_all` true, waits on each fence in turn, fails with
[`Error::Timeout`] as soon as the elapsed time of the whole call exceeds
`timeout`.

**errors**
- [`Error::InvalidValue`] if `fences` is empty.
- [`Error::Timeout`]
- [`Error::FenceFailure`] if a fence that was waited on reports failure. */
pub fn wait_for_fences(fences: &[&Fence], wait_all: bool, timeout: Duration) -> Result<(), Error> {
    if fences.is_empty() {
        return Err(Error::InvalidValue);
    }
    let start = Instant::now();
    if wait_all {
        for fence in fences {
            let remaining = timeout
                .checked_sub(start.elapsed())
                .ok_or(Error::Timeout)?;
            fence.wait(remaining)?;
        }
        return Ok(());
    }
    let unbounded = timeout == Duration::MAX;
    let slice = if unbounded {
        POLL_SLICE
    } else {
        timeout / fences.len() as u32
    };
    loop {
        for fence in fences {
            match fence.wait(slice) {
                Err(e) if e.is_transient() => (),
                result => return result,
            }
        }
        if !unbounded {
            return Err(Error::Timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fence() -> Fence {
        Fence::new(sync::Fence::new())
    }

    #[test]
    fn status_is_cached() {
        let fence = fence();
        assert_eq!(fence.get_status(), Err(Error::FenceNotReady));
        fence.device_fence().signal(false);
        assert_eq!(fence.get_status(), Ok(()));
        // The device fence is reset behind the cache's back.
        fence.device_fence().reset();
        assert_eq!(fence.get_status(), Ok(()));
        fence.reset();
        assert_eq!(fence.get_status(), Err(Error::FenceNotReady));
    }

    #[test]
    fn wait_any_returns_first_signaled() {
        let fences = [fence(), fence(), fence()];
        fences[2].device_fence().signal(false);
        let refs: Vec<_> = fences.iter().collect();
        let start = Instant::now();
        wait_for_fences(&refs, false, Duration::from_millis(300)).unwrap();
        // The first two fences each get a third of the budget.
        assert!(start.elapsed() < Duration::from_millis(300));
        assert_eq!(fences[0].get_status(), Err(Error::FenceNotReady));
    }

    #[test]
    fn wait_any_polls_every_fence_with_zero_timeout() {
        let (pending, done) = (fence(), fence());
        done.device_fence().signal(false);
        assert_eq!(
            wait_for_fences(&[&pending, &done], false, Duration::ZERO),
            Ok(())
        );
        assert_eq!(
            wait_for_fences(&[&pending, &pending], false, Duration::from_nanos(1)),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn wait_any_times_out_within_budget() {
        let fences = [fence(), fence(), fence(), fence()];
        let refs: Vec<_> = fences.iter().collect();
        let timeout = Duration::from_millis(80);
        let start = Instant::now();
        assert_eq!(wait_for_fences(&refs, false, timeout), Err(Error::Timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout * 3);
    }

    #[test]
    fn wait_all_tracks_elapsed_time() {
        let (a, b) = (fence(), fence());
        a.device_fence().signal(false);
        assert_eq!(
            wait_for_fences(&[&a, &b], true, Duration::from_millis(20)),
            Err(Error::Timeout)
        );
        let signaler = b.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaler.device_fence().signal(false);
        });
        wait_for_fences(&[&a, &b], true, Duration::from_secs(10)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn wait_reports_failure() {
        let fence = fence();
        fence.device_fence().signal(true);
        assert_eq!(
            wait_for_fences(&[&fence], false, Duration::MAX),
            Err(Error::FenceFailure)
        );
        assert_eq!(fence.get_status(), Err(Error::FenceFailure));
    }
}
