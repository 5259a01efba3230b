//! Events signaled by queued work.

use super::{fence::Fence, queue::Shared};
use crate::{error::Error, sync};
use std::{
    fmt::{self, Debug},
    sync::{Arc, Weak},
    time::Duration,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::IsVariant)]
pub enum EventStatus {
    /// Not yet complete, the work may still be pending on the queue.
    Queued,
    Complete,
    /// The work completed with an error.
    Failed,
}

struct EventInner {
    semaphore: sync::Semaphore,
    fence: Fence,
    queue: Weak<Shared>,
}

/** Completion of one enqueued command.

Events are reference counted, cloning yields another handle. The queue
holds its own handles until no running dispatch waits on the event. */
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(crate) fn new(queue: Weak<Shared>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                semaphore: sync::Semaphore::new(),
                fence: Fence::new(sync::Fence::new()),
                queue,
            }),
        }
    }
    /// Signaled by the device when the work completes.
    pub fn semaphore(&self) -> &sync::Semaphore {
        &self.inner.semaphore
    }
    pub fn fence(&self) -> &Fence {
        &self.inner.fence
    }
    pub fn status(&self) -> EventStatus {
        match self.inner.fence.get_status() {
            Ok(()) => EventStatus::Complete,
            Err(Error::FenceFailure) => EventStatus::Failed,
            Err(_) => EventStatus::Queued,
        }
    }
    /** Flushes the owning queue, then blocks until the work completes.

    **errors**
    - [`Error::FenceFailure`] if the work failed.
    - Errors from flushing the queue. */
    pub fn wait(&self) -> Result<(), Error> {
        if let Some(queue) = self.inner.queue.upgrade() {
            queue.flush()?;
        }
        self.inner.fence.wait(Duration::MAX)
    }
    pub(crate) fn queue(&self) -> Option<Arc<Shared>> {
        self.inner.queue.upgrade()
    }
    /// The number of handles to this event, including the queue's.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Event {}

impl Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("semaphore", &self.inner.semaphore)
            .field("status", &self.status())
            .finish()
    }
}
