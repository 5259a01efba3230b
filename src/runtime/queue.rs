/*!
In-order queues.

A [`Queue`] moves every command buffer through
`cached -> pending -> running -> completed -> cached or destroyed`.

Pending dispatches are recorded but not yet handed to the device queue.
[`flush`](Queue::flush) submits them in order, each waiting on the signal
semaphore of its predecessor, on everything running and on the events it
was enqueued with. Because the queue is in order, the cleanup pass only
needs to inspect the oldest running dispatch.
*/

use super::{context::Context, event::Event};
use crate::{
    command_buffer::CommandBuffer,
    device::{Device, DeviceQueue},
    error::Error,
    sync::Semaphore,
};
use anyhow::{bail, Result};
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use std::{
    collections::{HashSet, VecDeque},
    fmt::{self, Debug},
    sync::Arc,
};

/// What happens to a recycled command buffer when the cache is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum OverflowPolicy {
    /// Destroy the recycled command buffer.
    #[default]
    Destroy,
    /// Destroy the oldest cached command buffer and cache the recycled one.
    EvictOldest,
}

/** Options for creating a [`Queue`].

```
# use muxrt::runtime::{OverflowPolicy, QueueOptions};
# fn main() -> Result<(), serde_json::Error> {
let options: QueueOptions = serde_json::from_str(r#"{ "overflow": "EvictOldest" }"#)?;
assert_eq!(options.cache_capacity, 16);
assert_eq!(options.overflow, OverflowPolicy::EvictOldest);
# Ok(())
# }
```
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Idle command buffers kept for reuse.
    pub cache_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 16,
            overflow: OverflowPolicy::Destroy,
        }
    }
}

/// The fate of a command buffer handed back to the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::IsVariant)]
pub enum Recycled {
    Cached,
    /// Cached after evicting the oldest cached command buffer.
    Evicted,
    Destroyed,
}

/// Builder for creating a [`Queue`].
pub struct QueueBuilder {
    context: Arc<Context>,
    device: Device,
    options: QueueOptions,
}

impl QueueBuilder {
    pub fn cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.options.cache_capacity = cache_capacity;
        self
    }
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.options.overflow = overflow;
        self
    }
    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }
    /** Creates a queue with its own device queue.

    **errors**
    - The device is not part of the context.
    - The device queue could not be created. */
    pub fn build(self) -> Result<Queue> {
        let Self {
            context,
            device,
            options,
        } = self;
        if context.device_position(&device).is_none() {
            bail!("{device:?} is not part of the context!");
        }
        let device_queue = device.create_queue()?;
        let mut cache = VecDeque::new();
        cache.try_reserve_exact(options.cache_capacity)?;
        tracing::debug!(?device, ?options, "queue created");
        let shared = Arc::new_cyclic(|weak| Shared {
            this: weak.clone(),
            context,
            device,
            device_queue,
            options,
            state: Mutex::new(QueueState {
                pending_dispatches: VecDeque::new(),
                running_dispatches: VecDeque::new(),
                cache,
                completed_events: Vec::new(),
            }),
        });
        Ok(Queue { shared })
    }
}

struct Dispatch {
    command_buffer: Arc<CommandBuffer>,
    wait_semaphores: Vec<Semaphore>,
    signal_event: Event,
}

struct QueueState {
    pending_dispatches: VecDeque<Dispatch>,
    running_dispatches: VecDeque<Dispatch>,
    cache: VecDeque<Arc<CommandBuffer>>,
    completed_events: Vec<Event>,
}

pub(crate) struct Shared {
    this: std::sync::Weak<Shared>,
    context: Arc<Context>,
    device: Device,
    device_queue: DeviceQueue,
    options: QueueOptions,
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> QueueGuard {
        QueueGuard {
            queue: self,
            state: self.state.lock(),
        }
    }
    pub(crate) fn flush(&self) -> Result<(), Error> {
        self.lock().flush()
    }
    fn wait(&self) -> Result<(), Error> {
        self.flush()?;
        self.device_queue.wait_all()?;
        self.lock().cleanup_completed_command_buffers()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Err(e) = self.wait() {
            tracing::warn!(device = ?self.device, "queue released with errors: {e}");
        }
        let state = self.state.get_mut();
        for dispatch in state.pending_dispatches.drain(..) {
            tracing::warn!(
                command_buffer = dispatch.command_buffer.id(),
                "discarding pending dispatch"
            );
            dispatch.signal_event.semaphore().signal();
            dispatch.signal_event.fence().device_fence().signal(true);
        }
    }
}

/** A locked queue.

Command buffers are handed out and recycled under the queue lock. */
pub struct QueueGuard<'a> {
    queue: &'a Shared,
    state: MutexGuard<'a, QueueState>,
}

impl QueueGuard<'_> {
    /** Takes a command buffer to record into and appends a pending dispatch
    that will signal `signal_event`.

    The dispatch waits on the latest pending dispatch, on every running
    dispatch, and on `wait_events`, each semaphore at most once.

    **errors**
    - [`Error::OutOfMemory`] */
    pub fn get_command_buffer(
        &mut self,
        signal_event: &Event,
        wait_events: &[Event],
    ) -> Result<Arc<CommandBuffer>, Error> {
        let state = &mut *self.state;
        let mut wait_semaphores: Vec<Semaphore> = Vec::new();
        let previous = state
            .pending_dispatches
            .back()
            .map(|dispatch| dispatch.signal_event.semaphore());
        let running = state
            .running_dispatches
            .iter()
            .map(|dispatch| dispatch.signal_event.semaphore());
        let explicit = wait_events.iter().map(Event::semaphore);
        for semaphore in previous.into_iter().chain(running).chain(explicit) {
            if !wait_semaphores.contains(semaphore) {
                wait_semaphores.try_reserve(1)?;
                wait_semaphores.push(semaphore.clone());
            }
        }
        state.pending_dispatches.try_reserve(1)?;
        let command_buffer = match state.cache.pop_front() {
            Some(command_buffer) => command_buffer,
            None => self.queue.device.create_command_buffer()?,
        };
        state.pending_dispatches.push_back(Dispatch {
            command_buffer: command_buffer.clone(),
            wait_semaphores,
            signal_event: signal_event.clone(),
        });
        Ok(command_buffer)
    }
    /// Removes the latest pending dispatch, for when recording into it failed.
    pub(crate) fn discard_latest(&mut self) {
        if let Some(dispatch) = self.state.pending_dispatches.pop_back() {
            self.destroy_command_buffer(dispatch.command_buffer);
        }
    }
    /** Submits every pending dispatch in order.

    Completed command buffers are reclaimed first. Stops at the first
    dispatch that fails to submit, which stays pending.

    **errors**
    - [`Error::InvalidQueue`] if finalizing or dispatching fails.
    - [`Error::OutOfMemory`] */
    pub fn flush(&mut self) -> Result<(), Error> {
        self.cleanup_completed_command_buffers()?;
        let device_queue = &self.queue.device_queue;
        while !self.state.pending_dispatches.is_empty() {
            self.state.running_dispatches.try_reserve(1)?;
            let Some(dispatch) = self.state.pending_dispatches.front() else {
                break;
            };
            let event = &dispatch.signal_event;
            let submit = dispatch.command_buffer.finalize().and_then(|()| {
                device_queue.dispatch(
                    &dispatch.command_buffer,
                    Some(event.fence().device_fence()),
                    &dispatch.wait_semaphores,
                    std::slice::from_ref(event.semaphore()),
                )
            });
            if let Err(e) = submit {
                tracing::warn!(
                    command_buffer = dispatch.command_buffer.id(),
                    "submission failed: {e}"
                );
                return Err(match e {
                    Error::OutOfMemory => Error::OutOfMemory,
                    _ => Error::InvalidQueue,
                });
            }
            tracing::debug!(
                command_buffer = dispatch.command_buffer.id(),
                waits = dispatch.wait_semaphores.len(),
                "submitted"
            );
            if let Some(dispatch) = self.state.pending_dispatches.pop_front() {
                self.state.running_dispatches.push_back(dispatch);
            }
        }
        Ok(())
    }
    /** Retires completed dispatches from the front of the running list.

    A failed dispatch counts as complete. Completed events are released once
    no running dispatch waits on them.

    **errors**
    - [`Error::InvalidQueue`] if a fence can't be queried. */
    pub fn cleanup_completed_command_buffers(&mut self) -> Result<(), Error> {
        while let Some(dispatch) = self.state.running_dispatches.front() {
            match dispatch.signal_event.fence().get_status() {
                Ok(()) => (),
                Err(Error::FenceNotReady) => break,
                Err(Error::FenceFailure) => {
                    tracing::warn!(command_buffer = dispatch.command_buffer.id(), "dispatch failed");
                }
                Err(_) => return Err(Error::InvalidQueue),
            }
            let Some(dispatch) = self.state.running_dispatches.pop_front() else {
                break;
            };
            tracing::trace!(command_buffer = dispatch.command_buffer.id(), "retired");
            let recycled = self.destroy_command_buffer(dispatch.command_buffer);
            tracing::trace!(?recycled);
            let state = &mut *self.state;
            let semaphore = dispatch.signal_event.semaphore();
            for pending in state.pending_dispatches.iter_mut() {
                pending.wait_semaphores.retain(|s| s != semaphore);
            }
            state.completed_events.try_reserve(1)?;
            state.completed_events.push(dispatch.signal_event);
            let referenced: HashSet<&Semaphore> = state
                .running_dispatches
                .iter()
                .flat_map(|dispatch| dispatch.wait_semaphores.iter())
                .collect();
            state
                .completed_events
                .retain(|event| referenced.contains(event.semaphore()));
        }
        Ok(())
    }
    /** Resets `command_buffer` and returns it to the cache.

    A command buffer that fails to reset is destroyed. When the cache is
    full the [`OverflowPolicy`] decides. */
    pub fn destroy_command_buffer(&mut self, command_buffer: Arc<CommandBuffer>) -> Recycled {
        let device = &self.queue.device;
        if let Err(e) = device.reset_command_buffer(&command_buffer) {
            tracing::warn!(command_buffer = command_buffer.id(), "reset failed: {e}");
            return self.destroy(command_buffer);
        }
        let cache = &mut self.state.cache;
        let capacity = self.queue.options.cache_capacity;
        if cache.len() < capacity {
            cache.push_back(command_buffer);
            return Recycled::Cached;
        }
        match self.queue.options.overflow {
            OverflowPolicy::EvictOldest if capacity > 0 => {
                if let Some(oldest) = cache.pop_front() {
                    tracing::debug!(command_buffer = oldest.id(), "evicted from cache");
                    self.destroy(oldest);
                }
                self.state.cache.push_back(command_buffer);
                Recycled::Evicted
            }
            _ => {
                tracing::debug!(command_buffer = command_buffer.id(), "cache full");
                self.destroy(command_buffer)
            }
        }
    }
    fn destroy(&self, command_buffer: Arc<CommandBuffer>) -> Recycled {
        if let Err((command_buffer, e)) = self.queue.device.destroy_command_buffer(command_buffer) {
            tracing::warn!(command_buffer = command_buffer.id(), "destroy failed: {e}");
        }
        Recycled::Destroyed
    }
}

/** An in-order queue on one device of a context.

Cloning yields another handle to the same queue. Dropping the last handle
waits for all submitted work. */
#[derive(Clone)]
pub struct Queue {
    shared: Arc<Shared>,
}

impl Queue {
    pub fn builder(context: &Arc<Context>, device: &Device) -> QueueBuilder {
        QueueBuilder {
            context: context.clone(),
            device: device.clone(),
            options: QueueOptions::default(),
        }
    }
    pub fn context(&self) -> &Arc<Context> {
        &self.shared.context
    }
    pub fn device(&self) -> &Device {
        &self.shared.device
    }
    pub fn options(&self) -> &QueueOptions {
        &self.shared.options
    }
    /// A new event signaled by work enqueued on this queue.
    pub fn create_event(&self) -> Event {
        Event::new(self.shared.this.clone())
    }
    /// Locks the queue.
    pub fn lock(&self) -> QueueGuard {
        self.shared.lock()
    }
    /// See [`QueueGuard::flush`].
    pub fn flush(&self) -> Result<(), Error> {
        self.shared.flush()
    }
    /** Flushes, blocks until all submitted work has completed and
    reclaims the command buffers.

    **errors**
    - Errors from [`flush`](Self::flush).
    - [`Error::DeviceLost`] if the device queue is gone. */
    pub fn wait(&self) -> Result<(), Error> {
        self.shared.wait()
    }
    /// Alias of [`wait`](Self::wait).
    pub fn finish(&self) -> Result<(), Error> {
        self.wait()
    }
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending_dispatches.len()
    }
    pub fn running_len(&self) -> usize {
        self.shared.state.lock().running_dispatches.len()
    }
    /// Idle command buffers in the cache.
    pub fn cached_len(&self) -> usize {
        self.shared.state.lock().cache.len()
    }
    /// Completed events still held because a running dispatch waits on them.
    pub fn completed_events_len(&self) -> usize {
        self.shared.state.lock().completed_events.len()
    }
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
    pub(crate) fn same(&self, shared: &Shared) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.shared), shared)
    }
    pub(crate) fn downgrade(&self) -> std::sync::Weak<Shared> {
        Arc::downgrade(&self.shared)
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Queue {}

impl Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue")
            .field("device", &self.shared.device)
            .field("options", &self.shared.options)
            .finish()
    }
}
