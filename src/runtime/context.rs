/*!
Contexts and memory shared between their devices.

A [`MemBuffer`] has one backing allocation per device of its context,
allocated on first use. The context remembers which queue last used each
buffer. Before a queue uses a buffer, [`MemBuffer::sync`] waits for the
previous queue and copies the whole buffer over when the queues are on
different devices.
*/

use super::{platform::Platform, queue::Queue};
use crate::{device::Device, error::Error, memory::DeviceBuffer};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};

/// The queue that last used a buffer.
struct LastAccess {
    queue: Weak<super::queue::Shared>,
    device: usize,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    last_access: HashMap<u64, Option<LastAccess>>,
}

/// A set of devices of one platform.
pub struct Context {
    platform: Arc<Platform>,
    devices: Vec<Device>,
    registry: Mutex<Registry>,
}

impl Context {
    /** Creates a context for `devices`.

    **errors**
    - [`Error::InvalidValue`] if `devices` is empty, has duplicates, or a
      device is not part of `platform`. */
    pub fn new(platform: &Arc<Platform>, devices: &[Device]) -> Result<Arc<Self>, Error> {
        if devices.is_empty() {
            return Err(Error::InvalidValue);
        }
        for (i, device) in devices.iter().enumerate() {
            if !platform.contains(device) || devices[..i].contains(device) {
                return Err(Error::InvalidValue);
            }
        }
        let mut owned = Vec::new();
        owned.try_reserve_exact(devices.len())?;
        owned.extend_from_slice(devices);
        Ok(Arc::new(Self {
            platform: platform.clone(),
            devices: owned,
            registry: Mutex::default(),
        }))
    }
    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
    pub(crate) fn device_position(&self, device: &Device) -> Option<usize> {
        self.devices.iter().position(|d| d == device)
    }
    /** Creates a zeroed buffer of `len` bytes.

    Memory is allocated on the first device immediately, on other devices
    when first used there.

    **errors**
    - [`Error::InvalidValue`] if `len` is 0.
    - [`Error::OutOfMemory`] */
    pub fn create_buffer(self: &Arc<Self>, len: usize) -> Result<Arc<MemBuffer>, Error> {
        let mut allocations = Vec::new();
        allocations.try_reserve_exact(self.devices.len())?;
        allocations.resize_with(self.devices.len(), OnceCell::new);
        let first = self.devices[0].alloc(len)?;
        let _ = allocations[0].set(first);
        let mut registry = self.registry.lock();
        registry.last_access.try_reserve(1)?;
        let id = registry.next_id;
        registry.next_id += 1;
        registry.last_access.insert(id, None);
        Ok(Arc::new(MemBuffer {
            id,
            context: self.clone(),
            len,
            allocations,
            migrations: AtomicUsize::default(),
        }))
    }
    /// The number of live buffers.
    pub fn buffers(&self) -> usize {
        self.registry.lock().last_access.len()
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("devices", &self.devices)
            .finish()
    }
}

/// A buffer usable from every device of its context.
pub struct MemBuffer {
    id: u64,
    context: Arc<Context>,
    len: usize,
    allocations: Vec<OnceCell<DeviceBuffer>>,
    migrations: AtomicUsize,
}

impl MemBuffer {
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    fn allocation(&self, position: usize) -> Result<&DeviceBuffer, Error> {
        let cell = self.allocations.get(position).ok_or(Error::InvalidValue)?;
        cell.get_or_try_init(|| self.context.devices[position].alloc(self.len))
    }
    /** The backing allocation on `device`, allocated if necessary.

    The contents are only current on the device of the queue that last
    [synced](Self::sync) the buffer.

    **errors**
    - [`Error::InvalidValue`] if `device` is not part of the context.
    - [`Error::OutOfMemory`] */
    pub fn buffer(&self, device: &Device) -> Result<DeviceBuffer, Error> {
        let position = self
            .context
            .device_position(device)
            .ok_or(Error::InvalidValue)?;
        self.allocation(position).cloned()
    }
    /** Makes the buffer current for `queue`.

    Does nothing in a single device context, on first use, or when `queue`
    used the buffer last. Otherwise waits for the last queue and, if it is
    on another device, copies the whole buffer to the device of `queue`.
    Queues on the same device share the allocation, nothing is copied.

    Must not be called while `queue` or the last queue is locked. The
    context registry is not held while waiting.

    **errors**
    - [`Error::InvalidQueue`] if `queue` belongs to another context.
    - Errors from waiting on the last queue.
    - [`Error::OutOfMemory`] */
    pub fn sync(&self, queue: &Queue) -> Result<(), Error> {
        if !Arc::ptr_eq(queue.context(), &self.context) {
            return Err(Error::InvalidQueue);
        }
        if self.context.devices.len() == 1 {
            return Ok(());
        }
        let target = self
            .context
            .device_position(queue.device())
            .ok_or(Error::InvalidQueue)?;
        let last = self
            .context
            .registry
            .lock()
            .last_access
            .get(&self.id)
            .ok_or(Error::InvalidValue)?
            .as_ref()
            .map(|last| (last.queue.clone(), last.device));
        // Retiring work drops buffers, which locks the registry.
        if let Some((last_queue, last_device)) = last {
            if let Some(shared) = last_queue.upgrade() {
                if queue.same(&shared) {
                    return Ok(());
                }
                Queue::from_shared(shared).wait()?;
            }
            if last_device != target {
                let src = self.allocation(last_device)?;
                let dst = self.allocation(target)?;
                src.copy_to(dst)?;
                self.migrations.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(
                    buffer = self.id,
                    from = ?self.context.devices[last_device],
                    to = ?queue.device(),
                    "migrated"
                );
            }
        }
        let mut registry = self.context.registry.lock();
        let last_access = registry
            .last_access
            .get_mut(&self.id)
            .ok_or(Error::InvalidValue)?;
        *last_access = Some(LastAccess {
            queue: queue.downgrade(),
            device: target,
        });
        Ok(())
    }
    /// The number of copies between devices performed by [`sync`](Self::sync).
    pub fn migrations(&self) -> usize {
        self.migrations.load(Ordering::SeqCst)
    }
}

impl Drop for MemBuffer {
    fn drop(&mut self) {
        self.context.registry.lock().last_access.remove(&self.id);
    }
}

impl Debug for MemBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}
