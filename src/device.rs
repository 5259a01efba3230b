/*!
Devices and device queues.

A [`Device`] owns device memory and creates [command buffers](CommandBuffer),
[semaphores](Semaphore), [fences](Fence) and [queues](DeviceQueue). This is the
primitive layer that the [runtime](crate::runtime) drives.

Creating a device and printing out its info:
```
# use muxrt::device::Device;
# fn main() -> muxrt::result::Result<()> {
let device = Device::builder()
    .index(1)
    .memory_size(1 << 20)
    .build()?;
dbg!(device.info());
# Ok(())
# }
```

# Queues
Each [`DeviceQueue`] executes dispatched command buffers in order on its own
worker thread. A dispatch:
- Waits for every wait semaphore to be signaled.
- Executes the commands of the command buffer in recorded order.
- Signals the signal semaphores, then the fences.

Different queues execute independently, ordering between them is only
expressed through semaphores.
*/

use crate::{
    command_buffer::CommandBuffer,
    descriptor::{system_allocator, Allocator},
    error::Error,
    memory::{DeviceBuffer, Image, ImageFormat},
    sync::{Fence, Semaphore},
};
use anyhow::Result;
use serde::Deserialize;
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

mod host_engine;
use host_engine::Engine;

/// Errors.
pub mod error {
    use std::fmt::{self, Debug, Display};

    /// The device index is greater than or equal to the number of devices.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Device index {index} is out of range 0..{devices}!")]
    pub struct DeviceIndexOutOfRange {
        pub(crate) index: usize,
        pub(crate) devices: usize,
    }

    /// The requested memory size is zero.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    pub struct ZeroMemorySize;

    impl Display for ZeroMemorySize {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            Debug::fmt(self, f)
        }
    }
}
use error::*;

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Device`].
    pub struct DeviceBuilder {
        pub(super) options: DeviceOptions,
        pub(super) allocator: Option<Arc<dyn Allocator>>,
    }

    impl DeviceBuilder {
        /// Index of the device, defaults to 0.
        pub fn index(mut self, index: usize) -> Self {
            self.options.index = index;
            self
        }
        pub fn name(mut self, name: impl Into<String>) -> Self {
            self.options.name = name.into();
            self
        }
        /// Bytes of device memory, defaults to 1 GiB.
        pub fn memory_size(mut self, memory_size: u64) -> Self {
            self.options.memory_size = memory_size;
            self
        }
        /// Requested features, unsupported features are dropped.
        pub fn features(mut self, features: Features) -> Self {
            self.options.features = features;
            self
        }
        /// Replaces all options, for example ones deserialized from a config file.
        pub fn options(mut self, options: DeviceOptions) -> Self {
            self.options = options;
            self
        }
        /// Allocator for packed kernel arguments, defaults to [`SystemAllocator`](crate::descriptor::SystemAllocator).
        pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
            self.allocator.replace(allocator);
            self
        }
        /// Creates a device.
        ///
        /// **errors**
        /// - [`ZeroMemorySize`](super::error::ZeroMemorySize)
        pub fn build(self) -> Result<Device> {
            if self.options.memory_size == 0 {
                return Err(ZeroMemorySize.into());
            }
            let engine = Engine::new(self.options)?;
            Ok(Device {
                engine,
                allocator: self.allocator.unwrap_or_else(system_allocator),
            })
        }
    }
}
use builder::*;

/// The primitive operations a device implementation provides.
trait DeviceEngine {
    type Queue: DeviceEngineQueue;
    fn new(options: DeviceOptions) -> Result<Arc<Self>>;
    fn id(&self) -> DeviceId;
    fn info(&self) -> &Arc<DeviceInfo>;
    fn alloc(&self, len: usize) -> Result<DeviceBuffer, Error>;
    fn memory_used(&self) -> u64;
    fn create_queue(self: &Arc<Self>) -> Result<Arc<Self::Queue>, Error>;
}

trait DeviceEngineQueue {
    fn dispatch(&self, submission: Submission) -> Result<(), Error>;
    fn wait_all(&self) -> Result<(), Error>;
}

/// A command buffer handed to a device queue.
struct Submission {
    command_buffer: Arc<CommandBuffer>,
    fence: Option<Fence>,
    wait_semaphores: Vec<Semaphore>,
    signal_semaphores: Vec<Semaphore>,
}

/** Options for creating a [`Device`].

Missing fields take their defaults when deserialized:
```
# use muxrt::device::DeviceOptions;
# fn main() -> Result<(), serde_json::Error> {
let options: DeviceOptions = serde_json::from_str(r#"{ "index": 2 }"#)?;
assert_eq!(options.index, 2);
assert_eq!(options.memory_size, 1 << 30);
# Ok(())
# }
```
*/
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    pub index: usize,
    pub name: String,
    pub memory_size: u64,
    pub features: Features,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            index: 0,
            name: "host".into(),
            memory_size: 1 << 30,
            features: Features::default(),
        }
    }
}

/** A device.

Devices can be cloned, which is equivalent to [`Arc::clone()`].

Devices are unique:
```
# use muxrt::device::Device;
# fn main() -> muxrt::result::Result<()> {
let a = Device::builder().build()?;
let b = Device::builder().build()?;
assert_ne!(a, b);
# Ok(())
# }
```
*/
#[derive(Clone)]
pub struct Device {
    engine: Arc<Engine>,
    allocator: Arc<dyn Allocator>,
}

impl Device {
    /// A builder for creating a device.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder {
            options: DeviceOptions::default(),
            allocator: None,
        }
    }
    pub fn info(&self) -> &Arc<DeviceInfo> {
        self.engine.info()
    }
    pub fn index(&self) -> usize {
        self.info().index
    }
    /// Uniquely identifies the device while it is alive.
    pub fn id(&self) -> usize {
        self.engine.id().handle
    }
    /// Bytes of device memory currently allocated.
    pub fn memory_used(&self) -> u64 {
        self.engine.memory_used()
    }
    /** Allocates `len` zeroed bytes.

    **errors**
    - [`Error::InvalidValue`] if `len` is 0.
    - [`Error::OutOfMemory`] if the device memory is exhausted. */
    pub fn alloc(&self, len: usize) -> Result<DeviceBuffer, Error> {
        self.engine.alloc(len)
    }
    /** Creates an image with `extent` pixels, unused dimensions are 1.

    **errors**
    - [`Error::FeatureUnsupported`] if the device doesn't support images.
    - [`Error::InvalidValue`] if an extent is 0. */
    pub fn create_image(&self, format: ImageFormat, extent: [usize; 3]) -> Result<Image, Error> {
        if !self.info().features.images() {
            return Err(Error::FeatureUnsupported);
        }
        let len = extent
            .iter()
            .try_fold(format.pixel_size(), |len, e| len.checked_mul(*e))
            .ok_or(Error::OutOfMemory)?;
        if len == 0 {
            return Err(Error::InvalidValue);
        }
        Ok(Image::new(format, extent, self.alloc(len)?))
    }
    pub fn create_command_buffer(&self) -> Result<Arc<CommandBuffer>, Error> {
        Ok(CommandBuffer::new(
            self.id(),
            self.info().features,
            self.allocator.clone(),
        ))
    }
    fn check_command_buffer(&self, command_buffer: &CommandBuffer) -> Result<(), Error> {
        if command_buffer.device_id() == self.id() {
            Ok(())
        } else {
            Err(Error::InvalidValue)
        }
    }
    pub fn finalize_command_buffer(&self, command_buffer: &CommandBuffer) -> Result<(), Error> {
        self.check_command_buffer(command_buffer)?;
        command_buffer.finalize()
    }
    pub fn reset_command_buffer(&self, command_buffer: &CommandBuffer) -> Result<(), Error> {
        self.check_command_buffer(command_buffer)?;
        command_buffer.reset()
    }
    /** Releases a command buffer.

    **errors**
    - [`Error::InvalidValue`] if the command buffer is pending, it is handed
      back in that case. */
    pub fn destroy_command_buffer(
        &self,
        command_buffer: Arc<CommandBuffer>,
    ) -> Result<(), (Arc<CommandBuffer>, Error)> {
        if let Err(e) = self.check_command_buffer(&command_buffer) {
            return Err((command_buffer, e));
        }
        if command_buffer.state().is_pending() {
            return Err((command_buffer, Error::InvalidValue));
        }
        tracing::trace!(command_buffer = command_buffer.id(), "destroyed");
        Ok(())
    }
    /// Creates a queue with its own worker thread.
    pub fn create_queue(&self) -> Result<DeviceQueue, Error> {
        Ok(DeviceQueue {
            device: self.clone(),
            inner: self.engine.create_queue()?,
        })
    }
    pub fn create_semaphore(&self) -> Semaphore {
        Semaphore::new()
    }
    pub fn create_fence(&self) -> Fence {
        Fence::new()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

impl Eq for Device {}

/// Prints `Device(index@handle)`, see [`.info()`](Device::info) for device info.
impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.engine.id().fmt(f)
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
struct DeviceId {
    index: usize,
    handle: usize,
}

impl Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Device({}@{:x})", self.index, self.handle)
    }
}

/** A device queue.

Cloning yields another handle to the same queue. The worker thread exits
when the last handle is dropped, submissions it never started are failed. */
#[derive(Clone)]
pub struct DeviceQueue {
    device: Device,
    inner: Arc<<Engine as DeviceEngine>::Queue>,
}

impl DeviceQueue {
    pub fn device(&self) -> &Device {
        &self.device
    }
    /** Dispatches an executable or complete command buffer.

    The command buffer moves to pending and its fence and `fence` are
    reset. Once every semaphore of `wait_semaphores` is signaled the
    commands execute, then `signal_semaphores` are signaled, then the
    command buffer's fence and `fence`. If a command fails the remaining
    commands are skipped and the fences signal failure.

    **errors**
    - [`Error::InvalidValue`] if the command buffer belongs to another device
      or is not executable.
    - [`Error::DeviceLost`] if the worker thread is gone. */
    pub fn dispatch(
        &self,
        command_buffer: &Arc<CommandBuffer>,
        fence: Option<&Fence>,
        wait_semaphores: &[Semaphore],
        signal_semaphores: &[Semaphore],
    ) -> Result<(), Error> {
        self.device.check_command_buffer(command_buffer)?;
        let mut wait = Vec::new();
        wait.try_reserve_exact(wait_semaphores.len())?;
        wait.extend_from_slice(wait_semaphores);
        let mut signal = Vec::new();
        signal.try_reserve_exact(signal_semaphores.len())?;
        signal.extend_from_slice(signal_semaphores);
        command_buffer.begin_dispatch()?;
        command_buffer.fence().reset();
        if let Some(fence) = fence {
            fence.reset();
        }
        self.inner.dispatch(Submission {
            command_buffer: command_buffer.clone(),
            fence: fence.cloned(),
            wait_semaphores: wait,
            signal_semaphores: signal,
        })
    }
    /// Blocks until every dispatched command buffer has completed.
    pub fn wait_all(&self) -> Result<(), Error> {
        self.inner.wait_all()
    }
}

impl PartialEq for DeviceQueue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for DeviceQueue {}

impl Debug for DeviceQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceQueue")
            .field("device", &self.device)
            .field("handle", &format_args!("{:x}", Arc::as_ptr(&self.inner) as usize))
            .finish()
    }
}

/** Features

Features supported by a device. See [`DeviceInfo::features`].

```
# use muxrt::device::Features;
# fn main() {
# let features = Features::default();
if features.images() {
    /* image path */
} else {
    /* buffer fallback */
}
# }
```
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Features {
    images: bool,
    queries: bool,
}

impl Features {
    /// No features.
    pub const fn empty() -> Self {
        Self {
            images: false,
            queries: false,
        }
    }
    /// Image commands and descriptors, requires the "images" feature.
    pub const fn images(&self) -> bool {
        self.images
    }
    /// Adds `images`.
    pub const fn with_images(mut self, images: bool) -> Self {
        self.images = images;
        self
    }
    /// Duration queries.
    pub const fn queries(&self) -> bool {
        self.queries
    }
    /// Adds `queries`.
    pub const fn with_queries(mut self, queries: bool) -> Self {
        self.queries = queries;
        self
    }
    /// Contains all features of `other`.
    pub const fn contains(&self, other: &Features) -> bool {
        (self.images || !other.images) && (self.queries || !other.queries)
    }
    /// Features of both `self` and `other`.
    pub const fn intersection(mut self, other: &Features) -> Self {
        self.images = self.images && other.images;
        self.queries = self.queries && other.queries;
        self
    }
}

/// Everything the build supports.
impl Default for Features {
    fn default() -> Self {
        Self::empty()
            .with_images(cfg!(feature = "images"))
            .with_queries(true)
    }
}

/// Device info.
#[derive(Debug)]
pub struct DeviceInfo {
    index: usize,
    name: String,
    memory_size: u64,
    features: Features,
}

impl DeviceInfo {
    pub fn index(&self) -> usize {
        self.index
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Bytes of device memory.
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }
    /// Device features.
    pub fn features(&self) -> Features {
        self.features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostBuffer;

    #[test]
    fn unsupported_features_are_dropped() -> Result<()> {
        let device = Device::builder()
            .features(Features::empty().with_images(true))
            .build()?;
        let features = device.info().features();
        assert_eq!(features.images(), cfg!(feature = "images"));
        assert!(!features.queries());
        assert!(Features::default().contains(&features));
        assert!(!features.contains(&Features::default().with_queries(true)));
        let pool = crate::query::QueryPool::new(crate::query::QueryType::Duration, 1)?;
        let cb = device.create_command_buffer()?;
        assert_eq!(
            cb.begin_query(&pool, 0, 1, &[], false).err(),
            Some(Error::FeatureUnsupported)
        );
        Ok(())
    }

    #[test]
    fn memory_is_bounded() -> Result<()> {
        let device = Device::builder().memory_size(64).build()?;
        let a = device.alloc(48)?;
        assert_eq!(device.alloc(32).err(), Some(Error::OutOfMemory));
        drop(a);
        assert_eq!(device.memory_used(), 0);
        device.alloc(64)?;
        assert!(Device::builder().memory_size(0).build().is_err());
        Ok(())
    }

    #[test]
    fn foreign_command_buffer() -> Result<()> {
        let a = Device::builder().build()?;
        let b = Device::builder().index(1).build()?;
        let cb = b.create_command_buffer()?;
        let buffer = a.alloc(4)?;
        assert_eq!(
            cb.fill_buffer(&buffer, 0, 4, &[1], &[], false).err(),
            Some(Error::InvalidValue)
        );
        let queue = a.create_queue()?;
        cb.finalize()?;
        assert_eq!(
            queue.dispatch(&cb, None, &[], &[]).err(),
            Some(Error::InvalidValue)
        );
        assert!(cb.state().is_executable());
        Ok(())
    }

    #[test]
    fn destroy_pending_fails() -> Result<()> {
        let device = Device::builder().build()?;
        let queue = device.create_queue()?;
        let gate = device.create_semaphore();
        let buffer = device.alloc(4)?;
        let cb = device.create_command_buffer()?;
        cb.write_buffer(&buffer, 0, &HostBuffer::from_vec(vec![1; 4]), 0, 4, &[], false)?;
        device.finalize_command_buffer(&cb)?;
        queue.dispatch(&cb, None, &[gate.clone()], &[])?;
        let (cb, e) = device.destroy_command_buffer(cb).unwrap_err();
        assert_eq!(e, Error::InvalidValue);
        gate.signal();
        queue.wait_all()?;
        assert_eq!(buffer.read_bytes(0, 4)?, [1; 4]);
        device.destroy_command_buffer(cb).map_err(|(_, e)| e)?;
        Ok(())
    }
}
