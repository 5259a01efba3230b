/*!
Command buffers.

A [`CommandBuffer`] is an ordered log of [`Command`]s. Recording appends
under the command buffer's lock, kernel dispatches are kept in a side table
of [`NdRange`] records that own their packed arguments.

```text
Initial -> Recording -> Executable -> Pending -> Complete
   ^                                                |
   +------------------------ reset -----------------+
```
*/

use crate::{
    command::{BufferRegion, Command, FillPattern, HostImageRegion, UserCallback},
    descriptor::{Allocator, Descriptor},
    device::Features,
    error::Error,
    kernel::Kernel,
    memory::{DeviceBuffer, HostBuffer, Image},
    ndrange::NdRange,
    query::QueryPool,
    sync::Fence,
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::IsVariant)]
pub enum CommandBufferState {
    Initial,
    Recording,
    /// Finalized and ready to dispatch.
    Executable,
    /// Dispatched to a device queue.
    Pending,
    Complete,
}

/// Names the command at `index` of the command buffer `command_buffer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncPoint {
    command_buffer: u64,
    index: usize,
}

impl SyncPoint {
    pub fn command_buffer_id(&self) -> u64 {
        self.command_buffer
    }
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Default)]
pub(crate) struct Records {
    pub(crate) commands: Vec<Command>,
    pub(crate) ndranges: Vec<NdRange>,
    sync_points: Vec<SyncPoint>,
}

impl Records {
    fn open_queries(&self, until: usize) -> Vec<(&QueryPool, usize, usize)> {
        let mut open = Vec::new();
        for command in &self.commands[..until] {
            match command {
                Command::BeginQuery { pool, index, count } => open.push((pool, *index, *count)),
                Command::EndQuery { pool, index, count } => {
                    if let Some(i) = open
                        .iter()
                        .position(|(p, i, c)| *p == pool && i == index && c == count)
                    {
                        open.remove(i);
                    }
                }
                _ => (),
            }
        }
        open
    }
}

fn check_images() -> Result<(), Error> {
    if cfg!(feature = "images") {
        Ok(())
    } else {
        Err(Error::FeatureUnsupported)
    }
}

/// Bytes of a tightly packed or pitched host box of `extent` pixels.
fn host_region(
    host: &HostBuffer,
    offset: usize,
    row_pitch: usize,
    slice_pitch: usize,
    extent: [usize; 3],
    pixel_size: usize,
) -> Result<HostImageRegion, Error> {
    let row = extent[0].checked_mul(pixel_size).ok_or(Error::InvalidValue)?;
    let row_pitch = if row_pitch == 0 { row } else { row_pitch };
    let min_slice = row_pitch.checked_mul(extent[1]).ok_or(Error::InvalidValue)?;
    let slice_pitch = if slice_pitch == 0 {
        min_slice
    } else {
        slice_pitch
    };
    if row_pitch < row || slice_pitch < min_slice {
        return Err(Error::InvalidValue);
    }
    let size = (|| {
        slice_pitch
            .checked_mul(extent[2] - 1)?
            .checked_add(row_pitch.checked_mul(extent[1] - 1)?)?
            .checked_add(row)
    })()
    .ok_or(Error::InvalidValue)?;
    host.check_range(offset, size)?;
    Ok(HostImageRegion {
        host: host.clone(),
        offset,
        row_pitch,
        slice_pitch,
    })
}

/** A command buffer.

Recording methods take a wait list of sync points produced earlier by the
same command buffer, and return a new sync point for the recorded command
if `want_sync_point` is set. Commands execute in recorded order, so a sync
point is satisfied as soon as its command has run.

A command buffer must not be recorded into or reset while it is pending. */
pub struct CommandBuffer {
    id: u64,
    device: usize,
    features: Features,
    records: Mutex<Records>,
    state: Mutex<CommandBufferState>,
    fence: Fence,
    allocator: Arc<dyn Allocator>,
}

impl CommandBuffer {
    pub(crate) fn new(
        device: usize,
        features: Features,
        allocator: Arc<dyn Allocator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            device,
            features,
            records: Mutex::default(),
            state: Mutex::new(CommandBufferState::Initial),
            fence: Fence::new(),
            allocator,
        })
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    /// Identifies the device the command buffer was created on.
    pub fn device_id(&self) -> usize {
        self.device
    }
    pub fn state(&self) -> CommandBufferState {
        *self.state.lock()
    }
    /// Signaled by the device when a dispatch of this command buffer completes.
    pub fn fence(&self) -> &Fence {
        &self.fence
    }
    /// The number of recorded commands.
    pub fn len(&self) -> usize {
        self.records.lock().commands.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn sync_points(&self) -> Vec<SyncPoint> {
        self.records.lock().sync_points.clone()
    }
    fn check_buffer(&self, buffer: &DeviceBuffer) -> Result<(), Error> {
        if buffer.device_id() == self.device {
            Ok(())
        } else {
            Err(Error::InvalidValue)
        }
    }
    fn check_image(&self, image: &Image) -> Result<(), Error> {
        check_images()?;
        self.check_buffer(image.memory())
    }
    /** Validates the state and wait list, reserves a sync point, then lets
    `record` validate and append its commands.

    `record` must not append anything unless it succeeds. */
    fn record<F>(
        &self,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
        record: F,
    ) -> Result<Option<SyncPoint>, Error>
    where
        F: FnOnce(&mut Records) -> Result<(), Error>,
    {
        let mut records = self.records.lock();
        {
            let state = self.state.lock();
            if !matches!(
                *state,
                CommandBufferState::Initial | CommandBufferState::Recording
            ) {
                return Err(Error::InvalidValue);
            }
        }
        let recorded = records.commands.len();
        for sync_point in wait_list {
            if sync_point.command_buffer != self.id || sync_point.index >= recorded {
                return Err(Error::InvalidValue);
            }
        }
        if want_sync_point {
            records.sync_points.try_reserve(1)?;
        }
        record(&mut *records)?;
        debug_assert!(records.commands.len() > recorded);
        *self.state.lock() = CommandBufferState::Recording;
        let sync_point = if want_sync_point {
            let sync_point = SyncPoint {
                command_buffer: self.id,
                index: records.commands.len() - 1,
            };
            records.sync_points.push(sync_point);
            Some(sync_point)
        } else {
            None
        };
        if let Some(command) = records.commands.last() {
            tracing::trace!(command_buffer = self.id, ?command, "recorded");
        }
        Ok(sync_point)
    }
    fn push(
        &self,
        commands: Vec<Command>,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.record(wait_list, want_sync_point, move |records| {
            records.commands.try_reserve(commands.len())?;
            records.commands.extend(commands);
            Ok(())
        })
    }
    /// Copies `size` bytes at `offset` of `buffer` into `host` at `host_offset`.
    #[allow(clippy::too_many_arguments)]
    pub fn read_buffer(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        host: &HostBuffer,
        host_offset: usize,
        size: usize,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_buffer(buffer)?;
        if size == 0 {
            return Err(Error::InvalidValue);
        }
        buffer.check_range(offset, size)?;
        host.check_range(host_offset, size)?;
        self.push(
            vec![Command::ReadBuffer {
                buffer: buffer.clone(),
                offset,
                host: host.clone(),
                host_offset,
                size,
            }],
            wait_list,
            want_sync_point,
        )
    }
    /// Records one read per row of every region.
    pub fn read_buffer_regions(
        &self,
        buffer: &DeviceBuffer,
        host: &HostBuffer,
        regions: &[BufferRegion],
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_buffer(buffer)?;
        let commands = decompose(regions, |row| {
            buffer.check_range(row.src_offset, row.size)?;
            host.check_range(row.dst_offset, row.size)?;
            Ok(Command::ReadBuffer {
                buffer: buffer.clone(),
                offset: row.src_offset,
                host: host.clone(),
                host_offset: row.dst_offset,
                size: row.size,
            })
        })?;
        self.push(commands, wait_list, want_sync_point)
    }
    /// Copies `size` bytes at `host_offset` of `host` into `buffer` at `offset`.
    #[allow(clippy::too_many_arguments)]
    pub fn write_buffer(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        host: &HostBuffer,
        host_offset: usize,
        size: usize,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_buffer(buffer)?;
        if size == 0 {
            return Err(Error::InvalidValue);
        }
        buffer.check_range(offset, size)?;
        host.check_range(host_offset, size)?;
        self.push(
            vec![Command::WriteBuffer {
                buffer: buffer.clone(),
                offset,
                host: host.clone(),
                host_offset,
                size,
            }],
            wait_list,
            want_sync_point,
        )
    }
    /// Records one write per row of every region, regions read from `host`.
    pub fn write_buffer_regions(
        &self,
        buffer: &DeviceBuffer,
        host: &HostBuffer,
        regions: &[BufferRegion],
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_buffer(buffer)?;
        let commands = decompose(regions, |row| {
            host.check_range(row.src_offset, row.size)?;
            buffer.check_range(row.dst_offset, row.size)?;
            Ok(Command::WriteBuffer {
                buffer: buffer.clone(),
                offset: row.dst_offset,
                host: host.clone(),
                host_offset: row.src_offset,
                size: row.size,
            })
        })?;
        self.push(commands, wait_list, want_sync_point)
    }
    /// Copies between two device buffers, which may be the same buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_buffer(
        &self,
        src: &DeviceBuffer,
        src_offset: usize,
        dst: &DeviceBuffer,
        dst_offset: usize,
        size: usize,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_buffer(src)?;
        self.check_buffer(dst)?;
        if size == 0 {
            return Err(Error::InvalidValue);
        }
        src.check_range(src_offset, size)?;
        dst.check_range(dst_offset, size)?;
        self.push(
            vec![Command::CopyBuffer {
                src: src.clone(),
                src_offset,
                dst: dst.clone(),
                dst_offset,
                size,
            }],
            wait_list,
            want_sync_point,
        )
    }
    pub fn copy_buffer_regions(
        &self,
        src: &DeviceBuffer,
        dst: &DeviceBuffer,
        regions: &[BufferRegion],
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_buffer(src)?;
        self.check_buffer(dst)?;
        let commands = decompose(regions, |row| {
            src.check_range(row.src_offset, row.size)?;
            dst.check_range(row.dst_offset, row.size)?;
            Ok(Command::CopyBuffer {
                src: src.clone(),
                src_offset: row.src_offset,
                dst: dst.clone(),
                dst_offset: row.dst_offset,
                size: row.size,
            })
        })?;
        self.push(commands, wait_list, want_sync_point)
    }
    /// Repeats `pattern` over `size` bytes, `size` must be a multiple of the pattern.
    pub fn fill_buffer(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        size: usize,
        pattern: &[u8],
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_buffer(buffer)?;
        let pattern = FillPattern::new(pattern)?;
        if size == 0 || size % pattern.len() != 0 {
            return Err(Error::InvalidValue);
        }
        buffer.check_range(offset, size)?;
        self.push(
            vec![Command::FillBuffer {
                buffer: buffer.clone(),
                offset,
                size,
                pattern,
            }],
            wait_list,
            want_sync_point,
        )
    }
    /// Reads a box of pixels into `host`, zero pitches mean tightly packed.
    #[allow(clippy::too_many_arguments)]
    pub fn read_image(
        &self,
        image: &Image,
        origin: [usize; 3],
        extent: [usize; 3],
        host: &HostBuffer,
        host_offset: usize,
        row_pitch: usize,
        slice_pitch: usize,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_image(image)?;
        image.check_box(origin, extent)?;
        let host = host_region(
            host,
            host_offset,
            row_pitch,
            slice_pitch,
            extent,
            image.format().pixel_size(),
        )?;
        self.push(
            vec![Command::ReadImage {
                image: image.clone(),
                origin,
                extent,
                host,
            }],
            wait_list,
            want_sync_point,
        )
    }
    /// Writes a box of pixels from `host`, zero pitches mean tightly packed.
    #[allow(clippy::too_many_arguments)]
    pub fn write_image(
        &self,
        image: &Image,
        origin: [usize; 3],
        extent: [usize; 3],
        host: &HostBuffer,
        host_offset: usize,
        row_pitch: usize,
        slice_pitch: usize,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_image(image)?;
        image.check_box(origin, extent)?;
        let host = host_region(
            host,
            host_offset,
            row_pitch,
            slice_pitch,
            extent,
            image.format().pixel_size(),
        )?;
        self.push(
            vec![Command::WriteImage {
                image: image.clone(),
                origin,
                extent,
                host,
            }],
            wait_list,
            want_sync_point,
        )
    }
    /// Fills a box with `color`, which must be exactly one pixel.
    pub fn fill_image(
        &self,
        image: &Image,
        color: &[u8],
        origin: [usize; 3],
        extent: [usize; 3],
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_image(image)?;
        if color.len() != image.format().pixel_size() {
            return Err(Error::InvalidValue);
        }
        image.check_box(origin, extent)?;
        let color = FillPattern::color(color)?;
        self.push(
            vec![Command::FillImage {
                image: image.clone(),
                color,
                origin,
                extent,
            }],
            wait_list,
            want_sync_point,
        )
    }
    /// Copies a box between two images of the same format.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_image(
        &self,
        src: &Image,
        dst: &Image,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        extent: [usize; 3],
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_image(src)?;
        self.check_image(dst)?;
        if src.format() != dst.format() {
            return Err(Error::InvalidValue);
        }
        src.check_box(src_origin, extent)?;
        dst.check_box(dst_origin, extent)?;
        self.push(
            vec![Command::CopyImage {
                src: src.clone(),
                dst: dst.clone(),
                src_origin,
                dst_origin,
                extent,
            }],
            wait_list,
            want_sync_point,
        )
    }
    /// Copies a box of pixels into `dst` tightly packed at `dst_offset`.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_image_to_buffer(
        &self,
        src: &Image,
        dst: &DeviceBuffer,
        src_origin: [usize; 3],
        dst_offset: usize,
        extent: [usize; 3],
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_image(src)?;
        self.check_buffer(dst)?;
        src.check_box(src_origin, extent)?;
        dst.check_range(dst_offset, box_size(extent, src.format().pixel_size())?)?;
        self.push(
            vec![Command::CopyImageToBuffer {
                src: src.clone(),
                dst: dst.clone(),
                src_origin,
                dst_offset,
                extent,
            }],
            wait_list,
            want_sync_point,
        )
    }
    /// Copies tightly packed pixels at `src_offset` of `src` into a box of `dst`.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_buffer_to_image(
        &self,
        src: &DeviceBuffer,
        dst: &Image,
        src_offset: usize,
        dst_origin: [usize; 3],
        extent: [usize; 3],
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_buffer(src)?;
        self.check_image(dst)?;
        dst.check_box(dst_origin, extent)?;
        src.check_range(src_offset, box_size(extent, dst.format().pixel_size())?)?;
        self.push(
            vec![Command::CopyBufferToImage {
                src: src.clone(),
                dst: dst.clone(),
                src_offset,
                dst_origin,
                extent,
            }],
            wait_list,
            want_sync_point,
        )
    }
    /** Records a kernel dispatch.

    The descriptors are packed immediately, later changes to the bound
    values are not observed unless [`update_descriptors`](Self::update_descriptors)
    is called.

    **errors**
    - [`Error::InvalidValue`] if the geometry is invalid, the descriptors
      don't match the kernel, or a bound buffer belongs to another device.
    - [`Error::FeatureUnsupported`] if an image or sampler is bound without
      image support.
    - [`Error::OutOfMemory`] if packing fails, nothing is recorded. */
    #[allow(clippy::too_many_arguments)]
    pub fn ndrange(
        &self,
        kernel: &Kernel,
        descriptors: &[Descriptor],
        global_size: &[usize],
        global_offset: &[usize],
        local_size: &[usize],
        dims: usize,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        for descriptor in descriptors {
            self.check_descriptor(descriptor)?;
        }
        let ndrange = NdRange::new(
            kernel,
            descriptors,
            global_size,
            global_offset,
            local_size,
            dims,
            self.allocator.clone(),
        )?;
        self.record(wait_list, want_sync_point, move |records| {
            records.commands.try_reserve(1)?;
            records.ndranges.try_reserve(1)?;
            records.commands.push(Command::NdRange(records.ndranges.len()));
            records.ndranges.push(ndrange);
            Ok(())
        })
    }
    fn check_descriptor(&self, descriptor: &Descriptor) -> Result<(), Error> {
        match descriptor {
            Descriptor::Buffer { buffer, .. } => self.check_buffer(buffer),
            Descriptor::Image(image) => self.check_image(image),
            Descriptor::Sampler(_) => check_images(),
            _ => Ok(()),
        }
    }
    /// Calls `callback` on the device when the command executes, an error fails the dispatch.
    pub fn user_callback<F>(
        &self,
        callback: F,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: UserCallback = Arc::new(callback);
        self.push(
            vec![Command::UserCallback(callback)],
            wait_list,
            want_sync_point,
        )
    }
    fn check_queries(&self) -> Result<(), Error> {
        if self.features.queries() {
            Ok(())
        } else {
            Err(Error::FeatureUnsupported)
        }
    }
    /** Begins a query over `count` slots of `pool` starting at `index`.

    **errors**
    - [`Error::FeatureUnsupported`] if the device doesn't support queries.
    - [`Error::InvalidValue`] if the range is outside the pool. */
    pub fn begin_query(
        &self,
        pool: &QueryPool,
        index: usize,
        count: usize,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_queries()?;
        pool.check_range(index, count)?;
        self.push(
            vec![Command::BeginQuery {
                pool: pool.clone(),
                index,
                count,
            }],
            wait_list,
            want_sync_point,
        )
    }
    /** Ends the query begun by an earlier [`begin_query`](Self::begin_query)
    with the same pool, index and count.

    **errors**
    - [`Error::FeatureUnsupported`] if the device doesn't support queries.
    - [`Error::InvalidValue`] if no such query is open, nothing is recorded. */
    pub fn end_query(
        &self,
        pool: &QueryPool,
        index: usize,
        count: usize,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_queries()?;
        pool.check_range(index, count)?;
        let pool = pool.clone();
        self.record(wait_list, want_sync_point, move |records| {
            let open = records
                .open_queries(records.commands.len())
                .iter()
                .any(|(p, i, c)| **p == pool && *i == index && *c == count);
            if !open {
                return Err(Error::InvalidValue);
            }
            records.commands.try_reserve(1)?;
            records
                .commands
                .push(Command::EndQuery { pool, index, count });
            Ok(())
        })
    }
    pub fn reset_query_pool(
        &self,
        pool: &QueryPool,
        index: usize,
        count: usize,
        wait_list: &[SyncPoint],
        want_sync_point: bool,
    ) -> Result<Option<SyncPoint>, Error> {
        self.check_queries()?;
        pool.check_range(index, count)?;
        self.push(
            vec![Command::ResetQueryPool {
                pool: pool.clone(),
                index,
                count,
            }],
            wait_list,
            want_sync_point,
        )
    }
    /** Rewrites arguments of the kernel dispatch recorded at `command_index`.

    Only the packed bytes of the named arguments change. All arguments are
    validated before any is written.

    **errors**
    - [`Error::InvalidValue`] if the command is not a kernel dispatch, an
      argument index is out of range, a descriptor doesn't match its
      parameter, or the command buffer is pending. */
    pub fn update_descriptors(
        &self,
        command_index: usize,
        arg_indices: &[usize],
        descriptors: &[Descriptor],
    ) -> Result<(), Error> {
        if arg_indices.len() != descriptors.len() {
            return Err(Error::InvalidValue);
        }
        for descriptor in descriptors {
            self.check_descriptor(descriptor)?;
        }
        let mut records = self.records.lock();
        if self.state().is_pending() {
            return Err(Error::InvalidValue);
        }
        let ndrange = match records.commands.get(command_index) {
            Some(Command::NdRange(ndrange)) => *ndrange,
            _ => return Err(Error::InvalidValue),
        };
        let ndrange = records
            .ndranges
            .get_mut(ndrange)
            .ok_or(Error::InvalidValue)?;
        let info = ndrange.kernel().info().clone();
        for (index, descriptor) in arg_indices.iter().zip(descriptors) {
            let kind = info.args.get(*index).ok_or(Error::InvalidValue)?;
            if !kind.accepts(descriptor) {
                return Err(Error::InvalidValue);
            }
        }
        for (index, descriptor) in arg_indices.iter().zip(descriptors) {
            ndrange.update(*index, descriptor)?;
        }
        Ok(())
    }
    /** Deep copies the command buffer.

    Kernel dispatches get freshly allocated copies of their packed
    arguments, every other command is copied by value. Sync points are
    carried over and refer to the clone. A pending or complete command
    buffer clones as executable.

    **errors**
    - [`Error::OutOfMemory`] if an allocation fails, nothing is leaked. */
    pub fn try_clone(&self) -> Result<Arc<Self>, Error> {
        let records = self.records.lock();
        let clone = Self::new(self.device, self.features, self.allocator.clone());
        let mut commands = Vec::new();
        commands.try_reserve_exact(records.commands.len())?;
        commands.extend(records.commands.iter().cloned());
        let mut ndranges = Vec::new();
        ndranges.try_reserve_exact(records.ndranges.len())?;
        for ndrange in &records.ndranges {
            ndranges.push(ndrange.try_clone(self.allocator.clone())?);
        }
        let mut sync_points = Vec::new();
        sync_points.try_reserve_exact(records.sync_points.len())?;
        sync_points.extend(records.sync_points.iter().map(|sync_point| SyncPoint {
            command_buffer: clone.id,
            index: sync_point.index,
        }));
        *clone.records.lock() = Records {
            commands,
            ndranges,
            sync_points,
        };
        *clone.state.lock() = match self.state() {
            state @ (CommandBufferState::Initial | CommandBufferState::Recording) => state,
            _ => CommandBufferState::Executable,
        };
        tracing::trace!(command_buffer = self.id, clone = clone.id, "cloned");
        Ok(clone)
    }
    /** Discards every command and packed argument allocation.

    Resetting an empty command buffer is a no-op. The fence is left as is.

    **errors**
    - [`Error::InvalidValue`] if the command buffer is pending. */
    pub fn reset(&self) -> Result<(), Error> {
        let mut records = self.records.lock();
        let mut state = self.state.lock();
        if state.is_pending() {
            return Err(Error::InvalidValue);
        }
        *records = Records::default();
        *state = CommandBufferState::Initial;
        Ok(())
    }
    /// Closes recording, required before the command buffer can be dispatched.
    pub fn finalize(&self) -> Result<(), Error> {
        let _records = self.records.lock();
        let mut state = self.state.lock();
        match *state {
            CommandBufferState::Initial | CommandBufferState::Recording => {
                *state = CommandBufferState::Executable;
                Ok(())
            }
            CommandBufferState::Executable | CommandBufferState::Complete => Ok(()),
            CommandBufferState::Pending => Err(Error::InvalidValue),
        }
    }
    /// Moves an executable or complete command buffer to pending.
    pub(crate) fn begin_dispatch(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        match *state {
            CommandBufferState::Executable | CommandBufferState::Complete => {
                *state = CommandBufferState::Pending;
                Ok(())
            }
            _ => Err(Error::InvalidValue),
        }
    }
    pub(crate) fn complete(&self) {
        *self.state.lock() = CommandBufferState::Complete;
    }
    /// Locks the records for execution, the state lock stays free.
    pub(crate) fn records(&self) -> MutexGuard<Records> {
        self.records.lock()
    }
}

fn box_size(extent: [usize; 3], pixel_size: usize) -> Result<usize, Error> {
    extent
        .iter()
        .try_fold(pixel_size, |size, e| size.checked_mul(*e))
        .filter(|size| *size > 0)
        .ok_or(Error::InvalidValue)
}

fn decompose<F>(regions: &[BufferRegion], mut f: F) -> Result<Vec<Command>, Error>
where
    F: FnMut(crate::command::Row) -> Result<Command, Error>,
{
    if regions.is_empty() {
        return Err(Error::InvalidValue);
    }
    let mut commands = Vec::new();
    for region in regions {
        let rows = region.rows()?;
        commands.try_reserve(rows.len())?;
        for row in rows {
            commands.push(f(row)?);
        }
    }
    Ok(commands)
}

impl Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::CommandKind,
        descriptor::{system_allocator, tests::CountingAllocator},
        kernel::{ArgKind, KernelInfo},
        memory::MemoryMap,
        query::QueryType,
    };

    fn command_buffer() -> Arc<CommandBuffer> {
        CommandBuffer::new(0, Features::default(), system_allocator())
    }

    fn buffer(map: &Arc<MemoryMap>, len: usize) -> DeviceBuffer {
        DeviceBuffer::new(map.alloc(len).unwrap(), 0)
    }

    fn kinds(cb: &CommandBuffer) -> Vec<CommandKind> {
        cb.records().commands.iter().map(Command::kind).collect()
    }

    fn kernel() -> Kernel {
        Kernel::new(
            KernelInfo {
                name: "scale".into(),
                args: vec![ArgKind::Buffer, ArgKind::Value(4)],
            },
            |_| Ok(()),
        )
    }

    #[test]
    fn copy_regions_decompose_into_rows() -> Result<(), Error> {
        let map = MemoryMap::new(1 << 20);
        let (src, dst) = (buffer(&map, 256), buffer(&map, 256));
        let cb = command_buffer();
        let region = BufferRegion {
            src_origin: [4, 1, 0],
            dst_origin: [0, 2, 0],
            extent: [8, 3, 1],
            src_pitch: [32, 0],
            dst_pitch: [16, 0],
        };
        cb.copy_buffer_regions(&src, &dst, &[region], &[], false)?;
        let records = cb.records();
        assert_eq!(records.commands.len(), 3);
        for (row, command) in records.commands.iter().enumerate() {
            match command {
                Command::CopyBuffer {
                    src_offset,
                    dst_offset,
                    size,
                    ..
                } => {
                    assert_eq!(*size, 8);
                    assert_eq!(*src_offset, 4 + (1 + row) * 32);
                    assert_eq!(*dst_offset, (2 + row) * 16);
                }
                command => panic!("{command:?}"),
            }
        }
        Ok(())
    }

    #[test]
    fn out_of_range_records_nothing() {
        let map = MemoryMap::new(1 << 20);
        let buffer = buffer(&map, 16);
        let host = HostBuffer::zeroed(16);
        let cb = command_buffer();
        assert_eq!(
            cb.write_buffer(&buffer, 8, &host, 0, 16, &[], false).err(),
            Some(Error::InvalidValue)
        );
        let region = BufferRegion {
            extent: [4, 8, 1],
            ..BufferRegion::default()
        };
        assert_eq!(
            cb.read_buffer_regions(&buffer, &host, &[region], &[], false)
                .err(),
            Some(Error::InvalidValue)
        );
        assert!(cb.is_empty());
        assert_eq!(cb.state(), CommandBufferState::Initial);
    }

    #[test]
    fn fill_validation() -> Result<(), Error> {
        let map = MemoryMap::new(1 << 20);
        let buffer = buffer(&map, 64);
        let cb = command_buffer();
        cb.fill_buffer(&buffer, 0, 64, &[1, 2, 3, 4], &[], false)?;
        assert_eq!(
            cb.fill_buffer(&buffer, 0, 6, &[1, 2, 3, 4], &[], false).err(),
            Some(Error::InvalidValue)
        );
        assert_eq!(
            cb.fill_buffer(&buffer, 0, 63, &[1, 2, 3], &[], false).err(),
            Some(Error::InvalidValue)
        );
        assert_eq!(cb.len(), 1);
        Ok(())
    }

    #[test]
    fn sync_points() -> Result<(), Error> {
        let map = MemoryMap::new(1 << 20);
        let buffer = buffer(&map, 64);
        let cb = command_buffer();
        let other = command_buffer();
        let first = cb
            .fill_buffer(&buffer, 0, 64, &[0], &[], true)?
            .unwrap();
        assert_eq!(first.index(), 0);
        let second = cb
            .fill_buffer(&buffer, 0, 32, &[1], &[first], true)?
            .unwrap();
        assert_eq!(second.index(), 1);
        assert!(cb.fill_buffer(&buffer, 0, 64, &[2], &[], false)?.is_none());
        assert_eq!(cb.sync_points(), vec![first, second]);
        assert_eq!(
            other.fill_buffer(&buffer, 0, 64, &[0], &[first], false).err(),
            Some(Error::InvalidValue)
        );
        assert!(other.is_empty());
        Ok(())
    }

    #[test]
    fn queries_require_feature() -> Result<(), Error> {
        let pool = QueryPool::new(QueryType::Duration, 2)?;
        let cb = CommandBuffer::new(0, Features::empty(), system_allocator());
        assert_eq!(
            cb.begin_query(&pool, 0, 1, &[], false).err(),
            Some(Error::FeatureUnsupported)
        );
        assert_eq!(
            cb.end_query(&pool, 0, 1, &[], false).err(),
            Some(Error::FeatureUnsupported)
        );
        assert_eq!(
            cb.reset_query_pool(&pool, 0, 2, &[], false).err(),
            Some(Error::FeatureUnsupported)
        );
        assert!(cb.is_empty());
        assert_eq!(
            cb.try_clone()?.reset_query_pool(&pool, 0, 2, &[], false).err(),
            Some(Error::FeatureUnsupported)
        );
        Ok(())
    }

    #[test]
    fn query_pairing() -> Result<(), Error> {
        let pool = QueryPool::new(QueryType::Duration, 4)?;
        let cb = command_buffer();
        assert_eq!(
            cb.end_query(&pool, 0, 2, &[], false).err(),
            Some(Error::InvalidValue)
        );
        assert!(cb.is_empty());
        cb.begin_query(&pool, 0, 2, &[], false)?;
        assert_eq!(
            cb.end_query(&pool, 0, 1, &[], false).err(),
            Some(Error::InvalidValue)
        );
        cb.end_query(&pool, 0, 2, &[], false)?;
        assert_eq!(
            cb.end_query(&pool, 0, 2, &[], false).err(),
            Some(Error::InvalidValue)
        );
        assert_eq!(kinds(&cb), [CommandKind::BeginQuery, CommandKind::EndQuery]);
        Ok(())
    }

    #[test]
    fn update_descriptors_requires_ndrange() -> Result<(), Error> {
        let map = MemoryMap::new(1 << 20);
        let (x, y) = (buffer(&map, 16), buffer(&map, 16));
        let cb = command_buffer();
        cb.fill_buffer(&x, 0, 16, &[0], &[], false)?;
        cb.ndrange(
            &kernel(),
            &[Descriptor::buffer(&x, 0)?, Descriptor::value(&2f32)?],
            &[4],
            &[0],
            &[1],
            1,
            &[],
            false,
        )?;
        let update = [Descriptor::buffer(&y, 4)?];
        assert_eq!(
            cb.update_descriptors(0, &[0], &update).err(),
            Some(Error::InvalidValue)
        );
        assert_eq!(
            cb.update_descriptors(1, &[1], &update).err(),
            Some(Error::InvalidValue)
        );
        cb.update_descriptors(1, &[0], &update)?;
        let records = cb.records();
        assert_eq!(
            records.ndranges[0].args().word(0),
            Some(y.address() + 4)
        );
        Ok(())
    }

    #[test]
    fn clone_and_reset_free_packed_args_once() -> Result<(), Error> {
        let allocator = Arc::new(CountingAllocator::with_budget(usize::MAX));
        let map = MemoryMap::new(1 << 20);
        let x = buffer(&map, 16);
        let cb = CommandBuffer::new(0, Features::default(), allocator.clone());
        let descriptors = [Descriptor::buffer(&x, 0)?, Descriptor::value(&3f32)?];
        for _ in 0..2 {
            cb.ndrange(&kernel(), &descriptors, &[4], &[0], &[1], 1, &[], true)?;
        }
        cb.finalize()?;
        assert_eq!(allocator.live(), 2);
        let clone = cb.try_clone()?;
        assert_eq!(allocator.live(), 4);
        assert_eq!(clone.state(), CommandBufferState::Executable);
        assert!(clone.sync_points().iter().all(|s| s.command_buffer_id() == clone.id()));
        {
            let (a, b) = (cb.records(), clone.records());
            assert_eq!(a.ndranges[1].args().bytes(), b.ndranges[1].args().bytes());
        }
        cb.reset()?;
        assert_eq!(allocator.live(), 2);
        cb.reset()?;
        assert!(cb.is_empty());
        assert_eq!(allocator.live(), 2);
        drop(clone);
        assert_eq!(allocator.live(), 0);
        Ok(())
    }

    #[test]
    fn state_transitions() -> Result<(), Error> {
        let map = MemoryMap::new(1 << 20);
        let x = buffer(&map, 16);
        let cb = command_buffer();
        assert!(cb.state().is_initial());
        cb.fill_buffer(&x, 0, 16, &[0], &[], false)?;
        assert!(cb.state().is_recording());
        cb.finalize()?;
        assert!(cb.state().is_executable());
        assert_eq!(
            cb.fill_buffer(&x, 0, 16, &[0], &[], false).err(),
            Some(Error::InvalidValue)
        );
        cb.begin_dispatch()?;
        assert_eq!(cb.reset().err(), Some(Error::InvalidValue));
        assert_eq!(cb.begin_dispatch().err(), Some(Error::InvalidValue));
        cb.complete();
        cb.begin_dispatch()?;
        cb.complete();
        cb.reset()?;
        assert!(cb.state().is_initial());
        Ok(())
    }

    #[test]
    fn foreign_buffer_rejected() {
        let map = MemoryMap::new(1 << 20);
        let foreign = DeviceBuffer::new(map.alloc(16).unwrap(), 1);
        let cb = command_buffer();
        assert_eq!(
            cb.fill_buffer(&foreign, 0, 16, &[0], &[], false).err(),
            Some(Error::InvalidValue)
        );
    }
}
