/*!
Enqueue entry points.

Every call syncs the buffers it touches, takes a command buffer from the
queue, records into it and returns the event the work will signal. Nothing
is submitted until the queue is flushed, blocking calls wait for the queue
before returning. Queues of events from other queues are flushed so the
work they signal can make progress.
*/

use super::{
    context::MemBuffer,
    event::{Event, EventStatus},
    queue::Queue,
};
use crate::{
    command::BufferRegion,
    command_buffer::CommandBuffer,
    descriptor::Descriptor,
    error::Error,
    kernel::Kernel,
    memory::HostBuffer,
};

/// A kernel argument of [`Queue::enqueue_kernel_launch`].
#[derive(Clone, Debug)]
pub enum KernelArg<'a> {
    /// Binds the allocation of `buffer` on the queue's device at byte `offset`.
    Mem { buffer: &'a MemBuffer, offset: usize },
    Descriptor(Descriptor),
}

impl Queue {
    fn enqueue<F>(&self, wait_events: &[Event], blocking: bool, record: F) -> Result<Event, Error>
    where
        F: FnOnce(&CommandBuffer) -> Result<(), Error>,
    {
        for wait_event in wait_events {
            if let Some(queue) = wait_event.queue().filter(|queue| !self.same(queue)) {
                queue.flush()?;
            }
        }
        let event = self.create_event();
        {
            let mut queue = self.lock();
            let command_buffer = queue.get_command_buffer(&event, wait_events)?;
            if let Err(e) = record(&command_buffer) {
                queue.discard_latest();
                return Err(e);
            }
        }
        if blocking {
            self.wait()?;
            if event.status() == EventStatus::Failed {
                return Err(Error::FenceFailure);
            }
        }
        Ok(event)
    }
    /// Reads `size` bytes at `offset` of `buffer` into `host`.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_read_buffer(
        &self,
        buffer: &MemBuffer,
        blocking: bool,
        offset: usize,
        size: usize,
        host: &HostBuffer,
        host_offset: usize,
        wait_events: &[Event],
    ) -> Result<Event, Error> {
        buffer.sync(self)?;
        let device_buffer = buffer.buffer(self.device())?;
        self.enqueue(wait_events, blocking, |cb| {
            cb.read_buffer(&device_buffer, offset, host, host_offset, size, &[], false)
                .map(drop)
        })
    }
    /// Writes `size` bytes at `host_offset` of `host` into `buffer`.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_write_buffer(
        &self,
        buffer: &MemBuffer,
        blocking: bool,
        offset: usize,
        size: usize,
        host: &HostBuffer,
        host_offset: usize,
        wait_events: &[Event],
    ) -> Result<Event, Error> {
        buffer.sync(self)?;
        let device_buffer = buffer.buffer(self.device())?;
        self.enqueue(wait_events, blocking, |cb| {
            cb.write_buffer(&device_buffer, offset, host, host_offset, size, &[], false)
                .map(drop)
        })
    }
    pub fn enqueue_copy_buffer(
        &self,
        src: &MemBuffer,
        dst: &MemBuffer,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        wait_events: &[Event],
    ) -> Result<Event, Error> {
        src.sync(self)?;
        dst.sync(self)?;
        let (src, dst) = (src.buffer(self.device())?, dst.buffer(self.device())?);
        self.enqueue(wait_events, false, |cb| {
            cb.copy_buffer(&src, src_offset, &dst, dst_offset, size, &[], false)
                .map(drop)
        })
    }
    pub fn enqueue_fill_buffer(
        &self,
        buffer: &MemBuffer,
        pattern: &[u8],
        offset: usize,
        size: usize,
        wait_events: &[Event],
    ) -> Result<Event, Error> {
        buffer.sync(self)?;
        let device_buffer = buffer.buffer(self.device())?;
        self.enqueue(wait_events, false, |cb| {
            cb.fill_buffer(&device_buffer, offset, size, pattern, &[], false)
                .map(drop)
        })
    }
    /// Reads a box of `buffer` into `host`, the region's source is the buffer.
    pub fn enqueue_read_buffer_rect(
        &self,
        buffer: &MemBuffer,
        blocking: bool,
        region: &BufferRegion,
        host: &HostBuffer,
        wait_events: &[Event],
    ) -> Result<Event, Error> {
        buffer.sync(self)?;
        let device_buffer = buffer.buffer(self.device())?;
        self.enqueue(wait_events, blocking, |cb| {
            cb.read_buffer_regions(&device_buffer, host, std::slice::from_ref(region), &[], false)
                .map(drop)
        })
    }
    /// Writes a box of `host` into `buffer`, the region's source is the host.
    pub fn enqueue_write_buffer_rect(
        &self,
        buffer: &MemBuffer,
        blocking: bool,
        region: &BufferRegion,
        host: &HostBuffer,
        wait_events: &[Event],
    ) -> Result<Event, Error> {
        buffer.sync(self)?;
        let device_buffer = buffer.buffer(self.device())?;
        self.enqueue(wait_events, blocking, |cb| {
            cb.write_buffer_regions(&device_buffer, host, std::slice::from_ref(region), &[], false)
                .map(drop)
        })
    }
    pub fn enqueue_copy_buffer_rect(
        &self,
        src: &MemBuffer,
        dst: &MemBuffer,
        region: &BufferRegion,
        wait_events: &[Event],
    ) -> Result<Event, Error> {
        src.sync(self)?;
        dst.sync(self)?;
        let (src, dst) = (src.buffer(self.device())?, dst.buffer(self.device())?);
        self.enqueue(wait_events, false, |cb| {
            cb.copy_buffer_regions(&src, &dst, std::slice::from_ref(region), &[], false)
                .map(drop)
        })
    }
    /** Launches `kernel` over the given geometry.

    Memory arguments are synced to this queue's device and bound to their
    allocation there. */
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_kernel_launch(
        &self,
        kernel: &Kernel,
        args: &[KernelArg],
        global_size: &[usize],
        global_offset: &[usize],
        local_size: &[usize],
        dims: usize,
        wait_events: &[Event],
    ) -> Result<Event, Error> {
        let mut descriptors = Vec::new();
        descriptors.try_reserve_exact(args.len())?;
        for arg in args {
            let descriptor = match arg {
                KernelArg::Mem { buffer, offset } => {
                    buffer.sync(self)?;
                    Descriptor::buffer(&buffer.buffer(self.device())?, *offset)?
                }
                KernelArg::Descriptor(descriptor) => descriptor.clone(),
            };
            descriptors.push(descriptor);
        }
        self.enqueue(wait_events, false, |cb| {
            cb.ndrange(
                kernel,
                &descriptors,
                global_size,
                global_offset,
                local_size,
                dims,
                &[],
                false,
            )
            .map(drop)
        })
    }
    /// Completes once `wait_events` and all earlier work on the queue have completed.
    pub fn enqueue_barrier(&self, wait_events: &[Event]) -> Result<Event, Error> {
        self.enqueue(wait_events, false, |_| Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kernel::{ArgKind, KernelInfo},
        runtime::{Context, Platform},
    };
    use anyhow::Result;
    use std::sync::Arc;

    fn queue() -> Result<(Arc<Context>, Queue)> {
        let platform = Platform::builder().build()?;
        let context = Context::new(&platform, platform.devices())?;
        let queue = Queue::builder(&context, &platform.devices()[0]).build()?;
        Ok((context, queue))
    }

    #[test]
    fn failed_recording_leaves_nothing_pending() -> Result<()> {
        let (context, queue) = queue()?;
        let buffer = context.create_buffer(8)?;
        let host = HostBuffer::zeroed(4);
        assert_eq!(
            queue
                .enqueue_write_buffer(&buffer, false, 0, 8, &host, 0, &[])
                .err(),
            Some(Error::InvalidValue)
        );
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.cached_len(), 1);
        Ok(())
    }

    #[test]
    fn rect_round_trip() -> Result<()> {
        let (context, queue) = queue()?;
        let buffer = context.create_buffer(64)?;
        let host: Vec<u8> = (0..16).collect();
        let host = HostBuffer::from_vec(host);
        let region = BufferRegion {
            src_origin: [0, 0, 0],
            dst_origin: [2, 1, 0],
            extent: [4, 4, 1],
            src_pitch: [4, 0],
            dst_pitch: [8, 0],
        };
        queue.enqueue_write_buffer_rect(&buffer, false, &region, &host, &[])?;
        let out = HostBuffer::zeroed(64);
        queue.enqueue_read_buffer(&buffer, true, 0, 64, &out, 0, &[])?;
        let out = out.to_vec();
        for row in 0..4 {
            let start = (1 + row) * 8 + 2;
            assert_eq!(out[start..start + 4], host.to_vec()[row * 4..row * 4 + 4]);
        }
        assert_eq!(out[..10], [0u8; 10]);
        Ok(())
    }

    #[test]
    fn kernel_launch_binds_mem_buffers() -> Result<()> {
        let (context, queue) = queue()?;
        let kernel = Kernel::new(
            KernelInfo {
                name: "add".into(),
                args: vec![ArgKind::Buffer, ArgKind::Value(4)],
            },
            |invocation| {
                let y = invocation.arg_buffer(0)?.ok_or(Error::InvalidValue)?;
                let alpha = invocation.arg_value::<u32>(1)?;
                let mut values = y.read_pod::<u32>();
                invocation.for_each_global_id(|[i, _, _]| values[i] += alpha);
                y.write_pod(0, &values)?;
                Ok(())
            },
        );
        let buffer = context.create_buffer(16)?;
        let host = HostBuffer::from_vec(bytemuck::cast_slice(&[1u32, 2, 3, 4]).to_vec());
        queue.enqueue_write_buffer(&buffer, false, 0, 16, &host, 0, &[])?;
        let event = queue.enqueue_kernel_launch(
            &kernel,
            &[
                KernelArg::Mem {
                    buffer: &buffer,
                    offset: 0,
                },
                KernelArg::Descriptor(Descriptor::value(&10u32)?),
            ],
            &[4],
            &[0],
            &[2],
            1,
            &[],
        )?;
        event.wait()?;
        queue.enqueue_read_buffer(&buffer, true, 0, 16, &host, 0, &[])?;
        let values: Vec<u32> = bytemuck::pod_collect_to_vec(&host.to_vec());
        assert_eq!(values, [11, 12, 13, 14]);
        Ok(())
    }

    #[test]
    fn barrier_waits_for_events() -> Result<()> {
        let (context, queue) = queue()?;
        let other = Queue::builder(&context, queue.device()).build()?;
        let buffer = context.create_buffer(4)?;
        let fill = other.enqueue_fill_buffer(&buffer, &[5], 0, 4, &[])?;
        let barrier = queue.enqueue_barrier(&[fill.clone()])?;
        barrier.wait()?;
        assert_eq!(fill.status(), EventStatus::Complete);
        assert_eq!(barrier.status(), EventStatus::Complete);
        Ok(())
    }
}
