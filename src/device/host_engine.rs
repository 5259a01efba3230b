use super::{
    DeviceEngine, DeviceEngineQueue, DeviceId, DeviceInfo, DeviceOptions, Features, Submission,
};
use crate::{
    command::Command,
    command_buffer::CommandBuffer,
    error::Error,
    kernel::KernelInvocation,
    memory::{DeviceBuffer, HostBuffer, Image, MemoryMap},
    ndrange::NdRange,
    sync::Semaphore,
};
use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub(super) struct Engine {
    info: Arc<DeviceInfo>,
    memory: Arc<MemoryMap>,
}

impl DeviceEngine for Engine {
    type Queue = Queue;
    fn new(options: DeviceOptions) -> Result<Arc<Self>> {
        let DeviceOptions {
            index,
            name,
            memory_size,
            features,
        } = options;
        let supported = Features::default();
        if !supported.contains(&features) {
            tracing::warn!(requested = ?features, ?supported, "unsupported features dropped");
        }
        let info = Arc::new(DeviceInfo {
            index,
            name,
            memory_size,
            features: features.intersection(&supported),
        });
        let memory = MemoryMap::new(memory_size);
        let engine = Arc::new(Self { info, memory });
        tracing::debug!(device = ?engine.id(), info = ?engine.info, "created");
        Ok(engine)
    }
    fn id(&self) -> DeviceId {
        DeviceId {
            index: self.info.index,
            handle: Arc::as_ptr(&self.memory) as usize,
        }
    }
    fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }
    fn alloc(&self, len: usize) -> Result<DeviceBuffer, Error> {
        let allocation = self.memory.alloc(len)?;
        Ok(DeviceBuffer::new(allocation, self.id().handle))
    }
    fn memory_used(&self) -> u64 {
        self.memory.used()
    }
    fn create_queue(self: &Arc<Self>) -> Result<Arc<Queue>, Error> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let state = Arc::new(QueueState::default());
        let worker = Worker {
            id: self.id(),
            memory: self.memory.clone(),
            receiver,
            state: state.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("muxrt-queue-{}", self.info.index))
            .spawn(move || worker.run())
            .map_err(|_| Error::OutOfMemory)?;
        Ok(Arc::new(Queue {
            sender: Some(sender),
            worker: Some(handle),
            state,
        }))
    }
}

#[derive(Default)]
struct QueueState {
    in_flight: Mutex<usize>,
    idle: Condvar,
    queue_exited: AtomicBool,
    worker_exited: AtomicBool,
}

impl QueueState {
    fn retire(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

pub(super) struct Queue {
    sender: Option<Sender<Submission>>,
    worker: Option<JoinHandle<()>>,
    state: Arc<QueueState>,
}

impl DeviceEngineQueue for Queue {
    fn dispatch(&self, submission: Submission) -> Result<(), Error> {
        let sender = self.sender.as_ref().ok_or(Error::DeviceLost)?;
        *self.state.in_flight.lock() += 1;
        if let Err(e) = sender.send(submission) {
            self.state.retire();
            release(e.into_inner(), true);
            return Err(Error::DeviceLost);
        }
        Ok(())
    }
    fn wait_all(&self) -> Result<(), Error> {
        let mut in_flight = self.state.in_flight.lock();
        while *in_flight > 0 {
            if self.state.worker_exited.load(Ordering::SeqCst) {
                return Err(Error::DeviceLost);
            }
            self.state.idle.wait_for(&mut in_flight, POLL_INTERVAL);
        }
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.state.queue_exited.store(true, Ordering::SeqCst);
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let result = worker.join();
            if !std::thread::panicking() && result.is_err() {
                tracing::warn!("queue worker panicked");
            }
        }
    }
}

struct Worker {
    id: DeviceId,
    memory: Arc<MemoryMap>,
    receiver: Receiver<Submission>,
    state: Arc<QueueState>,
}

impl Worker {
    fn run(self) {
        while let Ok(submission) = self.receiver.recv() {
            if self.state.queue_exited.load(Ordering::SeqCst) {
                self.abandon(submission);
                continue;
            }
            if !self.wait_semaphores(&submission.wait_semaphores) {
                self.abandon(submission);
                continue;
            }
            let command_buffer = &submission.command_buffer;
            tracing::trace!(device = ?self.id, command_buffer = command_buffer.id(), "executing");
            let result = execute(&self.memory, command_buffer);
            if let Err(e) = result.as_ref() {
                tracing::warn!(
                    device = ?self.id,
                    command_buffer = command_buffer.id(),
                    "dispatch failed: {e:#}"
                );
            }
            self.finish(submission, result.is_err());
        }
        self.state.worker_exited.store(true, Ordering::SeqCst);
        self.state.idle.notify_all();
    }
    /// Returns false if the queue was dropped while waiting.
    fn wait_semaphores(&self, semaphores: &[Semaphore]) -> bool {
        for semaphore in semaphores {
            while !semaphore.wait_timeout(POLL_INTERVAL) {
                if self.state.queue_exited.load(Ordering::SeqCst) {
                    return false;
                }
            }
        }
        true
    }
    fn finish(&self, submission: Submission, failed: bool) {
        release(submission, failed);
        self.state.retire();
    }
    fn abandon(&self, submission: Submission) {
        tracing::warn!(
            device = ?self.id,
            command_buffer = submission.command_buffer.id(),
            "abandoned"
        );
        release(submission, true);
        self.state.retire();
    }
}

/// Signals the semaphores, then the fences, of a finished or abandoned submission.
fn release(submission: Submission, failed: bool) {
    let Submission {
        command_buffer,
        fence,
        signal_semaphores,
        ..
    } = submission;
    command_buffer.complete();
    for semaphore in signal_semaphores.iter() {
        semaphore.signal();
    }
    command_buffer.fence().signal(failed);
    if let Some(fence) = fence {
        fence.signal(failed);
    }
}

fn execute(memory: &MemoryMap, command_buffer: &CommandBuffer) -> Result<()> {
    let records = command_buffer.records();
    for command in records.commands.iter() {
        match command {
            Command::NdRange(index) => {
                let ndrange = records.ndranges.get(*index).ok_or(Error::InvalidValue)?;
                run_ndrange(memory, ndrange)?;
            }
            command => run(command)?,
        }
    }
    Ok(())
}

fn run_ndrange(memory: &MemoryMap, ndrange: &NdRange) -> Result<()> {
    let kernel = ndrange.kernel();
    let mut invocation = KernelInvocation::new(
        *ndrange.geometry(),
        &kernel.info().args,
        ndrange.args(),
        memory,
    )?;
    kernel
        .run(&mut invocation)
        .map_err(|e| e.context(format!("kernel {:?} failed", kernel.name())))
}

fn write_host(host: &HostBuffer, offset: usize, bytes: &[u8]) -> Result<(), Error> {
    let range = host.check_range(offset, bytes.len())?;
    host.lock()[range].copy_from_slice(bytes);
    Ok(())
}

fn read_host(host: &HostBuffer, offset: usize, len: usize) -> Result<Vec<u8>, Error> {
    let range = host.check_range(offset, len)?;
    Ok(host.lock()[range].to_vec())
}

fn copy_buffer(
    src: &DeviceBuffer,
    src_offset: usize,
    dst: &DeviceBuffer,
    dst_offset: usize,
    size: usize,
) -> Result<(), Error> {
    if src.same_allocation(dst) {
        let src_range = src.check_range(src_offset, size)?;
        dst.check_range(dst_offset, size)?;
        src.allocation()
            .lock()
            .copy_within(src_range, dst_offset);
        Ok(())
    } else {
        let bytes = src.read_bytes(src_offset, size)?;
        dst.write_bytes(dst_offset, &bytes)
    }
}

/// Calls `f` with the byte offset of every row of the box and the row index.
fn image_rows(
    image: &Image,
    origin: [usize; 3],
    extent: [usize; 3],
    mut f: impl FnMut(usize, [usize; 2]) -> Result<(), Error>,
) -> Result<(), Error> {
    image.check_box(origin, extent)?;
    for z in 0..extent[2] {
        for y in 0..extent[1] {
            f(
                image.offset_of([origin[0], origin[1] + y, origin[2] + z]),
                [y, z],
            )?;
        }
    }
    Ok(())
}

fn run(command: &Command) -> Result<(), Error> {
    match command {
        Command::ReadBuffer {
            buffer,
            offset,
            host,
            host_offset,
            size,
        } => write_host(host, *host_offset, &buffer.read_bytes(*offset, *size)?),
        Command::WriteBuffer {
            buffer,
            offset,
            host,
            host_offset,
            size,
        } => buffer.write_bytes(*offset, &read_host(host, *host_offset, *size)?),
        Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => copy_buffer(src, *src_offset, dst, *dst_offset, *size),
        Command::FillBuffer {
            buffer,
            offset,
            size,
            pattern,
        } => {
            let range = buffer.check_range(*offset, *size)?;
            let mut data = buffer.allocation().lock();
            for chunk in data[range].chunks_exact_mut(pattern.len()) {
                chunk.copy_from_slice(pattern.as_slice());
            }
            Ok(())
        }
        Command::ReadImage {
            image,
            origin,
            extent,
            host,
        } => {
            let row = extent[0] * image.format().pixel_size();
            image_rows(image, *origin, *extent, |offset, [y, z]| {
                let bytes = image.memory().read_bytes(offset, row)?;
                let host_offset = host.offset + z * host.slice_pitch + y * host.row_pitch;
                write_host(&host.host, host_offset, &bytes)
            })
        }
        Command::WriteImage {
            image,
            origin,
            extent,
            host,
        } => {
            let row = extent[0] * image.format().pixel_size();
            image_rows(image, *origin, *extent, |offset, [y, z]| {
                let host_offset = host.offset + z * host.slice_pitch + y * host.row_pitch;
                let bytes = read_host(&host.host, host_offset, row)?;
                image.memory().write_bytes(offset, &bytes)
            })
        }
        Command::FillImage {
            image,
            color,
            origin,
            extent,
        } => {
            let row = color.as_slice().repeat(extent[0]);
            image_rows(image, *origin, *extent, |offset, _| {
                image.memory().write_bytes(offset, &row)
            })
        }
        Command::CopyImage {
            src,
            dst,
            src_origin,
            dst_origin,
            extent,
        } => {
            let row = extent[0] * src.format().pixel_size();
            dst.check_box(*dst_origin, *extent)?;
            image_rows(src, *src_origin, *extent, |offset, [y, z]| {
                let dst_offset =
                    dst.offset_of([dst_origin[0], dst_origin[1] + y, dst_origin[2] + z]);
                copy_buffer(src.memory(), offset, dst.memory(), dst_offset, row)
            })
        }
        Command::CopyImageToBuffer {
            src,
            dst,
            src_origin,
            dst_offset,
            extent,
        } => {
            let row = extent[0] * src.format().pixel_size();
            image_rows(src, *src_origin, *extent, |offset, [y, z]| {
                let packed = dst_offset + (z * extent[1] + y) * row;
                copy_buffer(src.memory(), offset, dst, packed, row)
            })
        }
        Command::CopyBufferToImage {
            src,
            dst,
            src_offset,
            dst_origin,
            extent,
        } => {
            let row = extent[0] * dst.format().pixel_size();
            image_rows(dst, *dst_origin, *extent, |offset, [y, z]| {
                let packed = src_offset + (z * extent[1] + y) * row;
                copy_buffer(src, packed, dst.memory(), offset, row)
            })
        }
        Command::UserCallback(callback) => callback().map_err(|e| {
            tracing::warn!("user callback failed: {e:#}");
            Error::InvalidValue
        }),
        Command::BeginQuery { pool, index, count } => pool.begin(*index, *count),
        Command::EndQuery { pool, index, count } => pool.end(*index, *count),
        Command::ResetQueryPool { pool, index, count } => pool.reset(*index, *count),
        Command::NdRange(_) => Err(Error::InvalidValue),
    }
}
