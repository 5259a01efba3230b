use anyhow::Result;
use muxrt::{
    command::BufferRegion,
    command_buffer::CommandBufferState,
    error::Error,
    memory::HostBuffer,
    query::{QueryPool, QueryType},
    runtime::{
        wait_for_fences, Context, Event, EventStatus, OverflowPolicy, Platform, Queue, Recycled,
    },
};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    thread::sleep,
    time::{Duration, Instant},
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn setup(devices: usize) -> Result<(Arc<Platform>, Arc<Context>)> {
    init_tracing();
    let platform = Platform::builder().devices(devices).build()?;
    let context = Context::new(&platform, platform.devices())?;
    Ok((platform, context))
}

fn enqueue_callback<F>(queue: &Queue, wait_events: &[Event], f: F) -> Result<Event>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    let event = queue.create_event();
    let mut guard = queue.lock();
    let command_buffer = guard.get_command_buffer(&event, wait_events)?;
    command_buffer.user_callback(f, &[], false)?;
    Ok(event)
}

#[test]
fn completes_in_order() -> Result<()> {
    let (platform, context) = setup(1)?;
    let queue = Queue::builder(&context, &platform.devices()[0])
        .cache_capacity(4)
        .build()?;
    let order = Arc::new(Mutex::new(Vec::new()));
    let events = (0..8)
        .map(|i| {
            let order = order.clone();
            enqueue_callback(&queue, &[], move || {
                order.lock().push(i);
                Ok(())
            })
        })
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(queue.pending_len(), 8);
    queue.wait()?;
    assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    assert!(events.iter().all(|e| e.status().is_complete()));
    assert_eq!(queue.pending_len(), 0);
    assert_eq!(queue.running_len(), 0);
    assert_eq!(queue.cached_len(), 4);
    Ok(())
}

#[test]
fn command_buffers_are_reused() -> Result<()> {
    let (platform, context) = setup(1)?;
    let queue = Queue::builder(&context, &platform.devices()[0]).build()?;
    let buffer = context.create_buffer(4)?;
    for _ in 0..4 {
        queue.enqueue_fill_buffer(&buffer, &[1], 0, 4, &[])?;
        queue.wait()?;
    }
    assert_eq!(queue.cached_len(), 1);
    Ok(())
}

#[test]
fn read_buffer_rect() -> Result<()> {
    let (platform, context) = setup(1)?;
    let queue = Queue::builder(&context, &platform.devices()[0]).build()?;
    let buffer = context.create_buffer(32)?;
    let x: Vec<u8> = (0..32).collect();
    queue.enqueue_write_buffer(&buffer, false, 0, 32, &HostBuffer::from_vec(x.clone()), 0, &[])?;
    // The left half of each row of a 4 x 8 matrix, shifted right by one byte.
    let region = BufferRegion {
        src_origin: [0, 0, 0],
        dst_origin: [1, 0, 0],
        extent: [4, 4, 1],
        src_pitch: [8, 0],
        dst_pitch: [5, 0],
    };
    let host = HostBuffer::zeroed(20);
    queue.enqueue_read_buffer_rect(&buffer, true, &region, &host, &[])?;
    let y = host.to_vec();
    for row in 0..4 {
        assert_eq!(y[row * 5], 0);
        assert_eq!(y[row * 5 + 1..row * 5 + 5], x[row * 8..row * 8 + 4]);
    }
    Ok(())
}

#[test]
fn query_measures_duration() -> Result<()> {
    let (platform, context) = setup(1)?;
    let queue = Queue::builder(&context, &platform.devices()[0]).build()?;
    let pool = QueryPool::new(QueryType::Duration, 2)?;
    let event = queue.create_event();
    {
        let mut guard = queue.lock();
        let command_buffer = guard.get_command_buffer(&event, &[])?;
        assert_eq!(
            command_buffer.end_query(&pool, 0, 1, &[], false),
            Err(Error::InvalidValue)
        );
        command_buffer.begin_query(&pool, 0, 1, &[], false)?;
        command_buffer.user_callback(
            || {
                sleep(Duration::from_millis(2));
                Ok(())
            },
            &[],
            false,
        )?;
        command_buffer.end_query(&pool, 0, 1, &[], false)?;
    }
    event.wait()?;
    let results = pool.results(0, 2)?;
    assert!(results[0].unwrap() >= 2_000_000);
    assert_eq!(results[1], None);
    Ok(())
}

#[test]
fn wait_for_fences_any_and_all() -> Result<()> {
    let (platform, context) = setup(1)?;
    let device = &platform.devices()[0];
    let blocked = Queue::builder(&context, device).build()?;
    let free = Queue::builder(&context, device).build()?;
    let (sender, receiver) = crossbeam_channel::bounded::<()>(1);
    let a = enqueue_callback(&blocked, &[], move || {
        receiver.recv()?;
        Ok(())
    })?;
    let b = free.enqueue_barrier(&[])?;
    blocked.flush()?;
    free.flush()?;
    wait_for_fences(&[b.fence(), a.fence()], false, Duration::from_secs(10))?;
    assert_eq!(a.status(), EventStatus::Queued);
    let start = Instant::now();
    assert_eq!(
        wait_for_fences(&[a.fence(), b.fence()], true, Duration::from_millis(50)),
        Err(Error::Timeout)
    );
    assert!(start.elapsed() < Duration::from_secs(5));
    sender.send(())?;
    wait_for_fences(&[a.fence(), b.fence()], true, Duration::MAX)?;
    assert_eq!(wait_for_fences(&[], true, Duration::ZERO), Err(Error::InvalidValue));
    Ok(())
}

#[test]
fn reset_is_idempotent() -> Result<()> {
    let (platform, _) = setup(1)?;
    let device = &platform.devices()[0];
    let buffer = device.alloc(8)?;
    let command_buffer = device.create_command_buffer()?;
    command_buffer.fill_buffer(&buffer, 0, 8, &[1, 2], &[], false)?;
    device.finalize_command_buffer(&command_buffer)?;
    assert_eq!(command_buffer.state(), CommandBufferState::Executable);
    for _ in 0..2 {
        device.reset_command_buffer(&command_buffer)?;
        assert_eq!(command_buffer.state(), CommandBufferState::Initial);
        assert!(command_buffer.is_empty());
    }
    Ok(())
}

#[test]
fn same_device_queues_skip_migration() -> Result<()> {
    let (platform, context) = setup(2)?;
    let device = &platform.devices()[1];
    let a = Queue::builder(&context, device).build()?;
    let b = Queue::builder(&context, device).build()?;
    let buffer = context.create_buffer(8)?;
    a.enqueue_fill_buffer(&buffer, &[4], 0, 8, &[])?;
    let host = HostBuffer::zeroed(8);
    b.enqueue_read_buffer(&buffer, true, 0, 8, &host, 0, &[])?;
    a.enqueue_read_buffer(&buffer, true, 0, 8, &host, 0, &[])?;
    assert_eq!(host.to_vec(), [4; 8]);
    assert_eq!(buffer.migrations(), 0);
    Ok(())
}

#[test]
fn cache_overflow() -> Result<()> {
    let (platform, context) = setup(1)?;
    let device = &platform.devices()[0];
    let evicting = Queue::builder(&context, device)
        .cache_capacity(1)
        .overflow(OverflowPolicy::EvictOldest)
        .build()?;
    let destroying = Queue::builder(&context, device).cache_capacity(1).build()?;
    for (queue, overflow) in [(&evicting, Recycled::Evicted), (&destroying, Recycled::Destroyed)] {
        let mut guard = queue.lock();
        let fates = (0..3)
            .map(|_| Ok(guard.destroy_command_buffer(device.create_command_buffer()?)))
            .collect::<Result<Vec<_>, Error>>()?;
        assert_eq!(fates, [Recycled::Cached, overflow, overflow]);
        drop(guard);
        assert_eq!(queue.cached_len(), 1);
    }
    Ok(())
}

#[test]
fn completed_events_are_released() -> Result<()> {
    let (platform, context) = setup(1)?;
    let queue = Queue::builder(&context, &platform.devices()[0]).build()?;
    let buffer = context.create_buffer(4)?;
    let first = queue.enqueue_fill_buffer(&buffer, &[1], 0, 4, &[])?;
    let second = queue.enqueue_fill_buffer(&buffer, &[2], 0, 4, &[first.clone()])?;
    assert!(first.ref_count() > 1);
    queue.wait()?;
    assert_eq!(queue.completed_events_len(), 0);
    assert_eq!(first.ref_count(), 1);
    assert_eq!(second.ref_count(), 1);
    Ok(())
}

#[test]
fn completed_event_held_while_waited_on() -> Result<()> {
    let (platform, context) = setup(1)?;
    let queue = Queue::builder(&context, &platform.devices()[0]).build()?;
    let (sender, receiver) = crossbeam_channel::bounded::<()>(1);
    let first = enqueue_callback(&queue, &[], || Ok(()))?;
    let second = enqueue_callback(&queue, &[first.clone()], move || {
        receiver.recv()?;
        Ok(())
    })?;
    queue.flush()?;
    first.wait()?;
    queue.lock().cleanup_completed_command_buffers()?;
    assert_eq!(queue.running_len(), 1);
    assert_eq!(queue.completed_events_len(), 1);
    assert!(first.ref_count() > 1);
    sender.send(())?;
    queue.wait()?;
    assert_eq!(second.status(), EventStatus::Complete);
    assert_eq!(queue.completed_events_len(), 0);
    assert_eq!(first.ref_count(), 1);
    Ok(())
}
