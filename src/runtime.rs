/*!
The runtime layer.

A [`Platform`] is the explicit root object, it owns the devices. A
[`Context`] groups some of them and owns [memory](MemBuffer) that may be
used from any of its devices. A [`Queue`] schedules work on one device:
every enqueue call takes a command buffer from the queue, records into it,
and leaves it pending until the next [flush](Queue::flush). Completion is
observed through [events](Event) and [fences](Fence).

```
# use muxrt::{memory::HostBuffer, runtime::{Context, Platform, Queue}};
# fn main() -> muxrt::result::Result<()> {
let platform = Platform::builder().build()?;
let context = Context::new(&platform, platform.devices())?;
let queue = Queue::builder(&context, &platform.devices()[0]).build()?;
let buffer = context.create_buffer(4)?;
queue.enqueue_fill_buffer(&buffer, &[3], 0, 4, &[])?;
let host = HostBuffer::zeroed(4);
queue.enqueue_read_buffer(&buffer, true, 0, 4, &host, 0, &[])?;
assert_eq!(host.to_vec(), [3; 4]);
# Ok(())
# }
```

# Locks
The context lock is always taken before a queue lock. Enqueue calls sync
their buffers before locking the queue.
*/

pub mod context;
pub mod enqueue;
pub mod event;
pub mod fence;
pub mod platform;
pub mod queue;

pub use context::{Context, MemBuffer};
pub use enqueue::KernelArg;
pub use event::{Event, EventStatus};
pub use fence::{wait_for_fences, Fence};
pub use platform::Platform;
pub use queue::{OverflowPolicy, Queue, QueueOptions, Recycled};
