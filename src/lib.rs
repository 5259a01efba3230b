/*!
A command buffer execution engine.

Work is recorded into a [`CommandBuffer`](command_buffer::CommandBuffer) as an
ordered log of typed commands (buffer and image transfers, fills, kernel
dispatches, user callbacks and queries). A [`Queue`](runtime::Queue) hands
recorded command buffers to a [`DeviceQueue`](device::DeviceQueue) with a wait
list of [semaphores](sync::Semaphore) built from earlier work, tracks completion
through [fences](sync::Fence) and recycles finished command buffers.

```
# use muxrt::{device::Device, memory::HostBuffer};
# fn main() -> muxrt::result::Result<()> {
let device = Device::builder().build()?;
let buffer = device.alloc(16)?;
let host = HostBuffer::from_vec(vec![7u8; 16]);
let cb = device.create_command_buffer()?;
cb.write_buffer(&buffer, 0, &host, 0, 16, &[], false)?;
cb.finalize()?;
let queue = device.create_queue()?;
queue.dispatch(&cb, None, &[], &[])?;
queue.wait_all()?;
assert_eq!(buffer.read_bytes(0, 16)?, vec![7u8; 16]);
# Ok(())
# }
```
*/

#![forbid(unsafe_code)]

pub mod result {
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

pub mod command;
pub mod command_buffer;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod ndrange;
pub mod query;
pub mod runtime;
pub mod sync;
