/*!
Device and host memory.

Device allocations are addressed by a 64 bit device address. The owning
device keeps an address map so packed kernel arguments, which only carry
addresses, can be resolved back to their allocation at execution time.
*/

use crate::error::Error;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

/// Alignment of device addresses.
pub(crate) const ADDRESS_ALIGN: u64 = 256;

fn checked_range(offset: usize, len: usize, size: usize) -> Result<Range<usize>, Error> {
    let end = offset.checked_add(len).ok_or(Error::InvalidValue)?;
    if end > size {
        return Err(Error::InvalidValue);
    }
    Ok(offset..end)
}

pub(crate) struct MemoryMap {
    allocations: RwLock<BTreeMap<u64, Weak<Allocation>>>,
    next_address: AtomicU64,
    capacity: u64,
    used: AtomicU64,
}

impl MemoryMap {
    pub(crate) fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            allocations: RwLock::default(),
            // Address 0 is the null pointer.
            next_address: AtomicU64::new(ADDRESS_ALIGN),
            capacity,
            used: AtomicU64::default(),
        })
    }
    pub(crate) fn alloc(self: &Arc<Self>, len: usize) -> Result<Arc<Allocation>, Error> {
        if len == 0 {
            return Err(Error::InvalidValue);
        }
        let size = len as u64;
        let used = self.used.fetch_add(size, Ordering::SeqCst);
        if used.saturating_add(size) > self.capacity {
            self.used.fetch_sub(size, Ordering::SeqCst);
            return Err(Error::OutOfMemory);
        }
        let mut data = Vec::new();
        if let Err(e) = data.try_reserve_exact(len) {
            self.used.fetch_sub(size, Ordering::SeqCst);
            return Err(e.into());
        }
        data.resize(len, 0);
        let span = ADDRESS_ALIGN * (1 + (size - 1) / ADDRESS_ALIGN);
        let address = self.next_address.fetch_add(span, Ordering::SeqCst);
        let allocation = Arc::new(Allocation {
            address,
            len,
            data: Mutex::new(data),
            map: Arc::downgrade(self),
        });
        self.allocations
            .write()
            .insert(address, Arc::downgrade(&allocation));
        Ok(allocation)
    }
    /// Finds the allocation containing `address`, and the offset into it.
    pub(crate) fn resolve(&self, address: u64) -> Option<(Arc<Allocation>, usize)> {
        let (base, allocation) = {
            let allocations = self.allocations.read();
            let (base, allocation) = allocations.range(..=address).next_back()?;
            (*base, allocation.clone())
        };
        // Upgraded outside the lock, the last handle may drop here.
        let allocation = allocation.upgrade()?;
        let offset = (address - base) as usize;
        if offset < allocation.len() {
            Some((allocation, offset))
        } else {
            None
        }
    }
    pub(crate) fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

pub(crate) struct Allocation {
    address: u64,
    len: usize,
    data: Mutex<Vec<u8>>,
    map: Weak<MemoryMap>,
}

impl Allocation {
    pub(crate) fn address(&self) -> u64 {
        self.address
    }
    pub(crate) fn len(&self) -> usize {
        self.len
    }
    pub(crate) fn lock(&self) -> MutexGuard<Vec<u8>> {
        self.data.lock()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Some(map) = self.map.upgrade() {
            map.allocations.write().remove(&self.address);
            map.used
                .fetch_sub(self.len as u64, Ordering::SeqCst);
        }
    }
}

/** A device allocation.

Cloning yields another handle to the same memory. */
#[derive(Clone)]
pub struct DeviceBuffer {
    allocation: Arc<Allocation>,
    device: usize,
}

impl DeviceBuffer {
    pub(crate) fn new(allocation: Arc<Allocation>, device: usize) -> Self {
        Self { allocation, device }
    }
    pub fn len(&self) -> usize {
        self.allocation.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The device address of the first byte.
    pub fn address(&self) -> u64 {
        self.allocation.address
    }
    /// Identifies the owning device, see [`Device::id`](crate::device::Device::id).
    pub fn device_id(&self) -> usize {
        self.device
    }
    pub(crate) fn allocation(&self) -> &Arc<Allocation> {
        &self.allocation
    }
    pub(crate) fn check_range(&self, offset: usize, len: usize) -> Result<Range<usize>, Error> {
        checked_range(offset, len, self.len())
    }
    /// Reads `len` bytes at `offset` directly from device memory.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>, Error> {
        let range = self.check_range(offset, len)?;
        Ok(self.allocation.lock()[range].to_vec())
    }
    /// Writes `bytes` at `offset` directly into device memory.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<(), Error> {
        let range = self.check_range(offset, bytes.len())?;
        self.allocation.lock()[range].copy_from_slice(bytes);
        Ok(())
    }
    /// Copies the whole of `self` into `dst`, which may live on another device.
    pub(crate) fn copy_to(&self, dst: &DeviceBuffer) -> Result<(), Error> {
        if self.len() != dst.len() {
            return Err(Error::InvalidValue);
        }
        if Arc::ptr_eq(&self.allocation, &dst.allocation) {
            return Ok(());
        }
        let bytes = self.allocation.lock().clone();
        dst.allocation.lock().copy_from_slice(&bytes);
        Ok(())
    }
    pub(crate) fn same_allocation(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.allocation, &other.allocation)
    }
}

impl Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device)
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len())
            .finish()
    }
}

/** Host memory that commands read from or write into.

Cloning yields another handle to the same memory. */
#[derive(Clone, Default)]
pub struct HostBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
    pub(crate) fn check_range(&self, offset: usize, len: usize) -> Result<Range<usize>, Error> {
        checked_range(offset, len, self.len())
    }
    pub(crate) fn lock(&self) -> MutexGuard<Vec<u8>> {
        self.data.lock()
    }
}

impl Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}

/// Pixel formats of [`Image`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize)]
pub enum ImageFormat {
    R8,
    Rg8,
    Rgba8,
    R32Float,
    Rgba32Float,
}

impl ImageFormat {
    pub const fn pixel_size(&self) -> usize {
        match self {
            Self::R8 => 1,
            Self::Rg8 => 2,
            Self::Rgba8 => 4,
            Self::R32Float => 4,
            Self::Rgba32Float => 16,
        }
    }
}

/** A 1D, 2D or 3D image backed by linear device memory.

Unused dimensions have an extent of 1. */
#[derive(Clone, Debug)]
pub struct Image {
    format: ImageFormat,
    extent: [usize; 3],
    memory: DeviceBuffer,
}

impl Image {
    pub(crate) fn new(format: ImageFormat, extent: [usize; 3], memory: DeviceBuffer) -> Self {
        Self {
            format,
            extent,
            memory,
        }
    }
    pub fn format(&self) -> ImageFormat {
        self.format
    }
    pub fn extent(&self) -> [usize; 3] {
        self.extent
    }
    pub fn row_pitch(&self) -> usize {
        self.extent[0] * self.format.pixel_size()
    }
    pub fn slice_pitch(&self) -> usize {
        self.row_pitch() * self.extent[1]
    }
    pub fn address(&self) -> u64 {
        self.memory.address()
    }
    pub fn memory(&self) -> &DeviceBuffer {
        &self.memory
    }
    /// Checks that the box at `origin` with `extent` (in pixels) lies inside the image.
    pub(crate) fn check_box(&self, origin: [usize; 3], extent: [usize; 3]) -> Result<(), Error> {
        for ((o, e), size) in origin.iter().zip(extent).zip(self.extent) {
            if e == 0 || o.checked_add(e).map_or(true, |end| end > size) {
                return Err(Error::InvalidValue);
            }
        }
        Ok(())
    }
    /// Byte offset of the pixel at `origin`.
    pub(crate) fn offset_of(&self, origin: [usize; 3]) -> usize {
        origin[2] * self.slice_pitch() + origin[1] * self.row_pitch()
            + origin[0] * self.format.pixel_size()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Deserialize)]
pub enum AddressingMode {
    #[default]
    None,
    ClampToEdge,
    Clamp,
    Repeat,
    MirroredRepeat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Deserialize)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

/// Sampler state, packed into a kernel argument as a bitfield.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Deserialize)]
pub struct Sampler {
    pub normalized_coords: bool,
    pub addressing: AddressingMode,
    pub filter: FilterMode,
}

impl Sampler {
    pub fn bits(&self) -> u32 {
        let addressing = match self.addressing {
            AddressingMode::None => 0,
            AddressingMode::ClampToEdge => 1,
            AddressingMode::Clamp => 2,
            AddressingMode::Repeat => 3,
            AddressingMode::MirroredRepeat => 4,
        };
        let filter = match self.filter {
            FilterMode::Nearest => 0,
            FilterMode::Linear => 1,
        };
        u32::from(self.normalized_coords) | (addressing << 1) | (filter << 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_map_resolves_interior_addresses() -> Result<(), Error> {
        let map = MemoryMap::new(1 << 20);
        let a = map.alloc(100)?;
        let b = map.alloc(300)?;
        assert_eq!(a.address() % ADDRESS_ALIGN, 0);
        assert_ne!(a.address(), 0);
        let (found, offset) = map.resolve(b.address() + 17).unwrap();
        assert!(Arc::ptr_eq(&found, &b));
        assert_eq!(offset, 17);
        assert!(map.resolve(a.address() + 100).is_none());
        assert!(map.resolve(0).is_none());
        assert_eq!(map.used(), 400);
        drop(b);
        assert_eq!(map.used(), 100);
        Ok(())
    }

    #[test]
    fn memory_map_capacity() {
        let map = MemoryMap::new(64);
        assert_eq!(map.alloc(65).err(), Some(Error::OutOfMemory));
        assert_eq!(map.alloc(0).err(), Some(Error::InvalidValue));
        assert!(map.alloc(64).is_ok());
    }

    #[test]
    fn device_buffer_bounds() -> Result<(), Error> {
        let map = MemoryMap::new(1 << 20);
        let buffer = DeviceBuffer::new(map.alloc(8)?, 0);
        buffer.write_bytes(4, &[1, 2, 3, 4])?;
        assert_eq!(buffer.read_bytes(0, 8)?, [0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(buffer.write_bytes(6, &[0; 4]), Err(Error::InvalidValue));
        assert_eq!(buffer.read_bytes(usize::MAX, 2), Err(Error::InvalidValue));
        Ok(())
    }

    #[test]
    fn sampler_bits() {
        let sampler = Sampler {
            normalized_coords: true,
            addressing: AddressingMode::Repeat,
            filter: FilterMode::Linear,
        };
        assert_eq!(sampler.bits(), 1 | (3 << 1) | (1 << 4));
        assert_eq!(Sampler::default().bits(), 0);
    }
}
