/*!
Kernel argument descriptors and their packed encoding.

All arguments of one dispatch are encoded into a single contiguous
allocation, one slot per descriptor, in descriptor order. Slots hold device
addresses for memory arguments, the raw bytes of plain data arguments and the
requested size of local memory arguments.
*/

use crate::{
    error::Error,
    memory::{DeviceBuffer, Image, Sampler},
};
use std::{
    fmt::{self, Debug},
    mem::size_of,
    ops::Range,
    sync::Arc,
};

/// Size of an encoded device address.
pub const POINTER_SIZE: usize = size_of::<u64>();

/// Allocates the storage of packed arguments.
pub trait Allocator: Send + Sync {
    /// Returns a zeroed allocation of `len` bytes.
    fn allocate(&self, len: usize) -> Result<Vec<u8>, Error>;
    /// Called exactly once for every successful [`allocate`](Allocator::allocate).
    fn release(&self, len: usize) {
        let _ = len;
    }
}

/// Allocates from the global allocator, reporting failure instead of aborting.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, len: usize) -> Result<Vec<u8>, Error> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len)?;
        bytes.resize(len, 0);
        Ok(bytes)
    }
}

pub(crate) fn system_allocator() -> Arc<dyn Allocator> {
    Arc::new(SystemAllocator)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::IsVariant)]
pub enum DescriptorKind {
    Buffer,
    NullBuffer,
    Image,
    Sampler,
    PlainOldData,
    SharedLocalBuffer,
}

/// One kernel argument.
#[derive(Clone)]
pub enum Descriptor {
    Buffer { buffer: DeviceBuffer, offset: usize },
    NullBuffer,
    Image(Image),
    Sampler(Sampler),
    PlainOldData(Vec<u8>),
    SharedLocalBuffer { size: usize },
}

impl Descriptor {
    /// Binds `buffer` starting at byte `offset`.
    pub fn buffer(buffer: &DeviceBuffer, offset: usize) -> Result<Self, Error> {
        if offset >= buffer.len() {
            return Err(Error::InvalidValue);
        }
        Ok(Self::Buffer {
            buffer: buffer.clone(),
            offset,
        })
    }
    pub fn null_buffer() -> Self {
        Self::NullBuffer
    }
    pub fn image(image: &Image) -> Self {
        Self::Image(image.clone())
    }
    pub fn sampler(sampler: Sampler) -> Self {
        Self::Sampler(sampler)
    }
    /// Copies `bytes`, the caller may reuse its storage afterwards.
    pub fn plain_old_data(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Err(Error::InvalidValue);
        }
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())?;
        data.extend_from_slice(bytes);
        Ok(Self::PlainOldData(data))
    }
    pub fn value<T: bytemuck::Pod>(value: &T) -> Result<Self, Error> {
        Self::plain_old_data(bytemuck::bytes_of(value))
    }
    /// Requests `size` bytes of work-group local memory, allocated by the device.
    pub fn shared_local_buffer(size: usize) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::InvalidValue);
        }
        Ok(Self::SharedLocalBuffer { size })
    }
    pub fn kind(&self) -> DescriptorKind {
        match self {
            Self::Buffer { .. } => DescriptorKind::Buffer,
            Self::NullBuffer => DescriptorKind::NullBuffer,
            Self::Image(_) => DescriptorKind::Image,
            Self::Sampler(_) => DescriptorKind::Sampler,
            Self::PlainOldData(_) => DescriptorKind::PlainOldData,
            Self::SharedLocalBuffer { .. } => DescriptorKind::SharedLocalBuffer,
        }
    }
    /// Size of the encoded slot in bytes.
    pub fn payload_size(&self) -> usize {
        match self {
            Self::PlainOldData(data) => data.len(),
            _ => POINTER_SIZE,
        }
    }
    fn check_supported(&self) -> Result<(), Error> {
        match self {
            Self::Image(_) | Self::Sampler(_) if !cfg!(feature = "images") => {
                Err(Error::FeatureUnsupported)
            }
            _ => Ok(()),
        }
    }
    fn encode(&self, slot: &mut [u8]) {
        debug_assert_eq!(slot.len(), self.payload_size());
        let word = match self {
            Self::Buffer { buffer, offset } => buffer.address() + *offset as u64,
            Self::NullBuffer => 0,
            Self::Image(image) => image.address(),
            Self::Sampler(sampler) => u64::from(sampler.bits()),
            Self::SharedLocalBuffer { size } => *size as u64,
            Self::PlainOldData(data) => {
                slot.copy_from_slice(data);
                return;
            }
        };
        slot.copy_from_slice(&word.to_ne_bytes());
    }
}

impl Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Buffer { buffer, offset } => f
                .debug_struct("Buffer")
                .field("address", &format_args!("{:#x}", buffer.address()))
                .field("offset", offset)
                .finish(),
            Self::NullBuffer => f.write_str("NullBuffer"),
            Self::Image(image) => f.debug_tuple("Image").field(&image.format()).finish(),
            Self::Sampler(sampler) => f.debug_tuple("Sampler").field(sampler).finish(),
            Self::PlainOldData(data) => f.debug_tuple("PlainOldData").field(&data.len()).finish(),
            Self::SharedLocalBuffer { size } => f
                .debug_struct("SharedLocalBuffer")
                .field("size", size)
                .finish(),
        }
    }
}

/// Computes the total packed size and the offset of every slot.
pub fn layout(descriptors: &[Descriptor]) -> Result<(usize, Vec<usize>), Error> {
    let mut offsets = Vec::new();
    offsets.try_reserve_exact(descriptors.len())?;
    let mut size = 0usize;
    for descriptor in descriptors {
        offsets.push(size);
        size = size
            .checked_add(descriptor.payload_size())
            .ok_or(Error::OutOfMemory)?;
    }
    Ok((size, offsets))
}

/** Packed kernel arguments.

One allocation holds every argument slot. Slots are addressed by index
through bounds checked accessors; the allocation is handed back to its
[`Allocator`] when the `PackedArgs` drops. */
pub struct PackedArgs {
    bytes: Vec<u8>,
    offsets: Vec<usize>,
    allocator: Arc<dyn Allocator>,
}

impl PackedArgs {
    /// Packs `descriptors`, nothing is allocated if any of them is unsupported.
    pub fn pack(descriptors: &[Descriptor], allocator: Arc<dyn Allocator>) -> Result<Self, Error> {
        for descriptor in descriptors {
            descriptor.check_supported()?;
        }
        let (size, offsets) = layout(descriptors)?;
        let bytes = allocator.allocate(size)?;
        let mut packed = Self {
            bytes,
            offsets,
            allocator,
        };
        for (index, descriptor) in descriptors.iter().enumerate() {
            let range = packed.slot(index).ok_or(Error::InvalidValue)?;
            descriptor.encode(&mut packed.bytes[range]);
        }
        Ok(packed)
    }
    /** Copies the packed bytes into a fresh allocation.

    The bytes are copied rather than re-encoded, they are the authoritative
    state of the arguments. On failure everything allocated so far is
    released. */
    pub fn try_clone(&self, allocator: Arc<dyn Allocator>) -> Result<Self, Error> {
        let bytes = allocator.allocate(self.bytes.len())?;
        let mut packed = Self {
            bytes,
            offsets: Vec::new(),
            allocator,
        };
        packed.offsets.try_reserve_exact(self.offsets.len())?;
        packed.offsets.extend_from_slice(&self.offsets);
        packed.bytes.copy_from_slice(&self.bytes);
        Ok(packed)
    }
    pub fn len(&self) -> usize {
        self.offsets.len()
    }
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
    /// Total size of the allocation.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
    fn slot(&self, index: usize) -> Option<Range<usize>> {
        let start = *self.offsets.get(index)?;
        let end = self
            .offsets
            .get(index + 1)
            .copied()
            .unwrap_or(self.bytes.len());
        Some(start..end)
    }
    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        let range = self.slot(index)?;
        self.bytes.get(range)
    }
    pub fn arg_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let range = self.slot(index)?;
        self.bytes.get_mut(range)
    }
    /// Absolute address of a slot, within this allocation.
    pub fn address(&self, index: usize) -> Option<*const u8> {
        let range = self.slot(index)?;
        Some(self.bytes.as_ptr().wrapping_add(range.start))
    }
    /// Reads a pointer sized slot.
    pub fn word(&self, index: usize) -> Option<u64> {
        let bytes: [u8; POINTER_SIZE] = self.arg(index)?.try_into().ok()?;
        Some(u64::from_ne_bytes(bytes))
    }
    /** Overwrites one slot in place.

    **errors**
    - [`Error::InvalidValue`] if `index` is out of range or the encoded size of
      `descriptor` differs from the slot. */
    pub fn write(&mut self, index: usize, descriptor: &Descriptor) -> Result<(), Error> {
        descriptor.check_supported()?;
        let slot = self.arg_mut(index).ok_or(Error::InvalidValue)?;
        if slot.len() != descriptor.payload_size() {
            return Err(Error::InvalidValue);
        }
        descriptor.encode(slot);
        Ok(())
    }
}

impl Drop for PackedArgs {
    fn drop(&mut self) {
        self.allocator.release(self.bytes.len());
    }
}

impl Debug for PackedArgs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PackedArgs")
            .field("size", &self.size())
            .field("offsets", &self.offsets)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::MemoryMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tracks live allocations and fails once `budget` allocations were made.
    #[derive(Default)]
    pub(crate) struct CountingAllocator {
        pub(crate) live: AtomicUsize,
        pub(crate) total: AtomicUsize,
        pub(crate) budget: Option<usize>,
    }

    impl CountingAllocator {
        pub(crate) fn with_budget(budget: usize) -> Self {
            Self {
                budget: Some(budget),
                ..Self::default()
            }
        }
        pub(crate) fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }
    }

    impl Allocator for CountingAllocator {
        fn allocate(&self, len: usize) -> Result<Vec<u8>, Error> {
            let total = self.total.fetch_add(1, Ordering::SeqCst);
            if self.budget.map_or(false, |budget| total >= budget) {
                return Err(Error::OutOfMemory);
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            SystemAllocator.allocate(len)
        }
        fn release(&self, _len: usize) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn descriptors(buffer: &DeviceBuffer) -> Vec<Descriptor> {
        vec![
            Descriptor::buffer(buffer, 8).unwrap(),
            Descriptor::value(&7u32).unwrap(),
            Descriptor::null_buffer(),
            Descriptor::shared_local_buffer(64).unwrap(),
            Descriptor::plain_old_data(&[1, 2, 3]).unwrap(),
        ]
    }

    #[test]
    fn layout_is_deterministic() -> Result<(), Error> {
        let map = MemoryMap::new(1 << 20);
        let buffer = DeviceBuffer::new(map.alloc(64)?, 0);
        let descriptors = descriptors(&buffer);
        let (size, offsets) = layout(&descriptors)?;
        assert_eq!(layout(&descriptors)?, (size, offsets.clone()));
        assert_eq!(offsets, [0, 8, 12, 20, 28]);
        let sum: usize = descriptors.iter().map(Descriptor::payload_size).sum();
        assert_eq!(size, sum);
        Ok(())
    }

    #[test]
    fn pack_encodes_slots() -> Result<(), Error> {
        let map = MemoryMap::new(1 << 20);
        let buffer = DeviceBuffer::new(map.alloc(64)?, 0);
        let packed = PackedArgs::pack(&descriptors(&buffer), system_allocator())?;
        assert_eq!(packed.len(), 5);
        assert_eq!(packed.size(), 31);
        assert_eq!(packed.word(0), Some(buffer.address() + 8));
        assert_eq!(packed.arg(1), Some(7u32.to_ne_bytes().as_slice()));
        assert_eq!(packed.word(2), Some(0));
        assert_eq!(packed.word(3), Some(64));
        assert_eq!(packed.arg(4), Some([1u8, 2, 3].as_slice()));
        assert_eq!(packed.arg(5), None);
        Ok(())
    }

    #[test]
    fn pack_out_of_memory() -> Result<(), Error> {
        let map = MemoryMap::new(1 << 20);
        let buffer = DeviceBuffer::new(map.alloc(64)?, 0);
        let allocator = Arc::new(CountingAllocator::with_budget(0));
        let result = PackedArgs::pack(&descriptors(&buffer), allocator.clone());
        assert_eq!(result.err(), Some(Error::OutOfMemory));
        assert_eq!(allocator.live(), 0);
        Ok(())
    }

    #[test]
    fn clone_copies_bytes_into_new_allocation() -> Result<(), Error> {
        let map = MemoryMap::new(1 << 20);
        let buffer = DeviceBuffer::new(map.alloc(64)?, 0);
        let allocator = Arc::new(CountingAllocator::default());
        let mut packed = PackedArgs::pack(&descriptors(&buffer), allocator.clone())?;
        let clone = packed.try_clone(allocator.clone())?;
        assert_eq!(allocator.live(), 2);
        assert_eq!(clone.bytes(), packed.bytes());
        assert_eq!(clone.offsets(), packed.offsets());
        for index in 0..packed.len() {
            let address = clone.address(index).unwrap();
            assert_ne!(address, packed.address(index).unwrap());
            assert_eq!(
                address,
                clone.bytes().as_ptr().wrapping_add(clone.offsets()[index])
            );
        }
        packed.write(1, &Descriptor::value(&9u32)?)?;
        assert_eq!(clone.arg(1), Some(7u32.to_ne_bytes().as_slice()));
        drop(packed);
        drop(clone);
        assert_eq!(allocator.live(), 0);
        Ok(())
    }

    #[test]
    fn write_checks_slot_size() -> Result<(), Error> {
        let mut packed = PackedArgs::pack(
            &[Descriptor::value(&1u32)?, Descriptor::null_buffer()],
            system_allocator(),
        )?;
        assert_eq!(
            packed.write(0, &Descriptor::value(&1u64)?),
            Err(Error::InvalidValue)
        );
        assert_eq!(
            packed.write(2, &Descriptor::null_buffer()),
            Err(Error::InvalidValue)
        );
        packed.write(1, &Descriptor::shared_local_buffer(32)?)?;
        assert_eq!(packed.word(1), Some(32));
        Ok(())
    }
}
