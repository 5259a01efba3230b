/*!
Kernels.

A kernel pairs the argument metadata produced by the compiler with an
executable. On the host device the executable is a function that runs the
whole ND-range in one call, reading its arguments through a
[`KernelInvocation`].
*/

use crate::{
    descriptor::{Descriptor, DescriptorKind, PackedArgs},
    error::Error,
    memory::{Allocation, MemoryMap},
};
use anyhow::Result;
use std::{
    fmt::{self, Debug},
    mem::size_of,
    sync::Arc,
};

/// The kind of one kernel parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize)]
pub enum ArgKind {
    /// A global or constant pointer, may be bound to a null buffer.
    Buffer,
    Image,
    Sampler,
    /// A by-value argument of the given size in bytes.
    Value(usize),
    /// A pointer to work-group local memory.
    Local,
}

impl ArgKind {
    pub(crate) fn accepts(&self, descriptor: &Descriptor) -> bool {
        match (self, descriptor.kind()) {
            (Self::Buffer, DescriptorKind::Buffer | DescriptorKind::NullBuffer) => true,
            (Self::Image, DescriptorKind::Image) => true,
            (Self::Sampler, DescriptorKind::Sampler) => true,
            (Self::Value(size), DescriptorKind::PlainOldData) => {
                *size == descriptor.payload_size()
            }
            (Self::Local, DescriptorKind::SharedLocalBuffer) => true,
            _ => false,
        }
    }
}

/// Argument metadata of a kernel.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct KernelInfo {
    pub name: String,
    pub args: Vec<ArgKind>,
}

impl KernelInfo {
    /// Checks `descriptors` against the parameters.
    pub(crate) fn check(&self, descriptors: &[Descriptor]) -> Result<(), Error> {
        if descriptors.len() != self.args.len() {
            return Err(Error::InvalidValue);
        }
        if self
            .args
            .iter()
            .zip(descriptors)
            .all(|(kind, descriptor)| kind.accepts(descriptor))
        {
            Ok(())
        } else {
            Err(Error::InvalidValue)
        }
    }
}

pub type KernelFn = dyn Fn(&mut KernelInvocation) -> Result<()> + Send + Sync;

/** A kernel handle.

Cloning yields another handle to the same kernel. */
#[derive(Clone)]
pub struct Kernel {
    info: Arc<KernelInfo>,
    f: Arc<KernelFn>,
}

impl Kernel {
    pub fn new<F>(info: KernelInfo, f: F) -> Self
    where
        F: Fn(&mut KernelInvocation) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            info: Arc::new(info),
            f: Arc::new(f),
        }
    }
    pub fn info(&self) -> &Arc<KernelInfo> {
        &self.info
    }
    pub fn name(&self) -> &str {
        &self.info.name
    }
    pub(crate) fn run(&self, invocation: &mut KernelInvocation) -> Result<()> {
        (self.f)(invocation)
    }
}

impl Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Kernel").field(&self.info.name).finish()
    }
}

/// A view of device memory resolved from a kernel argument.
#[derive(Clone)]
pub struct BufferView {
    allocation: Arc<Allocation>,
    offset: usize,
}

impl BufferView {
    /// Bytes from the bound address to the end of the allocation.
    pub fn len(&self) -> usize {
        self.allocation.len() - self.offset
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn read(&self) -> Vec<u8> {
        self.allocation.lock()[self.offset..].to_vec()
    }
    pub fn read_pod<T: bytemuck::Pod>(&self) -> Vec<T> {
        self.read()
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), Error> {
        let start = self.offset.checked_add(offset).ok_or(Error::InvalidValue)?;
        let end = start.checked_add(bytes.len()).ok_or(Error::InvalidValue)?;
        let mut data = self.allocation.lock();
        data.get_mut(start..end)
            .ok_or(Error::InvalidValue)?
            .copy_from_slice(bytes);
        Ok(())
    }
    pub fn write_pod<T: bytemuck::Pod>(&self, offset: usize, values: &[T]) -> Result<(), Error> {
        self.write(offset * size_of::<T>(), bytemuck::cast_slice(values))
    }
}

impl Debug for BufferView {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BufferView")
            .field("address", &format_args!("{:#x}", self.allocation.address()))
            .field("offset", &self.offset)
            .finish()
    }
}

/// Launch geometry, unused dimensions have a size of 1 and offset of 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub global_size: [usize; 3],
    pub global_offset: [usize; 3],
    pub local_size: [usize; 3],
    pub dims: usize,
}

impl Geometry {
    pub fn groups(&self) -> [usize; 3] {
        let mut groups = [1; 3];
        for (i, g) in groups.iter_mut().enumerate() {
            *g = self.global_size[i] / self.local_size[i].max(1);
        }
        groups
    }
}

/// The arguments and geometry of one dispatch, as seen by a host kernel.
pub struct KernelInvocation<'a> {
    geometry: Geometry,
    kinds: &'a [ArgKind],
    args: &'a PackedArgs,
    memory: &'a MemoryMap,
    locals: Vec<Option<Vec<u8>>>,
}

impl<'a> KernelInvocation<'a> {
    pub(crate) fn new(
        geometry: Geometry,
        kinds: &'a [ArgKind],
        args: &'a PackedArgs,
        memory: &'a MemoryMap,
    ) -> Result<Self, Error> {
        let mut locals = Vec::new();
        locals.try_reserve_exact(kinds.len())?;
        for (index, kind) in kinds.iter().enumerate() {
            let local = if let ArgKind::Local = kind {
                let size = args.word(index).ok_or(Error::InvalidValue)? as usize;
                let mut local = Vec::new();
                local.try_reserve_exact(size)?;
                local.resize(size, 0);
                Some(local)
            } else {
                None
            };
            locals.push(local);
        }
        Ok(Self {
            geometry,
            kinds,
            args,
            memory,
            locals,
        })
    }
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }
    pub fn global_size(&self) -> [usize; 3] {
        self.geometry.global_size
    }
    pub fn global_offset(&self) -> [usize; 3] {
        self.geometry.global_offset
    }
    pub fn local_size(&self) -> [usize; 3] {
        self.geometry.local_size
    }
    pub fn dims(&self) -> usize {
        self.geometry.dims
    }
    /// Calls `f` with every global id of the range, x fastest.
    pub fn for_each_global_id(&self, mut f: impl FnMut([usize; 3])) {
        let Geometry {
            global_size,
            global_offset,
            ..
        } = self.geometry;
        for z in 0..global_size[2] {
            for y in 0..global_size[1] {
                for x in 0..global_size[0] {
                    f([
                        global_offset[0] + x,
                        global_offset[1] + y,
                        global_offset[2] + z,
                    ]);
                }
            }
        }
    }
    pub fn arg_bytes(&self, index: usize) -> Result<&[u8], Error> {
        self.args.arg(index).ok_or(Error::InvalidValue)
    }
    pub fn arg_value<T: bytemuck::Pod>(&self, index: usize) -> Result<T, Error> {
        if !matches!(self.kinds.get(index), Some(ArgKind::Value(_))) {
            return Err(Error::InvalidValue);
        }
        let bytes = self.arg_bytes(index)?;
        if bytes.len() != size_of::<T>() {
            return Err(Error::InvalidValue);
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
    fn resolve(&self, index: usize) -> Result<Option<BufferView>, Error> {
        let address = self.args.word(index).ok_or(Error::InvalidValue)?;
        if address == 0 {
            return Ok(None);
        }
        let (allocation, offset) = self.memory.resolve(address).ok_or(Error::InvalidValue)?;
        Ok(Some(BufferView { allocation, offset }))
    }
    /// Resolves a buffer argument, `None` if a null buffer is bound.
    pub fn arg_buffer(&self, index: usize) -> Result<Option<BufferView>, Error> {
        if !matches!(self.kinds.get(index), Some(ArgKind::Buffer)) {
            return Err(Error::InvalidValue);
        }
        self.resolve(index)
    }
    /// Resolves the linear memory of an image argument.
    pub fn arg_image(&self, index: usize) -> Result<BufferView, Error> {
        if !matches!(self.kinds.get(index), Some(ArgKind::Image)) {
            return Err(Error::InvalidValue);
        }
        self.resolve(index)?.ok_or(Error::InvalidValue)
    }
    pub fn arg_sampler(&self, index: usize) -> Result<u32, Error> {
        if !matches!(self.kinds.get(index), Some(ArgKind::Sampler)) {
            return Err(Error::InvalidValue);
        }
        let word = self.args.word(index).ok_or(Error::InvalidValue)?;
        u32::try_from(word).map_err(|_| Error::InvalidValue)
    }
    /// Local memory allocated for this dispatch.
    pub fn local_buffer(&mut self, index: usize) -> Result<&mut [u8], Error> {
        self.locals
            .get_mut(index)
            .and_then(Option::as_mut)
            .map(Vec::as_mut_slice)
            .ok_or(Error::InvalidValue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{descriptor::system_allocator, memory::DeviceBuffer};

    fn geometry() -> Geometry {
        Geometry {
            global_size: [4, 2, 1],
            global_offset: [1, 0, 0],
            local_size: [2, 1, 1],
            dims: 2,
        }
    }

    #[test]
    fn kernel_info_check() -> Result<()> {
        let info = KernelInfo {
            name: "axpy".into(),
            args: vec![ArgKind::Buffer, ArgKind::Value(4), ArgKind::Local],
        };
        let map = MemoryMap::new(1 << 20);
        let buffer = DeviceBuffer::new(map.alloc(16)?, 0);
        info.check(&[
            Descriptor::buffer(&buffer, 0)?,
            Descriptor::value(&1f32)?,
            Descriptor::shared_local_buffer(16)?,
        ])?;
        info.check(&[
            Descriptor::null_buffer(),
            Descriptor::value(&1u32)?,
            Descriptor::shared_local_buffer(16)?,
        ])?;
        assert_eq!(
            info.check(&[
                Descriptor::null_buffer(),
                Descriptor::value(&1u64)?,
                Descriptor::shared_local_buffer(16)?,
            ]),
            Err(Error::InvalidValue)
        );
        assert_eq!(
            info.check(&[Descriptor::null_buffer()]),
            Err(Error::InvalidValue)
        );
        Ok(())
    }

    #[test]
    fn invocation_resolves_arguments() -> Result<()> {
        let kinds = [
            ArgKind::Buffer,
            ArgKind::Buffer,
            ArgKind::Value(4),
            ArgKind::Local,
        ];
        let map = MemoryMap::new(1 << 20);
        let buffer = DeviceBuffer::new(map.alloc(16)?, 0);
        let args = PackedArgs::pack(
            &[
                Descriptor::buffer(&buffer, 4)?,
                Descriptor::null_buffer(),
                Descriptor::value(&3u32)?,
                Descriptor::shared_local_buffer(32)?,
            ],
            system_allocator(),
        )?;
        let mut invocation = KernelInvocation::new(geometry(), &kinds, &args, &map)?;
        let view = invocation.arg_buffer(0)?.unwrap();
        assert_eq!(view.len(), 12);
        view.write_pod(1, &[5u32])?;
        assert_eq!(buffer.read_bytes(8, 4)?, 5u32.to_ne_bytes());
        assert!(invocation.arg_buffer(1)?.is_none());
        assert_eq!(invocation.arg_value::<u32>(2)?, 3);
        assert_eq!(invocation.arg_value::<u64>(2), Err(Error::InvalidValue));
        assert_eq!(invocation.arg_buffer(2).err(), Some(Error::InvalidValue));
        assert_eq!(invocation.local_buffer(3)?.len(), 32);
        assert!(invocation.local_buffer(0).is_err());
        Ok(())
    }

    #[test]
    fn global_ids_cover_range() -> Result<()> {
        let map = MemoryMap::new(1 << 20);
        let args = PackedArgs::pack(&[], system_allocator())?;
        let invocation = KernelInvocation::new(geometry(), &[], &args, &map)?;
        let mut ids = Vec::new();
        invocation.for_each_global_id(|id| ids.push(id));
        assert_eq!(ids.len(), 8);
        assert_eq!(ids[0], [1, 0, 0]);
        assert_eq!(ids[7], [4, 1, 0]);
        assert_eq!(invocation.geometry().groups(), [2, 2, 1]);
        Ok(())
    }
}
