//! Kernel dispatch records.

use crate::{
    descriptor::{Allocator, Descriptor, PackedArgs},
    error::Error,
    kernel::{Geometry, Kernel},
};
use std::sync::Arc;

/** A recorded kernel dispatch.

Owns the packed arguments of the dispatch together with the descriptors they
were packed from and the launch geometry. */
#[derive(Debug)]
pub struct NdRange {
    kernel: Kernel,
    descriptors: Vec<Descriptor>,
    args: PackedArgs,
    geometry: Geometry,
}

impl NdRange {
    /** Packs `descriptors` and normalizes the geometry.

    Only the first `dims` entries of the size and offset arrays are read,
    the remaining dimensions get a size of 1 and an offset of 0.

    **errors**
    - [`Error::InvalidValue`] if `dims` is not 1, 2 or 3, a size is zero or
      not a multiple of the local size, or the descriptors don't match the
      kernel's parameters.
    - [`Error::OutOfMemory`] if packing fails. */
    pub fn new(
        kernel: &Kernel,
        descriptors: &[Descriptor],
        global_size: &[usize],
        global_offset: &[usize],
        local_size: &[usize],
        dims: usize,
        allocator: Arc<dyn Allocator>,
    ) -> Result<Self, Error> {
        let geometry = normalize(global_size, global_offset, local_size, dims)?;
        kernel.info().check(descriptors)?;
        let args = PackedArgs::pack(descriptors, allocator)?;
        let mut owned = Vec::new();
        owned.try_reserve_exact(descriptors.len())?;
        owned.extend_from_slice(descriptors);
        Ok(Self {
            kernel: kernel.clone(),
            descriptors: owned,
            args,
            geometry,
        })
    }
    /// Deep copies the packed arguments into a new allocation.
    pub fn try_clone(&self, allocator: Arc<dyn Allocator>) -> Result<Self, Error> {
        let args = self.args.try_clone(allocator)?;
        let mut descriptors = Vec::new();
        descriptors.try_reserve_exact(self.descriptors.len())?;
        descriptors.extend_from_slice(&self.descriptors);
        Ok(Self {
            kernel: self.kernel.clone(),
            descriptors,
            args,
            geometry: self.geometry,
        })
    }
    /// Rewrites one argument in place.
    pub fn update(&mut self, index: usize, descriptor: &Descriptor) -> Result<(), Error> {
        let kind = self
            .kernel
            .info()
            .args
            .get(index)
            .ok_or(Error::InvalidValue)?;
        if !kind.accepts(descriptor) {
            return Err(Error::InvalidValue);
        }
        self.args.write(index, descriptor)?;
        self.descriptors[index] = descriptor.clone();
        Ok(())
    }
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }
    pub fn args(&self) -> &PackedArgs {
        &self.args
    }
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }
}

fn normalize(
    global_size: &[usize],
    global_offset: &[usize],
    local_size: &[usize],
    dims: usize,
) -> Result<Geometry, Error> {
    if !(1..=3).contains(&dims)
        || global_size.len() < dims
        || global_offset.len() < dims
        || local_size.len() < dims
    {
        return Err(Error::InvalidValue);
    }
    let mut geometry = Geometry {
        global_size: [1; 3],
        global_offset: [0; 3],
        local_size: [1; 3],
        dims,
    };
    for i in 0..dims {
        let (global, local) = (global_size[i], local_size[i]);
        if global == 0 || local == 0 || global % local != 0 {
            return Err(Error::InvalidValue);
        }
        geometry.global_size[i] = global;
        geometry.global_offset[i] = global_offset[i];
        geometry.local_size[i] = local;
    }
    Ok(geometry)
}
