use crate::{
    hw::align_up,
    memory::{Allocator, Bo, BoFlags, BoScope},
    Error,
};
use bytemuck::Pod;
use pankmod::BoHandle;
use std::sync::Arc;

/// Location of a pool allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PoolAlloc {
    pub gpu: u64,
    pub size: u64,
    slab: usize,
    offset: u64,
}

/// Bump allocator over buffer objects ("slabs").
///
/// Slabs are whole pages. Allocations larger than a slab get a dedicated buffer object.
/// Nothing is freed individually: `reset` rewinds the pool and keeps slabs for reuse,
/// dropping the pool destroys every buffer object.
pub struct Pool {
    allocator: Arc<Allocator>,
    label: &'static str,
    slab_size: u64,
    flags: BoFlags,
    bos: Vec<Bo>,
    /// Slabs from before the last reset, ready for reuse.
    free_slabs: Vec<Bo>,
    current: Option<usize>,
    offset: u64,
}

impl Pool {
    pub fn new(
        allocator: Arc<Allocator>,
        label: &'static str,
        slab_size: u64,
        flags: BoFlags,
    ) -> Pool {
        let slab_size = align_up(slab_size.max(1), allocator.page_size());
        Pool {
            allocator,
            label,
            slab_size,
            flags,
            bos: vec![],
            free_slabs: vec![],
            current: None,
            offset: 0,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn alloc(&mut self, size: u64, align: u64) -> Result<PoolAlloc, Error> {
        let size = size.max(1);

        if size > self.slab_size {
            let bo = self
                .allocator
                .create_bo(size, self.flags, BoScope::Command)?;
            let gpu = bo.gpu_address();
            self.bos.push(bo);
            return Ok(PoolAlloc {
                gpu,
                size,
                slab: self.bos.len() - 1,
                offset: 0,
            });
        }

        let fits = match self.current {
            Some(_) => align_up(self.offset, align) + size <= self.slab_size,
            None => false,
        };
        if !fits {
            let slab = match self.free_slabs.pop() {
                Some(bo) => bo,
                None => self
                    .allocator
                    .create_bo(self.slab_size, self.flags, BoScope::Command)?,
            };
            tracing::trace!("{} pool: new slab at {:#x}", self.label, slab.gpu_address());
            self.bos.push(slab);
            self.current = Some(self.bos.len() - 1);
            self.offset = 0;
        }

        let slab = self.current.unwrap_or_default();
        let offset = align_up(self.offset, align);
        self.offset = offset + size;
        Ok(PoolAlloc {
            gpu: self.bos[slab].gpu_address() + offset,
            size,
            slab,
            offset,
        })
    }

    /// Writes `data` at `offset` bytes into an allocation.
    pub fn write(&mut self, alloc: &PoolAlloc, offset: u64, data: &[u8]) -> Result<(), Error> {
        if offset + data.len() as u64 > alloc.size {
            return Err(Error::invalid_usage("write past the end of a pool allocation"));
        }
        self.bos[alloc.slab].write(alloc.offset + offset, data)
    }

    /// Allocates memory for `data` and copies it. Returns the GPU address.
    pub fn upload(&mut self, data: &[u8], align: u64) -> Result<u64, Error> {
        let alloc = self.alloc(data.len() as u64, align)?;
        self.write(&alloc, 0, data)?;
        Ok(alloc.gpu)
    }

    pub fn upload_pod<T: Pod>(&mut self, value: &T, align: u64) -> Result<u64, Error> {
        self.upload(bytemuck::bytes_of(value), align)
    }

    pub fn upload_slice<T: Pod>(&mut self, values: &[T], align: u64) -> Result<u64, Error> {
        self.upload(bytemuck::cast_slice(values), align)
    }

    /// Buffer objects currently in use by the pool.
    pub fn bos(&self) -> &[Bo] {
        &self.bos
    }

    pub fn handles(&self) -> impl Iterator<Item = BoHandle> + '_ {
        self.bos.iter().map(Bo::handle)
    }

    /// Rewinds the pool. Slabs are kept for reuse, dedicated buffer objects are destroyed.
    pub fn reset(&mut self) {
        let slab_size = self.slab_size;
        for bo in self.bos.drain(..) {
            if bo.size() == slab_size {
                self.free_slabs.push(bo);
            }
        }
        self.current = None;
        self.offset = 0;
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use pankmod::SoftKernel;

    fn pool(slab_size: u64) -> (Arc<SoftKernel>, Pool) {
        let kernel = Arc::new(SoftKernel::new(0x7212));
        let alloc = Allocator::new(kernel.clone(), &DriverConfig::default(), None).unwrap();
        (kernel, Pool::new(alloc, "test", slab_size, BoFlags::empty()))
    }

    #[test]
    fn allocations_are_aligned_and_packed() {
        let (_k, mut pool) = pool(0x1000);
        let a = pool.alloc(10, 16).unwrap();
        let b = pool.alloc(10, 64).unwrap();
        assert_eq!(a.gpu % 16, 0);
        assert_eq!(b.gpu % 64, 0);
        assert_eq!(b.gpu - a.gpu, 64);
        assert_eq!(pool.bos().len(), 1);
    }

    #[test]
    fn oversized_allocations_get_their_own_bo() {
        let (_k, mut pool) = pool(0x1000);
        pool.alloc(16, 16).unwrap();
        let big = pool.alloc(0x3000, 64).unwrap();
        assert_eq!(pool.bos().len(), 2);
        // the current slab is still usable
        let c = pool.alloc(16, 16).unwrap();
        assert_ne!(c.gpu, big.gpu);
        assert_eq!(pool.bos().len(), 2);
    }

    #[test]
    fn reset_reuses_slabs_and_drop_frees_them() {
        let (kernel, mut pool) = pool(0x1000);
        pool.alloc(0x800, 16).unwrap();
        pool.alloc(0x800, 16).unwrap();
        pool.alloc(0x800, 16).unwrap();
        assert_eq!(kernel.live_bo_count(), 2);
        pool.reset();
        pool.alloc(0x800, 16).unwrap();
        assert_eq!(kernel.live_bo_count(), 2);
        drop(pool);
        assert_eq!(kernel.live_bo_count(), 0);
    }

    #[test]
    fn slabs_smaller_than_a_page_are_reused() {
        let (kernel, mut pool) = pool(0x600);
        let a = pool.alloc(0x500, 16).unwrap();
        let big = pool.alloc(0x1800, 16).unwrap();
        // a slab is a whole page, so this still fits in the first one
        let b = pool.alloc(0x800, 16).unwrap();
        assert_eq!(b.gpu, a.gpu + 0x500);
        assert_eq!(kernel.live_bo_count(), 2);

        pool.reset();
        assert_eq!(kernel.live_bo_count(), 1);
        assert_eq!(pool.alloc(0x10, 16).unwrap().gpu, a.gpu);
        assert_ne!(a.gpu, big.gpu);
        assert_eq!(kernel.live_bo_count(), 1);
    }

    #[test]
    fn uploads_land_in_gpu_memory() {
        let (kernel, mut pool) = pool(0x1000);
        let gpu = pool.upload(&[9, 8, 7], 16).unwrap();
        assert_eq!(kernel.read_va(gpu, 3), Some(vec![9, 8, 7]));
    }
}
