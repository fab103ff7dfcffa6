use crate::{memory::Allocator, Error};
use bytemuck::Pod;
use pankmod::{BoAllocFlags, BoHandle};
use std::{fmt, ptr::NonNull, sync::Arc};

/// Which object a buffer object's lifetime is tied to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BoScope {
    /// Lives as long as the device.
    Device,
    /// Backs an API object (memory allocation, pipeline, descriptor pool).
    Object,
    /// Backs a command-buffer pool, released on reset.
    Command,
}

// --- Scoped pieces of a buffer object ---
//
// Each step of buffer object creation produces a guard that undoes it on drop. A partially
// built object therefore unwinds exactly the steps that succeeded, in reverse order.

/// Kernel allocation. Freed on drop.
pub(crate) struct KernelBo {
    allocator: Arc<Allocator>,
    handle: BoHandle,
}

impl KernelBo {
    pub(crate) fn alloc(
        allocator: &Arc<Allocator>,
        size: u64,
        flags: BoAllocFlags,
    ) -> Result<KernelBo, Error> {
        let handle = allocator
            .kernel()
            .bo_alloc(size, flags)
            .map_err(Error::from_alloc)?;
        Ok(KernelBo {
            allocator: allocator.clone(),
            handle,
        })
    }
}

impl Drop for KernelBo {
    fn drop(&mut self) {
        self.allocator.kernel().bo_free(self.handle);
    }
}

/// Host mapping of a whole buffer object. Unmapped on drop.
pub(crate) struct HostMapping {
    allocator: Arc<Allocator>,
    handle: BoHandle,
    ptr: NonNull<u8>,
}

// Host memory behind the mapping is only written through `&mut Bo`.
unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}

impl HostMapping {
    pub(crate) fn map(allocator: &Arc<Allocator>, bo: &KernelBo) -> Result<HostMapping, Error> {
        let ptr = allocator
            .kernel()
            .bo_mmap(bo.handle)
            .map_err(Error::from_alloc)?;
        Ok(HostMapping {
            allocator: allocator.clone(),
            handle: bo.handle,
            ptr,
        })
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        unsafe {
            self.allocator.kernel().bo_munmap(self.handle, self.ptr);
        }
    }
}

/// Range of GPU virtual addresses bound to a buffer object. Unbound on drop.
pub(crate) struct VaBinding {
    allocator: Arc<Allocator>,
    va: u64,
    size: u64,
}

impl VaBinding {
    /// Binds `bo` at `va`, or at an address picked by the allocator.
    pub(crate) fn bind(
        allocator: &Arc<Allocator>,
        bo: &KernelBo,
        size: u64,
        va: Option<u64>,
    ) -> Result<VaBinding, Error> {
        let va = match va {
            Some(va) => {
                allocator.bind_fixed(bo.handle, va, size)?;
                va
            }
            None => allocator.bind_auto(bo.handle, size)?,
        };
        Ok(VaBinding {
            allocator: allocator.clone(),
            va,
            size,
        })
    }
}

impl Drop for VaBinding {
    fn drop(&mut self) {
        self.allocator.unbind(self.va, self.size);
    }
}

/// A GPU buffer object: kernel allocation, optional host mapping and GPU address.
///
/// Dropping it releases the GPU address, then the host mapping, then the allocation.
pub struct Bo {
    // field order is drop order
    binding: VaBinding,
    mapping: Option<HostMapping>,
    kbo: KernelBo,
    size: u64,
    flags: BoAllocFlags,
    scope: BoScope,
}

impl Bo {
    pub(crate) fn from_parts(
        kbo: KernelBo,
        mapping: Option<HostMapping>,
        binding: VaBinding,
        size: u64,
        flags: BoAllocFlags,
        scope: BoScope,
    ) -> Bo {
        Bo {
            binding,
            mapping,
            kbo,
            size,
            flags,
            scope,
        }
    }

    pub fn handle(&self) -> BoHandle {
        self.kbo.handle
    }

    pub fn gpu_address(&self) -> u64 {
        self.binding.va
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn flags(&self) -> BoAllocFlags {
        self.flags
    }

    pub fn scope(&self) -> BoScope {
        self.scope
    }

    pub fn is_host_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    fn host_range(&self, offset: u64, len: usize) -> Result<*mut u8, Error> {
        let mapping = self
            .mapping
            .as_ref()
            .ok_or_else(|| Error::invalid_usage("buffer object has no host mapping"))?;
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => {}
            _ => return Err(Error::invalid_usage("host access out of buffer object bounds")),
        }
        Ok(unsafe { mapping.ptr.as_ptr().add(offset as usize) })
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let dst = self.host_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    pub fn write_pod<T: Pod>(&mut self, offset: u64, value: &T) -> Result<(), Error> {
        self.write(offset, bytemuck::bytes_of(value))
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), Error> {
        let src = self.host_range(offset, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Whole contents, or `None` if the buffer object is not host-mapped.
    pub fn contents(&self) -> Option<Vec<u8>> {
        let mut v = vec![0u8; self.size as usize];
        self.read(0, &mut v).ok()?;
        Some(v)
    }
}

impl Drop for Bo {
    fn drop(&mut self) {
        self.kbo.allocator.on_bo_destroyed(self);
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Bo")
            .field("handle", &self.kbo.handle)
            .field("va", &format_args!("{:#x}", self.binding.va))
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("scope", &self.scope)
            .finish()
    }
}
