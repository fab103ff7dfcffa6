//! GPU memory: buffer objects, the GPU VA space and sub-allocation pools.
mod bo;
mod capture;
mod pool;
mod va;

pub use self::{
    bo::{Bo, BoScope},
    capture::{CaptureContext, CaptureEvent},
    pool::{Pool, PoolAlloc},
};
pub use pankmod::BoAllocFlags as BoFlags;

use self::{
    bo::{HostMapping, KernelBo, VaBinding},
    va::{auto_va_alignment, VaHeap},
};
use crate::{config::DriverConfig, hw::align_up, Error};
use pankmod::{BoHandle, KernelDevice, VmOp};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, error, trace_span};

/// Live buffer-object counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryStats {
    pub live_bos: u64,
    pub live_bytes: u64,
}

/// Creates and destroys buffer objects and owns the GPU VA space.
///
/// Shared by the device and everything that allocates GPU memory. The VA heap is behind a
/// mutex: buffer objects can be created and destroyed from any thread.
pub struct Allocator {
    kernel: Arc<dyn KernelDevice>,
    va: Mutex<VaHeap>,
    page_size: u64,
    capture: Option<CaptureContext>,
    live_bos: AtomicU64,
    live_bytes: AtomicU64,
}

impl Allocator {
    pub fn new(
        kernel: Arc<dyn KernelDevice>,
        config: &DriverConfig,
        capture: Option<CaptureContext>,
    ) -> Result<Arc<Allocator>, Error> {
        let props = kernel.props();
        let start = align_up(config.va_reserve_bottom, props.page_size);
        let end = config.va_end.min(props.va_end());
        if start >= end {
            return Err(Error::VaExhausted);
        }
        debug!("GPU VA range {:#x}..{:#x}", start, end);
        Ok(Arc::new(Allocator {
            kernel,
            va: Mutex::new(VaHeap::new(start, end)),
            page_size: props.page_size,
            capture,
            live_bos: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
        }))
    }

    pub fn kernel(&self) -> &Arc<dyn KernelDevice> {
        &self.kernel
    }

    pub fn capture(&self) -> Option<&CaptureContext> {
        self.capture.as_ref()
    }

    /// Range of addresses handed out to buffer objects.
    /// Granularity of buffer object sizes.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn va_range(&self) -> (u64, u64) {
        self.va.lock().range()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            live_bos: self.live_bos.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
        }
    }

    /// Creates a buffer object: allocates it, maps it on the host unless `NO_MMAP` is set,
    /// and binds it at an auto-assigned GPU address.
    pub fn create_bo(
        self: &Arc<Self>,
        size: u64,
        flags: BoFlags,
        scope: BoScope,
    ) -> Result<Bo, Error> {
        self.create(size, flags, scope, None)
    }

    /// Creates a buffer object bound at `va`.
    ///
    /// The range must lie inside the VA space and not overlap any live buffer object.
    pub fn create_bo_at(
        self: &Arc<Self>,
        va: u64,
        size: u64,
        flags: BoFlags,
        scope: BoScope,
    ) -> Result<Bo, Error> {
        if va % self.page_size != 0 {
            return Err(Error::invalid_usage(format!("unaligned GPU address {:#x}", va)));
        }
        self.create(size, flags, scope, Some(va))
    }

    fn create(
        self: &Arc<Self>,
        size: u64,
        flags: BoFlags,
        scope: BoScope,
        va: Option<u64>,
    ) -> Result<Bo, Error> {
        let _span = trace_span!("create_bo", size, ?flags, ?scope).entered();
        let size = align_up(size.max(1), self.page_size);

        let kbo = KernelBo::alloc(self, size, flags)?;
        let mapping = if flags.contains(BoFlags::NO_MMAP) {
            None
        } else {
            Some(HostMapping::map(self, &kbo)?)
        };
        let binding = VaBinding::bind(self, &kbo, size, va)?;
        let bo = Bo::from_parts(kbo, mapping, binding, size, flags, scope);

        if let Some(capture) = &self.capture {
            capture.inject_mmap(bo.gpu_address(), size, bo.is_host_mapped());
        }
        self.live_bos.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
        debug!(
            "created {:?} at {:#x} ({} bytes, {:?})",
            bo.handle(),
            bo.gpu_address(),
            size,
            scope
        );
        Ok(bo)
    }

    /// Called before the pieces of a fully built buffer object are released.
    pub(crate) fn on_bo_destroyed(&self, bo: &Bo) {
        if let Some(capture) = &self.capture {
            capture.inject_free(bo.gpu_address(), bo.size());
        }
        self.live_bos.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(bo.size(), Ordering::Relaxed);
        debug!("destroying {:?} at {:#x}", bo.handle(), bo.gpu_address());
    }

    pub(crate) fn bind_auto(&self, bo: BoHandle, size: u64) -> Result<u64, Error> {
        let mut heap = self.va.lock();
        let va = heap
            .alloc(size, auto_va_alignment(size))
            .ok_or(Error::VaExhausted)?;
        let op = VmOp::Map {
            va,
            size,
            bo,
            bo_offset: 0,
        };
        if let Err(err) = self.kernel.vm_bind(&op) {
            heap.free(va, size);
            return Err(Error::from_alloc(err));
        }
        Ok(va)
    }

    pub(crate) fn bind_fixed(&self, bo: BoHandle, va: u64, size: u64) -> Result<(), Error> {
        let mut heap = self.va.lock();
        if !heap.reserve(va, size) {
            return Err(Error::invalid_usage(format!(
                "GPU range {:#x}+{:#x} is not available",
                va, size
            )));
        }
        let op = VmOp::Map {
            va,
            size,
            bo,
            bo_offset: 0,
        };
        if let Err(err) = self.kernel.vm_bind(&op) {
            heap.free(va, size);
            return Err(Error::from_alloc(err));
        }
        Ok(())
    }

    pub(crate) fn unbind(&self, va: u64, size: u64) {
        let mut heap = self.va.lock();
        match self.kernel.vm_bind(&VmOp::Unmap { va, size }) {
            Ok(()) => heap.free(va, size),
            // keep the range out of the heap rather than hand out an address still mapped
            Err(err) => error!("failed to unbind {:#x}+{:#x}: {}", va, size, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pankmod::{FaultPoint, KernelCall, SoftKernel};

    fn allocator() -> (Arc<SoftKernel>, Arc<Allocator>) {
        let kernel = Arc::new(SoftKernel::new(0x7212));
        let alloc = Allocator::new(kernel.clone(), &DriverConfig::default(), None).unwrap();
        (kernel, alloc)
    }

    #[test]
    fn destroy_unbinds_then_unmaps_then_frees() {
        let (kernel, alloc) = allocator();
        let bo = alloc.create_bo(0x1000, BoFlags::empty(), BoScope::Object).unwrap();
        let (handle, va) = (bo.handle(), bo.gpu_address());
        kernel.clear_calls();
        drop(bo);
        assert_eq!(
            kernel.calls(),
            vec![
                KernelCall::VmBind(VmOp::Unmap { va, size: 0x1000 }),
                KernelCall::Munmap { bo: handle },
                KernelCall::BoFree { bo: handle },
            ]
        );
        assert_eq!(alloc.stats(), MemoryStats::default());
    }

    #[test]
    fn failed_bind_unwinds_without_unbinding() {
        let (kernel, alloc) = allocator();
        kernel.inject_fault(FaultPoint::VmMap, 0);
        let err = alloc
            .create_bo(0x1000, BoFlags::empty(), BoScope::Object)
            .unwrap_err();
        assert_eq!(err, Error::DeviceOutOfMemory);
        let calls = kernel.calls();
        assert!(matches!(calls[0], KernelCall::BoAlloc { .. }));
        assert!(matches!(calls[1], KernelCall::Mmap { .. }));
        assert!(matches!(calls[2], KernelCall::Munmap { .. }));
        assert!(matches!(calls[3], KernelCall::BoFree { .. }));
        assert_eq!(calls.len(), 4);
        assert_eq!(kernel.live_bo_count(), 0);
    }

    #[test]
    fn failed_mmap_frees_the_allocation() {
        let (kernel, alloc) = allocator();
        kernel.inject_fault(FaultPoint::Mmap, 0);
        assert!(alloc
            .create_bo(0x1000, BoFlags::empty(), BoScope::Object)
            .is_err());
        assert_eq!(kernel.live_bo_count(), 0);
        assert!(kernel.live_mappings().is_empty());
    }

    #[test]
    fn reserved_bottom_is_never_handed_out() {
        let (_kernel, alloc) = allocator();
        let bo = alloc.create_bo(0x1000, BoFlags::empty(), BoScope::Object).unwrap();
        assert!(bo.gpu_address() >= crate::config::VA_RESERVE_BOTTOM);
    }

    #[test]
    fn no_mmap_buffers_have_no_host_access() {
        let (_kernel, alloc) = allocator();
        let mut bo = alloc
            .create_bo(0x1000, BoFlags::NO_MMAP, BoScope::Object)
            .unwrap();
        assert!(!bo.is_host_mapped());
        assert!(matches!(bo.write(0, &[1, 2, 3]), Err(Error::InvalidUsage(_))));
    }

    #[test]
    fn host_writes_are_bounds_checked() {
        let (kernel, alloc) = allocator();
        let mut bo = alloc.create_bo(0x1000, BoFlags::empty(), BoScope::Object).unwrap();
        bo.write(0xffc, &[1, 2, 3, 4]).unwrap();
        assert!(bo.write(0xffd, &[1, 2, 3, 4]).is_err());
        assert_eq!(kernel.read_va(bo.gpu_address() + 0xffc, 4), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn fixed_address_binds() {
        let (kernel, alloc) = allocator();
        let va = 0x1000_0000;
        let a = alloc
            .create_bo_at(va, 0x2000, BoFlags::empty(), BoScope::Object)
            .unwrap();
        assert_eq!(a.gpu_address(), va);
        assert_eq!(kernel.bo_at(va + 0x1000), Some(a.handle()));

        // overlapping, outside of the VA space, or unaligned
        for &(va, size) in &[(va + 0x1000, 0x1000), (0x1000, 0x1000), (va + 0x2800, 0x1000)] {
            let err = alloc
                .create_bo_at(va, size, BoFlags::empty(), BoScope::Object)
                .unwrap_err();
            assert!(matches!(err, Error::InvalidUsage(_)));
        }
        assert_eq!(kernel.live_bo_count(), 1);

        drop(a);
        assert!(alloc
            .create_bo_at(va, 0x1000, BoFlags::empty(), BoScope::Object)
            .is_ok());
    }
}
