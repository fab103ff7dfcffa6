//! In-process emulation of the kernel driver.
//!
//! `SoftKernel` keeps buffer-object storage in host memory, enforces the VM rules a real
//! kernel enforces (page alignment, no overlapping mappings, unmaps must match a live
//! mapping), and records every call so that tests can inspect what the core asked for.
//! Jobs are not executed: a submission validates its inputs, is logged and immediately
//! signals its out-sync.
use crate::{
    BoAllocFlags, BoHandle, DeviceProps, JobRequirements, JobSubmit, KernelDevice, KernelError,
    SyncHandle, VmOp,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    ptr::NonNull,
};

/// Operations that can be made to fail on purpose.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FaultPoint {
    BoAlloc,
    Mmap,
    VmMap,
    Submit,
}

/// A call made to the emulated kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelCall {
    BoAlloc { bo: BoHandle, size: u64 },
    BoFree { bo: BoHandle },
    Mmap { bo: BoHandle },
    Munmap { bo: BoHandle },
    VmBind(VmOp),
    SyncReset(SyncHandle),
    SyncTransfer { dst: SyncHandle, src: SyncHandle },
    SyncWait(SyncHandle),
    Submit { head: u64, requirements: JobRequirements },
}

/// A logged job-chain submission.
#[derive(Clone, Debug)]
pub struct SubmitRecord {
    pub head: u64,
    pub requirements: JobRequirements,
    pub bos: Vec<BoHandle>,
    pub in_syncs: Vec<SyncHandle>,
    pub out_sync: Option<SyncHandle>,
}

/// Heap storage behind a buffer object.
struct Backing {
    ptr: NonNull<u8>,
    len: usize,
}

// Backing owns its allocation exclusively, like a Box<[u8]>.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Backing {
    fn zeroed(len: usize) -> Backing {
        let slice: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let raw = Box::into_raw(slice) as *mut u8;
        Backing {
            // Box::into_raw never returns null
            ptr: NonNull::new(raw).unwrap_or(NonNull::dangling()),
            len,
        }
    }

    fn bytes(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Some(out)
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
            drop(Box::from_raw(slice));
        }
    }
}

struct SoftBo {
    size: u64,
    flags: BoAllocFlags,
    backing: Option<Backing>,
    host_mappings: u32,
}

#[derive(Copy, Clone)]
struct Mapping {
    size: u64,
    bo: BoHandle,
    bo_offset: u64,
}

#[derive(Default)]
struct State {
    next_handle: u32,
    bos: HashMap<BoHandle, SoftBo>,
    mappings: BTreeMap<u64, Mapping>,
    syncobjs: HashMap<SyncHandle, bool>,
    faults: HashMap<FaultPoint, usize>,
    calls: Vec<KernelCall>,
    submits: Vec<SubmitRecord>,
}

impl State {
    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Returns true if the next call at `point` must fail.
    fn take_fault(&mut self, point: FaultPoint) -> bool {
        match self.faults.get_mut(&point) {
            Some(0) => {
                self.faults.remove(&point);
                true
            }
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }

    fn mapping_containing(&self, va: u64) -> Option<(u64, Mapping)> {
        let (&start, &m) = self.mappings.range(..=va).next_back()?;
        if va < start + m.size {
            Some((start, m))
        } else {
            None
        }
    }

    fn overlaps(&self, va: u64, size: u64) -> bool {
        if self.mapping_containing(va).is_some() {
            return true;
        }
        self.mappings.range(va..va + size).next().is_some()
    }
}

/// Emulated kernel driver. See the module documentation.
pub struct SoftKernel {
    props: DeviceProps,
    state: Mutex<State>,
}

impl SoftKernel {
    /// Creates an emulated kernel for the given GPU product id, with a 32-bit VA space and four
    /// shader cores.
    pub fn new(gpu_prod_id: u32) -> SoftKernel {
        SoftKernel::with_props(DeviceProps {
            gpu_prod_id,
            va_bits: 32,
            page_size: 4096,
            shader_present: 0xf,
        })
    }

    pub fn with_props(props: DeviceProps) -> SoftKernel {
        SoftKernel {
            props,
            state: Mutex::new(State::default()),
        }
    }

    /// Makes the call at `point` fail after `skip` successful calls.
    pub fn inject_fault(&self, point: FaultPoint, skip: usize) {
        self.state.lock().faults.insert(point, skip);
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<KernelCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Every successful submission so far, in order.
    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.state.lock().submits.clone()
    }

    pub fn live_bo_count(&self) -> usize {
        self.state.lock().bos.len()
    }

    /// Live GPU mappings as `(va, size)` pairs sorted by address.
    pub fn live_mappings(&self) -> Vec<(u64, u64)> {
        self.state
            .lock()
            .mappings
            .iter()
            .map(|(&va, m)| (va, m.size))
            .collect()
    }

    /// Returns the buffer object mapped at `va`, if any.
    pub fn bo_at(&self, va: u64) -> Option<BoHandle> {
        self.state.lock().mapping_containing(va).map(|(_, m)| m.bo)
    }

    /// Reads GPU memory through the VM mappings. Returns `None` if the range is not mapped
    /// or not backed by host memory.
    pub fn read_va(&self, va: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let (start, m) = state.mapping_containing(va)?;
        if va + len as u64 > start + m.size {
            return None;
        }
        let bo = state.bos.get(&m.bo)?;
        let offset = (m.bo_offset + (va - start)) as usize;
        bo.backing.as_ref()?.bytes(offset, len)
    }

    pub fn read_u32(&self, va: u64) -> Option<u32> {
        let b = self.read_va(va, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&self, va: u64) -> Option<u64> {
        let lo = self.read_u32(va)? as u64;
        let hi = self.read_u32(va + 4)? as u64;
        Some(lo | (hi << 32))
    }

    pub fn is_signaled(&self, sync: SyncHandle) -> bool {
        self.state.lock().syncobjs.get(&sync).copied().unwrap_or(false)
    }

    pub fn live_syncobj_count(&self) -> usize {
        self.state.lock().syncobjs.len()
    }
}

impl KernelDevice for SoftKernel {
    fn props(&self) -> DeviceProps {
        self.props
    }

    fn bo_alloc(&self, size: u64, flags: BoAllocFlags) -> Result<BoHandle, KernelError> {
        let mut state = self.state.lock();
        if size == 0 {
            return Err(KernelError::new("bo_alloc", KernelError::EINVAL));
        }
        if state.take_fault(FaultPoint::BoAlloc) {
            return Err(KernelError::new("bo_alloc", KernelError::ENOMEM));
        }
        let size = (size + self.props.page_size - 1) & !(self.props.page_size - 1);
        let backing = if flags.contains(BoAllocFlags::NO_MMAP) {
            None
        } else {
            Some(Backing::zeroed(size as usize))
        };
        let bo = BoHandle(state.handle());
        state.bos.insert(
            bo,
            SoftBo {
                size,
                flags,
                backing,
                host_mappings: 0,
            },
        );
        state.calls.push(KernelCall::BoAlloc { bo, size });
        Ok(bo)
    }

    fn bo_free(&self, bo: BoHandle) {
        let mut state = self.state.lock();
        if state.mappings.values().any(|m| m.bo == bo) {
            tracing::error!("{:?} freed while still mapped in the GPU VA space", bo);
        }
        match state.bos.remove(&bo) {
            Some(b) if b.host_mappings != 0 => {
                tracing::error!("{:?} freed with {} live host mappings", bo, b.host_mappings)
            }
            Some(_) => {}
            None => tracing::error!("freeing unknown {:?}", bo),
        }
        state.calls.push(KernelCall::BoFree { bo });
    }

    fn bo_mmap(&self, bo: BoHandle) -> Result<NonNull<u8>, KernelError> {
        let mut state = self.state.lock();
        if state.take_fault(FaultPoint::Mmap) {
            return Err(KernelError::new("bo_mmap", KernelError::ENOMEM));
        }
        let b = state
            .bos
            .get_mut(&bo)
            .ok_or(KernelError::new("bo_mmap", KernelError::ENOENT))?;
        if b.flags.contains(BoAllocFlags::NO_MMAP) {
            return Err(KernelError::new("bo_mmap", KernelError::EINVAL));
        }
        let ptr = b
            .backing
            .as_ref()
            .map(|backing| backing.ptr)
            .ok_or(KernelError::new("bo_mmap", KernelError::EINVAL))?;
        b.host_mappings += 1;
        state.calls.push(KernelCall::Mmap { bo });
        Ok(ptr)
    }

    unsafe fn bo_munmap(&self, bo: BoHandle, _ptr: NonNull<u8>) {
        let mut state = self.state.lock();
        match state.bos.get_mut(&bo) {
            Some(b) if b.host_mappings > 0 => b.host_mappings -= 1,
            _ => tracing::error!("munmap of {:?} without a live host mapping", bo),
        }
        state.calls.push(KernelCall::Munmap { bo });
    }

    fn vm_bind(&self, op: &VmOp) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let page_mask = self.props.page_size - 1;
        match *op {
            VmOp::Map {
                va,
                size,
                bo,
                bo_offset,
            } => {
                if state.take_fault(FaultPoint::VmMap) {
                    return Err(KernelError::new("vm_bind", KernelError::ENOMEM));
                }
                if size == 0 || va & page_mask != 0 || size & page_mask != 0 {
                    return Err(KernelError::new("vm_bind", KernelError::EINVAL));
                }
                if va.checked_add(size).map_or(true, |end| end > self.props.va_end()) {
                    return Err(KernelError::new("vm_bind", KernelError::EINVAL));
                }
                let bo_size = state
                    .bos
                    .get(&bo)
                    .map(|b| b.size)
                    .ok_or(KernelError::new("vm_bind", KernelError::ENOENT))?;
                if bo_offset + size > bo_size {
                    return Err(KernelError::new("vm_bind", KernelError::EINVAL));
                }
                if state.overlaps(va, size) {
                    return Err(KernelError::new("vm_bind", KernelError::EBUSY));
                }
                state.mappings.insert(
                    va,
                    Mapping {
                        size,
                        bo,
                        bo_offset,
                    },
                );
            }
            VmOp::Unmap { va, size } => match state.mappings.get(&va) {
                Some(m) if m.size == size => {
                    state.mappings.remove(&va);
                }
                _ => return Err(KernelError::new("vm_bind", KernelError::EINVAL)),
            },
        }
        state.calls.push(KernelCall::VmBind(*op));
        Ok(())
    }

    fn syncobj_create(&self, signaled: bool) -> Result<SyncHandle, KernelError> {
        let mut state = self.state.lock();
        let sync = SyncHandle(state.handle());
        state.syncobjs.insert(sync, signaled);
        Ok(sync)
    }

    fn syncobj_destroy(&self, sync: SyncHandle) {
        if self.state.lock().syncobjs.remove(&sync).is_none() {
            tracing::error!("destroying unknown {:?}", sync);
        }
    }

    fn syncobj_reset(&self, sync: SyncHandle) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let s = state
            .syncobjs
            .get_mut(&sync)
            .ok_or(KernelError::new("syncobj_reset", KernelError::ENOENT))?;
        *s = false;
        state.calls.push(KernelCall::SyncReset(sync));
        Ok(())
    }

    fn syncobj_transfer(&self, dst: SyncHandle, src: SyncHandle) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let value = *state
            .syncobjs
            .get(&src)
            .ok_or(KernelError::new("syncobj_transfer", KernelError::ENOENT))?;
        let d = state
            .syncobjs
            .get_mut(&dst)
            .ok_or(KernelError::new("syncobj_transfer", KernelError::ENOENT))?;
        *d = value;
        state.calls.push(KernelCall::SyncTransfer { dst, src });
        Ok(())
    }

    fn syncobj_wait(&self, sync: SyncHandle, _timeout_ns: u64) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let signaled = *state
            .syncobjs
            .get(&sync)
            .ok_or(KernelError::new("syncobj_wait", KernelError::ENOENT))?;
        state.calls.push(KernelCall::SyncWait(sync));
        if signaled {
            Ok(())
        } else {
            // nothing runs asynchronously here: an unsignalled object stays unsignalled
            Err(KernelError::new("syncobj_wait", KernelError::ETIME))
        }
    }

    fn submit(&self, submit: &JobSubmit) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if state.take_fault(FaultPoint::Submit) {
            return Err(KernelError::new("submit", KernelError::EINVAL));
        }
        if submit.head == 0 || state.mapping_containing(submit.head).is_none() {
            return Err(KernelError::new("submit", KernelError::EINVAL));
        }
        if let Some(bo) = submit.bos.iter().find(|&bo| !state.bos.contains_key(bo)) {
            tracing::error!("submission references unknown {:?}", bo);
            return Err(KernelError::new("submit", KernelError::ENOENT));
        }
        if submit.in_syncs.iter().any(|s| !state.syncobjs.contains_key(s)) {
            return Err(KernelError::new("submit", KernelError::ENOENT));
        }
        if let Some(out) = submit.out_sync {
            match state.syncobjs.get_mut(&out) {
                Some(s) => *s = true,
                None => return Err(KernelError::new("submit", KernelError::ENOENT)),
            }
        }
        state.calls.push(KernelCall::Submit {
            head: submit.head,
            requirements: submit.requirements,
        });
        state.submits.push(SubmitRecord {
            head: submit.head,
            requirements: submit.requirements,
            bos: submit.bos.to_vec(),
            in_syncs: submit.in_syncs.to_vec(),
            out_sync: submit.out_sync,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_maps_are_rejected() {
        let k = SoftKernel::new(0x7212);
        let a = k.bo_alloc(0x2000, BoAllocFlags::empty()).unwrap();
        let b = k.bo_alloc(0x2000, BoAllocFlags::empty()).unwrap();
        k.vm_bind(&VmOp::Map { va: 0x10000, size: 0x2000, bo: a, bo_offset: 0 })
            .unwrap();
        let err = k
            .vm_bind(&VmOp::Map { va: 0x11000, size: 0x2000, bo: b, bo_offset: 0 })
            .unwrap_err();
        assert_eq!(err.errno, KernelError::EBUSY);
        k.vm_bind(&VmOp::Map { va: 0x12000, size: 0x2000, bo: b, bo_offset: 0 })
            .unwrap();
    }

    #[test]
    fn unmap_must_match_a_live_mapping() {
        let k = SoftKernel::new(0x7212);
        let a = k.bo_alloc(0x1000, BoAllocFlags::empty()).unwrap();
        assert!(k.vm_bind(&VmOp::Unmap { va: 0x10000, size: 0x1000 }).is_err());
        k.vm_bind(&VmOp::Map { va: 0x10000, size: 0x1000, bo: a, bo_offset: 0 })
            .unwrap();
        k.vm_bind(&VmOp::Unmap { va: 0x10000, size: 0x1000 }).unwrap();
        assert!(k.live_mappings().is_empty());
    }

    #[test]
    fn writes_through_mmap_are_visible_through_the_vm() {
        let k = SoftKernel::new(0x7212);
        let bo = k.bo_alloc(0x1000, BoAllocFlags::empty()).unwrap();
        let ptr = k.bo_mmap(bo).unwrap();
        unsafe {
            ptr.as_ptr().add(8).write(0xAB);
        }
        k.vm_bind(&VmOp::Map { va: 0x40000, size: 0x1000, bo, bo_offset: 0 })
            .unwrap();
        assert_eq!(k.read_va(0x40008, 1), Some(vec![0xAB]));
        unsafe { k.bo_munmap(bo, ptr) };
    }

    #[test]
    fn faults_fire_after_skipped_calls() {
        let k = SoftKernel::new(0x7212);
        k.inject_fault(FaultPoint::BoAlloc, 1);
        assert!(k.bo_alloc(0x1000, BoAllocFlags::empty()).is_ok());
        assert!(k.bo_alloc(0x1000, BoAllocFlags::empty()).unwrap_err().is_out_of_memory());
        assert!(k.bo_alloc(0x1000, BoAllocFlags::empty()).is_ok());
    }

    #[test]
    fn no_mmap_buffers_cannot_be_mapped() {
        let k = SoftKernel::new(0x7212);
        let bo = k
            .bo_alloc(128 << 20, BoAllocFlags::NO_MMAP | BoAllocFlags::ALLOC_ON_FAULT)
            .unwrap();
        assert_eq!(k.bo_mmap(bo).unwrap_err().errno, KernelError::EINVAL);
    }
}
