//! Kernel-module interface.
//!
//! Everything the command-recording core needs from the kernel driver goes through
//! [`KernelDevice`]: buffer-object allocation, host mappings, GPU virtual-address binds,
//! sync objects and job-chain submission.
//!
//! # Handles
//!
//! Buffer objects and sync objects are identified by small integer handles allocated by the
//! kernel ([`BoHandle`], [`SyncHandle`]). Handle 0 is never returned by a kernel.
//!
//! # Virtual addresses
//!
//! The kernel never picks GPU addresses by itself: a [`VmOp::Map`] always carries the start
//! address. Address-space policy (auto-assigned addresses, reserved ranges) lives on the
//! caller's side.
//!
//! # Submissions
//!
//! A submission is the GPU address of the first job descriptor of a chain plus the list of
//! buffer objects the chain references. Jobs run in chain order; the kernel reports a single
//! success or failure for the whole submission.
use bitflags::bitflags;
use std::{fmt, ptr::NonNull};
use thiserror::Error;

mod soft;

pub use crate::soft::{FaultPoint, KernelCall, SoftKernel, SubmitRecord};

/// Handle to a kernel buffer object.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct BoHandle(pub u32);

impl fmt::Debug for BoHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bo#{}", self.0)
    }
}

/// Handle to a kernel sync object.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct SyncHandle(pub u32);

impl fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sync#{}", self.0)
    }
}

bitflags! {
    /// Buffer-object allocation flags.
    #[derive(Default)]
    pub struct BoAllocFlags: u32 {
        /// The buffer holds shader code.
        const EXECUTABLE = 1 << 0;
        /// Pages are only committed when the GPU faults on them.
        const ALLOC_ON_FAULT = 1 << 1;
        /// The buffer is never mapped on the host.
        const NO_MMAP = 1 << 2;
    }
}

bitflags! {
    /// Requirements attached to a job-chain submission.
    #[derive(Default)]
    pub struct JobRequirements: u32 {
        /// The chain is a fragment job and runs on the fragment job slot.
        const FRAGMENT = 1 << 0;
    }
}

/// A GPU virtual-memory operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VmOp {
    /// Maps `size` bytes of `bo`, starting at `bo_offset`, at GPU address `va`.
    Map {
        va: u64,
        size: u64,
        bo: BoHandle,
        bo_offset: u64,
    },
    /// Removes the mapping starting at `va`.
    Unmap { va: u64, size: u64 },
}

/// Job-chain submission.
#[derive(Clone, Debug)]
pub struct JobSubmit<'a> {
    /// GPU address of the first job in the chain.
    pub head: u64,
    pub requirements: JobRequirements,
    /// Every buffer object referenced by the chain.
    pub bos: &'a [BoHandle],
    /// Sync objects that must be signalled before the chain starts.
    pub in_syncs: &'a [SyncHandle],
    /// Sync object signalled when the chain completes.
    pub out_sync: Option<SyncHandle>,
}

/// Static device properties reported by the kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceProps {
    /// GPU product id (e.g. 0x7212 for a v7 part).
    pub gpu_prod_id: u32,
    /// Number of usable bits of GPU virtual address.
    pub va_bits: u32,
    pub page_size: u64,
    /// Bitmask of present shader cores.
    pub shader_present: u64,
}

impl DeviceProps {
    /// End of the usable GPU virtual address range.
    pub fn va_end(&self) -> u64 {
        1u64 << self.va_bits
    }

    pub fn core_count(&self) -> u32 {
        self.shader_present.count_ones()
    }
}

/// Error returned by the kernel, carrying the raw errno.
#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
#[error("{op} failed (errno {errno})")]
pub struct KernelError {
    pub op: &'static str,
    pub errno: i32,
}

impl KernelError {
    pub const ENOENT: i32 = 2;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ETIME: i32 = 62;

    pub const fn new(op: &'static str, errno: i32) -> KernelError {
        KernelError { op, errno }
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.errno == Self::ENOMEM
    }
}

/// Kernel driver interface.
pub trait KernelDevice: Send + Sync {
    fn props(&self) -> DeviceProps;

    /// Allocates a buffer object of `size` bytes.
    fn bo_alloc(&self, size: u64, flags: BoAllocFlags) -> Result<BoHandle, KernelError>;

    /// Releases a buffer object. It must be unmapped from the host and from the GPU VA space.
    fn bo_free(&self, bo: BoHandle);

    /// Maps the whole buffer object in host memory.
    fn bo_mmap(&self, bo: BoHandle) -> Result<NonNull<u8>, KernelError>;

    /// Removes a host mapping.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `bo_mmap` for the same buffer object, and must not be
    /// dereferenced after this call.
    unsafe fn bo_munmap(&self, bo: BoHandle, ptr: NonNull<u8>);

    /// Applies a GPU virtual-memory operation.
    fn vm_bind(&self, op: &VmOp) -> Result<(), KernelError>;

    fn syncobj_create(&self, signaled: bool) -> Result<SyncHandle, KernelError>;
    fn syncobj_destroy(&self, sync: SyncHandle);
    fn syncobj_reset(&self, sync: SyncHandle) -> Result<(), KernelError>;

    /// Replaces the fence of `dst` by the current fence of `src`.
    fn syncobj_transfer(&self, dst: SyncHandle, src: SyncHandle) -> Result<(), KernelError>;

    /// Waits until `sync` is signalled, or `timeout_ns` elapses.
    fn syncobj_wait(&self, sync: SyncHandle, timeout_ns: u64) -> Result<(), KernelError>;

    /// Submits a job chain.
    fn submit(&self, submit: &JobSubmit) -> Result<(), KernelError>;
}
