//! Batches: the unit of GPU submission.
use crate::{
    event::Event,
    job::{JobChain, JobSummary},
    memory::PoolAlloc,
    render_pass::FramebufferInfo,
};
use pankmod::BoHandle;
use std::{fmt, sync::Arc};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventOpKind {
    Set,
    Reset,
    Wait,
}

/// Event operation attached to a batch boundary.
///
/// Waits apply before the jobs of the batch start, sets and resets after all of them
/// complete.
#[derive(Clone)]
pub struct EventOp {
    pub kind: EventOpKind,
    pub event: Arc<Event>,
}

impl fmt::Debug for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({:?})", self.kind, self.event.sync())
    }
}

/// Source and destination of a buffer copy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlitBos {
    pub src: BoHandle,
    pub dst: BoHandle,
}

/// A batch of jobs.
///
/// While open, a batch only accumulates jobs and per-batch descriptor allocations. Closing it
/// writes every descriptor and job to GPU memory, after which it never changes again.
pub struct Batch {
    pub(crate) chain: JobChain,
    pub(crate) jobs: Vec<JobSummary>,
    pub(crate) fragment_job: Option<u64>,
    pub(crate) event_ops: Vec<EventOp>,
    /// Framebuffer of the render pass the batch renders in.
    pub(crate) fb: Option<FramebufferInfo>,
    pub(crate) fbd: Option<PoolAlloc>,
    pub(crate) tls: Option<PoolAlloc>,
    pub(crate) tiler_context: Option<u64>,
    pub(crate) polygon_list: Option<u64>,
    /// Largest per-thread stack size of the batch's jobs.
    pub(crate) tls_size: u32,
    /// Workgroup-local storage size and instance count, for compute batches.
    pub(crate) wls_size: u32,
    pub(crate) wls_instances: u64,
    pub(crate) bos: Vec<BoHandle>,
    pub(crate) blit: Option<BlitBos>,
    pub(crate) issued: bool,
}

impl Batch {
    pub(crate) fn new(fb: Option<FramebufferInfo>) -> Batch {
        Batch {
            chain: JobChain::new(),
            jobs: vec![],
            fragment_job: None,
            event_ops: vec![],
            fb,
            fbd: None,
            tls: None,
            tiler_context: None,
            polygon_list: None,
            tls_size: 0,
            wls_size: 0,
            wls_instances: 0,
            bos: vec![],
            blit: None,
            issued: false,
        }
    }

    /// Jobs of the chain in chain order, once the batch is closed.
    pub fn jobs(&self) -> &[JobSummary] {
        &self.jobs
    }

    /// GPU address of the first job of the chain.
    pub fn head(&self) -> Option<u64> {
        self.jobs.first().map(|j| j.gpu)
    }

    /// GPU address of the fragment job, submitted separately from the chain.
    pub fn fragment_job(&self) -> Option<u64> {
        self.fragment_job
    }

    pub fn event_ops(&self) -> &[EventOp] {
        &self.event_ops
    }

    pub fn framebuffer(&self) -> Option<&FramebufferInfo> {
        self.fb.as_ref()
    }

    /// Address of the framebuffer descriptor.
    pub fn fbd(&self) -> Option<u64> {
        self.fbd.map(|a| a.gpu)
    }

    /// Address of the local storage descriptor.
    pub fn tls(&self) -> Option<u64> {
        self.tls.map(|a| a.gpu)
    }

    pub fn tiler_context(&self) -> Option<u64> {
        self.tiler_context
    }

    /// Buffer objects referenced by the jobs of the batch, not counting pool memory.
    pub fn bos(&self) -> &[BoHandle] {
        &self.bos
    }

    pub fn blit(&self) -> Option<BlitBos> {
        self.blit
    }

    pub fn is_issued(&self) -> bool {
        self.issued
    }

    pub(crate) fn has_content(&self) -> bool {
        !self.chain.is_empty() || self.fb.as_ref().map_or(false, FramebufferInfo::has_clears)
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Batch")
            .field("jobs", &self.jobs)
            .field("fragment_job", &self.fragment_job.map(|a| format!("{:#x}", a)))
            .field("event_ops", &self.event_ops)
            .field("issued", &self.issued)
            .finish()
    }
}
