use crate::{
    caps::{Capabilities, Features},
    hw::{JobHeader, JobType, WriteValueJobPayload, JOB_HEADER_SIZE},
    memory::Pool,
    serial::JobIndex,
    Error,
};
use std::fmt;
use tracing::trace;

/// Value written by the tiler-context initialization job.
const WRITE_VALUE_ZERO: u32 = 0x10;

/// A job of a chain, before it is written to GPU memory.
#[derive(Clone)]
struct PendingJob {
    ty: JobType,
    index: JobIndex,
    local_dep: Option<JobIndex>,
    global_dep: Option<JobIndex>,
    payload: Vec<u8>,
}

/// Description of a job of a finalized chain.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct JobSummary {
    pub ty: JobType,
    pub index: JobIndex,
    pub local_dep: Option<JobIndex>,
    pub global_dep: Option<JobIndex>,
    /// GPU address of the job descriptor.
    pub gpu: u64,
}

impl fmt::Debug for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?}{:?} deps=[{:?}, {:?}] @ {:#x}",
            self.ty, self.index, self.local_dep, self.global_dep, self.gpu
        )
    }
}

/// Builds a chain of vertex, tiler, compute and auxiliary jobs.
///
/// Jobs are kept in chain order: `add_job` appends, `inject_tiler` puts a job at the front. Nothing
/// touches GPU memory until `finalize`, which is what lets dependencies of earlier jobs be
/// patched by later injections.
#[derive(Clone, Default)]
pub struct JobChain {
    jobs: Vec<PendingJob>,
    job_index: u16,
    first_tiler: Option<JobIndex>,
    prev_tiler: Option<JobIndex>,
    write_value_index: Option<JobIndex>,
}

impl JobChain {
    pub fn new() -> JobChain {
        JobChain::default()
    }

    /// Last job index handed out.
    pub fn job_index(&self) -> u16 {
        self.job_index
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn first_tiler(&self) -> Option<JobIndex> {
        self.first_tiler
    }

    /// Index reserved for the tiler-context initialization job, if any.
    pub fn write_value_index(&self) -> Option<JobIndex> {
        self.write_value_index
    }

    fn next_index(&mut self) -> JobIndex {
        self.job_index += 1;
        JobIndex(self.job_index)
    }

    /// Appends a job to the chain and returns its index.
    ///
    /// `local_dep` is the job feeding this one. Tiler jobs are serialized through their global
    /// dependency: each waits on the previous tiler job of the chain. With
    /// `WRITE_VALUE_BEFORE_TILER`, the first tiler job instead waits on an index reserved for
    /// the tiler-context initialization job.
    pub fn add_job(
        &mut self,
        caps: &Capabilities,
        ty: JobType,
        local_dep: Option<JobIndex>,
        payload: Vec<u8>,
    ) -> JobIndex {
        let global_dep = if ty == JobType::Tiler {
            match self.prev_tiler {
                Some(prev) => Some(prev),
                None => self.reserve_write_value(caps),
            }
        } else {
            None
        };

        let index = self.next_index();
        if ty == JobType::Tiler {
            if self.first_tiler.is_none() {
                self.first_tiler = Some(index);
            }
            self.prev_tiler = Some(index);
        }
        self.jobs.push(PendingJob {
            ty,
            index,
            local_dep,
            global_dep,
            payload,
        });
        index
    }

    /// Puts a tiler job at the head of the chain and returns its index.
    ///
    /// The injected job becomes the first tiler job, and the previous first tiler job is made
    /// to wait on it.
    pub fn inject_tiler(&mut self, caps: &Capabilities, payload: Vec<u8>) -> JobIndex {
        let global_dep = self.reserve_write_value(caps);
        let index = self.next_index();
        if let Some(first) = self.first_tiler {
            if let Some(job) = self.jobs.iter_mut().find(|j| j.index == first) {
                job.global_dep = Some(index);
            }
        }
        self.first_tiler = Some(index);
        self.jobs.insert(
            0,
            PendingJob {
                ty: JobType::Tiler,
                index,
                local_dep: None,
                global_dep,
                payload,
            },
        );
        trace!("injected tiler job {:?}", index);
        index
    }

    /// Index the first tiler job waits on, reserved on first use. `None` unless the tiler
    /// context is initialized by a write-value job.
    fn reserve_write_value(&mut self, caps: &Capabilities) -> Option<JobIndex> {
        if !caps.has(Features::WRITE_VALUE_BEFORE_TILER) {
            return None;
        }
        if self.write_value_index.is_none() {
            self.write_value_index = Some(self.next_index());
        }
        self.write_value_index
    }

    /// Prepends the job initializing the tiler context at `address`, using the reserved
    /// index. Does nothing if the chain has no tiler job.
    pub fn initialize_tiler(&mut self, address: u64) {
        let index = match (self.first_tiler, self.write_value_index) {
            (Some(_), Some(index)) => index,
            _ => return,
        };
        let payload = WriteValueJobPayload {
            address,
            value_type: WRITE_VALUE_ZERO,
            _pad: 0,
            immediate: 0,
        };
        self.jobs.insert(
            0,
            PendingJob {
                ty: JobType::WriteValue,
                index,
                local_dep: None,
                global_dep: None,
                payload: bytemuck::bytes_of(&payload).to_vec(),
            },
        );
    }

    /// Writes every job to memory allocated from `pool`, linked in chain order.
    ///
    /// Returns the summaries of the jobs in chain order; the first one is the chain head.
    pub fn finalize(&self, caps: &Capabilities, pool: &mut Pool) -> Result<Vec<JobSummary>, Error> {
        let sizes = &caps.job_sizes;
        let mut allocs = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let size = match job.ty {
                JobType::Null => sizes.null,
                JobType::WriteValue => sizes.write_value,
                JobType::Compute => sizes.compute,
                JobType::Vertex => sizes.vertex,
                JobType::Tiler => sizes.tiler,
                JobType::Fragment => sizes.fragment,
            };
            allocs.push(pool.alloc(size, sizes.align)?);
        }

        let mut summaries = Vec::with_capacity(self.jobs.len());
        for (i, (job, alloc)) in self.jobs.iter().zip(&allocs).enumerate() {
            let next = allocs.get(i + 1).map_or(0, |a| a.gpu);
            let header = JobHeader::new(
                job.ty,
                job.index.0,
                [JobIndex::slot(job.local_dep), JobIndex::slot(job.global_dep)],
                next,
            );
            pool.write(alloc, 0, bytemuck::bytes_of(&header))?;
            pool.write(alloc, JOB_HEADER_SIZE as u64, &job.payload)?;
            summaries.push(JobSummary {
                ty: job.ty,
                index: job.index,
                local_dep: job.local_dep,
                global_dep: job.global_dep,
                gpu: alloc.gpu,
            });
        }
        Ok(summaries)
    }
}

impl fmt::Debug for JobChain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.jobs.iter().map(|j| (j.ty, j.index, j.local_dep, j.global_dep)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pankmod::DeviceProps;

    fn caps(gpu_prod_id: u32) -> Capabilities {
        Capabilities::from_props(&DeviceProps {
            gpu_prod_id,
            va_bits: 32,
            page_size: 4096,
            shader_present: 1,
        })
        .unwrap()
    }

    fn draw(chain: &mut JobChain, caps: &Capabilities) -> (JobIndex, JobIndex) {
        let v = chain.add_job(caps, JobType::Vertex, None, vec![]);
        let t = chain.add_job(caps, JobType::Tiler, Some(v), vec![]);
        (v, t)
    }

    #[test]
    fn tiler_jobs_are_serialized() {
        let caps = caps(0x7212);
        let mut chain = JobChain::new();
        let (v1, t1) = draw(&mut chain, &caps);
        let (v2, t2) = draw(&mut chain, &caps);
        assert_eq!((v1, t1, v2, t2), (JobIndex(1), JobIndex(2), JobIndex(3), JobIndex(4)));
        let t2_job = &chain.jobs[3];
        assert_eq!(t2_job.local_dep, Some(v2));
        assert_eq!(t2_job.global_dep, Some(t1));
        assert_eq!(chain.jobs[1].global_dep, None);
        assert_eq!(chain.write_value_index(), None);
    }

    #[test]
    fn first_tiler_waits_on_write_value_on_v5() {
        let caps = caps(0x860);
        let mut chain = JobChain::new();
        let (v, t) = draw(&mut chain, &caps);
        // the write-value index is reserved before the tiler index
        assert_eq!(v, JobIndex(1));
        assert_eq!(chain.write_value_index(), Some(JobIndex(2)));
        assert_eq!(t, JobIndex(3));
        assert_eq!(chain.jobs[1].global_dep, Some(JobIndex(2)));

        chain.initialize_tiler(0x1000_0000);
        assert_eq!(chain.jobs[0].ty, JobType::WriteValue);
        assert_eq!(chain.jobs[0].index, JobIndex(2));
    }

    #[test]
    fn injected_tiler_becomes_the_head() {
        let caps = caps(0x7212);
        let mut chain = JobChain::new();
        let (_, t) = draw(&mut chain, &caps);
        let preload = chain.inject_tiler(&caps, vec![]);
        assert_eq!(chain.jobs[0].index, preload);
        assert_eq!(chain.first_tiler(), Some(preload));
        let old_first = chain.jobs.iter().find(|j| j.index == t).unwrap();
        assert_eq!(old_first.global_dep, Some(preload));
    }
}
