//! Compute jobs and local storage sizing.
use crate::{
    caps::Capabilities,
    hw::{align_up, ComputeJobPayload, DrawDescriptor, Invocation},
    pipeline::Pipeline,
    state::{ComputeInputs, StateTables},
    Error,
};

/// Smallest workgroup-local storage allocation per workgroup instance.
const MIN_WLS_SIZE: u32 = 128;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Dispatch {
    pub workgroup_count: [u32; 3],
}

impl Dispatch {
    pub fn new(x: u32, y: u32, z: u32) -> Dispatch {
        Dispatch {
            workgroup_count: [x, y, z],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.workgroup_count.contains(&0)
    }

    pub(crate) fn inputs(&self) -> ComputeInputs {
        ComputeInputs {
            workgroup_count: self.workgroup_count,
        }
    }

    /// Invocation word for running this dispatch with `local_size` workgroups.
    pub(crate) fn invocation(&self, local_size: [u32; 3]) -> Result<Invocation, Error> {
        Invocation::pack(self.workgroup_count, local_size, false, false)
    }
}

pub(crate) fn compute_payload(
    pipeline: &Pipeline,
    invocation: Invocation,
    tables: &StateTables,
    tls: u64,
) -> ComputeJobPayload {
    ComputeJobPayload {
        invocation,
        job_task_split: invocation.workgroups_x_shift(),
        _pad: 0,
        draw: DrawDescriptor {
            renderer_state: pipeline.cs.binary,
            textures: tables.textures,
            samplers: tables.samplers,
            uniform_buffers: tables.ubos,
            push_uniforms: tables.push_constants,
            thread_storage: tls,
            ..Default::default()
        },
    }
}

/// Per-thread stack size as allocated: a power of two, at least 16 bytes, 0 if unused.
pub fn tls_size_per_thread(tls_size: u32) -> u32 {
    if tls_size == 0 {
        0
    } else {
        (align_up(tls_size as u64, 16) as u32).next_power_of_two()
    }
}

/// Stack memory for every thread of every core.
pub fn tls_total_size(tls_size: u32, caps: &Capabilities) -> u64 {
    tls_size_per_thread(tls_size) as u64 * caps.thread_tls_alloc as u64 * caps.core_count as u64
}

/// Number of workgroup instances that can have local storage allocated at once.
///
/// Each dimension is rounded up to a power of two, so a dispatch that fits in an invocation
/// word needs at most 2^32 instances.
pub fn wls_instances(workgroup_count: [u32; 3]) -> u64 {
    workgroup_count
        .iter()
        .map(|&n| (n.max(1) as u64).next_power_of_two())
        .fold(1u64, |acc, n| acc.saturating_mul(n))
}

/// Workgroup-local storage size of one instance.
pub fn wls_instance_size(wls_size: u32) -> u32 {
    wls_size.max(MIN_WLS_SIZE).next_power_of_two()
}

/// Workgroup-local storage for a dispatch on every core.
pub fn wls_total_size(wls_size: u32, workgroup_count: [u32; 3], caps: &Capabilities) -> u64 {
    if wls_size == 0 {
        return 0;
    }
    (wls_instance_size(wls_size) as u64)
        .saturating_mul(wls_instances(workgroup_count))
        .saturating_mul(caps.core_count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineLayout, ShaderInfo};
    use pankmod::DeviceProps;

    fn caps() -> Capabilities {
        Capabilities::from_props(&DeviceProps {
            gpu_prod_id: 0x7212,
            va_bits: 32,
            page_size: 4096,
            shader_present: 0x3,
        })
        .unwrap()
    }

    #[test]
    fn tls_sizes_are_rounded() {
        assert_eq!(tls_size_per_thread(0), 0);
        assert_eq!(tls_size_per_thread(1), 16);
        assert_eq!(tls_size_per_thread(100), 128);
        let caps = caps();
        assert_eq!(tls_total_size(100, &caps), 128 * 1024 * 2);
    }

    #[test]
    fn wls_sizes_are_rounded() {
        assert_eq!(wls_instances([3, 1, 5]), 4 * 8);
        assert_eq!(wls_instance_size(20), 128);
        assert_eq!(wls_instance_size(300), 512);
        assert_eq!(wls_total_size(300, [3, 1, 5], &caps()), 512 * 32 * 2);
        assert_eq!(wls_total_size(0, [3, 1, 5], &caps()), 0);
    }

    #[test]
    fn wls_instances_of_the_largest_dispatches() {
        assert_eq!(wls_instances([65535, 65535, 1]), 1 << 32);
        assert_eq!(wls_instances([u32::MAX, u32::MAX, u32::MAX]), u64::MAX);
        assert_eq!(
            wls_total_size(128, [65536, 65536, 1], &caps()),
            128 * (1 << 32) * 2
        );
    }

    #[test]
    fn compute_split_is_the_workgroup_x_shift() {
        let layout = PipelineLayout::new(vec![], 0);
        let pipeline = Pipeline::compute(layout, ShaderInfo::default(), [8, 8, 1]);
        let invocation = Dispatch::new(4, 2, 1).invocation(pipeline.local_size).unwrap();
        let payload = compute_payload(&pipeline, invocation, &StateTables::default(), 0x1000);
        assert_eq!(payload.job_task_split, 6);
        assert_eq!(payload.draw.thread_storage, 0x1000);
    }
}
