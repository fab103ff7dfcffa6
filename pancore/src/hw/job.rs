use bytemuck::{Pod, Zeroable};

use super::{desc::DrawDescriptor, invocation::Invocation};

pub const JOB_HEADER_SIZE: usize = 32;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum JobType {
    Null = 1,
    WriteValue = 2,
    Compute = 4,
    Vertex = 5,
    Tiler = 7,
    Fragment = 9,
}

impl JobType {
    pub fn from_raw(raw: u32) -> Option<JobType> {
        match raw {
            1 => Some(JobType::Null),
            2 => Some(JobType::WriteValue),
            4 => Some(JobType::Compute),
            5 => Some(JobType::Vertex),
            7 => Some(JobType::Tiler),
            9 => Some(JobType::Fragment),
            _ => None,
        }
    }
}

/// Header shared by every job descriptor.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct JobHeader {
    pub exception_status: u32,
    pub first_incomplete_task: u32,
    pub fault_pointer: u64,
    /// Job type in bits 1..8, job index in bits 16..32.
    pub control: u32,
    /// Two dependency slots holding job indices, 0 meaning no dependency.
    pub dependencies: u32,
    pub next: u64,
}

impl JobHeader {
    pub fn new(ty: JobType, index: u16, dependencies: [u16; 2], next: u64) -> JobHeader {
        JobHeader {
            control: (ty as u32) << 1 | (index as u32) << 16,
            dependencies: dependencies[0] as u32 | (dependencies[1] as u32) << 16,
            next,
            ..Default::default()
        }
    }

    pub fn job_type(&self) -> Option<JobType> {
        JobType::from_raw((self.control >> 1) & 0x7f)
    }

    pub fn index(&self) -> u16 {
        (self.control >> 16) as u16
    }

    pub fn dependencies(&self) -> [u16; 2] {
        [self.dependencies as u16, (self.dependencies >> 16) as u16]
    }
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct VertexJobPayload {
    pub invocation: Invocation,
    pub draw: DrawDescriptor,
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct PrimitiveDescriptor {
    pub draw_mode: u32,
    /// Index size in bytes, 0 for non-indexed draws.
    pub index_type: u32,
    pub index_count: u32,
    pub base_vertex_offset: i32,
    pub indices: u64,
    pub line_width: f32,
    pub _pad: u32,
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct TilerJobPayload {
    pub invocation: Invocation,
    pub primitive: PrimitiveDescriptor,
    pub tiler_context: u64,
    pub draw: DrawDescriptor,
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct ComputeJobPayload {
    pub invocation: Invocation,
    pub job_task_split: u32,
    pub _pad: u32,
    pub draw: DrawDescriptor,
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct FragmentJobPayload {
    /// Tile coordinates, x in the low half, y in the high half.
    pub bound_min: u32,
    pub bound_max: u32,
    pub framebuffer: u64,
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct WriteValueJobPayload {
    pub address: u64,
    pub value_type: u32,
    pub _pad: u32,
    pub immediate: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(std::mem::size_of::<JobHeader>(), JOB_HEADER_SIZE);
        let h = JobHeader::new(JobType::Tiler, 513, [2, 0], 0x1000);
        assert_eq!(h.job_type(), Some(JobType::Tiler));
        assert_eq!(h.index(), 513);
        assert_eq!(h.dependencies(), [2, 0]);
        assert_eq!(h.next, 0x1000);
    }
}
