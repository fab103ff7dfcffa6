//! Per-generation capability table.
//!
//! Everything that differs between GPU generations (job descriptor sizes, render target
//! limits, chain construction rules) is described by a [`Capabilities`] value built once at
//! device creation and passed to whoever needs it.
use crate::{
    hw::{
        align_up, ComputeJobPayload, FragmentJobPayload, TilerJobPayload, VertexJobPayload,
        WriteValueJobPayload, JOB_HEADER_SIZE,
    },
    Error,
};
use bitflags::bitflags;
use pankmod::DeviceProps;
use std::mem::size_of;

bitflags! {
    pub struct Features: u32 {
        /// The first tiler job of a chain waits on a write-value job that initializes the
        /// tiler context.
        const WRITE_VALUE_BEFORE_TILER = 1 << 0;
        /// Attachment preloads are done by pre-frame shaders in the framebuffer descriptor
        /// instead of injected tiler jobs.
        const FRAME_SHADER_PRELOAD = 1 << 1;
        /// The tiler context points at a separate heap descriptor.
        const TILER_HEAP_DESCRIPTOR = 1 << 2;
    }
}

/// Allocation sizes of job descriptors, header included.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct JobSizes {
    pub null: u64,
    pub write_value: u64,
    pub vertex: u64,
    pub tiler: u64,
    pub compute: u64,
    pub fragment: u64,
    pub align: u64,
}

impl JobSizes {
    const fn new(align: u64) -> JobSizes {
        const H: usize = JOB_HEADER_SIZE;
        JobSizes {
            null: align_up(H as u64, align),
            write_value: align_up((H + size_of::<WriteValueJobPayload>()) as u64, align),
            vertex: align_up((H + size_of::<VertexJobPayload>()) as u64, align),
            tiler: align_up((H + size_of::<TilerJobPayload>()) as u64, align),
            compute: align_up((H + size_of::<ComputeJobPayload>()) as u64, align),
            fragment: align_up((H + size_of::<FragmentJobPayload>()) as u64, align),
            align,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Capabilities {
    pub gpu_id: u32,
    pub arch: u32,
    pub job_sizes: JobSizes,
    pub max_render_targets: usize,
    /// log2 of the tile size in pixels.
    pub tile_shift: u32,
    /// Largest job index usable in a chain.
    pub max_job_index: u16,
    /// Job indices consumed by a single draw.
    pub jobs_per_draw: u16,
    /// Per-core thread count used to size thread-local storage.
    pub thread_tls_alloc: u32,
    pub core_count: u32,
    pub features: Features,
}

/// Maps a GPU product id to its architecture major version.
pub fn arch_from_gpu_id(gpu_id: u32) -> u32 {
    match gpu_id {
        0x600 | 0x620 | 0x720 => 4,
        0x750 | 0x820 | 0x830 | 0x860 | 0x880 => 5,
        _ => gpu_id >> 12,
    }
}

impl Capabilities {
    /// Capabilities of the device described by `props`.
    pub fn from_props(props: &DeviceProps) -> Result<Capabilities, Error> {
        let mut caps = Capabilities::from_gpu_id(props.gpu_prod_id)?;
        caps.core_count = props.core_count().max(1);
        Ok(caps)
    }

    /// Capabilities of a GPU product, assuming a single shader core.
    pub fn from_gpu_id(gpu_id: u32) -> Result<Capabilities, Error> {
        let arch = arch_from_gpu_id(gpu_id);
        let core_count = 1;
        let caps = match arch {
            5 => Capabilities {
                gpu_id,
                arch,
                job_sizes: JobSizes::new(64),
                max_render_targets: 4,
                tile_shift: 4,
                max_job_index: u16::MAX,
                jobs_per_draw: 3,
                thread_tls_alloc: 256,
                core_count,
                features: Features::WRITE_VALUE_BEFORE_TILER,
            },
            6 | 7 => Capabilities {
                gpu_id,
                arch,
                job_sizes: JobSizes::new(128),
                max_render_targets: 8,
                tile_shift: 4,
                max_job_index: u16::MAX,
                jobs_per_draw: 2,
                thread_tls_alloc: if arch == 6 { 512 } else { 1024 },
                core_count,
                features: Features::FRAME_SHADER_PRELOAD | Features::TILER_HEAP_DESCRIPTOR,
            },
            _ => return Err(Error::UnsupportedGpu(gpu_id)),
        };
        Ok(caps)
    }

    pub fn has(&self, features: Features) -> bool {
        self.features.contains(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(gpu_prod_id: u32) -> DeviceProps {
        DeviceProps {
            gpu_prod_id,
            va_bits: 32,
            page_size: 4096,
            shader_present: 0x3,
        }
    }

    #[test]
    fn generation_table() {
        let v7 = Capabilities::from_props(&props(0x7212)).unwrap();
        assert_eq!(v7.arch, 7);
        assert_eq!(v7.max_render_targets, 8);
        assert_eq!(v7.core_count, 2);
        assert!(v7.has(Features::FRAME_SHADER_PRELOAD));
        assert_eq!(v7.job_sizes.vertex % 128, 0);

        let v5 = Capabilities::from_props(&props(0x860)).unwrap();
        assert_eq!(v5.arch, 5);
        assert!(v5.has(Features::WRITE_VALUE_BEFORE_TILER));
        assert_eq!(v5.jobs_per_draw, 3);
    }

    #[test]
    fn unsupported_generations_are_rejected() {
        assert_eq!(
            Capabilities::from_props(&props(0x720)).unwrap_err(),
            Error::UnsupportedGpu(0x720)
        );
        assert!(Capabilities::from_props(&props(0x9091)).is_err());
        assert_eq!(
            Capabilities::from_gpu_id(0x9091).unwrap_err(),
            Error::UnsupportedGpu(0x9091)
        );
    }

    #[test]
    fn v6_uses_the_v7_job_layout() {
        let v6 = Capabilities::from_gpu_id(0x6221).unwrap();
        assert_eq!(v6.arch, 6);
        assert_eq!(v6.core_count, 1);
        assert_eq!(v6.thread_tls_alloc, 512);
        assert!(v6.has(Features::TILER_HEAP_DESCRIPTOR));
    }
}
