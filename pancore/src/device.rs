use crate::{
    caps::Capabilities,
    command_buffer::CommandBuffer,
    config::{DebugFlags, DriverConfig},
    event::Event,
    hw::RendererState,
    memory::{Allocator, Bo, BoFlags, BoScope, CaptureContext, MemoryStats},
    queue::Queue,
    Error,
};
use pankmod::{BoHandle, KernelDevice};
use std::{fmt, mem::size_of, sync::Arc};
use tracing::{info, trace_span};

/// Supported sample counts, in the order their patterns are stored.
const SAMPLE_COUNTS: [u32; 5] = [1, 2, 4, 8, 16];
/// Bytes of one sample pattern: 16 positions of two floats.
const SAMPLE_PATTERN_SIZE: u64 = 16 * 8;
/// Offset of the preload renderer state in the sample-position buffer object.
const PRELOAD_RSD_OFFSET: u64 = 0x400;

/// Sample positions in 1/16th of a pixel.
#[rustfmt::skip]
const SAMPLE_PATTERNS: [&[(u8, u8)]; 5] = [
    &[(8, 8)],
    &[(12, 12), (4, 4)],
    &[(6, 2), (14, 6), (2, 10), (10, 14)],
    &[(9, 5), (7, 11), (13, 9), (5, 3), (3, 13), (1, 7), (11, 15), (15, 1)],
    &[
        (9, 9), (7, 5), (5, 10), (12, 7), (3, 6), (10, 13), (13, 11), (11, 3),
        (6, 14), (8, 1), (4, 2), (2, 12), (0, 8), (15, 4), (14, 15), (1, 0),
    ],
];

/// The GPU device: kernel connection, GPU memory allocator and device-wide buffer objects.
pub struct Device {
    // dropped before the allocator
    tiler_heap: Arc<Bo>,
    sample_positions: Arc<Bo>,
    preload_rsd: Option<u64>,
    allocator: Arc<Allocator>,
    caps: Capabilities,
    config: DriverConfig,
}

impl Device {
    /// Opens the device, with capabilities derived from the kernel-reported properties.
    pub fn new(kernel: Arc<dyn KernelDevice>, config: DriverConfig) -> Result<Arc<Device>, Error> {
        let caps = Capabilities::from_props(&kernel.props())?;
        Device::with_capabilities(kernel, config, caps)
    }

    /// Opens the device with an explicit capability table.
    pub fn with_capabilities(
        kernel: Arc<dyn KernelDevice>,
        config: DriverConfig,
        caps: Capabilities,
    ) -> Result<Arc<Device>, Error> {
        let _span = trace_span!("device_init", gpu_id = caps.gpu_id).entered();
        if config.debug.contains(DebugFlags::STARTUP) {
            info!(
                "GPU {:#x}: arch v{}, {} cores, features {:?}",
                caps.gpu_id, caps.arch, caps.core_count, caps.features
            );
            info!("driver configuration: {:?}", config);
        }

        let capture = if config.debug.intersects(DebugFlags::TRACE | DebugFlags::DUMP) {
            Some(CaptureContext::new())
        } else {
            None
        };
        let allocator = Allocator::new(kernel, &config, capture)?;

        // everything below is released in reverse order if a later step fails
        let tiler_heap = allocator.create_bo(
            config.tiler_heap_size,
            BoFlags::NO_MMAP | BoFlags::ALLOC_ON_FAULT,
            BoScope::Device,
        )?;
        let mut sample_positions = allocator.create_bo(0x1000, BoFlags::empty(), BoScope::Device)?;
        write_sample_patterns(&mut sample_positions)?;

        let preload_rsd = if caps.has(crate::caps::Features::FRAME_SHADER_PRELOAD) {
            None
        } else {
            sample_positions.write_pod(PRELOAD_RSD_OFFSET, &RendererState::default())?;
            Some(sample_positions.gpu_address() + PRELOAD_RSD_OFFSET)
        };

        if config.debug.contains(DebugFlags::STARTUP) {
            info!(
                "tiler heap at {:#x} ({} bytes)",
                tiler_heap.gpu_address(),
                tiler_heap.size()
            );
        }

        Ok(Arc::new(Device {
            tiler_heap: Arc::new(tiler_heap),
            sample_positions: Arc::new(sample_positions),
            preload_rsd,
            allocator,
            caps,
            config,
        }))
    }

    pub fn caps(&self) -> &Capabilities {
        &self.caps
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn kernel(&self) -> &Arc<dyn KernelDevice> {
        self.allocator.kernel()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.allocator.stats()
    }

    /// Allocates memory backing an API object.
    pub fn allocate_memory(&self, size: u64, flags: BoFlags) -> Result<Arc<Bo>, Error> {
        Ok(Arc::new(self.allocator.create_bo(size, flags, BoScope::Object)?))
    }

    pub fn create_event(&self) -> Result<Arc<Event>, Error> {
        Ok(Arc::new(Event::new(self.kernel().clone())?))
    }

    pub fn create_command_buffer(self: &Arc<Self>) -> CommandBuffer {
        CommandBuffer::new(self.clone())
    }

    pub fn create_queue(self: &Arc<Self>) -> Result<Queue, Error> {
        Queue::new(self.clone())
    }

    pub fn tiler_heap(&self) -> &Arc<Bo> {
        &self.tiler_heap
    }

    /// Address of the sample pattern for `samples` samples per pixel.
    pub fn sample_positions(&self, samples: u32) -> u64 {
        let index = SAMPLE_COUNTS
            .iter()
            .position(|&n| n == samples)
            .unwrap_or(0) as u64;
        self.sample_positions.gpu_address() + index * SAMPLE_PATTERN_SIZE
    }

    /// Renderer state of the attachment preload shader, on generations that preload with
    /// tiler jobs.
    pub fn preload_rsd(&self) -> Option<u64> {
        self.preload_rsd
    }

    /// Device buffer objects referenced by every submission.
    pub fn bos(&self) -> [BoHandle; 2] {
        [self.tiler_heap.handle(), self.sample_positions.handle()]
    }
}

fn write_sample_patterns(bo: &mut Bo) -> Result<(), Error> {
    for (i, pattern) in SAMPLE_PATTERNS.iter().enumerate() {
        let positions: Vec<f32> = pattern
            .iter()
            .flat_map(|&(x, y)| [x as f32 / 16.0, y as f32 / 16.0])
            .collect();
        debug_assert!(positions.len() * size_of::<f32>() <= SAMPLE_PATTERN_SIZE as usize);
        bo.write(i as u64 * SAMPLE_PATTERN_SIZE, bytemuck::cast_slice(&positions))?;
    }
    Ok(())
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("gpu_id", &format_args!("{:#x}", self.caps.gpu_id))
            .field("arch", &self.caps.arch)
            .field("tiler_heap", &self.tiler_heap)
            .finish()
    }
}
