mod common;

use common::{init_logging, rendering, Fixture, V5, V7};
use pancore::{
    job::Draw,
    memory::{BoFlags, BoScope},
    pankmod::{FaultPoint, KernelCall, SoftKernel, VmOp},
    DebugFlags, Device, DriverConfig, Error, LoadOp,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;

fn open(kernel: &Arc<SoftKernel>) -> Result<Arc<Device>, Error> {
    Device::new(kernel.clone(), DriverConfig::default())
}

#[test]
fn unsupported_gpus_are_rejected() {
    init_logging();
    let kernel = Arc::new(SoftKernel::new(0x720));
    assert_eq!(open(&kernel).unwrap_err(), Error::UnsupportedGpu(0x720));
    assert_eq!(kernel.live_bo_count(), 0);
}

#[test]
fn startup_logging_does_not_change_initialization() {
    let f = Fixture::with_config(
        V7,
        DriverConfig {
            debug: DebugFlags::STARTUP,
            ..Default::default()
        },
    );
    assert_eq!(f.device.memory_stats().live_bos, 2);
    assert!(f.device.allocator().capture().is_none());
}

#[test]
fn failed_initialization_releases_everything() {
    init_logging();
    // tiler heap bound, sample positions fail to bind
    let kernel = Arc::new(SoftKernel::new(V7));
    kernel.inject_fault(FaultPoint::VmMap, 1);
    assert!(open(&kernel).is_err());
    assert_eq!(kernel.live_bo_count(), 0);
    assert!(kernel.live_mappings().is_empty());
    let unmaps = kernel
        .calls()
        .into_iter()
        .filter(|c| matches!(c, KernelCall::VmBind(VmOp::Unmap { .. })))
        .count();
    assert_eq!(unmaps, 1);

    // sample positions fail to allocate
    let kernel = Arc::new(SoftKernel::new(V5));
    kernel.inject_fault(FaultPoint::BoAlloc, 1);
    assert_eq!(open(&kernel).unwrap_err(), Error::DeviceOutOfMemory);
    assert_eq!(kernel.live_bo_count(), 0);
    assert!(kernel.live_mappings().is_empty());
}

#[test]
fn dropping_the_device_releases_everything() {
    let f = Fixture::new(V7);
    let Fixture { kernel, device } = f;
    {
        let f = Fixture {
            kernel: kernel.clone(),
            device: device.clone(),
        };
        let target = f.color_target(16, 16);
        let pipeline = f.graphics_pipeline();
        let event = device.create_event().unwrap();
        let queue = device.create_queue().unwrap();

        let mut cb = f.command_buffer();
        cb.bind_pipeline(&pipeline);
        cb.begin_rendering(&rendering(&target, LoadOp::Clear));
        cb.draw(&Draw {
            vertex_count: 3,
            instance_count: 1,
            ..Default::default()
        });
        cb.end_rendering();
        cb.set_event(&event);
        cb.end().unwrap();
        queue.submit(&mut [&mut cb]).unwrap();
        assert!(kernel.live_bo_count() > 2);
    }
    // command buffers, queues and events are gone, device memory stays
    assert_eq!(device.memory_stats().live_bos, 2);
    assert_eq!(kernel.live_bo_count(), 2);
    assert_eq!(kernel.live_syncobj_count(), 0);

    drop(device);
    assert_eq!(kernel.live_bo_count(), 0);
    assert!(kernel.live_mappings().is_empty());
}

#[test]
fn sample_positions_are_readable_by_the_gpu() {
    let f = Fixture::new(V7);
    let read = |samples: u32| -> (f32, f32) {
        let va = f.device.sample_positions(samples);
        let bytes = f.kernel.read_va(va, 8).unwrap();
        let pair: [f32; 2] = bytemuck::pod_read_unaligned(&bytes);
        (pair[0], pair[1])
    };
    assert_eq!(read(1), (0.5, 0.5));
    assert_eq!(read(4), (0.375, 0.125));
    assert_eq!(read(16), (0.5625, 0.5625));
    // unknown counts fall back to the single-sample pattern
    assert_eq!(f.device.sample_positions(3), f.device.sample_positions(1));
}

#[test]
fn preload_renderer_state_depends_on_the_generation() {
    let v5 = Fixture::new(V5);
    let rsd = v5.device.preload_rsd().unwrap();
    assert!(v5.kernel.read_va(rsd, 16).is_some());
    assert_eq!(v5.kernel.bo_at(rsd), Some(v5.device.bos()[1]));

    let v7 = Fixture::new(V7);
    assert!(v7.device.preload_rsd().is_none());
}

#[test]
fn tiler_heap_is_not_host_visible() {
    let f = Fixture::new(V7);
    let heap = f.device.tiler_heap();
    assert_eq!(heap.size(), DriverConfig::default().tiler_heap_size);
    assert!(heap.read(0, &mut [0; 4]).is_err());
    assert_eq!(heap.gpu_address() % 0x20_0000, 0);
}

#[test]
fn buffer_objects_never_overlap() {
    let f = Fixture::new(V7);
    let allocator = f.device.allocator();
    let (va_start, va_end) = allocator.va_range();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live = vec![];

    for _ in 0..400 {
        if !live.is_empty() && rng.gen_bool(0.4) {
            let i = rng.gen_range(0..live.len());
            live.swap_remove(i);
            continue;
        }
        let size = if rng.gen_bool(0.1) {
            rng.gen_range(0x20_0000..0x60_0000)
        } else {
            rng.gen_range(1..0x4000)
        };
        let bo = allocator
            .create_bo(size, BoFlags::NO_MMAP, BoScope::Object)
            .unwrap();
        assert!(bo.gpu_address() >= va_start);
        assert!(bo.gpu_address() + bo.size() <= va_end);
        if bo.size() >= 0x20_0000 {
            assert_eq!(bo.gpu_address() % 0x20_0000, 0);
        } else {
            assert_eq!(bo.gpu_address() % 0x1000, 0);
        }
        live.push(bo);

        let mut ranges: Vec<(u64, u64)> = live
            .iter()
            .chain([f.device.tiler_heap().as_ref()])
            .map(|bo| (bo.gpu_address(), bo.gpu_address() + bo.size()))
            .collect();
        ranges.sort();
        for w in ranges.windows(2) {
            assert!(w[0].1 <= w[1].0, "{:x?} overlaps {:x?}", w[0], w[1]);
        }
    }

    let count = live.len() as u64;
    assert_eq!(f.device.memory_stats().live_bos, count + 2);
    drop(live);
    assert_eq!(f.device.memory_stats().live_bos, 2);
    assert_eq!(f.kernel.live_bo_count(), 2);
}

#[test]
fn memory_allocation_failure_is_out_of_device_memory() {
    let f = Fixture::new(V7);
    f.kernel.inject_fault(FaultPoint::BoAlloc, 0);
    assert_eq!(
        f.device.allocate_memory(0x1000, BoFlags::empty()).unwrap_err(),
        Error::DeviceOutOfMemory
    );
    assert!(f.device.allocate_memory(0x1000, BoFlags::empty()).is_ok());
}
