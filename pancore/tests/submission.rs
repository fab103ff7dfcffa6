mod common;

use common::{rendering, Fixture, V7};
use pancore::{
    job::Draw,
    memory::CaptureEvent,
    pankmod::{FaultPoint, JobRequirements, KernelCall, KernelError},
    DebugFlags, DriverConfig, Error, LoadOp,
};

fn draw_command_buffer(f: &Fixture) -> pancore::CommandBuffer {
    let target = f.color_target(32, 32);
    let pipeline = f.graphics_pipeline();
    let mut cb = f.command_buffer();
    cb.bind_pipeline(&pipeline);
    cb.begin_rendering(&rendering(&target, LoadOp::Clear));
    cb.draw(&Draw {
        vertex_count: 3,
        instance_count: 1,
        ..Default::default()
    });
    cb.end_rendering();
    cb.end().unwrap();
    cb
}

fn debug_fixture(debug: DebugFlags) -> Fixture {
    Fixture::with_config(
        V7,
        DriverConfig {
            debug,
            ..Default::default()
        },
    )
}

#[test]
fn chain_then_fragment_job() {
    let f = Fixture::new(V7);
    let mut cb = draw_command_buffer(&f);
    let queue = f.device.create_queue().unwrap();
    queue.submit(&mut [&mut cb]).unwrap();

    let batch = &cb.batches()[0];
    assert!(batch.is_issued());
    let submits = f.kernel.submits();
    assert_eq!(submits.len(), 2);

    assert_eq!(submits[0].head, batch.head().unwrap());
    assert_eq!(submits[0].requirements, JobRequirements::empty());
    assert!(submits[0].in_syncs.is_empty());
    assert_eq!(submits[0].out_sync, Some(queue.sync()));

    assert_eq!(submits[1].head, batch.fragment_job().unwrap());
    assert_eq!(submits[1].requirements, JobRequirements::FRAGMENT);
    assert_eq!(submits[1].in_syncs, vec![queue.sync()]);

    // pool memory, device memory, then what the batch references
    for submit in &submits {
        assert!(submit.bos.windows(2).all(|w| w[0] < w[1]));
        for bo in cb.pool_bos().iter().chain(f.device.bos().iter()).chain(batch.bos()) {
            assert!(submit.bos.contains(bo));
        }
    }
    queue.wait_idle().unwrap();
}

#[test]
fn empty_command_buffer_submits_nothing() {
    let f = Fixture::new(V7);
    let mut cb = f.command_buffer();
    cb.end().unwrap();
    let queue = f.device.create_queue().unwrap();
    queue.submit(&mut [&mut cb]).unwrap();
    assert!(f.kernel.submits().is_empty());
}

#[test]
fn batches_are_issued_once() {
    let f = Fixture::new(V7);
    let mut cb = draw_command_buffer(&f);
    let queue = f.device.create_queue().unwrap();
    queue.submit(&mut [&mut cb]).unwrap();
    assert_eq!(f.kernel.submits().len(), 2);

    assert_eq!(queue.submit(&mut [&mut cb]), Err(Error::AlreadyIssued));
    assert_eq!(f.kernel.submits().len(), 2);

    // re-recording makes the command buffer submittable again
    let mut cb = draw_command_buffer(&f);
    queue.submit(&mut [&mut cb]).unwrap();
    assert_eq!(f.kernel.submits().len(), 4);
}

#[test]
fn nothing_is_submitted_if_one_command_buffer_is_not_executable() {
    let f = Fixture::new(V7);
    let mut ready = draw_command_buffer(&f);
    let mut recording = f.command_buffer();
    let queue = f.device.create_queue().unwrap();

    let result = queue.submit(&mut [&mut ready, &mut recording]);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
    assert!(f.kernel.submits().is_empty());
    assert!(!ready.batches()[0].is_issued());
}

#[test]
fn invalid_command_buffers_cannot_be_submitted() {
    let f = Fixture::new(V7);
    let mut cb = f.command_buffer();
    cb.end_rendering();
    assert!(cb.end().is_err());
    let queue = f.device.create_queue().unwrap();
    assert!(matches!(
        queue.submit(&mut [&mut cb]),
        Err(Error::InvalidUsage(_))
    ));
}

#[test]
fn kernel_submit_failure_is_reported() {
    let f = Fixture::new(V7);
    let mut cb = draw_command_buffer(&f);
    let queue = f.device.create_queue().unwrap();
    f.kernel.inject_fault(FaultPoint::Submit, 1);
    match queue.submit(&mut [&mut cb]) {
        Err(Error::Kernel(err)) => assert_eq!(err.errno, KernelError::EINVAL),
        other => panic!("unexpected result: {:?}", other),
    }
    // the chain went through, the fragment job did not
    assert_eq!(f.kernel.submits().len(), 1);
    assert!(!cb.batches()[0].is_issued());
}

#[test]
fn sync_flag_waits_after_each_batch() {
    let f = debug_fixture(DebugFlags::SYNC);
    let mut cb = draw_command_buffer(&f);
    let queue = f.device.create_queue().unwrap();
    f.kernel.clear_calls();
    queue.submit(&mut [&mut cb]).unwrap();

    let calls = f.kernel.calls();
    let last = calls.last().unwrap();
    assert_eq!(*last, KernelCall::SyncWait(queue.sync()));
    assert_eq!(
        calls
            .iter()
            .filter(|c| matches!(c, KernelCall::Submit { .. }))
            .count(),
        2
    );
}

#[test]
fn trace_flag_records_submitted_chains() {
    let f = debug_fixture(DebugFlags::TRACE);
    let mut cb = draw_command_buffer(&f);
    let queue = f.device.create_queue().unwrap();
    queue.submit(&mut [&mut cb]).unwrap();

    let batch = &cb.batches()[0];
    let capture = f.device.allocator().capture().unwrap();
    let chains: Vec<_> = capture
        .events()
        .into_iter()
        .filter(|e| matches!(e, CaptureEvent::Chain { .. }))
        .collect();
    assert_eq!(
        chains,
        vec![
            CaptureEvent::Chain {
                head: batch.head().unwrap(),
                fragment: false,
            },
            CaptureEvent::Chain {
                head: batch.fragment_job().unwrap(),
                fragment: true,
            },
        ]
    );
    // every mapped buffer object is known to the capture
    let mut mapped = f.kernel.live_mappings();
    let mut captured = capture.live_mappings();
    mapped.sort();
    captured.sort();
    assert_eq!(mapped, captured);
}

#[test]
fn dump_flag_writes_the_capture() {
    let path = std::env::temp_dir().join(format!("pancore-dump-{}.json", std::process::id()));
    let f = Fixture::with_config(
        V7,
        DriverConfig {
            debug: DebugFlags::DUMP,
            dump_path: path.clone(),
            ..Default::default()
        },
    );
    let mut cb = draw_command_buffer(&f);
    let queue = f.device.create_queue().unwrap();
    queue.submit(&mut [&mut cb]).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    let mappings = json["mappings"].as_array().unwrap();
    assert!(!mappings.is_empty());
    // descriptor pool contents are snapshotted with the dump
    assert!(mappings.iter().any(|m| m["contents"].is_string()));
    // chains are only recorded with `trace`
    assert!(json["chains"].as_array().unwrap().is_empty());
}

#[test]
fn events_are_signalled_and_reset_on_submission() {
    let f = Fixture::new(V7);
    let event = f.device.create_event().unwrap();
    let queue = f.device.create_queue().unwrap();

    let mut cb = f.command_buffer();
    cb.set_event(&event);
    cb.end().unwrap();
    f.kernel.clear_calls();
    queue.submit(&mut [&mut cb]).unwrap();
    assert!(f.kernel.calls().contains(&KernelCall::SyncTransfer {
        dst: event.sync(),
        src: queue.sync(),
    }));
    assert!(event.is_set());

    let mut cb = f.command_buffer();
    cb.reset_event(&event);
    cb.end().unwrap();
    f.kernel.clear_calls();
    queue.submit(&mut [&mut cb]).unwrap();
    assert!(f
        .kernel
        .calls()
        .contains(&KernelCall::SyncReset(event.sync())));
    assert!(!event.is_set());
}
