//! Property tests for the per-frame ownership protocol.
//!
//! Random backend faults are injected into a run of frames; whatever happens,
//! every frame must walk a prefix of Idle -> Acquired -> Dispatched ->
//! Released -> Idle, and the kernel must never run on a buffer the
//! rasterizer owns.

use interop::cpu::{CpuOp, CpuSharedBuffer, TraceEvent};
use interop::particle::as_bytes;
use interop::{
    select_device, select_platform, ComputeContext, CpuBackend, CpuRaster, FrameExecutor, FrameOutcome,
    FrameState, MemAccess, Ownership, ParticleRecord, RasterSession, Status,
};
use proptest::prelude::*;

const SRC: &str = r#"
@group(0) @binding(0) var<storage, read_write> pos: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> color: array<vec4<f32>>;
@group(0) @binding(2) var<uniform> dt: f32;

@compute @workgroup_size(64)
fn tick(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= arrayLength(&pos)) { return; }
    pos[i].x = pos[i].x + dt;
    color[i].w = pos[i].x;
}
"#;

const CANONICAL: [FrameState; 5] = [
    FrameState::Idle,
    FrameState::Acquired,
    FrameState::Dispatched,
    FrameState::Released,
    FrameState::Idle,
];

// =============================================================================
// Fixture
// =============================================================================

struct Rig {
    ctx: ComputeContext<CpuBackend>,
    raster: CpuRaster,
    exec: FrameExecutor,
    position: CpuSharedBuffer,
    color: CpuSharedBuffer,
}

fn rig(n: usize) -> Rig {
    let mut backend = CpuBackend::new();
    backend.register_kernel("tick", |gid, args| {
        let dt = args.scalar_f32(2);
        let mut p = args.vec4(0, gid);
        p[0] += dt;
        args.set_vec4(0, gid, p);
        let mut c = args.vec4(1, gid);
        c[3] = p[0];
        args.set_vec4(1, gid, c);
    });
    let platform = select_platform(&mut backend, None).unwrap();
    let device = select_device(&mut backend, &platform, true).unwrap();
    let mut raster = backend.raster_session();
    let share = raster.share_group().clone();

    let mut ctx = ComputeContext::new(backend);
    ctx.initialize(&platform, &device, Some(&share)).unwrap();
    ctx.load_program(SRC).unwrap();

    let zeros = vec![ParticleRecord::default(); n];
    let position = raster.create_vertex_buffer("position", as_bytes(&zeros)).unwrap();
    let color = raster.create_vertex_buffer("color", as_bytes(&zeros)).unwrap();
    let pos = ctx.allocate_interop("position", MemAccess::ReadWrite, &position).unwrap();
    let col = ctx.allocate_interop("color", MemAccess::ReadWrite, &color).unwrap();

    let kernel = ctx.create_kernel("tick").unwrap();
    ctx.bind(kernel, 0, pos).unwrap();
    ctx.bind(kernel, 1, col).unwrap();
    ctx.bind(kernel, 2, 1.0f32).unwrap();

    Rig {
        ctx,
        raster,
        exec: FrameExecutor::new(kernel, n, 1.0),
        position,
        color,
    }
}

/// Fault injected before a frame, if any.
#[derive(Debug, Clone, Copy)]
enum Fault {
    None,
    Acquire,
    Dispatch,
    Release,
    Drain,
}

fn arb_fault() -> impl Strategy<Value = Fault> {
    prop_oneof![
        4 => Just(Fault::None),
        1 => Just(Fault::Acquire),
        1 => Just(Fault::Dispatch),
        1 => Just(Fault::Release),
        1 => Just(Fault::Drain),
    ]
}

fn inject(rig: &Rig, fault: Fault) {
    let plan = rig.ctx.backend().faults();
    match fault {
        Fault::None => {}
        Fault::Acquire => plan.fail_next(CpuOp::AcquireShared, Status::InvalidSharedObject),
        Fault::Dispatch => plan.fail_next(CpuOp::EnqueueKernel, Status::OutOfResources),
        Fault::Release => plan.fail_next(CpuOp::ReleaseShared, Status::InvalidOperation),
        Fault::Drain => plan.fail_next(CpuOp::Finish, Status::OutOfResources),
    }
}

/// Replays the trace and reports the first dispatch seen while the
/// rasterizer held the buffers.
fn dispatch_outside_acquire(events: &[TraceEvent]) -> Option<usize> {
    let mut acquired = false;
    for (i, event) in events.iter().enumerate() {
        match event {
            TraceEvent::Acquire(_) => acquired = true,
            TraceEvent::Release(_) => acquired = false,
            TraceEvent::Dispatch { .. } if !acquired => return Some(i),
            TraceEvent::Draw { .. } if acquired => return Some(i),
            _ => {}
        }
    }
    None
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn proptest_frames_follow_canonical_order(faults in prop::collection::vec(arb_fault(), 1..40)) {
        let mut r = rig(8);

        for fault in &faults {
            inject(&r, *fault);
            let report = r.exec.run_frame(&mut r.ctx, &mut r.raster);

            prop_assert_eq!(report.states.first(), Some(&FrameState::Idle));
            prop_assert_eq!(report.states.last(), Some(&FrameState::Idle));
            let walked = &report.states[..report.states.len() - 1];
            prop_assert!(CANONICAL.starts_with(walked), "out of order: {:?}", report.states);
            if report.is_completed() {
                prop_assert_eq!(&report.states[..], &CANONICAL[..]);
            }
            prop_assert_eq!(r.exec.state(), FrameState::Idle);

            if report.renderable() {
                r.raster.draw_points(&r.position, &r.color, 8).unwrap();
            }
        }

        let trace = r.ctx.backend().trace();
        prop_assert!(trace.violations().is_empty(), "{:?}", trace.violations());
        prop_assert_eq!(dispatch_outside_acquire(&trace.events()), None);
    }

    #[test]
    fn proptest_contents_track_executed_dispatches(faults in prop::collection::vec(arb_fault(), 1..30)) {
        let mut r = rig(4);
        for fault in &faults {
            inject(&r, *fault);
            r.exec.run_frame(&mut r.ctx, &mut r.raster);
        }
        // A dropped frame may still have run the kernel; it is never run twice.
        let dispatched = r.ctx.backend().dispatch_count() as f32;
        for record in r.raster.contents(&r.position) {
            prop_assert_eq!(record.x, dispatched);
        }
        // The clock counts kernel runs, including those of dropped frames.
        prop_assert_eq!(r.exec.clock().steps(), r.ctx.backend().dispatch_count());
        prop_assert_eq!(r.exec.clock().elapsed(), dispatched as f64);
    }

    #[test]
    fn proptest_single_fault_recovers_next_frame(fault in arb_fault()) {
        let mut r = rig(4);
        inject(&r, fault);
        let first = r.exec.run_frame(&mut r.ctx, &mut r.raster);
        let second = r.exec.run_frame(&mut r.ctx, &mut r.raster);

        prop_assert!(second.is_completed(), "after {:?}: {:?}", first.outcome, second.outcome);
        let interop = r.ctx.buffers().interop();
        for handle in interop {
            prop_assert_eq!(r.ctx.buffers().ownership(handle), Some(Ownership::Rasterizer));
        }
        if matches!(fault, Fault::None) {
            prop_assert_eq!(first.outcome, FrameOutcome::Completed);
        }
    }
}
