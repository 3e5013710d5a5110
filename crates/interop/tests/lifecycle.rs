//! Bootstrap and teardown through the public API: selection, context
//! creation, program loading, buffer allocation and reverse-order release.

use interop::cpu::{CpuDeviceSpec, CpuOp, CpuPlatformSpec, TraceEvent};
use interop::{
    select_device, select_platform, CompileError, ComputeContext, CpuBackend, DeviceClass, InitError, MemAccess,
    Ownership, ParticleRecord, RasterSession, ResourceError, Status, RECORD_SIZE,
};

const NOOP: &str = r#"
@group(0) @binding(0) var<storage, read_write> data: array<vec4<f32>>;

@compute @workgroup_size(64)
fn touch(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= arrayLength(&data)) { return; }
    data[id.x].w = 1.0;
}
"#;

fn initialized() -> ComputeContext<CpuBackend> {
    let mut backend = CpuBackend::new();
    let platform = select_platform(&mut backend, None).unwrap();
    let device = select_device(&mut backend, &platform, false).unwrap();
    let mut ctx = ComputeContext::new(backend);
    ctx.initialize(&platform, &device, None).unwrap();
    ctx
}

#[test]
fn preferred_vendor_wins_over_enumeration_order() {
    let mut backend = CpuBackend::with_platforms(vec![
        CpuPlatformSpec::new("Portable", "Generic Software", vec![CpuDeviceSpec::cpu("llvm")]),
        CpuPlatformSpec::new(
            "Discrete",
            "NVIDIA Corporation",
            vec![CpuDeviceSpec::cpu("host"), CpuDeviceSpec::gpu("rtx", true)],
        ),
    ]);

    let platform = select_platform(&mut backend, Some("NVIDIA")).unwrap();
    assert_eq!(platform.name, "Discrete");
    let device = select_device(&mut backend, &platform, true).unwrap();
    assert_eq!(device.name, "rtx");
    assert_eq!(device.class, DeviceClass::Gpu);

    // Case-sensitive: no match falls back to the first platform.
    let fallback = select_platform(&mut backend, Some("nvidia")).unwrap();
    assert_eq!(fallback.name, "Portable");
}

#[test]
fn platform_without_gpu_reports_no_device() {
    let mut backend = CpuBackend::with_platforms(vec![CpuPlatformSpec::new(
        "Portable",
        "Generic Software",
        vec![CpuDeviceSpec::cpu("llvm")],
    )]);
    let platform = select_platform(&mut backend, None).unwrap();
    let err = select_device(&mut backend, &platform, false).unwrap_err();
    assert!(matches!(err, InitError::NoDeviceFound { .. }), "{err:?}");

    let mut empty = CpuBackend::with_platforms(vec![CpuPlatformSpec::new("Empty", "Nobody", vec![])]);
    let platform = select_platform(&mut empty, None).unwrap();
    assert!(matches!(
        select_device(&mut empty, &platform, false),
        Err(InitError::NoDeviceFound { .. })
    ));

    let mut none = CpuBackend::with_platforms(vec![]);
    assert_eq!(select_platform(&mut none, None).unwrap_err(), InitError::NoPlatformFound);
}

#[test]
fn interop_requirement_filters_devices() {
    let mut backend = CpuBackend::with_platforms(vec![CpuPlatformSpec::new(
        "Mixed",
        "Vendor",
        vec![CpuDeviceSpec::gpu("plain", false), CpuDeviceSpec::gpu("sharing", true)],
    )]);
    let platform = select_platform(&mut backend, None).unwrap();
    assert_eq!(select_device(&mut backend, &platform, false).unwrap().name, "plain");
    assert_eq!(select_device(&mut backend, &platform, true).unwrap().name, "sharing");
}

#[test]
fn program_errors_before_and_after_initialize() {
    let mut cold = ComputeContext::new(CpuBackend::new());
    assert_eq!(cold.load_program(NOOP), Err(CompileError::NotInitialized));
    assert!(!cold.has_program());

    let mut ctx = initialized();
    assert_eq!(ctx.load_program(""), Err(CompileError::EmptySource));

    match ctx.load_program("@compute fn broken( {") {
        Err(CompileError::BuildFailed { status, log }) => {
            assert_eq!(status, Status::BuildProgramFailure);
            assert!(!log.is_empty());
        }
        other => panic!("expected BuildFailed, got {other:?}"),
    }
    assert!(!ctx.has_program());

    ctx.load_program(NOOP).unwrap();
    assert!(ctx.has_program());
}

#[test]
fn zero_count_buffers_are_rejected() {
    let mut ctx = initialized();
    assert_eq!(
        ctx.allocate_dynamic("empty", MemAccess::ReadWrite, 0),
        Err(ResourceError::ZeroCount { role: "dynamic" })
    );
    assert_eq!(
        ctx.allocate_static("empty", MemAccess::ReadOnly, &[], 0),
        Err(ResourceError::ZeroCount { role: "static" })
    );
    assert_eq!(ctx.buffers().live_count(), 0);
}

#[test]
fn byte_size_is_count_times_record_size() {
    let mut ctx = initialized();
    for count in [1usize, 7, 64, 1000] {
        let h = ctx.allocate_dynamic("d", MemAccess::ReadWrite, count).unwrap();
        assert_eq!(ctx.buffers().byte_size(h), Some((count * RECORD_SIZE) as u64));
        assert_eq!(ctx.read_all(h).unwrap().len(), count);
    }
}

#[test]
fn double_release_is_a_no_op() {
    let mut ctx = initialized();
    let h = ctx.allocate_dynamic("d", MemAccess::ReadWrite, 4).unwrap();
    let live = ctx.backend().live_buffers();

    ctx.release_buffer(h).unwrap();
    assert_eq!(ctx.backend().live_buffers(), live - 1);
    ctx.release_buffer(h).unwrap();
    assert_eq!(ctx.backend().live_buffers(), live - 1);
    assert!(!ctx.buffers().is_live(h));

    assert_eq!(ctx.read_all(h), Err(ResourceError::BufferReleased(h)));
}

#[test]
fn upload_out_of_range_is_rejected() {
    let mut ctx = initialized();
    let h = ctx.allocate_dynamic("d", MemAccess::ReadWrite, 4).unwrap();
    let three = vec![ParticleRecord::new(1.0, 2.0, 3.0, 4.0); 3];
    ctx.upload(h, 1, &three).unwrap();
    assert!(matches!(
        ctx.upload(h, 2, &three),
        Err(ResourceError::SizeMismatch { .. })
    ));
    let back = ctx.read(h, 1, 3).unwrap();
    assert!(back.iter().all(|r| r.bits_eq(&three[0])));
}

#[test]
fn interop_buffer_starts_with_rasterizer_and_rejects_host_access() {
    let mut backend = CpuBackend::new();
    let platform = select_platform(&mut backend, None).unwrap();
    let device = select_device(&mut backend, &platform, true).unwrap();
    let mut raster = backend.raster_session();
    let share = raster.share_group().clone();
    let mut ctx = ComputeContext::new(backend);
    ctx.initialize(&platform, &device, Some(&share)).unwrap();
    assert!(ctx.is_shared());

    let bytes = vec![0u8; 10 * RECORD_SIZE];
    let shared = raster.create_vertex_buffer("color", &bytes).unwrap();
    let h = ctx.allocate_interop("color", MemAccess::ReadWrite, &shared).unwrap();
    assert_eq!(ctx.buffers().count(h), Some(10));
    assert_eq!(ctx.buffers().ownership(h), Some(Ownership::Rasterizer));
    assert!(matches!(ctx.read_all(h), Err(ResourceError::NotComputeOwned { .. })));

    let odd = raster.create_vertex_buffer("odd", &[0u8; 20]).unwrap();
    assert_eq!(
        ctx.allocate_interop("odd", MemAccess::ReadWrite, &odd),
        Err(ResourceError::InteropWrapFailed(Status::InvalidBufferSize))
    );
}

#[test]
fn failed_queue_creation_releases_context() {
    let mut backend = CpuBackend::new();
    let platform = select_platform(&mut backend, None).unwrap();
    let device = select_device(&mut backend, &platform, false).unwrap();
    backend.faults().fail_next(CpuOp::CreateQueue, Status::OutOfResources);

    let mut ctx = ComputeContext::new(backend);
    assert_eq!(
        ctx.initialize(&platform, &device, None),
        Err(InitError::QueueCreationFailed(Status::OutOfResources))
    );
    assert!(!ctx.is_initialized());
    assert_eq!(ctx.backend().live_contexts(), 0);

    ctx.initialize(&platform, &device, None).unwrap();
    assert_eq!(ctx.backend().live_contexts(), 1);
}

#[test]
fn drop_releases_in_reverse_dependency_order() {
    let mut ctx = initialized();
    ctx.load_program(NOOP).unwrap();
    let a = ctx.allocate_dynamic("a", MemAccess::ReadWrite, 8).unwrap();
    ctx.allocate_dynamic("b", MemAccess::ReadOnly, 8).unwrap();
    let k = ctx.create_kernel("touch").unwrap();
    ctx.bind(k, 0, a).unwrap();

    let trace = ctx.backend().trace();
    trace.clear();
    drop(ctx);

    let released: Vec<&'static str> = trace
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TraceEvent::Released(kind) => Some(kind),
            _ => None,
        })
        .collect();
    assert_eq!(released, vec!["kernel", "mem", "mem", "program", "queue", "context"]);
}
