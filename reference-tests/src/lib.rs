//! Conformance suite for the compute/rasterizer handshake
//!
//! Runs the end-to-end scenarios against every available backend and
//! collects per-check results:
//! - A: a copy kernel reproduces 100 known records bit for bit
//! - B: three frames of an additive kernel on an interop buffer
//! - C: a failed acquire skips the frame and leaves the buffer untouched
//! - D: binding past the declared argument slots reports the slot index



use interop::particle::as_bytes;
use interop::{
    select_device, select_platform, BufferHandle, ComputeBackend, ComputeContext, CpuBackend, CpuRaster,
    DeviceInfo, FrameExecutor, FrameOutcome, FrameState, MemAccess, ParticleRecord, ProtocolError, RasterError,
    RasterSession, ResourceError, Status,
};

/// Copies `src` into `dst` record by record.
pub const COPY_SRC: &str = r#"
@group(0) @binding(0) var<storage, read> src: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> dst: array<vec4<f32>>;

@compute @workgroup_size(64)
fn copy(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= arrayLength(&dst)) { return; }
    dst[i] = src[i];
}
"#;

/// Adds `dt` to every component of every record.
pub const ADVANCE_SRC: &str = r#"
@group(0) @binding(0) var<storage, read_write> pos: array<vec4<f32>>;
@group(0) @binding(1) var<uniform> dt: f32;

@compute @workgroup_size(64)
fn advance(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= arrayLength(&pos)) { return; }
    pos[i] = pos[i] + vec4<f32>(dt, dt, dt, dt);
}
"#;

const CANONICAL: [FrameState; 5] = [
    FrameState::Idle,
    FrameState::Acquired,
    FrameState::Dispatched,
    FrameState::Released,
    FrameState::Idle,
];

/// The end-to-end scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    CopyKernel,
    ThreeFrames,
    AcquireFailure,
    BindOutOfRange,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::CopyKernel,
        Scenario::ThreeFrames,
        Scenario::AcquireFailure,
        Scenario::BindOutOfRange,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::CopyKernel => "A: copy kernel",
            Scenario::ThreeFrames => "B: three interop frames",
            Scenario::AcquireFailure => "C: acquire failure",
            Scenario::BindOutOfRange => "D: bind past declared slots",
        }
    }
}

/// A compute backend paired with its rasterizer, ready to run scenarios.
pub trait Rig {
    type Backend: ComputeBackend;
    type Raster: RasterSession<
        ShareGroup = <Self::Backend as ComputeBackend>::ShareGroup,
        SharedBuffer = <Self::Backend as ComputeBackend>::SharedBuffer,
    >;

    fn name(&self) -> String;

    /// Shared context on an interop-capable device with `source` loaded.
    fn open(&mut self, source: &str) -> Result<(ComputeContext<Self::Backend>, Self::Raster), String>;

    /// Make the next acquire on `ctx` fail with `status`. Returns `false`
    /// when the backend cannot inject faults.
    fn fail_next_acquire(&self, _ctx: &ComputeContext<Self::Backend>, _status: Status) -> bool {
        false
    }
}

/// Select, initialize and load a program on a shared context.
pub fn bring_up<B, R>(
    mut backend: B,
    open_raster: impl FnOnce(&B, &DeviceInfo) -> Result<R, RasterError>,
    source: &str,
) -> Result<(ComputeContext<B>, R), String>
where
    B: ComputeBackend,
    R: RasterSession<ShareGroup = B::ShareGroup, SharedBuffer = B::SharedBuffer>,
{
    let platform = select_platform(&mut backend, None).map_err(|e| e.to_string())?;
    let device = select_device(&mut backend, &platform, true).map_err(|e| e.to_string())?;
    let raster = open_raster(&backend, &device).map_err(|e| e.to_string())?;
    let share = raster.share_group().clone();
    let mut ctx = ComputeContext::new(backend);
    ctx.initialize(&platform, &device, Some(&share)).map_err(|e| e.to_string())?;
    ctx.load_program(source).map_err(|e| e.to_string())?;
    Ok((ctx, raster))
}

/// The reference backend with the scenario kernels registered.
#[derive(Default)]
pub struct CpuRig;

impl Rig for CpuRig {
    type Backend = CpuBackend;
    type Raster = CpuRaster;

    fn name(&self) -> String {
        "cpu".to_string()
    }

    fn open(&mut self, source: &str) -> Result<(ComputeContext<CpuBackend>, CpuRaster), String> {
        let mut backend = CpuBackend::new();
        backend.register_kernel("copy", |gid, args| {
            let v = args.vec4(0, gid);
            args.set_vec4(1, gid, v);
        });
        backend.register_kernel("advance", |gid, args| {
            let dt = args.scalar_f32(1);
            let v = args.vec4(0, gid);
            args.set_vec4(0, gid, [v[0] + dt, v[1] + dt, v[2] + dt, v[3] + dt]);
        });
        bring_up(backend, |b, _| Ok(b.raster_session()), source)
    }

    fn fail_next_acquire(&self, ctx: &ComputeContext<CpuBackend>, status: Status) -> bool {
        ctx.backend().faults().fail_next(interop::cpu::CpuOp::AcquireShared, status);
        true
    }
}

/// First wgpu adapter with compute support, rendering into a small target.
#[cfg(feature = "gpu")]
#[derive(Default)]
pub struct GpuRig {
    adapter_name: Option<String>,
}

#[cfg(feature = "gpu")]
impl Rig for GpuRig {
    type Backend = interop::WgpuBackend;
    type Raster = interop::WgpuRaster;

    fn name(&self) -> String {
        match &self.adapter_name {
            Some(n) => format!("gpu ({n})"),
            None => "gpu".to_string(),
        }
    }

    fn open(&mut self, source: &str) -> Result<(ComputeContext<Self::Backend>, Self::Raster), String> {
        let mut adapter_name = None;
        let opened = bring_up(
            interop::WgpuBackend::new(),
            |backend, device| {
                adapter_name = Some(device.name.clone());
                let adapter = backend
                    .adapter(device.id)
                    .ok_or_else(|| RasterError::BufferCreation(format!("no adapter for `{}`", device.name)))?;
                interop::WgpuRaster::new(adapter, 64, 64)
            },
            source,
        )?;
        self.adapter_name = adapter_name;
        Ok(opened)
    }
}

/// Result of an individual check
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Whether check passed
    pub passed: bool,
    /// Detail when the check failed
    pub message: Option<String>,
}

impl CheckResult {
    fn new(name: &str, passed: bool, failure: impl FnOnce() -> String) -> Self {
        CheckResult {
            name: name.to_string(),
            passed,
            message: (!passed).then(failure),
        }
    }
}

/// Overall verdict for one scenario on one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
    /// Setup could not complete.
    Error(String),
    /// Not applicable to this backend.
    Skipped(String),
}

/// Result of running one scenario on one backend
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub scenario: Scenario,
    pub backend: String,
    pub verdict: Verdict,
    pub checks: Vec<CheckResult>,
}

impl ScenarioResult {
    pub fn passed(&self) -> bool {
        matches!(self.verdict, Verdict::Passed | Verdict::Skipped(_))
    }

    pub fn print_summary(&self) {
        let status = match &self.verdict {
            Verdict::Passed => "PASSED".to_string(),
            Verdict::Failed => "FAILED".to_string(),
            Verdict::Error(e) => format!("ERROR ({e})"),
            Verdict::Skipped(why) => format!("SKIPPED ({why})"),
        };
        println!("\n{}", "-".repeat(80));
        println!("{} [{}]: {}", self.scenario.name(), self.backend, status);
        for check in &self.checks {
            let mark = if check.passed { "PASS" } else { "FAIL" };
            print!("  [{}] {}", mark, check.name);
            if let Some(ref msg) = check.message {
                print!(" - {}", msg);
            }
            println!();
        }
    }
}

/// Run one scenario on `rig`.
pub fn run_scenario<T: Rig>(rig: &mut T, scenario: Scenario) -> ScenarioResult {
    tracing::info!("Running {} on {}", scenario.name(), rig.name());
    let checks = match scenario {
        Scenario::CopyKernel => copy_kernel(rig),
        Scenario::ThreeFrames => three_frames(rig),
        Scenario::AcquireFailure => acquire_failure(rig),
        Scenario::BindOutOfRange => bind_out_of_range(rig),
    };
    let (verdict, checks) = match checks {
        Ok(Some(checks)) if checks.iter().all(|c| c.passed) => (Verdict::Passed, checks),
        Ok(Some(checks)) => (Verdict::Failed, checks),
        Ok(None) => (Verdict::Skipped("fault injection unavailable".to_string()), Vec::new()),
        Err(e) => (Verdict::Error(e), Vec::new()),
    };
    ScenarioResult {
        scenario,
        backend: rig.name(),
        verdict,
        checks,
    }
}

/// Run every scenario on `rig`.
pub fn run_all<T: Rig>(rig: &mut T) -> Vec<ScenarioResult> {
    Scenario::ALL.iter().map(|&s| run_scenario(rig, s)).collect()
}

type Checks = Result<Option<Vec<CheckResult>>, String>;

/// Deterministic, distinct records.
pub fn known_records(n: usize) -> Vec<ParticleRecord> {
    (0..n)
        .map(|i| {
            let f = i as f32;
            ParticleRecord::new(f * 0.125, -f, f * f * 1e-3, 1.0 / (f + 1.0))
        })
        .collect()
}

/// `records` after `frames` applications of the advance kernel.
pub fn advanced(records: &[ParticleRecord], dt: f32, frames: usize) -> Vec<ParticleRecord> {
    records
        .iter()
        .map(|r| {
            let mut v = r.to_array();
            for _ in 0..frames {
                for c in v.iter_mut() {
                    *c += dt;
                }
            }
            ParticleRecord::from(v)
        })
        .collect()
}

fn mismatches(got: &[ParticleRecord], want: &[ParticleRecord]) -> usize {
    got.iter().zip(want).filter(|(g, w)| !g.bits_eq(w)).count() + got.len().abs_diff(want.len())
}

/// Read an interop buffer through a compute acquire/release pair.
fn read_shared<B: ComputeBackend, R: RasterSession>(
    ctx: &mut ComputeContext<B>,
    raster: &mut R,
    handle: BufferHandle,
) -> Result<Vec<ParticleRecord>, String> {
    raster.finish();
    ctx.acquire_shared().map_err(|e| e.to_string())?;
    let data = ctx.read_all(handle).map_err(|e| e.to_string());
    ctx.release_shared().map_err(|e| e.to_string())?;
    data
}

struct AdvanceRig<T: Rig> {
    ctx: ComputeContext<T::Backend>,
    raster: T::Raster,
    handle: BufferHandle,
    exec: FrameExecutor,
}

fn advance_rig<T: Rig>(rig: &mut T, start: &[ParticleRecord], dt: f32) -> Result<AdvanceRig<T>, String> {
    let (mut ctx, mut raster) = rig.open(ADVANCE_SRC)?;
    let shared = raster
        .create_vertex_buffer("positions", as_bytes(start))
        .map_err(|e| e.to_string())?;
    let handle = ctx
        .allocate_interop("positions", MemAccess::ReadWrite, &shared)
        .map_err(|e| e.to_string())?;
    let kernel = ctx.create_kernel("advance").map_err(|e| e.to_string())?;
    ctx.bind(kernel, 0, handle).map_err(|e| e.to_string())?;
    ctx.bind(kernel, 1, dt).map_err(|e| e.to_string())?;
    Ok(AdvanceRig {
        ctx,
        raster,
        handle,
        exec: FrameExecutor::new(kernel, start.len(), dt),
    })
}

fn copy_kernel<T: Rig>(rig: &mut T) -> Checks {
    let (mut ctx, _raster) = rig.open(COPY_SRC)?;
    let input = known_records(100);
    let a = ctx
        .allocate_static("a", MemAccess::ReadOnly, &input, input.len())
        .map_err(|e| e.to_string())?;
    let c = ctx
        .allocate_dynamic("c", MemAccess::ReadWrite, input.len())
        .map_err(|e| e.to_string())?;
    let kernel = ctx.create_kernel("copy").map_err(|e| e.to_string())?;
    ctx.bind(kernel, 0, a).map_err(|e| e.to_string())?;
    ctx.bind(kernel, 1, c).map_err(|e| e.to_string())?;

    let dispatched = ctx.dispatch(kernel, input.len());
    let drained = ctx.finish();
    let output = ctx.read_all(c).map_err(|e| e.to_string())?;
    let bad = mismatches(&output, &input);

    Ok(Some(vec![
        CheckResult::new("dispatch and drain", dispatched.is_ok() && drained.is_ok(), || {
            format!("dispatch {dispatched:?}, finish {drained:?}")
        }),
        CheckResult::new("output length", output.len() == input.len(), || {
            format!("{} records, expected {}", output.len(), input.len())
        }),
        CheckResult::new("bit-exact copy", bad == 0, || format!("{bad} records differ")),
    ]))
}

fn three_frames<T: Rig>(rig: &mut T) -> Checks {
    let dt = 1.0 / 64.0;
    let start = known_records(32);
    let mut r = advance_rig(rig, &start, dt)?;

    let mut completed = 0;
    let mut canonical = true;
    for _ in 0..3 {
        let report = r.exec.run_frame(&mut r.ctx, &mut r.raster);
        completed += usize::from(report.is_completed());
        canonical &= report.states == CANONICAL;
    }
    let after = read_shared(&mut r.ctx, &mut r.raster, r.handle)?;
    let bad = mismatches(&after, &advanced(&start, dt, 3));
    let clock = r.exec.clock();
    let elapsed_ok = (clock.elapsed() - 3.0 * dt as f64).abs() < 1e-9;

    Ok(Some(vec![
        CheckResult::new("all frames completed", completed == 3, || format!("{completed}/3 completed")),
        CheckResult::new("canonical state sequence", canonical, || "non-canonical transitions".to_string()),
        CheckResult::new("contents advanced three steps", bad == 0, || format!("{bad} records differ")),
        CheckResult::new("clock advanced three steps", clock.steps() == 3 && elapsed_ok, || {
            format!("steps {}, elapsed {}", clock.steps(), clock.elapsed())
        }),
    ]))
}

fn acquire_failure<T: Rig>(rig: &mut T) -> Checks {
    let start = known_records(16);
    let mut r = advance_rig(rig, &start, 0.25)?;
    if !rig.fail_next_acquire(&r.ctx, Status::InvalidSharedObject) {
        return Ok(None);
    }

    let report = r.exec.run_frame(&mut r.ctx, &mut r.raster);
    let expected = FrameOutcome::Skipped(ProtocolError::AcquireFailed(Status::InvalidSharedObject));
    let skipped = report.outcome == expected;
    let stayed_idle = report.states == [FrameState::Idle] && r.exec.state() == FrameState::Idle;
    let renderable = report.renderable();
    let no_dispatch = r.exec.clock().steps() == 0;

    let after = read_shared(&mut r.ctx, &mut r.raster, r.handle)?;
    let bad = mismatches(&after, &start);
    let recovered = r.exec.run_frame(&mut r.ctx, &mut r.raster).is_completed();

    Ok(Some(vec![
        CheckResult::new("frame skipped with acquire failure", skipped, || format!("{:?}", report.outcome)),
        CheckResult::new("executor stayed idle", stayed_idle, || format!("{:?}", report.states)),
        CheckResult::new("buffers renderable", renderable, || "ownership not with rasterizer".to_string()),
        CheckResult::new("kernel not dispatched", no_dispatch, || "clock advanced".to_string()),
        CheckResult::new("contents unchanged", bad == 0, || format!("{bad} records differ")),
        CheckResult::new("next frame completes", recovered, || "fault persisted".to_string()),
    ]))
}

fn bind_out_of_range<T: Rig>(rig: &mut T) -> Checks {
    let mut r = advance_rig(rig, &known_records(8), 0.1)?;
    let extra = r
        .ctx
        .allocate_dynamic("extra", MemAccess::ReadWrite, 8)
        .map_err(|e| e.to_string())?;
    let kernel = r.ctx.create_kernel("advance").map_err(|e| e.to_string())?;
    let slots = r.ctx.kernel_slots(kernel).map(<[u32]>::to_vec);

    let slot2 = r.ctx.bind(kernel, 2, extra);
    let slot7 = r.ctx.bind(kernel, 7, 1.0f32);
    let expected = Err(ResourceError::ArgBindFailed {
        slot: 2,
        status: Status::InvalidArgIndex,
    });

    Ok(Some(vec![
        CheckResult::new("declared slots are 0 and 1", slots.as_deref() == Some(&[0, 1][..]), || {
            format!("{slots:?}")
        }),
        CheckResult::new("slot 2 rejected with InvalidArgIndex", slot2 == expected, || format!("{slot2:?}")),
        CheckResult::new(
            "error names the slot",
            matches!(&slot7, Err(e) if e.to_string().contains("argument 7")),
            || format!("{slot7:?}"),
        ),
    ]))
}
