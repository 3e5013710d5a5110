//! Frame protocol throughput -- full acquire/dispatch/release cycles per second.
//!
//! Run with: cargo bench -p interop --bench frame_throughput
//! Add `--features gpu` to include wgpu adapters.

use std::time::Instant;

use interop::particle::as_bytes;
use interop::{
    select_device, select_platform, ComputeBackend, ComputeContext, CpuBackend, FrameExecutor, MemAccess,
    ParticleRecord, RasterSession,
};

const SRC: &str = r#"
@group(0) @binding(0) var<storage, read_write> pos: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> vel: array<vec4<f32>>;
@group(0) @binding(2) var<uniform> dt: f32;

@compute @workgroup_size(64)
fn integrate(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= arrayLength(&pos)) { return; }
    pos[i] = pos[i] + vel[i] * dt;
}
"#;

fn seed(n: usize) -> (Vec<ParticleRecord>, Vec<ParticleRecord>) {
    let pos = (0..n).map(|i| ParticleRecord::new(i as f32 * 1e-3, 0.0, 0.0, 1.0)).collect();
    let vel = vec![ParticleRecord::new(0.1, 0.2, 0.3, 0.0); n];
    (pos, vel)
}

/// Run `frames` frames and return (seconds, completed frames).
fn time_frames<B, R>(ctx: &mut ComputeContext<B>, raster: &mut R, n: usize, frames: usize) -> (f64, u64)
where
    B: ComputeBackend<ShareGroup = R::ShareGroup, SharedBuffer = R::SharedBuffer>,
    R: RasterSession,
{
    let (pos, vel) = seed(n);
    let shared = raster.create_vertex_buffer("pos", as_bytes(&pos)).expect("vertex buffer");
    let p = ctx.allocate_interop("pos", MemAccess::ReadWrite, &shared).expect("wrap");
    let v = ctx.allocate_static("vel", MemAccess::ReadOnly, &vel, n).expect("static");
    let k = ctx.create_kernel("integrate").expect("kernel");
    ctx.bind(k, 0, p).expect("bind pos");
    ctx.bind(k, 1, v).expect("bind vel");
    ctx.bind(k, 2, 1e-3f32).expect("bind dt");

    let mut exec = FrameExecutor::new(k, n, 1e-3);
    // Warmup
    for _ in 0..2 {
        exec.run_frame(ctx, raster);
    }

    let start = Instant::now();
    for _ in 0..frames {
        exec.run_frame(ctx, raster);
    }
    (start.elapsed().as_secs_f64(), exec.stats().completed)
}

fn print_row(backend: &str, n: usize, frames: usize, elapsed: f64, completed: u64) {
    println!(
        "{:>8} {:>10} {:>8} {:>10.3} {:>12.1} {:>10.3} {:>10}",
        backend,
        n,
        frames,
        elapsed,
        frames as f64 / elapsed,
        elapsed * 1000.0 / frames as f64,
        completed
    );
}

fn bench_cpu(configs: &[(usize, usize)]) {
    for &(n, frames) in configs {
        let mut backend = CpuBackend::new();
        backend.register_kernel("integrate", |gid, args| {
            let dt = args.scalar_f32(2);
            let p = args.vec4(0, gid);
            let v = args.vec4(1, gid);
            args.set_vec4(
                0,
                gid,
                [p[0] + v[0] * dt, p[1] + v[1] * dt, p[2] + v[2] * dt, p[3] + v[3] * dt],
            );
        });
        let platform = select_platform(&mut backend, None).expect("platform");
        let device = select_device(&mut backend, &platform, true).expect("device");
        let mut raster = backend.raster_session();
        let share = raster.share_group().clone();
        let mut ctx = ComputeContext::new(backend);
        ctx.initialize(&platform, &device, Some(&share)).expect("context");
        ctx.load_program(SRC).expect("program");

        let (elapsed, completed) = time_frames(&mut ctx, &mut raster, n, frames);
        print_row("cpu", n, frames, elapsed, completed);
    }
}

#[cfg(feature = "gpu")]
fn bench_gpu(configs: &[(usize, usize)]) {
    use interop::{WgpuBackend, WgpuRaster};

    for &(n, frames) in configs {
        let mut backend = WgpuBackend::new();
        let Ok(platform) = select_platform(&mut backend, None) else {
            println!("(no wgpu platform, skipping GPU rows)");
            return;
        };
        let Ok(device) = select_device(&mut backend, &platform, true) else {
            println!("(no interop-capable adapter, skipping GPU rows)");
            return;
        };
        let Some(adapter) = backend.adapter(device.id) else { return };
        let mut raster = WgpuRaster::new(adapter, 256, 256).expect("raster");
        let share = raster.share_group().clone();
        let mut ctx = ComputeContext::new(backend);
        ctx.initialize(&platform, &device, Some(&share)).expect("context");
        ctx.load_program(SRC).expect("program");

        let (elapsed, completed) = time_frames(&mut ctx, &mut raster, n, frames);
        print_row("wgpu", n, frames, elapsed, completed);
    }
}

fn main() {
    println!("=== Frame Protocol Throughput ===\n");
    println!(
        "{:>8} {:>10} {:>8} {:>10} {:>12} {:>10} {:>10}",
        "Backend", "Particles", "Frames", "Time (s)", "frames/s", "ms/frame", "Completed"
    );

    bench_cpu(&[(1_000, 200), (10_000, 50), (100_000, 10)]);

    #[cfg(feature = "gpu")]
    bench_gpu(&[(10_000, 200), (100_000, 100), (1_000_000, 30)]);
}
