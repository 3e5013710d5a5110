//! `run`: bootstrap a particle system and drive the frame loop.

use anyhow::{Context, Result};
use clap::Args;
use interop::{ComputeBackend, RasterSession};
use orchestrator::{create_cpu_system, load_config, ParticleSystem, RunSummary, SimulationConfig};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::BackendKind;

/// Run arguments
#[derive(Args)]
pub struct RunArgs {
    /// Configuration file (JSON); defaults apply when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of frames to run (overrides `max_frames`)
    #[arg(short, long)]
    pub frames: Option<u64>,

    /// Compute backend
    #[arg(short, long, value_enum, default_value_t = BackendKind::default())]
    pub backend: BackendKind,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execute the run command
pub fn execute(args: RunArgs) -> Result<()> {
    let (config, base_dir) = match &args.config {
        Some(path) => {
            let (config, dir) =
                load_config(path).with_context(|| format!("loading config {}", path.display()))?;
            (config, dir.to_path_buf())
        }
        None => (SimulationConfig::named("default"), PathBuf::from(".")),
    };
    let frames = args.frames.or(config.max_frames);
    info!(
        name = %config.name,
        particles = config.particle_count,
        backend = ?args.backend,
        frames = ?frames,
        "starting run"
    );

    let summary = match args.backend {
        BackendKind::Cpu => drive(create_cpu_system(&config, &base_dir)?, frames)?,
        BackendKind::Gpu => run_gpu(&config, &base_dir, frames)?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn drive<B, R>(mut system: ParticleSystem<B, R>, frames: Option<u64>) -> Result<RunSummary>
where
    B: ComputeBackend,
    R: RasterSession<ShareGroup = B::ShareGroup, SharedBuffer = B::SharedBuffer>,
{
    if let Some(device) = system.context().device() {
        info!("{}", interop::describe_device(device));
    }
    Ok(system.run(frames)?)
}

#[cfg(feature = "gpu")]
fn run_gpu(config: &SimulationConfig, base_dir: &Path, frames: Option<u64>) -> Result<RunSummary> {
    drive(orchestrator::create_gpu_system(config, base_dir)?, frames)
}

#[cfg(not(feature = "gpu"))]
fn run_gpu(_config: &SimulationConfig, _base_dir: &Path, _frames: Option<u64>) -> Result<RunSummary> {
    anyhow::bail!("GPU backend requested but the `gpu` feature is not enabled. Build with --features gpu or pass --backend cpu");
}

fn print_summary(summary: &RunSummary) {
    println!("=== Run Summary ===\n");
    println!("{:>12} {:>10} {:>10} {:>10} {:>10} {:>12} {:>12}",
        "Frames", "Completed", "Skipped", "Dropped", "Draws", "Sim time", "Wall (s)");
    println!("{:>12} {:>10} {:>10} {:>10} {:>10} {:>12.3} {:>12.3}",
        summary.frames,
        summary.completed,
        summary.skipped,
        summary.dropped,
        summary.draws,
        summary.simulated_time,
        summary.wall_time);
    if summary.wall_time > 0.0 {
        println!("\n{:.1} frames/s", summary.frames as f64 / summary.wall_time);
    }
}
