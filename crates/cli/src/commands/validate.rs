//! `validate`: check a configuration and the kernel it names.

use anyhow::{bail, Context, Result};
use clap::Args;
use interop::{reflect_wgsl, ArgKind, ScalarType};
use orchestrator::kernels::slot;
use orchestrator::load_config;
use std::path::PathBuf;
use tracing::{error, info};

/// Validation arguments
#[derive(Args)]
pub struct ValidateArgs {
    /// Configuration file (JSON)
    #[arg(short, long)]
    pub config: PathBuf,
}

/// Slot layout the runner binds.
const EXPECTED: [(u32, &str); 6] = [
    (slot::POSITION, "writable buffer"),
    (slot::COLOR, "writable buffer"),
    (slot::VELOCITY, "writable buffer"),
    (slot::SPAWN_POSITION, "buffer"),
    (slot::SPAWN_VELOCITY, "buffer"),
    (slot::TIME_STEP, "f32 scalar"),
];

fn describe(kind: ArgKind) -> &'static str {
    match kind {
        ArgKind::Buffer { writable: true } => "writable buffer",
        ArgKind::Buffer { writable: false } => "buffer",
        ArgKind::Scalar(ScalarType::F32) => "f32 scalar",
        ArgKind::Scalar(ScalarType::U32) => "u32 scalar",
        ArgKind::Scalar(ScalarType::I32) => "i32 scalar",
    }
}

fn compatible(expected: &str, actual: ArgKind) -> bool {
    match expected {
        // A read_write binding can stand in for a read-only one.
        "buffer" => matches!(actual, ArgKind::Buffer { .. }),
        other => describe(actual) == other,
    }
}

/// Execute the validate command
pub fn execute(args: ValidateArgs) -> Result<()> {
    let (config, base_dir) =
        load_config(&args.config).with_context(|| format!("loading config {}", args.config.display()))?;
    info!(name = %config.name, "configuration is valid");

    let source = config.kernel_source(base_dir)?;
    let program = match reflect_wgsl(&source) {
        Ok(p) => p,
        Err(log) => {
            error!("kernel build log:\n{log}");
            bail!("kernel does not build");
        }
    };

    let Some(entry) = program.entry_point(&config.entry_point) else {
        let names: Vec<&str> = program.entry_points.iter().map(|e| e.name.as_str()).collect();
        bail!("entry point `{}` not found; program defines {:?}", config.entry_point, names);
    };

    println!("Kernel `{}` (workgroup {:?})", entry.name, entry.workgroup_size);
    let mut problems = Vec::new();
    for (index, expected) in EXPECTED {
        match entry.arg(index) {
            Some(arg) => {
                let name = arg.name.as_deref().unwrap_or("?");
                println!("  slot {index}: {name} ({})", describe(arg.kind));
                if !compatible(expected, arg.kind) {
                    problems.push(format!("slot {index} is a {}, expected {expected}", describe(arg.kind)));
                }
            }
            None => problems.push(format!("slot {index} missing, expected {expected}")),
        }
    }
    for extra in entry.args.iter().filter(|a| a.slot > slot::TIME_STEP) {
        problems.push(format!("slot {} is declared but never bound", extra.slot));
    }

    if !problems.is_empty() {
        for p in &problems {
            error!("{p}");
        }
        bail!("kernel layout does not match the runner ({} problem(s))", problems.len());
    }

    println!("OK: {} particles, dt = {}", config.particle_count, config.time_step);
    Ok(())
}
