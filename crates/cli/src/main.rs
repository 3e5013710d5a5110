//! Particle simulation command-line driver
//!
//! Runs the compute/rasterizer particle loop headlessly, lists compute
//! devices, and validates run configurations.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// GPU particle simulation driver
#[derive(Parser)]
#[command(name = "particles")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compute-driven particle simulation with shared rasterizer buffers", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the particle simulation
    Run(commands::run::RunArgs),
    /// List compute platforms and devices
    Devices(commands::devices::DevicesArgs),
    /// Validate a configuration and its kernel
    Validate(commands::validate::ValidateArgs),
}

/// Compute backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// wgpu adapters (requires the `gpu` feature)
    Gpu,
    /// Deterministic CPU reference backend
    Cpu,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "gpu") {
            BackendKind::Gpu
        } else {
            BackendKind::Cpu
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.to_lowercase();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("particles={level},interop={level},orchestrator={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Run(args) => commands::run::execute(args),
        Commands::Devices(args) => commands::devices::execute(args),
        Commands::Validate(args) => commands::validate::execute(args),
    }
}
