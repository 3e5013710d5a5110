//! `devices`: list compute platforms and their devices.

use anyhow::Result;
use clap::Args;
use interop::{describe_device, ComputeBackend, CpuBackend};

use crate::BackendKind;

/// Device listing arguments
#[derive(Args)]
pub struct DevicesArgs {
    /// Compute backend to enumerate
    #[arg(short, long, value_enum, default_value_t = BackendKind::default())]
    pub backend: BackendKind,
}

/// Execute the devices command
pub fn execute(args: DevicesArgs) -> Result<()> {
    match args.backend {
        BackendKind::Cpu => list(&mut CpuBackend::new()),
        BackendKind::Gpu => list_gpu(),
    }
}

#[cfg(feature = "gpu")]
fn list_gpu() -> Result<()> {
    list(&mut interop::WgpuBackend::new())
}

#[cfg(not(feature = "gpu"))]
fn list_gpu() -> Result<()> {
    anyhow::bail!("GPU backend requested but the `gpu` feature is not enabled");
}

fn list<B: ComputeBackend>(backend: &mut B) -> Result<()> {
    let platforms = backend.platforms()?;
    if platforms.is_empty() {
        println!("No {} platforms found", backend.name());
        return Ok(());
    }

    for platform in &platforms {
        println!("Platform: {} ({})", platform.name, platform.vendor);
        println!("  version: {}", platform.version);
        println!("  interop token: {}", platform.interop_extension);
        match backend.devices(platform.id) {
            Ok(devices) if devices.is_empty() => println!("  (no devices)"),
            Ok(devices) => {
                for device in &devices {
                    let interop = if device.supports(&platform.interop_extension) { "yes" } else { "no" };
                    println!("  - {}", describe_device(device));
                    println!("    interop: {interop}");
                }
            }
            Err(status) => println!("  device query failed: {status}"),
        }
    }
    Ok(())
}
