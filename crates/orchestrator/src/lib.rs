//! Orchestration Layer
//!
//! Host bootstrap for the particle simulation:
//! - JSON configuration loading and validation
//! - Ring emission of the initial particle set
//! - The built-in `update_particles` kernel (WGSL plus CPU twin)
//! - [`ParticleSystem`]: bootstrap, per-frame stepping and the run loop

#![warn(missing_docs)]

pub mod config;
pub mod emitter;
pub mod kernels;
pub mod runner;

pub use config::{ConfigError, EmitterConfig, SimulationConfig};
pub use runner::{BufferMode, ParticleSystem, RunSummary, RunnerError};

use interop::{CpuBackend, CpuRaster};
use std::path::Path;

/// Particle system on the CPU reference backend.
pub type CpuParticleSystem = ParticleSystem<CpuBackend, CpuRaster>;

/// Particle system on wgpu.
#[cfg(feature = "gpu")]
pub type GpuParticleSystem = ParticleSystem<interop::WgpuBackend, interop::WgpuRaster>;

/// Load a configuration file and return it with the directory that relative
/// paths in it resolve against.
pub fn load_config(config_path: &Path) -> Result<(SimulationConfig, &Path), ConfigError> {
    let config = SimulationConfig::load(config_path)?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    tracing::info!("Configuration loaded: {}", config.name);
    Ok((config, base_dir))
}

/// Bootstrap a particle system on the CPU reference backend.
///
/// The built-in kernels are registered, so the default `update_particles`
/// entry point always resolves. A custom `kernel_file` must use an entry
/// point with a registered host body.
pub fn create_cpu_system(config: &SimulationConfig, base_dir: &Path) -> Result<CpuParticleSystem, RunnerError> {
    tracing::info!("Creating CPU particle system...");
    let source = config.kernel_source(base_dir)?;
    let mut backend = CpuBackend::new();
    kernels::register_cpu_kernels(&mut backend);
    ParticleSystem::bootstrap(backend, |b, _| Ok(b.raster_session()), config, &source)
}

/// Bootstrap a particle system on the first suitable wgpu adapter.
#[cfg(feature = "gpu")]
pub fn create_gpu_system(config: &SimulationConfig, base_dir: &Path) -> Result<GpuParticleSystem, RunnerError> {
    tracing::info!("Creating GPU particle system...");
    let source = config.kernel_source(base_dir)?;
    let [width, height] = config.viewport;
    ParticleSystem::bootstrap(
        interop::WgpuBackend::new(),
        |backend, device| {
            let adapter = backend
                .adapter(device.id)
                .ok_or_else(|| interop::RasterError::BufferCreation(format!("no adapter for `{}`", device.name)))?;
            interop::WgpuRaster::new(adapter, width, height)
        },
        config,
        &source,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_system_with_builtin_kernel() {
        let mut config = SimulationConfig::named("lib");
        config.particle_count = 16;
        let mut sys = create_cpu_system(&config, Path::new(".")).unwrap();
        assert!(sys.step().unwrap().is_completed());
    }

    #[test]
    fn test_missing_kernel_file_is_config_error() {
        let mut config = SimulationConfig::named("lib");
        config.kernel_file = Some("does_not_exist.wgsl".into());
        let err = create_cpu_system(&config, Path::new("/nonexistent")).err().unwrap();
        assert!(matches!(err, RunnerError::Config(ConfigError::Io { .. })));
    }
}
