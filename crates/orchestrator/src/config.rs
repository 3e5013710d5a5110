//! Configuration parsing and validation for particle runs

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::kernels::{PARTICLES_WGSL, UPDATE_PARTICLES};

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The JSON did not match the schema.
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// A field is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Human-readable run name
    pub name: String,
    /// Records per particle buffer
    #[serde(default = "default_particle_count")]
    pub particle_count: usize,
    /// Fixed time step bound to the kernel (seconds)
    #[serde(default = "default_time_step")]
    pub time_step: f32,
    /// Preferred platform vendor substring (`null` = first platform)
    #[serde(default = "default_vendor")]
    pub preferred_vendor: Option<String>,
    /// Share buffers with the rasterizer instead of copying through the host
    #[serde(default = "default_true")]
    pub require_interop: bool,
    /// WGSL kernel file, relative to the config file (`null` = built-in kernel)
    #[serde(default)]
    pub kernel_file: Option<String>,
    /// Kernel entry point
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// Initial particle distribution
    #[serde(default)]
    pub emitter: EmitterConfig,
    /// Stop after this many frames
    #[serde(default)]
    pub max_frames: Option<u64>,
    /// Consecutive failed frames before the run is aborted
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// Raster target size [width, height]
    #[serde(default = "default_viewport")]
    pub viewport: [u32; 2],
}

/// Ring emitter parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Ring radius range [min, max)
    pub radius: [f32; 2],
    /// Velocity given to every particle (m/s)
    pub initial_velocity: [f32; 3],
    /// RGBA color of every particle
    pub color: [f32; 4],
    /// RNG seed for radius and life
    pub seed: u64,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            radius: [0.2, 0.5],
            initial_velocity: [0.0, 0.0, 3.0],
            color: [1.0, 0.0, 0.0, 1.0],
            seed: 0,
        }
    }
}

// Default values
fn default_particle_count() -> usize {
    10_000
}

fn default_time_step() -> f32 {
    0.01
}

fn default_vendor() -> Option<String> {
    Some("NVIDIA".to_string())
}

fn default_true() -> bool {
    true
}

fn default_entry_point() -> String {
    UPDATE_PARTICLES.to_string()
}

fn default_max_failures() -> u32 {
    120
}

fn default_viewport() -> [u32; 2] {
    [800, 600]
}

impl SimulationConfig {
    /// Configuration with every default and the given name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            particle_count: default_particle_count(),
            time_step: default_time_step(),
            preferred_vendor: default_vendor(),
            require_interop: true,
            kernel_file: None,
            entry_point: default_entry_point(),
            emitter: EmitterConfig::default(),
            max_frames: None,
            max_consecutive_failures: default_max_failures(),
            viewport: default_viewport(),
        }
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parse and validate configuration from JSON text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SimulationConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.name.trim().is_empty() {
            return invalid("name must not be empty");
        }
        if self.particle_count == 0 {
            return invalid("particle_count must be positive");
        }
        if !self.time_step.is_finite() || self.time_step <= 0.0 {
            return invalid("time_step must be a positive finite number");
        }
        if self.entry_point.trim().is_empty() {
            return invalid("entry_point must not be empty");
        }
        if self.max_consecutive_failures == 0 {
            return invalid("max_consecutive_failures must be positive");
        }
        if self.max_frames == Some(0) {
            return invalid("max_frames must be positive when set");
        }
        if self.viewport[0] == 0 || self.viewport[1] == 0 {
            return invalid("viewport dimensions must be positive");
        }

        let [r_min, r_max] = self.emitter.radius;
        if !(r_min >= 0.0 && r_min < r_max && r_max.is_finite()) {
            return invalid("emitter.radius must satisfy 0 <= min < max");
        }
        let finite = self
            .emitter
            .initial_velocity
            .iter()
            .chain(self.emitter.color.iter())
            .all(|v| v.is_finite());
        if !finite {
            return invalid("emitter velocity and color must be finite");
        }

        Ok(())
    }

    /// Kernel source text: the configured file, or the built-in kernel.
    ///
    /// `base_dir` resolves a relative `kernel_file`.
    pub fn kernel_source(&self, base_dir: &Path) -> Result<String, ConfigError> {
        match &self.kernel_file {
            None => Ok(PARTICLES_WGSL.to_string()),
            Some(file) => {
                let path = base_dir.join(file);
                fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })
            }
        }
    }
}
