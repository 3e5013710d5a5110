//! Particle system runner: bootstrap, per-frame stepping and the run loop.
//!
//! [`ParticleSystem`] wires the interop components together in bootstrap
//! order (platform, device, raster, context, program, buffers, kernel) and
//! then drives one [`FrameExecutor`] frame per call to [`ParticleSystem::step`].
//! Dropping the system releases every compute object (kernel, buffers,
//! program, queue, context) before the rasterizer and its vertex buffers.

use std::time::Instant;

use interop::particle::as_bytes;
use interop::{
    select_device, select_platform, BufferHandle, CompileError, ComputeBackend, ComputeContext, DeviceInfo,
    FrameExecutor, FramePolicy, FrameReport, InitError, KernelHandle, MemAccess, ParticleRecord, ParticleSet,
    ProtocolError, RasterError, RasterSession, ResourceError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, SimulationConfig};
use crate::emitter::emit_ring;
use crate::kernels::slot;

/// Errors from bootstrapping or running a particle system.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// No usable platform, device, context or queue.
    #[error(transparent)]
    Init(#[from] InitError),
    /// The kernel program did not build.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// Buffer or kernel setup failed.
    #[error(transparent)]
    Resource(#[from] ResourceError),
    /// Ownership hand-off failed outside the frame loop.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The rasterizer failed.
    #[error(transparent)]
    Raster(#[from] RasterError),
    /// Too many frames in a row failed the protocol.
    #[error("{consecutive} consecutive frames failed; last error: {last}")]
    TooManyFailures {
        /// Failed frames since the last completed one.
        consecutive: u32,
        /// Error of the most recent failed frame.
        last: ProtocolError,
    },
}

/// How particle data reaches the rasterizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BufferMode {
    /// Position and color are rasterizer vertex buffers wrapped by compute.
    Interop,
    /// Compute-only buffers, copied into the vertex buffers after each frame.
    HostCopy,
}

/// Counters for a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunSummary {
    /// Frames attempted
    pub frames: u64,
    /// Frames that completed the full protocol
    pub completed: u64,
    /// Frames skipped with buffers still renderable
    pub skipped: u64,
    /// Frames dropped with ownership unresolved
    pub dropped: u64,
    /// Draw calls issued
    pub draws: u64,
    /// Simulated time (seconds)
    pub simulated_time: f64,
    /// Wall-clock time (seconds)
    pub wall_time: f64,
}

#[derive(Debug, Clone, Copy)]
struct Handles {
    position: BufferHandle,
    color: BufferHandle,
    velocity: BufferHandle,
}

/// A bootstrapped particle system on one compute backend and rasterizer.
pub struct ParticleSystem<B, R>
where
    B: ComputeBackend,
    R: RasterSession<ShareGroup = B::ShareGroup, SharedBuffer = B::SharedBuffer>,
{
    // Field order is drop order: compute objects go before the raster side.
    ctx: ComputeContext<B>,
    raster: R,
    position_vbo: R::SharedBuffer,
    color_vbo: R::SharedBuffer,
    handles: Handles,
    kernel: KernelHandle,
    exec: FrameExecutor,
    mode: BufferMode,
    count: usize,
    max_consecutive_failures: u32,
    draws: u64,
}

impl<B, R> ParticleSystem<B, R>
where
    B: ComputeBackend,
    R: RasterSession<ShareGroup = B::ShareGroup, SharedBuffer = B::SharedBuffer>,
{
    /// Run the full bootstrap sequence.
    ///
    /// `open_raster` is called once the device is chosen and must return a
    /// rasterizer on that device. `source` is the kernel program text.
    pub fn bootstrap<F>(
        mut backend: B,
        open_raster: F,
        config: &SimulationConfig,
        source: &str,
    ) -> Result<Self, RunnerError>
    where
        F: FnOnce(&B, &DeviceInfo) -> Result<R, RasterError>,
    {
        config.validate()?;
        info!(name = %config.name, backend = backend.name(), "bootstrapping particle system");

        let platform = select_platform(&mut backend, config.preferred_vendor.as_deref())?;
        let device = select_device(&mut backend, &platform, config.require_interop)?;
        let mut raster = open_raster(&backend, &device)?;

        let mode = if config.require_interop {
            BufferMode::Interop
        } else {
            BufferMode::HostCopy
        };
        let share = match mode {
            BufferMode::Interop => Some(raster.share_group()),
            BufferMode::HostCopy => None,
        };

        let mut ctx = ComputeContext::new(backend);
        ctx.initialize(&platform, &device, share)?;
        ctx.load_program(source)?;

        let n = config.particle_count;
        let particles = emit_ring(n, &config.emitter);
        let position_vbo = raster.create_vertex_buffer("position", as_bytes(&particles.position))?;
        let color_vbo = raster.create_vertex_buffer("color", as_bytes(&particles.color))?;

        let (position, color) = match mode {
            BufferMode::Interop => (
                ctx.allocate_interop("position", MemAccess::ReadWrite, &position_vbo)?,
                ctx.allocate_interop("color", MemAccess::ReadWrite, &color_vbo)?,
            ),
            BufferMode::HostCopy => {
                let position = ctx.allocate_dynamic("position", MemAccess::ReadWrite, n)?;
                let color = ctx.allocate_dynamic("color", MemAccess::ReadWrite, n)?;
                ctx.upload(position, 0, &particles.position)?;
                ctx.upload(color, 0, &particles.color)?;
                (position, color)
            }
        };
        let velocity = ctx.allocate_dynamic("velocity", MemAccess::ReadWrite, n)?;
        ctx.upload(velocity, 0, &particles.velocity)?;
        let spawn_position = ctx.allocate_static("spawn_position", MemAccess::ReadOnly, &particles.position, n)?;
        let spawn_velocity = ctx.allocate_static("spawn_velocity", MemAccess::ReadOnly, &particles.velocity, n)?;

        let kernel = ctx.create_kernel(&config.entry_point)?;
        ctx.bind(kernel, slot::POSITION, position)?;
        ctx.bind(kernel, slot::COLOR, color)?;
        ctx.bind(kernel, slot::VELOCITY, velocity)?;
        ctx.bind(kernel, slot::SPAWN_POSITION, spawn_position)?;
        ctx.bind(kernel, slot::SPAWN_VELOCITY, spawn_velocity)?;
        ctx.bind(kernel, slot::TIME_STEP, config.time_step)?;

        let exec = FrameExecutor::new(kernel, n, config.time_step).with_policy(FramePolicy {
            escalation_threshold: config.max_consecutive_failures,
        });

        info!(particles = n, mode = ?mode, entry = %config.entry_point, "particle system ready");

        Ok(Self {
            ctx,
            raster,
            position_vbo,
            color_vbo,
            handles: Handles {
                position,
                color,
                velocity,
            },
            kernel,
            exec,
            mode,
            count: n,
            max_consecutive_failures: config.max_consecutive_failures,
            draws: 0,
        })
    }

    /// Run one frame and draw it when the buffers are renderable.
    ///
    /// Fails with [`RunnerError::TooManyFailures`] once the configured number
    /// of consecutive frames has failed.
    pub fn step(&mut self) -> Result<FrameReport, RunnerError> {
        let report = self.exec.run_frame(&mut self.ctx, &mut self.raster);

        if report.renderable() {
            self.present(report.is_completed())?;
        }

        let consecutive = self.exec.stats().consecutive_failures;
        if consecutive >= self.max_consecutive_failures {
            if let Some(last) = report.error() {
                return Err(RunnerError::TooManyFailures {
                    consecutive,
                    last: last.clone(),
                });
            }
        }
        Ok(report)
    }

    /// Step until `max_frames` frames have run, or forever when `None`.
    pub fn run(&mut self, max_frames: Option<u64>) -> Result<RunSummary, RunnerError> {
        let start = Instant::now();
        let first = self.exec.stats().attempted;
        let mut last_log = Instant::now();

        while max_frames.map_or(true, |max| self.exec.stats().attempted - first < max) {
            self.step()?;
            if last_log.elapsed().as_secs_f64() >= 1.0 {
                let stats = self.exec.stats();
                info!(
                    frames = stats.attempted,
                    completed = stats.completed,
                    sim_time = self.exec.clock().elapsed(),
                    "progress"
                );
                last_log = Instant::now();
            }
        }

        let summary = self.summary(start.elapsed().as_secs_f64());
        info!(
            frames = summary.frames,
            completed = summary.completed,
            skipped = summary.skipped,
            dropped = summary.dropped,
            "run finished"
        );
        Ok(summary)
    }

    /// Current particle state read back from compute.
    ///
    /// Interop buffers are acquired for the read and released again, after
    /// the rasterizer has finished with them.
    pub fn snapshot(&mut self) -> Result<ParticleSet, RunnerError> {
        let shared = self.mode == BufferMode::Interop;
        if shared {
            self.raster.finish();
            self.ctx.acquire_shared()?;
        }
        let read = self.read_state();
        if shared {
            self.ctx.release_shared()?;
        }
        read
    }

    /// Whether the raster buffers are shared or copied through the host.
    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Records per buffer.
    pub fn particle_count(&self) -> usize {
        self.count
    }

    /// Frames drawn so far.
    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// The bound particle kernel.
    pub fn kernel(&self) -> KernelHandle {
        self.kernel
    }

    /// Frame executor, for state, stats and clock.
    pub fn executor(&self) -> &FrameExecutor {
        &self.exec
    }

    /// The owning compute context.
    pub fn context(&self) -> &ComputeContext<B> {
        &self.ctx
    }

    /// Mutable access to the compute context.
    pub fn context_mut(&mut self) -> &mut ComputeContext<B> {
        &mut self.ctx
    }

    /// The rasterization session.
    pub fn raster(&self) -> &R {
        &self.raster
    }

    fn summary(&self, wall_time: f64) -> RunSummary {
        let stats = self.exec.stats();
        RunSummary {
            frames: stats.attempted,
            completed: stats.completed,
            skipped: stats.skipped,
            dropped: stats.dropped,
            draws: self.draws,
            simulated_time: self.exec.clock().elapsed(),
            wall_time,
        }
    }

    fn read_state(&mut self) -> Result<ParticleSet, RunnerError> {
        Ok(ParticleSet {
            position: self.ctx.read_all(self.handles.position)?,
            velocity: self.ctx.read_all(self.handles.velocity)?,
            color: self.ctx.read_all(self.handles.color)?,
        })
    }

    fn present(&mut self, updated: bool) -> Result<(), RunnerError> {
        if self.mode == BufferMode::HostCopy && updated {
            let position: Vec<ParticleRecord> = self.ctx.read_all(self.handles.position)?;
            let color: Vec<ParticleRecord> = self.ctx.read_all(self.handles.color)?;
            self.raster.update_vertex_buffer(&self.position_vbo, as_bytes(&position))?;
            self.raster.update_vertex_buffer(&self.color_vbo, as_bytes(&color))?;
        }
        if let Err(e) = self
            .raster
            .draw_points(&self.position_vbo, &self.color_vbo, self.count)
        {
            warn!("draw failed: {e}");
            return Err(e.into());
        }
        self.draws += 1;
        Ok(())
    }
}
