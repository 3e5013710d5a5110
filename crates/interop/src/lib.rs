//! Compute/rasterizer buffer handshake for GPU-resident particle simulation.
//!
//! A compute kernel writes particle buffers that a rasterizer draws directly,
//! without a round trip through host memory. This crate owns the handshake
//! between the two runtimes:
//!
//! # Modules
//! - [`device`] -- platform and device selection (vendor preference, interop filter).
//! - [`context`] -- [`ComputeContext`]: single owner of context, queue, program,
//!   kernels and buffers; program loading with build logs.
//! - [`buffers`] -- shared buffer registry: static, dynamic and interop buffers,
//!   per-buffer ownership tagging.
//! - [`binder`] -- kernel creation and argument binding.
//! - [`frame`] -- [`FrameExecutor`]: the per-frame acquire/dispatch/release protocol.
//! - [`error`] -- [`Status`] codes and the error categories built on them.
//! - [`backend`] -- the [`ComputeBackend`] and [`RasterSession`] seams.
//! - [`program`] -- WGSL reflection of kernel entry points and argument slots.
//! - [`particle`] -- the 16-byte particle record shared by every buffer.
//! - [`cpu`] -- deterministic host-memory backend with fault injection.
//! - `gpu` (feature `gpu`) -- wgpu compute backend and headless point rasterizer.
//!
//! # Typical bootstrap
//! select platform -> select device -> [`ComputeContext::initialize`] ->
//! [`ComputeContext::load_program`] -> `allocate_*` / `upload` ->
//! [`ComputeContext::create_kernel`] / [`ComputeContext::bind`] ->
//! [`FrameExecutor::run_frame`] once per rendered frame.

pub mod backend;
pub mod binder;
pub mod buffers;
pub mod context;
pub mod cpu;
pub mod device;
pub mod error;
pub mod frame;
pub mod particle;
pub mod program;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use backend::{
    ComputeBackend, DeviceClass, DeviceInfo, MemAccess, PlatformInfo, RasterError, RasterSession, ScalarArg,
    ScalarType,
};
pub use binder::{KernelArg, KernelHandle};
pub use buffers::{BufferHandle, BufferRegistry, BufferRole, Ownership};
pub use context::ComputeContext;
pub use cpu::{CpuBackend, CpuRaster};
pub use device::{describe_device, select_device, select_platform};
pub use error::{CompileError, Error, InitError, ProtocolError, ResourceError, Result, Status};
pub use frame::{FrameExecutor, FrameOutcome, FramePolicy, FrameReport, FrameState, FrameStats, SimClock};
pub use particle::{ParticleRecord, ParticleSet, RECORD_SIZE};
pub use program::{reflect_wgsl, ArgKind, ArgSlot, EntryPointInfo, ProgramInfo};

#[cfg(feature = "gpu")]
pub use gpu::{gpu_available, WgpuBackend, WgpuRaster};
