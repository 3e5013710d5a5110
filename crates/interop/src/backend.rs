//! Backend seams.
//!
//! [`ComputeBackend`] is the narrow set of compute-API calls the handshake
//! needs: enumeration, context/queue/program/kernel/buffer creation, blocking
//! copies, the acquire/release pair for rasterizer-shared buffers, dispatch and
//! queue completion. Every call reports failure as a [`Status`] code; the
//! layers above translate codes into the error categories in [`crate::error`].
//!
//! [`RasterSession`] is the rasterizer side: it owns the vertex buffers that
//! are shared with compute, and it draws them.
//!
//! Objects are referenced by opaque `Copy` ids. A backend owns the objects it
//! hands out and frees them only on the matching `release_*` call.

use thiserror::Error;

use crate::error::Status;

/// Result of a single backend call.
pub type BackendResult<T> = std::result::Result<T, Status>;

macro_rules! backend_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

backend_id!(
    /// Compute platform (a driver/vendor grouping of devices).
    PlatformId
);
backend_id!(
    /// Compute device within a platform.
    DeviceId
);
backend_id!(
    /// Compute context.
    ContextId
);
backend_id!(
    /// In-order command queue.
    QueueId
);
backend_id!(
    /// Program object (source plus, once built, an executable).
    ProgramId
);
backend_id!(
    /// Kernel instantiated from a built program.
    KernelId
);
backend_id!(
    /// Device memory object.
    MemId
);

/// Descriptive data about one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub id: PlatformId,
    pub name: String,
    pub vendor: String,
    pub version: String,
    /// Capability token a device on this platform must report to share
    /// buffers with the rasterizer.
    pub interop_extension: String,
}

/// Broad device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Gpu,
    Cpu,
    Accelerator,
    Other,
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceClass::Gpu => "GPU",
            DeviceClass::Cpu => "CPU",
            DeviceClass::Accelerator => "accelerator",
            DeviceClass::Other => "other",
        };
        f.write_str(s)
    }
}

/// Descriptive data about one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub vendor: String,
    pub class: DeviceClass,
    /// Capability tokens reported by the device.
    pub extensions: Vec<String>,
    pub max_work_group_size: u32,
    pub driver: String,
}

impl DeviceInfo {
    /// Whether the device reports `extension` in its capability list.
    pub fn supports(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }
}

/// Kernel-side access to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl MemAccess {
    pub fn kernel_writable(self) -> bool {
        !matches!(self, MemAccess::ReadOnly)
    }
}

/// Element type of a by-value kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    F32,
    U32,
    I32,
}

/// By-value kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarArg {
    F32(f32),
    U32(u32),
    I32(i32),
}

impl ScalarArg {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarArg::F32(_) => ScalarType::F32,
            ScalarArg::U32(_) => ScalarType::U32,
            ScalarArg::I32(_) => ScalarType::I32,
        }
    }

    /// Raw 32-bit pattern, as stored in device memory.
    pub fn to_bits(&self) -> u32 {
        match *self {
            ScalarArg::F32(v) => v.to_bits(),
            ScalarArg::U32(v) => v,
            ScalarArg::I32(v) => v as u32,
        }
    }
}

/// Value bound to a kernel argument slot at the backend level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawArg {
    Mem(MemId),
    Scalar(ScalarArg),
}

/// Compute API surface used by the handshake.
///
/// Shared-buffer calls take the rasterizer's types directly so that a
/// backend can only be paired with a rasterizer it knows how to share with.
pub trait ComputeBackend {
    /// Handle to the rasterizer's sharing group, passed at context creation.
    type ShareGroup;
    /// Rasterizer-owned vertex buffer that can be wrapped as compute memory.
    type SharedBuffer;

    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn platforms(&mut self) -> BackendResult<Vec<PlatformInfo>>;
    fn devices(&mut self, platform: PlatformId) -> BackendResult<Vec<DeviceInfo>>;

    /// Create a context on `device`. With `share`, buffers created by that
    /// rasterizer can later be wrapped with [`ComputeBackend::create_from_shared`].
    fn create_context(
        &mut self,
        platform: PlatformId,
        device: DeviceId,
        share: Option<&Self::ShareGroup>,
    ) -> BackendResult<ContextId>;
    /// Create an in-order queue: commands execute in submission order.
    fn create_queue(&mut self, context: ContextId, device: DeviceId) -> BackendResult<QueueId>;

    fn create_program(&mut self, context: ContextId, source: &str) -> BackendResult<ProgramId>;
    fn build_program(&mut self, program: ProgramId, device: DeviceId) -> BackendResult<()>;
    fn build_log(&mut self, program: ProgramId, device: DeviceId) -> BackendResult<String>;

    fn create_kernel(&mut self, program: ProgramId, name: &str) -> BackendResult<KernelId>;
    /// Argument slots declared by the kernel, ascending.
    fn kernel_arg_slots(&self, kernel: KernelId) -> BackendResult<Vec<u32>>;
    fn set_kernel_arg(&mut self, kernel: KernelId, slot: u32, arg: RawArg) -> BackendResult<()>;

    /// Create a device buffer of `size` bytes, optionally initialized from `init`.
    fn create_buffer(
        &mut self,
        context: ContextId,
        access: MemAccess,
        size: u64,
        init: Option<&[u8]>,
    ) -> BackendResult<MemId>;
    /// Wrap a rasterizer-owned buffer as compute memory.
    fn create_from_shared(
        &mut self,
        context: ContextId,
        access: MemAccess,
        shared: &Self::SharedBuffer,
    ) -> BackendResult<MemId>;
    fn mem_size(&self, mem: MemId) -> BackendResult<u64>;

    /// Blocking host-to-device copy at byte `offset`.
    fn write_buffer(&mut self, queue: QueueId, mem: MemId, offset: u64, data: &[u8]) -> BackendResult<()>;
    /// Blocking device-to-host copy at byte `offset`.
    fn read_buffer(&mut self, queue: QueueId, mem: MemId, offset: u64, out: &mut [u8]) -> BackendResult<()>;

    /// Move shared buffers from rasterizer to compute ownership.
    fn enqueue_acquire_shared(&mut self, queue: QueueId, mems: &[MemId]) -> BackendResult<()>;
    /// Hand shared buffers back to the rasterizer.
    fn enqueue_release_shared(&mut self, queue: QueueId, mems: &[MemId]) -> BackendResult<()>;
    /// One-dimensional dispatch over `global` work items.
    fn enqueue_kernel(&mut self, queue: QueueId, kernel: KernelId, global: usize) -> BackendResult<()>;
    /// Block until every command on the queue has completed.
    fn finish(&mut self, queue: QueueId) -> BackendResult<()>;

    fn release_mem(&mut self, mem: MemId) -> BackendResult<()>;
    fn release_kernel(&mut self, kernel: KernelId) -> BackendResult<()>;
    fn release_program(&mut self, program: ProgramId) -> BackendResult<()>;
    fn release_queue(&mut self, queue: QueueId) -> BackendResult<()>;
    fn release_context(&mut self, context: ContextId) -> BackendResult<()>;
}

/// Rasterizer failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RasterError {
    #[error("vertex buffer creation failed: {0}")]
    BufferCreation(String),
    #[error("vertex buffer update failed: {0}")]
    BufferUpdate(String),
    #[error("draw failed: {0}")]
    Draw(String),
}

/// Rasterizer side of the handshake.
pub trait RasterSession {
    type ShareGroup;
    type SharedBuffer;

    /// Sharing group to hand to [`ComputeBackend::create_context`].
    fn share_group(&self) -> &Self::ShareGroup;

    /// Create a vertex buffer holding `data` that compute may wrap.
    fn create_vertex_buffer(&mut self, label: &str, data: &[u8]) -> Result<Self::SharedBuffer, RasterError>;
    /// Overwrite the contents of a vertex buffer from the host.
    fn update_vertex_buffer(&mut self, buffer: &Self::SharedBuffer, data: &[u8]) -> Result<(), RasterError>;
    /// Block until all rasterizer commands touching shared buffers have finished.
    fn finish(&mut self);
    /// Draw `count` points from position and color buffers of 4 x f32 records.
    fn draw_points(
        &mut self,
        position: &Self::SharedBuffer,
        color: &Self::SharedBuffer,
        count: usize,
    ) -> Result<(), RasterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_bits() {
        assert_eq!(ScalarArg::F32(1.0).to_bits(), 0x3f80_0000);
        assert_eq!(ScalarArg::I32(-1).to_bits(), u32::MAX);
        assert_eq!(ScalarArg::U32(7).scalar_type(), ScalarType::U32);
    }

    #[test]
    fn test_device_supports_exact_token() {
        let dev = DeviceInfo {
            id: DeviceId(0),
            name: "dev".into(),
            vendor: "v".into(),
            class: DeviceClass::Gpu,
            extensions: vec!["khr_sharing".into()],
            max_work_group_size: 256,
            driver: String::new(),
        };
        assert!(dev.supports("khr_sharing"));
        assert!(!dev.supports("khr"));
    }
}
