//! Error taxonomy for the compute/rasterizer handshake.
//!
//! Backend calls fail with a [`Status`]: a closed set of backend error codes,
//! each with a stable numeric value and a mnemonic for diagnostics. The
//! operations built on top of the backend wrap those codes into one of four
//! categories:
//!
//! - [`InitError`] -- no platform, device, context or queue. Unrecoverable.
//! - [`CompileError`] -- empty source or a failed build (with the build log).
//! - [`ResourceError`] -- buffer/kernel creation, upload or argument binding.
//! - [`ProtocolError`] -- acquire/dispatch/release failures inside a frame.
//!   Recoverable: the frame is skipped and the loop retries.

use thiserror::Error;

use crate::buffers::{BufferHandle, Ownership};

/// Closed enumeration of backend error codes.
///
/// The numeric values follow the classic compute-API status table so that a
/// code printed by a driver log can be matched against the mnemonic here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
#[non_exhaustive]
pub enum Status {
    /// No device matched the query.
    DeviceNotFound = -1,
    /// The device exists but cannot be used right now.
    DeviceNotAvailable = -2,
    /// No program compiler is available for the device.
    CompilerNotAvailable = -3,
    /// Allocating device memory failed.
    MemObjectAllocationFailure = -4,
    /// The device ran out of resources (including device loss).
    OutOfResources = -5,
    /// The host ran out of memory.
    OutOfHostMemory = -6,
    /// A program failed to build; see the build log.
    BuildProgramFailure = -11,
    /// Mapping a buffer for host access failed.
    MapFailure = -12,
    /// An argument value is invalid.
    InvalidValue = -30,
    /// The platform handle is invalid.
    InvalidPlatform = -32,
    /// The device handle is invalid.
    InvalidDevice = -33,
    /// The context handle is invalid.
    InvalidContext = -34,
    /// The command queue handle is invalid.
    InvalidCommandQueue = -36,
    /// Host data pointer/length is invalid for the request.
    InvalidHostPtr = -37,
    /// The memory object handle is invalid.
    InvalidMemObject = -38,
    /// The program handle is invalid.
    InvalidProgram = -44,
    /// The program has no successfully built executable.
    InvalidProgramExecutable = -45,
    /// The kernel name does not exist in the program.
    InvalidKernelName = -46,
    /// The kernel exists but cannot be instantiated.
    InvalidKernelDefinition = -47,
    /// The kernel handle is invalid.
    InvalidKernel = -48,
    /// The argument index is outside the kernel's declared arguments.
    InvalidArgIndex = -49,
    /// The argument value does not fit the declared argument.
    InvalidArgValue = -50,
    /// The argument size does not fit the declared argument.
    InvalidArgSize = -51,
    /// The kernel's arguments are not all set.
    InvalidKernelArgs = -52,
    /// The work-group size is invalid for the kernel.
    InvalidWorkGroupSize = -54,
    /// The operation is not legal in the current state.
    InvalidOperation = -59,
    /// A shared (rasterizer-owned) object is invalid or not acquired.
    InvalidSharedObject = -60,
    /// The requested buffer size is invalid.
    InvalidBufferSize = -61,
    /// The global work size is invalid.
    InvalidGlobalWorkSize = -63,
    /// The rasterizer share group does not belong to the selected device.
    InvalidShareGroupReference = -1000,
}

impl Status {
    const ALL: [Status; 30] = [
        Status::DeviceNotFound,
        Status::DeviceNotAvailable,
        Status::CompilerNotAvailable,
        Status::MemObjectAllocationFailure,
        Status::OutOfResources,
        Status::OutOfHostMemory,
        Status::BuildProgramFailure,
        Status::MapFailure,
        Status::InvalidValue,
        Status::InvalidPlatform,
        Status::InvalidDevice,
        Status::InvalidContext,
        Status::InvalidCommandQueue,
        Status::InvalidHostPtr,
        Status::InvalidMemObject,
        Status::InvalidProgram,
        Status::InvalidProgramExecutable,
        Status::InvalidKernelName,
        Status::InvalidKernelDefinition,
        Status::InvalidKernel,
        Status::InvalidArgIndex,
        Status::InvalidArgValue,
        Status::InvalidArgSize,
        Status::InvalidKernelArgs,
        Status::InvalidWorkGroupSize,
        Status::InvalidOperation,
        Status::InvalidSharedObject,
        Status::InvalidBufferSize,
        Status::InvalidGlobalWorkSize,
        Status::InvalidShareGroupReference,
    ];

    /// Numeric backend code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a status by its numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// Human-readable mnemonic, e.g. `INVALID_ARG_INDEX`.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Status::DeviceNotFound => "DEVICE_NOT_FOUND",
            Status::DeviceNotAvailable => "DEVICE_NOT_AVAILABLE",
            Status::CompilerNotAvailable => "COMPILER_NOT_AVAILABLE",
            Status::MemObjectAllocationFailure => "MEM_OBJECT_ALLOCATION_FAILURE",
            Status::OutOfResources => "OUT_OF_RESOURCES",
            Status::OutOfHostMemory => "OUT_OF_HOST_MEMORY",
            Status::BuildProgramFailure => "BUILD_PROGRAM_FAILURE",
            Status::MapFailure => "MAP_FAILURE",
            Status::InvalidValue => "INVALID_VALUE",
            Status::InvalidPlatform => "INVALID_PLATFORM",
            Status::InvalidDevice => "INVALID_DEVICE",
            Status::InvalidContext => "INVALID_CONTEXT",
            Status::InvalidCommandQueue => "INVALID_COMMAND_QUEUE",
            Status::InvalidHostPtr => "INVALID_HOST_PTR",
            Status::InvalidMemObject => "INVALID_MEM_OBJECT",
            Status::InvalidProgram => "INVALID_PROGRAM",
            Status::InvalidProgramExecutable => "INVALID_PROGRAM_EXECUTABLE",
            Status::InvalidKernelName => "INVALID_KERNEL_NAME",
            Status::InvalidKernelDefinition => "INVALID_KERNEL_DEFINITION",
            Status::InvalidKernel => "INVALID_KERNEL",
            Status::InvalidArgIndex => "INVALID_ARG_INDEX",
            Status::InvalidArgValue => "INVALID_ARG_VALUE",
            Status::InvalidArgSize => "INVALID_ARG_SIZE",
            Status::InvalidKernelArgs => "INVALID_KERNEL_ARGS",
            Status::InvalidWorkGroupSize => "INVALID_WORK_GROUP_SIZE",
            Status::InvalidOperation => "INVALID_OPERATION",
            Status::InvalidSharedObject => "INVALID_SHARED_OBJECT",
            Status::InvalidBufferSize => "INVALID_BUFFER_SIZE",
            Status::InvalidGlobalWorkSize => "INVALID_GLOBAL_WORK_SIZE",
            Status::InvalidShareGroupReference => "INVALID_SHARE_GROUP_REFERENCE",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.mnemonic(), self.code())
    }
}

impl std::error::Error for Status {}

/// Startup failures: no usable platform, device, context or queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    /// Platform enumeration returned nothing.
    #[error("no compute platform found")]
    NoPlatformFound,
    /// Platform enumeration itself failed.
    #[error("platform enumeration failed: {0}")]
    PlatformQueryFailed(Status),
    /// No device on the platform satisfies the selection policy.
    #[error("no suitable device on platform `{platform}`: {reason}")]
    NoDeviceFound {
        /// Platform that was searched.
        platform: String,
        /// Why every candidate was rejected.
        reason: String,
    },
    /// Creating the compute context failed.
    #[error("context creation failed: {0}")]
    ContextCreationFailed(Status),
    /// Creating the command queue failed.
    #[error("command queue creation failed: {0}")]
    QueueCreationFailed(Status),
}

/// Program loading and build failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// `load_program` was called before a successful `initialize`.
    #[error("cannot load program: compute context not initialized")]
    NotInitialized,
    /// The source text is empty.
    #[error("cannot load program: source text is empty")]
    EmptySource,
    /// Kernels created from the current program are still live.
    #[error("cannot replace program: {kernels} kernel(s) were created from it")]
    ProgramInUse {
        /// Live kernels.
        kernels: usize,
    },
    /// The backend refused to create a program object.
    #[error("program creation failed: {0}")]
    CreateProgramFailed(Status),
    /// Compilation failed. `log` holds the full build log.
    #[error("program build failed: {status}\n{log}")]
    BuildFailed {
        /// Backend status of the build call.
        status: Status,
        /// Full build log (or a note that it could not be retrieved).
        log: String,
    },
}

/// Buffer, kernel and argument failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// The operation needs an initialized compute context.
    #[error("compute context not initialized")]
    NotInitialized,
    /// A buffer was requested with zero records.
    #[error("cannot allocate {role} buffer with zero records")]
    ZeroCount {
        /// Buffer role that was requested.
        role: &'static str,
    },
    /// Host data or a record range does not match the buffer size.
    #[error("size mismatch: expected {expected} records, got {actual}")]
    SizeMismatch {
        /// Records the operation required.
        expected: usize,
        /// Records that were supplied or available.
        actual: usize,
    },
    /// The backend failed to allocate a buffer.
    #[error("{role} buffer creation failed: {status}")]
    BufferCreateFailed {
        /// Buffer role that was requested.
        role: &'static str,
        /// Backend status.
        status: Status,
    },
    /// Wrapping a rasterizer-owned buffer failed.
    #[error("wrapping rasterizer buffer failed: {0}")]
    InteropWrapFailed(Status),
    /// A blocking host-to-device copy failed.
    #[error("buffer upload failed: {0}")]
    WriteFailed(Status),
    /// A blocking device-to-host copy failed.
    #[error("buffer readback failed: {0}")]
    ReadFailed(Status),
    /// The handle does not name a buffer of this context.
    #[error("unknown buffer handle {0:?}")]
    UnknownBuffer(BufferHandle),
    /// The buffer has already been released.
    #[error("buffer {0:?} has been released")]
    BufferReleased(BufferHandle),
    /// An interop buffer was accessed while not owned by compute.
    #[error("buffer {buffer:?} is owned by {owner:?}, not compute")]
    NotComputeOwned {
        /// Offending buffer.
        buffer: BufferHandle,
        /// Its current owner.
        owner: Ownership,
    },
    /// No program has been built yet.
    #[error("no program loaded")]
    NoProgram,
    /// The entry point does not exist in the program.
    #[error("kernel `{name}` not found in program")]
    KernelNameNotFound {
        /// Requested entry point.
        name: String,
    },
    /// The backend failed to create the kernel object.
    #[error("kernel creation failed: {0}")]
    KernelCreateFailed(Status),
    /// The kernel handle does not name a kernel of this context.
    #[error("unknown kernel handle")]
    UnknownKernel,
    /// Binding an argument slot failed.
    #[error("binding kernel argument {slot} failed: {status}")]
    ArgBindFailed {
        /// Offending argument slot.
        slot: u32,
        /// Backend status.
        status: Status,
    },
}

/// Per-frame protocol failures. The frame is abandoned; every GPU object
/// stays valid for the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Moving interop buffers into compute ownership failed.
    #[error("acquire of shared buffers failed: {0}")]
    AcquireFailed(Status),
    /// Enqueueing or completing the kernel dispatch failed.
    #[error("kernel dispatch failed: {0}")]
    DispatchFailed(Status),
    /// Handing interop buffers back to the rasterizer failed.
    #[error("release of shared buffers failed: {0}")]
    ReleaseFailed(Status),
    /// A declared kernel argument has no binding.
    #[error("kernel argument {slot} is unbound")]
    UnboundArgument {
        /// First unbound slot.
        slot: u32,
    },
    /// An ownership change other than acquire/release was attempted.
    #[error("illegal ownership transition for {buffer:?}: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Offending buffer.
        buffer: BufferHandle,
        /// Current owner.
        from: Ownership,
        /// Requested owner.
        to: Ownership,
    },
    /// A frame operation referred to a kernel or buffer this context does not own.
    #[error("frame resources invalid: {0}")]
    InvalidResources(#[from] ResourceError),
}

/// Any failure of the handshake core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Startup failure.
    #[error(transparent)]
    Init(#[from] InitError),
    /// Program failure.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// Resource failure.
    #[error(transparent)]
    Resource(#[from] ResourceError),
    /// Frame protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Error {
    /// Whether the frame loop may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Result type for handshake operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_round_trip_for_every_variant() {
        for status in Status::ALL {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(0), None);
        assert_eq!(Status::from_code(-13), None);
    }

    #[test]
    fn test_status_display_names_mnemonic_and_code() {
        let msg = format!("{}", Status::InvalidArgIndex);
        assert_eq!(msg, "INVALID_ARG_INDEX (-49)");
    }

    #[test]
    fn test_arg_bind_failure_names_slot() {
        let err = ResourceError::ArgBindFailed {
            slot: 7,
            status: Status::InvalidArgIndex,
        };
        let msg = format!("{err}");
        assert!(msg.contains("argument 7"));
        assert!(msg.contains("INVALID_ARG_INDEX"));
    }

    #[test]
    fn test_build_failure_carries_log() {
        let err = CompileError::BuildFailed {
            status: Status::BuildProgramFailure,
            log: "error: expected `;`".to_string(),
        };
        assert!(format!("{err}").contains("expected `;`"));
    }

    #[test]
    fn test_only_protocol_errors_are_recoverable() {
        assert!(Error::from(ProtocolError::AcquireFailed(Status::InvalidSharedObject)).is_recoverable());
        assert!(!Error::from(InitError::NoPlatformFound).is_recoverable());
        assert!(!Error::from(CompileError::EmptySource).is_recoverable());
        assert!(!Error::from(ResourceError::NoProgram).is_recoverable());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
