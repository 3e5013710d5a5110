//! Kernel binder.
//!
//! Creates kernels from the built program and binds argument slots once.
//! Later binds to the same slot overwrite. A kernel can only be dispatched
//! after every declared slot has a binding.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::backend::{ComputeBackend, KernelId, RawArg, ScalarArg};
use crate::buffers::{BufferHandle, Ownership};
use crate::context::ComputeContext;
use crate::error::{ProtocolError, ResourceError, Status};

/// Opaque reference to a kernel owned by a [`ComputeContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub(crate) usize);

/// Value for one kernel argument slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferHandle),
    Scalar(ScalarArg),
}

impl From<BufferHandle> for KernelArg {
    fn from(h: BufferHandle) -> Self {
        KernelArg::Buffer(h)
    }
}

impl From<f32> for KernelArg {
    fn from(v: f32) -> Self {
        KernelArg::Scalar(ScalarArg::F32(v))
    }
}

impl From<u32> for KernelArg {
    fn from(v: u32) -> Self {
        KernelArg::Scalar(ScalarArg::U32(v))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct KernelEntry {
    pub name: String,
    pub id: Option<KernelId>,
    pub slots: Vec<u32>,
    pub bound: BTreeMap<u32, KernelArg>,
}

impl<B: ComputeBackend> ComputeContext<B> {
    /// Instantiate the entry point `name` from the built program.
    pub fn create_kernel(&mut self, name: &str) -> Result<KernelHandle, ResourceError> {
        if self.session.is_none() {
            return Err(ResourceError::NotInitialized);
        }
        let program = self.program.ok_or(ResourceError::NoProgram)?;

        let id = self.backend.create_kernel(program, name).map_err(|status| match status {
            Status::InvalidKernelName => ResourceError::KernelNameNotFound { name: name.to_string() },
            other => ResourceError::KernelCreateFailed(other),
        })?;
        let slots = match self.backend.kernel_arg_slots(id) {
            Ok(s) => s,
            Err(status) => {
                if let Err(e) = self.backend.release_kernel(id) {
                    warn!(kernel = name, "releasing half-created kernel failed: {e}");
                }
                return Err(ResourceError::KernelCreateFailed(status));
            }
        };

        info!(kernel = name, args = slots.len(), "kernel created");
        self.kernels.push(KernelEntry {
            name: name.to_string(),
            id: Some(id),
            slots,
            bound: BTreeMap::new(),
        });
        Ok(KernelHandle(self.kernels.len() - 1))
    }

    /// Bind `arg` to `slot`. Failures name the slot.
    pub fn bind(&mut self, kernel: KernelHandle, slot: u32, arg: impl Into<KernelArg>) -> Result<(), ResourceError> {
        let arg = arg.into();
        let id = self.kernel_id(kernel)?;

        let raw = match arg {
            KernelArg::Buffer(h) => match self.buffers.live_mem(h) {
                Ok(mem) => RawArg::Mem(mem),
                Err(_) => {
                    return Err(ResourceError::ArgBindFailed {
                        slot,
                        status: Status::InvalidMemObject,
                    })
                }
            },
            KernelArg::Scalar(s) => RawArg::Scalar(s),
        };

        self.backend
            .set_kernel_arg(id, slot, raw)
            .map_err(|status| ResourceError::ArgBindFailed { slot, status })?;

        let entry = &mut self.kernels[kernel.0];
        if entry.bound.insert(slot, arg).is_some() {
            debug!(kernel = %entry.name, slot, "argument rebound");
        }
        Ok(())
    }

    /// Declared argument slots, ascending.
    pub fn kernel_slots(&self, kernel: KernelHandle) -> Option<&[u32]> {
        self.kernels.get(kernel.0).map(|k| k.slots.as_slice())
    }

    /// Lowest declared slot without a binding.
    pub fn first_unbound(&self, kernel: KernelHandle) -> Option<u32> {
        let entry = self.kernels.get(kernel.0)?;
        entry.slots.iter().copied().find(|s| !entry.bound.contains_key(s))
    }

    /// Enqueue one dispatch over `global` work items. Does not wait for completion.
    ///
    /// Every declared slot must be bound and every bound interop buffer
    /// must be owned by compute.
    pub fn dispatch(&mut self, kernel: KernelHandle, global: usize) -> Result<(), ProtocolError> {
        let id = self.kernel_id(kernel)?;
        if let Some(slot) = self.first_unbound(kernel) {
            return Err(ProtocolError::UnboundArgument { slot });
        }
        if global == 0 {
            return Err(ProtocolError::DispatchFailed(Status::InvalidGlobalWorkSize));
        }
        for arg in self.kernels[kernel.0].bound.values() {
            if let KernelArg::Buffer(h) = arg {
                let owner = self.buffers.entry(*h)?.owner;
                if owner != Ownership::Compute {
                    return Err(ProtocolError::DispatchFailed(Status::InvalidSharedObject));
                }
            }
        }
        let queue = self.queue()?;
        self.backend
            .enqueue_kernel(queue, id, global)
            .map_err(ProtocolError::DispatchFailed)
    }

    fn kernel_id(&self, kernel: KernelHandle) -> Result<KernelId, ResourceError> {
        self.kernels
            .get(kernel.0)
            .and_then(|k| k.id)
            .ok_or(ResourceError::UnknownKernel)
    }
}
