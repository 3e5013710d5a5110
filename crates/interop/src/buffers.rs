//! Shared buffer registry.
//!
//! Tracks every buffer created through a [`ComputeContext`]: its role, its
//! record count (fixed at creation) and, for interop buffers, which runtime
//! currently owns it. Byte size is always `count * RECORD_SIZE`.
//!
//! Interop ownership moves only along
//! `Rasterizer -> InTransition -> Compute -> InTransition -> Rasterizer`.
//! Any other change is rejected with [`ProtocolError::IllegalTransition`].

use tracing::{debug, info, warn};

use crate::backend::{ComputeBackend, MemAccess, MemId};
use crate::context::ComputeContext;
use crate::error::{ProtocolError, ResourceError, Status};
use crate::particle::{as_bytes, from_bytes, ParticleRecord, RECORD_SIZE};

/// Opaque reference to a buffer owned by a [`ComputeContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) usize);

/// Which runtime may touch an interop buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    Rasterizer,
    Compute,
    /// Hand-off requested but not yet confirmed by a queue drain.
    InTransition,
}

/// Buffer role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Compute-only, written once at load time.
    Static,
    /// Compute-only, persists state across frames.
    Dynamic,
    /// Rasterizer-created vertex buffer wrapped for compute access.
    Interop,
}

impl BufferRole {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferRole::Static => "static",
            BufferRole::Dynamic => "dynamic",
            BufferRole::Interop => "interop",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BufferEntry {
    pub label: String,
    pub role: BufferRole,
    pub access: MemAccess,
    pub count: usize,
    /// `None` once released.
    pub mem: Option<MemId>,
    /// Always `Compute` for compute-only buffers.
    pub owner: Ownership,
}

/// Record of every buffer created by one context.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    entries: Vec<BufferEntry>,
}

impl BufferRegistry {
    fn insert(&mut self, entry: BufferEntry) -> BufferHandle {
        self.entries.push(entry);
        BufferHandle(self.entries.len() - 1)
    }

    pub(crate) fn entry(&self, handle: BufferHandle) -> Result<&BufferEntry, ResourceError> {
        self.entries.get(handle.0).ok_or(ResourceError::UnknownBuffer(handle))
    }

    pub(crate) fn live_mem(&self, handle: BufferHandle) -> Result<MemId, ResourceError> {
        self.entry(handle)?.mem.ok_or(ResourceError::BufferReleased(handle))
    }

    /// Number of records in the buffer.
    pub fn count(&self, handle: BufferHandle) -> Option<usize> {
        self.entries.get(handle.0).map(|e| e.count)
    }

    /// Size in bytes.
    pub fn byte_size(&self, handle: BufferHandle) -> Option<u64> {
        self.count(handle).map(|c| (c * RECORD_SIZE) as u64)
    }

    pub fn role(&self, handle: BufferHandle) -> Option<BufferRole> {
        self.entries.get(handle.0).map(|e| e.role)
    }

    pub fn label(&self, handle: BufferHandle) -> Option<&str> {
        self.entries.get(handle.0).map(|e| e.label.as_str())
    }

    pub fn ownership(&self, handle: BufferHandle) -> Option<Ownership> {
        self.entries.get(handle.0).map(|e| e.owner)
    }

    pub fn is_live(&self, handle: BufferHandle) -> bool {
        self.entries.get(handle.0).is_some_and(|e| e.mem.is_some())
    }

    /// Live buffers of every role.
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.mem.is_some()).count()
    }

    /// Live interop buffers.
    pub fn interop(&self) -> Vec<BufferHandle> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.role == BufferRole::Interop && e.mem.is_some())
            .map(|(i, _)| BufferHandle(i))
            .collect()
    }

    /// Interop buffers whose hand-off was never confirmed.
    pub fn stranded(&self) -> Vec<BufferHandle> {
        self.interop()
            .into_iter()
            .filter(|h| self.entries[h.0].owner == Ownership::InTransition)
            .collect()
    }

    /// True when the rasterizer owns every live interop buffer.
    pub fn renderable(&self) -> bool {
        self.interop()
            .iter()
            .all(|h| self.entries[h.0].owner == Ownership::Rasterizer)
    }

    pub(crate) fn interop_mems(&self, handles: &[BufferHandle]) -> Vec<MemId> {
        handles.iter().filter_map(|h| self.entries[h.0].mem).collect()
    }

    /// Like [`transition`](Self::transition), but every handle must currently
    /// be owned by `from`. Nothing changes on failure.
    pub(crate) fn transition_from(
        &mut self,
        handles: &[BufferHandle],
        from: Ownership,
        to: Ownership,
    ) -> Result<(), ProtocolError> {
        for &h in handles {
            let owner = self.entry(h)?.owner;
            if owner != from {
                return Err(ProtocolError::IllegalTransition { buffer: h, from: owner, to });
            }
        }
        self.transition(handles, to)
    }

    /// Move interop buffers one step along the ownership cycle.
    pub(crate) fn transition(&mut self, handles: &[BufferHandle], to: Ownership) -> Result<(), ProtocolError> {
        for &h in handles {
            let from = self.entry(h)?.owner;
            let legal = matches!(
                (from, to),
                (Ownership::Rasterizer, Ownership::InTransition)
                    | (Ownership::InTransition, Ownership::Compute)
                    | (Ownership::Compute, Ownership::InTransition)
                    | (Ownership::InTransition, Ownership::Rasterizer)
            );
            if !legal || self.entries[h.0].role != BufferRole::Interop {
                return Err(ProtocolError::IllegalTransition { buffer: h, from, to });
            }
        }
        for &h in handles {
            self.entries[h.0].owner = to;
        }
        Ok(())
    }

    /// Clear every live buffer and return the backend ids, in creation order.
    pub(crate) fn take_live(&mut self) -> Vec<MemId> {
        self.entries.iter_mut().filter_map(|e| e.mem.take()).collect()
    }
}

// ---------------------------------------------------------------------------
// Allocation and transfer
// ---------------------------------------------------------------------------

impl<B: ComputeBackend> ComputeContext<B> {
    /// Create a compute-only buffer initialized from `data`, written once.
    pub fn allocate_static(
        &mut self,
        label: &str,
        access: MemAccess,
        data: &[ParticleRecord],
        count: usize,
    ) -> Result<BufferHandle, ResourceError> {
        let context = self.context_id()?;
        if count == 0 {
            return Err(ResourceError::ZeroCount { role: "static" });
        }
        if data.len() != count {
            return Err(ResourceError::SizeMismatch {
                expected: count,
                actual: data.len(),
            });
        }
        let mem = self
            .backend
            .create_buffer(context, access, (count * RECORD_SIZE) as u64, Some(as_bytes(data)))
            .map_err(|status| ResourceError::BufferCreateFailed { role: "static", status })?;
        Ok(self.register(label, BufferRole::Static, access, count, mem, Ownership::Compute))
    }

    /// Create a zero-filled compute-only buffer of `count` records.
    pub fn allocate_dynamic(
        &mut self,
        label: &str,
        access: MemAccess,
        count: usize,
    ) -> Result<BufferHandle, ResourceError> {
        let context = self.context_id()?;
        if count == 0 {
            return Err(ResourceError::ZeroCount { role: "dynamic" });
        }
        let mem = self
            .backend
            .create_buffer(context, access, (count * RECORD_SIZE) as u64, None)
            .map_err(|status| ResourceError::BufferCreateFailed { role: "dynamic", status })?;
        Ok(self.register(label, BufferRole::Dynamic, access, count, mem, Ownership::Compute))
    }

    /// Wrap a rasterizer-owned vertex buffer. Starts owned by the rasterizer.
    pub fn allocate_interop(
        &mut self,
        label: &str,
        access: MemAccess,
        shared: &B::SharedBuffer,
    ) -> Result<BufferHandle, ResourceError> {
        let context = self.context_id()?;
        let mem = self
            .backend
            .create_from_shared(context, access, shared)
            .map_err(ResourceError::InteropWrapFailed)?;

        let size = match self.backend.mem_size(mem) {
            Ok(s) if s > 0 && s % RECORD_SIZE as u64 == 0 => s,
            other => {
                if let Err(e) = self.backend.release_mem(mem) {
                    warn!("releasing rejected interop wrap: {e}");
                }
                let status = match other {
                    Err(status) => status,
                    Ok(_) => Status::InvalidBufferSize,
                };
                return Err(ResourceError::InteropWrapFailed(status));
            }
        };
        let count = (size / RECORD_SIZE as u64) as usize;
        Ok(self.register(label, BufferRole::Interop, access, count, mem, Ownership::Rasterizer))
    }

    /// Blocking copy of `data` into the buffer starting at record `offset`.
    pub fn upload(&mut self, handle: BufferHandle, offset: usize, data: &[ParticleRecord]) -> Result<(), ResourceError> {
        let (mem, queue) = self.checked_range(handle, offset, data.len())?;
        self.backend
            .write_buffer(queue, mem, (offset * RECORD_SIZE) as u64, as_bytes(data))
            .map_err(ResourceError::WriteFailed)
    }

    /// Blocking copy of `count` records starting at record `offset` back to the host.
    pub fn read(&mut self, handle: BufferHandle, offset: usize, count: usize) -> Result<Vec<ParticleRecord>, ResourceError> {
        let (mem, queue) = self.checked_range(handle, offset, count)?;
        let mut bytes = vec![0u8; count * RECORD_SIZE];
        self.backend
            .read_buffer(queue, mem, (offset * RECORD_SIZE) as u64, &mut bytes)
            .map_err(ResourceError::ReadFailed)?;
        Ok(from_bytes(&bytes))
    }

    /// Read the whole buffer.
    pub fn read_all(&mut self, handle: BufferHandle) -> Result<Vec<ParticleRecord>, ResourceError> {
        let count = self.buffers.entry(handle)?.count;
        self.read(handle, 0, count)
    }

    /// Release one buffer. Releasing an already-released buffer is a no-op.
    pub fn release_buffer(&mut self, handle: BufferHandle) -> Result<(), ResourceError> {
        let entry = self
            .buffers
            .entries
            .get_mut(handle.0)
            .ok_or(ResourceError::UnknownBuffer(handle))?;
        let Some(mem) = entry.mem.take() else {
            debug!(buffer = handle.0, "buffer already released");
            return Ok(());
        };
        if let Err(e) = self.backend.release_mem(mem) {
            warn!(buffer = %entry.label, "backend release failed: {e}");
        }
        Ok(())
    }

    fn register(
        &mut self,
        label: &str,
        role: BufferRole,
        access: MemAccess,
        count: usize,
        mem: MemId,
        owner: Ownership,
    ) -> BufferHandle {
        info!(
            label,
            role = role.as_str(),
            count,
            bytes = count * RECORD_SIZE,
            "buffer allocated"
        );
        self.buffers.insert(BufferEntry {
            label: label.to_string(),
            role,
            access,
            count,
            mem: Some(mem),
            owner,
        })
    }

    fn checked_range(
        &self,
        handle: BufferHandle,
        offset: usize,
        len: usize,
    ) -> Result<(MemId, crate::backend::QueueId), ResourceError> {
        let queue = self.queue()?;
        let entry = self.buffers.entry(handle)?;
        let mem = entry.mem.ok_or(ResourceError::BufferReleased(handle))?;
        let end = offset.checked_add(len).unwrap_or(usize::MAX);
        if end > entry.count {
            return Err(ResourceError::SizeMismatch {
                expected: entry.count.saturating_sub(offset),
                actual: len,
            });
        }
        if entry.owner != Ownership::Compute {
            return Err(ResourceError::NotComputeOwned {
                buffer: handle,
                owner: entry.owner,
            });
        }
        Ok((mem, queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{CpuBackend, CpuOp};
    use crate::device::{select_device, select_platform};

    fn ctx() -> ComputeContext<CpuBackend> {
        let mut backend = CpuBackend::new();
        let p = select_platform(&mut backend, None).unwrap();
        let d = select_device(&mut backend, &p, false).unwrap();
        let mut ctx = ComputeContext::new(backend);
        ctx.initialize(&p, &d, None).unwrap();
        ctx
    }

    fn records(n: usize) -> Vec<ParticleRecord> {
        (0..n).map(|i| ParticleRecord::new(i as f32, 1.0, 2.0, 3.0)).collect()
    }

    #[test]
    fn test_requires_initialize() {
        let mut ctx = ComputeContext::new(CpuBackend::new());
        assert_eq!(
            ctx.allocate_dynamic("v", MemAccess::ReadWrite, 4),
            Err(ResourceError::NotInitialized)
        );
    }

    #[test]
    fn test_zero_count_rejected_without_backend_call() {
        let mut ctx = ctx();
        assert_eq!(
            ctx.allocate_dynamic("v", MemAccess::ReadWrite, 0),
            Err(ResourceError::ZeroCount { role: "dynamic" })
        );
        assert_eq!(
            ctx.allocate_static("s", MemAccess::ReadOnly, &[], 0),
            Err(ResourceError::ZeroCount { role: "static" })
        );
        assert_eq!(ctx.backend().live_buffers(), 0);
    }

    #[test]
    fn test_byte_size_is_count_times_record() {
        let mut ctx = ctx();
        let h = ctx.allocate_static("s", MemAccess::ReadOnly, &records(10), 10).unwrap();
        assert_eq!(ctx.buffers().byte_size(h), Some(160));
        assert_eq!(ctx.read_all(h).unwrap(), records(10));
    }

    #[test]
    fn test_static_data_length_must_match() {
        let mut ctx = ctx();
        assert_eq!(
            ctx.allocate_static("s", MemAccess::ReadOnly, &records(3), 4),
            Err(ResourceError::SizeMismatch { expected: 4, actual: 3 })
        );
    }

    #[test]
    fn test_allocation_failure_carries_status() {
        let mut ctx = ctx();
        ctx.backend().faults().fail_next(CpuOp::CreateBuffer, Status::MemObjectAllocationFailure);
        assert_eq!(
            ctx.allocate_dynamic("v", MemAccess::ReadWrite, 8),
            Err(ResourceError::BufferCreateFailed {
                role: "dynamic",
                status: Status::MemObjectAllocationFailure
            })
        );
    }

    #[test]
    fn test_upload_at_offset_and_range_check() {
        let mut ctx = ctx();
        let h = ctx.allocate_dynamic("v", MemAccess::ReadWrite, 4).unwrap();
        ctx.upload(h, 2, &records(2)).unwrap();
        let back = ctx.read_all(h).unwrap();
        assert_eq!(back[0], ParticleRecord::default());
        assert_eq!(back[2], records(1)[0]);

        assert!(matches!(
            ctx.upload(h, 3, &records(2)),
            Err(ResourceError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_write_failure_reported() {
        let mut ctx = ctx();
        let h = ctx.allocate_dynamic("v", MemAccess::ReadWrite, 4).unwrap();
        ctx.backend().faults().fail_next(CpuOp::WriteBuffer, Status::OutOfResources);
        assert_eq!(
            ctx.upload(h, 0, &records(4)),
            Err(ResourceError::WriteFailed(Status::OutOfResources))
        );
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut ctx = ctx();
        let h = ctx.allocate_dynamic("v", MemAccess::ReadWrite, 4).unwrap();
        ctx.release_buffer(h).unwrap();
        ctx.release_buffer(h).unwrap();
        assert!(!ctx.buffers().is_live(h));
        assert_eq!(ctx.backend().live_buffers(), 0);
        assert_eq!(ctx.read_all(h), Err(ResourceError::BufferReleased(h)));
    }

    #[test]
    fn test_interop_count_from_size_and_initial_owner() {
        let mut ctx = ctx();
        let mut raster = ctx.backend().raster_session();
        let shared = raster_buffer(&mut raster, &records(5));
        let h = ctx.allocate_interop("pos", MemAccess::ReadWrite, &shared).unwrap();
        assert_eq!(ctx.buffers().count(h), Some(5));
        assert_eq!(ctx.buffers().ownership(h), Some(Ownership::Rasterizer));
        assert!(ctx.buffers().renderable());

        // Not compute-owned: host access refused.
        assert!(matches!(
            ctx.read_all(h),
            Err(ResourceError::NotComputeOwned { owner: Ownership::Rasterizer, .. })
        ));
    }

    #[test]
    fn test_interop_rejects_ragged_size() {
        let mut ctx = ctx();
        let mut raster = ctx.backend().raster_session();
        let shared = crate::backend::RasterSession::create_vertex_buffer(&mut raster, "odd", &[0u8; 20]).unwrap();
        assert_eq!(
            ctx.allocate_interop("odd", MemAccess::ReadWrite, &shared),
            Err(ResourceError::InteropWrapFailed(Status::InvalidBufferSize))
        );
        assert_eq!(ctx.backend().live_buffers(), 0);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut ctx = ctx();
        let mut raster = ctx.backend().raster_session();
        let shared = raster_buffer(&mut raster, &records(2));
        let h = ctx.allocate_interop("pos", MemAccess::ReadWrite, &shared).unwrap();
        let err = ctx.buffers.transition(&[h], Ownership::Compute).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::IllegalTransition {
                buffer: h,
                from: Ownership::Rasterizer,
                to: Ownership::Compute
            }
        );
        assert_eq!(ctx.buffers().ownership(h), Some(Ownership::Rasterizer));
    }

    #[test]
    fn test_transition_from_checks_current_owner() {
        let mut ctx = ctx();
        let mut raster = ctx.backend().raster_session();
        let shared = raster_buffer(&mut raster, &records(2));
        let h = ctx.allocate_interop("pos", MemAccess::ReadWrite, &shared).unwrap();

        // Rasterizer -> InTransition is legal, but not when starting from Compute.
        let err = ctx
            .buffers
            .transition_from(&[h], Ownership::Compute, Ownership::InTransition)
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::IllegalTransition {
                buffer: h,
                from: Ownership::Rasterizer,
                to: Ownership::InTransition
            }
        );
        assert_eq!(ctx.buffers().ownership(h), Some(Ownership::Rasterizer));

        ctx.buffers
            .transition_from(&[h], Ownership::Rasterizer, Ownership::InTransition)
            .unwrap();
        assert_eq!(ctx.buffers().ownership(h), Some(Ownership::InTransition));
    }

    fn raster_buffer(raster: &mut crate::cpu::CpuRaster, data: &[ParticleRecord]) -> crate::cpu::CpuSharedBuffer {
        crate::backend::RasterSession::create_vertex_buffer(raster, "test", as_bytes(data)).unwrap()
    }
}
