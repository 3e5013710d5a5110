//! Compute context manager.
//!
//! [`ComputeContext`] is the single owner of every backend object the
//! handshake creates: context, in-order queue, program, kernels and buffers.
//! Raw backend ids never leave it. Dropping it releases everything in
//! reverse dependency order: kernels, buffers, program, queue, context.

use tracing::{debug, info, warn};

use crate::backend::{ComputeBackend, ContextId, DeviceInfo, PlatformInfo, ProgramId, QueueId};
use crate::binder::KernelEntry;
use crate::buffers::BufferRegistry;
use crate::error::{CompileError, InitError, ResourceError, Status};

/// Live context/queue pair plus the selection that produced it.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub platform: PlatformInfo,
    pub device: DeviceInfo,
    pub context: ContextId,
    pub queue: QueueId,
    pub shared: bool,
}

/// Owner of all compute-side objects for one device.
pub struct ComputeContext<B: ComputeBackend> {
    pub(crate) backend: B,
    pub(crate) session: Option<Session>,
    pub(crate) program: Option<ProgramId>,
    pub(crate) buffers: BufferRegistry,
    pub(crate) kernels: Vec<KernelEntry>,
}

impl<B: ComputeBackend> ComputeContext<B> {
    /// Wrap a backend. Nothing is created until [`initialize`](Self::initialize).
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            session: None,
            program: None,
            buffers: BufferRegistry::default(),
            kernels: Vec::new(),
        }
    }

    /// Create the context (sharing with `share` when given) and one in-order queue.
    ///
    /// On queue failure the freshly created context is released before returning.
    pub fn initialize(
        &mut self,
        platform: &PlatformInfo,
        device: &DeviceInfo,
        share: Option<&B::ShareGroup>,
    ) -> Result<(), InitError> {
        if self.session.is_some() {
            return Err(InitError::ContextCreationFailed(Status::InvalidOperation));
        }

        let context = self
            .backend
            .create_context(platform.id, device.id, share)
            .map_err(InitError::ContextCreationFailed)?;

        let queue = match self.backend.create_queue(context, device.id) {
            Ok(q) => q,
            Err(status) => {
                if let Err(e) = self.backend.release_context(context) {
                    warn!("releasing partial context failed: {e}");
                }
                return Err(InitError::QueueCreationFailed(status));
            }
        };

        info!(
            backend = self.backend.name(),
            device = %device.name,
            interop = share.is_some(),
            "compute context and queue created"
        );

        self.session = Some(Session {
            platform: platform.clone(),
            device: device.clone(),
            context,
            queue,
            shared: share.is_some(),
        });
        Ok(())
    }

    /// Create and build a program from source text for the selected device.
    ///
    /// A build failure returns the full build log. If the log itself cannot
    /// be fetched the build status is still reported.
    ///
    /// The program is immutable once kernels exist: a later load is refused
    /// with [`CompileError::ProgramInUse`]. Before that, a successful load
    /// replaces and releases the previous program.
    pub fn load_program(&mut self, source: &str) -> Result<(), CompileError> {
        let (context, device) = match &self.session {
            Some(s) => (s.context, s.device.id),
            None => return Err(CompileError::NotInitialized),
        };
        if source.trim().is_empty() {
            return Err(CompileError::EmptySource);
        }
        let kernels = self.kernels.iter().filter(|k| k.id.is_some()).count();
        if kernels > 0 {
            return Err(CompileError::ProgramInUse { kernels });
        }

        let program = self
            .backend
            .create_program(context, source)
            .map_err(CompileError::CreateProgramFailed)?;

        if let Err(status) = self.backend.build_program(program, device) {
            let log = match self.backend.build_log(program, device) {
                Ok(log) => log,
                Err(e) => format!("<build log unavailable: {e}>"),
            };
            if let Err(e) = self.backend.release_program(program) {
                warn!("releasing failed program: {e}");
            }
            return Err(CompileError::BuildFailed { status, log });
        }

        if let Some(old) = self.program.replace(program) {
            if let Err(e) = self.backend.release_program(old) {
                warn!("releasing replaced program: {e}");
            }
        }
        info!(bytes = source.len(), "program built");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    pub fn has_program(&self) -> bool {
        self.program.is_some()
    }

    /// Whether the context was created against a rasterizer share group.
    pub fn is_shared(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.shared)
    }

    pub fn device(&self) -> Option<&DeviceInfo> {
        self.session.as_ref().map(|s| &s.device)
    }

    pub fn platform(&self) -> Option<&PlatformInfo> {
        self.session.as_ref().map(|s| &s.platform)
    }

    pub fn buffers(&self) -> &BufferRegistry {
        &self.buffers
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Drain the command queue.
    pub fn finish(&mut self) -> Result<(), Status> {
        let queue = self.queue().map_err(|_| Status::InvalidCommandQueue)?;
        self.backend.finish(queue)
    }

    pub(crate) fn queue(&self) -> Result<QueueId, ResourceError> {
        self.session.as_ref().map(|s| s.queue).ok_or(ResourceError::NotInitialized)
    }

    pub(crate) fn context_id(&self) -> Result<ContextId, ResourceError> {
        self.session.as_ref().map(|s| s.context).ok_or(ResourceError::NotInitialized)
    }

    fn teardown(&mut self) {
        for entry in self.kernels.drain(..) {
            if let Some(id) = entry.id {
                if let Err(e) = self.backend.release_kernel(id) {
                    warn!(kernel = %entry.name, "release failed: {e}");
                }
            }
        }
        for mem in self.buffers.take_live() {
            if let Err(e) = self.backend.release_mem(mem) {
                warn!("buffer release failed: {e}");
            }
        }
        if let Some(program) = self.program.take() {
            if let Err(e) = self.backend.release_program(program) {
                warn!("program release failed: {e}");
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(e) = self.backend.release_queue(session.queue) {
                warn!("queue release failed: {e}");
            }
            if let Err(e) = self.backend.release_context(session.context) {
                warn!("context release failed: {e}");
            }
            debug!(device = %session.device.name, "compute context released");
        }
    }
}

impl<B: ComputeBackend> Drop for ComputeContext<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{CpuBackend, CpuOp, TraceEvent};
    use crate::device::{select_device, select_platform};

    const NOOP: &str = "@compute @workgroup_size(1) fn main() {}";

    fn ready() -> (CpuBackend, PlatformInfo, DeviceInfo) {
        let mut backend = CpuBackend::new();
        let platform = select_platform(&mut backend, None).unwrap();
        let device = select_device(&mut backend, &platform, false).unwrap();
        (backend, platform, device)
    }

    #[test]
    fn test_load_before_initialize() {
        let mut ctx = ComputeContext::new(CpuBackend::new());
        assert_eq!(ctx.load_program(NOOP), Err(CompileError::NotInitialized));
    }

    #[test]
    fn test_empty_source_rejected() {
        let (backend, p, d) = ready();
        let mut ctx = ComputeContext::new(backend);
        ctx.initialize(&p, &d, None).unwrap();
        assert_eq!(ctx.load_program(""), Err(CompileError::EmptySource));
        assert_eq!(ctx.load_program("  \n"), Err(CompileError::EmptySource));
    }

    #[test]
    fn test_build_failure_surfaces_log() {
        let (backend, p, d) = ready();
        let mut ctx = ComputeContext::new(backend);
        ctx.initialize(&p, &d, None).unwrap();
        match ctx.load_program("fn broken( {") {
            Err(CompileError::BuildFailed { status, log }) => {
                assert_eq!(status, Status::BuildProgramFailure);
                assert!(!log.is_empty());
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
        assert!(!ctx.has_program());
    }

    #[test]
    fn test_build_log_failure_does_not_mask_build_error() {
        let (mut backend, p, d) = ready();
        backend.faults().fail_always(CpuOp::BuildLog, Status::InvalidProgram);
        let mut ctx = ComputeContext::new(backend);
        ctx.initialize(&p, &d, None).unwrap();
        match ctx.load_program("fn broken( {") {
            Err(CompileError::BuildFailed { status, log }) => {
                assert_eq!(status, Status::BuildProgramFailure);
                assert!(log.contains("unavailable"));
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_program_is_fixed_once_kernels_exist() {
        let (mut backend, p, d) = ready();
        backend.register_kernel("main", |_, _| {});
        let trace = backend.trace();
        let mut ctx = ComputeContext::new(backend);
        ctx.initialize(&p, &d, None).unwrap();

        // No kernels yet: reloading replaces the program.
        ctx.load_program(NOOP).unwrap();
        ctx.load_program(NOOP).unwrap();
        assert!(trace.events().contains(&TraceEvent::Released("program")));

        let k = ctx.create_kernel("main").unwrap();
        assert_eq!(
            ctx.load_program(NOOP),
            Err(CompileError::ProgramInUse { kernels: 1 })
        );
        assert_eq!(ctx.kernel_slots(k), Some(&[][..]));
        assert!(ctx.has_program());
    }

    #[test]
    fn test_queue_failure_releases_context() {
        let (mut backend, p, d) = ready();
        backend.faults().fail_next(CpuOp::CreateQueue, Status::OutOfResources);
        let mut ctx = ComputeContext::new(backend);
        assert_eq!(
            ctx.initialize(&p, &d, None),
            Err(InitError::QueueCreationFailed(Status::OutOfResources))
        );
        assert!(!ctx.is_initialized());
        assert_eq!(ctx.backend().live_contexts(), 0);
    }

    #[test]
    fn test_drop_releases_in_reverse_dependency_order() {
        let (backend, p, d) = ready();
        let trace = backend.trace();
        {
            let mut ctx = ComputeContext::new(backend);
            ctx.initialize(&p, &d, None).unwrap();
            ctx.load_program(NOOP).unwrap();
            ctx.allocate_dynamic("buf", crate::backend::MemAccess::ReadWrite, 4).unwrap();
            trace.clear();
        }
        let events = trace.events();
        let order: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TraceEvent::Released(kind) => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["mem", "program", "queue", "context"]);
    }
}
