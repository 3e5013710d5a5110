//! CPU reference backend.
//!
//! A deterministic, single-threaded [`ComputeBackend`] with host-memory
//! buffers, paired with [`CpuRaster`] as its rasterizer. Programs are WGSL,
//! built with the same reflection as the GPU backend; each compute entry
//! point runs as a registered host function, once per global index.
//!
//! Built for tests and for hosts without a GPU:
//! - [`FaultPlan`] makes any backend operation fail with a chosen [`Status`],
//!   once or until cleared.
//! - [`Trace`] records raster flushes, acquires, dispatches, releases, draws
//!   and object releases in order, shared between backend and rasterizer.
//!   Ownership violations (dispatching on a rasterizer-owned buffer, drawing
//!   a compute-owned one) are recorded as [`TraceEvent::Violation`].
//!
//! Out-of-range element reads return zero and out-of-range writes are
//! discarded, matching robust buffer access on GPUs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::backend::{
    BackendResult, ComputeBackend, ContextId, DeviceClass, DeviceId, DeviceInfo, KernelId, MemAccess, MemId,
    PlatformId, PlatformInfo, ProgramId, QueueId, RasterError, RasterSession, RawArg,
};
use crate::error::Status;
use crate::particle::{from_bytes, ParticleRecord};
use crate::program::{reflect_wgsl, ArgKind, EntryPointInfo, ProgramInfo};

/// Capability token reference devices report for raster sharing.
pub const REFERENCE_SHARING_EXTENSION: &str = "reference_raster_sharing";

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Fault injection and tracing
// ---------------------------------------------------------------------------

/// Backend operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuOp {
    Platforms,
    Devices,
    CreateContext,
    CreateQueue,
    CreateProgram,
    BuildProgram,
    BuildLog,
    CreateKernel,
    KernelArgSlots,
    SetKernelArg,
    CreateBuffer,
    CreateFromShared,
    WriteBuffer,
    ReadBuffer,
    AcquireShared,
    ReleaseShared,
    EnqueueKernel,
    Finish,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    status: Status,
    persistent: bool,
}

/// Scheduled failures. Cloning shares the schedule.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    faults: Arc<Mutex<HashMap<CpuOp, Fault>>>,
}

impl FaultPlan {
    /// Fail the next call of `op` only.
    pub fn fail_next(&self, op: CpuOp, status: Status) {
        lock(&self.faults).insert(op, Fault { status, persistent: false });
    }

    /// Fail every call of `op` until cleared.
    pub fn fail_always(&self, op: CpuOp, status: Status) {
        lock(&self.faults).insert(op, Fault { status, persistent: true });
    }

    pub fn clear_op(&self, op: CpuOp) {
        lock(&self.faults).remove(&op);
    }

    pub fn clear(&self) {
        lock(&self.faults).clear();
    }

    fn take(&self, op: CpuOp) -> Option<Status> {
        let mut faults = lock(&self.faults);
        let fault = *faults.get(&op)?;
        if !fault.persistent {
            faults.remove(&op);
        }
        Some(fault.status)
    }
}

/// One observable backend or rasterizer event.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    RasterFinish,
    Acquire(Vec<MemId>),
    Release(Vec<MemId>),
    Dispatch { kernel: String, global: usize },
    Finish,
    Draw { count: usize },
    /// Object kind released: `kernel`, `mem`, `program`, `queue` or `context`.
    Released(&'static str),
    Fault(CpuOp, Status),
    Violation(String),
}

/// Ordered event log shared by a backend and its rasterizers.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl Trace {
    pub fn events(&self) -> Vec<TraceEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    pub fn violations(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                TraceEvent::Violation(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: TraceEvent) {
        lock(&self.events).push(event);
    }
}

// ---------------------------------------------------------------------------
// Platform description
// ---------------------------------------------------------------------------

/// Device exposed by a [`CpuBackend`].
#[derive(Debug, Clone)]
pub struct CpuDeviceSpec {
    pub name: String,
    pub class: DeviceClass,
    pub extensions: Vec<String>,
}

impl CpuDeviceSpec {
    /// GPU-class device, optionally reporting the sharing extension.
    pub fn gpu(name: &str, interop: bool) -> Self {
        let extensions = if interop {
            vec![REFERENCE_SHARING_EXTENSION.to_string()]
        } else {
            Vec::new()
        };
        Self {
            name: name.to_string(),
            class: DeviceClass::Gpu,
            extensions,
        }
    }

    pub fn cpu(name: &str) -> Self {
        Self {
            name: name.to_string(),
            class: DeviceClass::Cpu,
            extensions: Vec::new(),
        }
    }
}

/// Platform exposed by a [`CpuBackend`].
#[derive(Debug, Clone)]
pub struct CpuPlatformSpec {
    pub name: String,
    pub vendor: String,
    pub devices: Vec<CpuDeviceSpec>,
}

impl CpuPlatformSpec {
    pub fn new(name: &str, vendor: &str, devices: Vec<CpuDeviceSpec>) -> Self {
        Self {
            name: name.to_string(),
            vendor: vendor.to_string(),
            devices,
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel arguments
// ---------------------------------------------------------------------------

/// Host kernel body: called once per global index.
pub type CpuKernelFn = Arc<dyn Fn(usize, &mut CpuArgs) + Send + Sync>;

#[derive(Debug, Clone)]
enum ArgData {
    Words(Vec<u32>),
    Scalar(u32),
}

/// Argument view handed to host kernels, keyed by slot.
#[derive(Debug, Default)]
pub struct CpuArgs {
    slots: BTreeMap<u32, ArgData>,
}

impl CpuArgs {
    /// Number of 16-byte records in a buffer argument.
    pub fn records(&self, slot: u32) -> usize {
        match self.slots.get(&slot) {
            Some(ArgData::Words(w)) => w.len() / 4,
            _ => 0,
        }
    }

    pub fn vec4(&self, slot: u32, index: usize) -> [f32; 4] {
        match self.slots.get(&slot) {
            Some(ArgData::Words(w)) if (index + 1) * 4 <= w.len() => {
                let base = index * 4;
                [
                    f32::from_bits(w[base]),
                    f32::from_bits(w[base + 1]),
                    f32::from_bits(w[base + 2]),
                    f32::from_bits(w[base + 3]),
                ]
            }
            _ => [0.0; 4],
        }
    }

    pub fn set_vec4(&mut self, slot: u32, index: usize, value: [f32; 4]) {
        if let Some(ArgData::Words(w)) = self.slots.get_mut(&slot) {
            if (index + 1) * 4 <= w.len() {
                let base = index * 4;
                for (k, v) in value.iter().enumerate() {
                    w[base + k] = v.to_bits();
                }
            }
        }
    }

    pub fn scalar_f32(&self, slot: u32) -> f32 {
        f32::from_bits(self.scalar_bits(slot))
    }

    pub fn scalar_u32(&self, slot: u32) -> u32 {
        self.scalar_bits(slot)
    }

    fn scalar_bits(&self, slot: u32) -> u32 {
        match self.slots.get(&slot) {
            Some(ArgData::Scalar(bits)) => *bits,
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Rasterizer side
// ---------------------------------------------------------------------------

/// Share group of a [`CpuRaster`]; binds contexts to one backend instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuShareGroup {
    instance: u64,
}

#[derive(Debug)]
struct SharedCell {
    instance: u64,
    label: String,
    words: Mutex<Vec<u32>>,
    acquired: AtomicBool,
}

/// Vertex buffer owned by a [`CpuRaster`].
#[derive(Debug, Clone)]
pub struct CpuSharedBuffer {
    cell: Arc<SharedCell>,
}

impl CpuSharedBuffer {
    pub fn byte_size(&self) -> usize {
        lock(&self.cell.words).len() * 4
    }
}

/// Rasterizer paired with a [`CpuBackend`]. Draws are recorded, not rendered.
#[derive(Debug)]
pub struct CpuRaster {
    group: CpuShareGroup,
    trace: Trace,
    draws: u64,
}

impl CpuRaster {
    /// Current contents of a vertex buffer.
    pub fn contents(&self, buffer: &CpuSharedBuffer) -> Vec<ParticleRecord> {
        let words = lock(&buffer.cell.words);
        from_bytes(bytemuck::cast_slice(words.as_slice()))
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    pub fn trace(&self) -> Trace {
        self.trace.clone()
    }
}

fn bytes_to_words(data: &[u8]) -> Option<Vec<u32>> {
    if data.len() % 4 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

impl RasterSession for CpuRaster {
    type ShareGroup = CpuShareGroup;
    type SharedBuffer = CpuSharedBuffer;

    fn share_group(&self) -> &CpuShareGroup {
        &self.group
    }

    fn create_vertex_buffer(&mut self, label: &str, data: &[u8]) -> Result<CpuSharedBuffer, RasterError> {
        let words = bytes_to_words(data)
            .ok_or_else(|| RasterError::BufferCreation(format!("{label}: {} bytes is not word aligned", data.len())))?;
        Ok(CpuSharedBuffer {
            cell: Arc::new(SharedCell {
                instance: self.group.instance,
                label: label.to_string(),
                words: Mutex::new(words),
                acquired: AtomicBool::new(false),
            }),
        })
    }

    fn update_vertex_buffer(&mut self, buffer: &CpuSharedBuffer, data: &[u8]) -> Result<(), RasterError> {
        if buffer.cell.acquired.load(Ordering::SeqCst) {
            let msg = format!("raster update of `{}` while owned by compute", buffer.cell.label);
            self.trace.push(TraceEvent::Violation(msg.clone()));
            return Err(RasterError::BufferUpdate(msg));
        }
        let mut words = lock(&buffer.cell.words);
        let incoming = bytes_to_words(data)
            .filter(|w| w.len() == words.len())
            .ok_or_else(|| RasterError::BufferUpdate(format!("{} bytes does not match buffer size", data.len())))?;
        *words = incoming;
        Ok(())
    }

    fn finish(&mut self) {
        self.trace.push(TraceEvent::RasterFinish);
    }

    fn draw_points(
        &mut self,
        position: &CpuSharedBuffer,
        color: &CpuSharedBuffer,
        count: usize,
    ) -> Result<(), RasterError> {
        for buf in [position, color] {
            if buf.cell.acquired.load(Ordering::SeqCst) {
                let msg = format!("draw from `{}` while owned by compute", buf.cell.label);
                self.trace.push(TraceEvent::Violation(msg.clone()));
                return Err(RasterError::Draw(msg));
            }
        }
        self.draws += 1;
        self.trace.push(TraceEvent::Draw { count });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CpuContext {
    device: DeviceId,
    shared: bool,
}

#[derive(Debug)]
enum Storage {
    Owned(Vec<u32>),
    Shared(Arc<SharedCell>),
}

#[derive(Debug)]
struct CpuMem {
    access: MemAccess,
    storage: Storage,
}

impl CpuMem {
    fn byte_len(&self) -> usize {
        match &self.storage {
            Storage::Owned(w) => w.len() * 4,
            Storage::Shared(cell) => lock(&cell.words).len() * 4,
        }
    }

    fn shared_acquired(&self) -> Option<bool> {
        match &self.storage {
            Storage::Owned(_) => None,
            Storage::Shared(cell) => Some(cell.acquired.load(Ordering::SeqCst)),
        }
    }

    fn snapshot(&self) -> Vec<u32> {
        match &self.storage {
            Storage::Owned(w) => w.clone(),
            Storage::Shared(cell) => lock(&cell.words).clone(),
        }
    }

    fn store(&mut self, words: Vec<u32>) {
        match &mut self.storage {
            Storage::Owned(w) => *w = words,
            Storage::Shared(cell) => *lock(&cell.words) = words,
        }
    }
}

#[derive(Debug)]
struct CpuProgram {
    source: String,
    info: Option<ProgramInfo>,
    log: String,
}

struct CpuKernel {
    entry: EntryPointInfo,
    func: CpuKernelFn,
    args: BTreeMap<u32, RawArg>,
}

/// Deterministic host-memory compute backend.
pub struct CpuBackend {
    instance: u64,
    platforms: Vec<CpuPlatformSpec>,
    registry: HashMap<String, CpuKernelFn>,
    next_id: u64,
    contexts: HashMap<ContextId, CpuContext>,
    queues: HashMap<QueueId, ContextId>,
    programs: HashMap<ProgramId, CpuProgram>,
    kernels: HashMap<KernelId, CpuKernel>,
    mems: HashMap<MemId, CpuMem>,
    faults: FaultPlan,
    trace: Trace,
    dispatches: u64,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    /// One platform with one interop-capable GPU-class device.
    pub fn new() -> Self {
        Self::with_platforms(vec![CpuPlatformSpec::new(
            "Reference",
            "interop reference",
            vec![CpuDeviceSpec::gpu("reference-gpu", true)],
        )])
    }

    pub fn with_platforms(platforms: Vec<CpuPlatformSpec>) -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            platforms,
            registry: HashMap::new(),
            next_id: 1,
            contexts: HashMap::new(),
            queues: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            mems: HashMap::new(),
            faults: FaultPlan::default(),
            trace: Trace::default(),
            dispatches: 0,
        }
    }

    /// Provide the host body for WGSL entry point `name`.
    pub fn register_kernel<F>(&mut self, name: &str, f: F)
    where
        F: Fn(usize, &mut CpuArgs) + Send + Sync + 'static,
    {
        self.registry.insert(name.to_string(), Arc::new(f));
    }

    /// Rasterizer sharing this backend's trace.
    pub fn raster_session(&self) -> CpuRaster {
        CpuRaster {
            group: CpuShareGroup { instance: self.instance },
            trace: self.trace.clone(),
            draws: 0,
        }
    }

    pub fn faults(&self) -> FaultPlan {
        self.faults.clone()
    }

    pub fn trace(&self) -> Trace {
        self.trace.clone()
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.mems.len()
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    fn check(&self, op: CpuOp) -> BackendResult<()> {
        match self.faults.take(op) {
            Some(status) => {
                debug!(?op, %status, "injected fault");
                self.trace.push(TraceEvent::Fault(op, status));
                Err(status)
            }
            None => Ok(()),
        }
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn device_spec(&self, device: DeviceId) -> Option<(usize, &CpuDeviceSpec)> {
        let (p, d) = split_device_id(device);
        self.platforms.get(p).and_then(|pl| pl.devices.get(d)).map(|spec| (p, spec))
    }

    fn interop_mems(&self, mems: &[MemId]) -> BackendResult<Vec<Arc<SharedCell>>> {
        mems.iter()
            .map(|m| match self.mems.get(m).map(|mem| &mem.storage) {
                Some(Storage::Shared(cell)) => Ok(cell.clone()),
                Some(Storage::Owned(_)) => Err(Status::InvalidSharedObject),
                None => Err(Status::InvalidMemObject),
            })
            .collect()
    }

    fn shared_context(&self, queue: QueueId) -> BackendResult<()> {
        let ctx = self.queues.get(&queue).ok_or(Status::InvalidCommandQueue)?;
        match self.contexts.get(ctx) {
            Some(c) if c.shared => Ok(()),
            Some(_) => Err(Status::InvalidContext),
            None => Err(Status::InvalidContext),
        }
    }

    fn host_accessible(&self, mem: MemId) -> BackendResult<&CpuMem> {
        let m = self.mems.get(&mem).ok_or(Status::InvalidMemObject)?;
        if m.shared_acquired() == Some(false) {
            return Err(Status::InvalidSharedObject);
        }
        Ok(m)
    }
}

fn device_id(platform: usize, device: usize) -> DeviceId {
    DeviceId(((platform as u64) << 32) | device as u64)
}

fn split_device_id(id: DeviceId) -> (usize, usize) {
    ((id.0 >> 32) as usize, (id.0 & 0xffff_ffff) as usize)
}

impl ComputeBackend for CpuBackend {
    type ShareGroup = CpuShareGroup;
    type SharedBuffer = CpuSharedBuffer;

    fn name(&self) -> &str {
        "cpu-reference"
    }

    fn platforms(&mut self) -> BackendResult<Vec<PlatformInfo>> {
        self.check(CpuOp::Platforms)?;
        Ok(self
            .platforms
            .iter()
            .enumerate()
            .map(|(i, p)| PlatformInfo {
                id: PlatformId(i as u64),
                name: p.name.clone(),
                vendor: p.vendor.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                interop_extension: REFERENCE_SHARING_EXTENSION.to_string(),
            })
            .collect())
    }

    fn devices(&mut self, platform: PlatformId) -> BackendResult<Vec<DeviceInfo>> {
        self.check(CpuOp::Devices)?;
        let p = platform.0 as usize;
        let spec = self.platforms.get(p).ok_or(Status::InvalidPlatform)?;
        Ok(spec
            .devices
            .iter()
            .enumerate()
            .map(|(d, dev)| DeviceInfo {
                id: device_id(p, d),
                name: dev.name.clone(),
                vendor: spec.vendor.clone(),
                class: dev.class,
                extensions: dev.extensions.clone(),
                max_work_group_size: 256,
                driver: "host".to_string(),
            })
            .collect())
    }

    fn create_context(
        &mut self,
        platform: PlatformId,
        device: DeviceId,
        share: Option<&CpuShareGroup>,
    ) -> BackendResult<ContextId> {
        self.check(CpuOp::CreateContext)?;
        let (p, spec) = self.device_spec(device).ok_or(Status::InvalidDevice)?;
        if p as u64 != platform.0 {
            return Err(Status::InvalidPlatform);
        }
        if let Some(group) = share {
            if group.instance != self.instance {
                return Err(Status::InvalidShareGroupReference);
            }
            if !spec.extensions.iter().any(|e| e == REFERENCE_SHARING_EXTENSION) {
                return Err(Status::InvalidOperation);
            }
        }
        let id = ContextId(self.next());
        self.contexts.insert(
            id,
            CpuContext {
                device,
                shared: share.is_some(),
            },
        );
        Ok(id)
    }

    fn create_queue(&mut self, context: ContextId, device: DeviceId) -> BackendResult<QueueId> {
        self.check(CpuOp::CreateQueue)?;
        let ctx = self.contexts.get(&context).ok_or(Status::InvalidContext)?;
        if ctx.device != device {
            return Err(Status::InvalidDevice);
        }
        let id = QueueId(self.next());
        self.queues.insert(id, context);
        Ok(id)
    }

    fn create_program(&mut self, context: ContextId, source: &str) -> BackendResult<ProgramId> {
        self.check(CpuOp::CreateProgram)?;
        if !self.contexts.contains_key(&context) {
            return Err(Status::InvalidContext);
        }
        if source.is_empty() {
            return Err(Status::InvalidValue);
        }
        let id = ProgramId(self.next());
        self.programs.insert(
            id,
            CpuProgram {
                source: source.to_string(),
                info: None,
                log: String::new(),
            },
        );
        Ok(id)
    }

    fn build_program(&mut self, program: ProgramId, _device: DeviceId) -> BackendResult<()> {
        self.check(CpuOp::BuildProgram)?;
        let prog = self.programs.get_mut(&program).ok_or(Status::InvalidProgram)?;
        match reflect_wgsl(&prog.source) {
            Ok(info) => {
                prog.info = Some(info);
                prog.log.clear();
                Ok(())
            }
            Err(log) => {
                prog.info = None;
                prog.log = log;
                Err(Status::BuildProgramFailure)
            }
        }
    }

    fn build_log(&mut self, program: ProgramId, _device: DeviceId) -> BackendResult<String> {
        self.check(CpuOp::BuildLog)?;
        self.programs
            .get(&program)
            .map(|p| p.log.clone())
            .ok_or(Status::InvalidProgram)
    }

    fn create_kernel(&mut self, program: ProgramId, name: &str) -> BackendResult<KernelId> {
        self.check(CpuOp::CreateKernel)?;
        let prog = self.programs.get(&program).ok_or(Status::InvalidProgram)?;
        let info = prog.info.as_ref().ok_or(Status::InvalidProgramExecutable)?;
        let entry = info.entry_point(name).ok_or(Status::InvalidKernelName)?.clone();
        let func = self.registry.get(name).cloned().ok_or(Status::InvalidKernelDefinition)?;
        let id = KernelId(self.next());
        self.kernels.insert(
            id,
            CpuKernel {
                entry,
                func,
                args: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn kernel_arg_slots(&self, kernel: KernelId) -> BackendResult<Vec<u32>> {
        self.check(CpuOp::KernelArgSlots)?;
        let k = self.kernels.get(&kernel).ok_or(Status::InvalidKernel)?;
        Ok(k.entry.args.iter().map(|a| a.slot).collect())
    }

    fn set_kernel_arg(&mut self, kernel: KernelId, slot: u32, arg: RawArg) -> BackendResult<()> {
        self.check(CpuOp::SetKernelArg)?;
        let mems = &self.mems;
        let k = self.kernels.get_mut(&kernel).ok_or(Status::InvalidKernel)?;
        let declared = k.entry.arg(slot).ok_or(Status::InvalidArgIndex)?;
        match (declared.kind, arg) {
            (ArgKind::Buffer { .. }, RawArg::Mem(m)) => {
                if !mems.contains_key(&m) {
                    return Err(Status::InvalidMemObject);
                }
            }
            (ArgKind::Scalar(ty), RawArg::Scalar(s)) if s.scalar_type() == ty => {}
            _ => return Err(Status::InvalidArgValue),
        }
        k.args.insert(slot, arg);
        Ok(())
    }

    fn create_buffer(
        &mut self,
        context: ContextId,
        access: MemAccess,
        size: u64,
        init: Option<&[u8]>,
    ) -> BackendResult<MemId> {
        self.check(CpuOp::CreateBuffer)?;
        if !self.contexts.contains_key(&context) {
            return Err(Status::InvalidContext);
        }
        if size == 0 || size % 4 != 0 {
            return Err(Status::InvalidBufferSize);
        }
        let words = match init {
            Some(data) if data.len() as u64 != size => return Err(Status::InvalidHostPtr),
            Some(data) => bytes_to_words(data).ok_or(Status::InvalidHostPtr)?,
            None => vec![0; (size / 4) as usize],
        };
        let id = MemId(self.next());
        self.mems.insert(
            id,
            CpuMem {
                access,
                storage: Storage::Owned(words),
            },
        );
        Ok(id)
    }

    fn create_from_shared(
        &mut self,
        context: ContextId,
        access: MemAccess,
        shared: &CpuSharedBuffer,
    ) -> BackendResult<MemId> {
        self.check(CpuOp::CreateFromShared)?;
        let ctx = self.contexts.get(&context).ok_or(Status::InvalidContext)?;
        if !ctx.shared {
            return Err(Status::InvalidContext);
        }
        if shared.cell.instance != self.instance {
            return Err(Status::InvalidShareGroupReference);
        }
        let id = MemId(self.next());
        self.mems.insert(
            id,
            CpuMem {
                access,
                storage: Storage::Shared(shared.cell.clone()),
            },
        );
        Ok(id)
    }

    fn mem_size(&self, mem: MemId) -> BackendResult<u64> {
        self.mems
            .get(&mem)
            .map(|m| m.byte_len() as u64)
            .ok_or(Status::InvalidMemObject)
    }

    fn write_buffer(&mut self, queue: QueueId, mem: MemId, offset: u64, data: &[u8]) -> BackendResult<()> {
        self.check(CpuOp::WriteBuffer)?;
        if !self.queues.contains_key(&queue) {
            return Err(Status::InvalidCommandQueue);
        }
        self.host_accessible(mem)?;
        let incoming = bytes_to_words(data).ok_or(Status::InvalidValue)?;
        if offset % 4 != 0 {
            return Err(Status::InvalidValue);
        }
        let m = self.mems.get_mut(&mem).ok_or(Status::InvalidMemObject)?;
        let mut words = m.snapshot();
        let start = (offset / 4) as usize;
        let end = start + incoming.len();
        if end > words.len() {
            return Err(Status::InvalidValue);
        }
        words[start..end].copy_from_slice(&incoming);
        m.store(words);
        Ok(())
    }

    fn read_buffer(&mut self, queue: QueueId, mem: MemId, offset: u64, out: &mut [u8]) -> BackendResult<()> {
        self.check(CpuOp::ReadBuffer)?;
        if !self.queues.contains_key(&queue) {
            return Err(Status::InvalidCommandQueue);
        }
        let words = self.host_accessible(mem)?.snapshot();
        let bytes: &[u8] = bytemuck::cast_slice(words.as_slice());
        let start = offset as usize;
        let end = start + out.len();
        if end > bytes.len() {
            return Err(Status::InvalidValue);
        }
        out.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn enqueue_acquire_shared(&mut self, queue: QueueId, mems: &[MemId]) -> BackendResult<()> {
        self.check(CpuOp::AcquireShared)?;
        self.shared_context(queue)?;
        let cells = self.interop_mems(mems)?;
        if cells.iter().any(|c| c.acquired.load(Ordering::SeqCst)) {
            return Err(Status::InvalidOperation);
        }
        for c in &cells {
            c.acquired.store(true, Ordering::SeqCst);
        }
        self.trace.push(TraceEvent::Acquire(mems.to_vec()));
        Ok(())
    }

    /// Releasing a buffer the rasterizer already owns is a no-op.
    fn enqueue_release_shared(&mut self, queue: QueueId, mems: &[MemId]) -> BackendResult<()> {
        self.check(CpuOp::ReleaseShared)?;
        self.shared_context(queue)?;
        let cells = self.interop_mems(mems)?;
        for c in &cells {
            c.acquired.store(false, Ordering::SeqCst);
        }
        self.trace.push(TraceEvent::Release(mems.to_vec()));
        Ok(())
    }

    fn enqueue_kernel(&mut self, queue: QueueId, kernel: KernelId, global: usize) -> BackendResult<()> {
        self.check(CpuOp::EnqueueKernel)?;
        if !self.queues.contains_key(&queue) {
            return Err(Status::InvalidCommandQueue);
        }
        if global == 0 {
            return Err(Status::InvalidGlobalWorkSize);
        }
        let k = self.kernels.get(&kernel).ok_or(Status::InvalidKernel)?;

        let mut args = CpuArgs::default();
        let mut writeback = Vec::new();
        for slot in &k.entry.args {
            let raw = k.args.get(&slot.slot).ok_or(Status::InvalidKernelArgs)?;
            match *raw {
                RawArg::Mem(m) => {
                    let mem = self.mems.get(&m).ok_or(Status::InvalidMemObject)?;
                    if mem.shared_acquired() == Some(false) {
                        self.trace.push(TraceEvent::Violation(format!(
                            "dispatch of `{}` with rasterizer-owned buffer in slot {}",
                            k.entry.name, slot.slot
                        )));
                        return Err(Status::InvalidSharedObject);
                    }
                    args.slots.insert(slot.slot, ArgData::Words(mem.snapshot()));
                    if matches!(slot.kind, ArgKind::Buffer { writable: true }) && mem.access.kernel_writable() {
                        writeback.push((slot.slot, m));
                    }
                }
                RawArg::Scalar(s) => {
                    args.slots.insert(slot.slot, ArgData::Scalar(s.to_bits()));
                }
            }
        }

        let func = k.func.clone();
        let name = k.entry.name.clone();
        for gid in 0..global {
            func(gid, &mut args);
        }

        for (slot, m) in writeback {
            if let (Some(ArgData::Words(words)), Some(mem)) = (args.slots.remove(&slot), self.mems.get_mut(&m)) {
                mem.store(words);
            }
        }
        self.dispatches += 1;
        self.trace.push(TraceEvent::Dispatch { kernel: name, global });
        Ok(())
    }

    fn finish(&mut self, queue: QueueId) -> BackendResult<()> {
        self.check(CpuOp::Finish)?;
        if !self.queues.contains_key(&queue) {
            return Err(Status::InvalidCommandQueue);
        }
        self.trace.push(TraceEvent::Finish);
        Ok(())
    }

    fn release_mem(&mut self, mem: MemId) -> BackendResult<()> {
        self.mems.remove(&mem).ok_or(Status::InvalidMemObject)?;
        self.trace.push(TraceEvent::Released("mem"));
        Ok(())
    }

    fn release_kernel(&mut self, kernel: KernelId) -> BackendResult<()> {
        self.kernels.remove(&kernel).ok_or(Status::InvalidKernel)?;
        self.trace.push(TraceEvent::Released("kernel"));
        Ok(())
    }

    fn release_program(&mut self, program: ProgramId) -> BackendResult<()> {
        self.programs.remove(&program).ok_or(Status::InvalidProgram)?;
        self.trace.push(TraceEvent::Released("program"));
        Ok(())
    }

    fn release_queue(&mut self, queue: QueueId) -> BackendResult<()> {
        self.queues.remove(&queue).ok_or(Status::InvalidCommandQueue)?;
        self.trace.push(TraceEvent::Released("queue"));
        Ok(())
    }

    fn release_context(&mut self, context: ContextId) -> BackendResult<()> {
        self.contexts.remove(&context).ok_or(Status::InvalidContext)?;
        self.trace.push(TraceEvent::Released("context"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_plan_one_shot_and_persistent() {
        let plan = FaultPlan::default();
        plan.fail_next(CpuOp::Finish, Status::OutOfResources);
        assert_eq!(plan.take(CpuOp::Finish), Some(Status::OutOfResources));
        assert_eq!(plan.take(CpuOp::Finish), None);

        plan.fail_always(CpuOp::Finish, Status::OutOfResources);
        assert_eq!(plan.take(CpuOp::Finish), Some(Status::OutOfResources));
        assert_eq!(plan.take(CpuOp::Finish), Some(Status::OutOfResources));
        plan.clear();
        assert_eq!(plan.take(CpuOp::Finish), None);
    }

    #[test]
    fn test_foreign_share_group_rejected() {
        let mut a = CpuBackend::new();
        let b = CpuBackend::new();
        let foreign = b.raster_session();
        let platforms = a.platforms().unwrap();
        let devices = a.devices(platforms[0].id).unwrap();
        assert_eq!(
            a.create_context(platforms[0].id, devices[0].id, Some(foreign.share_group())),
            Err(Status::InvalidShareGroupReference)
        );
    }

    #[test]
    fn test_args_out_of_range_are_robust() {
        let mut args = CpuArgs::default();
        args.slots.insert(0, ArgData::Words(vec![0; 4]));
        args.set_vec4(0, 5, [1.0; 4]);
        assert_eq!(args.vec4(0, 5), [0.0; 4]);
        assert_eq!(args.records(0), 1);
        assert_eq!(args.scalar_f32(9), 0.0);
    }

    #[test]
    fn test_draw_while_acquired_is_violation() {
        let mut backend = CpuBackend::new();
        let mut raster = backend.raster_session();
        let platforms = backend.platforms().unwrap();
        let devices = backend.devices(platforms[0].id).unwrap();
        let ctx = backend
            .create_context(platforms[0].id, devices[0].id, Some(raster.share_group()))
            .unwrap();
        let queue = backend.create_queue(ctx, devices[0].id).unwrap();
        let buf = raster.create_vertex_buffer("pos", &[0u8; 32]).unwrap();
        let mem = backend.create_from_shared(ctx, MemAccess::ReadWrite, &buf).unwrap();

        backend.enqueue_acquire_shared(queue, &[mem]).unwrap();
        assert!(raster.draw_points(&buf, &buf, 2).is_err());
        backend.enqueue_release_shared(queue, &[mem]).unwrap();
        raster.draw_points(&buf, &buf, 2).unwrap();
        assert_eq!(backend.trace().violations().len(), 1);
        assert_eq!(raster.draws(), 1);
    }
}
