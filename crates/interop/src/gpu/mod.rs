//! wgpu implementation of the compute backend (Metal/Vulkan/DX12/GL).
//!
//! # Mapping
//! - Platform: one per (graphics API, PCI vendor) group of adapters.
//! - Device: one adapter. Device class comes from the adapter type; the
//!   extension list is the adapter's downlevel flags and a few feature names.
//!   The interop token is `COMPUTE_SHADERS`.
//! - Context: a `wgpu::Device` + `wgpu::Queue`. A context created from a
//!   [`WgpuShareGroup`] adopts the rasterizer's device and queue, so buffers
//!   the rasterizer creates are directly usable by compute.
//! - Program: WGSL, reflected with naga and compiled to a shader module.
//! - Kernel: a compute pipeline with an automatic layout; argument slots are
//!   `@group(0)` bindings. Scalars live in small per-slot uniform buffers.
//! - Acquire/release: ownership flags on the shared buffer. Both runtimes
//!   submit to the same queue, so queue order plus `finish` gives the barrier.
//!
//! Validation and out-of-memory errors are caught with error scopes and
//! mapped to [`Status`] codes.
//!
//! Kernels are dispatched in whole workgroups; entry points must guard with
//! `arrayLength` so the extra invocations do nothing.

pub mod raster;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};
use wgpu::util::DeviceExt;

use crate::backend::{
    BackendResult, ComputeBackend, ContextId, DeviceClass, DeviceId, DeviceInfo, KernelId, MemAccess, MemId,
    PlatformId, PlatformInfo, ProgramId, QueueId, RawArg,
};
use crate::error::Status;
use crate::program::{reflect_wgsl, ArgKind, EntryPointInfo, ProgramInfo};

pub use raster::WgpuRaster;

/// Interop capability token for wgpu devices.
pub const INTEROP_TOKEN: &str = "COMPUTE_SHADERS";

/// Size of the uniform buffer backing one scalar argument.
const SCALAR_BUFFER_SIZE: u64 = 16;

/// Check whether any wgpu adapter is available.
pub fn gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    adapter.is_some()
}

// ---------------------------------------------------------------------------
// Shared objects
// ---------------------------------------------------------------------------

/// Identity of an adapter, used to match share groups to devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterKey {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub backend: wgpu::Backend,
}

impl AdapterKey {
    pub fn of(adapter: &wgpu::Adapter) -> Self {
        let info = adapter.get_info();
        Self {
            name: info.name,
            vendor: info.vendor,
            device: info.device,
            backend: info.backend,
        }
    }
}

/// Device and queue of an active rasterizer.
#[derive(Debug, Clone)]
pub struct WgpuShareGroup {
    pub(crate) device: Arc<wgpu::Device>,
    pub(crate) queue: Arc<wgpu::Queue>,
    pub(crate) adapter: AdapterKey,
}

/// Vertex buffer created by a [`WgpuRaster`].
#[derive(Debug, Clone)]
pub struct WgpuSharedBuffer {
    pub(crate) buffer: Arc<wgpu::Buffer>,
    pub(crate) device: Arc<wgpu::Device>,
    /// Set while compute owns the buffer.
    pub(crate) acquired: Arc<AtomicBool>,
    pub(crate) label: String,
}

impl WgpuSharedBuffer {
    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub(crate) fn compute_owned(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Error scopes
// ---------------------------------------------------------------------------

/// Failure captured by [`scoped`].
#[derive(Debug)]
pub(crate) struct ScopeError {
    pub status: Status,
    pub message: String,
}

/// Run `f` inside validation and out-of-memory error scopes.
pub(crate) fn scoped<T>(device: &wgpu::Device, on_validation: Status, f: impl FnOnce() -> T) -> Result<T, ScopeError> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let oom = pollster::block_on(device.pop_error_scope());

    if let Some(e) = oom {
        return Err(ScopeError {
            status: Status::MemObjectAllocationFailure,
            message: e.to_string(),
        });
    }
    if let Some(e) = validation {
        debug!("wgpu validation error: {e}");
        return Err(ScopeError {
            status: on_validation,
            message: e.to_string(),
        });
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Backend state
// ---------------------------------------------------------------------------

struct GpuContext {
    adapter: usize,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    shared: bool,
}

struct GpuProgram {
    context: ContextId,
    source: String,
    module: Option<wgpu::ShaderModule>,
    info: Option<ProgramInfo>,
    log: String,
}

enum GpuArg {
    Mem(MemId),
    Scalar(wgpu::Buffer),
}

struct GpuKernel {
    context: ContextId,
    entry: EntryPointInfo,
    pipeline: wgpu::ComputePipeline,
    args: BTreeMap<u32, GpuArg>,
}

struct GpuMem {
    context: ContextId,
    buffer: Arc<wgpu::Buffer>,
    shared: Option<Arc<AtomicBool>>,
}

impl GpuMem {
    fn host_accessible(&self) -> bool {
        self.shared.as_ref().map_or(true, |f| f.load(Ordering::SeqCst))
    }
}

/// Compute backend over every wgpu adapter on the host.
pub struct WgpuBackend {
    adapters: Vec<wgpu::Adapter>,
    platforms: Vec<(wgpu::Backend, u32)>,
    next_id: u64,
    contexts: HashMap<ContextId, GpuContext>,
    queues: HashMap<QueueId, ContextId>,
    programs: HashMap<ProgramId, GpuProgram>,
    kernels: HashMap<KernelId, GpuKernel>,
    mems: HashMap<MemId, GpuMem>,
}

impl Default for WgpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WgpuBackend {
    /// Enumerate adapters on every wgpu backend.
    pub fn new() -> Self {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapters = instance.enumerate_adapters(wgpu::Backends::all());

        let mut platforms: Vec<(wgpu::Backend, u32)> = Vec::new();
        for a in &adapters {
            let info = a.get_info();
            let key = (info.backend, info.vendor);
            if !platforms.contains(&key) {
                platforms.push(key);
            }
        }
        info!(adapters = adapters.len(), platforms = platforms.len(), "wgpu adapters enumerated");

        Self {
            adapters,
            platforms,
            next_id: 1,
            contexts: HashMap::new(),
            queues: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            mems: HashMap::new(),
        }
    }

    /// Adapter behind a device id, for opening a rasterizer on the same GPU.
    pub fn adapter(&self, device: DeviceId) -> Option<&wgpu::Adapter> {
        self.adapters.get(device.0 as usize)
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn context_of_queue(&self, queue: QueueId) -> BackendResult<&GpuContext> {
        let ctx = self.queues.get(&queue).ok_or(Status::InvalidCommandQueue)?;
        self.contexts.get(ctx).ok_or(Status::InvalidContext)
    }

    fn shared_flags(&self, mems: &[MemId]) -> BackendResult<Vec<Arc<AtomicBool>>> {
        mems.iter()
            .map(|m| {
                let mem = self.mems.get(m).ok_or(Status::InvalidMemObject)?;
                mem.shared.clone().ok_or(Status::InvalidSharedObject)
            })
            .collect()
    }
}

fn vendor_name(id: u32) -> String {
    match id {
        0x10de => "NVIDIA Corporation".to_string(),
        0x1002 | 0x1022 => "Advanced Micro Devices, Inc.".to_string(),
        0x8086 => "Intel(R) Corporation".to_string(),
        0x106b => "Apple".to_string(),
        0x13b5 => "ARM".to_string(),
        0x5143 => "Qualcomm".to_string(),
        0x10005 => "Mesa".to_string(),
        0 => "unknown".to_string(),
        other => format!("0x{other:04x}"),
    }
}

fn device_class(ty: wgpu::DeviceType) -> DeviceClass {
    match ty {
        wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu | wgpu::DeviceType::VirtualGpu => {
            DeviceClass::Gpu
        }
        wgpu::DeviceType::Cpu => DeviceClass::Cpu,
        wgpu::DeviceType::Other => DeviceClass::Other,
    }
}

fn capability_tokens(adapter: &wgpu::Adapter) -> Vec<String> {
    let downlevel = adapter.get_downlevel_capabilities().flags;
    let features = adapter.features();
    let mut out = Vec::new();
    for (flag, name) in [
        (wgpu::DownlevelFlags::COMPUTE_SHADERS, INTEROP_TOKEN),
        (wgpu::DownlevelFlags::VERTEX_STORAGE, "VERTEX_STORAGE"),
        (wgpu::DownlevelFlags::INDIRECT_EXECUTION, "INDIRECT_EXECUTION"),
        (wgpu::DownlevelFlags::FRAGMENT_WRITABLE_STORAGE, "FRAGMENT_WRITABLE_STORAGE"),
    ] {
        if downlevel.contains(flag) {
            out.push(name.to_string());
        }
    }
    for (flag, name) in [
        (wgpu::Features::TIMESTAMP_QUERY, "TIMESTAMP_QUERY"),
        (wgpu::Features::SHADER_F16, "SHADER_F16"),
        (wgpu::Features::MAPPABLE_PRIMARY_BUFFERS, "MAPPABLE_PRIMARY_BUFFERS"),
    ] {
        if features.contains(flag) {
            out.push(name.to_string());
        }
    }
    out
}

fn device_error(e: wgpu::RequestDeviceError) -> Status {
    debug!("request_device failed: {e}");
    Status::DeviceNotAvailable
}

impl ComputeBackend for WgpuBackend {
    type ShareGroup = WgpuShareGroup;
    type SharedBuffer = WgpuSharedBuffer;

    fn name(&self) -> &str {
        "wgpu"
    }

    fn platforms(&mut self) -> BackendResult<Vec<PlatformInfo>> {
        Ok(self
            .platforms
            .iter()
            .enumerate()
            .map(|(i, (backend, vendor))| PlatformInfo {
                id: PlatformId(i as u64),
                name: format!("{backend:?}"),
                vendor: vendor_name(*vendor),
                version: format!("wgpu/{backend:?}"),
                interop_extension: INTEROP_TOKEN.to_string(),
            })
            .collect())
    }

    fn devices(&mut self, platform: PlatformId) -> BackendResult<Vec<DeviceInfo>> {
        let key = *self.platforms.get(platform.0 as usize).ok_or(Status::InvalidPlatform)?;
        Ok(self
            .adapters
            .iter()
            .enumerate()
            .filter(|(_, a)| {
                let info = a.get_info();
                (info.backend, info.vendor) == key
            })
            .map(|(i, a)| {
                let info = a.get_info();
                DeviceInfo {
                    id: DeviceId(i as u64),
                    name: info.name.clone(),
                    vendor: vendor_name(info.vendor),
                    class: device_class(info.device_type),
                    extensions: capability_tokens(a),
                    max_work_group_size: a.limits().max_compute_invocations_per_workgroup,
                    driver: format!("{} {}", info.driver, info.driver_info).trim().to_string(),
                }
            })
            .collect())
    }

    fn create_context(
        &mut self,
        platform: PlatformId,
        device: DeviceId,
        share: Option<&WgpuShareGroup>,
    ) -> BackendResult<ContextId> {
        let index = device.0 as usize;
        let adapter = self.adapters.get(index).ok_or(Status::InvalidDevice)?;
        let info = adapter.get_info();
        if self.platforms.get(platform.0 as usize) != Some(&(info.backend, info.vendor)) {
            return Err(Status::InvalidPlatform);
        }

        let (dev, queue, shared) = match share {
            Some(group) => {
                if group.adapter != AdapterKey::of(adapter) {
                    return Err(Status::InvalidShareGroupReference);
                }
                if !adapter
                    .get_downlevel_capabilities()
                    .flags
                    .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
                {
                    return Err(Status::InvalidOperation);
                }
                (group.device.clone(), group.queue.clone(), true)
            }
            None => {
                let (d, q) = pollster::block_on(adapter.request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("compute_device"),
                        required_features: wgpu::Features::empty(),
                        required_limits: adapter.limits(),
                        memory_hints: wgpu::MemoryHints::Performance,
                    },
                    None,
                ))
                .map_err(device_error)?;
                (Arc::new(d), Arc::new(q), false)
            }
        };

        let id = ContextId(self.next());
        self.contexts.insert(
            id,
            GpuContext {
                adapter: index,
                device: dev,
                queue,
                shared,
            },
        );
        Ok(id)
    }

    fn create_queue(&mut self, context: ContextId, device: DeviceId) -> BackendResult<QueueId> {
        let ctx = self.contexts.get(&context).ok_or(Status::InvalidContext)?;
        if ctx.adapter != device.0 as usize {
            return Err(Status::InvalidDevice);
        }
        // wgpu exposes one queue per device; it is already in-order.
        let id = QueueId(self.next());
        self.queues.insert(id, context);
        Ok(id)
    }

    fn create_program(&mut self, context: ContextId, source: &str) -> BackendResult<ProgramId> {
        if !self.contexts.contains_key(&context) {
            return Err(Status::InvalidContext);
        }
        if source.is_empty() {
            return Err(Status::InvalidValue);
        }
        let id = ProgramId(self.next());
        self.programs.insert(
            id,
            GpuProgram {
                context,
                source: source.to_string(),
                module: None,
                info: None,
                log: String::new(),
            },
        );
        Ok(id)
    }

    fn build_program(&mut self, program: ProgramId, _device: DeviceId) -> BackendResult<()> {
        let prog = self.programs.get_mut(&program).ok_or(Status::InvalidProgram)?;
        let ctx = self.contexts.get(&prog.context).ok_or(Status::InvalidContext)?;

        let info = match reflect_wgsl(&prog.source) {
            Ok(info) => info,
            Err(log) => {
                prog.log = log;
                return Err(Status::BuildProgramFailure);
            }
        };
        let source = prog.source.clone();
        let module = scoped(&ctx.device, Status::BuildProgramFailure, || {
            ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("kernel_program"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        });
        match module {
            Ok(m) => {
                prog.module = Some(m);
                prog.info = Some(info);
                prog.log.clear();
                Ok(())
            }
            Err(e) => {
                prog.log = e.message;
                Err(e.status)
            }
        }
    }

    fn build_log(&mut self, program: ProgramId, _device: DeviceId) -> BackendResult<String> {
        self.programs
            .get(&program)
            .map(|p| p.log.clone())
            .ok_or(Status::InvalidProgram)
    }

    fn create_kernel(&mut self, program: ProgramId, name: &str) -> BackendResult<KernelId> {
        let prog = self.programs.get(&program).ok_or(Status::InvalidProgram)?;
        let (module, info) = match (&prog.module, &prog.info) {
            (Some(m), Some(i)) => (m, i),
            _ => return Err(Status::InvalidProgramExecutable),
        };
        let entry = info.entry_point(name).ok_or(Status::InvalidKernelName)?.clone();
        let ctx = self.contexts.get(&prog.context).ok_or(Status::InvalidContext)?;

        let pipeline = scoped(&ctx.device, Status::InvalidKernelDefinition, || {
            ctx.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: None,
                module,
                entry_point: Some(name),
                compilation_options: Default::default(),
                cache: None,
            })
        })
        .map_err(|e| e.status)?;

        let context = prog.context;
        let id = KernelId(self.next());
        self.kernels.insert(
            id,
            GpuKernel {
                context,
                entry,
                pipeline,
                args: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn kernel_arg_slots(&self, kernel: KernelId) -> BackendResult<Vec<u32>> {
        let k = self.kernels.get(&kernel).ok_or(Status::InvalidKernel)?;
        Ok(k.entry.args.iter().map(|a| a.slot).collect())
    }

    fn set_kernel_arg(&mut self, kernel: KernelId, slot: u32, arg: RawArg) -> BackendResult<()> {
        let k = self.kernels.get_mut(&kernel).ok_or(Status::InvalidKernel)?;
        let declared = k.entry.arg(slot).ok_or(Status::InvalidArgIndex)?;
        let ctx = self.contexts.get(&k.context).ok_or(Status::InvalidContext)?;

        let value = match (declared.kind, arg) {
            (ArgKind::Buffer { .. }, RawArg::Mem(m)) => match self.mems.get(&m) {
                Some(mem) if mem.context == k.context => GpuArg::Mem(m),
                Some(_) => return Err(Status::InvalidContext),
                None => return Err(Status::InvalidMemObject),
            },
            (ArgKind::Scalar(ty), RawArg::Scalar(s)) if s.scalar_type() == ty => {
                let mut bytes = [0u8; SCALAR_BUFFER_SIZE as usize];
                bytes[..4].copy_from_slice(&s.to_bits().to_ne_bytes());
                match k.args.get(&slot) {
                    Some(GpuArg::Scalar(buf)) => {
                        ctx.queue.write_buffer(buf, 0, &bytes);
                        return Ok(());
                    }
                    _ => GpuArg::Scalar(ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("scalar_arg"),
                        contents: &bytes,
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    })),
                }
            }
            _ => return Err(Status::InvalidArgValue),
        };
        k.args.insert(slot, value);
        Ok(())
    }

    fn create_buffer(
        &mut self,
        context: ContextId,
        _access: MemAccess,
        size: u64,
        init: Option<&[u8]>,
    ) -> BackendResult<MemId> {
        let ctx = self.contexts.get(&context).ok_or(Status::InvalidContext)?;
        if size == 0 || size % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Status::InvalidBufferSize);
        }
        if size > ctx.device.limits().max_storage_buffer_binding_size as u64 {
            return Err(Status::InvalidBufferSize);
        }
        if init.is_some_and(|d| d.len() as u64 != size) {
            return Err(Status::InvalidHostPtr);
        }
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;

        let buffer = scoped(&ctx.device, Status::MemObjectAllocationFailure, || match init {
            Some(data) => ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("compute_buffer"),
                contents: data,
                usage,
            }),
            None => ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("compute_buffer"),
                size,
                usage,
                mapped_at_creation: false,
            }),
        })
        .map_err(|e| e.status)?;

        let id = MemId(self.next());
        self.mems.insert(
            id,
            GpuMem {
                context,
                buffer: Arc::new(buffer),
                shared: None,
            },
        );
        Ok(id)
    }

    fn create_from_shared(
        &mut self,
        context: ContextId,
        _access: MemAccess,
        shared: &WgpuSharedBuffer,
    ) -> BackendResult<MemId> {
        let ctx = self.contexts.get(&context).ok_or(Status::InvalidContext)?;
        if !ctx.shared {
            return Err(Status::InvalidContext);
        }
        if !Arc::ptr_eq(&ctx.device, &shared.device) {
            return Err(Status::InvalidShareGroupReference);
        }
        debug!(buffer = %shared.label, bytes = shared.size(), "wrapping raster buffer");
        let id = MemId(self.next());
        self.mems.insert(
            id,
            GpuMem {
                context,
                buffer: shared.buffer.clone(),
                shared: Some(shared.acquired.clone()),
            },
        );
        Ok(id)
    }

    fn mem_size(&self, mem: MemId) -> BackendResult<u64> {
        self.mems.get(&mem).map(|m| m.buffer.size()).ok_or(Status::InvalidMemObject)
    }

    fn write_buffer(&mut self, queue: QueueId, mem: MemId, offset: u64, data: &[u8]) -> BackendResult<()> {
        let ctx = self.context_of_queue(queue)?;
        let m = self.mems.get(&mem).ok_or(Status::InvalidMemObject)?;
        if !m.host_accessible() {
            return Err(Status::InvalidSharedObject);
        }
        if offset + data.len() as u64 > m.buffer.size() || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Status::InvalidValue);
        }
        scoped(&ctx.device, Status::InvalidOperation, || {
            ctx.queue.write_buffer(&m.buffer, offset, data);
            ctx.queue.submit(std::iter::empty());
        })
        .map_err(|e| e.status)?;
        ctx.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn read_buffer(&mut self, queue: QueueId, mem: MemId, offset: u64, out: &mut [u8]) -> BackendResult<()> {
        let ctx = self.context_of_queue(queue)?;
        let m = self.mems.get(&mem).ok_or(Status::InvalidMemObject)?;
        if !m.host_accessible() {
            return Err(Status::InvalidSharedObject);
        }
        let len = out.len() as u64;
        if offset + len > m.buffer.size() || len % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Status::InvalidValue);
        }
        if len == 0 {
            return Ok(());
        }

        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size: len,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
        encoder.copy_buffer_to_buffer(&m.buffer, offset, &staging, 0, len);
        ctx.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        ctx.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            _ => return Err(Status::MapFailure),
        }

        let data = slice.get_mapped_range();
        out.copy_from_slice(&data);
        drop(data);
        staging.unmap();
        Ok(())
    }

    fn enqueue_acquire_shared(&mut self, queue: QueueId, mems: &[MemId]) -> BackendResult<()> {
        if !self.context_of_queue(queue)?.shared {
            return Err(Status::InvalidContext);
        }
        let flags = self.shared_flags(mems)?;
        if flags.iter().any(|f| f.load(Ordering::SeqCst)) {
            return Err(Status::InvalidOperation);
        }
        for f in &flags {
            f.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Releasing a buffer the rasterizer already owns is a no-op.
    fn enqueue_release_shared(&mut self, queue: QueueId, mems: &[MemId]) -> BackendResult<()> {
        if !self.context_of_queue(queue)?.shared {
            return Err(Status::InvalidContext);
        }
        for f in self.shared_flags(mems)? {
            f.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn enqueue_kernel(&mut self, queue: QueueId, kernel: KernelId, global: usize) -> BackendResult<()> {
        if global == 0 {
            return Err(Status::InvalidGlobalWorkSize);
        }
        let ctx = self.context_of_queue(queue)?;
        let k = self.kernels.get(&kernel).ok_or(Status::InvalidKernel)?;

        let wg = k.entry.workgroup_size[0].max(1) as usize;
        let groups = global.div_ceil(wg);
        if groups > ctx.device.limits().max_compute_workgroups_per_dimension as usize {
            return Err(Status::InvalidGlobalWorkSize);
        }

        let mut entries = Vec::with_capacity(k.entry.args.len());
        for slot in &k.entry.args {
            let resource = match k.args.get(&slot.slot) {
                Some(GpuArg::Mem(m)) => {
                    let mem = self.mems.get(m).ok_or(Status::InvalidMemObject)?;
                    if !mem.host_accessible() {
                        return Err(Status::InvalidSharedObject);
                    }
                    mem.buffer.as_entire_binding()
                }
                Some(GpuArg::Scalar(buf)) => buf.as_entire_binding(),
                None => return Err(Status::InvalidKernelArgs),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: slot.slot,
                resource,
            });
        }

        scoped(&ctx.device, Status::InvalidKernelArgs, || {
            let bind_group = (!entries.is_empty()).then(|| {
                ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("kernel_args"),
                    layout: &k.pipeline.get_bind_group_layout(0),
                    entries: &entries,
                })
            });
            let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("dispatch"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(k.entry.name.as_str()),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&k.pipeline);
                if let Some(bg) = &bind_group {
                    pass.set_bind_group(0, bg, &[]);
                }
                pass.dispatch_workgroups(groups as u32, 1, 1);
            }
            ctx.queue.submit(std::iter::once(encoder.finish()));
        })
        .map_err(|e| e.status)
    }

    fn finish(&mut self, queue: QueueId) -> BackendResult<()> {
        let ctx = self.context_of_queue(queue)?;
        ctx.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn release_mem(&mut self, mem: MemId) -> BackendResult<()> {
        let m = self.mems.remove(&mem).ok_or(Status::InvalidMemObject)?;
        // Raster-owned buffers stay alive for the rasterizer.
        if m.shared.is_none() {
            m.buffer.destroy();
        }
        Ok(())
    }

    fn release_kernel(&mut self, kernel: KernelId) -> BackendResult<()> {
        self.kernels.remove(&kernel).map(drop).ok_or(Status::InvalidKernel)
    }

    fn release_program(&mut self, program: ProgramId) -> BackendResult<()> {
        self.programs.remove(&program).map(drop).ok_or(Status::InvalidProgram)
    }

    fn release_queue(&mut self, queue: QueueId) -> BackendResult<()> {
        self.queues.remove(&queue).map(drop).ok_or(Status::InvalidCommandQueue)
    }

    fn release_context(&mut self, context: ContextId) -> BackendResult<()> {
        self.contexts.remove(&context).map(drop).ok_or(Status::InvalidContext)
    }
}
