//! The command processor: PM4 consumption, register writes, submission and
//! frame lifecycle, draws, resolves and swaps.
//!
//! One guest GPU thread drives everything here. Host work is recorded into
//! the deferred command list and replayed when the submission closes; the
//! only blocking point is `check_submission_fence` with a nonzero await.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use xenos_hal::{
    Barrier, BufferDesc, BufferHandle, BufferUsage, DescriptorHeapDesc, DescriptorHeapHandle,
    DescriptorHeapKind, DescriptorTableBase, Device, FenceHandle, HostCommand, ImageDesc,
    ImageDimension, ImageHandle, ImageUsage, ImageViewDesc, ImageViewHandle, IndexBufferView,
    MemoryClass, PrimitiveTopology, Provider, Queue, Rect, ResourceHandle, ResourceState,
    RootSignatureHandle, Swizzle, ViewDimension, Viewport,
};

use crate::bindings::{self, BindfulExtras};
use crate::config::GpuConfig;
use crate::deferred::DeferredCommandList;
use crate::guest_memory::GuestMemory;
use crate::pipeline_cache::{GuestPipeline, PipelineCache, PipelineKey};
use crate::primitive_processor::{
    IndexBufferInfo, PrimitiveProcessor, ProcessError, ProcessedIndices,
};
use crate::regs::{self, RegisterFile};
use crate::render_target_cache::RenderTargetCache;
use crate::ring::RingReader;
use crate::shader::{ShaderTranslator, ShaderType, TranslatedShader};
use crate::shared_memory::SharedMemory;
use crate::texture_cache::{SamplerParameters, TextureCache};
use crate::upload_pool::{UploadAllocation, UploadBufferPool, DEFAULT_PAGE_SIZE};
use crate::xenos::{gpu_swap, Endian, IndexFormat, PrimitiveType};

/// Guest frames in flight before the CPU waits.
const QUEUE_FRAMES: u64 = 3;

/// Scratch and readback buffers grow in these increments.
const SCRATCH_BUFFER_SIZE_INCREMENT: u64 = 16 * 1024 * 1024;

/// Shader-visible view heap capacity; transient per-draw descriptors and
/// system views both come out of this.
const VIEW_HEAP_CAPACITY: u32 = 65536;

/// Receives the final frame image on swap.
pub trait Presenter: Send {
    fn present(&mut self, image: ImageHandle, width: u32, height: u32);
}

/// The state the command processor shares with its subsystems: the deferred
/// list, the barrier batch, fences and per-submission pools. Passed as a
/// plain mutable reference so components never own their orchestrator.
pub struct SubmissionContext {
    pub device: Arc<dyn Device>,
    pub queue: Arc<dyn Queue>,
    pub config: GpuConfig,
    pub regs: RegisterFile,
    pub deferred: DeferredCommandList,

    barriers: Vec<Barrier>,

    submission_open: bool,
    frame_open: bool,
    submission_current: u64,
    submission_completed: u64,
    frame_current: u64,
    frame_completed: u64,
    closed_frame_submissions: [u64; QUEUE_FRAMES as usize],
    submission_fence: FenceHandle,
    /// Covers queue operations (tile mappings) issued outside command lists
    /// after the latest submission signal.
    queue_operations_fence: FenceHandle,
    queue_operations_fence_last: u64,
    queue_operations_done_since_signal: bool,

    device_removed: bool,

    upload_pool: UploadBufferPool,

    view_heap: DescriptorHeapHandle,
    view_heap_allocated: u32,
    view_heap_free: Vec<u32>,
    /// Transient slots by the submission that used them.
    transient_view_slots: VecDeque<(u32, u32, u64)>,

    scratch_buffer: Option<BufferHandle>,
    scratch_buffer_size: u64,
    scratch_buffer_state: ResourceState,
    scratch_buffer_used: bool,

    readback_buffer: Option<BufferHandle>,
    readback_buffer_size: u64,

    /// Host objects queued for destruction once their submission completes.
    deleted_resources: VecDeque<(u64, ResourceHandle)>,
}

impl SubmissionContext {
    pub fn new(provider: Provider, config: GpuConfig) -> Result<SubmissionContext, xenos_hal::HalError> {
        let Provider { device, queue } = provider;
        let submission_fence = device.create_fence()?;
        let queue_operations_fence = device.create_fence()?;
        let view_heap = device.create_descriptor_heap(&DescriptorHeapDesc {
            kind: DescriptorHeapKind::View,
            capacity: VIEW_HEAP_CAPACITY,
            shader_visible: true,
            label: "view heap",
        })?;
        let upload_pool = UploadBufferPool::new(device.clone(), DEFAULT_PAGE_SIZE, "constants");
        Ok(SubmissionContext {
            device,
            queue,
            config,
            regs: RegisterFile::new(),
            deferred: DeferredCommandList::new(),
            barriers: Vec::new(),
            submission_open: false,
            frame_open: false,
            submission_current: 1,
            submission_completed: 0,
            frame_current: 1,
            frame_completed: 0,
            closed_frame_submissions: [0; QUEUE_FRAMES as usize],
            submission_fence,
            queue_operations_fence,
            queue_operations_fence_last: 0,
            queue_operations_done_since_signal: false,
            device_removed: false,
            upload_pool,
            view_heap,
            view_heap_allocated: 0,
            view_heap_free: Vec::new(),
            transient_view_slots: VecDeque::new(),
            scratch_buffer: None,
            scratch_buffer_size: 0,
            scratch_buffer_state: ResourceState::COMMON,
            scratch_buffer_used: false,
            readback_buffer: None,
            readback_buffer_size: 0,
            deleted_resources: VecDeque::new(),
        })
    }

    pub fn current_submission(&self) -> u64 {
        self.submission_current
    }

    pub fn completed_submission(&self) -> u64 {
        self.submission_completed
    }

    pub fn current_frame(&self) -> u64 {
        self.frame_current
    }

    pub fn completed_frame(&self) -> u64 {
        self.frame_completed
    }

    pub fn is_submission_open(&self) -> bool {
        self.submission_open
    }

    pub fn is_frame_open(&self) -> bool {
        self.frame_open
    }

    pub fn device_removed(&self) -> bool {
        self.device_removed
    }

    pub fn view_heap(&self) -> DescriptorHeapHandle {
        self.view_heap
    }

    /// Must be called when work is queued directly on the queue (tile
    /// mappings) so `await all queue operations` also covers it.
    pub fn notify_queue_operations_done_directly(&mut self) {
        self.queue_operations_done_since_signal = true;
    }

    /// Appends a transition to the pending barrier batch. Returns whether a
    /// barrier was actually recorded (the states differ). Back-to-back
    /// transitions of one resource collapse into the batch entry.
    pub fn push_transition_barrier(
        &mut self,
        resource: ResourceHandle,
        old_state: ResourceState,
        new_state: ResourceState,
        subresource: Option<u32>,
    ) -> bool {
        if old_state == new_state {
            return false;
        }
        for barrier in self.barriers.iter_mut().rev() {
            if let Barrier::Transition {
                resource: batched,
                new_state: batched_new,
                subresource: batched_sub,
                ..
            } = barrier
            {
                if *batched == resource && *batched_sub == subresource {
                    if *batched_new == old_state {
                        *batched_new = new_state;
                    }
                    return true;
                }
            }
        }
        self.barriers.push(Barrier::Transition {
            resource,
            old_state,
            new_state,
            subresource,
        });
        true
    }

    pub fn push_uav_barrier(&mut self, resource: ResourceHandle) {
        self.barriers.push(Barrier::UnorderedAccess {
            resource: Some(resource),
        });
    }

    pub fn push_aliasing_barrier(&mut self, before: Option<ResourceHandle>, after: ResourceHandle) {
        self.barriers.push(Barrier::Aliasing { before, after });
    }

    pub fn push_barrier(&mut self, barrier: Barrier) {
        self.barriers.push(barrier);
    }

    /// Flushes the pending barrier batch into the deferred list.
    pub fn submit_barriers(&mut self) {
        if self.barriers.is_empty() {
            return;
        }
        let barriers = std::mem::take(&mut self.barriers);
        self.deferred.push(HostCommand::ResourceBarriers { barriers });
    }

    /// Shader-visible view descriptors valid for the current submission only.
    pub fn request_transient_view_descriptors(
        &mut self,
        count: u32,
    ) -> Option<(DescriptorHeapHandle, u32)> {
        // Contiguous runs only come from the bump allocator; single slots may
        // reuse freed ones.
        let base = if count == 1 {
            if let Some(slot) = self.view_heap_free.pop() {
                slot
            } else {
                self.bump_view_slots(1)?
            }
        } else {
            self.bump_view_slots(count)?
        };
        self.transient_view_slots
            .push_back((base, count, self.submission_current));
        Some((self.view_heap, base))
    }

    fn bump_view_slots(&mut self, count: u32) -> Option<u32> {
        if self.view_heap_allocated + count > VIEW_HEAP_CAPACITY {
            tracing::error!("view heap exhausted");
            return None;
        }
        let base = self.view_heap_allocated;
        self.view_heap_allocated += count;
        Some(base)
    }

    /// The per-submission scratch GPU buffer. At most one caller may hold it.
    pub fn request_scratch_gpu_buffer(
        &mut self,
        size: u64,
        state: ResourceState,
    ) -> Option<BufferHandle> {
        if self.scratch_buffer_used {
            debug_assert!(false, "scratch buffer already in use");
            tracing::error!("scratch buffer requested while outstanding");
            return None;
        }
        if size > self.scratch_buffer_size {
            if let Some(old) = self.scratch_buffer.take() {
                self.defer_destroy(ResourceHandle::Buffer(old));
            }
            let new_size = size.div_ceil(SCRATCH_BUFFER_SIZE_INCREMENT)
                * SCRATCH_BUFFER_SIZE_INCREMENT;
            let buffer = self
                .device
                .create_buffer(&BufferDesc {
                    size: new_size,
                    usage: BufferUsage::UNORDERED_ACCESS,
                    memory: MemoryClass::DeviceLocal,
                    initial_state: state,
                    label: "scratch",
                })
                .map_err(|err| {
                    tracing::error!("scratch buffer allocation failed: {err}");
                    err
                })
                .ok()?;
            self.scratch_buffer = Some(buffer);
            self.scratch_buffer_size = new_size;
            self.scratch_buffer_state = state;
        } else if self.scratch_buffer_state != state {
            let buffer = self.scratch_buffer.unwrap();
            self.push_transition_barrier(
                ResourceHandle::Buffer(buffer),
                self.scratch_buffer_state,
                state,
                None,
            );
            self.scratch_buffer_state = state;
        }
        self.scratch_buffer_used = true;
        self.scratch_buffer
    }

    /// Returns the scratch buffer, recording the state its user left it in.
    pub fn release_scratch_gpu_buffer(&mut self, buffer: BufferHandle, new_state: ResourceState) {
        debug_assert_eq!(self.scratch_buffer, Some(buffer));
        self.scratch_buffer_used = false;
        self.scratch_buffer_state = new_state;
    }

    /// A CPU-readable buffer for resolve readback; always copy-destination.
    pub fn request_readback_buffer(&mut self, size: u64) -> Option<BufferHandle> {
        if size > self.readback_buffer_size {
            if let Some(old) = self.readback_buffer.take() {
                self.defer_destroy(ResourceHandle::Buffer(old));
            }
            let new_size = size.div_ceil(SCRATCH_BUFFER_SIZE_INCREMENT)
                * SCRATCH_BUFFER_SIZE_INCREMENT;
            let buffer = self
                .device
                .create_buffer(&BufferDesc {
                    size: new_size,
                    usage: BufferUsage::empty(),
                    memory: MemoryClass::Readback,
                    initial_state: ResourceState::COPY_DEST,
                    label: "readback",
                })
                .ok()?;
            self.readback_buffer = Some(buffer);
            self.readback_buffer_size = new_size;
        }
        self.readback_buffer
    }

    pub fn request_upload(&mut self, size: u64, alignment: u64) -> Option<UploadAllocation> {
        self.upload_pool
            .request(self.submission_current, size, alignment)
    }

    pub fn write_upload(&self, allocation: &UploadAllocation, data: &[u8]) {
        self.upload_pool.write(allocation, data);
    }

    /// Queues a host object for destruction after the current submission.
    pub fn defer_destroy(&mut self, resource: ResourceHandle) {
        self.deleted_resources
            .push_back((self.submission_current, resource));
    }

    fn reclaim(&mut self, completed: u64) {
        self.upload_pool.completed_submission_updated(completed);
        while let Some((base, count, submission)) = self.transient_view_slots.front().copied() {
            if submission > completed {
                break;
            }
            self.transient_view_slots.pop_front();
            for slot in base..base + count {
                self.view_heap_free.push(slot);
            }
        }
        while let Some((submission, resource)) = self.deleted_resources.front().copied() {
            if submission > completed {
                break;
            }
            self.deleted_resources.pop_front();
            match resource {
                ResourceHandle::Buffer(buffer) => self.device.destroy_buffer(buffer),
                ResourceHandle::Image(image) => self.device.destroy_image(image),
            }
        }
    }
}

/// Cached fixed-function state, re-recorded only when changed.
#[derive(Default)]
struct FixedFunctionState {
    viewport: Option<Viewport>,
    scissor: Option<Rect>,
    blend_factor: Option<[f32; 4]>,
    stencil_ref: Option<u32>,
    primitive_topology: Option<PrimitiveTopology>,
}

/// System constants visible to all translated shaders.
#[derive(Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct SystemConstants {
    viewport_scale: [f32; 3],
    flags: u32,
    viewport_offset: [f32; 3],
    vertex_index_endian: u32,
    color_exp_bias: [i32; 4],
    line_loop_closing_index: u32,
    vertex_base_index: i32,
    reserved: [u32; 2],
}

pub struct CommandProcessor {
    ctx: SubmissionContext,
    memory: Arc<GuestMemory>,

    shared_memory: SharedMemory,
    primitive_processor: PrimitiveProcessor,
    render_target_cache: RenderTargetCache,
    texture_cache: TextureCache,
    pipeline_cache: PipelineCache,

    translator: Box<dyn ShaderTranslator>,
    presenter: Option<Box<dyn Presenter>>,

    /// Translated shaders by microcode digest.
    shaders: HashMap<u64, Arc<TranslatedShader>>,
    active_vertex_shader: Option<Arc<TranslatedShader>>,
    active_pixel_shader: Option<Arc<TranslatedShader>>,

    bindless: bool,
    root_signature_bindless: RootSignatureHandle,
    root_signature_bindless_tessellated: RootSignatureHandle,
    root_signatures_bindful: HashMap<u32, RootSignatureHandle>,
    current_graphics_root_signature: Option<RootSignatureHandle>,

    ff_state: FixedFunctionState,

    /// Gamma ramp contents mirrored from the DC_LUT registers.
    gamma_ramp_table: [u32; 256],
    gamma_ramp_pwl: [u32; 128 * 3],
    gamma_ramp_rw_index: u32,
    gamma_ramp_rw_component: u32,
    gamma_ramp_table_dirty: bool,
    gamma_ramp_pwl_dirty: bool,
    gamma_ramp_is_pwl: bool,
    gamma_ramp_buffer: BufferHandle,
    gamma_ramp_buffer_state: ResourceState,
    gamma_root_signature: RootSignatureHandle,
    gamma_table_pipeline: Option<xenos_hal::PipelineHandle>,
    gamma_pwl_pipeline: Option<xenos_hal::PipelineHandle>,

    swap_image: Option<(ImageHandle, ImageViewHandle, u32, u32)>,

    unimplemented_opcode_logged: [bool; 128],
    memexport_format_logged: bool,
}

impl CommandProcessor {
    pub fn new(
        provider: Provider,
        memory: Arc<GuestMemory>,
        translator: Box<dyn ShaderTranslator>,
        config: GpuConfig,
    ) -> Result<CommandProcessor, xenos_hal::HalError> {
        let device = provider.device.clone();
        let queue = provider.queue.clone();
        let ctx = SubmissionContext::new(provider, config.clone())?;

        let shared_memory =
            SharedMemory::new(device.clone(), queue.clone(), memory.clone(), &config)?;
        let primitive_processor = PrimitiveProcessor::new(device.clone(), memory.clone())?;
        let render_target_cache = RenderTargetCache::new(device.clone(), &config)?;
        let texture_cache = TextureCache::new(device.clone(), &config)?;
        let pipeline_cache = PipelineCache::new(device.clone());

        let bindless = device.capabilities().bindless;
        let root_signature_bindless =
            device.create_root_signature(&bindings::bindless_root_signature_desc(false))?;
        let root_signature_bindless_tessellated =
            device.create_root_signature(&bindings::bindless_root_signature_desc(true))?;

        // 256-entry 10bpc table at 0x0, then the 128-entry PWL ramp.
        let gamma_ramp_buffer = device.create_buffer(&BufferDesc {
            size: 0x400 + 0x600,
            usage: BufferUsage::empty(),
            memory: MemoryClass::DeviceLocal,
            initial_state: ResourceState::COPY_DEST,
            label: "gamma ramp",
        })?;
        let gamma_root_signature =
            device.create_root_signature(&xenos_hal::RootSignatureDesc {
                parameters: vec![
                    xenos_hal::RootParameter::Constants { num_dwords: 2 },
                    xenos_hal::RootParameter::DescriptorTable {
                        ranges: vec![
                            xenos_hal::DescriptorRange {
                                kind: xenos_hal::DescriptorRangeKind::ShaderResource,
                                count: Some(2),
                                base_register: 0,
                            },
                            xenos_hal::DescriptorRange {
                                kind: xenos_hal::DescriptorRangeKind::UnorderedAccess,
                                count: Some(1),
                                base_register: 0,
                            },
                        ],
                    },
                ],
                label: "apply gamma",
            })?;

        Ok(CommandProcessor {
            ctx,
            memory,
            shared_memory,
            primitive_processor,
            render_target_cache,
            texture_cache,
            pipeline_cache,
            translator,
            presenter: None,
            shaders: HashMap::new(),
            active_vertex_shader: None,
            active_pixel_shader: None,
            bindless,
            root_signature_bindless,
            root_signature_bindless_tessellated,
            root_signatures_bindful: HashMap::new(),
            current_graphics_root_signature: None,
            ff_state: FixedFunctionState::default(),
            gamma_ramp_table: [0; 256],
            gamma_ramp_pwl: [0; 128 * 3],
            gamma_ramp_rw_index: 0,
            gamma_ramp_rw_component: 0,
            gamma_ramp_table_dirty: false,
            gamma_ramp_pwl_dirty: false,
            gamma_ramp_is_pwl: false,
            gamma_ramp_buffer,
            gamma_ramp_buffer_state: ResourceState::COPY_DEST,
            gamma_root_signature,
            gamma_table_pipeline: None,
            gamma_pwl_pipeline: None,
            swap_image: None,
            unimplemented_opcode_logged: [false; 128],
            memexport_format_logged: false,
        })
    }

    pub fn set_presenter(&mut self, presenter: Box<dyn Presenter>) {
        self.presenter = Some(presenter);
    }

    pub fn context(&self) -> &SubmissionContext {
        &self.ctx
    }

    pub fn shared_memory(&self) -> &SharedMemory {
        &self.shared_memory
    }

    pub fn shared_memory_mut(&mut self) -> &mut SharedMemory {
        &mut self.shared_memory
    }

    pub fn render_targets(&self) -> &RenderTargetCache {
        &self.render_target_cache
    }

    pub fn initialize_shader_storage(&mut self, cache_root: &std::path::Path, title_id: u32) {
        self.pipeline_cache.initialize_storage(cache_root, title_id);
    }

    pub fn clear_caches(&mut self) {
        self.render_target_cache.clear_cache();
        self.texture_cache.clear_cache(&self.shared_memory);
        self.pipeline_cache.clear_cache();
        self.primitive_processor.clear_cache();
    }

    // ---- Register writes -------------------------------------------------

    pub fn write_register(&mut self, index: u32, value: u32) {
        self.ctx.regs.set(index, value);
        match index {
            regs::DC_LUT_RW_INDEX => {
                self.gamma_ramp_rw_index = value & 0xFF;
                self.gamma_ramp_rw_component = 0;
            }
            regs::DC_LUT_SEQ_COLOR | regs::DC_LUT_PWL_DATA => {
                // Three sequential writes (R, G, B) per PWL entry.
                let entry = (self.gamma_ramp_rw_index as usize % 128) * 3
                    + self.gamma_ramp_rw_component as usize;
                self.gamma_ramp_pwl[entry] = value;
                self.gamma_ramp_rw_component += 1;
                if self.gamma_ramp_rw_component == 3 {
                    self.gamma_ramp_rw_component = 0;
                    self.gamma_ramp_rw_index = (self.gamma_ramp_rw_index + 1) & 0xFF;
                }
                self.gamma_ramp_pwl_dirty = true;
                self.gamma_ramp_is_pwl = true;
            }
            regs::DC_LUT_30_COLOR => {
                self.gamma_ramp_table[self.gamma_ramp_rw_index as usize] = value;
                self.gamma_ramp_rw_index = (self.gamma_ramp_rw_index + 1) & 0xFF;
                self.gamma_ramp_table_dirty = true;
                self.gamma_ramp_is_pwl = false;
            }
            regs::COHER_STATUS_HOST => {
                // Acknowledge coherency requests immediately; the shared
                // memory mirror tracks validity on its own.
                if value & 0x8000_0000 != 0 {
                    self.ctx.regs.set(index, value & !0x8000_0000);
                }
            }
            _ => {}
        }
    }

    /// Bulk register write out of CPU memory, split by register class so the
    /// common shader-constant bursts skip the per-register side-effect
    /// checks.
    pub fn write_register_range_from_mem(&mut self, start_index: u32, values: &[u32]) {
        let mut index = start_index;
        for &value in values {
            match regs::classify_register(index) {
                regs::RegisterClass::ShaderAluConstant
                | regs::RegisterClass::FetchConstant
                | regs::RegisterClass::BoolLoopConstant => {
                    self.ctx.regs.set(index, value);
                }
                regs::RegisterClass::Other => self.write_register(index, value),
            }
            index += 1;
        }
    }

    /// Bulk register write out of the ring, same fast-path split.
    pub fn write_register_range_from_ring(
        &mut self,
        reader: &mut RingReader<'_>,
        base: u32,
        count: u32,
    ) {
        for i in 0..count {
            let value = reader.read();
            let index = base + i;
            match regs::classify_register(index) {
                regs::RegisterClass::ShaderAluConstant
                | regs::RegisterClass::FetchConstant
                | regs::RegisterClass::BoolLoopConstant => {
                    self.ctx.regs.set(index, value);
                }
                regs::RegisterClass::Other => self.write_register(index, value),
            }
        }
    }

    // ---- Submission / frame lifecycle ------------------------------------

    /// Opens a host submission if needed; promotes it to a frame submission
    /// for guest commands. Returns false when the device is lost.
    pub fn begin_submission(&mut self, is_guest_command: bool) -> bool {
        if self.ctx.device_removed {
            return false;
        }
        self.check_submission_fence(0);

        if !self.ctx.submission_open {
            self.ctx.submission_open = true;
            self.ctx.deferred.reset();
            self.shared_memory.begin_submission();
            self.primitive_processor.begin_submission(&mut self.ctx);
            self.current_graphics_root_signature = None;
            self.ff_state = FixedFunctionState::default();
            self.ctx.deferred.push(HostCommand::SetDescriptorHeaps {
                views: Some(self.ctx.view_heap),
                samplers: Some(self.texture_cache.sampler_heap()),
            });
        }

        if is_guest_command && !self.ctx.frame_open {
            self.ctx.frame_open = true;
            // Bound the number of frames in flight.
            let awaited = self.ctx.closed_frame_submissions
                [(self.ctx.frame_current % QUEUE_FRAMES) as usize];
            if awaited > self.ctx.submission_completed {
                self.check_submission_fence(awaited);
            }
            self.primitive_processor.begin_frame();
            self.render_target_cache.begin_frame();
        }
        true
    }

    /// Closes the open submission: replays the deferred list onto a host
    /// command list and submits it with a fence signal. With `is_swap`, also
    /// closes the guest frame.
    pub fn end_submission(&mut self, is_swap: bool) -> bool {
        if self.ctx.device_removed {
            return false;
        }
        let closing_frame = is_swap && self.ctx.frame_open;
        if self.ctx.submission_open {
            // Submission boundaries imply full UAV/aliasing barriers and
            // common state decay on the host queue.
            self.ctx
                .push_barrier(Barrier::UnorderedAccess { resource: None });
            self.ctx.submit_barriers();

            let mut list = match self.ctx.device.create_command_list() {
                Ok(list) => list,
                Err(err) => {
                    tracing::error!("command list creation failed: {err}");
                    self.ctx.device_removed = true;
                    return false;
                }
            };
            let pipeline_cache = &self.pipeline_cache;
            let replayed = self
                .ctx
                .deferred
                .replay(list.as_mut(), &|token: GuestPipeline| {
                    pipeline_cache.resolve(token)
                });
            if replayed.is_err() {
                self.ctx.device_removed = true;
                return false;
            }
            if self.ctx.queue.execute_command_list(list).is_err() {
                self.ctx.device_removed = true;
                return false;
            }
            if self
                .ctx
                .queue
                .signal_fence(self.ctx.submission_fence, self.ctx.submission_current)
                .is_err()
            {
                self.ctx.device_removed = true;
                return false;
            }
            if self.ctx.queue_operations_done_since_signal {
                self.ctx.queue_operations_fence_last += 1;
                let _ = self.ctx.queue.signal_fence(
                    self.ctx.queue_operations_fence,
                    self.ctx.queue_operations_fence_last,
                );
                self.ctx.queue_operations_done_since_signal = false;
            }
            self.ctx.deferred.reset();
            self.ctx.submission_open = false;
            self.ctx.submission_current += 1;
            self.pipeline_cache.store_completed_pipelines();
        }
        if closing_frame {
            self.ctx.frame_open = false;
            let closed_submission = self.ctx.submission_current - 1;
            self.ctx.closed_frame_submissions
                [(self.ctx.frame_current % QUEUE_FRAMES) as usize] = closed_submission;
            self.ctx.frame_current += 1;
            self.primitive_processor.end_frame();
        }
        true
    }

    /// Whether closing the submission now would not leave the host waiting
    /// on unfinished pipeline creation.
    pub fn can_end_submission_immediately(&self) -> bool {
        !self.pipeline_cache.has_pending_pipelines()
    }

    /// Polls (await 0) or waits for a submission, then reclaims everything
    /// whose last use is complete.
    pub fn check_submission_fence(&mut self, await_submission: u64) {
        if await_submission > 0 {
            let await_value = await_submission.min(self.ctx.submission_current.saturating_sub(1));
            if await_value > self.ctx.submission_completed {
                self.ctx
                    .device
                    .wait_fence(self.ctx.submission_fence, await_value);
            }
            // Waiting for everything also waits for direct queue operations.
            if await_submission >= self.ctx.submission_current
                && self.ctx.queue_operations_fence_last > 0
            {
                self.ctx.device.wait_fence(
                    self.ctx.queue_operations_fence,
                    self.ctx.queue_operations_fence_last,
                );
            }
        }
        let completed = self
            .ctx
            .device
            .fence_completed_value(self.ctx.submission_fence)
            .min(self.ctx.submission_current.saturating_sub(1));
        if completed <= self.ctx.submission_completed {
            return;
        }
        self.ctx.submission_completed = completed;
        self.ctx.reclaim(completed);
        self.shared_memory.completed_submission_updated(completed);
        self.primitive_processor.completed_submission_updated(completed);
        // Frames complete when their closing submission does.
        let mut frame_completed = self.ctx.frame_completed;
        for frame in self.ctx.frame_completed + 1..self.ctx.frame_current {
            if self.ctx.closed_frame_submissions[(frame % QUEUE_FRAMES) as usize] > completed {
                break;
            }
            frame_completed = frame;
        }
        if frame_completed > self.ctx.frame_completed {
            self.ctx.frame_completed = frame_completed;
            self.primitive_processor
                .completed_frame_updated(frame_completed);
        }
    }

    /// Blocks until every queued operation, including direct queue work, is
    /// complete.
    pub fn await_all_queue_operations(&mut self) -> bool {
        self.check_submission_fence(self.ctx.submission_current);
        self.ctx.submission_completed + 1 >= self.ctx.submission_current
    }

    // ---- Shaders ----------------------------------------------------------

    fn load_shader(&mut self, shader_type: ShaderType, ucode: &[u32]) -> Option<Arc<TranslatedShader>> {
        let digest = crate::shader::ucode_digest(ucode);
        if let Some(shader) = self.shaders.get(&digest) {
            return Some(shader.clone());
        }
        match self.translator.translate(shader_type, ucode) {
            Ok(shader) => {
                let shader = Arc::new(shader);
                self.shaders.insert(digest, shader.clone());
                Some(shader)
            }
            Err(err) => {
                tracing::warn!("shader translation failed: {err}");
                None
            }
        }
    }

    // ---- Draws -------------------------------------------------------------

    /// Executes one guest draw. Returns false only on unrecoverable failure;
    /// skipped draws return true.
    pub fn issue_draw(
        &mut self,
        primitive_type: PrimitiveType,
        index_count: u32,
        index_buffer: Option<IndexBufferInfo>,
        _major_mode_explicit: bool,
    ) -> bool {
        if !self.begin_submission(true) {
            return false;
        }
        // 0..2 ignore draws, 4 is color/depth; anything else has no host
        // equivalent here.
        let edram_mode = self.ctx.regs.get(regs::RB_MODECONTROL) & 0x7;
        if edram_mode != 4 {
            return true;
        }
        let Some(vertex_shader) = self.active_vertex_shader.clone() else {
            return true;
        };
        let pixel_shader = self.active_pixel_shader.clone();

        // Index/topology conversion.
        let reset_enabled =
            self.ctx.regs.get(regs::PA_SU_SC_MODE_CNTL) & (1 << 21) != 0;
        let reset_index = self.ctx.regs.get(regs::VGT_MULTI_PRIM_IB_RESET_INDX);
        let processed = match self.primitive_processor.process(
            &mut self.ctx,
            primitive_type,
            index_count,
            index_buffer,
            reset_enabled,
            reset_index,
        ) {
            Ok(processed) => processed,
            Err(ProcessError::Empty) => return true,
            Err(ProcessError::Unsupported(what)) => {
                tracing::debug!("draw skipped: {what}");
                return true;
            }
            Err(ProcessError::Failed) => return true,
        };

        // Guest index data and vertex streams must be resident and current.
        if let ProcessedIndices::Guest { base, format } = processed.indices {
            let length = index_count * format.size_bytes();
            if !self.shared_memory.request_range(&mut self.ctx, base, length) {
                return true;
            }
        }
        for &slot in &vertex_shader.vertex_fetch_slots {
            let fetch = self.ctx.regs.vertex_fetch_constant(slot);
            if !fetch.is_vertex() {
                continue;
            }
            if !self.shared_memory.request_range(
                &mut self.ctx,
                fetch.address(),
                fetch.size_dwords() * 4,
            ) {
                return true;
            }
        }

        // Memexport targets must be resident and valid before the draw, and
        // are marked GPU-written afterwards so textures over them reload.
        let mut memexport_ranges: Vec<(u32, u32)> = Vec::new();
        for shader in [Some(&vertex_shader), pixel_shader.as_ref()].into_iter().flatten() {
            for stream in &shader.memexport_streams {
                if stream.element_bits < 32 {
                    if !self.memexport_format_logged {
                        self.memexport_format_logged = true;
                        tracing::warn!(
                            element_bits = stream.element_bits,
                            "memexport with elements narrower than 32 bits is \
                             unsupported, skipping the draw"
                        );
                    }
                    return true;
                }
                let base = regs::SHADER_CONSTANT_BASE + stream.stream_constant * 4;
                let address_dwords = self.ctx.regs.get(base) & 0x3FFF_FFFF;
                let size_dwords = self.ctx.regs.get(base + 1) & 0xFF_FFFF;
                if size_dwords == 0 {
                    continue;
                }
                memexport_ranges.push((address_dwords * 4, size_dwords * 4));
            }
        }
        for &(base, length) in &memexport_ranges {
            if !self.shared_memory.request_range(&mut self.ctx, base, length) {
                return true;
            }
        }

        // Texture decode dispatches and sampler allocation come first so no
        // compute work is recorded after the draw's pipeline bind.
        let Some((texture_views, sampler_slots)) =
            self.acquire_draw_resources(&vertex_shader, pixel_shader.as_deref())
        else {
            return true;
        };

        // Render targets; also bumps dirty rows for this draw.
        let color_mask = if pixel_shader.is_some() {
            self.ctx.regs.get(regs::RB_COLOR_MASK)
        } else {
            0
        };
        if !self
            .render_target_cache
            .update_render_targets(&mut self.ctx, color_mask)
        {
            return true;
        }

        // Pipeline and root signature.
        let (color_formats, depth_format) = self.render_target_cache.bound_host_formats();
        // Tessellation engages through the VGT output path; it selects the
        // other global root signature in bindless mode.
        let tessellated = self.ctx.regs.get(regs::VGT_OUTPUT_PATH_CNTL) & 0x3 == 2;
        let pipeline_key = PipelineKey {
            vertex_digest: vertex_shader.ucode_digest,
            pixel_digest: pixel_shader.as_ref().map(|ps| ps.ucode_digest).unwrap_or(0),
            tessellated,
            topology: processed.topology,
            color_formats,
            depth_format,
            state: self.graphics_state_from_regs(),
        };
        let root_signature =
            match self.root_signature_for_draw(&vertex_shader, pixel_shader.as_deref(), tessellated)
            {
                Some(signature) => signature,
                None => return true,
            };
        let Some(pipeline) = self.pipeline_cache.get_or_create_graphics(
            pipeline_key,
            &vertex_shader,
            pixel_shader.as_deref(),
            root_signature,
        ) else {
            return true;
        };
        if self.current_graphics_root_signature != Some(root_signature) {
            self.current_graphics_root_signature = Some(root_signature);
            self.ctx.deferred.push(HostCommand::SetGraphicsRootSignature {
                signature: root_signature,
            });
        }
        self.ctx.deferred.set_pipeline_handle(pipeline);

        // Constant uploads and descriptor tables for this draw.
        if !self.record_bindings(
            &vertex_shader,
            pixel_shader.as_deref(),
            &texture_views,
            &sampler_slots,
        ) {
            return true;
        }

        // Shared memory is read by vertex fetch from here on.
        if vertex_shader.uses_memexport
            || pixel_shader.as_ref().is_some_and(|ps| ps.uses_memexport)
        {
            self.shared_memory.use_for_writing(&mut self.ctx);
        } else {
            self.shared_memory.use_for_reading(&mut self.ctx);
        }
        self.ctx.submit_barriers();

        self.update_fixed_function_state(processed.topology);

        // Index buffer bind and the draw itself.
        match processed.indices {
            ProcessedIndices::None => {
                self.ctx.deferred.push(HostCommand::DrawInstanced {
                    vertex_count_per_instance: processed.host_index_count,
                    instance_count: 1,
                    start_vertex: 0,
                    start_instance: 0,
                });
            }
            ProcessedIndices::Guest { base, format } => {
                let host_format = match format {
                    IndexFormat::Int16 => xenos_hal::IndexFormat::Uint16,
                    IndexFormat::Int32 => xenos_hal::IndexFormat::Uint32,
                };
                self.ctx.deferred.push(HostCommand::SetIndexBuffer {
                    view: Some(IndexBufferView {
                        address: self.shared_memory.gpu_address_of(base),
                        size_bytes: index_count * format.size_bytes(),
                        format: host_format,
                    }),
                });
                self.ctx.deferred.push(HostCommand::DrawIndexedInstanced {
                    index_count_per_instance: processed.host_index_count,
                    instance_count: 1,
                    start_index: 0,
                    base_vertex: 0,
                    start_instance: 0,
                });
            }
            ProcessedIndices::Builtin { buffer } => {
                self.ctx.deferred.push(HostCommand::SetIndexBuffer {
                    view: Some(IndexBufferView {
                        address: self
                            .primitive_processor
                            .builtin_index_buffer_gpu_address(buffer),
                        size_bytes: processed.host_index_count * 2,
                        format: xenos_hal::IndexFormat::Uint16,
                    }),
                });
                self.ctx.deferred.push(HostCommand::DrawIndexedInstanced {
                    index_count_per_instance: processed.host_index_count,
                    instance_count: 1,
                    start_index: 0,
                    base_vertex: 0,
                    start_instance: 0,
                });
            }
            ProcessedIndices::Converted { handle, format } => {
                let host_format = match format {
                    IndexFormat::Int16 => xenos_hal::IndexFormat::Uint16,
                    IndexFormat::Int32 => xenos_hal::IndexFormat::Uint32,
                };
                self.ctx.deferred.push(HostCommand::SetIndexBuffer {
                    view: Some(IndexBufferView {
                        address: self
                            .primitive_processor
                            .converted_index_buffer_gpu_address(handle),
                        size_bytes: processed.host_index_count * format.size_bytes(),
                        format: host_format,
                    }),
                });
                self.ctx.deferred.push(HostCommand::DrawIndexedInstanced {
                    index_count_per_instance: processed.host_index_count,
                    instance_count: 1,
                    start_index: 0,
                    base_vertex: 0,
                    start_instance: 0,
                });
            }
        }

        // Memexport writes must be observed by later texture fetches.
        if !memexport_ranges.is_empty() {
            self.shared_memory.mark_uav_writes_commit_needed();
            for (base, length) in memexport_ranges {
                self.shared_memory.range_written_by_gpu(base, length);
            }
        }
        true
    }

    fn graphics_state_from_regs(&self) -> xenos_hal::GraphicsPipelineState {
        let regs = &self.ctx.regs;
        let depthcontrol =
            regs::DepthControl::from_bits_truncate(regs.get(regs::RB_DEPTHCONTROL));
        let mode_cntl = regs.get(regs::PA_SU_SC_MODE_CNTL);
        let color_mask = regs.get(regs::RB_COLOR_MASK);
        let blendcontrol = regs.get(regs::RB_COLORCONTROL);
        let cull = match mode_cntl & 0x3 {
            1 => xenos_hal::CullMode::Front,
            2 => xenos_hal::CullMode::Back,
            _ => xenos_hal::CullMode::None,
        };
        let depth_func = match (regs.get(regs::RB_DEPTHCONTROL) >> 4) & 0x7 {
            0 => xenos_hal::ComparisonFunc::Never,
            1 => xenos_hal::ComparisonFunc::Less,
            2 => xenos_hal::ComparisonFunc::Equal,
            3 => xenos_hal::ComparisonFunc::LessEqual,
            4 => xenos_hal::ComparisonFunc::Greater,
            5 => xenos_hal::ComparisonFunc::NotEqual,
            6 => xenos_hal::ComparisonFunc::GreaterEqual,
            _ => xenos_hal::ComparisonFunc::Always,
        };
        xenos_hal::GraphicsPipelineState {
            cull_mode: cull,
            front_counter_clockwise: mode_cntl & (1 << 2) == 0,
            depth_test: depthcontrol.contains(regs::DepthControl::Z_ENABLE),
            depth_write: depthcontrol.contains(regs::DepthControl::Z_WRITE_ENABLE),
            depth_func,
            stencil_enable: depthcontrol.contains(regs::DepthControl::STENCIL_ENABLE),
            blend_enable: [
                blendcontrol & 0x1 != 0,
                blendcontrol & 0x2 != 0,
                blendcontrol & 0x4 != 0,
                blendcontrol & 0x8 != 0,
            ],
            color_write_masks: [
                (color_mask & 0xF) as u8,
                ((color_mask >> 4) & 0xF) as u8,
                ((color_mask >> 8) & 0xF) as u8,
                ((color_mask >> 12) & 0xF) as u8,
            ],
            primitive_restart: self.ctx.regs.get(regs::PA_SU_SC_MODE_CNTL) & (1 << 21) != 0,
        }
    }

    fn root_signature_for_draw(
        &mut self,
        vertex_shader: &TranslatedShader,
        pixel_shader: Option<&TranslatedShader>,
        tessellated: bool,
    ) -> Option<RootSignatureHandle> {
        if self.bindless {
            return Some(if tessellated {
                self.root_signature_bindless_tessellated
            } else {
                self.root_signature_bindless
            });
        }
        let extras = BindfulExtras {
            textures_pixel: pixel_shader.is_some_and(|ps| !ps.texture_bindings.is_empty()),
            samplers_pixel: pixel_shader.is_some_and(|ps| !ps.sampler_bindings.is_empty()),
            textures_vertex: !vertex_shader.texture_bindings.is_empty(),
            samplers_vertex: !vertex_shader.sampler_bindings.is_empty(),
        };
        let key = extras.key();
        if let Some(signature) = self.root_signatures_bindful.get(&key) {
            return Some(*signature);
        }
        let (desc, _) = bindings::bindful_root_signature_desc(extras);
        let signature = self.ctx.device.create_root_signature(&desc).ok()?;
        self.root_signatures_bindful.insert(key, signature);
        Some(signature)
    }

    /// Acquires everything the draw reads before any graphics state is
    /// recorded: texture residency, decode dispatches, views and sampler
    /// slots.
    fn acquire_draw_resources(
        &mut self,
        vertex_shader: &TranslatedShader,
        pixel_shader: Option<&TranslatedShader>,
    ) -> Option<(Vec<xenos_hal::ImageViewHandle>, Vec<u32>)> {
        let mut texture_views = Vec::new();
        let mut all_texture_bindings = vertex_shader.texture_bindings.clone();
        if let Some(ps) = pixel_shader {
            all_texture_bindings.extend(ps.texture_bindings.clone());
        }
        for binding in &all_texture_bindings {
            let fetch = self.ctx.regs.texture_fetch_constant(binding.fetch_constant);
            let view = self.texture_cache.request_texture(
                &mut self.ctx,
                &mut self.shared_memory,
                &fetch,
                binding.is_signed,
            );
            texture_views.push(view);
        }

        // Samplers; a full heap with nothing evictable awaits the blocking
        // submission and retries once.
        let mut sampler_slots = Vec::new();
        let mut all_sampler_bindings = vertex_shader.sampler_bindings.clone();
        if let Some(ps) = pixel_shader {
            all_sampler_bindings.extend(ps.sampler_bindings.clone());
        }
        for binding in &all_sampler_bindings {
            let fetch = self.ctx.regs.texture_fetch_constant(binding.fetch_constant);
            let parameters = SamplerParameters::from_fetch_constant(&fetch);
            match self.texture_cache.use_sampler(
                self.ctx.submission_current,
                self.ctx.submission_completed,
                parameters,
            ) {
                Ok(slot) => sampler_slots.push(slot),
                Err(await_submission) => {
                    tracing::debug!(
                        await_submission,
                        "sampler heap exhausted, awaiting and retrying"
                    );
                    self.check_submission_fence(await_submission);
                    match self.texture_cache.use_sampler(
                        self.ctx.submission_current,
                        self.ctx.submission_completed,
                        parameters,
                    ) {
                        Ok(slot) => sampler_slots.push(slot),
                        Err(_) => return None,
                    }
                }
            }
        }
        Some((texture_views, sampler_slots))
    }

    /// Uploads the constant buffers and records the root bindings for the
    /// draw. Only root-parameter and descriptor work; no dispatches.
    fn record_bindings(
        &mut self,
        vertex_shader: &TranslatedShader,
        pixel_shader: Option<&TranslatedShader>,
        texture_views: &[xenos_hal::ImageViewHandle],
        sampler_slots: &[u32],
    ) -> bool {
        // Constant buffers out of the upload pool.
        let Some(fetch_cbv) = self.upload_register_range(
            regs::FETCH_CONSTANT_BASE,
            regs::FETCH_CONSTANT_COUNT_DWORDS,
        ) else {
            return false;
        };
        let Some(float_vertex_cbv) = self.upload_register_range(
            regs::SHADER_CONSTANT_BASE,
            regs::SHADER_CONSTANT_COUNT_DWORDS / 2,
        ) else {
            return false;
        };
        let Some(float_pixel_cbv) = self.upload_register_range(
            regs::SHADER_CONSTANT_BASE + regs::SHADER_CONSTANT_COUNT_DWORDS / 2,
            regs::SHADER_CONSTANT_COUNT_DWORDS / 2,
        ) else {
            return false;
        };
        let Some(bool_loop_cbv) = self.upload_register_range(
            regs::BOOL_CONSTANT_BASE,
            regs::BOOL_CONSTANT_COUNT_DWORDS + regs::LOOP_CONSTANT_COUNT_DWORDS,
        ) else {
            return false;
        };
        let system_constants = self.system_constants();
        let Some(system_cbv) = self.upload_pod(&system_constants) else {
            return false;
        };

        let deferred = &mut self.ctx.deferred;
        if self.bindless {
            use bindings::bindless_params as params;
            deferred.push(HostCommand::SetGraphicsRootConstantBuffer {
                parameter_index: params::FETCH_CONSTANTS,
                address: fetch_cbv,
            });
            deferred.push(HostCommand::SetGraphicsRootConstantBuffer {
                parameter_index: params::FLOAT_CONSTANTS_VERTEX,
                address: float_vertex_cbv,
            });
            deferred.push(HostCommand::SetGraphicsRootConstantBuffer {
                parameter_index: params::FLOAT_CONSTANTS_PIXEL,
                address: float_pixel_cbv,
            });
            deferred.push(HostCommand::SetGraphicsRootConstantBuffer {
                parameter_index: params::SYSTEM_CONSTANTS,
                address: system_cbv,
            });
            deferred.push(HostCommand::SetGraphicsRootConstantBuffer {
                parameter_index: params::BOOL_LOOP_CONSTANTS,
                address: bool_loop_cbv,
            });
        } else {
            use bindings::bindful_params as params;
            deferred.push(HostCommand::SetGraphicsRootConstantBuffer {
                parameter_index: params::FETCH_CONSTANTS,
                address: fetch_cbv,
            });
            deferred.push(HostCommand::SetGraphicsRootConstantBuffer {
                parameter_index: params::FLOAT_CONSTANTS_VERTEX,
                address: float_vertex_cbv,
            });
            deferred.push(HostCommand::SetGraphicsRootConstantBuffer {
                parameter_index: params::FLOAT_CONSTANTS_PIXEL,
                address: float_pixel_cbv,
            });
            deferred.push(HostCommand::SetGraphicsRootConstantBuffer {
                parameter_index: params::SYSTEM_CONSTANTS,
                address: system_cbv,
            });
            deferred.push(HostCommand::SetGraphicsRootConstantBuffer {
                parameter_index: params::BOOL_LOOP_CONSTANTS,
                address: bool_loop_cbv,
            });
        }

        // Shared memory SRV + UAV table.
        let Some((heap, shared_memory_base)) = self.ctx.request_transient_view_descriptors(2)
        else {
            return false;
        };
        self.shared_memory.write_raw_srv(heap, shared_memory_base);
        self.shared_memory.write_raw_uav(heap, shared_memory_base + 1);
        let shared_memory_param = if self.bindless {
            bindings::bindless_params::SHARED_MEMORY
        } else {
            bindings::bindful_params::SHARED_MEMORY_AND_EDRAM
        };
        self.ctx
            .deferred
            .push(HostCommand::SetGraphicsRootDescriptorTable {
                parameter_index: shared_memory_param,
                base: DescriptorTableBase {
                    heap,
                    index: shared_memory_base,
                },
            });

        // Texture views: one contiguous transient run, bound as a table in
        // bindful mode or referenced by index constants in bindless mode.
        if !texture_views.is_empty() {
            let count = texture_views.len() as u32;
            let Some((heap, base)) = self.ctx.request_transient_view_descriptors(count) else {
                return false;
            };
            for (i, view) in texture_views.iter().enumerate() {
                if self
                    .ctx
                    .device
                    .write_image_srv(heap, base + i as u32, *view)
                    .is_err()
                {
                    return false;
                }
            }
            if self.bindless {
                // Descriptor indices into the view heap, by binding order.
                let mut index_data: Vec<u32> =
                    (0..count).map(|i| base + i).collect();
                index_data.extend(sampler_slots.iter().copied());
                let Some(indices_cbv) = self.upload_dwords(&index_data) else {
                    return false;
                };
                self.ctx
                    .deferred
                    .push(HostCommand::SetGraphicsRootConstantBuffer {
                        parameter_index: bindings::bindless_params::DESCRIPTOR_INDICES_PIXEL,
                        address: indices_cbv,
                    });
                self.ctx
                    .deferred
                    .push(HostCommand::SetGraphicsRootConstantBuffer {
                        parameter_index: bindings::bindless_params::DESCRIPTOR_INDICES_VERTEX,
                        address: indices_cbv,
                    });
                self.ctx
                    .deferred
                    .push(HostCommand::SetGraphicsRootDescriptorTable {
                        parameter_index: bindings::bindless_params::VIEW_HEAP,
                        base: DescriptorTableBase { heap, index: 0 },
                    });
                self.ctx
                    .deferred
                    .push(HostCommand::SetGraphicsRootDescriptorTable {
                        parameter_index: bindings::bindless_params::SAMPLER_HEAP,
                        base: DescriptorTableBase {
                            heap: self.texture_cache.sampler_heap(),
                            index: 0,
                        },
                    });
            } else {
                let extras = BindfulExtras {
                    textures_pixel: pixel_shader.is_some_and(|ps| !ps.texture_bindings.is_empty()),
                    samplers_pixel: pixel_shader.is_some_and(|ps| !ps.sampler_bindings.is_empty()),
                    textures_vertex: !vertex_shader.texture_bindings.is_empty(),
                    samplers_vertex: !vertex_shader.sampler_bindings.is_empty(),
                };
                let (_, indices) = bindings::bindful_root_signature_desc(extras);
                let vertex_count = vertex_shader.texture_bindings.len() as u32;
                if let Some(param) = indices.textures_vertex {
                    self.ctx
                        .deferred
                        .push(HostCommand::SetGraphicsRootDescriptorTable {
                            parameter_index: param,
                            base: DescriptorTableBase { heap, index: base },
                        });
                }
                if let Some(param) = indices.textures_pixel {
                    self.ctx
                        .deferred
                        .push(HostCommand::SetGraphicsRootDescriptorTable {
                            parameter_index: param,
                            base: DescriptorTableBase {
                                heap,
                                index: base + vertex_count,
                            },
                        });
                }
                let sampler_heap = self.texture_cache.sampler_heap();
                let vertex_samplers = vertex_shader.sampler_bindings.len();
                if let Some(param) = indices.samplers_vertex {
                    if let Some(first) = sampler_slots.first() {
                        self.ctx
                            .deferred
                            .push(HostCommand::SetGraphicsRootDescriptorTable {
                                parameter_index: param,
                                base: DescriptorTableBase {
                                    heap: sampler_heap,
                                    index: *first,
                                },
                            });
                    }
                }
                if let Some(param) = indices.samplers_pixel {
                    if let Some(first) = sampler_slots.get(vertex_samplers) {
                        self.ctx
                            .deferred
                            .push(HostCommand::SetGraphicsRootDescriptorTable {
                                parameter_index: param,
                                base: DescriptorTableBase {
                                    heap: sampler_heap,
                                    index: *first,
                                },
                            });
                    }
                }
            }
        }
        true
    }

    fn upload_register_range(&mut self, base: u32, count_dwords: u32) -> Option<xenos_hal::GpuAddress> {
        let mut values = Vec::with_capacity(count_dwords as usize);
        for i in 0..count_dwords {
            values.push(self.ctx.regs.get(base + i));
        }
        self.upload_dwords(&values)
    }

    fn upload_dwords(&mut self, values: &[u32]) -> Option<xenos_hal::GpuAddress> {
        let allocation = self.ctx.request_upload((values.len() * 4) as u64, 256)?;
        self.ctx.write_upload(&allocation, bytemuck::cast_slice(values));
        Some(allocation.gpu_address)
    }

    fn upload_pod<T: bytemuck::Pod>(&mut self, value: &T) -> Option<xenos_hal::GpuAddress> {
        let allocation = self
            .ctx
            .request_upload(std::mem::size_of::<T>() as u64, 256)?;
        self.ctx
            .write_upload(&allocation, bytemuck::bytes_of(value));
        Some(allocation.gpu_address)
    }

    fn system_constants(&self) -> SystemConstants {
        let regs = &self.ctx.regs;
        let vte = regs.get(regs::PA_CL_VTE_CNTL);
        let scale = |enabled_bit: u32, reg: u32, default: f32| {
            if vte & (1 << enabled_bit) != 0 {
                regs.get_f32(reg)
            } else {
                default
            }
        };
        SystemConstants {
            viewport_scale: [
                scale(0, regs::PA_CL_VPORT_XSCALE, 1280.0),
                scale(2, regs::PA_CL_VPORT_YSCALE, -720.0),
                scale(4, regs::PA_CL_VPORT_ZSCALE, 1.0),
            ],
            flags: 0,
            viewport_offset: [
                scale(1, regs::PA_CL_VPORT_XOFFSET, 1280.0),
                scale(3, regs::PA_CL_VPORT_YOFFSET, 720.0),
                scale(5, regs::PA_CL_VPORT_ZOFFSET, 0.0),
            ],
            vertex_index_endian: (regs.get(regs::VGT_DMA_SIZE) >> 30) & 0x3,
            color_exp_bias: [0; 4],
            line_loop_closing_index: 0,
            vertex_base_index: regs.get(regs::VGT_INDX_OFFSET) as i32,
            reserved: [0; 2],
        }
    }

    fn update_fixed_function_state(&mut self, topology: PrimitiveTopology) {
        let regs = &self.ctx.regs;
        let vte = regs.get(regs::PA_CL_VTE_CNTL);
        let scale_x = if vte & (1 << 0) != 0 {
            regs.get_f32(regs::PA_CL_VPORT_XSCALE).abs()
        } else {
            1280.0
        };
        let scale_y = if vte & (1 << 2) != 0 {
            regs.get_f32(regs::PA_CL_VPORT_YSCALE).abs()
        } else {
            720.0
        };
        let offset_x = if vte & (1 << 1) != 0 {
            regs.get_f32(regs::PA_CL_VPORT_XOFFSET)
        } else {
            scale_x
        };
        let offset_y = if vte & (1 << 3) != 0 {
            regs.get_f32(regs::PA_CL_VPORT_YOFFSET)
        } else {
            scale_y
        };
        let viewport = Viewport {
            x: (offset_x - scale_x).max(0.0),
            y: (offset_y - scale_y).max(0.0),
            width: scale_x * 2.0,
            height: scale_y * 2.0,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let tl = regs.get(regs::PA_SC_WINDOW_SCISSOR_TL);
        let br = regs.get(regs::PA_SC_WINDOW_SCISSOR_BR);
        let scissor = Rect {
            left: (tl & 0x7FFF) as i32,
            top: ((tl >> 16) & 0x7FFF) as i32,
            right: (br & 0x7FFF) as i32,
            bottom: ((br >> 16) & 0x7FFF) as i32,
        };
        let blend_factor = [
            regs.get_f32(regs::RB_BLEND_RED),
            regs.get_f32(regs::RB_BLEND_GREEN),
            regs.get_f32(regs::RB_BLEND_BLUE),
            regs.get_f32(regs::RB_BLEND_ALPHA),
        ];
        let stencil_ref = regs.get(regs::RB_STENCILREFMASK) & 0xFF;

        if self.ff_state.viewport != Some(viewport) {
            self.ff_state.viewport = Some(viewport);
            self.ctx.deferred.push(HostCommand::SetViewport { viewport });
        }
        if self.ff_state.scissor != Some(scissor) {
            self.ff_state.scissor = Some(scissor);
            self.ctx.deferred.push(HostCommand::SetScissor { rect: scissor });
        }
        if self.ff_state.blend_factor != Some(blend_factor) {
            self.ff_state.blend_factor = Some(blend_factor);
            self.ctx.deferred.push(HostCommand::SetBlendFactor {
                factor: blend_factor,
            });
        }
        if self.ff_state.stencil_ref != Some(stencil_ref) {
            self.ff_state.stencil_ref = Some(stencil_ref);
            self.ctx
                .deferred
                .push(HostCommand::SetStencilRef { value: stencil_ref });
        }
        if self.ff_state.primitive_topology != Some(topology) {
            self.ff_state.primitive_topology = Some(topology);
            self.ctx
                .deferred
                .push(HostCommand::SetPrimitiveTopology { topology });
        }
    }

    // ---- Resolves and swaps ------------------------------------------------

    /// Executes a guest resolve (copy + convert + clear from EDRAM).
    pub fn issue_copy(&mut self) -> bool {
        if !self.begin_submission(true) {
            return false;
        }
        let result = self.render_target_cache.resolve(
            &mut self.ctx,
            &mut self.shared_memory,
            &mut self.texture_cache,
        );
        // The converting path binds its own graphics state; drop the cached
        // values so the next draw re-records everything.
        self.ff_state = FixedFunctionState::default();
        self.current_graphics_root_signature = None;
        match result {
            Ok(Some(write)) => {
                if self.ctx.config.readback_resolve {
                    self.readback_resolve(write.guest_base, write.length);
                }
                true
            }
            Ok(None) => true,
            Err(()) => {
                tracing::debug!("resolve skipped");
                true
            }
        }
    }

    /// Debug path: copies the resolved guest range back to the CPU and into
    /// guest memory, stalling on the submission.
    fn readback_resolve(&mut self, guest_base: u32, length: u32) {
        if length == 0 {
            return;
        }
        let Some(readback) = self.ctx.request_readback_buffer(length as u64) else {
            return;
        };
        self.shared_memory.use_as_copy_source(&mut self.ctx);
        self.ctx.submit_barriers();
        self.ctx.deferred.push(HostCommand::CopyBufferRegion {
            dst: readback,
            dst_offset: 0,
            src: self.shared_memory.buffer(),
            src_offset: guest_base as u64,
            num_bytes: length as u64,
        });
        if !self.end_submission(false) {
            return;
        }
        self.check_submission_fence(self.ctx.submission_current - 1);
        let mut data = vec![0u8; length as usize];
        if self.ctx.device.read_buffer(readback, 0, &mut data).is_ok() {
            self.memory.write(guest_base, &data);
        }
    }

    /// Finalizes a frame: uploads a dirty gamma ramp, runs the gamma
    /// post-process into the swap image and hands it to the presenter.
    pub fn issue_swap(&mut self, frontbuffer_ptr: u32, width: u32, height: u32) -> bool {
        if !self.begin_submission(true) {
            return false;
        }

        if self.swap_image.map(|(_, _, w, h)| (w, h)) != Some((width, height))
            && width != 0
            && height != 0
        {
            if let Some((old_image, _, _, _)) = self.swap_image.take() {
                self.ctx.defer_destroy(ResourceHandle::Image(old_image));
            }
            if let Ok(image) = self.ctx.device.create_image(&ImageDesc {
                dimension: ImageDimension::D2,
                width,
                height,
                depth_or_layers: 1,
                mip_levels: 1,
                format: xenos_hal::Format::R8G8B8A8Unorm,
                usage: ImageUsage::UNORDERED_ACCESS | ImageUsage::SAMPLED,
                initial_state: ResourceState::UNORDERED_ACCESS,
                label: "swap image",
            }) {
                if let Ok(view) = self.ctx.device.create_image_view(&ImageViewDesc {
                    image,
                    format: xenos_hal::Format::R8G8B8A8Unorm,
                    dimension: ViewDimension::D2,
                    base_mip: 0,
                    mip_count: 1,
                    base_layer: 0,
                    layer_count: 1,
                    swizzle: Swizzle::IDENTITY,
                }) {
                    self.swap_image = Some((image, view, width, height));
                }
            }
        }

        // The frontbuffer itself comes out of the texture cache like any
        // guest texture.
        let mut fetch = crate::xenos::TextureFetchConstant::default();
        fetch.0[0] = crate::xenos::FETCH_CONSTANT_TYPE_TEXTURE;
        fetch.0[1] = (frontbuffer_ptr >> 12) << 12 | (crate::xenos::TextureFormat::K8888 as u32);
        fetch.0[2] = (width.max(1) - 1) | ((height.max(1) - 1) << 13);
        fetch.0[5] = 1 << 9;
        let frontbuffer_view = self.texture_cache.request_texture(
            &mut self.ctx,
            &mut self.shared_memory,
            &fetch,
            false,
        );

        if self.gamma_ramp_table_dirty || self.gamma_ramp_pwl_dirty {
            let mut words = self.gamma_ramp_table.to_vec();
            words.extend_from_slice(&self.gamma_ramp_pwl);
            if let Some(allocation) = self.ctx.request_upload((words.len() * 4) as u64, 4) {
                self.ctx
                    .write_upload(&allocation, bytemuck::cast_slice(&words));
                if self.ctx.push_transition_barrier(
                    ResourceHandle::Buffer(self.gamma_ramp_buffer),
                    self.gamma_ramp_buffer_state,
                    ResourceState::COPY_DEST,
                    None,
                ) {
                    self.gamma_ramp_buffer_state = ResourceState::COPY_DEST;
                }
                self.ctx.submit_barriers();
                self.ctx.deferred.push(HostCommand::CopyBufferRegion {
                    dst: self.gamma_ramp_buffer,
                    dst_offset: 0,
                    src: allocation.buffer,
                    src_offset: allocation.offset,
                    num_bytes: (words.len() * 4) as u64,
                });
                self.gamma_ramp_table_dirty = false;
                self.gamma_ramp_pwl_dirty = false;
            }
        }

        // Gamma post-process into the swap image.
        if let Some((_, swap_view, w, h)) = self.swap_image {
            if self.ctx.push_transition_barrier(
                ResourceHandle::Buffer(self.gamma_ramp_buffer),
                self.gamma_ramp_buffer_state,
                ResourceState::NON_PIXEL_SHADER_RESOURCE,
                None,
            ) {
                self.gamma_ramp_buffer_state = ResourceState::NON_PIXEL_SHADER_RESOURCE;
            }
            self.ctx.submit_barriers();
            let kernel = if self.gamma_ramp_is_pwl {
                xenos_hal::BuiltinKernel::ApplyGammaPwl
            } else {
                xenos_hal::BuiltinKernel::ApplyGammaTable
            };
            let pipeline_slot = if self.gamma_ramp_is_pwl {
                &mut self.gamma_pwl_pipeline
            } else {
                &mut self.gamma_table_pipeline
            };
            if pipeline_slot.is_none() {
                *pipeline_slot = self
                    .ctx
                    .device
                    .create_compute_pipeline(&xenos_hal::ComputePipelineDesc {
                        shader: xenos_hal::ShaderCode::Builtin(kernel),
                        root_signature: self.gamma_root_signature,
                        label: "apply gamma",
                    })
                    .ok();
            }
            if let (Some(pipeline), Some((heap, base))) = (
                *pipeline_slot,
                self.ctx.request_transient_view_descriptors(3),
            ) {
                let descriptors_ok = self
                    .ctx
                    .device
                    .write_image_srv(heap, base, frontbuffer_view)
                    .is_ok()
                    && self
                        .ctx
                        .device
                        .write_buffer_srv(
                            heap,
                            base + 1,
                            self.gamma_ramp_buffer,
                            xenos_hal::BufferViewKind::Raw {
                                size_bytes: 0x400 + 0x600,
                            },
                        )
                        .is_ok()
                    && self
                        .ctx
                        .device
                        .write_image_uav(heap, base + 2, swap_view)
                        .is_ok();
                if descriptors_ok {
                    self.ctx.deferred.push(HostCommand::SetComputeRootSignature {
                        signature: self.gamma_root_signature,
                    });
                    self.ctx.deferred.push(HostCommand::SetPipeline { pipeline });
                    self.ctx.deferred.push(HostCommand::SetComputeRootConstants {
                        parameter_index: 0,
                        dest_offset_dwords: 0,
                        values: vec![w, h],
                    });
                    self.ctx
                        .deferred
                        .push(HostCommand::SetComputeRootDescriptorTable {
                            parameter_index: 1,
                            base: DescriptorTableBase { heap, index: base },
                        });
                    self.ctx.deferred.push(HostCommand::Dispatch {
                        group_count_x: w.div_ceil(8),
                        group_count_y: h.div_ceil(8),
                        group_count_z: 1,
                    });
                }
            }
        }

        let presented = self.swap_image;
        if !self.end_submission(true) {
            return false;
        }
        if let (Some(presenter), Some((image, _, w, h))) = (self.presenter.as_mut(), presented) {
            presenter.present(image, w, h);
        }
        true
    }

    // ---- Trace/debug entry points ------------------------------------------

    pub fn restore_edram_snapshot(&mut self, snapshot: &[u8]) {
        if !self.begin_submission(false) {
            return;
        }
        self.render_target_cache
            .restore_edram_snapshot(&mut self.ctx, snapshot);
    }

    pub fn trace_playback_wrote_memory(&mut self, base: u32, length: u32) {
        self.shared_memory.trace_playback_wrote_memory(base, length);
    }

    /// Snapshots all currently valid shared memory into a readback buffer for
    /// trace capture.
    pub fn initialize_trace(&mut self) {
        if !self.begin_submission(false) {
            return;
        }
        let Some(readback) = self
            .ctx
            .request_readback_buffer(crate::shared_memory::BUFFER_SIZE as u64)
        else {
            return;
        };
        let ranges = self
            .shared_memory
            .submit_trace_download(&mut self.ctx, readback);
        if ranges.is_empty() {
            return;
        }
        self.end_submission(false);
        self.check_submission_fence(self.ctx.submission_current - 1);
    }

    // ---- PM4 ----------------------------------------------------------------

    /// Executes `count_dwords` packet dwords at `ptr` (trace playback and
    /// indirect buffers).
    pub fn execute_packets(&mut self, ptr: u32, count_dwords: u32) {
        let memory = self.memory.clone();
        let mut reader = RingReader::linear(&memory, ptr, count_dwords);
        while reader.remaining() > 0 {
            if !self.execute_packet(&mut reader) {
                break;
            }
        }
    }

    /// Executes packets in a ring of `1 << size_log2` dwords from
    /// `read_index` up to `write_index`. Returns the new read index.
    pub fn execute_ring(
        &mut self,
        base: u32,
        size_log2: u32,
        read_index: u32,
        write_index: u32,
    ) -> u32 {
        let size = 1u32 << size_log2;
        let remaining = (write_index.wrapping_sub(read_index)) & (size - 1);
        let memory = self.memory.clone();
        let mut reader = RingReader::ring(&memory, base, size, read_index, remaining);
        while reader.remaining() > 0 {
            if !self.execute_packet(&mut reader) {
                break;
            }
        }
        write_index
    }

    fn execute_packet(&mut self, reader: &mut RingReader<'_>) -> bool {
        let header = reader.read();
        if header == 0 {
            return true;
        }
        match crate::pm4::decode_header(header) {
            crate::pm4::PacketHeader::Type0 {
                base_index,
                count,
                one_register,
            } => {
                if count > reader.remaining() {
                    tracing::warn!("type-0 packet overruns the buffer, skipping");
                    reader.advance(reader.remaining());
                    return false;
                }
                for i in 0..count {
                    let value = reader.read();
                    let index = if one_register { base_index } else { base_index + i };
                    self.write_register(index, value);
                }
                true
            }
            crate::pm4::PacketHeader::Type1 {
                register_0,
                register_1,
            } => {
                if reader.remaining() < 2 {
                    reader.advance(reader.remaining());
                    return false;
                }
                let value_0 = reader.read();
                let value_1 = reader.read();
                self.write_register(register_0, value_0);
                self.write_register(register_1, value_1);
                true
            }
            crate::pm4::PacketHeader::Type2 => true,
            crate::pm4::PacketHeader::Type3 {
                opcode,
                count,
                predicated,
            } => {
                if count > reader.remaining() {
                    tracing::warn!(opcode, "type-3 packet overruns the buffer, skipping");
                    reader.advance(reader.remaining());
                    return false;
                }
                // Predication is handled by the viz query path; predicated
                // packets execute unconditionally here.
                let _ = predicated;
                self.execute_packet_type3(reader, opcode, count)
            }
        }
    }

    fn execute_packet_type3(
        &mut self,
        reader: &mut RingReader<'_>,
        opcode: u32,
        count: u32,
    ) -> bool {
        use crate::pm4::Type3Opcode as Op;
        let Some(opcode) = Op::from_u32(opcode) else {
            if let Some(flag) = self.unimplemented_opcode_logged.get_mut(opcode as usize) {
                if !*flag {
                    *flag = true;
                    tracing::warn!(opcode, "unimplemented type-3 opcode, skipping");
                }
            }
            reader.advance(count);
            return true;
        };
        match opcode {
            Op::MeInit | Op::Nop | Op::InvalidateState | Op::VizQuery => {
                reader.advance(count);
                true
            }
            Op::Interrupt => {
                // CPU interrupt request; the outer emulator polls fences
                // instead.
                reader.advance(count);
                true
            }
            Op::XeSwap => {
                let frontbuffer_ptr = reader.read();
                let mut width = 0;
                let mut height = 0;
                if count >= 3 {
                    width = reader.read();
                    height = reader.read();
                    reader.advance(count - 3);
                } else {
                    reader.advance(count - 1);
                }
                self.issue_swap(frontbuffer_ptr, width, height)
            }
            Op::IndirectBuffer | Op::IndirectBufferPfd => {
                let address = reader.read() & !0x3;
                let dword_count = reader.read() & 0xF_FFFF;
                self.execute_packets(address, dword_count);
                true
            }
            Op::WaitRegMem => {
                let wait_info = reader.read();
                let poll_address = reader.read();
                let reference = reader.read();
                let mask = reader.read();
                let _wait_interval = if count >= 5 { reader.read() } else { 0 };
                reader.advance(count.saturating_sub(5));
                let from_memory = wait_info & 0x10 != 0;
                let mut spins = 0u32;
                loop {
                    let value = if from_memory {
                        let endian = Endian::from_bits(poll_address);
                        gpu_swap(self.memory.read_u32(poll_address & !0x3), endian)
                    } else {
                        self.ctx.regs.get(poll_address & 0x7FFF)
                    } & mask;
                    let matched = match wait_info & 0x7 {
                        0 => false,
                        1 => value < reference,
                        2 => value <= reference,
                        3 => value == reference,
                        4 => value != reference,
                        5 => value >= reference,
                        6 => value > reference,
                        _ => true,
                    };
                    if matched {
                        break;
                    }
                    spins += 1;
                    if !from_memory || spins > 1000 {
                        // Register values only change from this thread;
                        // nothing external can satisfy the wait.
                        tracing::warn!("wait-reg-mem unsatisfied, continuing");
                        break;
                    }
                    std::hint::spin_loop();
                }
                true
            }
            Op::RegRmw => {
                let rmw_info = reader.read();
                let and_source = reader.read();
                let or_source = reader.read();
                reader.advance(count.saturating_sub(3));
                let register = rmw_info & 0x7FFF;
                let and_mask = if rmw_info & (1 << 30) != 0 {
                    self.ctx.regs.get(and_source & 0x7FFF)
                } else {
                    and_source
                };
                let or_value = if rmw_info & (1 << 31) != 0 {
                    self.ctx.regs.get(or_source & 0x7FFF)
                } else {
                    or_source
                };
                let value = (self.ctx.regs.get(register) & and_mask) | or_value;
                self.write_register(register, value);
                true
            }
            Op::RegToMem => {
                let register = reader.read();
                let address_info = reader.read();
                reader.advance(count.saturating_sub(2));
                let value = self.ctx.regs.get(register & 0x7FFF);
                let endian = Endian::from_bits(address_info);
                self.memory
                    .write_u32(address_info & !0x3, gpu_swap(value, endian));
                true
            }
            Op::MemWrite => {
                let address_info = reader.read();
                let endian = Endian::from_bits(address_info);
                let mut address = address_info & !0x3;
                for _ in 1..count {
                    let value = reader.read();
                    self.memory.write_u32(address, gpu_swap(value, endian));
                    address += 4;
                }
                true
            }
            Op::CondWrite => {
                let wait_info = reader.read();
                let poll_address = reader.read();
                let reference = reader.read();
                let mask = reader.read();
                let write_address = reader.read();
                let write_data = reader.read();
                reader.advance(count.saturating_sub(6));
                let value = if wait_info & 0x10 != 0 {
                    let endian = Endian::from_bits(poll_address);
                    gpu_swap(self.memory.read_u32(poll_address & !0x3), endian)
                } else {
                    self.ctx.regs.get(poll_address & 0x7FFF)
                } & mask;
                let matched = match wait_info & 0x7 {
                    0 => false,
                    1 => value < reference,
                    2 => value <= reference,
                    3 => value == reference,
                    4 => value != reference,
                    5 => value >= reference,
                    6 => value > reference,
                    _ => true,
                };
                if matched {
                    if wait_info & 0x100 != 0 {
                        let endian = Endian::from_bits(write_address);
                        self.memory
                            .write_u32(write_address & !0x3, gpu_swap(write_data, endian));
                    } else {
                        self.write_register(write_address & 0x7FFF, write_data);
                    }
                }
                true
            }
            Op::EventWrite => {
                let initiator = reader.read();
                reader.advance(count.saturating_sub(1));
                self.ctx
                    .regs
                    .set(regs::VGT_EVENT_INITIATOR, initiator & 0x3F);
                true
            }
            Op::EventWriteShd => {
                let initiator = reader.read();
                let address_info = reader.read();
                let value = reader.read();
                reader.advance(count.saturating_sub(3));
                self.ctx
                    .regs
                    .set(regs::VGT_EVENT_INITIATOR, initiator & 0x3F);
                let endian = Endian::from_bits(address_info);
                // Writeback either the literal value or the swap counter.
                let data = if (initiator >> 31) & 1 != 0 {
                    self.ctx.frame_current as u32
                } else {
                    value
                };
                self.memory
                    .write_u32(address_info & !0x3, gpu_swap(data, endian));
                true
            }
            Op::EventWriteExt => {
                let _initiator = reader.read();
                let address_info = reader.read();
                reader.advance(count.saturating_sub(2));
                // Screen extents report: 8 little u16 fields of an unclipped
                // surface.
                let endian = Endian::from_bits(address_info);
                let extents: [u16; 8] = [0, 0, 0x200, 0x200, 0, 0, 0x200, 0x200];
                let mut address = address_info & !0x3;
                for pair in extents.chunks(2) {
                    let dword = pair[0] as u32 | ((pair[1] as u32) << 16);
                    self.memory.write_u32(address, gpu_swap(dword, endian));
                    address += 4;
                }
                true
            }
            Op::EventWriteZpd => {
                reader.advance(count);
                true
            }
            Op::DrawIndx => {
                let _viz_query = reader.read();
                let initiator = reader.read();
                self.ctx.regs.set(regs::VGT_DRAW_INITIATOR, initiator);
                let primitive_type = PrimitiveType::from_u32(initiator & 0x3F);
                let index_count = initiator >> 16;
                let src_select = (initiator >> 6) & 0x3;
                let index_buffer = if src_select == 0 && count >= 4 {
                    let address = reader.read() & !0x3;
                    let size_dwords = reader.read();
                    reader.advance(count.saturating_sub(4));
                    let format = if initiator & (1 << 11) != 0 {
                        IndexFormat::Int32
                    } else {
                        IndexFormat::Int16
                    };
                    self.ctx.regs.set(regs::VGT_DMA_BASE, address);
                    self.ctx.regs.set(regs::VGT_DMA_SIZE, size_dwords);
                    Some(IndexBufferInfo {
                        guest_base: address,
                        format,
                        endianness: Endian::from_bits(size_dwords >> 30),
                        length_bytes: (size_dwords & 0x3FFF_FFFF) * 4,
                    })
                } else {
                    reader.advance(count.saturating_sub(2));
                    None
                };
                match primitive_type {
                    Some(primitive_type) => {
                        self.issue_draw(primitive_type, index_count, index_buffer, false)
                    }
                    None => true,
                }
            }
            Op::DrawIndx2 => {
                let initiator = reader.read();
                reader.advance(count.saturating_sub(1));
                self.ctx.regs.set(regs::VGT_DRAW_INITIATOR, initiator);
                let primitive_type = PrimitiveType::from_u32(initiator & 0x3F);
                let index_count = initiator >> 16;
                match primitive_type {
                    Some(primitive_type) => {
                        self.issue_draw(primitive_type, index_count, None, false)
                    }
                    None => true,
                }
            }
            Op::SetConstant | Op::SetConstant2 | Op::SetShaderConstants => {
                let offset_type = reader.read();
                let base = match opcode {
                    Op::SetConstant => {
                        let index = offset_type & 0x7FF;
                        match (offset_type >> 16) & 0xFF {
                            0 => regs::SHADER_CONSTANT_BASE + index,
                            1 => regs::FETCH_CONSTANT_BASE + index,
                            2 => regs::BOOL_CONSTANT_BASE + index,
                            3 => regs::LOOP_CONSTANT_BASE + index,
                            4 => 0x2000 + index,
                            _ => {
                                reader.advance(count - 1);
                                return true;
                            }
                        }
                    }
                    _ => offset_type & 0xFFFF,
                };
                self.write_register_range_from_ring(reader, base, count - 1);
                true
            }
            Op::LoadAluConstant => {
                let address = reader.read() & 0x3FFF_FFFF;
                let offset_type = reader.read();
                let size_dwords = reader.read() & 0xFFF;
                reader.advance(count.saturating_sub(3));
                let base = regs::SHADER_CONSTANT_BASE + (offset_type & 0x7FF);
                let mut values = vec![0u32; size_dwords as usize];
                for (i, value) in values.iter_mut().enumerate() {
                    *value = self.memory.read_u32(address + (i as u32) * 4);
                }
                self.write_register_range_from_mem(base, &values);
                true
            }
            Op::ImLoad => {
                let address_type = reader.read();
                let start_size = reader.read();
                reader.advance(count.saturating_sub(2));
                let shader_type = if address_type & 0x3 == 0 {
                    ShaderType::Vertex
                } else {
                    ShaderType::Pixel
                };
                let address = address_type & !0x3;
                let size_dwords = start_size & 0xFFFF;
                let mut ucode = vec![0u32; size_dwords as usize];
                for (i, dword) in ucode.iter_mut().enumerate() {
                    *dword = self.memory.read_u32(address + (i as u32) * 4);
                }
                self.set_active_shader(shader_type, &ucode);
                true
            }
            Op::ImLoadImmediate => {
                let shader_type_raw = reader.read();
                let start_size = reader.read();
                let size_dwords = (start_size & 0xFFFF).min(count.saturating_sub(2));
                let ucode = reader.read_many(size_dwords);
                reader.advance(count.saturating_sub(2 + size_dwords));
                let shader_type = if shader_type_raw == 0 {
                    ShaderType::Vertex
                } else {
                    ShaderType::Pixel
                };
                self.set_active_shader(shader_type, &ucode);
                true
            }
        }
    }

    fn set_active_shader(&mut self, shader_type: ShaderType, ucode: &[u32]) {
        let shader = self.load_shader(shader_type, ucode);
        match shader_type {
            ShaderType::Vertex => self.active_vertex_shader = shader,
            ShaderType::Pixel => self.active_pixel_shader = shader,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm4::{type0_header, type3_header, Type3Opcode};
    use crate::shader::NullShaderTranslator;
    use xenos_hal::testing::MockGpu;

    fn setup() -> (Arc<MockGpu>, Arc<GuestMemory>, CommandProcessor) {
        let gpu = MockGpu::new();
        let memory = Arc::new(GuestMemory::new());
        let cp = CommandProcessor::new(
            gpu.provider(),
            memory.clone(),
            Box::new(NullShaderTranslator),
            GpuConfig::default(),
        )
        .unwrap();
        (gpu, memory, cp)
    }

    #[test]
    fn submission_lifecycle_advances_fences() {
        let (gpu, _memory, mut cp) = setup();
        assert!(cp.begin_submission(false));
        assert!(cp.context().is_submission_open());
        assert!(!cp.context().is_frame_open());
        assert!(cp.end_submission(false));
        assert!(!cp.context().is_submission_open());

        cp.check_submission_fence(1);
        assert_eq!(cp.context().completed_submission(), 1);
        assert_eq!(cp.context().current_submission(), 2);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn begin_submission_promotes_to_frame() {
        let (_gpu, _memory, mut cp) = setup();
        assert!(cp.begin_submission(false));
        assert!(!cp.context().is_frame_open());
        assert!(cp.begin_submission(true));
        assert!(cp.context().is_frame_open());
        assert!(cp.end_submission(true));
        assert!(!cp.context().is_frame_open());
        assert_eq!(cp.context().current_frame(), 2);
    }

    #[test]
    fn device_removal_is_sticky() {
        let (gpu, _memory, mut cp) = setup();
        assert!(cp.begin_submission(true));
        gpu.set_fail_resource_creation(true);
        assert!(!cp.end_submission(false));
        assert!(cp.context().device_removed());
        // All further begins drain harmlessly.
        assert!(!cp.begin_submission(true));
        assert!(!cp.issue_draw(PrimitiveType::TriangleList, 3, None, false));
    }

    #[test]
    fn type0_packets_write_registers() {
        let (_gpu, memory, mut cp) = setup();
        memory.write_u32(0x100, type0_header(regs::RB_SURFACE_INFO, 2, false));
        memory.write_u32(0x104, 0xA0);
        memory.write_u32(0x108, 0xB0);
        cp.execute_packets(0x100, 3);
        assert_eq!(cp.context().regs.get(regs::RB_SURFACE_INFO), 0xA0);
        assert_eq!(cp.context().regs.get(regs::RB_COLOR_INFO), 0xB0);
    }

    #[test]
    fn set_constant_writes_alu_constants() {
        let (_gpu, memory, mut cp) = setup();
        memory.write_u32(0x200, type3_header(Type3Opcode::SetConstant, 3));
        memory.write_u32(0x204, 0x0000_0010); // ALU constant 0x10
        memory.write_u32(0x208, 0x3F80_0000);
        memory.write_u32(0x20C, 0x4000_0000);
        cp.execute_packets(0x200, 4);
        assert_eq!(
            cp.context().regs.get(regs::SHADER_CONSTANT_BASE + 0x10),
            0x3F80_0000
        );
        assert_eq!(
            cp.context().regs.get(regs::SHADER_CONSTANT_BASE + 0x11),
            0x4000_0000
        );
    }

    #[test]
    fn mem_write_swaps_and_stores() {
        let (_gpu, memory, mut cp) = setup();
        memory.write_u32(0x300, type3_header(Type3Opcode::MemWrite, 3));
        memory.write_u32(0x304, 0x0000_1000 | 2); // 8-in-32 swap
        memory.write_u32(0x308, 0x1122_3344);
        memory.write_u32(0x30C, 0x5566_7788);
        cp.execute_packets(0x300, 4);
        assert_eq!(memory.read_u32(0x1000), 0x4433_2211);
        assert_eq!(memory.read_u32(0x1004), 0x8877_6655);
    }

    #[test]
    fn reg_rmw_applies_masks() {
        let (_gpu, memory, mut cp) = setup();
        cp.write_register(regs::RB_SURFACE_INFO, 0xFF00);
        memory.write_u32(0x400, type3_header(Type3Opcode::RegRmw, 3));
        memory.write_u32(0x404, regs::RB_SURFACE_INFO);
        memory.write_u32(0x408, 0x0F00); // and mask, literal
        memory.write_u32(0x40C, 0x0011); // or value, literal
        cp.execute_packets(0x400, 4);
        assert_eq!(cp.context().regs.get(regs::RB_SURFACE_INFO), 0x0F11);
    }

    #[test]
    fn malformed_packet_is_skipped_conservatively() {
        let (_gpu, memory, mut cp) = setup();
        // Type-3 claiming more payload than the buffer holds.
        memory.write_u32(0x500, type3_header(Type3Opcode::Nop, 100));
        cp.execute_packets(0x500, 2);
        // No panic, the stream ends; registers untouched.
        assert_eq!(cp.context().regs.get(regs::RB_SURFACE_INFO), 0);
    }

    #[test]
    fn draws_without_render_targets_are_skipped() {
        let (gpu, _memory, mut cp) = setup();
        // RB_MODECONTROL not in color/depth mode.
        cp.write_register(regs::RB_MODECONTROL, 0);
        assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None, false));
        assert!(cp.end_submission(false));
        let commands = gpu.submission_commands(0);
        assert!(!commands
            .iter()
            .any(|c| matches!(c, HostCommand::DrawInstanced { .. })));
    }
}
