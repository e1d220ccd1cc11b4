//! In-memory host implementation for tests.
//!
//! Buffers are backed by sparse CPU page maps, so even the 512 MiB shared
//! memory mirror costs only what is actually written. Every command executed
//! through the queue is appended to a log that tests inspect; buffer-to-buffer
//! copies are applied to the CPU backing so data-flow assertions work end to
//! end. Fences complete at the moment they are signaled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::command::{HostCommand, ResourceHandle};
use crate::device::{BufferViewKind, CommandList, Device, Provider, Queue};
use crate::types::{
    BufferDesc, BufferHandle, Capabilities, ComputePipelineDesc, DescriptorHeapDesc,
    DescriptorHeapHandle, FenceHandle, Format, FormatSupport, GpuAddress, GraphicsPipelineDesc,
    ImageDesc, ImageHandle, ImageViewDesc, ImageViewHandle, MemoryClass, PipelineHandle,
    PipelineStatus, RootSignatureDesc, RootSignatureHandle, SamplerDesc,
};
use crate::HalError;

const PAGE_SIZE: u64 = 4096;

/// Buffers get disjoint GPU address windows so addresses can be mapped back
/// to (buffer, offset) in assertions.
const ADDRESS_WINDOW_LOG2: u32 = 32;

#[derive(Default)]
struct PageStore {
    pages: HashMap<u64, Box<[u8]>>,
}

impl PageStore {
    fn read(&self, offset: u64, out: &mut [u8]) {
        let mut done = 0u64;
        let len = out.len() as u64;
        while done < len {
            let page = (offset + done) / PAGE_SIZE;
            let in_page = ((offset + done) % PAGE_SIZE) as usize;
            let chunk = ((PAGE_SIZE as usize - in_page) as u64).min(len - done) as usize;
            let dst = &mut out[done as usize..done as usize + chunk];
            match self.pages.get(&page) {
                Some(data) => dst.copy_from_slice(&data[in_page..in_page + chunk]),
                None => dst.fill(0),
            }
            done += chunk as u64;
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let mut done = 0u64;
        let len = data.len() as u64;
        while done < len {
            let page = (offset + done) / PAGE_SIZE;
            let in_page = ((offset + done) % PAGE_SIZE) as usize;
            let chunk = ((PAGE_SIZE as usize - in_page) as u64).min(len - done) as usize;
            let dst = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            dst[in_page..in_page + chunk]
                .copy_from_slice(&data[done as usize..done as usize + chunk]);
            done += chunk as u64;
        }
    }
}

struct MockBuffer {
    size: u64,
    memory: MemoryClass,
    reserved: bool,
    resident_tiles: std::collections::HashSet<u64>,
    store: PageStore,
}

/// A descriptor written into a mock heap, for assertions on binding code.
#[derive(Clone, Debug, PartialEq)]
pub enum DescriptorWrite {
    BufferSrv {
        buffer: BufferHandle,
        view: BufferViewKind,
    },
    BufferUav {
        buffer: BufferHandle,
        view: BufferViewKind,
    },
    ImageSrv(ImageViewHandle),
    ImageUav(ImageViewHandle),
    Sampler(SamplerDesc),
}

struct MockHeap {
    capacity: u32,
    writes: HashMap<u32, DescriptorWrite>,
}

struct MockPipeline {
    status: PipelineStatus,
    label: &'static str,
}

struct State {
    caps: Capabilities,
    next_id: u32,
    buffers: HashMap<u32, MockBuffer>,
    images: HashMap<u32, ImageDesc>,
    image_views: HashMap<u32, ImageViewDesc>,
    heaps: HashMap<u32, MockHeap>,
    root_signatures: HashMap<u32, RootSignatureDesc>,
    pipelines: HashMap<u32, MockPipeline>,
    fences: HashMap<u32, u64>,
    executed: Vec<HostCommand>,
    /// Index into `executed` at each queue submission boundary.
    submission_marks: Vec<usize>,
    tile_mapping_updates: u64,
    unfilterable_formats: Vec<Format>,
    defer_pipelines: bool,
    fail_resource_creation: bool,
    violations: Vec<String>,
}

/// The mock host device + queue. Clone an `Arc<MockGpu>` into both slots of a
/// [`Provider`] via [`MockGpu::provider`].
pub struct MockGpu {
    state: Mutex<State>,
}

impl MockGpu {
    pub fn new() -> Arc<MockGpu> {
        MockGpu::with_capabilities(Capabilities::default())
    }

    pub fn with_capabilities(caps: Capabilities) -> Arc<MockGpu> {
        Arc::new(MockGpu {
            state: Mutex::new(State {
                caps,
                next_id: 1,
                buffers: HashMap::new(),
                images: HashMap::new(),
                image_views: HashMap::new(),
                heaps: HashMap::new(),
                root_signatures: HashMap::new(),
                pipelines: HashMap::new(),
                fences: HashMap::new(),
                executed: Vec::new(),
                submission_marks: Vec::new(),
                tile_mapping_updates: 0,
                unfilterable_formats: Vec::new(),
                defer_pipelines: false,
                fail_resource_creation: false,
                violations: Vec::new(),
            }),
        })
    }

    pub fn provider(self: &Arc<Self>) -> Provider {
        Provider::new(self.clone(), self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Marks `format` as not linear-filterable, to exercise format fallbacks.
    pub fn set_format_unfilterable(&self, format: Format) {
        self.lock().unfilterable_formats.push(format);
    }

    /// New graphics pipelines stay `Pending` until
    /// [`MockGpu::complete_pending_pipelines`].
    pub fn set_deferred_pipelines(&self, defer: bool) {
        self.lock().defer_pipelines = defer;
    }

    pub fn complete_pending_pipelines(&self) {
        for pipeline in self.lock().pipelines.values_mut() {
            if pipeline.status == PipelineStatus::Pending {
                pipeline.status = PipelineStatus::Ready;
            }
        }
    }

    /// All subsequent resource creation fails, simulating device removal.
    pub fn set_fail_resource_creation(&self, fail: bool) {
        self.lock().fail_resource_creation = fail;
    }

    /// Every command executed on the queue so far, in order.
    pub fn executed_commands(&self) -> Vec<HostCommand> {
        self.lock().executed.clone()
    }

    /// Commands executed within submission `index` (0-based).
    pub fn submission_commands(&self, index: usize) -> Vec<HostCommand> {
        let state = self.lock();
        let start = if index == 0 {
            0
        } else {
            state.submission_marks[index - 1]
        };
        let end = state
            .submission_marks
            .get(index)
            .copied()
            .unwrap_or(state.executed.len());
        state.executed[start..end].to_vec()
    }

    pub fn submission_count(&self) -> usize {
        self.lock().submission_marks.len()
    }

    /// CPU view of a mock buffer's contents.
    pub fn buffer_bytes(&self, buffer: BufferHandle, offset: u64, len: usize) -> Vec<u8> {
        let state = self.lock();
        let mut out = vec![0u8; len];
        if let Some(buf) = state.buffers.get(&buffer.0) {
            buf.store.read(offset, &mut out);
        }
        out
    }

    pub fn descriptor(&self, heap: DescriptorHeapHandle, slot: u32) -> Option<DescriptorWrite> {
        self.lock()
            .heaps
            .get(&heap.0)
            .and_then(|h| h.writes.get(&slot))
            .cloned()
    }

    pub fn tile_mapping_updates(&self) -> u64 {
        self.lock().tile_mapping_updates
    }

    /// Host-API usage violations observed while executing (copies into
    /// unmapped sparse regions, waits on unsignaled fences, ...).
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    /// Maps a GPU address back to the buffer and offset it points into.
    pub fn resolve_address(&self, address: GpuAddress) -> (BufferHandle, u64) {
        let id = (address.0 >> ADDRESS_WINDOW_LOG2) as u32;
        let offset = address.0 & ((1u64 << ADDRESS_WINDOW_LOG2) - 1);
        (BufferHandle(id), offset)
    }
}

impl State {
    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_buffer_common(
        &mut self,
        desc: &BufferDesc,
        reserved: bool,
    ) -> Result<BufferHandle, HalError> {
        if self.fail_resource_creation {
            return Err(HalError::DeviceLost);
        }
        let id = self.alloc_id();
        self.buffers.insert(
            id,
            MockBuffer {
                size: desc.size,
                memory: desc.memory,
                reserved,
                resident_tiles: std::collections::HashSet::new(),
                store: PageStore::default(),
            },
        );
        Ok(BufferHandle(id))
    }

    fn apply(&mut self, command: &HostCommand) {
        if let HostCommand::CopyBufferRegion {
            dst,
            dst_offset,
            src,
            src_offset,
            num_bytes,
        } = command
        {
            self.check_sparse_access(*dst, *dst_offset, *num_bytes, "copy dst");
            self.check_sparse_access(*src, *src_offset, *num_bytes, "copy src");
            let mut data = vec![0u8; *num_bytes as usize];
            if let Some(src_buf) = self.buffers.get(&src.0) {
                src_buf.store.read(*src_offset, &mut data);
            }
            if let Some(dst_buf) = self.buffers.get_mut(&dst.0) {
                dst_buf.store.write(*dst_offset, &data);
            }
        } else if let HostCommand::CopyResource {
            dst: ResourceHandle::Buffer(dst),
            src: ResourceHandle::Buffer(src),
        } = command
        {
            let size = self.buffers.get(&src.0).map(|b| b.size).unwrap_or(0);
            let mut data = vec![0u8; size as usize];
            if let Some(src_buf) = self.buffers.get(&src.0) {
                src_buf.store.read(0, &mut data);
            }
            if let Some(dst_buf) = self.buffers.get_mut(&dst.0) {
                dst_buf.store.write(0, &data);
            }
        }
        self.executed.push(command.clone());
    }

    fn check_sparse_access(&mut self, buffer: BufferHandle, offset: u64, len: u64, what: &str) {
        let tile_size = self.caps.sparse_tile_size;
        let Some(buf) = self.buffers.get(&buffer.0) else {
            self.violations
                .push(format!("{what}: unknown buffer {buffer:?}"));
            return;
        };
        if !buf.reserved || len == 0 {
            return;
        }
        let first = offset / tile_size;
        let last = (offset + len - 1) / tile_size;
        for tile in first..=last {
            if !buf.resident_tiles.contains(&tile) {
                let violation =
                    format!("{what}: buffer {:?} tile {tile} not resident", buffer);
                tracing::warn!(target: "xenos_hal::testing", "{violation}");
                self.violations.push(violation);
            }
        }
    }
}

struct MockCommandList {
    commands: Vec<HostCommand>,
}

impl CommandList for MockCommandList {
    fn execute(&mut self, command: &HostCommand) -> Result<(), HalError> {
        self.commands.push(command.clone());
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

impl Device for MockGpu {
    fn capabilities(&self) -> Capabilities {
        self.lock().caps.clone()
    }

    fn format_support(&self, format: Format) -> FormatSupport {
        let state = self.lock();
        let mut support = FormatSupport::SAMPLED | FormatSupport::FILTER_LINEAR;
        if !format.is_block_compressed() {
            support |= FormatSupport::UNORDERED_ACCESS;
            if format.is_depth() {
                support |= FormatSupport::DEPTH_STENCIL;
            } else {
                support |= FormatSupport::RENDER_TARGET | FormatSupport::BLEND;
            }
        }
        if state.unfilterable_formats.contains(&format) {
            support &= !FormatSupport::FILTER_LINEAR;
        }
        support
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle, HalError> {
        self.lock().create_buffer_common(desc, false)
    }

    fn create_reserved_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle, HalError> {
        let mut state = self.lock();
        if !state.caps.tiled_resources {
            return Err(HalError::Unsupported("reserved buffers"));
        }
        state.create_buffer_common(desc, true)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.lock().buffers.remove(&buffer.0);
    }

    fn buffer_gpu_address(&self, buffer: BufferHandle) -> GpuAddress {
        GpuAddress((buffer.0 as u64) << ADDRESS_WINDOW_LOG2)
    }

    fn write_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), HalError> {
        let mut state = self.lock();
        let buf = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(HalError::InvalidHandle)?;
        if buf.memory != MemoryClass::Upload {
            return Err(HalError::Unsupported("CPU write to non-upload buffer"));
        }
        buf.store.write(offset, data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), HalError> {
        let state = self.lock();
        let buf = state.buffers.get(&buffer.0).ok_or(HalError::InvalidHandle)?;
        buf.store.read(offset, out);
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle, HalError> {
        let mut state = self.lock();
        if state.fail_resource_creation {
            return Err(HalError::DeviceLost);
        }
        let id = state.alloc_id();
        state.images.insert(id, desc.clone());
        Ok(ImageHandle(id))
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.lock().images.remove(&image.0);
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<ImageViewHandle, HalError> {
        let mut state = self.lock();
        if !state.images.contains_key(&desc.image.0) {
            return Err(HalError::InvalidHandle);
        }
        let id = state.alloc_id();
        state.image_views.insert(id, desc.clone());
        Ok(ImageViewHandle(id))
    }

    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDesc,
    ) -> Result<DescriptorHeapHandle, HalError> {
        let mut state = self.lock();
        if state.fail_resource_creation {
            return Err(HalError::DeviceLost);
        }
        let id = state.alloc_id();
        state.heaps.insert(
            id,
            MockHeap {
                capacity: desc.capacity,
                writes: HashMap::new(),
            },
        );
        Ok(DescriptorHeapHandle(id))
    }

    fn write_buffer_srv(
        &self,
        heap: DescriptorHeapHandle,
        slot: u32,
        buffer: BufferHandle,
        view: BufferViewKind,
    ) -> Result<(), HalError> {
        self.write_descriptor(heap, slot, DescriptorWrite::BufferSrv { buffer, view })
    }

    fn write_buffer_uav(
        &self,
        heap: DescriptorHeapHandle,
        slot: u32,
        buffer: BufferHandle,
        view: BufferViewKind,
    ) -> Result<(), HalError> {
        self.write_descriptor(heap, slot, DescriptorWrite::BufferUav { buffer, view })
    }

    fn write_image_srv(
        &self,
        heap: DescriptorHeapHandle,
        slot: u32,
        view: ImageViewHandle,
    ) -> Result<(), HalError> {
        self.write_descriptor(heap, slot, DescriptorWrite::ImageSrv(view))
    }

    fn write_image_uav(
        &self,
        heap: DescriptorHeapHandle,
        slot: u32,
        view: ImageViewHandle,
    ) -> Result<(), HalError> {
        self.write_descriptor(heap, slot, DescriptorWrite::ImageUav(view))
    }

    fn write_sampler(
        &self,
        heap: DescriptorHeapHandle,
        slot: u32,
        sampler: &SamplerDesc,
    ) -> Result<(), HalError> {
        self.write_descriptor(heap, slot, DescriptorWrite::Sampler(*sampler))
    }

    fn copy_descriptors(
        &self,
        dst_heap: DescriptorHeapHandle,
        dst_slot: u32,
        src_heap: DescriptorHeapHandle,
        src_slot: u32,
        count: u32,
    ) -> Result<(), HalError> {
        let mut state = self.lock();
        for i in 0..count {
            let write = state
                .heaps
                .get(&src_heap.0)
                .and_then(|h| h.writes.get(&(src_slot + i)))
                .cloned();
            if let Some(write) = write {
                let dst = state.heaps.get_mut(&dst_heap.0).ok_or(HalError::InvalidHandle)?;
                dst.writes.insert(dst_slot + i, write);
            }
        }
        Ok(())
    }

    fn create_root_signature(
        &self,
        desc: &RootSignatureDesc,
    ) -> Result<RootSignatureHandle, HalError> {
        let mut state = self.lock();
        let id = state.alloc_id();
        state.root_signatures.insert(id, desc.clone());
        Ok(RootSignatureHandle(id))
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> Result<PipelineHandle, HalError> {
        let mut state = self.lock();
        if state.fail_resource_creation {
            return Err(HalError::DeviceLost);
        }
        let status = if state.defer_pipelines {
            PipelineStatus::Pending
        } else {
            PipelineStatus::Ready
        };
        let id = state.alloc_id();
        state.pipelines.insert(
            id,
            MockPipeline {
                status,
                label: desc.label,
            },
        );
        Ok(PipelineHandle(id))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<PipelineHandle, HalError> {
        let mut state = self.lock();
        if state.fail_resource_creation {
            return Err(HalError::DeviceLost);
        }
        let id = state.alloc_id();
        state.pipelines.insert(
            id,
            MockPipeline {
                status: PipelineStatus::Ready,
                label: desc.label,
            },
        );
        Ok(PipelineHandle(id))
    }

    fn pipeline_status(&self, pipeline: PipelineHandle) -> PipelineStatus {
        self.lock()
            .pipelines
            .get(&pipeline.0)
            .map(|p| p.status)
            .unwrap_or(PipelineStatus::Failed)
    }

    fn pipeline_blob(&self, pipeline: PipelineHandle) -> Option<Vec<u8>> {
        let state = self.lock();
        let p = state.pipelines.get(&pipeline.0)?;
        if p.status != PipelineStatus::Ready {
            return None;
        }
        Some(p.label.as_bytes().to_vec())
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.lock().pipelines.remove(&pipeline.0);
    }

    fn create_fence(&self) -> Result<FenceHandle, HalError> {
        let mut state = self.lock();
        let id = state.alloc_id();
        state.fences.insert(id, 0);
        Ok(FenceHandle(id))
    }

    fn fence_completed_value(&self, fence: FenceHandle) -> u64 {
        self.lock().fences.get(&fence.0).copied().unwrap_or(0)
    }

    fn wait_fence(&self, fence: FenceHandle, value: u64) {
        let mut state = self.lock();
        let current = state.fences.get(&fence.0).copied().unwrap_or(0);
        if current < value {
            let violation = format!(
                "wait on fence {fence:?} for {value} but only {current} signaled"
            );
            tracing::warn!(target: "xenos_hal::testing", "{violation}");
            state.violations.push(violation);
        }
    }

    fn create_command_list(&self) -> Result<Box<dyn CommandList>, HalError> {
        if self.lock().fail_resource_creation {
            return Err(HalError::DeviceLost);
        }
        Ok(Box::new(MockCommandList {
            commands: Vec::new(),
        }))
    }
}

impl MockGpu {
    fn write_descriptor(
        &self,
        heap: DescriptorHeapHandle,
        slot: u32,
        write: DescriptorWrite,
    ) -> Result<(), HalError> {
        let mut state = self.lock();
        let h = state.heaps.get_mut(&heap.0).ok_or(HalError::InvalidHandle)?;
        if slot >= h.capacity {
            return Err(HalError::Unsupported("descriptor slot out of range"));
        }
        h.writes.insert(slot, write);
        Ok(())
    }
}

impl Queue for MockGpu {
    fn execute_command_list(&self, list: Box<dyn CommandList>) -> Result<(), HalError> {
        let list = list
            .into_any()
            .downcast::<MockCommandList>()
            .map_err(|_| HalError::Unsupported("foreign command list"))?;
        let mut state = self.lock();
        for command in &list.commands {
            state.apply(command);
        }
        let mark = state.executed.len();
        state.submission_marks.push(mark);
        Ok(())
    }

    fn signal_fence(&self, fence: FenceHandle, value: u64) -> Result<(), HalError> {
        let mut state = self.lock();
        let slot = state.fences.get_mut(&fence.0).ok_or(HalError::InvalidHandle)?;
        *slot = (*slot).max(value);
        Ok(())
    }

    fn update_tile_mappings(
        &self,
        buffer: BufferHandle,
        range_offset_bytes: u64,
        range_size_bytes: u64,
    ) -> Result<(), HalError> {
        let mut state = self.lock();
        let tile_size = state.caps.sparse_tile_size;
        state.tile_mapping_updates += 1;
        let buf = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(HalError::InvalidHandle)?;
        if !buf.reserved {
            return Err(HalError::Unsupported("tile mapping on committed buffer"));
        }
        if range_size_bytes == 0 {
            return Ok(());
        }
        let first = range_offset_bytes / tile_size;
        let last = (range_offset_bytes + range_size_bytes - 1) / tile_size;
        for tile in first..=last {
            buf.resident_tiles.insert(tile);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BufferUsage, ResourceState};

    fn buffer_desc(size: u64, memory: MemoryClass) -> BufferDesc {
        BufferDesc {
            size,
            usage: BufferUsage::empty(),
            memory,
            initial_state: ResourceState::COPY_DEST,
            label: "test buffer",
        }
    }

    #[test]
    fn page_store_reads_back_writes_across_page_boundaries() {
        let mut store = PageStore::default();
        let data: Vec<u8> = (0..=255).collect();
        store.write(PAGE_SIZE - 128, &data);

        let mut out = vec![0u8; 256];
        store.read(PAGE_SIZE - 128, &mut out);
        assert_eq!(out, data);

        // Untouched pages read as zero.
        let mut hole = vec![0xAAu8; 16];
        store.read(PAGE_SIZE * 10, &mut hole);
        assert_eq!(hole, vec![0u8; 16]);
    }

    #[test]
    fn copy_into_unmapped_sparse_tile_is_reported() {
        let gpu = MockGpu::new();
        let sparse = gpu
            .create_reserved_buffer(&buffer_desc(1 << 20, MemoryClass::DeviceLocal))
            .unwrap();
        let upload = gpu
            .create_buffer(&buffer_desc(4096, MemoryClass::Upload))
            .unwrap();

        let mut list = gpu.create_command_list().unwrap();
        list.execute(&HostCommand::CopyBufferRegion {
            dst: sparse,
            dst_offset: 0,
            src: upload,
            src_offset: 0,
            num_bytes: 16,
        })
        .unwrap();
        gpu.execute_command_list(list).unwrap();
        assert_eq!(gpu.violations().len(), 1);

        // After mapping the tile the same copy is clean.
        gpu.update_tile_mappings(sparse, 0, 64 * 1024).unwrap();
        let mut list = gpu.create_command_list().unwrap();
        list.execute(&HostCommand::CopyBufferRegion {
            dst: sparse,
            dst_offset: 0,
            src: upload,
            src_offset: 0,
            num_bytes: 16,
        })
        .unwrap();
        gpu.execute_command_list(list).unwrap();
        assert_eq!(gpu.violations().len(), 1);
    }

    #[test]
    fn buffer_copies_move_bytes_between_stores() {
        let gpu = MockGpu::new();
        let src = gpu
            .create_buffer(&buffer_desc(4096, MemoryClass::Upload))
            .unwrap();
        let dst = gpu
            .create_buffer(&buffer_desc(4096, MemoryClass::DeviceLocal))
            .unwrap();
        gpu.write_buffer(src, 256, &[1, 2, 3, 4]).unwrap();

        let mut list = gpu.create_command_list().unwrap();
        list.execute(&HostCommand::CopyBufferRegion {
            dst,
            dst_offset: 16,
            src,
            src_offset: 256,
            num_bytes: 4,
        })
        .unwrap();
        gpu.execute_command_list(list).unwrap();

        assert_eq!(gpu.buffer_bytes(dst, 16, 4), vec![1, 2, 3, 4]);
        assert_eq!(gpu.submission_count(), 1);
    }
}
