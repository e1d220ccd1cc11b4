use std::sync::Arc;

use crate::command::HostCommand;
use crate::types::{
    BufferDesc, BufferHandle, Capabilities, ComputePipelineDesc, DescriptorHeapDesc,
    DescriptorHeapHandle, FenceHandle, Format, FormatSupport, GpuAddress, GraphicsPipelineDesc,
    ImageDesc, ImageHandle, ImageViewDesc, ImageViewHandle, PipelineHandle, PipelineStatus,
    RootSignatureDesc, RootSignatureHandle, SamplerDesc,
};
use crate::HalError;

/// Resource creation, descriptor writes and introspection. All methods take
/// `&self`; implementations are internally synchronized.
pub trait Device: Send + Sync {
    fn capabilities(&self) -> Capabilities;
    fn format_support(&self, format: Format) -> FormatSupport;

    /// Creates a committed buffer, fully backed at creation.
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle, HalError>;
    /// Creates a reserved (sparse) buffer with no backing; tiles are mapped
    /// later through [`Queue::update_tile_mappings`].
    fn create_reserved_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle, HalError>;
    fn destroy_buffer(&self, buffer: BufferHandle);
    fn buffer_gpu_address(&self, buffer: BufferHandle) -> GpuAddress;
    /// CPU write into an upload buffer.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> Result<(), HalError>;
    /// CPU read out of a readback buffer.
    fn read_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), HalError>;

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle, HalError>;
    fn destroy_image(&self, image: ImageHandle);
    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<ImageViewHandle, HalError>;

    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDesc,
    ) -> Result<DescriptorHeapHandle, HalError>;
    fn write_buffer_srv(
        &self,
        heap: DescriptorHeapHandle,
        slot: u32,
        buffer: BufferHandle,
        view: BufferViewKind,
    ) -> Result<(), HalError>;
    fn write_buffer_uav(
        &self,
        heap: DescriptorHeapHandle,
        slot: u32,
        buffer: BufferHandle,
        view: BufferViewKind,
    ) -> Result<(), HalError>;
    fn write_image_srv(
        &self,
        heap: DescriptorHeapHandle,
        slot: u32,
        view: ImageViewHandle,
    ) -> Result<(), HalError>;
    fn write_image_uav(
        &self,
        heap: DescriptorHeapHandle,
        slot: u32,
        view: ImageViewHandle,
    ) -> Result<(), HalError>;
    fn write_sampler(
        &self,
        heap: DescriptorHeapHandle,
        slot: u32,
        sampler: &SamplerDesc,
    ) -> Result<(), HalError>;
    /// Copies descriptors between heaps (staging into a shader-visible heap).
    fn copy_descriptors(
        &self,
        dst_heap: DescriptorHeapHandle,
        dst_slot: u32,
        src_heap: DescriptorHeapHandle,
        src_slot: u32,
        count: u32,
    ) -> Result<(), HalError>;

    fn create_root_signature(
        &self,
        desc: &RootSignatureDesc,
    ) -> Result<RootSignatureHandle, HalError>;

    /// May complete asynchronously; poll with [`Device::pipeline_status`].
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> Result<PipelineHandle, HalError>;
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<PipelineHandle, HalError>;
    fn pipeline_status(&self, pipeline: PipelineHandle) -> PipelineStatus;
    /// Compiled bytes for persisting to the pipeline cache, once ready.
    fn pipeline_blob(&self, pipeline: PipelineHandle) -> Option<Vec<u8>>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    fn create_fence(&self) -> Result<FenceHandle, HalError>;
    fn fence_completed_value(&self, fence: FenceHandle) -> u64;
    /// Blocks until the fence reaches `value`.
    fn wait_fence(&self, fence: FenceHandle, value: u64);

    fn create_command_list(&self) -> Result<Box<dyn CommandList>, HalError>;
}

/// Buffer descriptor contents: a raw byte-address view or a typed view of
/// power-of-two dword elements.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BufferViewKind {
    Raw { size_bytes: u64 },
    Typed { format: Format, element_count: u64 },
}

/// A recording host command list. One `execute` call per replayed record.
pub trait CommandList: Send {
    fn execute(&mut self, command: &HostCommand) -> Result<(), HalError>;
    /// Recovers the concrete list type on the queue side.
    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any>;
}

pub trait Queue: Send + Sync {
    /// Submits a finished command list for execution.
    fn execute_command_list(&self, list: Box<dyn CommandList>) -> Result<(), HalError>;
    /// Enqueues a fence signal after previously submitted work.
    fn signal_fence(&self, fence: FenceHandle, value: u64) -> Result<(), HalError>;
    /// Maps backing for a tile range of a reserved buffer. Queued on the
    /// queue timeline, not on a command list.
    fn update_tile_mappings(
        &self,
        buffer: BufferHandle,
        range_offset_bytes: u64,
        range_size_bytes: u64,
    ) -> Result<(), HalError>;
}

/// The pair of host objects the core talks to.
#[derive(Clone)]
pub struct Provider {
    pub device: Arc<dyn Device>,
    pub queue: Arc<dyn Queue>,
}

impl Provider {
    pub fn new(device: Arc<dyn Device>, queue: Arc<dyn Queue>) -> Provider {
        Provider { device, queue }
    }
}
