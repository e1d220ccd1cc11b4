use crate::types::{
    BufferHandle, DescriptorHeapHandle, Format, GpuAddress, ImageHandle, ImageViewHandle,
    IndexFormat, PipelineHandle, PrimitiveTopology, Rect, ResourceState, RootSignatureHandle,
    Viewport,
};

/// A buffer or an image; barriers and whole-resource copies take either.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ResourceHandle {
    Buffer(BufferHandle),
    Image(ImageHandle),
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Barrier {
    Transition {
        resource: ResourceHandle,
        old_state: ResourceState,
        new_state: ResourceState,
        /// `None` covers all subresources.
        subresource: Option<u32>,
    },
    /// Orders overlapping unordered-access writes. `None` is a full barrier.
    UnorderedAccess { resource: Option<ResourceHandle> },
    Aliasing {
        before: Option<ResourceHandle>,
        after: ResourceHandle,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IndexBufferView {
    pub address: GpuAddress,
    pub size_bytes: u32,
    pub format: IndexFormat,
}

/// Layout of image data placed linearly in a buffer, for buffer<->image
/// copies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PlacedBufferFootprint {
    pub offset: u64,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub row_pitch_bytes: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TextureCopyLocation {
    Subresource {
        image: ImageHandle,
        subresource: u32,
    },
    Placed {
        buffer: BufferHandle,
        footprint: PlacedBufferFootprint,
    },
}

/// Base of a descriptor table: a slot within a shader-visible heap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DescriptorTableBase {
    pub heap: DescriptorHeapHandle,
    pub index: u32,
}

/// One host command-list call. This is the exact command vocabulary the core
/// needs; a backend implements [`crate::CommandList::execute`] with one match
/// over this enum.
#[derive(Clone, PartialEq, Debug)]
pub enum HostCommand {
    CopyBufferRegion {
        dst: BufferHandle,
        dst_offset: u64,
        src: BufferHandle,
        src_offset: u64,
        num_bytes: u64,
    },
    CopyResource {
        dst: ResourceHandle,
        src: ResourceHandle,
    },
    CopyTextureRegion {
        dst: TextureCopyLocation,
        src: TextureCopyLocation,
    },
    Dispatch {
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    },
    DrawIndexedInstanced {
        index_count_per_instance: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    DrawInstanced {
        vertex_count_per_instance: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    SetIndexBuffer {
        view: Option<IndexBufferView>,
    },
    SetPrimitiveTopology {
        topology: PrimitiveTopology,
    },
    SetBlendFactor {
        factor: [f32; 4],
    },
    SetRenderTargets {
        colors: Vec<ImageViewHandle>,
        depth: Option<ImageViewHandle>,
    },
    SetStencilRef {
        value: u32,
    },
    ResourceBarriers {
        barriers: Vec<Barrier>,
    },
    SetScissor {
        rect: Rect,
    },
    SetViewport {
        viewport: Viewport,
    },
    SetComputeRootConstants {
        parameter_index: u32,
        dest_offset_dwords: u32,
        values: Vec<u32>,
    },
    SetGraphicsRootConstants {
        parameter_index: u32,
        dest_offset_dwords: u32,
        values: Vec<u32>,
    },
    SetComputeRootConstantBuffer {
        parameter_index: u32,
        address: GpuAddress,
    },
    SetGraphicsRootConstantBuffer {
        parameter_index: u32,
        address: GpuAddress,
    },
    SetComputeRootDescriptorTable {
        parameter_index: u32,
        base: DescriptorTableBase,
    },
    SetGraphicsRootDescriptorTable {
        parameter_index: u32,
        base: DescriptorTableBase,
    },
    SetComputeRootSignature {
        signature: RootSignatureHandle,
    },
    SetGraphicsRootSignature {
        signature: RootSignatureHandle,
    },
    SetDescriptorHeaps {
        views: Option<DescriptorHeapHandle>,
        samplers: Option<DescriptorHeapHandle>,
    },
    SetPipeline {
        pipeline: PipelineHandle,
    },
    /// 2x/4x programmable sample positions for EDRAM-compatible rasterization;
    /// an empty slice restores the default grid.
    SetSamplePositions {
        positions: Vec<(i8, i8)>,
    },
}
