//! Thin host-GPU abstraction consumed by the Xenos GPU core.
//!
//! The core records host work as [`HostCommand`] values and replays them onto
//! a [`CommandList`] obtained from a [`Device`]. Anything providing explicit
//! barriers, fences and descriptor tables (Direct3D 12, Vulkan, ...) can
//! implement these traits; the `testing` module (behind the `test-utils`
//! feature) provides an in-memory host so the core can be driven without a
//! real device.

mod command;
mod device;
mod types;

pub use command::{
    Barrier, DescriptorTableBase, HostCommand, IndexBufferView, PlacedBufferFootprint,
    ResourceHandle, TextureCopyLocation,
};
pub use device::{BufferViewKind, CommandList, Device, Provider, Queue};
pub use types::{
    AddressMode, BorderColor, BufferDesc, BufferHandle, BufferUsage, BuiltinKernel, Capabilities,
    ComparisonFunc, ComputePipelineDesc, CullMode, DescriptorHeapDesc, DescriptorHeapHandle,
    DescriptorHeapKind, DescriptorRange, DescriptorRangeKind, FenceHandle, FilterMode, Format,
    FormatSupport, GpuAddress, GraphicsPipelineDesc, GraphicsPipelineState, ImageDesc,
    ImageDimension, ImageHandle, ImageUsage, ImageViewDesc, ImageViewHandle, IndexFormat,
    MemoryClass, PipelineHandle, PipelineStatus, PrimitiveTopology, Rect, ResourceState,
    RootParameter, RootSignatureDesc, RootSignatureHandle, SamplerDesc, ShaderCode, Swizzle,
    ViewDimension, Viewport,
};

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use thiserror::Error;

/// Errors surfaced by host implementations.
///
/// `DeviceLost` is sticky on the core side: once seen, the command processor
/// drains the guest stream without touching the device again.
#[derive(Debug, Error)]
pub enum HalError {
    #[error("host device lost")]
    DeviceLost,
    #[error("host allocation failed ({0} bytes)")]
    OutOfMemory(u64),
    #[error("unknown or destroyed handle")]
    InvalidHandle,
    #[error("unsupported on this host: {0}")]
    Unsupported(&'static str),
}
