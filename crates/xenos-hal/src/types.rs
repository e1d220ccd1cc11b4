use bitflags::bitflags;

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

handle_type!(
    /// A buffer owned by the host device. Plain value; resolved by the device.
    BufferHandle
);
handle_type!(ImageHandle);
handle_type!(ImageViewHandle);
handle_type!(DescriptorHeapHandle);
handle_type!(RootSignatureHandle);
handle_type!(PipelineHandle);
handle_type!(FenceHandle);

/// A GPU virtual address within some buffer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, PartialOrd, Ord)]
pub struct GpuAddress(pub u64);

impl GpuAddress {
    pub fn offset(self, bytes: u64) -> GpuAddress {
        GpuAddress(self.0 + bytes)
    }
}

/// Host resource formats the core selects from. The set covers every host
/// format the guest format matrix and the render-target cache can produce.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Format {
    R8Unorm,
    R8Snorm,
    R8Uint,
    R8G8Unorm,
    R8G8Snorm,
    R8G8B8A8Unorm,
    R8G8B8A8Snorm,
    B5G6R5Unorm,
    B5G5R5A1Unorm,
    B4G4R4A4Unorm,
    R10G10B10A2Unorm,
    R10G10B10A2Snorm,
    R16Unorm,
    R16Snorm,
    R16Float,
    R16G16Unorm,
    R16G16Snorm,
    R16G16Float,
    R16G16B16A16Unorm,
    R16G16B16A16Snorm,
    R16G16B16A16Float,
    R32Uint,
    R32Float,
    R32G32Uint,
    R32G32Float,
    R32G32B32A32Uint,
    R32G32B32A32Float,
    Bc1RgbaUnorm,
    Bc2RgbaUnorm,
    Bc3RgbaUnorm,
    D24UnormS8Uint,
    D32Float,
    D32FloatS8Uint,
}

impl Format {
    /// Bytes per block (per texel for uncompressed formats).
    pub fn block_size_bytes(self) -> u32 {
        match self {
            Format::R8Unorm | Format::R8Snorm | Format::R8Uint => 1,
            Format::R8G8Unorm
            | Format::R8G8Snorm
            | Format::B5G6R5Unorm
            | Format::B5G5R5A1Unorm
            | Format::B4G4R4A4Unorm
            | Format::R16Unorm
            | Format::R16Snorm
            | Format::R16Float => 2,
            Format::R8G8B8A8Unorm
            | Format::R8G8B8A8Snorm
            | Format::R10G10B10A2Unorm
            | Format::R10G10B10A2Snorm
            | Format::R16G16Unorm
            | Format::R16G16Snorm
            | Format::R16G16Float
            | Format::R32Uint
            | Format::R32Float
            | Format::D24UnormS8Uint
            | Format::D32Float => 4,
            Format::R16G16B16A16Unorm
            | Format::R16G16B16A16Snorm
            | Format::R16G16B16A16Float
            | Format::R32G32Uint
            | Format::R32G32Float
            | Format::D32FloatS8Uint
            | Format::Bc1RgbaUnorm => 8,
            Format::R32G32B32A32Uint | Format::R32G32B32A32Float => 16,
            Format::Bc2RgbaUnorm | Format::Bc3RgbaUnorm => 16,
        }
    }

    /// Block footprint in texels; 4x4 for the BC family, 1x1 otherwise.
    pub fn block_dim(self) -> (u32, u32) {
        match self {
            Format::Bc1RgbaUnorm | Format::Bc2RgbaUnorm | Format::Bc3RgbaUnorm => (4, 4),
            _ => (1, 1),
        }
    }

    pub fn is_block_compressed(self) -> bool {
        self.block_dim() != (1, 1)
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Format::D24UnormS8Uint | Format::D32Float | Format::D32FloatS8Uint
        )
    }
}

bitflags! {
    /// Resource states for transition barriers, modeled after explicit-barrier
    /// APIs. Read states may be combined.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ResourceState: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const DEPTH_WRITE = 1 << 4;
        const DEPTH_READ = 1 << 5;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 6;
        const PIXEL_SHADER_RESOURCE = 1 << 7;
        const COPY_DEST = 1 << 8;
        const COPY_SOURCE = 1 << 9;
    }
}

impl ResourceState {
    /// States the shared-memory buffer needs for vertex/index/texel fetches.
    pub fn shader_read() -> ResourceState {
        ResourceState::INDEX_BUFFER
            | ResourceState::NON_PIXEL_SHADER_RESOURCE
            | ResourceState::PIXEL_SHADER_RESOURCE
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryClass {
    /// Device-local memory, not CPU-visible.
    DeviceLocal,
    /// CPU-write-visible upload memory.
    Upload,
    /// CPU-read-visible readback memory.
    Readback,
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct BufferUsage: u32 {
        const UNORDERED_ACCESS = 1 << 0;
        const INDEX = 1 << 1;
        const CONSTANT = 1 << 2;
    }
}

#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryClass,
    pub initial_state: ResourceState,
    pub label: &'static str,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ImageDimension {
    D2,
    D3,
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const DEPTH_STENCIL = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
    }
}

#[derive(Clone, Debug)]
pub struct ImageDesc {
    pub dimension: ImageDimension,
    pub width: u32,
    pub height: u32,
    /// Depth for 3D images, array layer count otherwise (6 per cube).
    pub depth_or_layers: u32,
    pub mip_levels: u32,
    pub format: Format,
    pub usage: ImageUsage,
    pub initial_state: ResourceState,
    pub label: &'static str,
}

impl ImageDesc {
    pub fn subresource_count(&self) -> u32 {
        let layers = match self.dimension {
            ImageDimension::D2 => self.depth_or_layers,
            ImageDimension::D3 => 1,
        };
        self.mip_levels * layers
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ViewDimension {
    D2,
    D2Array,
    Cube,
    D3,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Swizzle {
    R,
    G,
    B,
    A,
    Zero,
    One,
}

impl Swizzle {
    pub const IDENTITY: [Swizzle; 4] = [Swizzle::R, Swizzle::G, Swizzle::B, Swizzle::A];
}

#[derive(Clone, Debug)]
pub struct ImageViewDesc {
    pub image: ImageHandle,
    pub format: Format,
    pub dimension: ViewDimension,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub swizzle: [Swizzle; 4],
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DescriptorHeapKind {
    /// CBV / SRV / UAV descriptors.
    View,
    Sampler,
}

#[derive(Clone, Debug)]
pub struct DescriptorHeapDesc {
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    pub shader_visible: bool,
    pub label: &'static str,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FilterMode {
    Point,
    Linear,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddressMode {
    Repeat,
    Mirror,
    ClampToEdge,
    MirrorClampToEdge,
    ClampToBorder,
    MirrorClampToBorder,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BorderColor {
    TransparentBlack,
    OpaqueWhite,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ComparisonFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct SamplerDesc {
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mip_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub anisotropy_max: u32,
    pub border_color: BorderColor,
    pub mip_min_level: f32,
    pub mip_max_level: f32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    /// Tessellation patch list with the given control point count.
    PatchList(u8),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size_bytes(self) -> u32 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }
    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }
    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }
}

/// Internal compute/graphics kernels the core dispatches. The host backend
/// supplies its own compiled bytecode for each; the core never embeds host
/// shader code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BuiltinKernel {
    EdramLoadColor32bpp,
    EdramLoadColor64bpp,
    EdramLoadColor7e3,
    EdramLoadDepthUnorm,
    EdramLoadDepthFloat,
    EdramStoreColor32bpp,
    EdramStoreColor64bpp,
    EdramStoreColor7e3,
    EdramStoreDepthUnorm,
    EdramStoreDepthFloat,
    EdramTileSample32bpp,
    EdramTileSample64bpp,
    EdramClear32bpp,
    EdramClear64bpp,
    EdramClearDepthFloat,
    ResolveVertex,
    ResolvePixel,
    ApplyGammaTable,
    ApplyGammaPwl,
    TextureLoad8bpb,
    TextureLoad16bpb,
    TextureLoad32bpb,
    TextureLoad64bpb,
    TextureLoad128bpb,
    TextureLoadR5G5B5A1ToB5G5R5A1,
    TextureLoadR5G6B5ToB5G6R5,
    TextureLoadR5G5B6ToB5G6R5WithRbga,
    TextureLoadR4G4B4A4ToA4R4G4B4,
    TextureLoadR10G11B11ToRgba16,
    TextureLoadR10G11B11ToRgba16Snorm,
    TextureLoadR11G11B10ToRgba16,
    TextureLoadR11G11B10ToRgba16Snorm,
    TextureLoadR16UnormToFloat,
    TextureLoadR16SnormToFloat,
    TextureLoadRg16UnormToFloat,
    TextureLoadRg16SnormToFloat,
    TextureLoadRgba16UnormToFloat,
    TextureLoadRgba16SnormToFloat,
    TextureLoadGbgr8ToRgb8,
    TextureLoadBgrg8ToRgb8,
    TextureLoadDxt1ToRgba8,
    TextureLoadDxt3ToRgba8,
    TextureLoadDxt5ToRgba8,
    TextureLoadDxnToRg8,
    TextureLoadDxt3a,
    TextureLoadDxt3aAs1111ToArgb4,
    TextureLoadDxt5aToR8,
    TextureLoadCtx1,
    TextureLoadDepthUnorm,
    TextureLoadDepthFloat,
    TextureTile8bpp,
    TextureTile16bpp,
    TextureTile32bpp,
    TextureTile64bpp,
}

/// Shader code for pipeline creation: either a blob produced by the guest
/// shader translator, or one of the backend-provided builtin kernels.
#[derive(Clone, Debug)]
pub enum ShaderCode {
    Translated(std::sync::Arc<Vec<u8>>),
    Builtin(BuiltinKernel),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// The fixed-function state baked into a graphics pipeline. Kept compact;
/// the full guest state is reduced to this by the pipeline cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GraphicsPipelineState {
    pub cull_mode: CullMode,
    pub front_counter_clockwise: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: ComparisonFunc,
    pub stencil_enable: bool,
    pub blend_enable: [bool; 4],
    pub color_write_masks: [u8; 4],
    pub primitive_restart: bool,
}

impl Default for GraphicsPipelineState {
    fn default() -> Self {
        GraphicsPipelineState {
            cull_mode: CullMode::None,
            front_counter_clockwise: false,
            depth_test: false,
            depth_write: false,
            depth_func: ComparisonFunc::Always,
            stencil_enable: false,
            blend_enable: [false; 4],
            color_write_masks: [0xF; 4],
            primitive_restart: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GraphicsPipelineDesc {
    pub vertex_shader: ShaderCode,
    pub pixel_shader: Option<ShaderCode>,
    pub root_signature: RootSignatureHandle,
    pub color_formats: [Option<Format>; 4],
    pub depth_format: Option<Format>,
    pub topology: PrimitiveTopology,
    pub state: GraphicsPipelineState,
    pub label: &'static str,
}

#[derive(Clone, Debug)]
pub struct ComputePipelineDesc {
    pub shader: ShaderCode,
    pub root_signature: RootSignatureHandle,
    pub label: &'static str,
}

/// Pipeline creation may complete asynchronously; a handle is returned
/// immediately and polled at deferred-list replay.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PipelineStatus {
    Pending,
    Ready,
    Failed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DescriptorRangeKind {
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
    Sampler,
}

#[derive(Clone, Debug)]
pub struct DescriptorRange {
    pub kind: DescriptorRangeKind,
    /// `None` makes the range unbounded (bindless heap indexing).
    pub count: Option<u32>,
    pub base_register: u32,
}

#[derive(Clone, Debug)]
pub enum RootParameter {
    Constants { num_dwords: u32 },
    ConstantBuffer,
    DescriptorTable { ranges: Vec<DescriptorRange> },
}

impl RootParameter {
    /// Cost of the parameter in root-signature dwords: tables are 1,
    /// root descriptors 2, constants their own size.
    pub fn dword_cost(&self) -> u32 {
        match self {
            RootParameter::Constants { num_dwords } => *num_dwords,
            RootParameter::ConstantBuffer => 2,
            RootParameter::DescriptorTable { .. } => 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RootSignatureDesc {
    pub parameters: Vec<RootParameter>,
    pub label: &'static str,
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FormatSupport: u32 {
        const SAMPLED = 1 << 0;
        const FILTER_LINEAR = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const BLEND = 1 << 3;
        const DEPTH_STENCIL = 1 << 4;
        const UNORDERED_ACCESS = 1 << 5;
    }
}

/// Host introspection the core queries once at startup.
#[derive(Clone, Debug)]
pub struct Capabilities {
    /// Whether reserved (sparse/tiled) buffers are supported.
    pub tiled_resources: bool,
    /// Sparse allocation granularity in bytes; at least 64 KiB.
    pub sparse_tile_size: u64,
    /// Maximum number of live sampler descriptors.
    pub max_sampler_count: u32,
    /// Whether unbounded descriptor ranges (bindless) are supported.
    pub bindless: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            tiled_resources: true,
            sparse_tile_size: 64 * 1024,
            max_sampler_count: 2048,
            bindless: true,
        }
    }
}
