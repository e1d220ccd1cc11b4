//! Texture cache.
//!
//! Guest textures are tiled, packed and big-endian in guest memory; hosts
//! want linear images in their own formats. Each guest format maps to an
//! unsigned and a signed host format plus the compute kernel that decodes
//! guest blocks into the host block layout. Decoded images are cached by a
//! key derived from the fetch constant and invalidated through shared-memory
//! watches when the guest overwrites the backing pages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;

use xenos_hal::{
    BufferViewKind, BuiltinKernel, ComputePipelineDesc, DescriptorHeapDesc, DescriptorHeapHandle,
    DescriptorHeapKind, DescriptorRange, DescriptorRangeKind, DescriptorTableBase, Device, Format,
    FormatSupport, HostCommand, ImageDesc, ImageDimension, ImageHandle, ImageUsage, ImageViewDesc,
    ImageViewHandle, PipelineHandle, PlacedBufferFootprint, ResourceHandle, ResourceState,
    RootParameter, RootSignatureDesc, RootSignatureHandle, SamplerDesc, ShaderCode, Swizzle,
    TextureCopyLocation, ViewDimension,
};

use crate::command_processor::SubmissionContext;
use crate::guest_memory::PAGE_SIZE_LOG2;
use crate::shared_memory::{SharedMemory, WatchRangeHandle};
use crate::xenos::{
    AnisoFilter, ClampMode, Endian, TextureDimension, TextureFetchConstant, TextureFilter,
    TextureFormat,
};

/// Sampler descriptors kept free as headroom under the host limit.
const SAMPLER_HEAP_HEADROOM: u32 = 16;

/// Guest blocks decoded per thread along X.
const GUEST_X_BLOCKS_PER_THREAD_LOG2: u32 = 2;
/// Thread group dimensions of the load kernels.
const LOAD_GROUP_SIZE_X: u32 = 8;
const LOAD_GROUP_SIZE_Y: u32 = 8;

/// Fully identifies one cached texture.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TextureKey {
    pub base_page: u32,
    pub mip_page: u32,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub depth_or_layers: u32,
    pub pitch: u32,
    pub mip_max_level: u32,
    pub format: TextureFormat,
    pub tiled: bool,
    pub packed_mips: bool,
    pub endianness: Endian,
    /// Distinguishes the separately-signed variant of a texture whose signed
    /// host format cannot share the unsigned image.
    pub signed_separate: bool,
    pub scaled_resolve: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct ViewKey {
    signed: bool,
    swizzle: [Swizzle; 4],
    array: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HostFormat {
    pub load_kernel: Option<BuiltinKernel>,
    pub format: Option<Format>,
    pub block_compressed: bool,
}

impl HostFormat {
    const UNSUPPORTED: HostFormat = HostFormat {
        load_kernel: None,
        format: None,
        block_compressed: false,
    };

    const fn new(load_kernel: BuiltinKernel, format: Format) -> HostFormat {
        HostFormat {
            load_kernel: Some(load_kernel),
            format: Some(format),
            block_compressed: matches!(
                format,
                Format::Bc1RgbaUnorm | Format::Bc2RgbaUnorm | Format::Bc3RgbaUnorm
            ),
        }
    }
}

/// Host mapping of one guest format: unsigned and signed sides, whether they
/// can share one image, and the default component swizzle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HostFormatPair {
    pub unsigned: HostFormat,
    pub signed: HostFormat,
    /// True when the signed side samples correctly from the unsigned image.
    pub signed_compatible: bool,
    pub swizzle: [Swizzle; 4],
}

const RGBA: [Swizzle; 4] = [Swizzle::R, Swizzle::G, Swizzle::B, Swizzle::A];
const RRRR: [Swizzle; 4] = [Swizzle::R, Swizzle::R, Swizzle::R, Swizzle::R];
const RGGG: [Swizzle; 4] = [Swizzle::R, Swizzle::G, Swizzle::G, Swizzle::G];

impl HostFormatPair {
    const UNSUPPORTED: HostFormatPair = HostFormatPair {
        unsigned: HostFormat::UNSUPPORTED,
        signed: HostFormat::UNSUPPORTED,
        signed_compatible: true,
        swizzle: RGBA,
    };
}

/// Byte/block geometry of a guest format.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GuestFormatInfo {
    pub block_width: u32,
    pub block_height: u32,
    pub bytes_per_block: u32,
}

pub fn guest_format_info(format: TextureFormat) -> GuestFormatInfo {
    use TextureFormat as F;
    let (block_width, block_height, bytes_per_block) = match format {
        F::K1Reverse | F::K1 => (8, 1, 1),
        F::K8 | F::K8A | F::K8B | F::K8Interlaced => (1, 1, 1),
        F::K1555 | F::K565 | F::K655 | F::K4444 | F::K88 | F::K16 | F::K16Expand
        | F::K16Float | F::K16Mpeg | F::K16Interlaced | F::K16MpegInterlaced => (1, 1, 2),
        F::KDxt1 | F::KDxt1As16161616 | F::KDxt3a | F::KDxt5a | F::KDxt3aAs1111 | F::KCtx1 => {
            (4, 4, 8)
        }
        F::KDxt23 | F::KDxt45 | F::KDxt23As16161616 | F::KDxt45As16161616 | F::KDxn => (4, 4, 16),
        F::K8888 | F::K8888A | F::K8888As16161616 | F::K2101010 | F::K2101010As16161616
        | F::K101111 | F::K111110 | F::K101111As16161616 | F::K111110As16161616 | F::K248
        | F::K248Float | F::K1616 | F::K1616Edram | F::K1616Expand | F::K1616Float
        | F::K1616Mpeg | F::K1616MpegInterlaced | F::K32 | F::K32Float | F::K32As8
        | F::K32As88 | F::K32As8Interlaced | F::K32As88Interlaced | F::KCrY1CbY0Rep
        | F::KY1CrY0CbRep | F::K8888GammaEdram | F::K2101010FloatEdram => (1, 1, 4),
        F::K16161616 | F::K16161616Edram | F::K16161616Expand | F::K16161616Float | F::K3232
        | F::K3232Float => (1, 1, 8),
        F::K32323232 | F::K32323232Float => (1, 1, 16),
        F::K323232Float => (1, 1, 12),
    };
    GuestFormatInfo {
        block_width,
        block_height,
        bytes_per_block,
    }
}

/// Packed sampler parameters; the LRU key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SamplerParameters(pub u32);

impl SamplerParameters {
    pub fn from_fetch_constant(fetch: &TextureFetchConstant) -> SamplerParameters {
        let mut value = 0u32;
        value |= fetch.clamp_x() as u32;
        value |= (fetch.clamp_y() as u32) << 3;
        value |= (fetch.clamp_z() as u32) << 6;
        value |= (fetch.border_color() as u32) << 9;
        let mag = matches!(fetch.mag_filter(), TextureFilter::Linear) as u32;
        let min = matches!(fetch.min_filter(), TextureFilter::Linear) as u32;
        let mip = matches!(fetch.mip_filter(), TextureFilter::Linear) as u32;
        value |= mag << 11;
        value |= min << 12;
        value |= mip << 13;
        value |= (fetch.aniso_filter() as u32) << 14;
        value |= fetch.mip_min_level() << 17;
        value |= fetch.mip_max_level() << 21;
        SamplerParameters(value)
    }

    fn clamp(bits: u32) -> xenos_hal::AddressMode {
        match ClampMode::from_bits(bits) {
            ClampMode::Repeat => xenos_hal::AddressMode::Repeat,
            ClampMode::MirroredRepeat => xenos_hal::AddressMode::Mirror,
            ClampMode::ClampToEdge | ClampMode::ClampToHalfway => {
                xenos_hal::AddressMode::ClampToEdge
            }
            ClampMode::MirrorClampToEdge | ClampMode::MirrorClampToHalfway => {
                xenos_hal::AddressMode::MirrorClampToEdge
            }
            ClampMode::ClampToBorder => xenos_hal::AddressMode::ClampToBorder,
            ClampMode::MirrorClampToBorder => xenos_hal::AddressMode::MirrorClampToBorder,
        }
    }

    pub fn to_desc(self) -> SamplerDesc {
        let value = self.0;
        let filter = |bit: u32| {
            if value & (1 << bit) != 0 {
                xenos_hal::FilterMode::Linear
            } else {
                xenos_hal::FilterMode::Point
            }
        };
        let aniso = AnisoFilter::from_bits((value >> 14) & 0x7);
        SamplerDesc {
            mag_filter: filter(11),
            min_filter: filter(12),
            mip_filter: filter(13),
            address_u: Self::clamp(value & 0x7),
            address_v: Self::clamp((value >> 3) & 0x7),
            address_w: Self::clamp((value >> 6) & 0x7),
            anisotropy_max: aniso.max_anisotropy(),
            border_color: if (value >> 9) & 0x3 == 1 {
                xenos_hal::BorderColor::OpaqueWhite
            } else {
                xenos_hal::BorderColor::TransparentBlack
            },
            mip_min_level: ((value >> 17) & 0xF) as f32,
            mip_max_level: ((value >> 21) & 0xF) as f32,
        }
    }
}

struct SamplerEntry {
    heap_slot: u32,
    last_use_submission: u64,
}

/// Per-mip guest layout of a texture.
#[derive(Clone, Copy, Debug)]
struct GuestMipLayout {
    offset_bytes: u32,
    pitch_blocks: u32,
    height_blocks: u32,
}

struct Texture {
    key: TextureKey,
    image: ImageHandle,
    host_format: Format,
    load_kernel: Option<BuiltinKernel>,
    views: HashMap<ViewKey, ImageViewHandle>,
    /// Flipped from the shared-memory watch when backing pages change.
    valid: Arc<AtomicBool>,
    watch: Option<WatchRangeHandle>,
    base_size: u32,
    mip_size: u32,
    mip_layouts: Vec<GuestMipLayout>,
    host_memory_bytes: u64,
    last_use_submission: u64,
}

/// Root constants of the texture load and tiling kernels.
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct TextureLoadConstants {
    guest_offset: u32,
    guest_pitch_blocks: u32,
    scratch_offset: u32,
    scratch_pitch_bytes: u32,
    width_blocks: u32,
    height_blocks: u32,
    depth: u32,
    /// Bit 0: tiled; bits 1..2: endian swap.
    flags: u32,
}

impl TextureLoadConstants {
    fn as_dwords(&self) -> Vec<u32> {
        bytemuck::cast_slice(std::slice::from_ref(self)).to_vec()
    }
}

pub struct TextureCache {
    device: Arc<dyn Device>,
    scale: (u32, u32),

    format_table: [HostFormatPair; 64],

    load_root_signature: RootSignatureHandle,
    load_pipelines: HashMap<BuiltinKernel, PipelineHandle>,
    tile_pipelines: HashMap<u32, PipelineHandle>,

    textures: HashMap<TextureKey, Texture>,

    sampler_heap: DescriptorHeapHandle,
    sampler_free_slots: Vec<u32>,
    samplers: LruCache<SamplerParameters, SamplerEntry>,

    null_image_2d_array: ImageHandle,
    null_image_cube: ImageHandle,
    null_image_3d: ImageHandle,
    null_view_2d_array: ImageViewHandle,
    null_view_cube: ImageViewHandle,
    null_view_3d: ImageViewHandle,

    unsupported_logged: [bool; 64],
    host_memory_used: u64,
}

impl TextureCache {
    pub fn new(
        device: Arc<dyn Device>,
        config: &crate::config::GpuConfig,
    ) -> Result<TextureCache, xenos_hal::HalError> {
        let mut format_table = best_host_formats();
        apply_host_fallbacks(&mut format_table, device.as_ref());

        // Constants, then guest source SRV + scratch UAV.
        let load_root_signature = device.create_root_signature(&RootSignatureDesc {
            parameters: vec![
                RootParameter::Constants {
                    num_dwords: (std::mem::size_of::<TextureLoadConstants>() / 4) as u32,
                },
                RootParameter::DescriptorTable {
                    ranges: vec![
                        DescriptorRange {
                            kind: DescriptorRangeKind::ShaderResource,
                            count: Some(1),
                            base_register: 0,
                        },
                        DescriptorRange {
                            kind: DescriptorRangeKind::UnorderedAccess,
                            count: Some(1),
                            base_register: 0,
                        },
                    ],
                },
            ],
            label: "texture load",
        })?;

        let caps = device.capabilities();
        let sampler_heap_capacity = caps.max_sampler_count.saturating_sub(SAMPLER_HEAP_HEADROOM);
        let sampler_heap = device.create_descriptor_heap(&DescriptorHeapDesc {
            kind: DescriptorHeapKind::Sampler,
            capacity: sampler_heap_capacity,
            shader_visible: true,
            label: "texture samplers",
        })?;

        // Placeholders satisfying fetches of invalid constants; sampled as
        // zero. Host images are zero-initialized at creation.
        let null_desc = |dimension: ImageDimension, layers: u32, label: &'static str| ImageDesc {
            dimension,
            width: 4,
            height: 4,
            depth_or_layers: layers,
            mip_levels: 1,
            format: Format::R8G8B8A8Unorm,
            usage: ImageUsage::SAMPLED,
            initial_state: ResourceState::shader_read(),
            label,
        };
        let null_image_2d_array =
            device.create_image(&null_desc(ImageDimension::D2, 1, "null 2d array"))?;
        let null_image_cube = device.create_image(&null_desc(ImageDimension::D2, 6, "null cube"))?;
        let null_image_3d = device.create_image(&null_desc(ImageDimension::D3, 1, "null 3d"))?;
        let null_view = |image, dimension, layer_count| {
            device.create_image_view(&ImageViewDesc {
                image,
                format: Format::R8G8B8A8Unorm,
                dimension,
                base_mip: 0,
                mip_count: 1,
                base_layer: 0,
                layer_count,
                swizzle: Swizzle::IDENTITY,
            })
        };
        let null_view_2d_array = null_view(null_image_2d_array, ViewDimension::D2Array, 1)?;
        let null_view_cube = null_view(null_image_cube, ViewDimension::Cube, 6)?;
        let null_view_3d = null_view(null_image_3d, ViewDimension::D3, 1)?;

        Ok(TextureCache {
            device,
            scale: config.resolution_scale,
            format_table,
            load_root_signature,
            load_pipelines: HashMap::new(),
            tile_pipelines: HashMap::new(),
            textures: HashMap::new(),
            sampler_heap,
            sampler_free_slots: (0..sampler_heap_capacity).rev().collect(),
            samplers: LruCache::unbounded(),
            null_image_2d_array,
            null_image_cube,
            null_image_3d,
            null_view_2d_array,
            null_view_cube,
            null_view_3d,
            unsupported_logged: [false; 64],
            host_memory_used: 0,
        })
    }

    pub fn host_format_pair(&self, format: TextureFormat) -> &HostFormatPair {
        &self.format_table[format as usize]
    }

    pub fn sampler_heap(&self) -> DescriptorHeapHandle {
        self.sampler_heap
    }

    pub fn clear_cache(&mut self, shared_memory: &SharedMemory) {
        for (_, texture) in self.textures.drain() {
            if let Some(watch) = texture.watch {
                shared_memory.unwatch_memory_range(watch);
            }
            self.device.destroy_image(texture.image);
            self.host_memory_used = self
                .host_memory_used
                .saturating_sub(texture.host_memory_bytes);
        }
    }

    /// Host memory charged to cached guest textures.
    pub fn host_memory_used(&self) -> u64 {
        self.host_memory_used
    }

    /// Builds a texture key and the signedness request from a fetch constant.
    pub fn key_from_fetch_constant(
        &self,
        fetch: &TextureFetchConstant,
        is_signed: bool,
    ) -> Option<TextureKey> {
        if !fetch.is_texture() {
            return None;
        }
        let format = fetch.format();
        let pair = self.host_format_pair(format);
        let (width, height, depth) = fetch.size();
        let signed_separate = is_signed && !pair.signed_compatible;
        let side = if signed_separate {
            &pair.signed
        } else {
            &pair.unsigned
        };
        side.format?;
        Some(TextureKey {
            base_page: fetch.base_page(),
            mip_page: fetch.mip_page(),
            dimension: fetch.dimension(),
            width,
            height,
            depth_or_layers: if fetch.dimension() == TextureDimension::Cube {
                6
            } else {
                depth
            },
            pitch: fetch.pitch_texels().max(width),
            mip_max_level: fetch.mip_max_level(),
            format,
            tiled: fetch.tiled(),
            packed_mips: fetch.packed_mips(),
            endianness: fetch.endianness(),
            signed_separate,
            scaled_resolve: self.scale != (1, 1),
        })
    }

    /// Acquires a view for one texture fetch: residency, decode and view
    /// selection. Returns the null view of the right dimension when the
    /// fetch constant is invalid or the format unsupported.
    pub fn request_texture(
        &mut self,
        ctx: &mut SubmissionContext,
        shared_memory: &mut SharedMemory,
        fetch: &TextureFetchConstant,
        is_signed: bool,
    ) -> ImageViewHandle {
        let dimension = fetch.dimension();
        let Some(key) = self.key_from_fetch_constant(fetch, is_signed) else {
            return self.null_view(dimension);
        };
        let format_index = key.format as usize;
        let pair = self.format_table[format_index];
        let side = if key.signed_separate {
            pair.signed
        } else {
            pair.unsigned
        };
        let (Some(host_format), kernel) = (side.format, side.load_kernel) else {
            if !self.unsupported_logged[format_index] {
                self.unsupported_logged[format_index] = true;
                tracing::warn!(format = ?key.format, "unsupported guest texture format");
            }
            return self.null_view(dimension);
        };

        if !self.textures.contains_key(&key) {
            if self
                .create_texture(&key, host_format, kernel, shared_memory)
                .is_none()
            {
                return self.null_view(dimension);
            }
        }

        // Residency covers both the base mip and the mip chain.
        let (base_size, mip_size) = {
            let texture = &self.textures[&key];
            (texture.base_size, texture.mip_size)
        };
        if base_size != 0
            && !shared_memory.request_range(ctx, key.base_page << PAGE_SIZE_LOG2, base_size)
        {
            return self.null_view(dimension);
        }
        if mip_size != 0
            && !shared_memory.request_range(ctx, key.mip_page << PAGE_SIZE_LOG2, mip_size)
        {
            return self.null_view(dimension);
        }

        let needs_load = !self.textures[&key].valid.load(Ordering::Acquire);
        if needs_load && !self.load_texture(ctx, shared_memory, &key) {
            return self.null_view(dimension);
        }

        let swizzle = swizzle_from_fetch(fetch.swizzle(), pair.swizzle);
        let view_key = ViewKey {
            signed: is_signed,
            swizzle,
            array: dimension == TextureDimension::Cube,
        };
        let texture = self.textures.get_mut(&key).unwrap();
        texture.last_use_submission = ctx.current_submission();
        if let Some(view) = texture.views.get(&view_key) {
            return *view;
        }
        let dimension_view = match dimension {
            TextureDimension::D1 | TextureDimension::D2 => ViewDimension::D2Array,
            TextureDimension::D3 => ViewDimension::D3,
            TextureDimension::Cube => ViewDimension::Cube,
        };
        match self.device.create_image_view(&ImageViewDesc {
            image: texture.image,
            format: host_format,
            dimension: dimension_view,
            base_mip: 0,
            mip_count: key.mip_max_level + 1,
            base_layer: 0,
            layer_count: texture.key.depth_or_layers,
            swizzle,
        }) {
            Ok(view) => {
                texture.views.insert(view_key, view);
                view
            }
            Err(_) => self.null_view(dimension),
        }
    }

    fn null_view(&self, dimension: TextureDimension) -> ImageViewHandle {
        match dimension {
            TextureDimension::D3 => self.null_view_3d,
            TextureDimension::Cube => self.null_view_cube,
            _ => self.null_view_2d_array,
        }
    }

    fn create_texture(
        &mut self,
        key: &TextureKey,
        host_format: Format,
        kernel: Option<BuiltinKernel>,
        shared_memory: &SharedMemory,
    ) -> Option<()> {
        let info = guest_format_info(key.format);
        let mip_layouts = guest_mip_layouts(key, info);
        let base_size = guest_base_size(key, info);
        let mip_size = mip_layouts
            .last()
            .map(|layout| {
                layout.offset_bytes
                    + layout.pitch_blocks * layout.height_blocks * info.bytes_per_block
            })
            .unwrap_or(0);

        let (dimension, layers) = match key.dimension {
            TextureDimension::D3 => (ImageDimension::D3, key.depth_or_layers),
            _ => (ImageDimension::D2, key.depth_or_layers.max(1)),
        };
        let (scale_x, scale_y) = if key.scaled_resolve {
            self.scale
        } else {
            (1, 1)
        };
        let desc = ImageDesc {
            dimension,
            width: key.width * scale_x,
            height: key.height * scale_y,
            depth_or_layers: layers,
            mip_levels: key.mip_max_level + 1,
            format: host_format,
            usage: ImageUsage::SAMPLED,
            initial_state: ResourceState::COPY_DEST,
            label: "guest texture",
        };
        let image = self.device.create_image(&desc).ok()?;
        let host_memory_bytes = host_image_size_estimate(&desc);
        self.host_memory_used += host_memory_bytes;

        let valid = Arc::new(AtomicBool::new(false));
        // Arm a watch over the full guest backing so CPU writes invalidate.
        let watch_valid = valid.clone();
        let watch = shared_memory.watch_memory_range(
            key.base_page << PAGE_SIZE_LOG2,
            base_size.max(1),
            Box::new(move |_| {
                watch_valid.store(false, Ordering::Release);
            }),
        );

        self.textures.insert(
            *key,
            Texture {
                key: *key,
                image,
                host_format,
                load_kernel: kernel,
                views: HashMap::new(),
                valid,
                watch,
                base_size,
                mip_size,
                mip_layouts,
                host_memory_bytes,
                last_use_submission: 0,
            },
        );
        Some(())
    }

    /// Decodes every mip of the texture: one dispatch per mip writing the
    /// host block layout into a scratch buffer, then buffer-to-image copies.
    fn load_texture(
        &mut self,
        ctx: &mut SubmissionContext,
        shared_memory: &mut SharedMemory,
        key: &TextureKey,
    ) -> bool {
        let texture = match self.textures.get(key) {
            Some(t) => t,
            None => return false,
        };
        let Some(kernel) = texture.load_kernel else {
            return false;
        };
        let info = guest_format_info(key.format);
        let host_format = texture.host_format;
        let (host_block_w, host_block_h) = host_format.block_dim();
        let bytes_per_host_block = host_format.block_size_bytes();

        // Scratch layout: each mip linearly, 256-byte aligned rows.
        struct MipCopy {
            scratch_offset: u64,
            row_pitch: u32,
            width: u32,
            height: u32,
            depth: u32,
            subresource: u32,
        }
        let mut copies = Vec::new();
        let mut scratch_size = 0u64;
        let mip_count = key.mip_max_level + 1;
        for mip in 0..mip_count {
            let width = (key.width >> mip).max(1);
            let height = (key.height >> mip).max(1);
            let depth = match key.dimension {
                TextureDimension::D3 => (key.depth_or_layers >> mip).max(1),
                _ => key.depth_or_layers.max(1),
            };
            let width_blocks = width.div_ceil(host_block_w);
            let height_blocks = height.div_ceil(host_block_h);
            let row_pitch = (width_blocks * bytes_per_host_block + 255) & !255;
            copies.push(MipCopy {
                scratch_offset: scratch_size,
                row_pitch,
                width,
                height,
                depth,
                subresource: mip,
            });
            scratch_size += (row_pitch * height_blocks * depth) as u64;
        }

        let Some(scratch) =
            ctx.request_scratch_gpu_buffer(scratch_size, ResourceState::UNORDERED_ACCESS)
        else {
            return false;
        };

        shared_memory.use_for_reading(ctx);
        ctx.submit_barriers();

        let Some(pipeline) = self.load_pipeline(kernel) else {
            ctx.release_scratch_gpu_buffer(scratch, ResourceState::UNORDERED_ACCESS);
            return false;
        };
        let Some((heap, base_slot)) = ctx.request_transient_view_descriptors(2) else {
            ctx.release_scratch_gpu_buffer(scratch, ResourceState::UNORDERED_ACCESS);
            return false;
        };
        shared_memory.write_raw_srv(heap, base_slot);
        if self
            .device
            .write_buffer_uav(
                heap,
                base_slot + 1,
                scratch,
                BufferViewKind::Raw {
                    size_bytes: scratch_size,
                },
            )
            .is_err()
        {
            ctx.release_scratch_gpu_buffer(scratch, ResourceState::UNORDERED_ACCESS);
            return false;
        }

        ctx.deferred.push(HostCommand::SetComputeRootSignature {
            signature: self.load_root_signature,
        });
        ctx.deferred.push(HostCommand::SetPipeline { pipeline });
        ctx.deferred.push(HostCommand::SetComputeRootDescriptorTable {
            parameter_index: 1,
            base: DescriptorTableBase {
                heap,
                index: base_slot,
            },
        });

        let texture = &self.textures[key];
        for (mip, copy) in copies.iter().enumerate() {
            // Mip 0 lives at the base address; the chain at the mip address.
            let (guest_page, layout) = if mip == 0 {
                (
                    key.base_page,
                    GuestMipLayout {
                        offset_bytes: 0,
                        pitch_blocks: guest_pitch_blocks(key, info),
                        height_blocks: guest_height_blocks(key, info, 0),
                    },
                )
            } else {
                (key.mip_page, texture.mip_layouts[mip - 1])
            };
            let guest_width_blocks = copy.width.div_ceil(info.block_width);
            let guest_height_blocks = copy.height.div_ceil(info.block_height);
            let constants = TextureLoadConstants {
                guest_offset: (guest_page << PAGE_SIZE_LOG2) + layout.offset_bytes,
                guest_pitch_blocks: layout.pitch_blocks,
                scratch_offset: copy.scratch_offset as u32,
                scratch_pitch_bytes: copy.row_pitch,
                width_blocks: guest_width_blocks,
                height_blocks: guest_height_blocks,
                depth: copy.depth,
                flags: key.tiled as u32 | ((key.endianness as u32) << 1),
            };
            ctx.deferred.push(HostCommand::SetComputeRootConstants {
                parameter_index: 0,
                dest_offset_dwords: 0,
                values: constants.as_dwords(),
            });
            let blocks_per_group_x = LOAD_GROUP_SIZE_X << GUEST_X_BLOCKS_PER_THREAD_LOG2;
            ctx.deferred.push(HostCommand::Dispatch {
                group_count_x: guest_width_blocks.div_ceil(blocks_per_group_x),
                group_count_y: guest_height_blocks.div_ceil(LOAD_GROUP_SIZE_Y),
                group_count_z: copy.depth,
            });
        }

        ctx.push_uav_barrier(ResourceHandle::Buffer(scratch));
        ctx.push_transition_barrier(
            ResourceHandle::Buffer(scratch),
            ResourceState::UNORDERED_ACCESS,
            ResourceState::COPY_SOURCE,
            None,
        );
        ctx.submit_barriers();

        for copy in &copies {
            ctx.deferred.push(HostCommand::CopyTextureRegion {
                dst: TextureCopyLocation::Subresource {
                    image: texture.image,
                    subresource: copy.subresource,
                },
                src: TextureCopyLocation::Placed {
                    buffer: scratch,
                    footprint: PlacedBufferFootprint {
                        offset: copy.scratch_offset,
                        format: host_format,
                        width: copy.width,
                        height: copy.height,
                        depth: copy.depth,
                        row_pitch_bytes: copy.row_pitch,
                    },
                },
            });
        }
        ctx.release_scratch_gpu_buffer(scratch, ResourceState::COPY_SOURCE);

        let texture = self.textures.get_mut(key).unwrap();
        texture.valid.store(true, Ordering::Release);
        // Re-arm the invalidation watch consumed by the last write.
        if let Some(old) = texture.watch.take() {
            shared_memory.unwatch_memory_range(old);
        }
        let watch_valid = texture.valid.clone();
        texture.watch = shared_memory.watch_memory_range(
            key.base_page << PAGE_SIZE_LOG2,
            texture.base_size.max(1),
            Box::new(move |_| {
                watch_valid.store(false, Ordering::Release);
            }),
        );
        true
    }

    fn load_pipeline(&mut self, kernel: BuiltinKernel) -> Option<PipelineHandle> {
        if let Some(pipeline) = self.load_pipelines.get(&kernel) {
            return Some(*pipeline);
        }
        let pipeline = self
            .device
            .create_compute_pipeline(&ComputePipelineDesc {
                shader: ShaderCode::Builtin(kernel),
                root_signature: self.load_root_signature,
                label: "texture load",
            })
            .ok()?;
        self.load_pipelines.insert(kernel, pipeline);
        Some(pipeline)
    }

    /// Host format of a resolve destination, from the unsigned side of the
    /// format table; block-compressed targets cannot be rendered into.
    pub fn resolve_dest_host_format(&self, format: TextureFormat) -> Option<Format> {
        let side = self.format_table[format as usize].unsigned;
        let host = side.format?;
        if side.block_compressed {
            return None;
        }
        Some(host)
    }

    /// Tiles a linear resolve result into guest memory: one compute dispatch
    /// reading the aligned source buffer and writing the tiled layout through
    /// the shared memory UAV.
    #[allow(clippy::too_many_arguments)]
    pub fn tile_resolved_texture(
        &mut self,
        ctx: &mut SubmissionContext,
        shared_memory: &mut SharedMemory,
        source: xenos_hal::BufferHandle,
        source_pitch_bytes: u32,
        dest_base: u32,
        dest_pitch: u32,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> bool {
        let info = guest_format_info(format);
        let dest_length = dest_pitch * info.bytes_per_block * height;
        if !shared_memory.request_range(ctx, dest_base, dest_length) {
            return false;
        }
        shared_memory.use_for_writing(ctx);
        ctx.submit_barriers();

        let Some(pipeline) = self.tile_pipeline(info.bytes_per_block) else {
            return false;
        };
        let Some((heap, base_slot)) = ctx.request_transient_view_descriptors(2) else {
            return false;
        };
        if self
            .device
            .write_buffer_srv(
                heap,
                base_slot,
                source,
                BufferViewKind::Raw {
                    size_bytes: (source_pitch_bytes * height) as u64,
                },
            )
            .is_err()
        {
            return false;
        }
        shared_memory.write_raw_uav(heap, base_slot + 1);

        let constants = TextureLoadConstants {
            guest_offset: dest_base,
            guest_pitch_blocks: dest_pitch,
            scratch_offset: 0,
            scratch_pitch_bytes: source_pitch_bytes,
            width_blocks: width,
            height_blocks: height,
            depth: 1,
            flags: 1,
        };
        ctx.deferred.push(HostCommand::SetComputeRootSignature {
            signature: self.load_root_signature,
        });
        ctx.deferred.push(HostCommand::SetPipeline { pipeline });
        ctx.deferred.push(HostCommand::SetComputeRootConstants {
            parameter_index: 0,
            dest_offset_dwords: 0,
            values: constants.as_dwords(),
        });
        ctx.deferred.push(HostCommand::SetComputeRootDescriptorTable {
            parameter_index: 1,
            base: DescriptorTableBase {
                heap,
                index: base_slot,
            },
        });
        ctx.deferred.push(HostCommand::Dispatch {
            group_count_x: width.div_ceil(32),
            group_count_y: height.div_ceil(32),
            group_count_z: 1,
        });
        shared_memory.mark_uav_writes_commit_needed();
        shared_memory.range_written_by_gpu(dest_base, dest_length);
        true
    }

    fn tile_pipeline(&mut self, bytes_per_block: u32) -> Option<PipelineHandle> {
        if let Some(pipeline) = self.tile_pipelines.get(&bytes_per_block) {
            return Some(*pipeline);
        }
        let kernel = match bytes_per_block {
            1 => BuiltinKernel::TextureTile8bpp,
            2 => BuiltinKernel::TextureTile16bpp,
            4 => BuiltinKernel::TextureTile32bpp,
            8 => BuiltinKernel::TextureTile64bpp,
            _ => return None,
        };
        let pipeline = self
            .device
            .create_compute_pipeline(&ComputePipelineDesc {
                shader: ShaderCode::Builtin(kernel),
                root_signature: self.load_root_signature,
                label: "resolve tile",
            })
            .ok()?;
        self.tile_pipelines.insert(bytes_per_block, pipeline);
        Some(pipeline)
    }

    /// Returns the heap slot of a sampler for `parameters`, creating it if
    /// needed. When the heap is full and nothing evictable (last use newer
    /// than the completed submission), returns the submission to await.
    pub fn use_sampler(
        &mut self,
        current_submission: u64,
        completed_submission: u64,
        parameters: SamplerParameters,
    ) -> Result<u32, u64> {
        if let Some(entry) = self.samplers.get_mut(&parameters) {
            entry.last_use_submission = current_submission;
            return Ok(entry.heap_slot);
        }
        let slot = if let Some(slot) = self.sampler_free_slots.pop() {
            slot
        } else {
            // Evict the least-recently-used sampler no submission still needs.
            let evictable = self
                .samplers
                .iter()
                .rev()
                .find(|(_, entry)| entry.last_use_submission <= completed_submission)
                .map(|(params, _)| *params);
            match evictable {
                Some(params) => {
                    let entry = self.samplers.pop(&params).unwrap();
                    entry.heap_slot
                }
                None => {
                    // The caller should await the oldest sampler's submission
                    // and retry.
                    let oldest = self
                        .samplers
                        .iter()
                        .rev()
                        .next()
                        .map(|(_, entry)| entry.last_use_submission)
                        .unwrap_or(current_submission);
                    return Err(oldest);
                }
            }
        };
        if self
            .device
            .write_sampler(self.sampler_heap, slot, &parameters.to_desc())
            .is_err()
        {
            self.sampler_free_slots.push(slot);
            return Err(current_submission);
        }
        self.samplers.put(
            parameters,
            SamplerEntry {
                heap_slot: slot,
                last_use_submission: current_submission,
            },
        );
        Ok(slot)
    }

    pub fn sampler_count(&self) -> usize {
        self.samplers.len()
    }
}

/// Applies the guest swizzle (3 bits per component: 0-3 select a source
/// component, 4 zero, 5 one) on top of the format's base swizzle.
fn swizzle_from_fetch(fetch_swizzle: u32, base: [Swizzle; 4]) -> [Swizzle; 4] {
    let mut out = [Swizzle::R; 4];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = match (fetch_swizzle >> (i * 3)) & 0x7 {
            0 => base[0],
            1 => base[1],
            2 => base[2],
            3 => base[3],
            4 => Swizzle::Zero,
            _ => Swizzle::One,
        };
    }
    out
}

fn guest_pitch_blocks(key: &TextureKey, info: GuestFormatInfo) -> u32 {
    let pitch_texels = key.pitch.max(key.width);
    let blocks = pitch_texels.div_ceil(info.block_width);
    if key.tiled {
        // Tiled layouts round the pitch to whole 32-block groups.
        (blocks + 31) & !31
    } else {
        blocks
    }
}

fn guest_height_blocks(key: &TextureKey, info: GuestFormatInfo, mip: u32) -> u32 {
    let height = (key.height >> mip).max(1);
    let blocks = height.div_ceil(info.block_height);
    if key.tiled {
        (blocks + 31) & !31
    } else {
        blocks
    }
}

fn guest_base_size(key: &TextureKey, info: GuestFormatInfo) -> u32 {
    let depth = match key.dimension {
        TextureDimension::D3 => key.depth_or_layers,
        _ => key.depth_or_layers.max(1),
    };
    guest_pitch_blocks(key, info) * guest_height_blocks(key, info, 0) * info.bytes_per_block * depth
}

/// Layouts of mips 1.. relative to the mip base address. With packed mips,
/// every level at or below 16x16 shares the packed tail and reuses its
/// offset.
fn guest_mip_layouts(key: &TextureKey, info: GuestFormatInfo) -> Vec<GuestMipLayout> {
    let mut layouts = Vec::new();
    if key.mip_max_level == 0 {
        return layouts;
    }
    let depth = match key.dimension {
        TextureDimension::D3 => key.depth_or_layers,
        _ => key.depth_or_layers.max(1),
    };
    let mut offset = 0u32;
    let mut packed_tail_offset = None;
    for mip in 1..=key.mip_max_level {
        let width = (key.width >> mip).max(1);
        let height = (key.height >> mip).max(1);
        let in_packed_tail = key.packed_mips && width.max(height) <= 16;
        let pitch_blocks = {
            let blocks = width.div_ceil(info.block_width);
            if key.tiled {
                (blocks + 31) & !31
            } else {
                blocks
            }
        };
        let height_blocks = {
            let blocks = height.div_ceil(info.block_height);
            if key.tiled {
                (blocks + 31) & !31
            } else {
                blocks
            }
        };
        if in_packed_tail {
            let tail_offset = *packed_tail_offset.get_or_insert(offset);
            layouts.push(GuestMipLayout {
                offset_bytes: tail_offset,
                pitch_blocks,
                height_blocks,
            });
            if packed_tail_offset == Some(offset) {
                // The whole tail occupies one 32x32-block region.
                offset += 32 * 32 * info.bytes_per_block * depth;
            }
        } else {
            layouts.push(GuestMipLayout {
                offset_bytes: offset,
                pitch_blocks,
                height_blocks,
            });
            offset += pitch_blocks * height_blocks * info.bytes_per_block * depth;
        }
    }
    layouts
}

fn host_image_size_estimate(desc: &ImageDesc) -> u64 {
    let mut total = 0u64;
    let (bw, bh) = desc.format.block_dim();
    for mip in 0..desc.mip_levels {
        let w = (desc.width >> mip).max(1).div_ceil(bw) as u64;
        let h = (desc.height >> mip).max(1).div_ceil(bh) as u64;
        let d = match desc.dimension {
            ImageDimension::D3 => (desc.depth_or_layers >> mip).max(1) as u64,
            ImageDimension::D2 => desc.depth_or_layers as u64,
        };
        total += w * h * d * desc.format.block_size_bytes() as u64;
    }
    total
}

/// The preferred host mapping per guest format, before host-support
/// fallbacks are applied.
fn best_host_formats() -> [HostFormatPair; 64] {
    use BuiltinKernel as K;
    use TextureFormat as F;
    let mut table = [HostFormatPair::UNSUPPORTED; 64];
    let mut set = |format: F, pair: HostFormatPair| {
        table[format as usize] = pair;
    };
    let simple = |kernel: BuiltinKernel,
                  unsigned: Format,
                  signed: Option<(BuiltinKernel, Format)>,
                  compatible: bool,
                  swizzle: [Swizzle; 4]| HostFormatPair {
        unsigned: HostFormat::new(kernel, unsigned),
        signed: match signed {
            Some((kernel, format)) => HostFormat::new(kernel, format),
            None => HostFormat::UNSUPPORTED,
        },
        signed_compatible: compatible,
        swizzle,
    };

    set(
        F::K8,
        simple(
            K::TextureLoad8bpb,
            Format::R8Unorm,
            Some((K::TextureLoad8bpb, Format::R8Snorm)),
            false,
            RRRR,
        ),
    );
    set(
        F::K8A,
        simple(
            K::TextureLoad8bpb,
            Format::R8Unorm,
            Some((K::TextureLoad8bpb, Format::R8Snorm)),
            false,
            RRRR,
        ),
    );
    set(
        F::K8B,
        simple(
            K::TextureLoad8bpb,
            Format::R8Unorm,
            Some((K::TextureLoad8bpb, Format::R8Snorm)),
            false,
            RRRR,
        ),
    );
    set(
        F::K88,
        simple(
            K::TextureLoad16bpb,
            Format::R8G8Unorm,
            Some((K::TextureLoad16bpb, Format::R8G8Snorm)),
            false,
            RGGG,
        ),
    );
    set(
        F::K1555,
        simple(
            K::TextureLoadR5G5B5A1ToB5G5R5A1,
            Format::B5G5R5A1Unorm,
            None,
            true,
            RGBA,
        ),
    );
    set(
        F::K565,
        simple(
            K::TextureLoadR5G6B5ToB5G6R5,
            Format::B5G6R5Unorm,
            None,
            true,
            RGBA,
        ),
    );
    set(
        F::K655,
        simple(
            K::TextureLoadR5G5B6ToB5G6R5WithRbga,
            Format::B5G6R5Unorm,
            None,
            true,
            RGBA,
        ),
    );
    set(
        F::K4444,
        simple(
            K::TextureLoadR4G4B4A4ToA4R4G4B4,
            Format::B4G4R4A4Unorm,
            None,
            true,
            RGBA,
        ),
    );
    let k8888 = simple(
        K::TextureLoad32bpb,
        Format::R8G8B8A8Unorm,
        Some((K::TextureLoad32bpb, Format::R8G8B8A8Snorm)),
        false,
        RGBA,
    );
    set(F::K8888, k8888);
    set(F::K8888A, k8888);
    set(F::K8888As16161616, k8888);
    set(F::K8888GammaEdram, k8888);
    let k2101010 = simple(
        K::TextureLoad32bpb,
        Format::R10G10B10A2Unorm,
        Some((K::TextureLoad32bpb, Format::R10G10B10A2Snorm)),
        false,
        RGBA,
    );
    set(F::K2101010, k2101010);
    set(F::K2101010As16161616, k2101010);
    let k101111 = simple(
        K::TextureLoadR10G11B11ToRgba16,
        Format::R16G16B16A16Unorm,
        Some((K::TextureLoadR10G11B11ToRgba16Snorm, Format::R16G16B16A16Snorm)),
        false,
        RGBA,
    );
    set(F::K101111, k101111);
    set(F::K101111As16161616, k101111);
    let k111110 = simple(
        K::TextureLoadR11G11B10ToRgba16,
        Format::R16G16B16A16Unorm,
        Some((K::TextureLoadR11G11B10ToRgba16Snorm, Format::R16G16B16A16Snorm)),
        false,
        RGBA,
    );
    set(F::K111110, k111110);
    set(F::K111110As16161616, k111110);
    set(
        F::KCrY1CbY0Rep,
        simple(
            K::TextureLoad32bpb,
            Format::R8G8B8A8Unorm,
            Some((K::TextureLoadGbgr8ToRgb8, Format::R8G8B8A8Snorm)),
            false,
            RGBA,
        ),
    );
    set(
        F::KY1CrY0CbRep,
        simple(
            K::TextureLoad32bpb,
            Format::R8G8B8A8Unorm,
            Some((K::TextureLoadBgrg8ToRgb8, Format::R8G8B8A8Snorm)),
            false,
            RGBA,
        ),
    );
    let dxt1 = simple(K::TextureLoad64bpb, Format::Bc1RgbaUnorm, None, true, RGBA);
    set(F::KDxt1, dxt1);
    set(F::KDxt1As16161616, dxt1);
    let dxt23 = simple(K::TextureLoad128bpb, Format::Bc2RgbaUnorm, None, true, RGBA);
    set(F::KDxt23, dxt23);
    set(F::KDxt23As16161616, dxt23);
    let dxt45 = simple(K::TextureLoad128bpb, Format::Bc3RgbaUnorm, None, true, RGBA);
    set(F::KDxt45, dxt45);
    set(F::KDxt45As16161616, dxt45);
    set(
        F::KDxn,
        simple(K::TextureLoadDxnToRg8, Format::R8G8Unorm, None, true, RGGG),
    );
    set(
        F::KDxt3a,
        simple(K::TextureLoadDxt3a, Format::R8Unorm, None, true, RRRR),
    );
    set(
        F::KDxt3aAs1111,
        simple(
            K::TextureLoadDxt3aAs1111ToArgb4,
            Format::B4G4R4A4Unorm,
            None,
            true,
            RGBA,
        ),
    );
    set(
        F::KDxt5a,
        simple(K::TextureLoadDxt5aToR8, Format::R8Unorm, None, true, RRRR),
    );
    set(
        F::KCtx1,
        simple(K::TextureLoadCtx1, Format::R8G8Unorm, None, true, RGGG),
    );
    set(
        F::K16,
        simple(
            K::TextureLoad16bpb,
            Format::R16Unorm,
            Some((K::TextureLoad16bpb, Format::R16Snorm)),
            false,
            RRRR,
        ),
    );
    set(
        F::K1616,
        simple(
            K::TextureLoad32bpb,
            Format::R16G16Unorm,
            Some((K::TextureLoad32bpb, Format::R16G16Snorm)),
            false,
            RGGG,
        ),
    );
    set(
        F::K16161616,
        simple(
            K::TextureLoad64bpb,
            Format::R16G16B16A16Unorm,
            Some((K::TextureLoad64bpb, Format::R16G16B16A16Snorm)),
            false,
            RGBA,
        ),
    );
    set(
        F::K16Expand,
        simple(
            K::TextureLoadR16UnormToFloat,
            Format::R16Float,
            Some((K::TextureLoadR16SnormToFloat, Format::R16Float)),
            false,
            RRRR,
        ),
    );
    set(
        F::K1616Expand,
        simple(
            K::TextureLoadRg16UnormToFloat,
            Format::R16G16Float,
            Some((K::TextureLoadRg16SnormToFloat, Format::R16G16Float)),
            false,
            RGGG,
        ),
    );
    set(
        F::K16161616Expand,
        simple(
            K::TextureLoadRgba16UnormToFloat,
            Format::R16G16B16A16Float,
            Some((K::TextureLoadRgba16SnormToFloat, Format::R16G16B16A16Float)),
            false,
            RGBA,
        ),
    );
    set(
        F::K16Float,
        simple(
            K::TextureLoad16bpb,
            Format::R16Float,
            Some((K::TextureLoad16bpb, Format::R16Float)),
            true,
            RRRR,
        ),
    );
    set(
        F::K1616Float,
        simple(
            K::TextureLoad32bpb,
            Format::R16G16Float,
            Some((K::TextureLoad32bpb, Format::R16G16Float)),
            true,
            RGGG,
        ),
    );
    set(
        F::K16161616Float,
        simple(
            K::TextureLoad64bpb,
            Format::R16G16B16A16Float,
            Some((K::TextureLoad64bpb, Format::R16G16B16A16Float)),
            true,
            RGBA,
        ),
    );
    set(
        F::K32,
        simple(K::TextureLoad32bpb, Format::R32Uint, None, true, RRRR),
    );
    set(
        F::K3232,
        simple(K::TextureLoad64bpb, Format::R32G32Uint, None, true, RGGG),
    );
    set(
        F::K32323232,
        simple(K::TextureLoad128bpb, Format::R32G32B32A32Uint, None, true, RGBA),
    );
    set(
        F::K32Float,
        simple(
            K::TextureLoad32bpb,
            Format::R32Float,
            Some((K::TextureLoad32bpb, Format::R32Float)),
            true,
            RRRR,
        ),
    );
    set(
        F::K3232Float,
        simple(
            K::TextureLoad64bpb,
            Format::R32G32Float,
            Some((K::TextureLoad64bpb, Format::R32G32Float)),
            true,
            RGGG,
        ),
    );
    set(
        F::K32323232Float,
        simple(
            K::TextureLoad128bpb,
            Format::R32G32B32A32Float,
            Some((K::TextureLoad128bpb, Format::R32G32B32A32Float)),
            true,
            RGBA,
        ),
    );
    set(
        F::K248,
        simple(K::TextureLoadDepthUnorm, Format::R32Float, None, true, RRRR),
    );
    set(
        F::K248Float,
        simple(K::TextureLoadDepthFloat, Format::R32Float, None, true, RRRR),
    );
    table
}

/// Downgrades table entries the host cannot filter: BC formats decompress to
/// RGBA8, 16-bit norm formats expand to float.
fn apply_host_fallbacks(table: &mut [HostFormatPair; 64], device: &dyn Device) {
    use BuiltinKernel as K;
    use TextureFormat as F;
    let filterable = |format: Format| {
        device
            .format_support(format)
            .contains(FormatSupport::SAMPLED | FormatSupport::FILTER_LINEAR)
    };

    if !filterable(Format::Bc1RgbaUnorm) {
        let fallback = HostFormat::new(K::TextureLoadDxt1ToRgba8, Format::R8G8B8A8Unorm);
        table[F::KDxt1 as usize].unsigned = fallback;
        table[F::KDxt1As16161616 as usize].unsigned = fallback;
    }
    if !filterable(Format::Bc2RgbaUnorm) {
        let fallback = HostFormat::new(K::TextureLoadDxt3ToRgba8, Format::R8G8B8A8Unorm);
        table[F::KDxt23 as usize].unsigned = fallback;
        table[F::KDxt23As16161616 as usize].unsigned = fallback;
    }
    if !filterable(Format::Bc3RgbaUnorm) {
        let fallback = HostFormat::new(K::TextureLoadDxt5ToRgba8, Format::R8G8B8A8Unorm);
        table[F::KDxt45 as usize].unsigned = fallback;
        table[F::KDxt45As16161616 as usize].unsigned = fallback;
    }
    if !filterable(Format::R16Unorm) {
        table[F::K16 as usize].unsigned =
            HostFormat::new(K::TextureLoadR16UnormToFloat, Format::R16Float);
    }
    if !filterable(Format::R16Snorm) {
        table[F::K16 as usize].signed =
            HostFormat::new(K::TextureLoadR16SnormToFloat, Format::R16Float);
    }
    if !filterable(Format::R16G16Unorm) {
        table[F::K1616 as usize].unsigned =
            HostFormat::new(K::TextureLoadRg16UnormToFloat, Format::R16G16Float);
    }
    if !filterable(Format::R16G16Snorm) {
        table[F::K1616 as usize].signed =
            HostFormat::new(K::TextureLoadRg16SnormToFloat, Format::R16G16Float);
    }
    if !filterable(Format::R16G16B16A16Unorm) {
        table[F::K16161616 as usize].unsigned =
            HostFormat::new(K::TextureLoadRgba16UnormToFloat, Format::R16G16B16A16Float);
    }
    if !filterable(Format::R16G16B16A16Snorm) {
        table[F::K16161616 as usize].signed =
            HostFormat::new(K::TextureLoadRgba16SnormToFloat, Format::R16G16B16A16Float);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_format_geometry() {
        let dxt1 = guest_format_info(TextureFormat::KDxt1);
        assert_eq!((dxt1.block_width, dxt1.block_height), (4, 4));
        assert_eq!(dxt1.bytes_per_block, 8);
        let rgba = guest_format_info(TextureFormat::K8888);
        assert_eq!((rgba.block_width, rgba.block_height), (1, 1));
        assert_eq!(rgba.bytes_per_block, 4);
    }

    #[test]
    fn format_table_covers_dxt_and_depth() {
        let table = best_host_formats();
        assert_eq!(
            table[TextureFormat::KDxt1 as usize].unsigned.format,
            Some(Format::Bc1RgbaUnorm)
        );
        assert!(table[TextureFormat::KDxt1 as usize].unsigned.block_compressed);
        assert_eq!(
            table[TextureFormat::K248Float as usize]
                .unsigned
                .load_kernel,
            Some(BuiltinKernel::TextureLoadDepthFloat)
        );
        // Unmapped formats stay unsupported rather than defaulting.
        assert_eq!(
            table[TextureFormat::K1Reverse as usize].unsigned.format,
            None
        );
    }

    #[test]
    fn signed_separate_formats_are_flagged() {
        let table = best_host_formats();
        assert!(!table[TextureFormat::K8888 as usize].signed_compatible);
        assert!(table[TextureFormat::K16Float as usize].signed_compatible);
    }

    #[test]
    fn sampler_parameters_round_trip_filters() {
        let mut fetch = TextureFetchConstant::default();
        // mag linear (bit 19), min point, mip linear (bit 23).
        fetch.0[3] = (1 << 19) | (1 << 23);
        let params = SamplerParameters::from_fetch_constant(&fetch);
        let desc = params.to_desc();
        assert_eq!(desc.mag_filter, xenos_hal::FilterMode::Linear);
        assert_eq!(desc.min_filter, xenos_hal::FilterMode::Point);
        assert_eq!(desc.mip_filter, xenos_hal::FilterMode::Linear);
    }

    #[test]
    fn fetch_swizzle_applies_over_base() {
        // Identity guest swizzle (0,1,2,3) keeps the base pattern.
        let base = RGGG;
        let identity = (1 << 3) | (2 << 6) | (3 << 9);
        assert_eq!(swizzle_from_fetch(identity, base), RGGG);
        // Constant-one alpha.
        let one_alpha = (1 << 3) | (2 << 6) | (5 << 9);
        assert_eq!(
            swizzle_from_fetch(one_alpha, RGBA),
            [Swizzle::R, Swizzle::G, Swizzle::B, Swizzle::One]
        );
    }

    #[test]
    fn packed_mip_tail_shares_one_offset() {
        let key = TextureKey {
            base_page: 0x100,
            mip_page: 0x200,
            dimension: TextureDimension::D2,
            width: 64,
            height: 64,
            depth_or_layers: 1,
            pitch: 64,
            mip_max_level: 5,
            format: TextureFormat::K8888,
            tiled: true,
            packed_mips: true,
            endianness: Endian::None,
            signed_separate: false,
            scaled_resolve: false,
        };
        let layouts = guest_mip_layouts(&key, guest_format_info(TextureFormat::K8888));
        assert_eq!(layouts.len(), 5);
        // Mips 32x32 and 16x16... : 16x16 and below share the tail offset.
        let tail_offset = layouts[2].offset_bytes;
        assert_eq!(layouts[3].offset_bytes, tail_offset);
        assert_eq!(layouts[4].offset_bytes, tail_offset);
        assert!(layouts[1].offset_bytes > layouts[0].offset_bytes);
    }
}
