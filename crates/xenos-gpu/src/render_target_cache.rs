//! Render-target cache and EDRAM manager.
//!
//! Guest render targets live in 10 MiB of tile-addressed EDRAM. Host APIs
//! have no equivalent, so EDRAM contents are mirrored in a byte buffer and
//! host render-target images are allocated per (size, format) key. When the
//! guest rebinds targets in a way that would lose data, the currently bound
//! images are stored back into the EDRAM buffer and the new ones loaded from
//! it. Resolves copy (and optionally convert and clear) EDRAM regions into
//! tiled guest memory through the shared memory mirror.

use std::collections::HashMap;
use std::sync::Arc;

use xenos_hal::{
    BufferDesc, BufferHandle, BufferUsage, BufferViewKind, BuiltinKernel, ComputePipelineDesc,
    DescriptorHeapDesc, DescriptorHeapHandle, DescriptorHeapKind, DescriptorRange,
    DescriptorRangeKind, DescriptorTableBase, Device, Format, GraphicsPipelineDesc,
    GraphicsPipelineState, HostCommand, ImageDesc, ImageDimension, ImageHandle, ImageUsage,
    ImageViewDesc, ImageViewHandle, MemoryClass, PipelineHandle, PlacedBufferFootprint,
    PrimitiveTopology, Rect, ResourceHandle, ResourceState, RootParameter, RootSignatureDesc,
    RootSignatureHandle, ShaderCode, Swizzle, TextureCopyLocation, ViewDimension, Viewport,
};

use crate::command_processor::SubmissionContext;
use crate::config::GpuConfig;
use crate::regs;
use crate::shared_memory::SharedMemory;
use crate::texture_cache::TextureCache;
use crate::xenos::{
    ColorRenderTargetFormat, DepthRenderTargetFormat, MsaaSamples, EDRAM_SIZE_BYTES,
    EDRAM_TILE_COUNT, EDRAM_TILE_HEIGHT_SAMPLES, EDRAM_TILE_WIDTH_SAMPLES, MAX_SURFACE_PITCH,
};

/// Maximum render-target height in pixels.
const MAX_RT_HEIGHT: u32 = 2560;

/// EDRAM load/store kernel selection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum LoadStoreMode {
    Color32bpp,
    Color64bpp,
    Color7e3,
    DepthUnorm,
    DepthFloat,
}

impl LoadStoreMode {
    fn for_binding(is_depth: bool, format: u32) -> LoadStoreMode {
        if is_depth {
            match DepthRenderTargetFormat::from_bits(format) {
                DepthRenderTargetFormat::D24S8 => LoadStoreMode::DepthUnorm,
                DepthRenderTargetFormat::D24FS8 => LoadStoreMode::DepthFloat,
            }
        } else {
            match ColorRenderTargetFormat::from_bits(format).map(|f| f.base()) {
                Some(ColorRenderTargetFormat::K2101010Float) => LoadStoreMode::Color7e3,
                Some(f) if f.is_64bpp() => LoadStoreMode::Color64bpp,
                _ => LoadStoreMode::Color32bpp,
            }
        }
    }

    fn load_kernel(self) -> BuiltinKernel {
        match self {
            LoadStoreMode::Color32bpp => BuiltinKernel::EdramLoadColor32bpp,
            LoadStoreMode::Color64bpp => BuiltinKernel::EdramLoadColor64bpp,
            LoadStoreMode::Color7e3 => BuiltinKernel::EdramLoadColor7e3,
            LoadStoreMode::DepthUnorm => BuiltinKernel::EdramLoadDepthUnorm,
            LoadStoreMode::DepthFloat => BuiltinKernel::EdramLoadDepthFloat,
        }
    }

    fn store_kernel(self) -> BuiltinKernel {
        match self {
            LoadStoreMode::Color32bpp => BuiltinKernel::EdramStoreColor32bpp,
            LoadStoreMode::Color64bpp => BuiltinKernel::EdramStoreColor64bpp,
            LoadStoreMode::Color7e3 => BuiltinKernel::EdramStoreColor7e3,
            LoadStoreMode::DepthUnorm => BuiltinKernel::EdramStoreDepthUnorm,
            LoadStoreMode::DepthFloat => BuiltinKernel::EdramStoreDepthFloat,
        }
    }
}

const LOAD_STORE_MODES: [LoadStoreMode; 5] = [
    LoadStoreMode::Color32bpp,
    LoadStoreMode::Color64bpp,
    LoadStoreMode::Color7e3,
    LoadStoreMode::DepthUnorm,
    LoadStoreMode::DepthFloat,
];

/// Root constants of the EDRAM load/store/clear/tile-sample kernels.
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct EdramLoadStoreConstants {
    /// Byte offset of the linear copy within the scratch buffer (or of the
    /// destination in shared memory for tile-sample).
    linear_offset: u32,
    /// Row pitch of the linear copy in bytes.
    linear_pitch: u32,
    /// First EDRAM tile of the region.
    base_tiles: u32,
    /// Region pitch in tiles, and rows in the upper half.
    pitch_and_rows: u32,
    /// Clear values (low/high dwords for 64bpp clears).
    clear_value: [u32; 2],
    /// Byte offset of the 32-bit float depth shadow region, for the float
    /// depth kernels.
    float_depth_base: u32,
    reserved: u32,
}

impl EdramLoadStoreConstants {
    fn as_dwords(&self) -> Vec<u32> {
        bytemuck::cast_slice(std::slice::from_ref(self)).to_vec()
    }
}

/// Identity of one host render-target resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RenderTargetKey {
    /// Width in 80-sample units at single scale.
    pub width_ss_div_80: u32,
    /// Height in 16-row units.
    pub height_ss_div_16: u32,
    pub is_depth: bool,
    /// Guest format bits (color or depth).
    pub format: u32,
}

struct RenderTarget {
    image: ImageHandle,
    /// RTV or DSV view over the whole image.
    target_view: ImageViewHandle,
    host_format: Format,
    state: ResourceState,
}

#[derive(Clone, Copy, Default)]
struct RenderTargetBinding {
    is_bound: bool,
    edram_base: u32,
    edram_dirty_rows: u32,
    format: u32,
    is_64bpp: bool,
    render_target: Option<(RenderTargetKey, u32)>,
}

/// Key of a transient image used as the output of converting resolves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct ResolveTargetKey {
    width: u32,
    height: u32,
    format: Format,
}

struct ResolveTarget {
    image: ImageHandle,
    view: ImageViewHandle,
    state: ResourceState,
}

/// Byte range of guest memory written by a resolve.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ResolveWrite {
    pub guest_base: u32,
    pub length: u32,
}

pub struct RenderTargetCache {
    device: Arc<dyn Device>,
    scale: (u32, u32),

    edram_buffer: BufferHandle,
    edram_buffer_state: ResourceState,
    /// Byte offset of the 32-bit float depth shadow region.
    edram_float_depth_offset: u64,

    load_store_root_signature: RootSignatureHandle,
    load_pipelines: HashMap<LoadStoreMode, PipelineHandle>,
    store_pipelines: HashMap<LoadStoreMode, PipelineHandle>,
    tile_sample_32bpp_pipeline: PipelineHandle,
    tile_sample_64bpp_pipeline: PipelineHandle,
    clear_32bpp_pipeline: PipelineHandle,
    clear_64bpp_pipeline: PipelineHandle,
    clear_depth_float_pipeline: PipelineHandle,

    resolve_root_signature: RootSignatureHandle,
    resolve_pipelines: HashMap<Format, PipelineHandle>,

    /// Staged raw views of the EDRAM buffer, copied into transient heaps.
    staging_heap: DescriptorHeapHandle,

    render_targets: HashMap<(RenderTargetKey, u32), RenderTarget>,
    resolve_targets: HashMap<ResolveTargetKey, ResolveTarget>,

    bindings: [RenderTargetBinding; 5],
    current_surface_pitch: u32,
    current_msaa_samples: MsaaSamples,
    current_edram_max_rows: u32,
    sample_positions_set: Option<MsaaSamples>,

    unsupported_format_logged: bool,
}

const STAGED_EDRAM_SRV: u32 = 0;
const STAGED_EDRAM_UAV: u32 = 1;

impl RenderTargetCache {
    pub fn new(
        device: Arc<dyn Device>,
        config: &GpuConfig,
    ) -> Result<RenderTargetCache, xenos_hal::HalError> {
        let scale = config.resolution_scale;
        // Native region, then a same-sized 32-bit float shadow for D24FS8 so
        // store/load round trips keep the full 20e4 precision.
        let region = (EDRAM_SIZE_BYTES as u64) * (scale.0 * scale.1) as u64;
        let edram_buffer = device.create_buffer(&BufferDesc {
            size: region * 2,
            usage: BufferUsage::UNORDERED_ACCESS,
            memory: MemoryClass::DeviceLocal,
            initial_state: ResourceState::UNORDERED_ACCESS,
            label: "edram",
        })?;

        // Constants, then an SRV + UAV descriptor table.
        let load_store_root_signature = device.create_root_signature(&RootSignatureDesc {
            parameters: vec![
                RootParameter::Constants {
                    num_dwords: (std::mem::size_of::<EdramLoadStoreConstants>() / 4) as u32,
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
            label: "edram load/store",
        })?;

        let compute = |kernel: BuiltinKernel, label: &'static str| {
            device.create_compute_pipeline(&ComputePipelineDesc {
                shader: ShaderCode::Builtin(kernel),
                root_signature: load_store_root_signature,
                label,
            })
        };
        let mut load_pipelines = HashMap::new();
        let mut store_pipelines = HashMap::new();
        for mode in LOAD_STORE_MODES {
            load_pipelines.insert(mode, compute(mode.load_kernel(), "edram load")?);
            store_pipelines.insert(mode, compute(mode.store_kernel(), "edram store")?);
        }
        let tile_sample_32bpp_pipeline =
            compute(BuiltinKernel::EdramTileSample32bpp, "edram raw resolve 32bpp")?;
        let tile_sample_64bpp_pipeline =
            compute(BuiltinKernel::EdramTileSample64bpp, "edram raw resolve 64bpp")?;
        let clear_32bpp_pipeline = compute(BuiltinKernel::EdramClear32bpp, "edram clear 32bpp")?;
        let clear_64bpp_pipeline = compute(BuiltinKernel::EdramClear64bpp, "edram clear 64bpp")?;
        let clear_depth_float_pipeline =
            compute(BuiltinKernel::EdramClearDepthFloat, "edram clear float depth")?;

        // Converting resolve: constants + source SRV, static bilinear sampler
        // assumed by the backend.
        let resolve_root_signature = device.create_root_signature(&RootSignatureDesc {
            parameters: vec![
                RootParameter::Constants { num_dwords: 8 },
                RootParameter::DescriptorTable {
                    ranges: vec![DescriptorRange {
                        kind: DescriptorRangeKind::ShaderResource,
                        count: Some(1),
                        base_register: 0,
                    }],
                },
            ],
            label: "resolve",
        })?;

        let staging_heap = device.create_descriptor_heap(&DescriptorHeapDesc {
            kind: DescriptorHeapKind::View,
            capacity: 2,
            shader_visible: false,
            label: "edram views",
        })?;
        let raw = BufferViewKind::Raw {
            size_bytes: region * 2,
        };
        device.write_buffer_srv(staging_heap, STAGED_EDRAM_SRV, edram_buffer, raw)?;
        device.write_buffer_uav(staging_heap, STAGED_EDRAM_UAV, edram_buffer, raw)?;

        Ok(RenderTargetCache {
            device,
            scale,
            edram_buffer,
            edram_buffer_state: ResourceState::UNORDERED_ACCESS,
            edram_float_depth_offset: region,
            load_store_root_signature,
            load_pipelines,
            store_pipelines,
            tile_sample_32bpp_pipeline,
            tile_sample_64bpp_pipeline,
            clear_32bpp_pipeline,
            clear_64bpp_pipeline,
            clear_depth_float_pipeline,
            resolve_root_signature,
            resolve_pipelines: HashMap::new(),
            staging_heap,
            render_targets: HashMap::new(),
            resolve_targets: HashMap::new(),
            bindings: Default::default(),
            current_surface_pitch: 0,
            current_msaa_samples: MsaaSamples::X1,
            current_edram_max_rows: 0,
            sample_positions_set: None,
            unsupported_format_logged: false,
        })
    }

    pub fn edram_buffer(&self) -> BufferHandle {
        self.edram_buffer
    }

    pub fn begin_frame(&mut self) {
        self.clear_bindings();
    }

    pub fn clear_cache(&mut self) {
        for (_, rt) in self.render_targets.drain() {
            self.device.destroy_image(rt.image);
        }
        for (_, target) in self.resolve_targets.drain() {
            self.device.destroy_image(target.image);
        }
        self.clear_bindings();
    }

    fn clear_bindings(&mut self) {
        self.bindings = Default::default();
        // Forces a full update on the next draw.
        self.current_surface_pitch = 0;
        self.current_edram_max_rows = 0;
    }

    /// Host formats of the currently bound targets, for pipeline keys:
    /// 4 colors then depth.
    pub fn bound_host_formats(&self) -> ([Option<Format>; 4], Option<Format>) {
        let mut colors = [None; 4];
        for (i, slot) in colors.iter_mut().enumerate() {
            if let Some(key) = self.bindings[i].render_target {
                *slot = self.render_targets.get(&key).map(|rt| rt.host_format);
            }
        }
        let depth = self.bindings[4]
            .render_target
            .and_then(|key| self.render_targets.get(&key).map(|rt| rt.host_format));
        (colors, depth)
    }

    /// Count of EDRAM rows the current viewport and scissor can touch.
    fn current_dirty_rows(ctx: &SubmissionContext, edram_max_rows: u32) -> u32 {
        let regs = &ctx.regs;
        let samples_y =
            MsaaSamples::from_bits(regs.get(regs::RB_SURFACE_INFO) >> 16).samples_y();
        let mut window_offset_y = ((regs.get(regs::PA_SC_WINDOW_OFFSET) >> 16) & 0x7FFF) as i32;
        if window_offset_y & 0x4000 != 0 {
            window_offset_y -= 0x8000;
        }
        let vte = regs.get(regs::PA_CL_VTE_CNTL);
        let scale_y = if vte & (1 << 2) != 0 {
            regs.get_f32(regs::PA_CL_VPORT_YSCALE)
        } else {
            1280.0
        };
        let mut offset_y = if vte & (1 << 3) != 0 {
            regs.get_f32(regs::PA_CL_VPORT_YOFFSET)
        } else {
            scale_y.abs()
        };
        if regs.get(regs::PA_SU_SC_MODE_CNTL) & (1 << 16) != 0 {
            offset_y += window_offset_y as f32;
        }
        let viewport_bottom = (offset_y + scale_y.abs()).ceil().max(0.0) as u32;
        let mut scissor_bottom = (regs.get(regs::PA_SC_WINDOW_SCISSOR_BR) >> 16) & 0x7FFF;
        if regs.get(regs::PA_SC_WINDOW_SCISSOR_TL) & (1 << 31) == 0 {
            scissor_bottom = (scissor_bottom as i32 + window_offset_y).max(0) as u32;
        }
        let dirty_bottom = viewport_bottom.min(scissor_bottom).min(MAX_RT_HEIGHT);
        ((dirty_bottom * samples_y).div_ceil(EDRAM_TILE_HEIGHT_SAMPLES)).min(edram_max_rows)
    }

    /// Applies the guest render-target state before a draw. Returns false if
    /// nothing can be drawn (zero pitch, EDRAM exhausted, creation failure).
    pub fn update_render_targets(&mut self, ctx: &mut SubmissionContext, color_mask: u32) -> bool {
        let rb_surface_info = ctx.regs.get(regs::RB_SURFACE_INFO);
        let surface_pitch = (rb_surface_info & 0x3FFF).min(MAX_SURFACE_PITCH);
        if surface_pitch == 0 {
            return false;
        }
        let msaa_samples = MsaaSamples::from_bits(rb_surface_info >> 16);
        let samples_x = msaa_samples.samples_x();

        // Gather color and depth bindings uniformly; index 4 is depth.
        let mut enabled = [false; 5];
        let mut edram_bases = [0u32; 5];
        let mut formats = [0u32; 5];
        let mut formats_are_64bpp = [false; 5];
        let rb_color_info = [
            ctx.regs.get(regs::RB_COLOR_INFO),
            ctx.regs.get(regs::RB_COLOR1_INFO),
            ctx.regs.get(regs::RB_COLOR2_INFO),
            ctx.regs.get(regs::RB_COLOR3_INFO),
        ];
        for i in 0..4 {
            enabled[i] = color_mask & (0xF << (i * 4)) != 0;
            edram_bases[i] = (rb_color_info[i] & 0xFFF).min(EDRAM_TILE_COUNT);
            let format = ColorRenderTargetFormat::from_bits(rb_color_info[i] >> 16);
            let Some(format) = format else {
                if !self.unsupported_format_logged {
                    self.unsupported_format_logged = true;
                    tracing::warn!(
                        "unsupported color render target format {:#x}",
                        (rb_color_info[i] >> 16) & 0xF
                    );
                }
                enabled[i] = false;
                continue;
            };
            formats[i] = format.base() as u32;
            formats_are_64bpp[i] = format.is_64bpp();
        }
        let rb_depthcontrol =
            regs::DepthControl::from_bits_truncate(ctx.regs.get(regs::RB_DEPTHCONTROL));
        let rb_depth_info = ctx.regs.get(regs::RB_DEPTH_INFO);
        enabled[4] = !rb_depthcontrol.is_empty();
        edram_bases[4] = (rb_depth_info & 0xFFF).min(EDRAM_TILE_COUNT);
        formats[4] = (rb_depth_info >> 16) & 0x1;
        // Depth regions only become dirty when the depth/stencil is written.
        let depth_readonly = !rb_depthcontrol
            .intersects(regs::DepthControl::STENCIL_ENABLE | regs::DepthControl::Z_WRITE_ENABLE);

        let mut full_update = self.current_surface_pitch != surface_pitch
            || self.current_msaa_samples != msaa_samples;

        // Row size of each target, and the tallest size every enabled target
        // can have within EDRAM (host render targets share dimensions).
        let edram_row_tiles_32bpp =
            (surface_pitch * samples_x).div_ceil(EDRAM_TILE_WIDTH_SAMPLES);
        let mut edram_row_tiles = [0u32; 5];
        let mut edram_max_rows = u32::MAX;
        for i in 0..5 {
            edram_row_tiles[i] = edram_row_tiles_32bpp * if formats_are_64bpp[i] { 2 } else { 1 };
            if enabled[i] {
                edram_max_rows =
                    edram_max_rows.min((EDRAM_TILE_COUNT - edram_bases[i]) / edram_row_tiles[i]);
            }
        }
        if edram_max_rows == 0 || edram_max_rows == u32::MAX {
            // A target sits at the very end of EDRAM, or nothing is enabled.
            return false;
        }
        edram_max_rows = edram_max_rows.min(
            (MAX_RT_HEIGHT / EDRAM_TILE_HEIGHT_SAMPLES) * msaa_samples.samples_y(),
        );
        // A disabled target freeing space lets the rest grow; growing needs a
        // reallocation, hence a full update.
        if edram_max_rows > self.current_edram_max_rows {
            full_update = true;
        }

        let edram_dirty_rows = Self::current_dirty_rows(ctx, edram_max_rows);

        // EDRAM base or format changes on a bound target force a full update;
        // otherwise newly enabled targets are attached partially.
        let mut to_attach = 0u32;
        if !full_update {
            for i in 0..5 {
                if !enabled[i] {
                    continue;
                }
                let binding = &self.bindings[i];
                if binding.is_bound {
                    if binding.edram_base != edram_bases[i] || binding.format != formats[i] {
                        full_update = true;
                        break;
                    }
                } else {
                    to_attach |= 1 << i;
                }
            }
        }

        // Overlap of the current viewport with unsaved rows of a previously
        // used target, or of a new target with any bound target's unsaved
        // rows, forces the store/load cycle of a full update.
        if !full_update {
            'outer: for i in 0..5 {
                let binding_1 = &self.bindings[i];
                let dirty_rows_1;
                if binding_1.is_bound {
                    if enabled[i] {
                        continue;
                    }
                    dirty_rows_1 = binding_1.edram_dirty_rows;
                } else {
                    if to_attach & (1 << i) == 0 {
                        continue;
                    }
                    dirty_rows_1 = edram_dirty_rows;
                }
                for j in 0..5 {
                    let binding_2 = &self.bindings[j];
                    if !binding_2.is_bound {
                        continue;
                    }
                    let dirty_rows_2 = if binding_1.is_bound {
                        if !enabled[j] {
                            continue;
                        }
                        edram_dirty_rows
                    } else {
                        binding_2.edram_dirty_rows
                    };
                    if edram_bases[i] < edram_bases[j] + dirty_rows_2 * edram_row_tiles[j]
                        && edram_bases[j] < edram_bases[i] + dirty_rows_1 * edram_row_tiles[i]
                    {
                        full_update = true;
                        break 'outer;
                    }
                }
            }
        }

        if full_update || to_attach != 0 {
            if full_update {
                self.store_render_targets_to_edram(ctx);
                self.bindings = Default::default();
                self.current_surface_pitch = surface_pitch;
                self.current_msaa_samples = msaa_samples;
                self.current_edram_max_rows = edram_max_rows;
                for i in 0..5 {
                    if enabled[i] {
                        to_attach |= 1 << i;
                    }
                }
            }
            tracing::debug!(
                full_update,
                surface_pitch,
                ?msaa_samples,
                to_attach,
                "render target update"
            );

            for i in 0..5 {
                if to_attach & (1 << i) == 0 {
                    continue;
                }
                let key = RenderTargetKey {
                    width_ss_div_80: edram_row_tiles_32bpp,
                    height_ss_div_16: self.current_edram_max_rows,
                    is_depth: i == 4,
                    format: formats[i],
                };
                // Same-format colors bound twice in one draw get distinct
                // instances.
                let mut instance = 0;
                if i != 4 {
                    for j in 0..i {
                        let other = &self.bindings[j];
                        if other.is_bound
                            && other.render_target.is_some()
                            && other.format == formats[i]
                        {
                            instance += 1;
                        }
                    }
                }
                self.bindings[i] = RenderTargetBinding {
                    is_bound: true,
                    edram_base: edram_bases[i],
                    edram_dirty_rows: 0,
                    format: formats[i],
                    is_64bpp: formats_are_64bpp[i],
                    render_target: self
                        .find_or_create_render_target(key, instance)
                        .map(|_| (key, instance)),
                };
            }

            // Sample positions when loading depth must match the draw.
            if self.sample_positions_set != Some(msaa_samples) {
                self.sample_positions_set = Some(msaa_samples);
                ctx.deferred.push(HostCommand::SetSamplePositions {
                    positions: sample_positions(msaa_samples),
                });
            }

            // Load the attached targets' contents from EDRAM, then bind.
            let load: Vec<usize> = (0..5)
                .filter(|i| to_attach & (1 << i) != 0 && self.bindings[*i].render_target.is_some())
                .collect();
            if !load.is_empty() {
                self.load_render_targets_from_edram(ctx, &load);
            }

            let mut rtv_handles = Vec::new();
            for binding in &self.bindings[..4] {
                let Some(key) = binding.render_target else {
                    continue;
                };
                if !binding.is_bound {
                    continue;
                }
                let rt = self.render_targets.get_mut(&key).unwrap();
                ctx.push_transition_barrier(
                    ResourceHandle::Image(rt.image),
                    rt.state,
                    ResourceState::RENDER_TARGET,
                    None,
                );
                rt.state = ResourceState::RENDER_TARGET;
                rtv_handles.push(rt.target_view);
            }
            let mut dsv_handle = None;
            if self.bindings[4].is_bound {
                if let Some(key) = self.bindings[4].render_target {
                    let rt = self.render_targets.get_mut(&key).unwrap();
                    ctx.push_transition_barrier(
                        ResourceHandle::Image(rt.image),
                        rt.state,
                        ResourceState::DEPTH_WRITE,
                        None,
                    );
                    rt.state = ResourceState::DEPTH_WRITE;
                    dsv_handle = Some(rt.target_view);
                }
            }
            ctx.submit_barriers();
            ctx.deferred.push(HostCommand::SetRenderTargets {
                colors: rtv_handles,
                depth: dsv_handle,
            });
        }

        // Bump dirty regions of everything written by this draw.
        for i in 0..5 {
            if !enabled[i] || (i == 4 && depth_readonly) {
                continue;
            }
            let binding = &mut self.bindings[i];
            if binding.render_target.is_none() {
                continue;
            }
            binding.edram_dirty_rows = binding.edram_dirty_rows.max(edram_dirty_rows);
        }

        true
    }

    fn find_or_create_render_target(
        &mut self,
        key: RenderTargetKey,
        instance: u32,
    ) -> Option<()> {
        if self.render_targets.contains_key(&(key, instance)) {
            return Some(());
        }
        if key.width_ss_div_80 == 0 || key.height_ss_div_16 == 0 {
            return None;
        }
        let host_format = if key.is_depth {
            depth_host_format(DepthRenderTargetFormat::from_bits(key.format))
        } else {
            color_host_format(ColorRenderTargetFormat::from_bits(key.format)?)?
        };
        let width = key.width_ss_div_80 * EDRAM_TILE_WIDTH_SAMPLES * self.scale.0;
        let height = key.height_ss_div_16 * EDRAM_TILE_HEIGHT_SAMPLES * self.scale.1;
        let usage = if key.is_depth {
            ImageUsage::DEPTH_STENCIL
        } else {
            ImageUsage::RENDER_TARGET | ImageUsage::SAMPLED
        };
        let image = self
            .device
            .create_image(&ImageDesc {
                dimension: ImageDimension::D2,
                width,
                height,
                depth_or_layers: 1,
                mip_levels: 1,
                format: host_format,
                usage,
                initial_state: ResourceState::COPY_DEST,
                label: if key.is_depth {
                    "edram depth target"
                } else {
                    "edram color target"
                },
            })
            .ok()?;
        let target_view = self
            .device
            .create_image_view(&ImageViewDesc {
                image,
                format: host_format,
                dimension: ViewDimension::D2,
                base_mip: 0,
                mip_count: 1,
                base_layer: 0,
                layer_count: 1,
                swizzle: Swizzle::IDENTITY,
            })
            .ok()?;
        self.render_targets.insert(
            (key, instance),
            RenderTarget {
                image,
                target_view,
                host_format,
                state: ResourceState::COPY_DEST,
            },
        );
        Some(())
    }

    fn transition_edram(&mut self, ctx: &mut SubmissionContext, new_state: ResourceState) {
        if ctx.push_transition_barrier(
            ResourceHandle::Buffer(self.edram_buffer),
            self.edram_buffer_state,
            new_state,
            None,
        ) {
            self.edram_buffer_state = new_state;
        }
    }

    /// Fills a transient descriptor pair (EDRAM SRV at base, destination UAV
    /// written by the caller at base + 1 or the reverse) and returns it.
    fn transient_edram_table(
        &self,
        ctx: &mut SubmissionContext,
        edram_slot_is_uav: bool,
    ) -> Option<DescriptorTableBase> {
        let (heap, base) = ctx.request_transient_view_descriptors(2)?;
        if edram_slot_is_uav {
            // Slot base: scratch SRV (caller), slot base+1: EDRAM UAV.
            self.device
                .copy_descriptors(heap, base + 1, self.staging_heap, STAGED_EDRAM_UAV, 1)
                .ok()?;
        } else {
            self.device
                .copy_descriptors(heap, base, self.staging_heap, STAGED_EDRAM_SRV, 1)
                .ok()?;
        }
        Some(DescriptorTableBase { heap, index: base })
    }

    /// Writes every bound target's dirty rows into the EDRAM buffer.
    fn store_render_targets_to_edram(&mut self, ctx: &mut SubmissionContext) {
        let stores: Vec<usize> = (0..5)
            .filter(|&i| {
                let b = &self.bindings[i];
                b.is_bound && b.edram_dirty_rows > 0 && b.render_target.is_some()
            })
            .collect();
        if stores.is_empty() {
            return;
        }

        for i in stores {
            let binding = self.bindings[i];
            let (key, instance) = binding.render_target.unwrap();
            let rt = self.render_targets.get_mut(&(key, instance)).unwrap();
            let rows = binding.edram_dirty_rows;
            let row_tiles = key.width_ss_div_80 * if binding.is_64bpp { 2 } else { 1 };
            let bytes_per_sample = if binding.is_64bpp { 8 } else { 4 };
            let width_samples =
                key.width_ss_div_80 * EDRAM_TILE_WIDTH_SAMPLES * self.scale.0;
            let height_samples = rows * EDRAM_TILE_HEIGHT_SAMPLES * self.scale.1;
            let linear_pitch = width_samples * bytes_per_sample;
            let scratch_size = (linear_pitch * height_samples) as u64;

            let Some(scratch) =
                ctx.request_scratch_gpu_buffer(scratch_size, ResourceState::COPY_DEST)
            else {
                continue;
            };

            // Image into the linear scratch layout.
            ctx.push_transition_barrier(
                ResourceHandle::Image(rt.image),
                rt.state,
                ResourceState::COPY_SOURCE,
                None,
            );
            rt.state = ResourceState::COPY_SOURCE;
            ctx.submit_barriers();
            ctx.deferred.push(HostCommand::CopyTextureRegion {
                dst: TextureCopyLocation::Placed {
                    buffer: scratch,
                    footprint: PlacedBufferFootprint {
                        offset: 0,
                        format: rt.host_format,
                        width: width_samples,
                        height: height_samples,
                        depth: 1,
                        row_pitch_bytes: linear_pitch,
                    },
                },
                src: TextureCopyLocation::Subresource {
                    image: rt.image,
                    subresource: 0,
                },
            });

            // Scratch into EDRAM tiles.
            ctx.push_transition_barrier(
                ResourceHandle::Buffer(scratch),
                ResourceState::COPY_DEST,
                ResourceState::NON_PIXEL_SHADER_RESOURCE,
                None,
            );
            self.transition_edram(ctx, ResourceState::UNORDERED_ACCESS);
            ctx.submit_barriers();

            let mode = LoadStoreMode::for_binding(key.is_depth, binding.format);
            let pipeline = self.store_pipelines[&mode];
            let Some(table) = self.transient_edram_table(ctx, true) else {
                ctx.release_scratch_gpu_buffer(scratch, ResourceState::NON_PIXEL_SHADER_RESOURCE);
                continue;
            };
            if self
                .device
                .write_buffer_srv(
                    table.heap,
                    table.index,
                    scratch,
                    BufferViewKind::Raw {
                        size_bytes: scratch_size,
                    },
                )
                .is_err()
            {
                ctx.release_scratch_gpu_buffer(scratch, ResourceState::NON_PIXEL_SHADER_RESOURCE);
                continue;
            }

            let constants = EdramLoadStoreConstants {
                linear_offset: 0,
                linear_pitch,
                base_tiles: binding.edram_base,
                pitch_and_rows: row_tiles | (rows << 16),
                clear_value: [0; 2],
                float_depth_base: if mode == LoadStoreMode::DepthFloat {
                    self.edram_float_depth_offset as u32
                } else {
                    0
                },
                reserved: 0,
            };
            ctx.deferred.push(HostCommand::SetComputeRootSignature {
                signature: self.load_store_root_signature,
            });
            ctx.deferred.push(HostCommand::SetPipeline { pipeline });
            ctx.deferred.push(HostCommand::SetComputeRootConstants {
                parameter_index: 0,
                dest_offset_dwords: 0,
                values: constants.as_dwords(),
            });
            ctx.deferred.push(HostCommand::SetComputeRootDescriptorTable {
                parameter_index: 1,
                base: table,
            });
            ctx.deferred.push(HostCommand::Dispatch {
                group_count_x: row_tiles,
                group_count_y: rows,
                group_count_z: 1,
            });
            ctx.push_uav_barrier(ResourceHandle::Buffer(self.edram_buffer));

            ctx.release_scratch_gpu_buffer(scratch, ResourceState::NON_PIXEL_SHADER_RESOURCE);
        }
    }

    /// Loads the listed bindings' EDRAM contents into their images.
    fn load_render_targets_from_edram(&mut self, ctx: &mut SubmissionContext, indices: &[usize]) {
        for &i in indices {
            let binding = self.bindings[i];
            let Some((key, instance)) = binding.render_target else {
                continue;
            };
            let (rt_image, rt_host_format) = {
                let rt = &self.render_targets[&(key, instance)];
                (rt.image, rt.host_format)
            };
            let rows = key.height_ss_div_16;
            let row_tiles = key.width_ss_div_80 * if binding.is_64bpp { 2 } else { 1 };
            let bytes_per_sample = if binding.is_64bpp { 8 } else { 4 };
            let width_samples = key.width_ss_div_80 * EDRAM_TILE_WIDTH_SAMPLES * self.scale.0;
            let height_samples = rows * EDRAM_TILE_HEIGHT_SAMPLES * self.scale.1;
            let linear_pitch = width_samples * bytes_per_sample;
            let scratch_size = (linear_pitch * height_samples) as u64;

            let Some(scratch) =
                ctx.request_scratch_gpu_buffer(scratch_size, ResourceState::UNORDERED_ACCESS)
            else {
                continue;
            };
            self.transition_edram(ctx, ResourceState::NON_PIXEL_SHADER_RESOURCE);
            ctx.submit_barriers();

            let mode = LoadStoreMode::for_binding(key.is_depth, binding.format);
            let pipeline = self.load_pipelines[&mode];
            let Some(table) = self.transient_edram_table(ctx, false) else {
                ctx.release_scratch_gpu_buffer(scratch, ResourceState::UNORDERED_ACCESS);
                continue;
            };
            if self
                .device
                .write_buffer_uav(
                    table.heap,
                    table.index + 1,
                    scratch,
                    BufferViewKind::Raw {
                        size_bytes: scratch_size,
                    },
                )
                .is_err()
            {
                ctx.release_scratch_gpu_buffer(scratch, ResourceState::UNORDERED_ACCESS);
                continue;
            }

            let constants = EdramLoadStoreConstants {
                linear_offset: 0,
                linear_pitch,
                base_tiles: binding.edram_base,
                pitch_and_rows: row_tiles | (rows << 16),
                clear_value: [0; 2],
                float_depth_base: if mode == LoadStoreMode::DepthFloat {
                    self.edram_float_depth_offset as u32
                } else {
                    0
                },
                reserved: 0,
            };
            ctx.deferred.push(HostCommand::SetComputeRootSignature {
                signature: self.load_store_root_signature,
            });
            ctx.deferred.push(HostCommand::SetPipeline { pipeline });
            ctx.deferred.push(HostCommand::SetComputeRootConstants {
                parameter_index: 0,
                dest_offset_dwords: 0,
                values: constants.as_dwords(),
            });
            ctx.deferred.push(HostCommand::SetComputeRootDescriptorTable {
                parameter_index: 1,
                base: table,
            });
            ctx.deferred.push(HostCommand::Dispatch {
                group_count_x: row_tiles,
                group_count_y: rows,
                group_count_z: 1,
            });
            ctx.push_uav_barrier(ResourceHandle::Buffer(scratch));
            ctx.push_transition_barrier(
                ResourceHandle::Buffer(scratch),
                ResourceState::UNORDERED_ACCESS,
                ResourceState::COPY_SOURCE,
                None,
            );
            ctx.submit_barriers();

            // Linear scratch into the image.
            ctx.deferred.push(HostCommand::CopyTextureRegion {
                dst: TextureCopyLocation::Subresource {
                    image: rt_image,
                    subresource: 0,
                },
                src: TextureCopyLocation::Placed {
                    buffer: scratch,
                    footprint: PlacedBufferFootprint {
                        offset: 0,
                        format: rt_host_format,
                        width: width_samples,
                        height: height_samples,
                        depth: 1,
                        row_pitch_bytes: linear_pitch,
                    },
                },
            });
            self.render_targets
                .get_mut(&(key, instance))
                .unwrap()
                .state = ResourceState::COPY_DEST;
            ctx.release_scratch_gpu_buffer(scratch, ResourceState::COPY_SOURCE);
        }
    }

    /// Executes a guest resolve. Returns the written guest range for raw and
    /// converting copies, or `None` for clear-only and empty resolves.
    pub fn resolve(
        &mut self,
        ctx: &mut SubmissionContext,
        shared_memory: &mut SharedMemory,
        texture_cache: &mut TextureCache,
    ) -> Result<Option<ResolveWrite>, ()> {
        // The source is EDRAM; everything bound must be stored first, and the
        // bindings dropped so the next draw reloads.
        self.store_render_targets_to_edram(ctx);
        self.clear_bindings();

        let surface_pitch = (ctx.regs.get(regs::RB_SURFACE_INFO) & 0x3FFF).min(MAX_SURFACE_PITCH);
        if surface_pitch == 0 {
            return Ok(None);
        }
        let msaa_samples = MsaaSamples::from_bits(ctx.regs.get(regs::RB_SURFACE_INFO) >> 16);

        let rb_copy_control = ctx.regs.get(regs::RB_COPY_CONTROL);
        let src_select = rb_copy_control & 0x7;
        // 0 raw copy, 1 converting copy, 2 constant, 3 null (clear only).
        let copy_command = (rb_copy_control >> 20) & 0x3;
        let color_clear = rb_copy_control & (1 << 8) != 0;
        let depth_clear = rb_copy_control & (1 << 9) != 0;
        if src_select > 4 {
            return Err(());
        }
        let src_is_depth = src_select == 4;

        let (src_edram_base, src_format) = if src_is_depth {
            let info = ctx.regs.get(regs::RB_DEPTH_INFO);
            (info & 0xFFF, (info >> 16) & 0x1)
        } else {
            let info = ctx.regs.get(match src_select {
                0 => regs::RB_COLOR_INFO,
                1 => regs::RB_COLOR1_INFO,
                2 => regs::RB_COLOR2_INFO,
                _ => regs::RB_COLOR3_INFO,
            });
            (
                info & 0xFFF,
                ColorRenderTargetFormat::from_bits(info >> 16)
                    .map(|f| f.base() as u32)
                    .ok_or(())?,
            )
        };
        let src_is_64bpp = !src_is_depth
            && ColorRenderTargetFormat::from_bits(src_format).is_some_and(|f| f.is_64bpp());

        let rect = Self::resolve_rect(ctx);
        if rect.is_empty() {
            // Scissored away entirely; a successful no-op.
            return Ok(None);
        }

        let dest_info = ctx.regs.get(regs::RB_COPY_DEST_INFO);
        let dest_format_bits = (dest_info >> 7) & 0x3F;
        // Signed 6-bit exponent bias in bits 16..21.
        let dest_exp_bias = (dest_info as i32) << 10 >> 26;
        let dest_base = ctx.regs.get(regs::RB_COPY_DEST_BASE);
        let dest_pitch = ctx.regs.get(regs::RB_COPY_DEST_PITCH) & 0x3FFF;

        let height = rect.height();
        let bytes_per_pixel = if src_is_64bpp { 8 } else { 4 };
        let dest_length = dest_pitch * bytes_per_pixel * height;

        let mut written = None;
        if copy_command == 0 || copy_command == 1 {
            // A raw copy needs the destination texture format to be the same
            // data as the EDRAM source format, with no exponent bias.
            let formats_match = if src_is_depth {
                matches!(dest_format_bits, 22 | 23)
            } else {
                source_texture_format(src_format) == Some(dest_format_bits)
            };
            let raw = copy_command == 0 && dest_exp_bias == 0 && formats_match;
            if raw {
                self.resolve_raw(
                    ctx,
                    shared_memory,
                    src_edram_base,
                    src_is_64bpp,
                    surface_pitch,
                    msaa_samples,
                    rect,
                    dest_base,
                    dest_pitch,
                )?;
            } else {
                self.resolve_convert(
                    ctx,
                    shared_memory,
                    texture_cache,
                    src_edram_base,
                    src_format,
                    src_is_depth,
                    src_is_64bpp,
                    surface_pitch,
                    msaa_samples,
                    rect,
                    dest_base,
                    dest_pitch,
                    dest_format_bits,
                    dest_exp_bias,
                )?;
            }
            written = Some(ResolveWrite {
                guest_base: dest_base,
                length: dest_length,
            });
        }

        // Associated clears run over the same EDRAM region after the copy.
        if color_clear && !src_is_depth {
            let clear_lo = ctx.regs.get(regs::RB_COLOR_CLEAR);
            let clear_hi = ctx.regs.get(regs::RB_COLOR_CLEAR_LO);
            self.clear_edram_region(
                ctx,
                src_edram_base,
                surface_pitch,
                msaa_samples,
                rect,
                src_is_64bpp,
                if src_is_64bpp {
                    self.clear_64bpp_pipeline
                } else {
                    self.clear_32bpp_pipeline
                },
                [clear_lo, clear_hi],
            );
        }
        if depth_clear && (src_is_depth || copy_command >= 2) {
            let depth_info = ctx.regs.get(regs::RB_DEPTH_INFO);
            let depth_format = DepthRenderTargetFormat::from_bits(depth_info >> 16);
            let clear_value = ctx.regs.get(regs::RB_DEPTH_CLEAR);
            let pipeline = match depth_format {
                DepthRenderTargetFormat::D24FS8 => self.clear_depth_float_pipeline,
                DepthRenderTargetFormat::D24S8 => self.clear_32bpp_pipeline,
            };
            self.clear_edram_region(
                ctx,
                depth_info & 0xFFF,
                surface_pitch,
                msaa_samples,
                rect,
                false,
                pipeline,
                [clear_value, 0],
            );
        }

        Ok(written)
    }

    /// The resolve rectangle from the window scissor, clamped to the surface.
    fn resolve_rect(ctx: &SubmissionContext) -> Rect {
        let tl = ctx.regs.get(regs::PA_SC_WINDOW_SCISSOR_TL);
        let br = ctx.regs.get(regs::PA_SC_WINDOW_SCISSOR_BR);
        let mut left = (tl & 0x7FFF) as i32;
        let mut top = ((tl >> 16) & 0x7FFF) as i32;
        let mut right = (br & 0x7FFF) as i32;
        let mut bottom = ((br >> 16) & 0x7FFF) as i32;
        if tl & (1 << 31) == 0 {
            let offset = ctx.regs.get(regs::PA_SC_WINDOW_OFFSET);
            let mut offset_x = (offset & 0x7FFF) as i32;
            if offset_x & 0x4000 != 0 {
                offset_x -= 0x8000;
            }
            let mut offset_y = ((offset >> 16) & 0x7FFF) as i32;
            if offset_y & 0x4000 != 0 {
                offset_y -= 0x8000;
            }
            left += offset_x;
            right += offset_x;
            top += offset_y;
            bottom += offset_y;
        }
        Rect {
            left: left.max(0),
            top: top.max(0),
            right: right.min(MAX_SURFACE_PITCH as i32),
            bottom: bottom.min(MAX_RT_HEIGHT as i32),
        }
    }

    /// Raw resolve: one dispatch reading EDRAM tiles and writing the tiled
    /// guest layout directly into shared memory.
    #[allow(clippy::too_many_arguments)]
    fn resolve_raw(
        &mut self,
        ctx: &mut SubmissionContext,
        shared_memory: &mut SharedMemory,
        edram_base: u32,
        is_64bpp: bool,
        surface_pitch: u32,
        msaa_samples: MsaaSamples,
        rect: Rect,
        dest_base: u32,
        dest_pitch: u32,
    ) -> Result<(), ()> {
        let width = rect.width();
        let height = rect.height();
        let bytes_per_pixel = if is_64bpp { 8 } else { 4 };
        let dest_length = dest_pitch * bytes_per_pixel * height;

        if !shared_memory.request_range(ctx, dest_base, dest_length) {
            return Err(());
        }
        shared_memory.use_for_writing(ctx);
        self.transition_edram(ctx, ResourceState::NON_PIXEL_SHADER_RESOURCE);
        ctx.submit_barriers();

        let Some(table) = self.transient_edram_table(ctx, false) else {
            return Err(());
        };
        shared_memory.write_raw_uav(table.heap, table.index + 1);

        let row_tiles = (surface_pitch * msaa_samples.samples_x())
            .div_ceil(EDRAM_TILE_WIDTH_SAMPLES)
            * if is_64bpp { 2 } else { 1 };
        let first_tile_row =
            (rect.top as u32 * msaa_samples.samples_y()) / EDRAM_TILE_HEIGHT_SAMPLES;
        let constants = EdramLoadStoreConstants {
            linear_offset: dest_base,
            linear_pitch: dest_pitch * bytes_per_pixel,
            base_tiles: edram_base + first_tile_row * row_tiles,
            pitch_and_rows: row_tiles | (height << 16),
            clear_value: [0; 2],
            float_depth_base: 0,
            reserved: 0,
        };
        let pipeline = if is_64bpp {
            self.tile_sample_64bpp_pipeline
        } else {
            self.tile_sample_32bpp_pipeline
        };
        ctx.deferred.push(HostCommand::SetComputeRootSignature {
            signature: self.load_store_root_signature,
        });
        ctx.deferred.push(HostCommand::SetPipeline { pipeline });
        ctx.deferred.push(HostCommand::SetComputeRootConstants {
            parameter_index: 0,
            dest_offset_dwords: 0,
            values: constants.as_dwords(),
        });
        ctx.deferred.push(HostCommand::SetComputeRootDescriptorTable {
            parameter_index: 1,
            base: table,
        });
        ctx.deferred.push(HostCommand::Dispatch {
            group_count_x: (width * msaa_samples.samples_x()).div_ceil(EDRAM_TILE_WIDTH_SAMPLES),
            group_count_y: (height * msaa_samples.samples_y())
                .div_ceil(EDRAM_TILE_HEIGHT_SAMPLES),
            group_count_z: 1,
        });
        shared_memory.mark_uav_writes_commit_needed();
        shared_memory.range_written_by_gpu(dest_base, dest_length);
        Ok(())
    }

    /// Converting resolve: EDRAM region into a color image, fullscreen pass
    /// collapsing samples and applying exponent bias, copy into an aligned
    /// buffer, then the texture cache tiles it into guest memory.
    #[allow(clippy::too_many_arguments)]
    fn resolve_convert(
        &mut self,
        ctx: &mut SubmissionContext,
        shared_memory: &mut SharedMemory,
        texture_cache: &mut TextureCache,
        edram_base: u32,
        src_format: u32,
        src_is_depth: bool,
        src_is_64bpp: bool,
        surface_pitch: u32,
        msaa_samples: MsaaSamples,
        rect: Rect,
        dest_base: u32,
        dest_pitch: u32,
        dest_format_bits: u32,
        dest_exp_bias: i32,
    ) -> Result<(), ()> {
        if src_is_depth {
            // Depth is never resolved by drawing; raw covers it.
            return Err(());
        }
        let dest_guest_format = crate::xenos::TextureFormat::from_bits(dest_format_bits);
        let Some(dest_host_format) = texture_cache.resolve_dest_host_format(dest_guest_format)
        else {
            if !self.unsupported_format_logged {
                self.unsupported_format_logged = true;
                tracing::warn!(?dest_guest_format, "unsupported resolve destination format");
            }
            return Err(());
        };

        let width = rect.width();
        let height = rect.height();

        // Load the EDRAM region into a source render target covering it.
        let row_tiles_32bpp =
            (surface_pitch * msaa_samples.samples_x()).div_ceil(EDRAM_TILE_WIDTH_SAMPLES);
        let rows = ((rect.bottom as u32 * msaa_samples.samples_y())
            .div_ceil(EDRAM_TILE_HEIGHT_SAMPLES))
        .min(EDRAM_TILE_COUNT / row_tiles_32bpp.max(1));
        let src_key = RenderTargetKey {
            width_ss_div_80: row_tiles_32bpp,
            height_ss_div_16: rows.max(1),
            is_depth: false,
            format: src_format,
        };
        self.find_or_create_render_target(src_key, 0).ok_or(())?;
        self.bindings[0] = RenderTargetBinding {
            is_bound: true,
            edram_base,
            edram_dirty_rows: 0,
            format: src_format,
            is_64bpp: src_is_64bpp,
            render_target: Some((src_key, 0)),
        };
        self.load_render_targets_from_edram(ctx, &[0]);
        let src_rt = self.render_targets.get_mut(&(src_key, 0)).unwrap();
        let src_image = src_rt.image;
        let src_old_state = src_rt.state;
        src_rt.state = ResourceState::PIXEL_SHADER_RESOURCE;
        let src_view = self
            .device
            .create_image_view(&ImageViewDesc {
                image: src_image,
                format: src_rt.host_format,
                dimension: ViewDimension::D2,
                base_mip: 0,
                mip_count: 1,
                base_layer: 0,
                layer_count: 1,
                swizzle: Swizzle::IDENTITY,
            })
            .map_err(|_| ())?;

        // Destination image of the guest format and resolve size.
        let target_key = ResolveTargetKey {
            width: width.max(1),
            height: height.max(1),
            format: dest_host_format,
        };
        if !self.resolve_targets.contains_key(&target_key) {
            let image = self
                .device
                .create_image(&ImageDesc {
                    dimension: ImageDimension::D2,
                    width: target_key.width,
                    height: target_key.height,
                    depth_or_layers: 1,
                    mip_levels: 1,
                    format: dest_host_format,
                    usage: ImageUsage::RENDER_TARGET,
                    initial_state: ResourceState::RENDER_TARGET,
                    label: "resolve target",
                })
                .map_err(|_| ())?;
            let view = self
                .device
                .create_image_view(&ImageViewDesc {
                    image,
                    format: dest_host_format,
                    dimension: ViewDimension::D2,
                    base_mip: 0,
                    mip_count: 1,
                    base_layer: 0,
                    layer_count: 1,
                    swizzle: Swizzle::IDENTITY,
                })
                .map_err(|_| ())?;
            self.resolve_targets.insert(
                target_key,
                ResolveTarget {
                    image,
                    view,
                    state: ResourceState::RENDER_TARGET,
                },
            );
        }

        let pipeline = self.resolve_pipeline(dest_host_format).ok_or(())?;
        let target = self.resolve_targets.get_mut(&target_key).unwrap();
        ctx.push_transition_barrier(
            ResourceHandle::Image(src_image),
            src_old_state,
            ResourceState::PIXEL_SHADER_RESOURCE,
            None,
        );
        ctx.push_transition_barrier(
            ResourceHandle::Image(target.image),
            target.state,
            ResourceState::RENDER_TARGET,
            None,
        );
        target.state = ResourceState::RENDER_TARGET;
        ctx.submit_barriers();

        let (heap, slot) = ctx.request_transient_view_descriptors(1).ok_or(())?;
        self.device
            .write_image_srv(heap, slot, src_view)
            .map_err(|_| ())?;

        // Fullscreen triangle sampling between the source samples; constants
        // carry the source offset within the RT, the size, exponent bias and
        // the half-pixel adjustment.
        let half_pixel = if ctx.config.half_pixel_offset { 1u32 } else { 0 };
        ctx.deferred.push(HostCommand::SetGraphicsRootSignature {
            signature: self.resolve_root_signature,
        });
        ctx.deferred.push(HostCommand::SetPipeline { pipeline });
        ctx.deferred.push(HostCommand::SetGraphicsRootConstants {
            parameter_index: 0,
            dest_offset_dwords: 0,
            values: vec![
                rect.left as u32,
                rect.top as u32,
                width,
                height,
                dest_exp_bias as u32,
                msaa_samples as u32,
                half_pixel,
                ctx.config.resolution_scale_resolve_edge_clamp as u32,
            ],
        });
        ctx.deferred.push(HostCommand::SetGraphicsRootDescriptorTable {
            parameter_index: 1,
            base: DescriptorTableBase { heap, index: slot },
        });
        ctx.deferred.push(HostCommand::SetRenderTargets {
            colors: vec![target.view],
            depth: None,
        });
        ctx.deferred.push(HostCommand::SetViewport {
            viewport: Viewport {
                x: 0.0,
                y: 0.0,
                width: width as f32,
                height: height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        });
        ctx.deferred.push(HostCommand::SetScissor {
            rect: Rect {
                left: 0,
                top: 0,
                right: width as i32,
                bottom: height as i32,
            },
        });
        ctx.deferred.push(HostCommand::SetPrimitiveTopology {
            topology: PrimitiveTopology::TriangleList,
        });
        ctx.deferred.push(HostCommand::DrawInstanced {
            vertex_count_per_instance: 3,
            instance_count: 1,
            start_vertex: 0,
            start_instance: 0,
        });

        // Copy the converted image into an aligned buffer and let the texture
        // cache tile it into guest memory.
        let bytes_per_pixel = dest_host_format.block_size_bytes();
        let aligned_pitch = (width * bytes_per_pixel + 255) & !255;
        let scratch_size = (aligned_pitch * height) as u64;
        let scratch = ctx
            .request_scratch_gpu_buffer(scratch_size, ResourceState::COPY_DEST)
            .ok_or(())?;
        ctx.push_transition_barrier(
            ResourceHandle::Image(target.image),
            ResourceState::RENDER_TARGET,
            ResourceState::COPY_SOURCE,
            None,
        );
        target.state = ResourceState::COPY_SOURCE;
        ctx.submit_barriers();
        ctx.deferred.push(HostCommand::CopyTextureRegion {
            dst: TextureCopyLocation::Placed {
                buffer: scratch,
                footprint: PlacedBufferFootprint {
                    offset: 0,
                    format: dest_host_format,
                    width,
                    height,
                    depth: 1,
                    row_pitch_bytes: aligned_pitch,
                },
            },
            src: TextureCopyLocation::Subresource {
                image: target.image,
                subresource: 0,
            },
        });
        ctx.push_transition_barrier(
            ResourceHandle::Buffer(scratch),
            ResourceState::COPY_DEST,
            ResourceState::NON_PIXEL_SHADER_RESOURCE,
            None,
        );
        ctx.submit_barriers();

        let tiled = texture_cache.tile_resolved_texture(
            ctx,
            shared_memory,
            scratch,
            aligned_pitch,
            dest_base,
            dest_pitch,
            width,
            height,
            dest_guest_format,
        );
        ctx.release_scratch_gpu_buffer(scratch, ResourceState::NON_PIXEL_SHADER_RESOURCE);
        if !tiled {
            return Err(());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn clear_edram_region(
        &mut self,
        ctx: &mut SubmissionContext,
        edram_base: u32,
        surface_pitch: u32,
        msaa_samples: MsaaSamples,
        rect: Rect,
        is_64bpp: bool,
        pipeline: PipelineHandle,
        clear_value: [u32; 2],
    ) {
        let row_tiles = (surface_pitch * msaa_samples.samples_x())
            .div_ceil(EDRAM_TILE_WIDTH_SAMPLES)
            * if is_64bpp { 2 } else { 1 };
        let rows = (rect.height() * msaa_samples.samples_y()).div_ceil(EDRAM_TILE_HEIGHT_SAMPLES);
        if rows == 0 || row_tiles == 0 {
            return;
        }
        self.transition_edram(ctx, ResourceState::UNORDERED_ACCESS);
        ctx.submit_barriers();
        let Some((heap, base)) = ctx.request_transient_view_descriptors(1) else {
            return;
        };
        if self
            .device
            .copy_descriptors(heap, base, self.staging_heap, STAGED_EDRAM_UAV, 1)
            .is_err()
        {
            return;
        }
        let constants = EdramLoadStoreConstants {
            linear_offset: 0,
            linear_pitch: 0,
            base_tiles: edram_base,
            pitch_and_rows: row_tiles | (rows << 16),
            clear_value,
            float_depth_base: self.edram_float_depth_offset as u32,
            reserved: 0,
        };
        ctx.deferred.push(HostCommand::SetComputeRootSignature {
            signature: self.load_store_root_signature,
        });
        ctx.deferred.push(HostCommand::SetPipeline { pipeline });
        ctx.deferred.push(HostCommand::SetComputeRootConstants {
            parameter_index: 0,
            dest_offset_dwords: 0,
            values: constants.as_dwords(),
        });
        ctx.deferred.push(HostCommand::SetComputeRootDescriptorTable {
            parameter_index: 1,
            base: DescriptorTableBase { heap, index: base },
        });
        ctx.deferred.push(HostCommand::Dispatch {
            group_count_x: row_tiles,
            group_count_y: rows,
            group_count_z: 1,
        });
        ctx.push_uav_barrier(ResourceHandle::Buffer(self.edram_buffer));
    }

    fn resolve_pipeline(&mut self, format: Format) -> Option<PipelineHandle> {
        if let Some(pipeline) = self.resolve_pipelines.get(&format) {
            return Some(*pipeline);
        }
        let pipeline = self
            .device
            .create_graphics_pipeline(&GraphicsPipelineDesc {
                vertex_shader: ShaderCode::Builtin(BuiltinKernel::ResolveVertex),
                pixel_shader: Some(ShaderCode::Builtin(BuiltinKernel::ResolvePixel)),
                root_signature: self.resolve_root_signature,
                color_formats: [Some(format), None, None, None],
                depth_format: None,
                topology: PrimitiveTopology::TriangleList,
                state: GraphicsPipelineState::default(),
                label: "resolve",
            })
            .ok()?;
        self.resolve_pipelines.insert(format, pipeline);
        Some(pipeline)
    }

    /// Uploads a 10 MiB EDRAM snapshot (trace playback).
    pub fn restore_edram_snapshot(&mut self, ctx: &mut SubmissionContext, snapshot: &[u8]) {
        let length = snapshot.len().min(EDRAM_SIZE_BYTES as usize);
        let Some(upload) = ctx.request_upload(length as u64, 16) else {
            return;
        };
        ctx.write_upload(&upload, &snapshot[..length]);
        self.transition_edram(ctx, ResourceState::COPY_DEST);
        ctx.submit_barriers();
        ctx.deferred.push(HostCommand::CopyBufferRegion {
            dst: self.edram_buffer,
            dst_offset: 0,
            src: upload.buffer,
            src_offset: upload.offset,
            num_bytes: length as u64,
        });
        self.clear_bindings();
    }

    /// Test introspection: dirty-row count of one binding slot.
    pub fn binding_dirty_rows(&self, index: usize) -> u32 {
        self.bindings[index].edram_dirty_rows
    }

    pub fn binding_is_bound(&self, index: usize) -> bool {
        self.bindings[index].is_bound
    }
}

/// Programmable sample positions matching the Xenos grid.
fn sample_positions(msaa_samples: MsaaSamples) -> Vec<(i8, i8)> {
    match msaa_samples {
        MsaaSamples::X1 => Vec::new(),
        MsaaSamples::X2 => vec![(4, 4), (-4, -4)],
        MsaaSamples::X4 => vec![(-2, -6), (6, -2), (-6, 2), (2, 6)],
    }
}

fn color_host_format(format: ColorRenderTargetFormat) -> Option<Format> {
    Some(match format.base() {
        ColorRenderTargetFormat::K8888 | ColorRenderTargetFormat::K8888Gamma => {
            Format::R8G8B8A8Unorm
        }
        ColorRenderTargetFormat::K2101010 => Format::R10G10B10A2Unorm,
        ColorRenderTargetFormat::K2101010Float => Format::R16G16B16A16Float,
        ColorRenderTargetFormat::K1616 => Format::R16G16Snorm,
        ColorRenderTargetFormat::K16161616 => Format::R16G16B16A16Snorm,
        ColorRenderTargetFormat::K1616Float => Format::R16G16Float,
        ColorRenderTargetFormat::K16161616Float => Format::R16G16B16A16Float,
        ColorRenderTargetFormat::K32Float => Format::R32Float,
        ColorRenderTargetFormat::K3232Float => Format::R32G32Float,
        _ => return None,
    })
}

/// The guest texture format holding the same bits as a color render-target
/// format, for raw-resolve format matching.
fn source_texture_format(color_format: u32) -> Option<u32> {
    use crate::xenos::TextureFormat as T;
    Some(match ColorRenderTargetFormat::from_bits(color_format)?.base() {
        ColorRenderTargetFormat::K8888 | ColorRenderTargetFormat::K8888Gamma => T::K8888 as u32,
        ColorRenderTargetFormat::K2101010 => T::K2101010 as u32,
        ColorRenderTargetFormat::K2101010Float => T::K2101010FloatEdram as u32,
        ColorRenderTargetFormat::K1616 => T::K1616 as u32,
        ColorRenderTargetFormat::K16161616 => T::K16161616 as u32,
        ColorRenderTargetFormat::K1616Float => T::K1616Float as u32,
        ColorRenderTargetFormat::K16161616Float => T::K16161616Float as u32,
        ColorRenderTargetFormat::K32Float => T::K32Float as u32,
        ColorRenderTargetFormat::K3232Float => T::K3232Float as u32,
        _ => return None,
    })
}

fn depth_host_format(format: DepthRenderTargetFormat) -> Format {
    match format {
        DepthRenderTargetFormat::D24S8 => Format::D24UnormS8Uint,
        DepthRenderTargetFormat::D24FS8 => Format::D32FloatS8Uint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_store_mode_selection() {
        assert_eq!(
            LoadStoreMode::for_binding(false, ColorRenderTargetFormat::K8888 as u32),
            LoadStoreMode::Color32bpp
        );
        assert_eq!(
            LoadStoreMode::for_binding(false, ColorRenderTargetFormat::K16161616Float as u32),
            LoadStoreMode::Color64bpp
        );
        assert_eq!(
            LoadStoreMode::for_binding(false, ColorRenderTargetFormat::K2101010Float as u32),
            LoadStoreMode::Color7e3
        );
        assert_eq!(
            LoadStoreMode::for_binding(true, 0),
            LoadStoreMode::DepthUnorm
        );
        assert_eq!(
            LoadStoreMode::for_binding(true, 1),
            LoadStoreMode::DepthFloat
        );
    }

    #[test]
    fn sample_position_grids() {
        assert!(sample_positions(MsaaSamples::X1).is_empty());
        assert_eq!(sample_positions(MsaaSamples::X2).len(), 2);
        assert_eq!(sample_positions(MsaaSamples::X4).len(), 4);
    }

    #[test]
    fn color_formats_map_to_host() {
        assert_eq!(
            color_host_format(ColorRenderTargetFormat::K8888),
            Some(Format::R8G8B8A8Unorm)
        );
        assert_eq!(
            color_host_format(ColorRenderTargetFormat::K2101010FloatAs16161616),
            Some(Format::R16G16B16A16Float)
        );
        assert_eq!(
            color_host_format(ColorRenderTargetFormat::K3232Float),
            Some(Format::R32G32Float)
        );
    }
}
