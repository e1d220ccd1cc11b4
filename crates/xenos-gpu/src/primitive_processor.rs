//! Primitive processor: converts guest index streams and topologies into
//! host-compatible forms.
//!
//! Triangle fans, line loops and quad lists have no host equivalent and are
//! expanded into lists. Non-indexed expansions come from a static built-in
//! index buffer uploaded once in the first submission; indexed expansions are
//! written into a per-frame upload arena reclaimed when the frame completes.

use std::sync::Arc;

use xenos_hal::{
    BufferDesc, BufferHandle, BufferUsage, Device, GpuAddress, HostCommand, MemoryClass,
    PrimitiveTopology, ResourceHandle, ResourceState,
};

use crate::command_processor::SubmissionContext;
use crate::guest_memory::GuestMemory;
use crate::upload_pool::{UploadBufferPool, DEFAULT_PAGE_SIZE};
use crate::xenos::{gpu_swap, Endian, IndexFormat, PrimitiveType};

/// Largest vertex count served by the built-in index buffer.
pub const MAX_NON_INDEXED_VERTICES: u32 = 0xFFFF;

const FAN_SECTION_INDEX_COUNT: u32 = 3 * (MAX_NON_INDEXED_VERTICES - 2);
const QUAD_SECTION_INDEX_COUNT: u32 = 6 * (MAX_NON_INDEXED_VERTICES / 4);
const BUILTIN_INDEX_COUNT: u32 = FAN_SECTION_INDEX_COUNT + QUAD_SECTION_INDEX_COUNT;

/// Sections of the built-in index buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BuiltinIndexBuffer {
    TriangleFan,
    QuadList,
}

/// Handle to a converted index buffer in the current frame's arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConvertedIndices(usize);

/// Index source for the host draw produced from one guest draw.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ProcessedIndices {
    /// Host draw is non-indexed.
    None,
    /// Use the guest index data directly out of the shared memory mirror.
    Guest {
        base: u32,
        format: IndexFormat,
    },
    Builtin {
        buffer: BuiltinIndexBuffer,
    },
    Converted {
        handle: ConvertedIndices,
        format: IndexFormat,
    },
}

/// Result of processing one guest draw.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ProcessedDraw {
    pub topology: PrimitiveTopology,
    pub host_index_count: u32,
    pub indices: ProcessedIndices,
}

/// Guest index buffer parameters from the draw initiator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IndexBufferInfo {
    pub guest_base: u32,
    pub format: IndexFormat,
    pub endianness: Endian,
    /// Size of the guest buffer in bytes, from VGT_DMA_SIZE.
    pub length_bytes: u32,
}

#[derive(Debug, PartialEq)]
pub enum ProcessError {
    /// Fewer vertices than one full primitive; nothing to draw.
    Empty,
    /// The conversion required is not implemented; skip the draw.
    Unsupported(&'static str),
    /// Out of arena space or host allocation failed.
    Failed,
}

pub struct PrimitiveProcessor {
    device: Arc<dyn Device>,
    memory: Arc<GuestMemory>,

    builtin_buffer: BufferHandle,
    builtin_gpu_address: GpuAddress,
    /// Upload source, dropped once the first submission using it completes.
    builtin_upload: Option<BufferHandle>,
    builtin_upload_submission: Option<u64>,

    frame_pool: UploadBufferPool,
    /// GPU addresses of this frame's converted buffers, indexed by handle.
    frame_buffers: Vec<GpuAddress>,

    line_strip_reset_logged: bool,
    fan_reset_logged: bool,
}

impl PrimitiveProcessor {
    pub fn new(
        device: Arc<dyn Device>,
        memory: Arc<GuestMemory>,
    ) -> Result<PrimitiveProcessor, xenos_hal::HalError> {
        // Build the static expansions once on the CPU.
        let mut builtin = Vec::<u16>::with_capacity(BUILTIN_INDEX_COUNT as usize);
        // Triangle fans as lists, (v[i-1], v[i], v[0]).
        for i in 2..MAX_NON_INDEXED_VERTICES as u16 {
            builtin.extend_from_slice(&[i - 1, i, 0]);
        }
        // Quad lists as two triangles per quad.
        for quad in 0..(MAX_NON_INDEXED_VERTICES / 4) as u16 {
            let v = quad * 4;
            builtin.extend_from_slice(&[v, v + 1, v + 2, v, v + 2, v + 3]);
        }
        debug_assert_eq!(builtin.len(), BUILTIN_INDEX_COUNT as usize);

        let size = (builtin.len() * 2) as u64;
        let upload = device.create_buffer(&BufferDesc {
            size,
            usage: BufferUsage::empty(),
            memory: MemoryClass::Upload,
            initial_state: ResourceState::COPY_SOURCE,
            label: "builtin index upload",
        })?;
        device.write_buffer(upload, 0, bytemuck::cast_slice(&builtin))?;
        let buffer = device.create_buffer(&BufferDesc {
            size,
            usage: BufferUsage::INDEX,
            memory: MemoryClass::DeviceLocal,
            initial_state: ResourceState::COPY_DEST,
            label: "builtin index buffer",
        })?;
        let builtin_gpu_address = device.buffer_gpu_address(buffer);

        let frame_pool = UploadBufferPool::new(device.clone(), DEFAULT_PAGE_SIZE, "index arena");

        Ok(PrimitiveProcessor {
            device,
            memory,
            builtin_buffer: buffer,
            builtin_gpu_address,
            builtin_upload: Some(upload),
            builtin_upload_submission: None,
            frame_pool,
            frame_buffers: Vec::new(),
            line_strip_reset_logged: false,
            fan_reset_logged: false,
        })
    }

    /// Uploads the built-in buffer in the first open submission.
    pub fn begin_submission(&mut self, ctx: &mut SubmissionContext) {
        if let Some(upload) = self.builtin_upload {
            if self.builtin_upload_submission.is_none() {
                ctx.deferred.push(HostCommand::CopyResource {
                    dst: ResourceHandle::Buffer(self.builtin_buffer),
                    src: ResourceHandle::Buffer(upload),
                });
                ctx.push_transition_barrier(
                    ResourceHandle::Buffer(self.builtin_buffer),
                    ResourceState::COPY_DEST,
                    ResourceState::INDEX_BUFFER,
                    None,
                );
                self.builtin_upload_submission = Some(ctx.current_submission());
            }
        }
    }

    pub fn begin_frame(&mut self) {
        self.frame_buffers.clear();
    }

    pub fn end_frame(&mut self) {}

    pub fn completed_submission_updated(&mut self, completed_submission: u64) {
        if let (Some(upload), Some(submission)) =
            (self.builtin_upload, self.builtin_upload_submission)
        {
            if completed_submission >= submission {
                self.device.destroy_buffer(upload);
                self.builtin_upload = None;
            }
        }
    }

    pub fn completed_frame_updated(&mut self, completed_frame: u64) {
        self.frame_pool.completed_submission_updated(completed_frame);
    }

    pub fn clear_cache(&mut self) {
        self.frame_pool.clear_cache();
    }

    pub fn builtin_index_buffer_gpu_address(&self, buffer: BuiltinIndexBuffer) -> GpuAddress {
        let offset = match buffer {
            BuiltinIndexBuffer::TriangleFan => 0,
            BuiltinIndexBuffer::QuadList => (FAN_SECTION_INDEX_COUNT as u64) * 2,
        };
        self.builtin_gpu_address.offset(offset)
    }

    pub fn converted_index_buffer_gpu_address(&self, handle: ConvertedIndices) -> GpuAddress {
        self.frame_buffers[handle.0]
    }

    /// Allocates a writable converted index buffer in the current frame's
    /// arena and returns its handle. The caller fills it through the returned
    /// writer before the draw is recorded.
    pub fn request_host_converted_index_buffer_for_current_frame(
        &mut self,
        ctx: &SubmissionContext,
        format: IndexFormat,
        index_count: u32,
        _coalign_for_simd: bool,
        _original_address: u32,
    ) -> Option<(ConvertedIndices, crate::upload_pool::UploadAllocation)> {
        let size = (index_count as u64) * format.size_bytes() as u64;
        // 16-align all conversions so 16- and 32-bit data can share pages.
        let allocation = self.frame_pool.request(ctx.current_frame(), size, 16)?;
        let handle = ConvertedIndices(self.frame_buffers.len());
        self.frame_buffers.push(allocation.gpu_address);
        Some((handle, allocation))
    }

    /// Processes one guest draw into a host draw description. `reset_enabled`
    /// and `reset_index` come from PA_SU_SC_MODE_CNTL and
    /// VGT_MULTI_PRIM_IB_RESET_INDX.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        ctx: &mut SubmissionContext,
        primitive_type: PrimitiveType,
        index_count: u32,
        index_buffer: Option<IndexBufferInfo>,
        reset_enabled: bool,
        reset_index: u32,
    ) -> Result<ProcessedDraw, ProcessError> {
        if index_count < primitive_type.minimum_vertex_count() {
            return Err(ProcessError::Empty);
        }

        match primitive_type {
            PrimitiveType::TriangleFan | PrimitiveType::Polygon => {
                self.process_fan(ctx, index_count, index_buffer, reset_enabled)
            }
            PrimitiveType::LineLoop => self.process_line_loop(ctx, index_count, index_buffer),
            PrimitiveType::QuadList => self.process_quads(ctx, index_count, index_buffer),
            other => {
                let topology = match other {
                    PrimitiveType::PointList => PrimitiveTopology::PointList,
                    PrimitiveType::LineList => PrimitiveTopology::LineList,
                    PrimitiveType::LineStrip => PrimitiveTopology::LineStrip,
                    PrimitiveType::TriangleList | PrimitiveType::Rectangle => {
                        PrimitiveTopology::TriangleList
                    }
                    PrimitiveType::TriangleStrip => PrimitiveTopology::TriangleStrip,
                    _ => return Err(ProcessError::Unsupported("primitive type")),
                };
                if let Some(info) = index_buffer {
                    // Strips using a reset index other than the host one would
                    // need remapping; no titles are known to do this.
                    if reset_enabled
                        && matches!(
                            other,
                            PrimitiveType::LineStrip | PrimitiveType::TriangleStrip
                        )
                        && gpu_swap(reset_index, info.endianness) != info.format.host_reset_index()
                    {
                        if !self.line_strip_reset_logged {
                            self.line_strip_reset_logged = true;
                            tracing::warn!(
                                "strip with non-canonical reset index {reset_index:#x}, \
                                 drawing without remapping"
                            );
                        }
                    }
                    Ok(ProcessedDraw {
                        topology,
                        host_index_count: index_count,
                        indices: ProcessedIndices::Guest {
                            base: info.guest_base,
                            format: info.format,
                        },
                    })
                } else {
                    Ok(ProcessedDraw {
                        topology,
                        host_index_count: index_count,
                        indices: ProcessedIndices::None,
                    })
                }
            }
        }
    }

    fn process_fan(
        &mut self,
        ctx: &mut SubmissionContext,
        index_count: u32,
        index_buffer: Option<IndexBufferInfo>,
        reset_enabled: bool,
    ) -> Result<ProcessedDraw, ProcessError> {
        let host_index_count = 3 * (index_count - 2);
        let Some(info) = index_buffer else {
            if index_count > MAX_NON_INDEXED_VERTICES {
                return Err(ProcessError::Unsupported("fan too large for builtin"));
            }
            return Ok(ProcessedDraw {
                topology: PrimitiveTopology::TriangleList,
                host_index_count,
                indices: ProcessedIndices::Builtin {
                    buffer: BuiltinIndexBuffer::TriangleFan,
                },
            });
        };
        if reset_enabled {
            if !self.fan_reset_logged {
                self.fan_reset_logged = true;
                tracing::warn!("triangle fan with primitive reset is not supported, skipping");
            }
            return Err(ProcessError::Unsupported("fan with reset"));
        }
        let source = self.read_guest_indices(&info, index_count);
        let mut converted = Vec::with_capacity(host_index_count as usize);
        for i in 2..index_count as usize {
            converted.push(source[i - 1]);
            converted.push(source[i]);
            converted.push(source[0]);
        }
        let handle = self.write_converted(ctx, info.format, &converted)?;
        Ok(ProcessedDraw {
            topology: PrimitiveTopology::TriangleList,
            host_index_count,
            indices: ProcessedIndices::Converted {
                handle,
                format: info.format,
            },
        })
    }

    fn process_line_loop(
        &mut self,
        ctx: &mut SubmissionContext,
        index_count: u32,
        index_buffer: Option<IndexBufferInfo>,
    ) -> Result<ProcessedDraw, ProcessError> {
        // A loop is a strip plus one index closing back to the start.
        let host_index_count = index_count + 1;
        let (format, converted) = match index_buffer {
            Some(info) => {
                let mut indices = self.read_guest_indices(&info, index_count);
                indices.push(indices[0]);
                (info.format, indices)
            }
            None => {
                let format = if index_count <= 0xFFFF {
                    IndexFormat::Int16
                } else {
                    IndexFormat::Int32
                };
                let mut indices: Vec<u32> = (0..index_count).collect();
                indices.push(0);
                (format, indices)
            }
        };
        let handle = self.write_converted(ctx, format, &converted)?;
        Ok(ProcessedDraw {
            topology: PrimitiveTopology::LineStrip,
            host_index_count,
            indices: ProcessedIndices::Converted { handle, format },
        })
    }

    fn process_quads(
        &mut self,
        ctx: &mut SubmissionContext,
        index_count: u32,
        index_buffer: Option<IndexBufferInfo>,
    ) -> Result<ProcessedDraw, ProcessError> {
        let quad_count = index_count / 4;
        let host_index_count = quad_count * 6;
        let Some(info) = index_buffer else {
            if index_count > MAX_NON_INDEXED_VERTICES {
                return Err(ProcessError::Unsupported("quad list too large for builtin"));
            }
            return Ok(ProcessedDraw {
                topology: PrimitiveTopology::TriangleList,
                host_index_count,
                indices: ProcessedIndices::Builtin {
                    buffer: BuiltinIndexBuffer::QuadList,
                },
            });
        };
        let source = self.read_guest_indices(&info, index_count);
        let mut converted = Vec::with_capacity(host_index_count as usize);
        for quad in 0..quad_count as usize {
            let v = &source[quad * 4..quad * 4 + 4];
            converted.extend_from_slice(&[v[0], v[1], v[2], v[0], v[2], v[3]]);
        }
        let handle = self.write_converted(ctx, info.format, &converted)?;
        Ok(ProcessedDraw {
            topology: PrimitiveTopology::TriangleList,
            host_index_count,
            indices: ProcessedIndices::Converted {
                handle,
                format: info.format,
            },
        })
    }

    /// Reads and endian-swaps guest indices into host order.
    fn read_guest_indices(&self, info: &IndexBufferInfo, count: u32) -> Vec<u32> {
        let mut out = Vec::with_capacity(count as usize);
        match info.format {
            IndexFormat::Int16 => {
                self.memory
                    .with_slice(info.guest_base, count * 2, |bytes| {
                        for chunk in bytes.chunks_exact(2).take(count as usize) {
                            let mut value = u16::from_le_bytes([chunk[0], chunk[1]]);
                            if info.endianness == Endian::Swap8In16 {
                                value = value.swap_bytes();
                            }
                            out.push(value as u32);
                        }
                    });
            }
            IndexFormat::Int32 => {
                self.memory
                    .with_slice(info.guest_base, count * 4, |bytes| {
                        for chunk in bytes.chunks_exact(4).take(count as usize) {
                            let value =
                                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                            out.push(gpu_swap(value, info.endianness));
                        }
                    });
            }
        }
        out.resize(count as usize, 0);
        out
    }

    fn write_converted(
        &mut self,
        ctx: &mut SubmissionContext,
        format: IndexFormat,
        indices: &[u32],
    ) -> Result<ConvertedIndices, ProcessError> {
        let (handle, allocation) = self
            .request_host_converted_index_buffer_for_current_frame(
                ctx,
                format,
                indices.len() as u32,
                false,
                0,
            )
            .ok_or(ProcessError::Failed)?;
        match format {
            IndexFormat::Int16 => {
                let narrowed: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
                self.frame_pool
                    .write(&allocation, bytemuck::cast_slice(&narrowed));
            }
            IndexFormat::Int32 => {
                self.frame_pool.write(&allocation, bytemuck::cast_slice(indices));
            }
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_processor::SubmissionContext;
    use crate::config::GpuConfig;
    use xenos_hal::testing::MockGpu;
    use xenos_hal::Provider;

    fn setup() -> (
        Arc<MockGpu>,
        Arc<GuestMemory>,
        PrimitiveProcessor,
        SubmissionContext,
    ) {
        let gpu = MockGpu::new();
        let memory = Arc::new(GuestMemory::new());
        let ctx =
            SubmissionContext::new(Provider::new(gpu.clone(), gpu.clone()), GpuConfig::default())
                .unwrap();
        let pp = PrimitiveProcessor::new(gpu.clone(), memory.clone()).unwrap();
        (gpu, memory, pp, ctx)
    }

    #[test]
    fn builtin_buffer_starts_with_fan_expansion() {
        let (gpu, _memory, pp, _ctx) = setup();
        // (v1, v2, v0), (v2, v3, v0) pattern at the front of the fan section.
        let bytes = gpu.buffer_bytes(pp.builtin_buffer, 0, 12);
        let upload = pp.builtin_upload.unwrap();
        let bytes_upload = gpu.buffer_bytes(upload, 0, 12);
        let indices: &[u16] = bytemuck::cast_slice(&bytes_upload);
        assert_eq!(indices, &[1, 2, 0, 2, 3, 0]);
        // Device-local copy not populated until the first submission replays.
        let _ = bytes;
    }

    #[test]
    fn indexed_triangle_fan_matches_expected_expansion() {
        let (gpu, memory, mut pp, mut ctx) = setup();
        let indices: [u16; 6] = [0, 1, 2, 3, 4, 5];
        memory.write(0x2000, bytemuck::cast_slice(&indices));

        let draw = pp
            .process(
                &mut ctx,
                PrimitiveType::TriangleFan,
                6,
                Some(IndexBufferInfo {
                    guest_base: 0x2000,
                    format: IndexFormat::Int16,
                    endianness: Endian::None,
                    length_bytes: 12,
                }),
                false,
                0xFFFF,
            )
            .unwrap();

        assert_eq!(draw.topology, PrimitiveTopology::TriangleList);
        assert_eq!(draw.host_index_count, 12);
        let ProcessedIndices::Converted { handle, format } = draw.indices else {
            panic!("expected converted indices, got {:?}", draw.indices);
        };
        assert_eq!(format, IndexFormat::Int16);

        let address = pp.converted_index_buffer_gpu_address(handle);
        let (buffer, offset) = gpu.resolve_address(address);
        let bytes = gpu.buffer_bytes(buffer, offset, 24);
        let host: &[u16] = bytemuck::cast_slice(&bytes);
        assert_eq!(host, &[1, 2, 0, 2, 3, 0, 3, 4, 0, 4, 5, 0]);
    }

    #[test]
    fn non_indexed_fan_below_three_vertices_is_empty() {
        let (_gpu, _memory, mut pp, mut ctx) = setup();
        let result = pp.process(&mut ctx, PrimitiveType::TriangleFan, 2, None, false, 0xFFFF);
        assert_eq!(result.unwrap_err(), ProcessError::Empty);
    }

    #[test]
    fn non_indexed_fan_uses_builtin_section() {
        let (_gpu, _memory, mut pp, mut ctx) = setup();
        let draw = pp
            .process(&mut ctx, PrimitiveType::TriangleFan, 5, None, false, 0xFFFF)
            .unwrap();
        assert_eq!(draw.host_index_count, 9);
        assert_eq!(
            draw.indices,
            ProcessedIndices::Builtin {
                buffer: BuiltinIndexBuffer::TriangleFan
            }
        );
    }

    #[test]
    fn line_loop_closes_back_to_the_first_index() {
        let (gpu, memory, mut pp, mut ctx) = setup();
        let indices: [u16; 3] = [7, 8, 9];
        memory.write(0x3000, bytemuck::cast_slice(&indices));
        let draw = pp
            .process(
                &mut ctx,
                PrimitiveType::LineLoop,
                3,
                Some(IndexBufferInfo {
                    guest_base: 0x3000,
                    format: IndexFormat::Int16,
                    endianness: Endian::None,
                    length_bytes: 6,
                }),
                false,
                0xFFFF,
            )
            .unwrap();
        assert_eq!(draw.topology, PrimitiveTopology::LineStrip);
        assert_eq!(draw.host_index_count, 4);
        let ProcessedIndices::Converted { handle, .. } = draw.indices else {
            panic!("expected conversion");
        };
        let (buffer, offset) = gpu.resolve_address(pp.converted_index_buffer_gpu_address(handle));
        let bytes = gpu.buffer_bytes(buffer, offset, 8);
        let host: &[u16] = bytemuck::cast_slice(&bytes);
        assert_eq!(host, &[7, 8, 9, 7]);
    }

    #[test]
    fn swapped_16bit_indices_are_unswapped_during_conversion() {
        let (gpu, memory, mut pp, mut ctx) = setup();
        // Guest stores byte-swapped values; write them raw.
        let indices: [u16; 4] = [
            1u16.swap_bytes(),
            2u16.swap_bytes(),
            3u16.swap_bytes(),
            4u16.swap_bytes(),
        ];
        memory.write(0x5000, bytemuck::cast_slice(&indices));
        let draw = pp
            .process(
                &mut ctx,
                PrimitiveType::TriangleFan,
                4,
                Some(IndexBufferInfo {
                    guest_base: 0x5000,
                    format: IndexFormat::Int16,
                    endianness: Endian::Swap8In16,
                    length_bytes: 8,
                }),
                false,
                0xFFFF,
            )
            .unwrap();
        let ProcessedIndices::Converted { handle, .. } = draw.indices else {
            panic!("expected conversion");
        };
        let (buffer, offset) = gpu.resolve_address(pp.converted_index_buffer_gpu_address(handle));
        let bytes = gpu.buffer_bytes(buffer, offset, 12);
        let host: &[u16] = bytemuck::cast_slice(&bytes);
        assert_eq!(host, &[2, 3, 1, 3, 4, 1]);
    }

    #[test]
    fn builtin_upload_is_released_after_completion() {
        let (_gpu, _memory, mut pp, mut ctx) = setup();
        pp.begin_submission(&mut ctx);
        assert!(pp.builtin_upload.is_some());
        pp.completed_submission_updated(ctx.current_submission());
        assert!(pp.builtin_upload.is_none());
    }
}
