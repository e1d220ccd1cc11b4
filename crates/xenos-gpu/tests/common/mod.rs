//! Shared harness for the end-to-end tests: a mock host, guest memory, a
//! shader translator stub with configurable reflection, and PM4 stream
//! builders.
#![allow(dead_code)]

use std::sync::Arc;

use xenos_gpu::pm4::{type3_header, Type3Opcode};
use xenos_gpu::shader::{
    MemExportStream, SamplerBinding, ShaderTranslator, ShaderType, TextureBinding,
    TranslateError, TranslatedShader,
};
use xenos_gpu::xenos::TextureDimension;
use xenos_gpu::{regs, CommandProcessor, GpuConfig, GuestMemory};
use xenos_hal::testing::MockGpu;

/// Translator producing fixed reflection for every shader, so draws exercise
/// vertex fetches, textures and samplers without real microcode.
#[derive(Default, Clone)]
pub struct StubTranslator {
    pub vertex_fetch_slots: Vec<u32>,
    pub texture_slots: Vec<(u32, TextureDimension, bool)>,
    pub sampler_slots: Vec<u32>,
    /// (stream constant, element bits) memexport streams of the vertex shader.
    pub memexport_streams: Vec<(u32, u32)>,
}

impl ShaderTranslator for StubTranslator {
    fn translate(
        &self,
        shader_type: ShaderType,
        ucode: &[u32],
    ) -> Result<TranslatedShader, TranslateError> {
        let pixel = shader_type == ShaderType::Pixel;
        Ok(TranslatedShader {
            shader_type,
            ucode_digest: xenos_gpu::shader::ucode_digest(ucode),
            host_blob: Arc::new(vec![0xAB; 16]),
            texture_bindings: if pixel {
                self.texture_slots
                    .iter()
                    .map(|&(fetch_constant, dimension, is_signed)| TextureBinding {
                        fetch_constant,
                        dimension,
                        is_signed,
                    })
                    .collect()
            } else {
                Vec::new()
            },
            sampler_bindings: if pixel {
                self.sampler_slots
                    .iter()
                    .map(|&fetch_constant| SamplerBinding { fetch_constant })
                    .collect()
            } else {
                Vec::new()
            },
            vertex_fetch_slots: if pixel {
                Vec::new()
            } else {
                self.vertex_fetch_slots.clone()
            },
            memexport_streams: if pixel {
                Vec::new()
            } else {
                self.memexport_streams
                    .iter()
                    .map(|&(stream_constant, element_bits)| MemExportStream {
                        stream_constant,
                        element_bits,
                    })
                    .collect()
            },
            uses_memexport: !pixel && !self.memexport_streams.is_empty(),
        })
    }
}

pub struct TestGpu {
    pub gpu: Arc<MockGpu>,
    pub memory: Arc<GuestMemory>,
    pub cp: CommandProcessor,
}

pub fn setup_with(translator: StubTranslator, config: GpuConfig) -> TestGpu {
    let gpu = MockGpu::new();
    let memory = Arc::new(GuestMemory::new());
    let cp = CommandProcessor::new(
        gpu.provider(),
        memory.clone(),
        Box::new(translator),
        config,
    )
    .unwrap();
    TestGpu { gpu, memory, cp }
}

pub fn setup(translator: StubTranslator) -> TestGpu {
    setup_with(translator, GpuConfig::default())
}

impl TestGpu {
    /// Minimal register state for color/depth drawing: 1280-pixel pitch,
    /// RT0 of guest format 8_8_8_8 at EDRAM base 0, scissor to 1280x720.
    pub fn set_default_draw_state(&mut self) {
        self.cp.write_register(regs::RB_MODECONTROL, 4);
        self.cp.write_register(regs::RB_SURFACE_INFO, 1280);
        self.cp.write_register(regs::RB_COLOR_INFO, 0);
        self.cp.write_register(regs::RB_COLOR_MASK, 0xF);
        self.cp.write_register(regs::RB_DEPTHCONTROL, 0);
        self.set_scissor(1280, 720);
    }

    pub fn set_scissor(&mut self, width: u32, height: u32) {
        self.cp
            .write_register(regs::PA_SC_WINDOW_SCISSOR_TL, 1 << 31);
        self.cp
            .write_register(regs::PA_SC_WINDOW_SCISSOR_BR, width | (height << 16));
    }

    /// Loads stub vertex and pixel shaders through IM_LOAD_IMMEDIATE packets.
    pub fn load_stub_shaders(&mut self) {
        let stream = [
            type3_header(Type3Opcode::ImLoadImmediate, 4),
            0, // vertex
            2, // 2 ucode dwords
            0x1234_5678,
            0x9ABC_DEF0,
            type3_header(Type3Opcode::ImLoadImmediate, 4),
            1, // pixel
            2,
            0x1111_2222,
            0x3333_4444,
        ];
        self.execute_stream(0x00F0_0000, &stream);
    }

    /// Writes a packet stream into guest memory and executes it.
    pub fn execute_stream(&mut self, address: u32, dwords: &[u32]) {
        for (i, dword) in dwords.iter().enumerate() {
            self.memory.write_u32(address + (i as u32) * 4, *dword);
        }
        self.cp.execute_packets(address, dwords.len() as u32);
    }

    /// Writes one texture fetch constant into slot `slot`.
    pub fn write_texture_fetch_constant(&mut self, slot: u32, dwords: [u32; 6]) {
        for (i, dword) in dwords.iter().enumerate() {
            self.cp
                .write_register(regs::FETCH_CONSTANT_BASE + slot * 6 + i as u32, *dword);
        }
    }

    /// Writes one vertex fetch constant (two dwords) into sub-slot `slot`.
    pub fn write_vertex_fetch_constant(&mut self, slot: u32, address: u32, size_dwords: u32) {
        self.cp.write_register(
            regs::FETCH_CONSTANT_BASE + slot * 2,
            xenos_gpu::xenos::FETCH_CONSTANT_TYPE_VERTEX | (address & !0x3),
        );
        self.cp
            .write_register(regs::FETCH_CONSTANT_BASE + slot * 2 + 1, size_dwords << 2);
    }
}

/// A 2D texture fetch constant for the given geometry.
pub fn texture_fetch_2d(
    base_page: u32,
    width: u32,
    height: u32,
    format: xenos_gpu::xenos::TextureFormat,
    tiled: bool,
) -> [u32; 6] {
    let mut dwords = [0u32; 6];
    dwords[0] = xenos_gpu::xenos::FETCH_CONSTANT_TYPE_TEXTURE | ((tiled as u32) << 31);
    dwords[1] = (base_page << 12) | (format as u32);
    dwords[2] = (width - 1) | ((height - 1) << 13);
    dwords[5] = 1 << 9; // 2D
    dwords
}
