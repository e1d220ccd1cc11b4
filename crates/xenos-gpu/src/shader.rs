//! Interface to the external guest-shader translator.
//!
//! Translation from Xenos microcode to host bytecode happens outside the
//! core; draws consume already-translated blobs plus the reflected binding
//! layout needed to build root signatures and descriptor tables.

use std::sync::Arc;

use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::xenos::TextureDimension;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ShaderType {
    Vertex,
    Pixel,
}

/// One texture binding reflected out of a translated shader.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TextureBinding {
    /// Texture fetch constant slot (0..31).
    pub fetch_constant: u32,
    pub dimension: TextureDimension,
    /// Whether the shader fetches the signed host view.
    pub is_signed: bool,
}

/// One sampler binding reflected out of a translated shader.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SamplerBinding {
    pub fetch_constant: u32,
}

/// One memexport stream reflected out of a translated shader.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemExportStream {
    /// Float-constant index holding the stream descriptor (eA).
    pub stream_constant: u32,
    /// Bits per exported element, from the eA format field.
    pub element_bits: u32,
}

#[derive(Clone, Debug)]
pub struct TranslatedShader {
    pub shader_type: ShaderType,
    /// Identity of the source microcode, used in pipeline cache keys.
    pub ucode_digest: u64,
    pub host_blob: Arc<Vec<u8>>,
    pub texture_bindings: Vec<TextureBinding>,
    pub sampler_bindings: Vec<SamplerBinding>,
    /// Vertex fetch constant sub-slots the shader reads streams from.
    pub vertex_fetch_slots: Vec<u32>,
    pub memexport_streams: Vec<MemExportStream>,
    pub uses_memexport: bool,
}

impl TranslatedShader {
    /// Mask over texture fetch constant slots used by this shader.
    pub fn used_texture_mask(&self) -> u32 {
        self.texture_bindings
            .iter()
            .fold(0, |mask, binding| mask | (1 << binding.fetch_constant))
    }
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("malformed microcode")]
    MalformedUcode,
    #[error("unsupported instruction at dword {0}")]
    UnsupportedInstruction(u32),
}

pub trait ShaderTranslator: Send {
    fn translate(
        &self,
        shader_type: ShaderType,
        ucode: &[u32],
    ) -> Result<TranslatedShader, TranslateError>;
}

/// Digest used to identify microcode across runs (pipeline cache keys).
pub fn ucode_digest(ucode: &[u32]) -> u64 {
    xxh3_64(bytemuck::cast_slice(ucode))
}

/// Translator producing empty host blobs with no bindings. Used by the trace
/// dump tool, where draws are executed for their memory side effects only,
/// and by tests.
pub struct NullShaderTranslator;

impl ShaderTranslator for NullShaderTranslator {
    fn translate(
        &self,
        shader_type: ShaderType,
        ucode: &[u32],
    ) -> Result<TranslatedShader, TranslateError> {
        Ok(TranslatedShader {
            shader_type,
            ucode_digest: ucode_digest(ucode),
            host_blob: Arc::new(Vec::new()),
            texture_bindings: Vec::new(),
            sampler_bindings: Vec::new(),
            vertex_fetch_slots: Vec::new(),
            memexport_streams: Vec::new(),
            uses_memexport: false,
        })
    }
}
