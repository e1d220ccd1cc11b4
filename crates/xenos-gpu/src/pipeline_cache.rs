//! Graphics pipeline cache with asynchronous creation and per-title
//! persistence.
//!
//! Pipelines are keyed by the shader pair identity plus the fixed-function
//! and attachment state baked into them. Creation may complete after the
//! draw that first referenced the pipeline; draws record a [`GuestPipeline`]
//! token resolved at deferred-list replay, and are skipped while creation is
//! pending or after it failed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use xenos_hal::{
    Device, Format, GraphicsPipelineDesc, GraphicsPipelineState, PipelineHandle, PipelineStatus,
    PrimitiveTopology, RootSignatureHandle, ShaderCode,
};

use crate::shader::TranslatedShader;

/// Opaque token for a pipeline with possibly deferred creation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GuestPipeline(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PipelineKey {
    pub vertex_digest: u64,
    /// Zero for depth-only draws.
    pub pixel_digest: u64,
    pub tessellated: bool,
    pub topology: PrimitiveTopology,
    pub color_formats: [Option<Format>; 4],
    pub depth_format: Option<Format>,
    pub state: GraphicsPipelineState,
}

// GraphicsPipelineState has no Hash impl upstream; hash the key through its
// debug-stable fields instead.
impl std::hash::Hash for PipelineKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.vertex_digest.hash(state);
        self.pixel_digest.hash(state);
        self.tessellated.hash(state);
        std::mem::discriminant(&self.topology).hash(state);
        for format in self.color_formats.iter().chain([&self.depth_format]) {
            format.map(|f| f as u32 as u64).unwrap_or(u64::MAX).hash(state);
        }
        self.state.color_write_masks.hash(state);
        self.state.depth_write.hash(state);
        self.state.depth_test.hash(state);
    }
}

struct PipelineEntry {
    token: GuestPipeline,
    host: PipelineHandle,
    stored: bool,
}

/// Index of persisted pipeline blobs under the per-title cache root.
#[derive(Serialize, Deserialize, Default)]
struct StorageIndex {
    entries: Vec<StorageEntry>,
}

#[derive(Serialize, Deserialize)]
struct StorageEntry {
    key_digest: u64,
    blob_file: String,
}

pub struct PipelineCache {
    device: Arc<dyn Device>,
    pipelines: HashMap<PipelineKey, PipelineEntry>,
    by_token: HashMap<GuestPipeline, PipelineHandle>,
    next_token: u64,
    storage_root: Option<PathBuf>,
    storage_index: StorageIndex,
}

impl PipelineCache {
    pub fn new(device: Arc<dyn Device>) -> PipelineCache {
        PipelineCache {
            device,
            pipelines: HashMap::new(),
            by_token: HashMap::new(),
            next_token: 1,
            storage_root: None,
            storage_index: StorageIndex::default(),
        }
    }

    /// Opens (or creates) the pipeline blob store for one title.
    pub fn initialize_storage(&mut self, cache_root: &std::path::Path, title_id: u32) {
        let root = cache_root.join(format!("{title_id:08X}")).join("pipelines");
        if let Err(err) = std::fs::create_dir_all(&root) {
            tracing::warn!("pipeline storage unavailable: {err}");
            return;
        }
        let index_path = root.join("index.json");
        self.storage_index = std::fs::read(&index_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        tracing::info!(
            entries = self.storage_index.entries.len(),
            "pipeline storage opened"
        );
        self.storage_root = Some(root);
    }

    fn key_digest(key: &PipelineKey) -> u64 {
        use std::hash::{Hash, Hasher};
        struct XxHasher(xxhash_rust::xxh3::Xxh3);
        impl Hasher for XxHasher {
            fn finish(&self) -> u64 {
                self.0.digest()
            }
            fn write(&mut self, bytes: &[u8]) {
                self.0.update(bytes);
            }
        }
        let mut hasher = XxHasher(xxhash_rust::xxh3::Xxh3::new());
        key.hash(&mut hasher);
        std::hash::Hasher::finish(&hasher)
    }

    /// Finds or asynchronously creates the pipeline for a draw. Returns the
    /// token recorded into the deferred list.
    pub fn get_or_create_graphics(
        &mut self,
        key: PipelineKey,
        vertex_shader: &TranslatedShader,
        pixel_shader: Option<&TranslatedShader>,
        root_signature: RootSignatureHandle,
    ) -> Option<GuestPipeline> {
        if let Some(entry) = self.pipelines.get(&key) {
            return Some(entry.token);
        }
        let desc = GraphicsPipelineDesc {
            vertex_shader: ShaderCode::Translated(vertex_shader.host_blob.clone()),
            pixel_shader: pixel_shader.map(|ps| ShaderCode::Translated(ps.host_blob.clone())),
            root_signature,
            color_formats: key.color_formats,
            depth_format: key.depth_format,
            topology: key.topology,
            state: key.state,
            label: "guest pipeline",
        };
        let host = match self.device.create_graphics_pipeline(&desc) {
            Ok(host) => host,
            Err(err) => {
                // Not fatal; the affected draws are skipped.
                tracing::warn!("pipeline creation failed: {err}");
                return None;
            }
        };
        let token = GuestPipeline(self.next_token);
        self.next_token += 1;
        self.pipelines.insert(
            key,
            PipelineEntry {
                token,
                host,
                stored: false,
            },
        );
        self.by_token.insert(token, host);
        Some(token)
    }

    /// Resolves a token at replay time. `None` while pending or failed.
    pub fn resolve(&self, token: GuestPipeline) -> Option<PipelineHandle> {
        let host = *self.by_token.get(&token)?;
        match self.device.pipeline_status(host) {
            PipelineStatus::Ready => Some(host),
            PipelineStatus::Pending | PipelineStatus::Failed => None,
        }
    }

    /// Whether creation requests are still in flight; ending a submission
    /// while pipelines are pending would stall the replay on their
    /// completion.
    pub fn has_pending_pipelines(&self) -> bool {
        self.pipelines
            .values()
            .any(|entry| self.device.pipeline_status(entry.host) == PipelineStatus::Pending)
    }

    /// Persists blobs of pipelines that finished compiling.
    pub fn store_completed_pipelines(&mut self) {
        let Some(root) = self.storage_root.clone() else {
            return;
        };
        let mut index_dirty = false;
        for (key, entry) in self.pipelines.iter_mut() {
            if entry.stored {
                continue;
            }
            if self.device.pipeline_status(entry.host) != PipelineStatus::Ready {
                continue;
            }
            let Some(blob) = self.device.pipeline_blob(entry.host) else {
                entry.stored = true;
                continue;
            };
            let digest = Self::key_digest(key);
            let blob_file = format!("{digest:016x}.bin");
            if std::fs::write(root.join(&blob_file), &blob).is_ok() {
                self.storage_index.entries.push(StorageEntry {
                    key_digest: digest,
                    blob_file,
                });
                index_dirty = true;
            }
            entry.stored = true;
        }
        if index_dirty {
            if let Ok(bytes) = serde_json::to_vec_pretty(&self.storage_index) {
                let _ = std::fs::write(root.join("index.json"), bytes);
            }
        }
    }

    pub fn clear_cache(&mut self) {
        for (_, entry) in self.pipelines.drain() {
            self.device.destroy_pipeline(entry.host);
        }
        self.by_token.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::{NullShaderTranslator, ShaderTranslator, ShaderType};
    use xenos_hal::testing::MockGpu;
    use xenos_hal::RootSignatureDesc;

    fn key(vertex_digest: u64) -> PipelineKey {
        PipelineKey {
            vertex_digest,
            pixel_digest: 0,
            tessellated: false,
            topology: PrimitiveTopology::TriangleList,
            color_formats: [Some(Format::R8G8B8A8Unorm), None, None, None],
            depth_format: None,
            state: GraphicsPipelineState::default(),
        }
    }

    fn setup() -> (std::sync::Arc<MockGpu>, PipelineCache, TranslatedShader, RootSignatureHandle)
    {
        let gpu = MockGpu::new();
        let cache = PipelineCache::new(gpu.clone());
        let shader = NullShaderTranslator
            .translate(ShaderType::Vertex, &[0, 1, 2])
            .unwrap();
        let signature = gpu
            .create_root_signature(&RootSignatureDesc {
                parameters: vec![],
                label: "test",
            })
            .unwrap();
        (gpu, cache, shader, signature)
    }

    #[test]
    fn same_key_returns_the_same_token() {
        let (_gpu, mut cache, shader, signature) = setup();
        let a = cache
            .get_or_create_graphics(key(7), &shader, None, signature)
            .unwrap();
        let b = cache
            .get_or_create_graphics(key(7), &shader, None, signature)
            .unwrap();
        assert_eq!(a, b);
        let c = cache
            .get_or_create_graphics(key(8), &shader, None, signature)
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn pending_pipelines_do_not_resolve() {
        let (gpu, mut cache, shader, signature) = setup();
        gpu.set_deferred_pipelines(true);
        let token = cache
            .get_or_create_graphics(key(1), &shader, None, signature)
            .unwrap();
        assert_eq!(cache.resolve(token), None);
        assert!(cache.has_pending_pipelines());

        gpu.complete_pending_pipelines();
        assert!(cache.resolve(token).is_some());
        assert!(!cache.has_pending_pipelines());
    }

    #[test]
    fn completed_pipelines_are_persisted_with_an_index() {
        let (_gpu, mut cache, shader, signature) = setup();
        let dir = tempfile::tempdir().unwrap();
        cache.initialize_storage(dir.path(), 0x4D53_0819);
        cache
            .get_or_create_graphics(key(1), &shader, None, signature)
            .unwrap();
        cache.store_completed_pipelines();

        let root = dir.path().join("4D530819").join("pipelines");
        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(root.join("index.json")).unwrap()).unwrap();
        let entries = index["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        let blob_file = entries[0]["blob_file"].as_str().unwrap();
        assert!(root.join(blob_file).exists());

        // A second pass stores nothing new.
        cache.store_completed_pipelines();
        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(root.join("index.json")).unwrap()).unwrap();
        assert_eq!(index["entries"].as_array().unwrap().len(), 1);
    }
}
