//! GPU command-processor core for an Xbox 360 emulator back end.
//!
//! Ingests guest command rings (PM4 packets and register writes targeting the
//! Adreno/Xenos register file), translates them into host GPU work through
//! the `xenos-hal` abstraction, and maintains the resource caches that make
//! repeated guest operations cheap: the shared guest-memory mirror, the
//! primitive processor, the EDRAM render-target cache and the texture cache.
//!
//! Shader translation and the host GPU API itself are external collaborators;
//! the core consumes translated shader blobs and speaks to `xenos-hal`.

pub mod bindings;
pub mod command_processor;
pub mod config;
pub mod deferred;
pub mod guest_memory;
pub mod pipeline_cache;
pub mod pm4;
pub mod primitive_processor;
pub mod regs;
pub mod render_target_cache;
pub mod ring;
pub mod shader;
pub mod shared_memory;
pub mod texture_cache;
pub mod upload_pool;
pub mod xenos;

pub use command_processor::{CommandProcessor, Presenter, SubmissionContext};
pub use config::GpuConfig;
pub use guest_memory::GuestMemory;
pub use shader::{ShaderTranslator, TranslatedShader};
