//! Runtime configuration of the GPU core.

/// Options toggled by the outer emulator. Defaults match shipping behavior.
#[derive(Clone, Debug)]
pub struct GpuConfig {
    /// Use a reserved (sparse) buffer for the shared memory mirror. Disabling
    /// this creates the full 512 MiB committed buffer up front, which greatly
    /// increases video memory usage but works with hosts lacking tiled
    /// resources.
    pub tiled_shared_memory: bool,
    /// Copy every resolve result back to the CPU and into guest memory.
    /// Debugging aid; slow.
    pub readback_resolve: bool,
    /// Overrides the initial validity of shared-memory pages. `None` keeps
    /// pages invalid until first upload.
    pub clear_memory_page_state: Option<bool>,
    /// Integer resolution scale applied to EDRAM render targets and resolved
    /// textures.
    pub resolution_scale: (u32, u32),
    /// Adjust resolve coordinates by half a pixel.
    pub half_pixel_offset: bool,
    /// On scaled resolves, duplicate the top/left subpixel to close the seam
    /// introduced by the half-pixel offset.
    pub resolution_scale_resolve_edge_clamp: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        GpuConfig {
            tiled_shared_memory: true,
            readback_resolve: false,
            clear_memory_page_state: None,
            resolution_scale: (1, 1),
            half_pixel_offset: true,
            resolution_scale_resolve_edge_clamp: true,
        }
    }
}

impl GpuConfig {
    pub fn resolution_scaled(&self) -> bool {
        self.resolution_scale != (1, 1)
    }
}
