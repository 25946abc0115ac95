use crate::bake::RaytraceFlags;

/// Configuration builder for the lightmapper
#[derive(Debug, Clone)]
pub struct LightmapperConfig {
    /// Edge length of the scratch bake image
    pub bake_image_size: u32,
    /// Texels kept between tiles (and at the edges) of the bake image
    pub tile_spacing: u32,
    /// Upper bound on atlas array layers when packing a level
    pub max_atlas_layers: u32,
    pub raytrace: RaytraceFlags,
    /// Issue bakes as indirect draws when the device allows it
    pub use_indirect_draws: bool,
    /// Background (initial) bakes per frame
    pub max_deferred_tiles_per_frame: usize,
    /// Frames a tile must stay unseen before its atlas slot can be reclaimed
    pub eviction_age: u64,
    /// Pending upload bytes that force a wait on the GPU
    pub staging_budget_bytes: u64,
    /// Prepare texture data on the worker thread
    pub async_textures: bool,
    /// Maximum distance of ambient occlusion rays
    pub ao_distance: f32,
    /// Rays per texel for soft shadows, AO and bounce
    pub sample_count: u32,
    /// Constant light added to every texel
    pub ambient: f32,
}

impl Default for LightmapperConfig {
    fn default() -> Self {
        Self {
            bake_image_size: 2048,
            tile_spacing: 3,
            max_atlas_layers: 16,
            raytrace: RaytraceFlags::SUNLIGHT | RaytraceFlags::AMBIENT_OCCLUSION,
            use_indirect_draws: true,
            max_deferred_tiles_per_frame: 64,
            eviction_age: 600,
            staging_budget_bytes: 64 * 1024 * 1024,
            async_textures: false,
            ao_distance: 128.0,
            sample_count: 8,
            ambient: 0.0,
        }
    }
}

impl LightmapperConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bake_image_size(mut self, size: u32) -> Self {
        self.bake_image_size = size.clamp(16, 8192);
        self
    }

    pub fn with_max_atlas_layers(mut self, layers: u32) -> Self {
        self.max_atlas_layers = layers.clamp(1, 256);
        self
    }

    pub fn with_raytrace(mut self, flags: RaytraceFlags) -> Self {
        self.raytrace = flags;
        self
    }

    pub fn with_indirect_draws(mut self, enabled: bool) -> Self {
        self.use_indirect_draws = enabled;
        self
    }

    pub fn with_max_deferred_tiles_per_frame(mut self, count: usize) -> Self {
        self.max_deferred_tiles_per_frame = count;
        self
    }

    pub fn with_eviction_age(mut self, frames: u64) -> Self {
        self.eviction_age = frames;
        self
    }

    pub fn with_staging_budget(mut self, bytes: u64) -> Self {
        self.staging_budget_bytes = bytes.max(1);
        self
    }

    pub fn with_async_textures(mut self, enabled: bool) -> Self {
        self.async_textures = enabled;
        self
    }

    pub fn with_ao_distance(mut self, distance: f32) -> Self {
        self.ao_distance = distance.max(0.0);
        self
    }

    pub fn with_sample_count(mut self, count: u32) -> Self {
        self.sample_count = count.clamp(1, 256);
        self
    }

    pub fn with_ambient(mut self, ambient: f32) -> Self {
        self.ambient = ambient.max(0.0);
        self
    }
}
