//! Helio Lightmapper - GPU lightmap baking on wgpu
//!
//! Bakes the lightmap tiles of a [`LevelMesh`] in four passes over a
//! scratch bake image and copies the results into a persistent layered
//! atlas:
//!
//! - Raytrace: one indexed draw per tile surface, BVH traced per texel
//! - Resolve: fills uncovered border texels from their neighbours
//! - Blur: separable horizontal/vertical filter inside each tile
//! - Copy: resamples every tile into its atlas slot
//!
//! Tile packing, selection and transform math live in `helio-lightmap`.

pub mod atlas;
pub mod bake_image;
pub mod device;
pub mod level_buffers;
pub mod passes;
pub mod pipeline;
pub mod resources;
pub mod textures;

mod lightmapper;

pub use atlas::LightmapAtlas;
pub use bake_image::LightmapBakeImage;
pub use device::{DeviceCapabilities, DrawSubmission, LightmapRenderDevice};
pub use lightmapper::{BakeReport, Lightmapper};
pub use textures::{HwTexture, TextureManager, TextureRequest};

pub use helio_lightmap::{LevelMesh, LightmapperConfig, RaytraceFlags, TileId};

/// Texel format of the bake image and the atlas
pub const LIGHTMAP_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

/// Bytes per texel of [`LIGHTMAP_FORMAT`]
pub const LIGHTMAP_TEXEL_BYTES: u32 = 8;

/// Result type for lightmapper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while baking
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device cannot run the lightmapper at all; the renderer must shut down
    #[error("Fatal device error: {0}")]
    Fatal(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Readback error: {0}")]
    Readback(String),

    #[error("Texture upload expected {expected} bytes, got {actual}")]
    InvalidUpload { expected: usize, actual: usize },

    #[error("WGPU error: {0}")]
    Wgpu(String),

    #[error(transparent)]
    Core(#[from] helio_lightmap::Error),
}

impl From<wgpu::Error> for Error {
    fn from(err: wgpu::Error) -> Self {
        Error::Wgpu(err.to_string())
    }
}

impl From<wgpu::BufferAsyncError> for Error {
    fn from(err: wgpu::BufferAsyncError) -> Self {
        Error::Readback(err.to_string())
    }
}
