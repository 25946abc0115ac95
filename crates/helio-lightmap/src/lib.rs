//! Helio Lightmap - CPU side of the lightmap baker
//!
//! Everything here is GPU-free so it can be unit tested without an adapter:
//!
//! - Tile transform math (world <-> texel-local <-> atlas UV)
//! - Shelf rect packer used for both the scratch bake image and the atlas
//! - Per-frame tile selection with bake priorities and capacity limits
//! - Bake plan data (raytrace constants, draw commands, copy descriptors)
//! - Level mesh input model with a flattened BVH for the raytracer
//! - Upload token queue for worker-thread texture preparation
//! - On-disk lightmap cache
//!
//! The wgpu backend lives in `helio-lightmapper`.

pub mod accel;
pub mod atlas;
pub mod bake;
pub mod bounds;
pub mod cache;
pub mod config;
pub mod level;
pub mod packer;
pub mod selector;
pub mod tile;
pub mod upload;

mod error;

pub use accel::{Bvh, BvhNode, BvhTriangle};
pub use atlas::AtlasAllocator;
pub use bake::{
    BakePlan, BakeStage, BakeStageTracker, BakeUniforms, CopyList, CopyTileInfo,
    DrawIndexedCommand, LightmapCopyPC, LightmapRaytracePC, RaytraceFlags, UniformRing,
    COPY_BUFFER_CAPACITY, DRAW_BUFFER_CAPACITY, UNIFORM_RING_SLOTS,
};
pub use bounds::Aabb;
pub use cache::LightmapCache;
pub use config::LightmapperConfig;
pub use error::{Error, Result};
pub use level::{
    LevelLight, LevelMesh, LevelSurface, LevelVertex, LightmapTextureInfo, SunLight, SurfaceDesc,
};
pub use packer::{PackedRect, PackerItem, RectPacker};
pub use selector::{SelectedTile, TileSelection, TileSelector};
pub use tile::{
    best_axis, AtlasLocation, InverseTransform, LightmapTile, PlaneAxis, TileBinding, TileId,
    TileTransform,
};
pub use upload::{TransferBudget, UploadId, UploadQueue, UploadTicket};

/// Smallest world distance a lightmap texel may cover
pub const SAMPLE_DISTANCE_MIN: f32 = 4.0;

/// Largest world distance a lightmap texel may cover
pub const SAMPLE_DISTANCE_MAX: f32 = 64.0;

/// Texels kept free at the atlas edge when sizing a tile
pub const TILE_EDGE_RESERVE: u32 = 6;
