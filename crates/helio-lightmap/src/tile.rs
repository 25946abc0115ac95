//! Lightmap tiles and their world <-> texel transforms
//!
//! A tile is the rectangle of lightmap texels that one group of coplanar
//! surfaces bakes into. The transform is aligned to the sample grid and
//! keeps a one texel border around the surface so bilinear lookups never
//! read outside the tile.

use crate::bounds::Aabb;
use crate::packer::PackerItem;
use crate::{Error, Result, TILE_EDGE_RESERVE};
use glam::{Vec2, Vec3, Vec4};
use std::cmp::Ordering;

/// Identifies the level element a tile was created for
///
/// Sorted by `(type_index, control_sector, kind)` so tile lists come out in
/// a stable order no matter how surfaces were registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileBinding {
    pub kind: u32,
    pub type_index: u32,
    pub control_sector: u32,
}

impl TileBinding {
    pub const NO_CONTROL_SECTOR: u32 = u32::MAX;

    pub fn new(kind: u32, type_index: u32) -> Self {
        Self {
            kind,
            type_index,
            control_sector: Self::NO_CONTROL_SECTOR,
        }
    }

    pub fn with_control_sector(mut self, sector: u32) -> Self {
        self.control_sector = sector;
        self
    }
}

impl Default for TileBinding {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Ord for TileBinding {
    fn cmp(&self, other: &Self) -> Ordering {
        self.type_index
            .cmp(&other.type_index)
            .then(self.control_sector.cmp(&other.control_sector))
            .then(self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for TileBinding {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Index of a tile inside its level mesh
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(pub u32);

impl TileId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a tile lives in the lightmap atlas
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AtlasLocation {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub array_index: u32,
    /// Packer allocation backing this slot, `None` while unplaced
    pub item: Option<PackerItem>,
    /// Atlas provisioning generation the slot was assigned in
    pub generation: u64,
}

impl AtlasLocation {
    pub fn area(&self) -> u32 {
        self.width * self.height
    }

    pub fn is_placed(&self) -> bool {
        self.item.is_some()
    }
}

/// World position -> texel-local (u, v)
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TileTransform {
    pub translate_world_to_local: Vec3,
    pub proj_local_to_u: Vec3,
    pub proj_local_to_v: Vec3,
}

/// Texel-local corners of the tile in world space
///
/// `world_u` is the point at `(width, 0)` and `world_v` the point at
/// `(0, height)`, so any texel position is a bilinear blend of the three.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InverseTransform {
    pub world_origin: Vec3,
    pub world_u: Vec3,
    pub world_v: Vec3,
}

/// The two world axes a tile is projected onto
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlaneAxis {
    YZ = 0,
    XZ = 1,
    XY = 2,
}

/// Picks the projection axis from the dominant plane normal component.
///
/// Ties resolve X first, then Y, else Z.
pub fn best_axis(plane: Vec4) -> PlaneAxis {
    let na = plane.x.abs();
    let nb = plane.y.abs();
    let nc = plane.z.abs();

    if na >= nb && na >= nc {
        PlaneAxis::YZ
    } else if nb >= na && nb >= nc {
        PlaneAxis::XZ
    } else {
        PlaneAxis::XY
    }
}

#[derive(Clone, Debug)]
pub struct LightmapTile {
    pub atlas_location: AtlasLocation,
    pub transform: TileTransform,
    pub inverse_transform: InverseTransform,

    pub use_count: u32,
    pub added_this_frame: bool,

    pub binding: TileBinding,
    pub bounds: Aabb,
    /// World units per texel
    pub sample_dimension: u16,
    /// Plane equation `ax + by + cz + d = 0`
    pub plane: Vec4,

    /// Flats always project on XY; slopes can flip their dominant axis
    /// between frames, which would reshape the tile.
    pub use_xy_axis: bool,

    /// Never baked yet; may be spread over several frames
    pub needs_initial_bake: bool,
    /// Must be baked before the tile is rendered again
    pub geometry_update: bool,
    /// Lighting changed since the last bake
    pub received_new_light: bool,

    /// Frame the tile was last put on a visible list
    pub last_seen: u64,

    /// Surfaces of the level mesh that sample this tile
    pub surfaces: Vec<u32>,
}

impl LightmapTile {
    pub fn new(binding: TileBinding, bounds: Aabb, plane: Vec4, sample_dimension: u16) -> Self {
        Self {
            atlas_location: AtlasLocation::default(),
            transform: TileTransform::default(),
            inverse_transform: InverseTransform::default(),
            use_count: 0,
            added_this_frame: false,
            binding,
            bounds,
            sample_dimension,
            plane,
            use_xy_axis: false,
            needs_initial_bake: false,
            geometry_update: true,
            received_new_light: true,
            last_seen: 0,
            surfaces: Vec::new(),
        }
    }

    pub fn plane_axis(&self) -> PlaneAxis {
        if self.use_xy_axis {
            PlaneAxis::XY
        } else {
            best_axis(self.plane)
        }
    }

    /// True while any bake flag is set
    pub fn is_dirty(&self) -> bool {
        self.geometry_update || self.received_new_light || self.needs_initial_bake
    }

    /// Called once the bake result landed in the atlas
    pub fn clear_bake_flags(&mut self) {
        self.geometry_update = false;
        self.received_new_light = false;
        self.needs_initial_bake = false;
    }

    /// Computes the atlas size and both transforms for `texture_size`.
    ///
    /// Tiles larger than the usable texture area are downsampled, never
    /// clipped. Degenerate input is rejected and leaves the tile untouched.
    pub fn setup_tile_transform(&mut self, texture_size: u32) -> Result<()> {
        self.validate(texture_size)?;

        let sd = self.sample_dimension as f32;
        let mut uv_min = (self.bounds.min / sd).floor() - Vec3::ONE;
        let mut uv_max = (self.bounds.max / sd).floor() + Vec3::splat(2.0);

        let axis = self.plane_axis();
        let mut t_u = Vec3::ZERO;
        let mut t_v = Vec3::ZERO;
        let (width, height) = match axis {
            PlaneAxis::YZ => {
                t_u.y = 1.0 / sd;
                t_v.z = 1.0 / sd;
                (uv_max.y - uv_min.y, uv_max.z - uv_min.z)
            }
            PlaneAxis::XZ => {
                t_u.x = 1.0 / sd;
                t_v.z = 1.0 / sd;
                (uv_max.x - uv_min.x, uv_max.z - uv_min.z)
            }
            PlaneAxis::XY => {
                t_u.x = 1.0 / sd;
                t_v.y = 1.0 / sd;
                (uv_max.x - uv_min.x, uv_max.y - uv_min.y)
            }
        };
        let mut width = width.round() as u32;
        let mut height = height.round() as u32;

        let usable = texture_size - TILE_EDGE_RESERVE;
        if width > usable {
            t_u *= usable as f32 / width as f32;
            width = usable;
        }
        if height > usable {
            t_v *= usable as f32 / height as f32;
            height = usable;
        }

        uv_min *= sd;
        uv_max *= sd;

        self.transform = TileTransform {
            translate_world_to_local: uv_min + Vec3::splat(0.1),
            proj_local_to_u: t_u,
            proj_local_to_v: t_v,
        };

        self.inverse_transform = match axis {
            PlaneAxis::YZ => InverseTransform {
                world_origin: self.point_at_yz(uv_min.y, uv_min.z),
                world_u: self.point_at_yz(uv_max.y, uv_min.z),
                world_v: self.point_at_yz(uv_min.y, uv_max.z),
            },
            PlaneAxis::XZ => InverseTransform {
                world_origin: self.point_at_xz(uv_min.x, uv_min.z),
                world_u: self.point_at_xz(uv_max.x, uv_min.z),
                world_v: self.point_at_xz(uv_min.x, uv_max.z),
            },
            PlaneAxis::XY => InverseTransform {
                world_origin: self.point_at_xy(uv_min.x, uv_min.y),
                world_u: self.point_at_xy(uv_max.x, uv_min.y),
                world_v: self.point_at_xy(uv_min.x, uv_max.y),
            },
        };

        self.atlas_location.width = width;
        self.atlas_location.height = height;
        Ok(())
    }

    fn validate(&self, texture_size: u32) -> Result<()> {
        let reject = |reason| {
            Err(Error::InvalidGeometry {
                binding: self.binding,
                reason,
            })
        };

        if texture_size <= TILE_EDGE_RESERVE {
            return reject("texture too small for any tile");
        }
        if self.sample_dimension == 0 {
            return reject("zero sample dimension");
        }
        if !self.bounds.min.is_finite() || !self.bounds.max.is_finite() || self.bounds.is_empty() {
            return reject("invalid bounds");
        }
        if !self.plane.is_finite() {
            return reject("invalid plane");
        }
        let denom = match self.plane_axis() {
            PlaneAxis::YZ => self.plane.x,
            PlaneAxis::XZ => self.plane.y,
            PlaneAxis::XY => self.plane.z,
        };
        if denom == 0.0 {
            return reject("plane is parallel to its projection axis");
        }
        Ok(())
    }

    /// Texel-local coordinates of a world position, unclamped
    pub fn to_local(&self, vert: Vec3) -> Vec2 {
        let local = vert - self.transform.translate_world_to_local;
        Vec2::new(
            local.dot(self.transform.proj_local_to_u),
            local.dot(self.transform.proj_local_to_v),
        )
    }

    /// Normalized atlas UV of a world position.
    ///
    /// The local offset is clamped to `[1, width - 1]` x `[1, height - 1]` so
    /// geometry that moved past its baked footprint still samples this tile.
    pub fn to_uv(&self, vert: Vec3, texture_size: f32) -> Vec2 {
        let local = self.to_local(vert);
        let loc = &self.atlas_location;

        let u = local.x.min(loc.width as f32 - 1.0).max(1.0);
        let v = local.y.min(loc.height as f32 - 1.0).max(1.0);

        Vec2::new(
            (loc.x as f32 + u) / texture_size,
            (loc.y as f32 + v) / texture_size,
        )
    }

    /// World position of texel-local `(u, v)`
    pub fn world_at(&self, u: f32, v: f32) -> Vec3 {
        let inv = &self.inverse_transform;
        let w = self.atlas_location.width.max(1) as f32;
        let h = self.atlas_location.height.max(1) as f32;
        inv.world_origin
            + (inv.world_u - inv.world_origin) * (u / w)
            + (inv.world_v - inv.world_origin) * (v / h)
    }

    fn point_at_yz(&self, y: f32, z: f32) -> Vec3 {
        let p = self.plane;
        Vec3::new(-(p.y * y + p.z * z + p.w) / p.x, y, z)
    }

    fn point_at_xz(&self, x: f32, z: f32) -> Vec3 {
        let p = self.plane;
        Vec3::new(x, -(p.x * x + p.z * z + p.w) / p.y, z)
    }

    fn point_at_xy(&self, x: f32, y: f32) -> Vec3 {
        let p = self.plane;
        Vec3::new(x, y, -(p.x * x + p.y * y + p.w) / p.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn floor_tile(min: Vec3, max: Vec3, sd: u16) -> LightmapTile {
        LightmapTile::new(
            TileBinding::new(1, 7),
            Aabb::new(min, max),
            Vec4::new(0.0, 0.0, 1.0, 0.0),
            sd,
        )
    }

    #[test]
    fn best_axis_prefers_dominant_component() {
        assert_eq!(best_axis(Vec4::new(0.0, 0.0, 1.0, 0.0)), PlaneAxis::XY);
        assert_eq!(best_axis(Vec4::new(0.0, -1.0, 0.2, 5.0)), PlaneAxis::XZ);
        assert_eq!(best_axis(Vec4::new(-0.9, 0.3, 0.3, 0.0)), PlaneAxis::YZ);
    }

    #[test]
    fn best_axis_breaks_ties_left_to_right() {
        assert_eq!(best_axis(Vec4::new(1.0, 1.0, 1.0, 0.0)), PlaneAxis::YZ);
        assert_eq!(best_axis(Vec4::new(0.0, 0.5, -0.5, 0.0)), PlaneAxis::XZ);
    }

    #[test]
    fn binding_order_is_type_index_then_sector_then_kind() {
        let a = TileBinding::new(5, 1);
        let b = TileBinding::new(0, 2);
        let c = TileBinding::new(0, 2).with_control_sector(3);
        let d = TileBinding::new(1, 2).with_control_sector(3);

        let mut list = vec![d, b, a, c];
        list.sort();
        assert_eq!(list, vec![a, c, d, b]);
    }

    #[test]
    fn new_tile_flag_defaults() {
        let tile = floor_tile(Vec3::ZERO, Vec3::ONE, 16);
        assert!(tile.geometry_update);
        assert!(tile.received_new_light);
        assert!(!tile.needs_initial_bake);
        assert_eq!(tile.binding.control_sector, TileBinding::NO_CONTROL_SECTOR);
    }

    #[test]
    fn floor_tile_snaps_to_sample_grid() {
        let mut tile = floor_tile(Vec3::ZERO, Vec3::new(64.0, 64.0, 0.0), 16);
        tile.setup_tile_transform(128).unwrap();

        assert_eq!(tile.atlas_location.width, 7);
        assert_eq!(tile.atlas_location.height, 7);

        // uvMin of -1 grid cell, scaled back to world and nudged by 0.1
        let origin = tile.transform.translate_world_to_local;
        assert!((origin - Vec3::splat(-15.9)).abs().max_element() < 1e-5);
        assert_eq!(tile.transform.proj_local_to_u, Vec3::new(1.0 / 16.0, 0.0, 0.0));
        assert_eq!(tile.transform.proj_local_to_v, Vec3::new(0.0, 1.0 / 16.0, 0.0));

        let inv = tile.inverse_transform;
        assert_eq!(inv.world_origin, Vec3::new(-16.0, -16.0, 0.0));
        assert_eq!(inv.world_u, Vec3::new(96.0, -16.0, 0.0));
        assert_eq!(inv.world_v, Vec3::new(-16.0, 96.0, 0.0));
    }

    #[test]
    fn oversized_tile_is_downsampled() {
        let mut tile = LightmapTile::new(
            TileBinding::new(0, 0),
            Aabb::new(Vec3::ZERO, Vec3::new(0.0, 4997.0 * 4.0, 7.0 * 4.0)),
            Vec4::new(1.0, 0.0, 0.0, 0.0),
            4,
        );
        tile.setup_tile_transform(2048).unwrap();

        // 4997 + 3 border cells = 5000 wide before clamping
        assert_eq!(tile.atlas_location.width, 2042);
        assert_eq!(tile.atlas_location.height, 10);

        let full_step = 1.0 / 4.0;
        let ratio = tile.transform.proj_local_to_u.length() / full_step;
        assert!((ratio - 2042.0 / 5000.0).abs() < 1e-6);
        assert_eq!(tile.transform.proj_local_to_v.length(), full_step);
    }

    #[test]
    fn to_uv_clamps_into_tile_interior() {
        let mut tile = floor_tile(Vec3::ZERO, Vec3::new(64.0, 64.0, 0.0), 16);
        tile.setup_tile_transform(128).unwrap();
        tile.atlas_location.x = 10;
        tile.atlas_location.y = 20;

        let far = tile.to_uv(Vec3::new(10_000.0, -10_000.0, 0.0), 128.0);
        assert_eq!(far, Vec2::new((10.0 + 6.0) / 128.0, (20.0 + 1.0) / 128.0));
    }

    #[test]
    fn degenerate_tiles_are_rejected() {
        let mut zero_sd = floor_tile(Vec3::ZERO, Vec3::ONE, 0);
        assert!(matches!(
            zero_sd.setup_tile_transform(1024),
            Err(Error::InvalidGeometry { .. })
        ));

        let mut no_normal = floor_tile(Vec3::ZERO, Vec3::ONE, 8);
        no_normal.plane = Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!(no_normal.setup_tile_transform(1024).is_err());

        let mut wall_forced_flat = floor_tile(Vec3::ZERO, Vec3::ONE, 8);
        wall_forced_flat.plane = Vec4::new(1.0, 0.0, 0.0, 0.0);
        wall_forced_flat.use_xy_axis = true;
        assert!(wall_forced_flat.setup_tile_transform(1024).is_err());
        assert_eq!(wall_forced_flat.atlas_location.width, 0);

        let mut inverted = floor_tile(Vec3::ONE, Vec3::ZERO, 8);
        assert!(inverted.setup_tile_transform(1024).is_err());
    }

    #[test]
    fn round_trip_on_sloped_plane() {
        let normal = Vec3::new(0.3, 0.2, 1.0).normalize();
        let plane = normal.extend(-normal.dot(Vec3::new(0.0, 0.0, 40.0)));
        let on_plane = |x: f32, y: f32| {
            Vec3::new(x, y, -(plane.x * x + plane.y * y + plane.w) / plane.z)
        };
        let bounds = Aabb::from_points(&[on_plane(-100.0, -50.0), on_plane(200.0, 150.0)]);
        let mut tile = LightmapTile::new(TileBinding::default(), bounds, plane, 8);
        tile.setup_tile_transform(1024).unwrap();

        let p = on_plane(37.0, 81.0);
        let local = tile.to_local(p);
        let back = tile.world_at(local.x, local.y);
        assert!(back.distance(p) < 8.0, "{back} vs {p}");
    }

    proptest! {
        #[test]
        fn tile_size_stays_inside_texture(
            min in prop::array::uniform3(-20_000.0f32..20_000.0),
            size in prop::array::uniform3(0.0f32..40_000.0),
            normal in prop::array::uniform3(-1.0f32..1.0),
            sd in 1u16..128,
            texture_size in 7u32..4096,
        ) {
            let normal = Vec3::from(normal);
            prop_assume!(normal.abs().max_element() > 0.01);
            let min = Vec3::from(min);
            let max = min + Vec3::from(size);
            let mut tile = LightmapTile::new(TileBinding::default(), Aabb::new(min, max), normal.extend(0.0), sd);
            tile.setup_tile_transform(texture_size).unwrap();

            let loc = tile.atlas_location;
            prop_assert!(loc.width >= 1 && loc.width <= texture_size - 6);
            prop_assert!(loc.height >= 1 && loc.height <= texture_size - 6);
        }

        #[test]
        fn uv_round_trip_within_one_texel(fx in 0.0f32..1.0, fy in 0.0f32..1.0, sd in 4u16..64) {
            let mut tile = floor_tile(Vec3::new(-300.0, 120.0, 0.0), Vec3::new(500.0, 900.0, 0.0), sd);
            tile.setup_tile_transform(4096).unwrap();
            tile.atlas_location.x = 100;
            tile.atlas_location.y = 33;

            let p = tile.bounds.min + (tile.bounds.max - tile.bounds.min) * Vec3::new(fx, fy, 0.0);
            let uv = tile.to_uv(p, 4096.0);
            let u = uv.x * 4096.0 - 100.0;
            let v = uv.y * 4096.0 - 33.0;
            let back = tile.world_at(u, v);
            prop_assert!(back.distance(p) <= sd as f32);
        }
    }
}
