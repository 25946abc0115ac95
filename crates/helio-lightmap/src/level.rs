//! Level mesh: the geometry, lights and tiles a lightmap is baked from

use crate::accel::Bvh;
use crate::atlas::AtlasAllocator;
use crate::bounds::Aabb;
use crate::cache::LightmapCache;
use crate::tile::{LightmapTile, TileBinding, TileId};
use crate::{Error, Result, SAMPLE_DISTANCE_MAX, SAMPLE_DISTANCE_MIN};
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use std::collections::BTreeMap;

/// Vertex as seen by the raytrace pass
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct LevelVertex {
    pub position: [f32; 3],
    pub surface_index: u32,
}

/// Point light baked into the lightmap
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct LevelLight {
    pub position: [f32; 3],
    pub radius: f32,
    pub color: [f32; 3],
    pub intensity: f32,
    /// Radius of the emitter used for soft shadows
    pub source_radius: f32,
    pub _pad: [f32; 3],
}

impl LevelLight {
    pub fn new(position: Vec3, radius: f32, color: Vec3, intensity: f32) -> Self {
        Self {
            position: position.to_array(),
            radius,
            color: color.to_array(),
            intensity,
            source_radius: 4.0,
            _pad: [0.0; 3],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SunLight {
    /// Points towards the sun
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for SunLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(0.4, 0.3, 1.0).normalize(),
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }
}

/// Size, layer count and initial texels of the level's lightmap atlas
#[derive(Clone, Debug, PartialEq)]
pub struct LightmapTextureInfo {
    pub texture_size: u32,
    pub count: u32,
    /// RGBA16F texels for all layers, empty when nothing was baked yet
    pub data: Vec<u16>,
    /// Bumped by every provisioning
    pub generation: u64,
}

impl Default for LightmapTextureInfo {
    fn default() -> Self {
        Self {
            texture_size: 1024,
            count: 1,
            data: Vec::new(),
            generation: 0,
        }
    }
}

impl LightmapTextureInfo {
    /// u16 values a full texel buffer must hold
    pub fn expected_len(&self) -> usize {
        self.texture_size as usize * self.texture_size as usize * self.count as usize * 4
    }
}

/// A lightmapped surface of the level mesh
#[derive(Clone, Debug)]
pub struct LevelSurface {
    pub first_index: u32,
    pub index_count: u32,
    pub first_vertex: u32,
    pub vertex_count: u32,
    pub plane: Vec4,
    pub bounds: Aabb,
    /// World units per texel, 0 uses the level's sample distance
    pub sample_dimension: u16,
    pub binding: TileBinding,
    pub use_xy_axis: bool,
    pub tile: Option<TileId>,
}

/// Input for [`LevelMesh::add_surface`]
#[derive(Clone, Copy, Debug)]
pub struct SurfaceDesc<'a> {
    pub positions: &'a [Vec3],
    /// Triangle list indexing `positions`
    pub indices: &'a [u32],
    pub plane: Vec4,
    pub sample_dimension: u16,
    pub binding: TileBinding,
    pub use_xy_axis: bool,
}

pub struct LevelMesh {
    pub vertices: Vec<LevelVertex>,
    pub indices: Vec<u32>,
    pub surfaces: Vec<LevelSurface>,
    pub tiles: Vec<LightmapTile>,
    pub lights: Vec<LevelLight>,
    pub sun: SunLight,
    pub lightmap: LightmapTextureInfo,
    sample_distance: u16,
    atlas: AtlasAllocator,
}

impl Default for LevelMesh {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelMesh {
    /// An empty mesh; also stands in when no level is loaded
    pub fn new() -> Self {
        let lightmap = LightmapTextureInfo::default();
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            surfaces: Vec::new(),
            tiles: Vec::new(),
            lights: Vec::new(),
            sun: SunLight::default(),
            atlas: AtlasAllocator::new(lightmap.texture_size, lightmap.count, lightmap.generation),
            lightmap,
            sample_distance: 16,
        }
    }

    pub fn sample_distance(&self) -> u16 {
        self.sample_distance
    }

    /// Sets the level-wide sample distance, clamped to the supported range
    pub fn set_sample_distance(&mut self, distance: u16) {
        self.sample_distance =
            distance.clamp(SAMPLE_DISTANCE_MIN as u16, SAMPLE_DISTANCE_MAX as u16);
    }

    pub fn atlas(&self) -> &AtlasAllocator {
        &self.atlas
    }

    /// Borrows tiles and atlas together for tile selection
    pub fn tiles_and_atlas_mut(&mut self) -> (&mut [LightmapTile], &mut AtlasAllocator) {
        (&mut self.tiles, &mut self.atlas)
    }

    /// Appends a surface's triangles and returns its index
    pub fn add_surface(&mut self, desc: SurfaceDesc<'_>) -> Result<u32> {
        if desc.indices.iter().any(|&i| i as usize >= desc.positions.len()) {
            return Err(Error::InvalidGeometry {
                binding: desc.binding,
                reason: "surface index out of range",
            });
        }

        let surface_index = self.surfaces.len() as u32;
        let first_vertex = self.vertices.len() as u32;
        let first_index = self.indices.len() as u32;

        self.vertices.extend(desc.positions.iter().map(|p| LevelVertex {
            position: p.to_array(),
            surface_index,
        }));
        self.indices
            .extend(desc.indices.iter().map(|&i| first_vertex + i));

        self.surfaces.push(LevelSurface {
            first_index,
            index_count: desc.indices.len() as u32,
            first_vertex,
            vertex_count: desc.positions.len() as u32,
            plane: desc.plane,
            bounds: Aabb::from_points(desc.positions),
            sample_dimension: desc.sample_dimension,
            binding: desc.binding,
            use_xy_axis: desc.use_xy_axis,
            tile: None,
        });
        Ok(surface_index)
    }

    pub fn add_light(&mut self, light: LevelLight) {
        self.lights.push(light);
        self.invalidate_lighting();
    }

    pub fn set_sun(&mut self, sun: SunLight) {
        if self.sun != sun {
            self.sun = sun;
            self.invalidate_lighting();
        }
    }

    /// Flags every tile for an incremental re-bake
    pub fn invalidate_lighting(&mut self) {
        for tile in &mut self.tiles {
            tile.received_new_light = true;
        }
    }

    /// Groups surfaces by binding into tiles and computes their transforms.
    ///
    /// Tiles whose geometry is degenerate are kept with a zero size so the
    /// selector skips them. Returns the number of such tiles.
    pub fn setup_tiles(&mut self, texture_size: u32) -> usize {
        let mut groups: BTreeMap<TileBinding, Vec<u32>> = BTreeMap::new();
        for (i, surface) in self.surfaces.iter().enumerate() {
            groups.entry(surface.binding).or_default().push(i as u32);
        }

        self.tiles.clear();
        let mut rejected = 0;
        for (binding, members) in groups {
            let first = &self.surfaces[members[0] as usize];
            let bounds = members
                .iter()
                .map(|&i| self.surfaces[i as usize].bounds)
                .fold(Aabb::empty(), |acc, b| acc.union(&b));
            let sample_dimension = match first.sample_dimension {
                0 => self.sample_distance,
                sd => sd,
            };

            let mut tile = LightmapTile::new(binding, bounds, first.plane, sample_dimension);
            tile.use_xy_axis = members.iter().any(|&i| self.surfaces[i as usize].use_xy_axis);
            tile.use_count = members.len() as u32;

            if let Err(err) = tile.setup_tile_transform(texture_size) {
                log::warn!("{err}");
                rejected += 1;
            }

            let id = TileId(self.tiles.len() as u32);
            for &i in &members {
                self.surfaces[i as usize].tile = Some(id);
            }
            tile.surfaces = members;
            self.tiles.push(tile);
        }

        log::info!(
            "Level mesh has {} lightmap tiles for {} surfaces ({rejected} rejected)",
            self.tiles.len(),
            self.surfaces.len()
        );
        rejected
    }

    /// Repacks every tile into a fresh atlas of `texture_size` texels.
    ///
    /// All previously assigned atlas locations become stale. Placed tiles
    /// are queued for a background bake; the returned info describes the
    /// atlas texture to create.
    pub fn provision_lightmap(&mut self, texture_size: u32, max_layers: u32) -> LightmapTextureInfo {
        self.setup_tiles(texture_size);

        let generation = self.lightmap.generation + 1;
        self.atlas = AtlasAllocator::new(texture_size, max_layers, generation);

        let mut order: Vec<usize> = (0..self.tiles.len()).collect();
        order.sort_by(|&a, &b| {
            let (ta, tb) = (&self.tiles[a], &self.tiles[b]);
            tb.atlas_location
                .height
                .cmp(&ta.atlas_location.height)
                .then(tb.atlas_location.area().cmp(&ta.atlas_location.area()))
                .then(ta.binding.cmp(&tb.binding))
        });

        let mut unplaced = 0;
        for i in order {
            let tile = &mut self.tiles[i];
            tile.atlas_location.item = None;
            if tile.atlas_location.area() == 0 {
                continue;
            }
            match self.atlas.ensure(tile) {
                Ok(_) => {
                    tile.geometry_update = false;
                    tile.received_new_light = false;
                    tile.needs_initial_bake = true;
                }
                Err(_) => unplaced += 1,
            }
        }
        self.atlas.lock_layers();

        self.lightmap = LightmapTextureInfo {
            texture_size,
            count: self.atlas.layer_count().max(1),
            data: Vec::new(),
            generation,
        };
        if unplaced > 0 {
            log::warn!("{unplaced} lightmap tiles did not fit {max_layers} atlas layers");
        }
        log::info!(
            "Provisioned lightmap atlas: {}x{} x {} layers (generation {generation})",
            texture_size,
            texture_size,
            self.lightmap.count
        );
        self.lightmap.clone()
    }

    /// Uses previously baked texels as the atlas contents.
    ///
    /// The cache must match the provisioned atlas; placed tiles are then
    /// considered baked.
    pub fn apply_cache(&mut self, cache: LightmapCache) -> Result<()> {
        if cache.texture_size != self.lightmap.texture_size || cache.layer_count != self.lightmap.count {
            return Err(Error::InvalidLightmapData {
                expected: self.lightmap.expected_len(),
                actual: cache.data.len(),
            });
        }
        cache.validate()?;

        for tile in &mut self.tiles {
            if self.atlas.is_current(&tile.atlas_location) {
                tile.clear_bake_flags();
            }
        }
        self.lightmap.data = cache.data;
        Ok(())
    }

    /// Atlas UV of `world` on tile `id`.
    ///
    /// `None` when the tile has no slot in the current atlas.
    pub fn tile_uv(&self, id: TileId, world: Vec3) -> Option<Vec2> {
        let tile = self.tiles.get(id.index())?;
        if !self.atlas.is_current(&tile.atlas_location) {
            return None;
        }
        Some(tile.to_uv(world, self.lightmap.texture_size as f32))
    }

    /// Tiles of the given surfaces, in surface order
    pub fn tiles_for_surfaces(&self, surfaces: &[u32]) -> Vec<TileId> {
        surfaces
            .iter()
            .filter_map(|&s| self.surfaces.get(s as usize)?.tile)
            .collect()
    }

    /// Moves a surface (a lift, a door) and schedules its tile for a bake
    pub fn translate_surface(&mut self, surface: u32, delta: Vec3) -> Result<()> {
        let s = self
            .surfaces
            .get_mut(surface as usize)
            .ok_or(Error::InvalidGeometry {
                binding: TileBinding::default(),
                reason: "unknown surface",
            })?;

        let range = s.first_vertex as usize..(s.first_vertex + s.vertex_count) as usize;
        let mut bounds = Aabb::empty();
        for v in &mut self.vertices[range] {
            let p = Vec3::from(v.position) + delta;
            v.position = p.to_array();
            bounds.expand(p);
        }
        s.bounds = bounds;
        s.plane.w -= s.plane.truncate().dot(delta);

        let tile = s.tile;
        match tile {
            Some(id) => self.refresh_tile(id),
            None => Ok(()),
        }
    }

    /// Recomputes a tile's bounds and transform from its surfaces
    pub fn refresh_tile(&mut self, id: TileId) -> Result<()> {
        let texture_size = self.lightmap.texture_size;
        let tile = self.tiles.get_mut(id.index()).ok_or(Error::UnknownTile(id))?;

        tile.bounds = tile
            .surfaces
            .iter()
            .map(|&i| self.surfaces[i as usize].bounds)
            .fold(Aabb::empty(), |acc, b| acc.union(&b));
        if let Some(&first) = tile.surfaces.first() {
            tile.plane = self.surfaces[first as usize].plane;
        }

        tile.setup_tile_transform(texture_size)?;
        tile.geometry_update = true;
        Ok(())
    }

    pub fn build_bvh(&self) -> Bvh {
        Bvh::build(&self.vertices, &self.indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(level: &mut LevelMesh, min: Vec3, size: f32, binding: TileBinding) -> u32 {
        level
            .add_surface(SurfaceDesc {
                positions: &[
                    min,
                    min + Vec3::new(size, 0.0, 0.0),
                    min + Vec3::new(size, size, 0.0),
                    min + Vec3::new(0.0, size, 0.0),
                ],
                indices: &[0, 1, 2, 0, 2, 3],
                plane: Vec4::new(0.0, 0.0, 1.0, -min.z),
                sample_dimension: 0,
                binding,
                use_xy_axis: true,
            })
            .unwrap()
    }

    #[test]
    fn surfaces_sharing_a_binding_share_a_tile() {
        let mut level = LevelMesh::new();
        let b = TileBinding::new(1, 4);
        quad(&mut level, Vec3::ZERO, 64.0, b);
        quad(&mut level, Vec3::new(64.0, 0.0, 0.0), 64.0, b);
        quad(&mut level, Vec3::new(0.0, 200.0, 0.0), 32.0, TileBinding::new(1, 2));

        level.setup_tiles(1024);
        assert_eq!(level.tiles.len(), 2);
        // Sorted by binding: type index 2 first
        assert_eq!(level.tiles[0].surfaces, vec![2]);
        assert_eq!(level.tiles[1].surfaces, vec![0, 1]);
        assert_eq!(level.tiles[1].use_count, 2);
        assert_eq!(level.tiles[1].bounds.max.x, 128.0);
        assert_eq!(level.surfaces[0].tile, Some(TileId(1)));
        assert_eq!(level.indices[6], 4);
    }

    #[test]
    fn sample_distance_is_clamped() {
        let mut level = LevelMesh::new();
        level.set_sample_distance(1);
        assert_eq!(level.sample_distance(), 4);
        level.set_sample_distance(1000);
        assert_eq!(level.sample_distance(), 64);
    }

    #[test]
    fn provisioning_invalidates_old_locations() {
        let mut level = LevelMesh::new();
        quad(&mut level, Vec3::ZERO, 256.0, TileBinding::new(0, 0));
        quad(&mut level, Vec3::new(0.0, 0.0, 64.0), 256.0, TileBinding::new(0, 1));

        let first = level.provision_lightmap(256, 4);
        assert_eq!(first.generation, 1);
        let p = Vec3::new(100.0, 100.0, 0.0);
        let old_uv = level.tile_uv(TileId(0), p).unwrap();
        let old_loc = level.tiles[0].atlas_location;
        assert!(level.tiles.iter().all(|t| t.needs_initial_bake && !t.geometry_update));

        let second = level.provision_lightmap(512, 4);
        assert_eq!(second.generation, 2);
        assert_eq!(second.count, 1);
        assert_ne!(level.tiles[0].atlas_location.generation, old_loc.generation);
        let new_uv = level.tile_uv(TileId(0), p).unwrap();
        assert_ne!(old_uv, new_uv);

        // A location from before the last provisioning is never current
        assert!(!level.atlas().is_current(&old_loc));
    }

    #[test]
    fn cache_must_match_atlas() {
        let mut level = LevelMesh::new();
        quad(&mut level, Vec3::ZERO, 64.0, TileBinding::new(0, 0));
        let info = level.provision_lightmap(64, 1);

        let wrong = LightmapCache::new(128, 1, vec![0; 128 * 128 * 4]);
        assert!(level.apply_cache(wrong).is_err());

        let right = LightmapCache::new(64, info.count, vec![0; info.expected_len()]);
        level.apply_cache(right).unwrap();
        assert!(!level.tiles[0].is_dirty());
        assert_eq!(level.lightmap.data.len(), info.expected_len());
    }

    #[test]
    fn moving_a_surface_requests_a_geometry_bake() {
        let mut level = LevelMesh::new();
        quad(&mut level, Vec3::ZERO, 64.0, TileBinding::new(0, 0));
        level.provision_lightmap(256, 1);
        level.tiles[0].clear_bake_flags();

        level.translate_surface(0, Vec3::new(0.0, 0.0, 32.0)).unwrap();
        let tile = &level.tiles[0];
        assert!(tile.geometry_update);
        assert_eq!(tile.plane.w, -32.0);
        assert_eq!(tile.bounds.min.z, 32.0);
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let mut level = LevelMesh::new();
        let err = level.add_surface(SurfaceDesc {
            positions: &[Vec3::ZERO],
            indices: &[0, 1, 2],
            plane: Vec4::Z,
            sample_dimension: 8,
            binding: TileBinding::default(),
            use_xy_axis: false,
        });
        assert!(err.is_err());
        assert!(level.surfaces.is_empty());
    }
}
