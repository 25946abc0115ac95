//! Bake plan: everything the GPU passes consume for one bake
//!
//! Struct layouts here are shared with the WGSL shaders of the lightmapper
//! and must stay `#[repr(C)]` with explicit padding.

use crate::level::LevelSurface;
use crate::selector::TileSelection;
use crate::tile::LightmapTile;
use crate::{Error, Result};
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use std::collections::BTreeMap;

/// Entries in the draw command / raytrace constant buffers
pub const DRAW_BUFFER_CAPACITY: usize = 100_000;

/// Entries in the copy tile buffer
pub const COPY_BUFFER_CAPACITY: usize = 100_000;

/// Slots in the bake uniform ring
pub const UNIFORM_RING_SLOTS: u32 = 256;

bitflags! {
    /// Raytrace shader features; the bits double as pipeline cache index
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RaytraceFlags: u32 {
        const SOFT_SHADOWS = 1 << 0;
        const AMBIENT_OCCLUSION = 1 << 1;
        const SUNLIGHT = 1 << 2;
        const LIGHT_BOUNCE = 1 << 3;
    }
}

impl RaytraceFlags {
    /// Number of distinct raytrace pipelines
    pub const VARIANT_COUNT: usize = 16;

    pub fn pipeline_index(self) -> usize {
        self.bits() as usize
    }
}

/// Stages of one bake, in the only order they may run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BakeStage {
    Idle,
    BeginFrame,
    SelectTiles,
    UploadUniforms,
    Render,
    Resolve,
    Blur,
    CopyResult,
}

impl BakeStage {
    pub fn next(self) -> Option<BakeStage> {
        use BakeStage::*;
        match self {
            Idle => Some(BeginFrame),
            BeginFrame => Some(SelectTiles),
            SelectTiles => Some(UploadUniforms),
            UploadUniforms => Some(Render),
            Render => Some(Resolve),
            Resolve => Some(Blur),
            Blur => Some(CopyResult),
            CopyResult => None,
        }
    }
}

/// Guards the stage order of the bake state machine
#[derive(Debug)]
pub struct BakeStageTracker {
    current: BakeStage,
}

impl Default for BakeStageTracker {
    fn default() -> Self {
        Self {
            current: BakeStage::Idle,
        }
    }
}

impl BakeStageTracker {
    pub fn current(&self) -> BakeStage {
        self.current
    }

    /// Moves to `stage`.
    ///
    /// A frame may start at any time. A new selection may follow a frame
    /// start, an empty selection or a finished copy. Every other stage must
    /// directly follow its predecessor.
    pub fn advance(&mut self, stage: BakeStage) -> Result<()> {
        let allowed = match stage {
            BakeStage::BeginFrame => true,
            BakeStage::SelectTiles => matches!(
                self.current,
                BakeStage::BeginFrame | BakeStage::SelectTiles | BakeStage::CopyResult
            ),
            _ => self.current.next() == Some(stage),
        };
        if !allowed {
            return Err(Error::StageOrder {
                current: self.current,
                requested: stage,
            });
        }
        self.current = stage;
        Ok(())
    }
}

/// Sun and shading parameters for one bake
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct BakeUniforms {
    pub sun_dir: [f32; 3],
    pub light_count: u32,
    pub sun_color: [f32; 3],
    pub sun_intensity: f32,
    pub ambient: f32,
    pub ao_distance: f32,
    pub sample_count: u32,
    pub _pad: u32,
}

/// Dynamic-offset slots for [`BakeUniforms`], reused round robin
#[derive(Debug)]
pub struct UniformRing {
    index: u32,
    slots: u32,
    stride: u64,
}

impl UniformRing {
    pub fn new(slots: u32, min_alignment: u64) -> Self {
        let size = std::mem::size_of::<BakeUniforms>() as u64;
        let align = min_alignment.max(1);
        Self {
            index: 0,
            slots: slots.max(1),
            stride: size.div_ceil(align) * align,
        }
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn buffer_size(&self) -> u64 {
        self.stride * self.slots as u64
    }

    /// Byte offset of the next free slot
    pub fn next_offset(&mut self) -> u64 {
        let offset = self.index as u64 * self.stride;
        self.index = (self.index + 1) % self.slots;
        offset
    }
}

/// Per-draw raytrace constants, indexed by instance index in the shader
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct LightmapRaytracePC {
    pub surface_index: i32,
    pub _pad0: [i32; 3],
    pub world_to_local: [f32; 3],
    pub texture_size: f32,
    pub proj_local_to_u: [f32; 3],
    pub _pad1: f32,
    pub proj_local_to_v: [f32; 3],
    pub _pad2: f32,
    pub tile_x: f32,
    pub tile_y: f32,
    pub tile_width: f32,
    pub tile_height: f32,
}

/// Same layout as `wgpu::util::DrawIndexedIndirectArgs`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

/// Describes one tile copy from the bake image into the atlas
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CopyTileInfo {
    pub src_x: i32,
    pub src_y: i32,
    pub dest_x: i32,
    pub dest_y: i32,
    pub tile_width: i32,
    pub tile_height: i32,
    pub src_width: i32,
    pub src_height: i32,
    pub world_origin: [f32; 3],
    pub _pad0: f32,
    pub world_u: [f32; 3],
    pub _pad1: f32,
    pub world_v: [f32; 3],
    pub _pad2: f32,
}

impl CopyTileInfo {
    /// Bake image position sampled for destination texel `(u, v)`.
    ///
    /// Matches the copy shader: the source rectangle is stretched over the
    /// destination and lookups stay on texel centers inside the rectangle.
    pub fn source_texel(&self, u: f32, v: f32) -> Vec2 {
        let fu = u / self.tile_width.max(1) as f32;
        let fv = v / self.tile_height.max(1) as f32;
        let min = Vec2::new(self.src_x as f32, self.src_y as f32);
        let size = Vec2::new(self.src_width.max(1) as f32, self.src_height.max(1) as f32);
        (min + Vec2::new(fu, fv) * size).clamp(min + 0.5, min + size - 0.5)
    }
}

/// Push constants of one copy pass
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LightmapCopyPC {
    pub src_tex_size: i32,
    pub dest_tex_size: i32,
    pub _pad: [i32; 2],
}

/// Copies landing in one atlas layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyList {
    pub array_index: u32,
    pub first: u32,
    pub count: u32,
}

/// GPU work for one bake, built from a tile selection
#[derive(Debug, Default)]
pub struct BakePlan {
    pub commands: Vec<DrawIndexedCommand>,
    pub constants: Vec<LightmapRaytracePC>,
    pub copy_tiles: Vec<CopyTileInfo>,
    pub copy_lists: Vec<CopyList>,
    pub max_x: u32,
    pub max_y: u32,
    /// The draw buffers ran out of room and some tiles were left out
    pub is_full: bool,
}

impl BakePlan {
    /// Records one draw per surface of every selected tile.
    ///
    /// A tile is marked rendered only when all of its surfaces fit;
    /// once `capacity` draws are reached the remaining tiles stay unrendered.
    pub fn build(
        selection: &mut TileSelection,
        tiles: &[LightmapTile],
        surfaces: &[LevelSurface],
        bake_image_size: u32,
        capacity: usize,
    ) -> Self {
        let mut plan = BakePlan {
            max_x: selection.max_x,
            max_y: selection.max_y,
            ..Default::default()
        };
        let mut per_layer: BTreeMap<u32, Vec<CopyTileInfo>> = BTreeMap::new();

        for sel in selection.tiles.iter_mut() {
            let Some(tile) = tiles.get(sel.tile.index()) else {
                continue;
            };
            if tile.surfaces.is_empty() {
                continue;
            }
            if plan.commands.len() + tile.surfaces.len() > capacity {
                plan.is_full = true;
                break;
            }

            let loc = &tile.atlas_location;
            let scale_u = sel.width as f32 / loc.width as f32;
            let scale_v = sel.height as f32 / loc.height as f32;

            for &surface_index in &tile.surfaces {
                let Some(surface) = surfaces.get(surface_index as usize) else {
                    continue;
                };
                plan.commands.push(DrawIndexedCommand {
                    index_count: surface.index_count,
                    instance_count: 1,
                    first_index: surface.first_index,
                    base_vertex: 0,
                    first_instance: plan.constants.len() as u32,
                });
                plan.constants.push(LightmapRaytracePC {
                    surface_index: surface_index as i32,
                    world_to_local: tile.transform.translate_world_to_local.to_array(),
                    texture_size: bake_image_size as f32,
                    proj_local_to_u: (tile.transform.proj_local_to_u * scale_u).to_array(),
                    proj_local_to_v: (tile.transform.proj_local_to_v * scale_v).to_array(),
                    tile_x: sel.x as f32,
                    tile_y: sel.y as f32,
                    tile_width: sel.width as f32,
                    tile_height: sel.height as f32,
                    ..Default::default()
                });
            }
            sel.rendered = true;

            let inv = &tile.inverse_transform;
            per_layer.entry(loc.array_index).or_default().push(CopyTileInfo {
                src_x: sel.x as i32,
                src_y: sel.y as i32,
                dest_x: loc.x as i32,
                dest_y: loc.y as i32,
                tile_width: loc.width as i32,
                tile_height: loc.height as i32,
                src_width: sel.width as i32,
                src_height: sel.height as i32,
                world_origin: inv.world_origin.to_array(),
                world_u: inv.world_u.to_array(),
                world_v: inv.world_v.to_array(),
                ..Default::default()
            });
        }

        for (array_index, infos) in per_layer {
            plan.copy_lists.push(CopyList {
                array_index,
                first: plan.copy_tiles.len() as u32,
                count: infos.len() as u32,
            });
            plan.copy_tiles.extend(infos);
        }
        debug_assert!(plan.copy_tiles.len() <= COPY_BUFFER_CAPACITY);

        if plan.is_full {
            log::debug!(
                "Lightmap draw buffer full after {} draws, {} tiles left for later",
                plan.commands.len(),
                selection.tiles.iter().filter(|s| !s.rendered).count()
            );
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::{LevelMesh, SurfaceDesc};
    use crate::selector::SelectedTile;
    use crate::tile::{TileBinding, TileId};
    use glam::{Vec3, Vec4};

    #[test]
    fn gpu_struct_sizes() {
        assert_eq!(std::mem::size_of::<LightmapRaytracePC>(), 80);
        assert_eq!(std::mem::size_of::<CopyTileInfo>(), 80);
        assert_eq!(std::mem::size_of::<DrawIndexedCommand>(), 20);
        assert_eq!(std::mem::size_of::<LightmapCopyPC>(), 16);
        assert_eq!(std::mem::size_of::<BakeUniforms>(), 48);
    }

    #[test]
    fn raytrace_flags_cover_sixteen_pipelines() {
        assert_eq!(RaytraceFlags::empty().pipeline_index(), 0);
        assert_eq!(RaytraceFlags::all().pipeline_index(), RaytraceFlags::VARIANT_COUNT - 1);
        assert_eq!(RaytraceFlags::SUNLIGHT.pipeline_index(), 4);
    }

    #[test]
    fn stages_run_in_order_only() {
        let mut tracker = BakeStageTracker::default();
        assert!(tracker.advance(BakeStage::SelectTiles).is_err());

        for stage in [
            BakeStage::BeginFrame,
            BakeStage::SelectTiles,
            BakeStage::UploadUniforms,
            BakeStage::Render,
            BakeStage::Resolve,
            BakeStage::Blur,
            BakeStage::CopyResult,
        ] {
            tracker.advance(stage).unwrap();
        }
        assert!(tracker.advance(BakeStage::Blur).is_err());
        tracker.advance(BakeStage::SelectTiles).unwrap();
        assert!(matches!(
            tracker.advance(BakeStage::Resolve),
            Err(Error::StageOrder { current: BakeStage::SelectTiles, .. })
        ));
    }

    #[test]
    fn uniform_ring_wraps() {
        let mut ring = UniformRing::new(3, 256);
        assert_eq!(ring.stride(), 256);
        let offsets: Vec<_> = (0..4).map(|_| ring.next_offset()).collect();
        assert_eq!(offsets, vec![0, 256, 512, 0]);
        assert_eq!(ring.buffer_size(), 768);
    }

    fn two_layer_level() -> LevelMesh {
        let mut level = LevelMesh::new();
        for i in 0..3u32 {
            let z = i as f32 * 100.0;
            level
                .add_surface(SurfaceDesc {
                    positions: &[
                        Vec3::new(0.0, 0.0, z),
                        Vec3::new(64.0, 0.0, z),
                        Vec3::new(64.0, 64.0, z),
                        Vec3::new(0.0, 64.0, z),
                    ],
                    indices: &[0, 1, 2, 0, 2, 3],
                    plane: Vec4::new(0.0, 0.0, 1.0, -z),
                    sample_dimension: 16,
                    binding: TileBinding::new(0, i),
                    use_xy_axis: true,
                })
                .unwrap();
        }
        level.setup_tiles(64);
        level
    }

    fn select_all(level: &LevelMesh) -> TileSelection {
        let tiles = level
            .tiles
            .iter()
            .enumerate()
            .map(|(i, t)| SelectedTile {
                tile: TileId(i as u32),
                x: 3 + i as u32 * 10,
                y: 3,
                width: t.atlas_location.width,
                height: t.atlas_location.height,
                rendered: false,
            })
            .collect();
        TileSelection {
            tiles,
            max_x: 40,
            max_y: 13,
            ..Default::default()
        }
    }

    #[test]
    fn plan_groups_copies_by_layer() {
        let mut level = two_layer_level();
        level.tiles[0].atlas_location.array_index = 1;
        level.tiles[1].atlas_location.array_index = 0;
        level.tiles[2].atlas_location.array_index = 1;

        let mut sel = select_all(&level);
        let plan = BakePlan::build(&mut sel, &level.tiles, &level.surfaces, 2048, DRAW_BUFFER_CAPACITY);

        assert_eq!(plan.commands.len(), 3);
        assert!(sel.tiles.iter().all(|s| s.rendered));
        assert_eq!(
            plan.copy_lists,
            vec![
                CopyList { array_index: 0, first: 0, count: 1 },
                CopyList { array_index: 1, first: 1, count: 2 },
            ]
        );
        for (i, cmd) in plan.commands.iter().enumerate() {
            assert_eq!(cmd.first_instance, i as u32);
            assert_eq!(cmd.index_count, 6);
            assert_eq!(cmd.first_index, i as u32 * 6);
        }
        assert_eq!(plan.constants[1].tile_x, 13.0);
        assert_eq!(plan.constants[1].texture_size, 2048.0);
    }

    #[test]
    fn full_draw_buffer_leaves_tiles_unrendered() {
        let mut level = two_layer_level();
        let mut sel = select_all(&level);
        let plan = BakePlan::build(&mut sel, &level.tiles, &level.surfaces, 2048, 2);

        assert!(plan.is_full);
        assert_eq!(plan.commands.len(), 2);
        let rendered: Vec<_> = sel.tiles.iter().map(|s| s.rendered).collect();
        assert_eq!(rendered, vec![true, true, false]);

        sel.finish(&mut level.tiles);
        assert!(level.tiles[2].geometry_update);
        assert!(!level.tiles[0].geometry_update);
    }

    #[test]
    fn downsampled_tiles_scale_their_projection() {
        let level = two_layer_level();
        let mut sel = select_all(&level);
        let full_w = sel.tiles[0].width;
        sel.tiles[0].width = full_w / 2;

        let plan = BakePlan::build(&mut sel, &level.tiles, &level.surfaces, 2048, 16);
        let full = level.tiles[0].transform.proj_local_to_u.x;
        let scaled = plan.constants[0].proj_local_to_u[0];
        assert!((scaled - full * (full_w / 2) as f32 / full_w as f32).abs() < 1e-6);

        let copy = plan.copy_tiles[0];
        assert_eq!(copy.src_width as u32, full_w / 2);
        let last = copy.source_texel(copy.tile_width as f32 - 0.5, 0.5);
        assert_eq!(last.x, (copy.src_x + copy.src_width) as f32 - 0.5);
        assert_eq!(last.y, copy.src_y as f32 + 0.5);
    }

    #[test]
    fn full_size_copies_hit_source_texel_centers() {
        let level = two_layer_level();
        let mut sel = select_all(&level);
        let plan = BakePlan::build(&mut sel, &level.tiles, &level.surfaces, 2048, 16);

        let copy = plan.copy_tiles[0];
        assert_eq!(copy.src_width, copy.tile_width);
        for u in 0..copy.tile_width {
            let p = copy.source_texel(u as f32 + 0.5, 2.5);
            assert!((p.x - (copy.src_x + u) as f32 - 0.5).abs() < 1e-3);
            assert!((p.y - copy.src_y as f32 - 2.5).abs() < 1e-3);
        }
    }
}
