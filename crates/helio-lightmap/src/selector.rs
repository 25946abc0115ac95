//! Per-frame choice of which lightmap tiles get baked
//!
//! Tiles are taken in three priority groups:
//!
//! 1. `geometry_update`: stale data must never be shown, always attempted
//! 2. `received_new_light`: incremental re-bakes
//! 3. `needs_initial_bake` only: background bakes, capped per frame
//!
//! Each taken tile gets a permanent atlas slot and a temporary rectangle in
//! the scratch bake image. Whatever does not fit stays dirty and is simply
//! offered again next frame.

use crate::atlas::AtlasAllocator;
use crate::config::LightmapperConfig;
use crate::packer::RectPacker;
use crate::tile::{LightmapTile, TileId};
use crate::{Error, TILE_EDGE_RESERVE};

/// A tile scheduled for this bake
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SelectedTile {
    pub tile: TileId,
    /// Position in the scratch bake image
    pub x: u32,
    pub y: u32,
    /// Extent in the scratch bake image; smaller than the atlas slot when
    /// the tile had to be downsampled to fit the bake image
    pub width: u32,
    pub height: u32,
    /// Set once a draw was recorded for every surface of the tile
    pub rendered: bool,
}

/// Result of one [`TileSelector::select`] call
#[derive(Debug, Default)]
pub struct TileSelection {
    pub frame: u64,
    pub tiles: Vec<SelectedTile>,
    /// Used part of the scratch bake image
    pub max_x: u32,
    pub max_y: u32,
    /// Dirty tiles left for a later frame
    pub deferred: usize,
    /// Tiles without a usable transform
    pub rejected: usize,
}

impl TileSelection {
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Clears the bake flags of every rendered tile.
    ///
    /// Tiles that were selected but never rendered keep their flags.
    pub fn finish(&self, tiles: &mut [LightmapTile]) -> usize {
        let mut done = 0;
        for sel in self.tiles.iter().filter(|s| s.rendered) {
            if let Some(tile) = tiles.get_mut(sel.tile.index()) {
                tile.clear_bake_flags();
                done += 1;
            }
        }
        done
    }
}

pub struct TileSelector {
    frame: u64,
    scratch: RectPacker,
    bake_image_size: u32,
    spacing: u32,
    max_deferred_per_frame: usize,
    eviction_age: u64,
    added_this_frame: Vec<TileId>,
}

impl TileSelector {
    pub fn new(config: &LightmapperConfig) -> Self {
        let size = config.bake_image_size;
        let spacing = config.tile_spacing;
        Self {
            frame: 0,
            scratch: RectPacker::new(size, size, spacing, spacing, 1),
            bake_image_size: size,
            spacing,
            max_deferred_per_frame: config.max_deferred_tiles_per_frame,
            eviction_age: config.eviction_age,
            added_this_frame: Vec::new(),
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn bake_image_size(&self) -> u32 {
        self.bake_image_size
    }

    /// Picks the tiles to bake out of `requested`.
    ///
    /// `frame` is the renderer's frame number. `requested` may list a tile
    /// several times (one entry per visible surface) and a frame may call
    /// this more than once; each tile is considered once per frame.
    pub fn select(
        &mut self,
        frame: u64,
        tiles: &mut [LightmapTile],
        atlas: &mut AtlasAllocator,
        requested: &[TileId],
    ) -> TileSelection {
        if frame != self.frame {
            for id in self.added_this_frame.drain(..) {
                if let Some(tile) = tiles.get_mut(id.index()) {
                    tile.added_this_frame = false;
                }
            }
            self.frame = frame;
        }

        let mut selection = TileSelection {
            frame,
            ..Default::default()
        };

        let mut urgent = Vec::new();
        let mut relight = Vec::new();
        let mut background = Vec::new();
        for &id in requested {
            let Some(tile) = tiles.get_mut(id.index()) else {
                log::warn!("{}", Error::UnknownTile(id));
                continue;
            };
            if tile.added_this_frame {
                continue;
            }
            tile.last_seen = frame;
            tile.added_this_frame = true;
            self.added_this_frame.push(id);

            if !tile.is_dirty() {
                continue;
            }
            if tile.atlas_location.width == 0 || tile.atlas_location.height == 0 {
                selection.rejected += 1;
                continue;
            }
            if tile.geometry_update {
                urgent.push(id);
            } else if tile.received_new_light {
                relight.push(id);
            } else {
                background.push(id);
            }
        }

        if background.len() > self.max_deferred_per_frame {
            selection.deferred += background.len() - self.max_deferred_per_frame;
            background.truncate(self.max_deferred_per_frame);
        }

        self.scratch.clear();
        let limit = self.bake_image_size.saturating_sub(TILE_EDGE_RESERVE).max(1);

        for id in urgent.into_iter().chain(relight).chain(background) {
            let i = id.index();
            if !self.place_in_atlas(tiles, atlas, i) {
                selection.deferred += 1;
                continue;
            }

            let loc = tiles[i].atlas_location;
            let width = loc.width.min(limit);
            let height = loc.height.min(limit);
            let Some(rect) = self.scratch.alloc(width, height) else {
                selection.deferred += 1;
                continue;
            };

            selection.max_x = selection.max_x.max(rect.x + width + self.spacing);
            selection.max_y = selection.max_y.max(rect.y + height + self.spacing);
            selection.tiles.push(SelectedTile {
                tile: id,
                x: rect.x,
                y: rect.y,
                width,
                height,
                rendered: false,
            });
        }

        log::debug!(
            "Lightmap frame {frame}: {} tiles selected, {} deferred, {} rejected, bake extent {}x{}",
            selection.tiles.len(),
            selection.deferred,
            selection.rejected,
            selection.max_x,
            selection.max_y,
        );
        selection
    }

    fn place_in_atlas(&self, tiles: &mut [LightmapTile], atlas: &mut AtlasAllocator, i: usize) -> bool {
        match atlas.ensure(&mut tiles[i]) {
            Ok(_) => return true,
            Err(Error::AtlasFull { .. }) => {}
            Err(err) => {
                log::warn!("Lightmap tile {i} cannot be placed: {err}");
                return false;
            }
        }

        let wanted = tiles[i].atlas_location.area();
        if atlas.evict_stale(tiles, self.frame, self.eviction_age, wanted) == 0 {
            log::trace!("Lightmap atlas full, tile {i} deferred");
            return false;
        }
        atlas.ensure(&mut tiles[i]).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Aabb;
    use crate::tile::TileBinding;
    use glam::{Vec3, Vec4};

    fn tile(extent: f32) -> LightmapTile {
        let mut t = LightmapTile::new(
            TileBinding::default(),
            Aabb::new(Vec3::ZERO, Vec3::new(extent, extent, 0.0)),
            Vec4::new(0.0, 0.0, 1.0, 0.0),
            16,
        );
        t.setup_tile_transform(1024).unwrap();
        t
    }

    fn background(extent: f32) -> LightmapTile {
        let mut t = tile(extent);
        t.geometry_update = false;
        t.received_new_light = false;
        t.needs_initial_bake = true;
        t
    }

    fn config(bake_image_size: u32) -> LightmapperConfig {
        LightmapperConfig::default().with_bake_image_size(bake_image_size)
    }

    #[test]
    fn duplicate_requests_are_selected_once() {
        let mut tiles = vec![tile(64.0), tile(64.0)];
        let mut atlas = AtlasAllocator::new(1024, 1, 1);
        let mut selector = TileSelector::new(&config(256));

        let ids = [TileId(0), TileId(1), TileId(0), TileId(1)];
        let sel = selector.select(1, &mut tiles, &mut atlas, &ids);
        assert_eq!(sel.tiles.len(), 2);
        assert!(tiles.iter().all(|t| t.added_this_frame && t.last_seen == 1));

        let sel = selector.select(2, &mut tiles, &mut atlas, &[TileId(1)]);
        assert_eq!(sel.tiles.len(), 1);
        assert!(!tiles[0].added_this_frame);
    }

    #[test]
    fn repeated_selects_share_one_frame() {
        let mut a = tile(64.0);
        a.atlas_location.width = 16;
        a.atlas_location.height = 16;
        let b = a.clone();
        let mut tiles = vec![a, b];
        let mut atlas = AtlasAllocator::new(16, 1, 1);
        let mut selector = TileSelector::new(&config(256).with_eviction_age(2));

        let sel = selector.select(1, &mut tiles, &mut atlas, &[TileId(0)]);
        assert_eq!(sel.tiles.len(), 1);

        // Several bakes within frame 4 must not age tile 0 out
        let sel = selector.select(4, &mut tiles, &mut atlas, &[TileId(0)]);
        assert_eq!(sel.tiles.len(), 1);
        for _ in 0..3 {
            let sel = selector.select(4, &mut tiles, &mut atlas, &[TileId(1), TileId(0)]);
            assert_eq!(sel.frame, 4);
            assert!(sel.is_empty());
        }
        assert!(atlas.is_current(&tiles[0].atlas_location));
        assert!(!atlas.is_current(&tiles[1].atlas_location));
        assert_eq!(tiles[0].last_seen, 4);
        assert!(!tiles[0].needs_initial_bake);
        assert!(tiles[0].added_this_frame && tiles[1].added_this_frame);

        // Two frames later tile 0 is stale and gives up its slot
        let sel = selector.select(6, &mut tiles, &mut atlas, &[TileId(1)]);
        assert_eq!(sel.tiles.len(), 1);
        assert!(!tiles[0].added_this_frame);
        assert!(tiles[0].needs_initial_bake);
        assert!(atlas.is_current(&tiles[1].atlas_location));
    }

    #[test]
    fn tiny_bake_image_does_not_underflow() {
        let mut cfg = config(256);
        cfg.bake_image_size = 4;
        let mut tiles = vec![tile(64.0)];
        let mut atlas = AtlasAllocator::new(1024, 1, 1);
        let mut selector = TileSelector::new(&cfg);

        let sel = selector.select(1, &mut tiles, &mut atlas, &[TileId(0)]);
        assert!(sel.is_empty());
        assert_eq!(sel.deferred, 1);
    }

    #[test]
    fn geometry_updates_come_before_background_bakes() {
        let mut tiles = vec![background(64.0), tile(64.0)];
        let mut atlas = AtlasAllocator::new(1024, 1, 1);
        let mut selector = TileSelector::new(&config(256));

        let sel = selector.select(1, &mut tiles, &mut atlas, &[TileId(0), TileId(1)]);
        assert_eq!(sel.tiles[0].tile, TileId(1));
        assert_eq!(sel.tiles[1].tile, TileId(0));
    }

    #[test]
    fn excess_background_tiles_keep_their_flags() {
        // Each tile is 7x7 texels (+3 spacing), a 32x32 image holds four
        let mut tiles: Vec<_> = (0..9).map(|_| background(64.0)).collect();
        let mut atlas = AtlasAllocator::new(1024, 1, 1);
        let mut selector = TileSelector::new(&config(32));

        let ids: Vec<_> = (0..9).map(TileId).collect();
        let mut sel = selector.select(1, &mut tiles, &mut atlas, &ids);
        assert_eq!(sel.tiles.len(), 4);
        assert_eq!(sel.deferred, 5);
        assert!(sel.max_x <= 32 && sel.max_y <= 32);

        for s in &mut sel.tiles {
            s.rendered = true;
        }
        assert_eq!(sel.finish(&mut tiles), 4);

        let baked: Vec<_> = sel.tiles.iter().map(|s| s.tile.index()).collect();
        for (i, t) in tiles.iter().enumerate() {
            assert_eq!(t.needs_initial_bake, !baked.contains(&i));
        }
    }

    #[test]
    fn unrendered_selection_leaves_tiles_dirty() {
        let mut tiles = vec![tile(64.0)];
        let mut atlas = AtlasAllocator::new(1024, 1, 1);
        let mut selector = TileSelector::new(&config(256));

        let sel = selector.select(1, &mut tiles, &mut atlas, &[TileId(0)]);
        assert_eq!(sel.finish(&mut tiles), 0);
        assert!(tiles[0].geometry_update);
    }

    #[test]
    fn background_bakes_are_rate_limited() {
        let mut tiles: Vec<_> = (0..10).map(|_| background(16.0)).collect();
        let mut atlas = AtlasAllocator::new(1024, 1, 1);
        let mut selector = TileSelector::new(
            &config(1024).with_max_deferred_tiles_per_frame(3),
        );

        let ids: Vec<_> = (0..10).map(TileId).collect();
        let sel = selector.select(1, &mut tiles, &mut atlas, &ids);
        assert_eq!(sel.tiles.len(), 3);
        assert_eq!(sel.deferred, 7);
    }

    #[test]
    fn oversized_tiles_are_downsampled_into_the_bake_image() {
        let mut big = LightmapTile::new(
            TileBinding::default(),
            Aabb::new(Vec3::ZERO, Vec3::new(4000.0, 64.0, 0.0)),
            Vec4::new(0.0, 0.0, 1.0, 0.0),
            4,
        );
        big.setup_tile_transform(2048).unwrap();
        let mut tiles = vec![big];
        let mut atlas = AtlasAllocator::new(2048, 1, 1);
        let mut selector = TileSelector::new(&config(512));

        let sel = selector.select(1, &mut tiles, &mut atlas, &[TileId(0)]);
        let s = sel.tiles[0];
        assert_eq!(s.width, 506);
        assert_eq!(tiles[0].atlas_location.width, 1003);
    }

    #[test]
    fn clean_and_rejected_tiles_are_skipped() {
        let mut clean = tile(64.0);
        clean.clear_bake_flags();
        let mut broken = tile(64.0);
        broken.atlas_location.width = 0;
        let mut tiles = vec![clean, broken];
        let mut atlas = AtlasAllocator::new(1024, 1, 1);
        let mut selector = TileSelector::new(&config(256));

        let sel = selector.select(1, &mut tiles, &mut atlas, &[TileId(0), TileId(1), TileId(9)]);
        assert!(sel.is_empty());
        assert_eq!(sel.rejected, 1);
    }
}
