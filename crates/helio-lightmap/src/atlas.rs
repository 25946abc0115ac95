//! Permanent atlas slots for lightmap tiles

use crate::packer::RectPacker;
use crate::tile::{AtlasLocation, LightmapTile};
use crate::{Error, Result};

/// Owns the packer for the persistent lightmap atlas.
///
/// Every provisioning event creates a new allocator with a higher
/// generation; locations stamped with an older generation are stale and
/// must not be sampled.
pub struct AtlasAllocator {
    packer: RectPacker,
    texture_size: u32,
    generation: u64,
}

impl AtlasAllocator {
    pub fn new(texture_size: u32, max_layers: u32, generation: u64) -> Self {
        Self {
            packer: RectPacker::new(texture_size, texture_size, 0, 0, max_layers),
            texture_size,
            generation,
        }
    }

    pub fn texture_size(&self) -> u32 {
        self.texture_size
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Layers currently holding at least one page
    pub fn layer_count(&self) -> u32 {
        self.packer.page_count()
    }

    /// Stops growing past the layers already in use.
    ///
    /// Called once the GPU texture has been created with a fixed layer count.
    pub fn lock_layers(&mut self) {
        let layers = self.packer.page_count().max(1);
        self.packer.set_max_pages(layers);
    }

    /// True when `loc` is a live slot of this provisioning
    pub fn is_current(&self, loc: &AtlasLocation) -> bool {
        loc.generation == self.generation
            && loc.item.and_then(|item| self.packer.get(item)).is_some()
    }

    /// Makes sure `tile` owns a slot matching its current size.
    ///
    /// Returns `Ok(true)` when a new slot was assigned.
    pub fn ensure(&mut self, tile: &mut LightmapTile) -> Result<bool> {
        let loc = tile.atlas_location;
        if self.is_current(&loc) {
            let fits = loc
                .item
                .and_then(|item| self.packer.get(item))
                .is_some_and(|r| r.width == loc.width && r.height == loc.height);
            if fits {
                return Ok(false);
            }
        }
        self.release(tile);

        let loc = &mut tile.atlas_location;
        let rect = self
            .packer
            .alloc(loc.width, loc.height)
            .ok_or(Error::AtlasFull {
                size: self.texture_size,
                layers: self.packer.max_pages(),
            })?;

        loc.x = rect.x;
        loc.y = rect.y;
        loc.array_index = rect.page;
        loc.item = Some(rect.item);
        loc.generation = self.generation;
        Ok(true)
    }

    /// Returns the tile's slot to the packer, if it holds one from this generation.
    pub fn release(&mut self, tile: &mut LightmapTile) {
        let loc = &mut tile.atlas_location;
        if let Some(item) = loc.item.take() {
            if loc.generation == self.generation {
                self.packer.free(item);
            }
        }
    }

    /// Frees slots of tiles unseen for at least `min_age` frames.
    ///
    /// Oldest tiles go first; stops once `wanted_area` texels were reclaimed.
    /// Evicted tiles need a fresh bake before they can be sampled again.
    pub fn evict_stale(
        &mut self,
        tiles: &mut [LightmapTile],
        frame: u64,
        min_age: u64,
        wanted_area: u32,
    ) -> usize {
        let mut stale: Vec<usize> = tiles
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                self.is_current(&t.atlas_location) && frame.saturating_sub(t.last_seen) >= min_age
            })
            .map(|(i, _)| i)
            .collect();
        stale.sort_by_key(|&i| tiles[i].last_seen);

        let mut reclaimed = 0u32;
        let mut evicted = 0;
        for i in stale {
            if reclaimed >= wanted_area {
                break;
            }
            let tile = &mut tiles[i];
            reclaimed += tile.atlas_location.area();
            self.release(tile);
            tile.needs_initial_bake = true;
            evicted += 1;
        }

        if evicted > 0 {
            log::debug!("Evicted {evicted} stale lightmap tiles ({reclaimed} texels)");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Aabb;
    use crate::tile::TileBinding;
    use glam::{Vec3, Vec4};

    fn sized_tile(w: u32, h: u32) -> LightmapTile {
        let mut t = LightmapTile::new(
            TileBinding::default(),
            Aabb::new(Vec3::ZERO, Vec3::ONE),
            Vec4::new(0.0, 0.0, 1.0, 0.0),
            8,
        );
        t.atlas_location.width = w;
        t.atlas_location.height = h;
        t
    }

    #[test]
    fn slot_is_kept_while_size_is_unchanged() {
        let mut atlas = AtlasAllocator::new(64, 1, 3);
        let mut tile = sized_tile(10, 10);
        assert!(atlas.ensure(&mut tile).unwrap());
        assert!(!atlas.ensure(&mut tile).unwrap());
        assert_eq!(tile.atlas_location.generation, 3);

        tile.atlas_location.width = 12;
        assert!(atlas.ensure(&mut tile).unwrap());
        assert_eq!(atlas.layer_count(), 1);
    }

    #[test]
    fn older_generation_is_never_current() {
        let mut old = AtlasAllocator::new(64, 1, 1);
        let mut tile = sized_tile(8, 8);
        old.ensure(&mut tile).unwrap();

        let new = AtlasAllocator::new(64, 1, 2);
        assert!(old.is_current(&tile.atlas_location));
        assert!(!new.is_current(&tile.atlas_location));
    }

    #[test]
    fn full_atlas_reports_and_eviction_frees_room() {
        let mut atlas = AtlasAllocator::new(32, 1, 1);
        let mut tiles = vec![sized_tile(32, 16), sized_tile(32, 16), sized_tile(32, 16)];
        atlas.ensure(&mut tiles[0]).unwrap();
        atlas.ensure(&mut tiles[1]).unwrap();
        tiles[0].last_seen = 5;
        tiles[1].last_seen = 90;

        assert!(matches!(atlas.ensure(&mut tiles[2]), Err(Error::AtlasFull { .. })));

        let evicted = atlas.evict_stale(&mut tiles, 100, 50, 512);
        assert_eq!(evicted, 1);
        assert!(tiles[0].needs_initial_bake);
        assert!(tiles[0].atlas_location.item.is_none());
        assert!(atlas.ensure(&mut tiles[2]).is_ok());
    }

    #[test]
    fn lock_layers_caps_growth() {
        let mut atlas = AtlasAllocator::new(16, 8, 1);
        let mut a = sized_tile(16, 16);
        atlas.ensure(&mut a).unwrap();
        atlas.lock_layers();
        assert!(atlas.is_current(&a.atlas_location));
        assert!(atlas.ensure(&mut sized_tile(4, 4)).is_err());
    }
}
