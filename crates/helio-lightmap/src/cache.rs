//! On-disk lightmap cache
//!
//! Stores the full atlas (every layer, raw RGBA16F texels) so a level can
//! start with baked lighting instead of re-baking every tile.

use crate::level::LightmapTextureInfo;
use crate::{Error, Result};
use half::f16;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LightmapCache {
    pub texture_size: u32,
    pub layer_count: u32,
    /// `texture_size * texture_size * layer_count` RGBA16F texels
    pub data: Vec<u16>,
}

impl LightmapCache {
    pub fn new(texture_size: u32, layer_count: u32, data: Vec<u16>) -> Self {
        Self {
            texture_size,
            layer_count,
            data,
        }
    }

    /// u16 values of one layer
    pub fn layer_len(&self) -> usize {
        self.texture_size as usize * self.texture_size as usize * 4
    }

    pub fn validate(&self) -> Result<()> {
        let expected = self.layer_len() * self.layer_count as usize;
        if self.texture_size == 0 || self.layer_count == 0 || self.data.len() != expected {
            return Err(Error::InvalidLightmapData {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn layer(&self, index: u32) -> Option<&[u16]> {
        let len = self.layer_len();
        let start = index as usize * len;
        self.data.get(start..start + len)
    }

    /// Decoded RGBA of one texel
    pub fn texel(&self, layer: u32, x: u32, y: u32) -> Option<[f32; 4]> {
        if x >= self.texture_size || y >= self.texture_size {
            return None;
        }
        let texels = self.layer(layer)?;
        let i = (y as usize * self.texture_size as usize + x as usize) * 4;
        let rgba = &texels[i..i + 4];
        Some([
            f16::from_bits(rgba[0]).to_f32(),
            f16::from_bits(rgba[1]).to_f32(),
            f16::from_bits(rgba[2]).to_f32(),
            f16::from_bits(rgba[3]).to_f32(),
        ])
    }

    pub fn write_to(&self, writer: impl Write) -> Result<()> {
        self.validate()?;
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn read_from(reader: impl Read) -> Result<Self> {
        let cache: Self = bincode::deserialize_from(reader)?;
        cache.validate()?;
        Ok(cache)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        log::info!(
            "Saved lightmap cache {} ({} layers of {}x{})",
            path.display(),
            self.layer_count,
            self.texture_size,
            self.texture_size
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let cache = Self::read_from(BufReader::new(File::open(path)?))?;
        log::info!("Loaded lightmap cache {}", path.display());
        Ok(cache)
    }

    /// Texture info for provisioning the atlas with these texels
    pub fn into_texture_info(self, generation: u64) -> LightmapTextureInfo {
        LightmapTextureInfo {
            texture_size: self.texture_size,
            count: self.layer_count,
            data: self.data,
            generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_marker() -> LightmapCache {
        let mut data = vec![0u16; 8 * 8 * 4 * 2];
        let i = 8 * 8 * 4 + (3 * 8 + 5) * 4;
        data[i] = f16::from_f32(0.5).to_bits();
        data[i + 3] = f16::ONE.to_bits();
        LightmapCache::new(8, 2, data)
    }

    #[test]
    fn survives_a_trip_through_bincode() {
        let cache = cache_with_marker();
        let mut bytes = Vec::new();
        cache.write_to(&mut bytes).unwrap();
        let loaded = LightmapCache::read_from(bytes.as_slice()).unwrap();
        assert_eq!(loaded, cache);
        assert_eq!(loaded.texel(1, 5, 3), Some([0.5, 0.0, 0.0, 1.0]));
        assert_eq!(loaded.texel(0, 5, 3), Some([0.0; 4]));
    }

    #[test]
    fn truncated_data_is_rejected() {
        let mut cache = cache_with_marker();
        cache.data.pop();
        assert!(matches!(
            cache.validate(),
            Err(Error::InvalidLightmapData { expected: 512, actual: 511 })
        ));
        assert!(cache.write_to(Vec::new()).is_err());
        assert!(cache.layer(1).is_none());
    }

    #[test]
    fn saves_and_loads_files() {
        let path = std::env::temp_dir().join(format!("helio-lightmap-{}.bin", std::process::id()));
        let cache = cache_with_marker();
        cache.save(&path).unwrap();
        let loaded = LightmapCache::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.into_texture_info(3).count, 2);
    }
}
