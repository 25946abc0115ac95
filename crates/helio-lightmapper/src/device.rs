//! Render device: owns the GPU, the level mesh, textures and the lightmapper
//!
//! A level mesh handed to [`LightmapRenderDevice::set_level_mesh`] takes
//! effect at the next [`begin_frame`](LightmapRenderDevice::begin_frame):
//! its atlas texture is created, its geometry uploaded and bakes start from
//! there. Until a level is set an empty mesh stands in.

use crate::lightmapper::{BakeReport, Lightmapper};
use crate::textures::TextureManager;
use crate::{Error, Result};
use helio_lightmap::{
    LevelMesh, LightmapCache, LightmapRaytracePC, LightmapperConfig, TileId, DRAW_BUFFER_CAPACITY,
};
use std::path::Path;
use std::sync::Arc;

/// How raytrace draws reach the GPU, fixed when the device is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawSubmission {
    /// `draw_indexed_indirect` from the command buffer; needs
    /// `INDIRECT_FIRST_INSTANCE` to address per-draw constants
    Indirect,
    /// One `draw_indexed` per command recorded on the CPU
    Direct,
}

#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub submission: DrawSubmission,
    pub max_texture_size: u32,
    pub max_array_layers: u32,
    pub min_uniform_alignment: u32,
}

impl DeviceCapabilities {
    /// Storage buffers the raytrace fragment stage binds
    pub const REQUIRED_STORAGE_BUFFERS: u32 = 5;

    /// Checks that the device can bake at all and picks the draw submission.
    ///
    /// Missing requirements are fatal.
    pub fn detect(device: &wgpu::Device, config: &LightmapperConfig) -> Result<Self> {
        let limits = device.limits();
        if limits.max_storage_buffers_per_shader_stage < Self::REQUIRED_STORAGE_BUFFERS {
            return Err(Error::Fatal(format!(
                "Lightmapper needs {} storage buffers per stage, device has {}",
                Self::REQUIRED_STORAGE_BUFFERS,
                limits.max_storage_buffers_per_shader_stage
            )));
        }
        if limits.max_texture_dimension_2d < config.bake_image_size {
            return Err(Error::Fatal(format!(
                "Bake image of {} texels exceeds the device limit of {}",
                config.bake_image_size, limits.max_texture_dimension_2d
            )));
        }
        let constants_size = (DRAW_BUFFER_CAPACITY * std::mem::size_of::<LightmapRaytracePC>()) as u64;
        if (limits.max_storage_buffer_binding_size as u64) < constants_size {
            return Err(Error::Fatal(format!(
                "Raytrace constants need a {} byte storage binding, device allows {}",
                constants_size, limits.max_storage_buffer_binding_size
            )));
        }

        let indirect = device.features().contains(wgpu::Features::INDIRECT_FIRST_INSTANCE);
        let submission = if config.use_indirect_draws && indirect {
            DrawSubmission::Indirect
        } else {
            DrawSubmission::Direct
        };

        Ok(Self {
            submission,
            max_texture_size: limits.max_texture_dimension_2d,
            max_array_layers: limits.max_texture_array_layers,
            min_uniform_alignment: limits.min_uniform_buffer_offset_alignment,
        })
    }
}

pub struct LightmapRenderDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    capabilities: DeviceCapabilities,
    textures: TextureManager,
    lightmapper: Lightmapper,
    level: LevelMesh,
    next_level: Option<LevelMesh>,
    level_changed: bool,
    frame_tile_updates: usize,
    frame_count: u64,
}

impl LightmapRenderDevice {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, config: LightmapperConfig) -> Result<Self> {
        log::info!("Creating lightmap render device");
        let capabilities = DeviceCapabilities::detect(&device, &config)?;
        log::info!("  Max texture size: {}", capabilities.max_texture_size);
        log::info!("  Max array layers: {}", capabilities.max_array_layers);

        let textures = TextureManager::new(device.clone(), queue.clone(), &config)?;
        let lightmapper = Lightmapper::new(device.clone(), queue.clone(), config, capabilities.submission)?;

        Ok(Self {
            device,
            queue,
            capabilities,
            textures,
            lightmapper,
            level: LevelMesh::new(),
            next_level: None,
            // The stand-in mesh still needs its atlas and buffers
            level_changed: true,
            frame_tile_updates: 0,
            frame_count: 0,
        })
    }

    /// Creates a device without a window, blocking on adapter selection
    pub fn headless(config: LightmapperConfig) -> Result<Self> {
        let (device, queue) = pollster::block_on(async {
            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .ok_or_else(|| Error::Fatal("No GPU adapter available".into()))?;
            log::info!("Using adapter: {}", adapter.get_info().name);

            let features = adapter.features() & wgpu::Features::INDIRECT_FIRST_INSTANCE;
            adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("Helio Lightmapper Device"),
                        required_features: features,
                        required_limits: adapter.limits(),
                        memory_hints: wgpu::MemoryHints::default(),
                    },
                    None,
                )
                .await
                .map_err(|e| Error::Fatal(e.to_string()))
        })?;
        Self::new(Arc::new(device), Arc::new(queue), config)
    }

    /// Replaces the level mesh at the next frame start; `None` unloads it
    pub fn set_level_mesh(&mut self, mesh: Option<LevelMesh>) {
        self.next_level = Some(mesh.unwrap_or_default());
        self.level_changed = true;
    }

    pub fn begin_frame(&mut self) -> Result<()> {
        self.frame_count += 1;
        self.frame_tile_updates = 0;
        log::trace!("Lightmap device frame {}", self.frame_count);

        let applied = self.textures.begin_frame();
        if applied > 0 {
            log::debug!("Applied {} background texture uploads", applied);
        }

        if self.level_changed {
            self.level_changed = false;
            if let Some(next) = self.next_level.take() {
                self.level = next;
            }
            self.textures.create_lightmap(&self.level.lightmap)?;
            // The atlas owns the texels now
            self.level.lightmap.data = Vec::new();
            self.lightmapper.set_level_mesh(&self.level);
            log::info!(
                "Level mesh changed: {} surfaces, {} tiles",
                self.level.surfaces.len(),
                self.level.tiles.len()
            );
        }

        self.lightmapper.begin_frame(self.frame_count)
    }

    /// Bakes whichever of `tiles` need it; call after [`begin_frame`](Self::begin_frame)
    pub fn update_lightmaps(&mut self, tiles: &[TileId]) -> Result<BakeReport> {
        self.frame_tile_updates += tiles.len();
        let atlas = self
            .textures
            .lightmap()
            .ok_or_else(|| Error::Fatal("Lightmap atlas missing, begin_frame was not called".into()))?;
        self.lightmapper.raytrace(&mut self.level, atlas, tiles)
    }

    /// Re-uploads geometry and lights after editing [`level_mut`](Self::level_mut)
    pub fn refresh_level(&mut self) {
        self.lightmapper.set_level_mesh(&self.level);
    }

    pub fn download_lightmap(&self, array_index: u32, dest: &mut [u16]) -> Result<()> {
        self.textures.download_lightmap(array_index, dest)
    }

    /// Reads back the whole atlas and writes it as a lightmap cache file
    pub fn save_lightmap_cache(&self, path: impl AsRef<Path>) -> Result<()> {
        let atlas = self
            .textures
            .lightmap()
            .ok_or_else(|| Error::Readback("No lightmap atlas has been created".into()))?;
        let data = atlas.download_all(&self.device, &self.queue)?;
        LightmapCache::new(atlas.size(), atlas.layer_count(), data).save(path)?;
        Ok(())
    }

    pub fn level(&self) -> &LevelMesh {
        &self.level
    }

    pub fn level_mut(&mut self) -> &mut LevelMesh {
        &mut self.level
    }

    /// Tiles requested through [`update_lightmaps`](Self::update_lightmaps) this frame
    pub fn frame_tile_updates(&self) -> usize {
        self.frame_tile_updates
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn textures(&self) -> &TextureManager {
        &self.textures
    }

    pub fn textures_mut(&mut self) -> &mut TextureManager {
        &mut self.textures
    }

    pub fn lightmapper(&self) -> &Lightmapper {
        &self.lightmapper
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }
}
