//! Texture creation and upload
//!
//! Owns the lightmap atlas and any other GPU textures the bake needs.
//! Texel data can be prepared on a worker thread; results are applied on
//! the main thread at the next [`TextureManager::begin_frame`], and only if
//! the texture that asked for them still exists.

use crate::atlas::{throttle, LightmapAtlas};
use crate::{Error, Result};
use helio_lightmap::{LightmapTextureInfo, LightmapperConfig, TransferBudget, UploadId, UploadQueue, UploadTicket};
use std::collections::HashMap;
use std::sync::Arc;

const RGBA8_BYTES: u32 = 4;

/// Number of mip levels down to 1x1
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Halves an RGBA8 image with a 2x2 box filter
fn downsample_rgba8(data: &[u8], width: u32, height: u32) -> (Vec<u8>, u32, u32) {
    let w = (width / 2).max(1);
    let h = (height / 2).max(1);
    let mut out = vec![0u8; (w * h * RGBA8_BYTES) as usize];
    for y in 0..h {
        for x in 0..w {
            for c in 0..RGBA8_BYTES {
                let mut sum = 0u32;
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let sx = (x * 2 + dx).min(width - 1);
                    let sy = (y * 2 + dy).min(height - 1);
                    sum += data[((sy * width + sx) * RGBA8_BYTES + c) as usize] as u32;
                }
                out[((y * w + x) * RGBA8_BYTES + c) as usize] = ((sum + 2) / 4) as u8;
            }
        }
    }
    (out, w, h)
}

#[derive(Debug, Clone, Copy)]
pub struct TextureRequest<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub mipmapped: bool,
    pub srgb: bool,
}

/// An RGBA8 texture created by the [`TextureManager`]
pub struct HwTexture {
    texture: Arc<wgpu::Texture>,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    mip_levels: u32,
    ticket: Option<UploadTicket>,
}

impl HwTexture {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Id of the background upload this texture is waiting for
    pub fn pending_upload(&self) -> Option<UploadId> {
        self.ticket.as_ref().map(|t| t.id())
    }
}

struct PendingUpload {
    texture: Arc<wgpu::Texture>,
    width: u32,
    height: u32,
    mip_levels: u32,
}

pub struct TextureManager {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    budget: TransferBudget,
    async_uploads: bool,
    uploads: UploadQueue<Vec<u8>>,
    pending: HashMap<UploadId, PendingUpload>,
    lightmap: Option<LightmapAtlas>,
}

impl TextureManager {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, config: &LightmapperConfig) -> Result<Self> {
        let uploads = UploadQueue::new("helio-texture-upload").map_err(helio_lightmap::Error::from)?;
        Ok(Self {
            device,
            queue,
            budget: TransferBudget::new(config.staging_budget_bytes),
            async_uploads: config.async_textures,
            uploads,
            pending: HashMap::new(),
            lightmap: None,
        })
    }

    pub fn create_texture(&self, request: &TextureRequest<'_>) -> Result<HwTexture> {
        if request.width == 0 || request.height == 0 {
            return Err(Error::Fatal(format!(
                "Texture '{}' has zero size ({}x{})",
                request.label, request.width, request.height
            )));
        }
        let max = self.device.limits().max_texture_dimension_2d;
        if request.width > max || request.height > max {
            return Err(Error::Fatal(format!(
                "Texture '{}' ({}x{}) exceeds the device limit of {}",
                request.label, request.width, request.height, max
            )));
        }

        let mip_levels = if request.mipmapped {
            mip_level_count(request.width, request.height)
        } else {
            1
        };
        let format = if request.srgb {
            wgpu::TextureFormat::Rgba8UnormSrgb
        } else {
            wgpu::TextureFormat::Rgba8Unorm
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(request.label),
            size: wgpu::Extent3d {
                width: request.width,
                height: request.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(HwTexture {
            texture: Arc::new(texture),
            view,
            width: request.width,
            height: request.height,
            mip_levels,
            ticket: None,
        })
    }

    /// Uploads level 0 from `data` and generates the rest of the mip chain
    pub fn upload(&mut self, texture: &HwTexture, data: &[u8]) -> Result<()> {
        let target = PendingUpload {
            texture: texture.texture.clone(),
            width: texture.width,
            height: texture.height,
            mip_levels: texture.mip_levels,
        };
        write_levels(&self.device, &self.queue, &mut self.budget, &target, data)
    }

    /// Prepares texels on the worker thread and uploads them at a later
    /// [`begin_frame`](Self::begin_frame).
    ///
    /// Runs `prepare` inline when asynchronous textures are disabled.
    /// Dropping `texture` before the data arrives discards it.
    pub fn upload_async(
        &mut self,
        texture: &mut HwTexture,
        prepare: impl FnOnce() -> Vec<u8> + Send + 'static,
    ) -> Result<()> {
        if !self.async_uploads {
            let data = prepare();
            return self.upload(texture, &data);
        }

        let ticket = self.uploads.issue();
        self.pending.insert(
            ticket.id(),
            PendingUpload {
                texture: texture.texture.clone(),
                width: texture.width,
                height: texture.height,
                mip_levels: texture.mip_levels,
            },
        );
        self.uploads.submit(&ticket, prepare);
        // Replacing an older ticket cancels its upload
        texture.ticket = Some(ticket);
        Ok(())
    }

    pub fn is_uploading(&self, texture: &HwTexture) -> bool {
        texture
            .pending_upload()
            .is_some_and(|id| self.pending.contains_key(&id))
    }

    /// Applies worker results that arrived since the last frame
    pub fn begin_frame(&mut self) -> usize {
        let uploads = &self.uploads;
        self.pending.retain(|id, _| uploads.is_live(*id));

        let (device, queue) = (&self.device, &self.queue);
        let pending = &mut self.pending;
        let budget = &mut self.budget;
        self.uploads.process_main_thread_tasks(|id, data| {
            apply_upload(device, queue, budget, pending, id, &data);
        })
    }

    /// Blocks until every live background upload has been applied
    pub fn wait_for_uploads(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let uploads = &self.uploads;
            self.pending.retain(|id, _| uploads.is_live(*id));
            if self.pending.is_empty() {
                return applied;
            }

            let (device, queue) = (&self.device, &self.queue);
            let pending = &mut self.pending;
            let budget = &mut self.budget;
            let Some(done) = self.uploads.wait_and_process(|id, data| {
                apply_upload(device, queue, budget, pending, id, &data);
            }) else {
                log::warn!("Texture upload worker exited with {} uploads pending", self.pending.len());
                return applied;
            };
            applied += done;
        }
    }

    /// Replaces the lightmap atlas.
    ///
    /// On failure the previous atlas stays in place.
    pub fn create_lightmap(&mut self, info: &LightmapTextureInfo) -> Result<&LightmapAtlas> {
        let atlas = LightmapAtlas::create(&self.device, &self.queue, info, &mut self.budget)?;
        Ok(self.lightmap.insert(atlas))
    }

    pub fn lightmap(&self) -> Option<&LightmapAtlas> {
        self.lightmap.as_ref()
    }

    pub fn download_lightmap(&self, array_index: u32, dest: &mut [u16]) -> Result<()> {
        let atlas = self
            .lightmap
            .as_ref()
            .ok_or_else(|| Error::Readback("No lightmap atlas has been created".into()))?;
        atlas.download_layer(&self.device, &self.queue, array_index, dest)
    }

    pub fn budget(&self) -> &TransferBudget {
        &self.budget
    }
}

fn apply_upload(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    budget: &mut TransferBudget,
    pending: &mut HashMap<UploadId, PendingUpload>,
    id: UploadId,
    data: &[u8],
) {
    let Some(target) = pending.remove(&id) else {
        return;
    };
    if let Err(err) = write_levels(device, queue, budget, &target, data) {
        log::warn!("Background upload {:?} failed: {}", id, err);
    }
}

fn write_levels(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    budget: &mut TransferBudget,
    target: &PendingUpload,
    data: &[u8],
) -> Result<()> {
    let expected = (target.width * target.height * RGBA8_BYTES) as usize;
    if data.len() != expected {
        return Err(Error::InvalidUpload {
            expected,
            actual: data.len(),
        });
    }

    let mut level = std::borrow::Cow::Borrowed(data);
    let (mut width, mut height) = (target.width, target.height);
    for mip in 0..target.mip_levels {
        if mip > 0 {
            let (next, w, h) = downsample_rgba8(&level, width, height);
            level = std::borrow::Cow::Owned(next);
            width = w;
            height = h;
        }
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &target.texture,
                mip_level: mip,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &level,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * RGBA8_BYTES),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        throttle(device, queue, budget, level.len() as u64);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_reaches_one_texel() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(300, 17), 9);
        assert_eq!(mip_level_count(1, 1024), 11);
    }

    #[test]
    fn box_filter_averages_quads() {
        #[rustfmt::skip]
        let data = [
            0, 0, 0, 255,    100, 0, 0, 255,
            200, 0, 0, 255,  100, 0, 0, 255,
        ];
        let (out, w, h) = downsample_rgba8(&data, 2, 2);
        assert_eq!((w, h), (1, 1));
        assert_eq!(out, vec![100, 0, 0, 255]);
    }

    #[test]
    fn odd_sizes_clamp_at_the_edge() {
        let data: Vec<u8> = (0..3u8).flat_map(|v| [v * 10, 0, 0, 0]).collect();
        let (out, w, h) = downsample_rgba8(&data, 3, 1);
        assert_eq!((w, h), (1, 1));
        // Rows past the bottom edge repeat the last row: (0 + 10) * 2 / 4
        assert_eq!(out[0], 5);
    }
}
