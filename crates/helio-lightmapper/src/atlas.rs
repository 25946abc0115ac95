//! Layered lightmap atlas texture

use crate::{Error, Result, LIGHTMAP_FORMAT, LIGHTMAP_TEXEL_BYTES};
use helio_lightmap::{LightmapTextureInfo, TransferBudget};

/// Bytes per row of a readback buffer for `width` texels
pub(crate) fn padded_row_bytes(width: u32) -> u32 {
    let unpadded = width * LIGHTMAP_TEXEL_BYTES;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// Submits pending work and waits for it once the staging budget is spent
pub(crate) fn throttle(device: &wgpu::Device, queue: &wgpu::Queue, budget: &mut TransferBudget, bytes: u64) {
    if budget.add(bytes) {
        log::trace!("Upload budget exceeded ({} bytes pending), waiting for GPU", budget.pending());
        queue.submit(std::iter::empty());
        device.poll(wgpu::Maintain::Wait);
        budget.reset();
    }
}

pub struct LightmapAtlas {
    texture: wgpu::Texture,
    layer_views: Vec<wgpu::TextureView>,
    sample_view: wgpu::TextureView,
    size: u32,
    count: u32,
    generation: u64,
}

impl LightmapAtlas {
    /// Creates the atlas described by `info` and uploads its initial texels.
    ///
    /// Everything is checked before the first GPU object is created, so a
    /// failure leaves no partial atlas behind.
    pub fn create(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        info: &LightmapTextureInfo,
        budget: &mut TransferBudget,
    ) -> Result<Self> {
        if info.texture_size == 0 || info.count == 0 {
            return Err(Error::Fatal(format!(
                "Lightmap atlas of {}x{} x {} layers has no texels",
                info.texture_size, info.texture_size, info.count
            )));
        }
        let limits = device.limits();
        if info.texture_size > limits.max_texture_dimension_2d || info.count > limits.max_texture_array_layers {
            return Err(Error::Fatal(format!(
                "Lightmap atlas {}x{} x {} exceeds device limits ({} texels, {} layers)",
                info.texture_size,
                info.texture_size,
                info.count,
                limits.max_texture_dimension_2d,
                limits.max_texture_array_layers
            )));
        }
        if !info.data.is_empty() && info.data.len() != info.expected_len() {
            return Err(helio_lightmap::Error::InvalidLightmapData {
                expected: info.expected_len(),
                actual: info.data.len(),
            }
            .into());
        }

        let size = info.texture_size;
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Lightmap Atlas"),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: info.count,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: LIGHTMAP_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let layer_views = (0..info.count)
            .map(|layer| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(&format!("Lightmap Atlas Layer {}", layer)),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();
        let sample_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Lightmap Atlas View"),
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            ..Default::default()
        });

        if !info.data.is_empty() {
            let layer_len = size as usize * size as usize * 4;
            for (layer, texels) in info.data.chunks_exact(layer_len).enumerate() {
                queue.write_texture(
                    wgpu::ImageCopyTexture {
                        texture: &texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d {
                            x: 0,
                            y: 0,
                            z: layer as u32,
                        },
                        aspect: wgpu::TextureAspect::All,
                    },
                    bytemuck::cast_slice(texels),
                    wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(size * LIGHTMAP_TEXEL_BYTES),
                        rows_per_image: Some(size),
                    },
                    wgpu::Extent3d {
                        width: size,
                        height: size,
                        depth_or_array_layers: 1,
                    },
                );
                throttle(device, queue, budget, (texels.len() * 2) as u64);
            }
        }

        log::info!(
            "Created lightmap atlas: {}x{} x {} layers (generation {}, {})",
            size,
            size,
            info.count,
            info.generation,
            if info.data.is_empty() { "empty" } else { "cached texels" }
        );

        Ok(Self {
            texture,
            layer_views,
            sample_view,
            size,
            count: info.count,
            generation: info.generation,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn layer_count(&self) -> u32 {
        self.count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// `D2Array` view for shading with the lightmap
    pub fn view(&self) -> &wgpu::TextureView {
        &self.sample_view
    }

    /// Render target view of one layer
    pub fn layer_view(&self, array_index: u32) -> Option<&wgpu::TextureView> {
        self.layer_views.get(array_index as usize)
    }

    /// Texel values per layer (RGBA16F, four u16 per texel)
    pub fn layer_len(&self) -> usize {
        self.size as usize * self.size as usize * 4
    }

    /// Reads one layer back into `dest`, blocking until the GPU is done
    pub fn download_layer(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        array_index: u32,
        dest: &mut [u16],
    ) -> Result<()> {
        if array_index >= self.count {
            return Err(Error::Readback(format!(
                "Lightmap layer {} out of range ({} layers)",
                array_index, self.count
            )));
        }
        if dest.len() != self.layer_len() {
            return Err(helio_lightmap::Error::InvalidLightmapData {
                expected: self.layer_len(),
                actual: dest.len(),
            }
            .into());
        }

        let padded_row = padded_row_bytes(self.size);
        let row = (self.size * LIGHTMAP_TEXEL_BYTES) as usize;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Lightmap Readback Buffer"),
            size: padded_row as u64 * self.size as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Lightmap Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: array_index,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(self.size),
                },
            },
            wgpu::Extent3d {
                width: self.size,
                height: self.size,
                depth_or_array_layers: 1,
            },
        );
        queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| Error::Readback("Lightmap readback was dropped".into()))??;

        {
            let mapped = slice.get_mapped_range();
            let out: &mut [u8] = bytemuck::cast_slice_mut(dest);
            for (dst, src) in out.chunks_exact_mut(row).zip(mapped.chunks_exact(padded_row as usize)) {
                dst.copy_from_slice(&src[..row]);
            }
        }
        buffer.unmap();

        log::debug!("Downloaded lightmap layer {} ({} bytes)", array_index, dest.len() * 2);
        Ok(())
    }

    /// Reads every layer back, in layer order
    pub fn download_all(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<Vec<u16>> {
        let layer_len = self.layer_len();
        let mut data = vec![0u16; layer_len * self.count as usize];
        for (layer, chunk) in data.chunks_exact_mut(layer_len).enumerate() {
            self.download_layer(device, queue, layer as u32, chunk)?;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readback_rows_are_aligned() {
        assert_eq!(padded_row_bytes(32), 256);
        assert_eq!(padded_row_bytes(33), 512);
        assert_eq!(padded_row_bytes(1024), 8192);
        assert_eq!(padded_row_bytes(1), 256);
    }
}
