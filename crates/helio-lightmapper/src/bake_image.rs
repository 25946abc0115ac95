//! Scratch images the bake passes render through
//!
//! raytrace -> resolve -> blur (horizontal) -> resolve (vertical) -> atlas

use crate::resources::BindGroupLayouts;
use crate::LIGHTMAP_FORMAT;

pub struct BakeTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

impl BakeTarget {
    fn new(device: &wgpu::Device, label: &str, size: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: LIGHTMAP_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }
}

pub struct LightmapBakeImage {
    size: u32,
    pub raytrace: BakeTarget,
    pub resolve: BakeTarget,
    pub blur: BakeTarget,
    /// Reads the raytrace target
    pub resolve_input: wgpu::BindGroup,
    /// Reads the resolve target
    pub blur_horizontal_input: wgpu::BindGroup,
    /// Reads the blur target
    pub blur_vertical_input: wgpu::BindGroup,
    max_x: u32,
    max_y: u32,
}

impl LightmapBakeImage {
    pub fn new(device: &wgpu::Device, layouts: &BindGroupLayouts, size: u32) -> Self {
        let raytrace = BakeTarget::new(device, "Lightmap Raytrace Image", size);
        let resolve = BakeTarget::new(device, "Lightmap Resolve Image", size);
        let blur = BakeTarget::new(device, "Lightmap Blur Image", size);

        let screen = |label: &str, view: &wgpu::TextureView| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &layouts.screen,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view),
                }],
            })
        };
        let resolve_input = screen("Lightmap Resolve Input", &raytrace.view);
        let blur_horizontal_input = screen("Lightmap Blur Horizontal Input", &resolve.view);
        let blur_vertical_input = screen("Lightmap Blur Vertical Input", &blur.view);

        log::info!("Created lightmap bake image: {}x{}", size, size);

        Self {
            size,
            raytrace,
            resolve,
            blur,
            resolve_input,
            blur_horizontal_input,
            blur_vertical_input,
            max_x: 0,
            max_y: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Limits the post passes to the part of the image the last selection used
    pub fn set_extent(&mut self, max_x: u32, max_y: u32) {
        self.max_x = max_x.min(self.size);
        self.max_y = max_y.min(self.size);
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.max_x, self.max_y)
    }

    /// View the copy pass samples from
    pub fn result_view(&self) -> &wgpu::TextureView {
        &self.resolve.view
    }
}
