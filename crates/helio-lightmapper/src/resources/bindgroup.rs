//! Bind group layouts of the bake passes
//!
//! - Scene: bake uniforms, raytrace constants, BVH, lights, surface planes
//! - Screen: one bake image read with `textureLoad` (resolve, blur)
//! - Copy: filtered bake image, copy tile list and copy constants

use std::sync::Arc;

#[derive(Clone)]
pub struct BindGroupLayouts {
    pub scene: Arc<wgpu::BindGroupLayout>,
    pub screen: Arc<wgpu::BindGroupLayout>,
    pub copy: Arc<wgpu::BindGroupLayout>,
}

impl BindGroupLayouts {
    pub fn new(device: &wgpu::Device) -> Self {
        Self {
            scene: Arc::new(Self::create_scene_layout(device)),
            screen: Arc::new(Self::create_screen_layout(device)),
            copy: Arc::new(Self::create_copy_layout(device)),
        }
    }

    /// Raytrace group 0
    ///
    /// The uniform slot uses a dynamic offset into the bake uniform ring.
    fn create_scene_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Lightmap Scene Bind Group Layout"),
            entries: &[
                // Binding 0: BakeUniforms
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Binding 1: per-draw raytrace constants, indexed by instance
                storage_entry(1, wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT),
                // Binding 2: BVH nodes
                storage_entry(2, wgpu::ShaderStages::FRAGMENT),
                // Binding 3: BVH triangles
                storage_entry(3, wgpu::ShaderStages::FRAGMENT),
                // Binding 4: point lights
                storage_entry(4, wgpu::ShaderStages::FRAGMENT),
                // Binding 5: surface planes
                storage_entry(5, wgpu::ShaderStages::FRAGMENT),
            ],
        })
    }

    fn create_screen_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Lightmap Screen Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            }],
        })
    }

    /// Copy group 0
    ///
    /// The source is sampled bilinearly so downsampled tiles resample cleanly.
    fn create_copy_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Lightmap Copy Bind Group Layout"),
            entries: &[
                // Binding 0: resolved bake image
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                // Binding 1: linear clamp sampler
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                // Binding 2: CopyTileInfo list
                storage_entry(2, wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT),
                // Binding 3: LightmapCopyPC
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        })
    }
}

fn storage_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
