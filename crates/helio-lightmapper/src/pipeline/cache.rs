/// Raytrace pipeline cache, one pipeline per feature combination

use super::{apply_defines, validated, ShaderDefine, RAYTRACE_SHADER};
use crate::resources::BindGroupLayouts;
use crate::{Result, LIGHTMAP_FORMAT};
use helio_lightmap::{LevelVertex, RaytraceFlags};
use std::collections::HashMap;
use std::sync::Arc;

pub struct RaytracePipelineCache {
    device: Arc<wgpu::Device>,
    layout: wgpu::PipelineLayout,
    cache: HashMap<RaytraceFlags, Arc<wgpu::RenderPipeline>>,
}

impl RaytracePipelineCache {
    pub fn new(device: Arc<wgpu::Device>, layouts: &BindGroupLayouts) -> Self {
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Lightmap Raytrace Pipeline Layout"),
            bind_group_layouts: &[&layouts.scene],
            push_constant_ranges: &[],
        });
        Self {
            device,
            layout,
            cache: HashMap::new(),
        }
    }

    /// Overrides selecting the shader paths of `flags`
    pub fn defines(flags: RaytraceFlags) -> Vec<(&'static str, ShaderDefine)> {
        vec![
            ("USE_SOFT_SHADOWS", ShaderDefine::Bool(flags.contains(RaytraceFlags::SOFT_SHADOWS))),
            ("USE_AMBIENT_OCCLUSION", ShaderDefine::Bool(flags.contains(RaytraceFlags::AMBIENT_OCCLUSION))),
            ("USE_SUNLIGHT", ShaderDefine::Bool(flags.contains(RaytraceFlags::SUNLIGHT))),
            ("USE_LIGHT_BOUNCE", ShaderDefine::Bool(flags.contains(RaytraceFlags::LIGHT_BOUNCE))),
        ]
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn get_or_create(&mut self, flags: RaytraceFlags) -> Result<Arc<wgpu::RenderPipeline>> {
        if let Some(pipeline) = self.cache.get(&flags) {
            log::trace!("Using cached raytrace pipeline {}", flags.pipeline_index());
            return Ok(pipeline.clone());
        }

        log::info!("Creating lightmap raytrace pipeline {} ({:?})", flags.pipeline_index(), flags);
        let source = apply_defines(RAYTRACE_SHADER, &Self::defines(flags));
        let label = format!("Lightmap Raytrace {}", flags.pipeline_index());

        let pipeline = validated(&self.device, &label, || {
            let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            self.create_pipeline(&label, &module)
        })?;

        let pipeline = Arc::new(pipeline);
        self.cache.insert(flags, pipeline.clone());
        Ok(pipeline)
    }

    fn create_pipeline(&self, label: &str, module: &wgpu::ShaderModule) -> wgpu::RenderPipeline {
        self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(&self.layout),
            cache: None,
            vertex: wgpu::VertexState {
                module,
                entry_point: Some("vs_main"),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<LevelVertex>() as u64,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &[
                        // position: vec3<f32>
                        wgpu::VertexAttribute {
                            format: wgpu::VertexFormat::Float32x3,
                            offset: 0,
                            shader_location: 0,
                        },
                    ],
                }],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: LIGHTMAP_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                // Surfaces project onto their tile from either side
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        })
    }
}
