use super::{BakePass, PassContext};
use crate::bake_image::LightmapBakeImage;
use crate::pipeline::{validated, COPY_SHADER};
use crate::resources::BindGroupLayouts;
use crate::{Error, Result, LIGHTMAP_FORMAT};

/// Resamples baked tiles into their atlas slots, one render pass per layer
pub struct CopyPass {
    pipeline: wgpu::RenderPipeline,
    bind_group: wgpu::BindGroup,
}

impl CopyPass {
    pub fn new(
        device: &wgpu::Device,
        layouts: &BindGroupLayouts,
        bake_image: &LightmapBakeImage,
        copy_tiles: &wgpu::Buffer,
        copy_constants: &wgpu::Buffer,
    ) -> Result<Self> {
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Lightmap Copy Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Lightmap Copy Bind Group"),
            layout: &layouts.copy,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(bake_image.result_view()),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: copy_tiles.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: copy_constants.as_entire_binding(),
                },
            ],
        });

        let pipeline = validated(device, "Lightmap Copy Pipeline", || {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Lightmap Copy Shader"),
                source: wgpu::ShaderSource::Wgsl(COPY_SHADER.into()),
            });
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Lightmap Copy Pipeline Layout"),
                bind_group_layouts: &[&layouts.copy],
                push_constant_ranges: &[],
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Lightmap Copy Pipeline"),
                layout: Some(&layout),
                cache: None,
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &module,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: LIGHTMAP_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            })
        })?;

        Ok(Self { pipeline, bind_group })
    }
}

impl BakePass for CopyPass {
    fn name(&self) -> &str {
        "lightmap_copy"
    }

    fn execute(&mut self, ctx: &mut PassContext) -> Result<()> {
        let plan = ctx.plan;
        let atlas = ctx.atlas;

        for list in &plan.copy_lists {
            let view = atlas.layer_view(list.array_index).ok_or_else(|| {
                Error::Pipeline(format!(
                    "Copy into atlas layer {} but the atlas has {}",
                    list.array_index,
                    atlas.layer_count()
                ))
            })?;
            let mut pass = ctx.begin_render_pass(
                "Lightmap Copy",
                &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
            );
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.draw(0..6, list.first..list.first + list.count);
        }
        Ok(())
    }
}
