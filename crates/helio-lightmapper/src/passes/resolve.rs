use super::{draw_screen, BakePass, PassContext};
use crate::pipeline::{create_screen_pipeline, validated, RESOLVE_SHADER};
use crate::resources::BindGroupLayouts;
use crate::Result;

/// Fills the texels around each tile that rasterization did not reach
pub struct ResolvePass {
    pipeline: wgpu::RenderPipeline,
}

impl ResolvePass {
    pub fn new(device: &wgpu::Device, layouts: &BindGroupLayouts) -> Result<Self> {
        let pipeline = validated(device, "Lightmap Resolve Pipeline", || {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Lightmap Resolve Shader"),
                source: wgpu::ShaderSource::Wgsl(RESOLVE_SHADER.into()),
            });
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Lightmap Resolve Pipeline Layout"),
                bind_group_layouts: &[&layouts.screen],
                push_constant_ranges: &[],
            });
            create_screen_pipeline(device, "Lightmap Resolve Pipeline", &layout, &module)
        })?;
        Ok(Self { pipeline })
    }
}

impl BakePass for ResolvePass {
    fn name(&self) -> &str {
        "lightmap_resolve"
    }

    fn execute(&mut self, ctx: &mut PassContext) -> Result<()> {
        let image = ctx.bake_image;
        draw_screen(ctx, "Lightmap Resolve", &self.pipeline, &image.resolve_input, &image.resolve.view);
        Ok(())
    }
}
