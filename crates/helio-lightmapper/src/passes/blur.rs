use super::{draw_screen, BakePass, PassContext};
use crate::pipeline::{apply_defines, create_screen_pipeline, validated, ShaderDefine, BLUR_SHADER};
use crate::resources::BindGroupLayouts;
use crate::Result;

/// Separable blur: resolve -> blur image horizontally, then back vertically
pub struct BlurPass {
    horizontal: wgpu::RenderPipeline,
    vertical: wgpu::RenderPipeline,
}

impl BlurPass {
    pub fn new(device: &wgpu::Device, layouts: &BindGroupLayouts) -> Result<Self> {
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Lightmap Blur Pipeline Layout"),
            bind_group_layouts: &[&layouts.screen],
            push_constant_ranges: &[],
        });
        let create = |horizontal: bool| {
            let label = if horizontal {
                "Lightmap Blur Horizontal"
            } else {
                "Lightmap Blur Vertical"
            };
            let source = apply_defines(BLUR_SHADER, &[("BLUR_HORIZONTAL", ShaderDefine::Bool(horizontal))]);
            validated(device, label, || {
                let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(label),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                });
                create_screen_pipeline(device, label, &layout, &module)
            })
        };
        Ok(Self {
            horizontal: create(true)?,
            vertical: create(false)?,
        })
    }
}

impl BakePass for BlurPass {
    fn name(&self) -> &str {
        "lightmap_blur"
    }

    fn execute(&mut self, ctx: &mut PassContext) -> Result<()> {
        let image = ctx.bake_image;
        draw_screen(
            ctx,
            "Lightmap Blur Horizontal",
            &self.horizontal,
            &image.blur_horizontal_input,
            &image.blur.view,
        );
        draw_screen(
            ctx,
            "Lightmap Blur Vertical",
            &self.vertical,
            &image.blur_vertical_input,
            &image.resolve.view,
        );
        Ok(())
    }
}
