//! Bake passes and their execution context

mod blur;
mod copy;
mod raytrace;
mod resolve;

pub use blur::BlurPass;
pub use copy::CopyPass;
pub use raytrace::RaytracePass;
pub use resolve::ResolvePass;

use crate::atlas::LightmapAtlas;
use crate::bake_image::LightmapBakeImage;
use crate::Result;
use helio_lightmap::BakePlan;

/// One stage of a bake, recorded into the frame's command encoder
pub trait BakePass {
    fn name(&self) -> &str;

    fn execute(&mut self, ctx: &mut PassContext) -> Result<()>;
}

pub struct PassContext<'a> {
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub bake_image: &'a LightmapBakeImage,
    pub plan: &'a BakePlan,
    /// Destination of the copy pass
    pub atlas: &'a LightmapAtlas,
}

impl<'a> PassContext<'a> {
    pub fn begin_render_pass(
        &mut self,
        label: &str,
        color_attachments: &[Option<wgpu::RenderPassColorAttachment>],
    ) -> wgpu::RenderPass {
        self.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments,
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        })
    }
}

/// Attachment that starts out fully uncovered (alpha 0)
pub(crate) fn cleared(view: &wgpu::TextureView) -> Option<wgpu::RenderPassColorAttachment<'_>> {
    Some(wgpu::RenderPassColorAttachment {
        view,
        resolve_target: None,
        ops: wgpu::Operations {
            load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
            store: wgpu::StoreOp::Store,
        },
    })
}

/// Runs a fullscreen pass over the used part of the bake image only
pub(crate) fn draw_screen(
    ctx: &mut PassContext,
    label: &str,
    pipeline: &wgpu::RenderPipeline,
    input: &wgpu::BindGroup,
    target: &wgpu::TextureView,
) {
    let (max_x, max_y) = ctx.bake_image.extent();
    let mut pass = ctx.begin_render_pass(label, &[cleared(target)]);
    if max_x == 0 || max_y == 0 {
        return;
    }
    pass.set_scissor_rect(0, 0, max_x, max_y);
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, input, &[]);
    pass.draw(0..3, 0..1);
}
