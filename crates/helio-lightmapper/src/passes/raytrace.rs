use super::{cleared, BakePass, PassContext};
use crate::device::DrawSubmission;
use crate::level_buffers::LevelBuffers;
use crate::{Error, Result};
use helio_lightmap::DrawIndexedCommand;
use std::sync::Arc;

/// Draws every tile surface into the bake image with the raytrace shader
pub struct RaytracePass {
    submission: DrawSubmission,
    /// Filled from the bake plan before the pass runs
    commands: Arc<wgpu::Buffer>,
    pipeline: Option<Arc<wgpu::RenderPipeline>>,
    scene: Option<Arc<wgpu::BindGroup>>,
    vertices: Option<Arc<wgpu::Buffer>>,
    indices: Option<Arc<wgpu::Buffer>>,
    uniform_offset: u32,
}

impl RaytracePass {
    pub fn new(submission: DrawSubmission, commands: Arc<wgpu::Buffer>) -> Self {
        Self {
            submission,
            commands,
            pipeline: None,
            scene: None,
            vertices: None,
            indices: None,
            uniform_offset: 0,
        }
    }

    pub fn set_level(&mut self, level: &LevelBuffers, scene: Arc<wgpu::BindGroup>) {
        self.vertices = Some(level.vertices.clone());
        self.indices = Some(level.indices.clone());
        self.scene = Some(scene);
    }

    /// Selects the pipeline variant and uniform slot of the next bake
    pub fn prepare(&mut self, pipeline: Arc<wgpu::RenderPipeline>, uniform_offset: u32) {
        self.pipeline = Some(pipeline);
        self.uniform_offset = uniform_offset;
    }
}

impl BakePass for RaytracePass {
    fn name(&self) -> &str {
        "lightmap_raytrace"
    }

    fn execute(&mut self, ctx: &mut PassContext) -> Result<()> {
        let (Some(pipeline), Some(scene), Some(vertices), Some(indices)) =
            (&self.pipeline, &self.scene, &self.vertices, &self.indices)
        else {
            return Err(Error::Pipeline("Raytrace pass has no level or pipeline".into()));
        };
        let plan = ctx.plan;
        let image = ctx.bake_image;

        let mut pass = ctx.begin_render_pass("Lightmap Raytrace", &[cleared(&image.raytrace.view)]);
        if plan.commands.is_empty() {
            return Ok(());
        }
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &**scene, &[self.uniform_offset]);
        pass.set_vertex_buffer(0, vertices.slice(..));
        pass.set_index_buffer(indices.slice(..), wgpu::IndexFormat::Uint32);

        match self.submission {
            DrawSubmission::Indirect => {
                let stride = std::mem::size_of::<DrawIndexedCommand>() as u64;
                for i in 0..plan.commands.len() as u64 {
                    pass.draw_indexed_indirect(&self.commands, i * stride);
                }
            }
            DrawSubmission::Direct => {
                for cmd in &plan.commands {
                    pass.draw_indexed(
                        cmd.first_index..cmd.first_index + cmd.index_count,
                        cmd.base_vertex,
                        cmd.first_instance..cmd.first_instance + cmd.instance_count,
                    );
                }
            }
        }
        log::trace!("Recorded {} raytrace draws ({:?})", plan.commands.len(), self.submission);
        Ok(())
    }
}
