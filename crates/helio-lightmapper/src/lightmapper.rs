//! Bake driver: selection, uniform upload and the four GPU passes

use crate::atlas::LightmapAtlas;
use crate::bake_image::LightmapBakeImage;
use crate::device::DrawSubmission;
use crate::level_buffers::LevelBuffers;
use crate::passes::{BakePass, BlurPass, CopyPass, PassContext, RaytracePass, ResolvePass};
use crate::pipeline::RaytracePipelineCache;
use crate::resources::BindGroupLayouts;
use crate::{Error, Result};
use helio_lightmap::{
    BakePlan, BakeStage, BakeStageTracker, BakeUniforms, CopyTileInfo, DrawIndexedCommand, LevelMesh,
    LightmapCopyPC, LightmapRaytracePC, LightmapperConfig, TileId, TileSelector, UniformRing,
    COPY_BUFFER_CAPACITY, DRAW_BUFFER_CAPACITY, UNIFORM_RING_SLOTS,
};
use std::sync::Arc;

/// Outcome of one [`Lightmapper::raytrace`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BakeReport {
    pub frame: u64,
    /// Tiles that got room in the bake image
    pub selected: usize,
    /// Tiles whose results were copied into the atlas
    pub baked: usize,
    pub deferred: usize,
    pub rejected: usize,
    pub draws: usize,
    /// The draw buffers filled up before every selected tile was recorded
    pub buffer_full: bool,
}

fn gpu_buffer(device: &wgpu::Device, label: &str, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: usage | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

pub struct Lightmapper {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    config: LightmapperConfig,
    layouts: Arc<BindGroupLayouts>,
    selector: TileSelector,
    frame: u64,
    stages: BakeStageTracker,
    pipelines: RaytracePipelineCache,
    bake_image: LightmapBakeImage,

    uniform_ring: UniformRing,
    uniforms: wgpu::Buffer,
    constants: wgpu::Buffer,
    commands: Arc<wgpu::Buffer>,
    copy_tiles: wgpu::Buffer,
    copy_constants: wgpu::Buffer,
    level: Option<LevelBuffers>,

    raytrace_pass: RaytracePass,
    resolve_pass: ResolvePass,
    blur_pass: BlurPass,
    copy_pass: CopyPass,
}

impl Lightmapper {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        config: LightmapperConfig,
        submission: DrawSubmission,
    ) -> Result<Self> {
        log::info!("Creating lightmapper");
        log::info!("  Bake image: {}x{}", config.bake_image_size, config.bake_image_size);
        log::info!("  Raytrace: {:?}", config.raytrace);
        log::info!("  Draw submission: {:?}", submission);

        let layouts = Arc::new(BindGroupLayouts::new(&device));
        let bake_image = LightmapBakeImage::new(&device, &layouts, config.bake_image_size);

        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let uniform_ring = UniformRing::new(UNIFORM_RING_SLOTS, alignment);
        let uniforms = gpu_buffer(
            &device,
            "Lightmap Uniform Ring",
            uniform_ring.buffer_size(),
            wgpu::BufferUsages::UNIFORM,
        );
        let constants = gpu_buffer(
            &device,
            "Lightmap Raytrace Constants Buffer",
            (DRAW_BUFFER_CAPACITY * std::mem::size_of::<LightmapRaytracePC>()) as u64,
            wgpu::BufferUsages::STORAGE,
        );
        let commands = Arc::new(gpu_buffer(
            &device,
            "Lightmap Draw Command Buffer",
            (DRAW_BUFFER_CAPACITY * std::mem::size_of::<DrawIndexedCommand>()) as u64,
            wgpu::BufferUsages::INDIRECT,
        ));
        let copy_tiles = gpu_buffer(
            &device,
            "Lightmap Copy Tile Buffer",
            (COPY_BUFFER_CAPACITY * std::mem::size_of::<CopyTileInfo>()) as u64,
            wgpu::BufferUsages::STORAGE,
        );
        let copy_constants = gpu_buffer(
            &device,
            "Lightmap Copy Constants Buffer",
            std::mem::size_of::<LightmapCopyPC>() as u64,
            wgpu::BufferUsages::UNIFORM,
        );

        let resolve_pass = ResolvePass::new(&device, &layouts)?;
        let blur_pass = BlurPass::new(&device, &layouts)?;
        let copy_pass = CopyPass::new(&device, &layouts, &bake_image, &copy_tiles, &copy_constants)?;
        let raytrace_pass = RaytracePass::new(submission, commands.clone());

        let mut pipelines = RaytracePipelineCache::new(device.clone(), &layouts);
        // Compile the configured variant up front so a broken shader fails here
        pipelines.get_or_create(config.raytrace)?;

        log::info!("Lightmapper initialized");

        Ok(Self {
            selector: TileSelector::new(&config),
            frame: 0,
            stages: BakeStageTracker::default(),
            device,
            queue,
            config,
            layouts,
            pipelines,
            bake_image,
            uniform_ring,
            uniforms,
            constants,
            commands,
            copy_tiles,
            copy_constants,
            level: None,
            raytrace_pass,
            resolve_pass,
            blur_pass,
            copy_pass,
        })
    }

    pub fn config(&self) -> &LightmapperConfig {
        &self.config
    }

    pub fn stage(&self) -> BakeStage {
        self.stages.current()
    }

    pub fn bake_image(&self) -> &LightmapBakeImage {
        &self.bake_image
    }

    /// Uploads the geometry, BVH and lights of `level`.
    ///
    /// Call again whenever surfaces move or lights change.
    pub fn set_level_mesh(&mut self, level: &LevelMesh) {
        let buffers = LevelBuffers::new(&self.device, level);
        let scene = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Lightmap Scene Bind Group"),
            layout: &self.layouts.scene,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &self.uniforms,
                        offset: 0,
                        size: wgpu::BufferSize::new(std::mem::size_of::<BakeUniforms>() as u64),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.constants.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.nodes.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffers.triangles.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: buffers.lights.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: buffers.surface_planes.as_entire_binding(),
                },
            ],
        });
        self.raytrace_pass.set_level(&buffers, Arc::new(scene));
        self.level = Some(buffers);
    }

    /// Starts renderer frame `frame`; every bake until the next call
    /// counts as part of it for deduplication and eviction.
    pub fn begin_frame(&mut self, frame: u64) -> Result<()> {
        self.stages.advance(BakeStage::BeginFrame)?;
        self.frame = frame;
        Ok(())
    }

    /// Bakes the dirty tiles among `tiles` into `atlas`.
    ///
    /// Tiles that do not fit this frame keep their flags and are picked up
    /// by a later call.
    pub fn raytrace(&mut self, level: &mut LevelMesh, atlas: &LightmapAtlas, tiles: &[TileId]) -> Result<BakeReport> {
        self.stages.advance(BakeStage::SelectTiles)?;
        if self.level.is_none() {
            return Err(Error::Pipeline("Lightmapper has no level mesh".into()));
        }
        if atlas.generation() != level.atlas().generation() {
            return Err(Error::Pipeline(format!(
                "Lightmap atlas generation {} does not match level generation {}",
                atlas.generation(),
                level.atlas().generation()
            )));
        }

        let (level_tiles, allocator) = level.tiles_and_atlas_mut();
        let mut selection = self.selector.select(self.frame, level_tiles, allocator, tiles);
        let mut report = BakeReport {
            frame: selection.frame,
            selected: selection.tiles.len(),
            deferred: selection.deferred,
            rejected: selection.rejected,
            ..Default::default()
        };
        if selection.is_empty() {
            return Ok(report);
        }

        let plan = BakePlan::build(
            &mut selection,
            &level.tiles,
            &level.surfaces,
            self.bake_image.size(),
            DRAW_BUFFER_CAPACITY,
        );
        report.draws = plan.commands.len();
        report.buffer_full = plan.is_full;
        if plan.commands.is_empty() {
            return Ok(report);
        }

        self.stages.advance(BakeStage::UploadUniforms)?;
        let uniform_offset = self.upload(level, atlas, &plan);

        self.stages.advance(BakeStage::Render)?;
        let pipeline = self.pipelines.get_or_create(self.config.raytrace)?;
        self.raytrace_pass.prepare(pipeline, uniform_offset);
        self.bake_image.set_extent(plan.max_x, plan.max_y);

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Lightmap Bake Encoder"),
        });
        {
            let mut ctx = PassContext {
                encoder: &mut encoder,
                bake_image: &self.bake_image,
                plan: &plan,
                atlas,
            };
            self.raytrace_pass.execute(&mut ctx)?;
            self.stages.advance(BakeStage::Resolve)?;
            self.resolve_pass.execute(&mut ctx)?;
            self.stages.advance(BakeStage::Blur)?;
            self.blur_pass.execute(&mut ctx)?;
            self.stages.advance(BakeStage::CopyResult)?;
            self.copy_pass.execute(&mut ctx)?;
        }
        self.queue.submit(Some(encoder.finish()));

        report.baked = selection.finish(&mut level.tiles);
        log::debug!(
            "Lightmap bake frame {}: {} tiles baked with {} draws into {} layers",
            report.frame,
            report.baked,
            report.draws,
            plan.copy_lists.len()
        );
        Ok(report)
    }

    fn upload(&mut self, level: &LevelMesh, atlas: &LightmapAtlas, plan: &BakePlan) -> u32 {
        let light_count = self.level.as_ref().map_or(0, |b| b.light_count);
        let uniforms = BakeUniforms {
            sun_dir: level.sun.direction.normalize_or_zero().to_array(),
            light_count,
            sun_color: level.sun.color.to_array(),
            sun_intensity: level.sun.intensity,
            ambient: self.config.ambient,
            ao_distance: self.config.ao_distance,
            sample_count: self.config.sample_count,
            _pad: 0,
        };
        let offset = self.uniform_ring.next_offset();
        self.queue.write_buffer(&self.uniforms, offset, bytemuck::bytes_of(&uniforms));

        self.queue.write_buffer(&self.constants, 0, bytemuck::cast_slice(&plan.constants));
        self.queue.write_buffer(&self.commands, 0, bytemuck::cast_slice(&plan.commands));
        self.queue.write_buffer(&self.copy_tiles, 0, bytemuck::cast_slice(&plan.copy_tiles));

        let copy = LightmapCopyPC {
            src_tex_size: self.bake_image.size() as i32,
            dest_tex_size: atlas.size() as i32,
            _pad: [0; 2],
        };
        self.queue.write_buffer(&self.copy_constants, 0, bytemuck::bytes_of(&copy));

        offset as u32
    }
}
