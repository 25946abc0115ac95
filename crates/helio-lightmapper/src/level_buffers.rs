//! GPU copies of the level mesh used by the raytrace pass

use bytemuck::Zeroable;
use helio_lightmap::{BvhNode, BvhTriangle, LevelLight, LevelMesh, LevelVertex};
use std::sync::Arc;
use wgpu::util::DeviceExt;

pub struct LevelBuffers {
    pub vertices: Arc<wgpu::Buffer>,
    pub indices: Arc<wgpu::Buffer>,
    pub nodes: wgpu::Buffer,
    pub triangles: wgpu::Buffer,
    pub lights: wgpu::Buffer,
    pub surface_planes: wgpu::Buffer,
    pub light_count: u32,
    pub index_count: u32,
}

/// Contents of a buffer that must hold at least one element
fn non_empty<T: bytemuck::Pod>(items: &[T]) -> std::borrow::Cow<'_, [T]> {
    if items.is_empty() {
        std::borrow::Cow::Owned(vec![T::zeroed()])
    } else {
        std::borrow::Cow::Borrowed(items)
    }
}

impl LevelBuffers {
    pub fn new(device: &wgpu::Device, level: &LevelMesh) -> Self {
        let bvh = level.build_bvh();

        // An empty level still needs a root the shader can visit: a leaf
        // holding one degenerate triangle that nothing can hit
        let (nodes, triangles) = if bvh.triangles.is_empty() {
            (
                vec![BvhNode {
                    min: [0.0; 3],
                    right_or_first: 0,
                    max: [0.0; 3],
                    count: 1,
                }],
                vec![BvhTriangle::zeroed()],
            )
        } else {
            (bvh.nodes, bvh.triangles)
        };

        let planes: Vec<[f32; 4]> = level.surfaces.iter().map(|s| s.plane.to_array()).collect();

        let init = |label: &str, contents: &[u8], usage: wgpu::BufferUsages| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage,
            })
        };

        let vertices = init(
            "Lightmap Level Vertex Buffer",
            bytemuck::cast_slice(&non_empty::<LevelVertex>(&level.vertices)),
            wgpu::BufferUsages::VERTEX,
        );
        let indices = init(
            "Lightmap Level Index Buffer",
            bytemuck::cast_slice(&non_empty::<u32>(&level.indices)),
            wgpu::BufferUsages::INDEX,
        );
        let storage = wgpu::BufferUsages::STORAGE;
        let nodes_buffer = init("Lightmap BVH Node Buffer", bytemuck::cast_slice(&nodes), storage);
        let triangles_buffer = init("Lightmap BVH Triangle Buffer", bytemuck::cast_slice(&triangles), storage);
        let lights = init(
            "Lightmap Light Buffer",
            bytemuck::cast_slice(&non_empty::<LevelLight>(&level.lights)),
            storage,
        );
        let surface_planes = init(
            "Lightmap Surface Plane Buffer",
            bytemuck::cast_slice(&non_empty::<[f32; 4]>(&planes)),
            storage,
        );

        log::info!(
            "Uploaded level mesh: {} vertices, {} indices, {} BVH nodes, {} lights",
            level.vertices.len(),
            level.indices.len(),
            nodes.len(),
            level.lights.len()
        );

        Self {
            vertices: Arc::new(vertices),
            indices: Arc::new(indices),
            nodes: nodes_buffer,
            triangles: triangles_buffer,
            lights,
            surface_planes,
            light_count: level.lights.len() as u32,
            index_count: level.indices.len() as u32,
        }
    }
}
