//! Bounding volume hierarchy over level triangles
//!
//! Built on the CPU with median splits and flattened depth-first, so an
//! interior node's left child is always the next node. The raytrace shader
//! walks the same arrays from storage buffers.

use crate::bounds::Aabb;
use crate::level::LevelVertex;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

const MAX_LEAF_TRIANGLES: usize = 4;

/// Flattened BVH node (32 bytes)
///
/// Leaves have `count > 0` and cover triangles `[first, first + count)`.
/// Interior nodes have `count == 0`; the left child follows directly and
/// `right_or_first` holds the right child index.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub min: [f32; 3],
    pub right_or_first: u32,
    pub max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }

    fn bounds(&self) -> Aabb {
        Aabb::new(Vec3::from(self.min), Vec3::from(self.max))
    }
}

/// Triangle in BVH order (48 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct BvhTriangle {
    pub v0: [f32; 3],
    pub surface_index: u32,
    pub v1: [f32; 3],
    pub _pad0: u32,
    pub v2: [f32; 3],
    pub _pad1: u32,
}

struct Prim {
    triangle: BvhTriangle,
    bounds: Aabb,
    centroid: Vec3,
}

#[derive(Debug, Clone)]
pub struct Bvh {
    pub nodes: Vec<BvhNode>,
    pub triangles: Vec<BvhTriangle>,
}

impl Bvh {
    pub fn build(vertices: &[LevelVertex], indices: &[u32]) -> Self {
        let mut prims: Vec<Prim> = indices
            .chunks_exact(3)
            .filter_map(|tri| {
                let a = vertices.get(tri[0] as usize)?;
                let b = vertices.get(tri[1] as usize)?;
                let c = vertices.get(tri[2] as usize)?;
                let (p0, p1, p2) = (
                    Vec3::from(a.position),
                    Vec3::from(b.position),
                    Vec3::from(c.position),
                );
                Some(Prim {
                    triangle: BvhTriangle {
                        v0: a.position,
                        surface_index: a.surface_index,
                        v1: b.position,
                        _pad0: 0,
                        v2: c.position,
                        _pad1: 0,
                    },
                    bounds: Aabb::from_points(&[p0, p1, p2]),
                    centroid: (p0 + p1 + p2) / 3.0,
                })
            })
            .collect();

        let mut bvh = Bvh {
            nodes: Vec::with_capacity(prims.len().max(1) * 2),
            triangles: Vec::new(),
        };

        if prims.is_empty() {
            let empty = Aabb::empty();
            bvh.nodes.push(BvhNode {
                min: empty.min.to_array(),
                right_or_first: 0,
                max: empty.max.to_array(),
                count: 0,
            });
        } else {
            bvh.build_node(&mut prims, 0);
        }
        bvh.triangles = prims.into_iter().map(|p| p.triangle).collect();

        log::debug!(
            "Built level BVH: {} nodes over {} triangles",
            bvh.nodes.len(),
            bvh.triangles.len()
        );
        bvh
    }

    fn build_node(&mut self, prims: &mut [Prim], first: u32) -> u32 {
        let index = self.nodes.len() as u32;
        let bounds = prims
            .iter()
            .fold(Aabb::empty(), |acc, p| acc.union(&p.bounds));
        self.nodes.push(BvhNode {
            min: bounds.min.to_array(),
            right_or_first: first,
            max: bounds.max.to_array(),
            count: prims.len() as u32,
        });

        if prims.len() <= MAX_LEAF_TRIANGLES {
            return index;
        }

        let centroids = Aabb::from_points(&prims.iter().map(|p| p.centroid).collect::<Vec<_>>());
        let axis = centroids.longest_axis();
        let mid = prims.len() / 2;
        prims.select_nth_unstable_by(mid, |a, b| a.centroid[axis].total_cmp(&b.centroid[axis]));

        let (left, right) = prims.split_at_mut(mid);
        self.build_node(left, first);
        let right_index = self.build_node(right, first + mid as u32);

        let node = &mut self.nodes[index as usize];
        node.right_or_first = right_index;
        node.count = 0;
        index
    }

    /// Closest hit along `origin + t * dir` for `t` in `(0, t_max)`.
    ///
    /// Returns the distance and the surface index of the hit triangle.
    pub fn intersect(&self, origin: Vec3, dir: Vec3, t_max: f32) -> Option<(f32, u32)> {
        if self.triangles.is_empty() {
            return None;
        }
        let inv_dir = dir.recip();
        let mut closest: Option<(f32, u32)> = None;
        let mut limit = t_max;
        let mut stack = vec![0u32];

        while let Some(i) = stack.pop() {
            let node = &self.nodes[i as usize];
            if !ray_hits_box(origin, inv_dir, &node.bounds(), limit) {
                continue;
            }
            if node.is_leaf() {
                let start = node.right_or_first as usize;
                for tri in &self.triangles[start..start + node.count as usize] {
                    if let Some(t) = ray_triangle(origin, dir, tri) {
                        if t < limit {
                            limit = t;
                            closest = Some((t, tri.surface_index));
                        }
                    }
                }
            } else {
                stack.push(node.right_or_first);
                stack.push(i + 1);
            }
        }
        closest
    }
}

fn ray_hits_box(origin: Vec3, inv_dir: Vec3, bounds: &Aabb, t_max: f32) -> bool {
    let t0 = (bounds.min - origin) * inv_dir;
    let t1 = (bounds.max - origin) * inv_dir;
    let near = t0.min(t1).max_element().max(0.0);
    let far = t0.max(t1).min_element().min(t_max);
    near <= far
}

fn ray_triangle(origin: Vec3, dir: Vec3, tri: &BvhTriangle) -> Option<f32> {
    const EPSILON: f32 = 1e-7;
    let v0 = Vec3::from(tri.v0);
    let e1 = Vec3::from(tri.v1) - v0;
    let e2 = Vec3::from(tri.v2) - v0;

    let p = dir.cross(e2);
    let det = e1.dot(p);
    if det.abs() < EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = origin - v0;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = dir.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    (t > EPSILON).then_some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: u32) -> (Vec<LevelVertex>, Vec<u32>) {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for y in 0..n {
            for x in 0..n {
                let base = vertices.len() as u32;
                let z = ((x * 7 + y * 3) % 5) as f32;
                for (dx, dy) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
                    vertices.push(LevelVertex {
                        position: [x as f32 + dx, y as f32 + dy, z],
                        surface_index: y * n + x,
                    });
                }
                indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
            }
        }
        (vertices, indices)
    }

    #[test]
    fn leaves_cover_every_triangle_once() {
        let (vertices, indices) = grid(9);
        let bvh = Bvh::build(&vertices, &indices);
        assert_eq!(bvh.triangles.len(), indices.len() / 3);

        let mut covered = vec![0u32; bvh.triangles.len()];
        for node in bvh.nodes.iter().filter(|n| n.is_leaf()) {
            assert!(node.count as usize <= MAX_LEAF_TRIANGLES);
            for i in node.right_or_first..node.right_or_first + node.count {
                covered[i as usize] += 1;
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
    }

    #[test]
    fn matches_brute_force_hits() {
        let (vertices, indices) = grid(6);
        let bvh = Bvh::build(&vertices, &indices);

        for i in 0..40 {
            let origin = Vec3::new(0.3 + i as f32 * 0.13, 0.7 + i as f32 * 0.11, 20.0);
            let dir = Vec3::new(0.05, -0.02, -1.0).normalize();

            let brute = bvh
                .triangles
                .iter()
                .filter_map(|t| ray_triangle(origin, dir, t).map(|d| (d, t.surface_index)))
                .min_by(|a, b| a.0.total_cmp(&b.0));
            assert_eq!(bvh.intersect(origin, dir, f32::MAX), brute);
        }
    }

    #[test]
    fn empty_mesh_never_hits() {
        let bvh = Bvh::build(&[], &[]);
        assert_eq!(bvh.nodes.len(), 1);
        assert!(bvh.intersect(Vec3::ZERO, Vec3::X, 100.0).is_none());
    }

    #[test]
    fn node_layout_is_gpu_friendly() {
        assert_eq!(std::mem::size_of::<BvhNode>(), 32);
        assert_eq!(std::mem::size_of::<BvhTriangle>(), 48);
    }
}
