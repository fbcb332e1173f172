use glam::{Mat4, Vec2, Vec3};

use crate::scene::bounds::Aabb;
use crate::scene::{NodeId, SceneGraph};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    /// Unit length.
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    pub fn at(&self, distance: f32) -> Vec3 {
        self.origin + self.direction * distance
    }

    /// Ray through a cursor position given in physical pixels.
    pub fn from_screen(cursor: Vec2, viewport: Vec2, view_projection: Mat4) -> Option<Self> {
        if viewport.x <= 0.0 || viewport.y <= 0.0 {
            return None;
        }
        let ndc = Vec2::new(
            cursor.x / viewport.x * 2.0 - 1.0,
            1.0 - cursor.y / viewport.y * 2.0,
        );
        let inverse = view_projection.inverse();
        // wgpu clip space depth runs 0..1.
        let near = inverse.project_point3(ndc.extend(0.0));
        let far = inverse.project_point3(ndc.extend(1.0));
        let direction = (far - near).try_normalize()?;
        Some(Self {
            origin: near,
            direction,
        })
    }
}

/// Slab test. Returns the entry distance, or 0 when the origin is inside.
pub fn ray_aabb(ray: &Ray, aabb: &Aabb) -> Option<f32> {
    if aabb.is_empty() {
        return None;
    }
    let inverse = ray.direction.recip();
    let t1 = (aabb.min - ray.origin) * inverse;
    let t2 = (aabb.max - ray.origin) * inverse;
    let t_min = t1.min(t2).max_element();
    let t_max = t1.max(t2).min_element();
    if t_max < 0.0 || t_min > t_max || t_min.is_nan() || t_max.is_nan() {
        return None;
    }
    Some(t_min.max(0.0))
}

/// Möller–Trumbore, double-sided.
pub fn ray_triangle(ray: &Ray, triangle: &[Vec3; 3]) -> Option<f32> {
    const EPSILON: f32 = 1e-7;
    let edge1 = triangle[1] - triangle[0];
    let edge2 = triangle[2] - triangle[0];
    let p = ray.direction.cross(edge2);
    let determinant = edge1.dot(p);
    if determinant.abs() < EPSILON {
        return None;
    }
    let inverse = 1.0 / determinant;
    let s = ray.origin - triangle[0];
    let u = s.dot(p) * inverse;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(edge1);
    let v = ray.direction.dot(q) * inverse;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = edge2.dot(q) * inverse;
    (t > EPSILON).then_some(t)
}

/// Intersection with the plane through `point` with `normal`.
pub fn ray_plane(ray: &Ray, point: Vec3, normal: Vec3) -> Option<Vec3> {
    let denominator = normal.dot(ray.direction);
    if denominator.abs() < 1e-6 {
        return None;
    }
    let t = normal.dot(point - ray.origin) / denominator;
    (t >= 0.0).then(|| ray.at(t))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickHit {
    /// The candidate whose subtree was hit.
    pub node: NodeId,
    /// The mesh node actually hit.
    pub mesh: NodeId,
    pub point: Vec3,
    pub distance: f32,
}

/// Nearest hit among the meshes below each candidate.
pub fn pick(graph: &SceneGraph, candidates: &[NodeId], ray: &Ray) -> Option<PickHit> {
    let world = graph.world_matrices();
    let mut best: Option<PickHit> = None;
    for candidate in candidates {
        for id in graph.descendants(*candidate) {
            let Some(node) = graph.node(id).filter(|node| node.visible) else {
                continue;
            };
            let Some(geometry) = node.geometry.and_then(|geometry| graph.geometry(geometry)) else {
                continue;
            };
            let matrix = world[id.0];
            let aabb = geometry.local_bounds().transformed(&matrix);
            let Some(entry) = ray_aabb(ray, &aabb) else {
                continue;
            };
            if best.is_some_and(|hit| hit.distance < entry) {
                continue;
            }
            for triangle in geometry.triangles() {
                let world_triangle = triangle.map(|vertex| matrix.transform_point3(vertex));
                let Some(distance) = ray_triangle(ray, &world_triangle) else {
                    continue;
                };
                if best.map_or(true, |hit| distance < hit.distance) {
                    best = Some(PickHit {
                        node: *candidate,
                        mesh: id,
                        point: ray.at(distance),
                        distance,
                    });
                }
            }
        }
    }
    best
}
