use super::{NodeId, SceneGraph};
use glam::{Mat4, Vec3};

/// Axis-aligned box. `EMPTY` has inverted extents so the first `expand` snaps to the point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            self.max - self.min
        }
    }

    pub fn diagonal(&self) -> f32 {
        self.size().length()
    }

    pub fn max_extent(&self) -> f32 {
        self.size().max_element()
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(b.x, b.y, b.z),
            Vec3::new(a.x, b.y, b.z),
        ]
    }

    pub fn transformed(&self, matrix: &Mat4) -> Aabb {
        if self.is_empty() {
            return *self;
        }
        let mut out = Aabb::EMPTY;
        for corner in self.corners() {
            out.expand(matrix.transform_point3(corner));
        }
        out
    }

    /// The twelve edges as line-list endpoint pairs.
    pub fn edges(&self) -> [[Vec3; 2]; 12] {
        let c = self.corners();
        [
            [c[0], c[1]],
            [c[1], c[2]],
            [c[2], c[3]],
            [c[3], c[0]],
            [c[4], c[5]],
            [c[5], c[6]],
            [c[6], c[7]],
            [c[7], c[4]],
            [c[0], c[4]],
            [c[1], c[5]],
            [c[2], c[6]],
            [c[3], c[7]],
        ]
    }
}

/// World bounds over every mesh vertex below `root`.
pub fn subtree_bounds(graph: &SceneGraph, world: &[Mat4], root: NodeId) -> Aabb {
    let mut aabb = Aabb::EMPTY;
    for id in graph.descendants(root) {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let Some(geometry) = node.geometry.and_then(|geometry| graph.geometry(geometry)) else {
            continue;
        };
        let matrix = world.get(id.0).copied().unwrap_or(Mat4::IDENTITY);
        for position in &geometry.positions {
            aabb.expand(matrix.transform_point3(Vec3::from_array(*position)));
        }
    }
    aabb
}

pub fn scene_bounds(graph: &SceneGraph) -> Aabb {
    let world = graph.world_matrices();
    graph
        .roots()
        .iter()
        .map(|root| subtree_bounds(graph, &world, *root))
        .fold(Aabb::EMPTY, |acc, aabb| acc.union(&aabb))
}
