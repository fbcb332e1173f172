pub mod bounds;
pub mod postprocess;

use crate::video::VideoId;
use glam::{Mat4, Quat, Vec3};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    pub fn from_matrix(matrix: Mat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        Self {
            translation,
            rotation,
            scale,
        }
    }
}

/// What a node is used for, decided once when the scene is imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Background,
    CameraAnchor,
    VideoPlane,
    ShadowCatcher,
    #[default]
    Generic,
}

/// Name markers used to classify nodes that carry no explicit `role` extra.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RoleMarkers {
    pub background_prefix: String,
    pub camera_anchor_prefix: String,
    pub video_plane_prefix: String,
    pub shadow_catcher_name: String,
}

impl Default for RoleMarkers {
    fn default() -> Self {
        Self {
            background_prefix: "Background".to_string(),
            camera_anchor_prefix: "CameraAnchor".to_string(),
            video_plane_prefix: "VideoPlane".to_string(),
            shadow_catcher_name: "ShadowCatcher".to_string(),
        }
    }
}

impl RoleMarkers {
    pub fn classify(&self, name: &str, extras: Option<&Value>) -> NodeRole {
        if let Some(role) = extras
            .and_then(|extras| extras.get("role"))
            .and_then(|role| serde_json::from_value::<NodeRole>(role.clone()).ok())
        {
            return role;
        }
        // Shadow catcher is an exact match, the rest are prefixes.
        if !self.shadow_catcher_name.is_empty() && name == self.shadow_catcher_name {
            NodeRole::ShadowCatcher
        } else if has_prefix(name, &self.background_prefix) {
            NodeRole::Background
        } else if has_prefix(name, &self.camera_anchor_prefix) {
            NodeRole::CameraAnchor
        } else if has_prefix(name, &self.video_plane_prefix) {
            NodeRole::VideoPlane
        } else {
            NodeRole::Generic
        }
    }
}

fn has_prefix(name: &str, prefix: &str) -> bool {
    !prefix.is_empty() && name.starts_with(prefix)
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub transform: Transform,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub geometry: Option<GeometryId>,
    pub material: Option<MaterialId>,
    pub cast_shadow: bool,
    pub receive_shadow: bool,
    pub visible: bool,
    pub role: NodeRole,
    pub extras: Option<Value>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transform: Transform::default(),
            parent: None,
            children: Vec::new(),
            geometry: None,
            material: None,
            cast_shadow: false,
            receive_shadow: false,
            visible: true,
            role: NodeRole::Generic,
            extras: None,
        }
    }

    pub fn is_mesh(&self) -> bool {
        self.geometry.is_some() && self.material.is_some()
    }
}

/// Which corner of the image `v = 0` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvOrigin {
    /// glTF convention.
    TopLeft,
    BottomLeft,
}

#[derive(Debug, Clone)]
pub struct Geometry {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Option<Vec<[f32; 2]>>,
    pub indices: Vec<u32>,
    pub uv_origin: UvOrigin,
}

impl Geometry {
    pub fn new(positions: Vec<[f32; 3]>, indices: Vec<u32>) -> Self {
        let normals = compute_normals(&positions, &indices);
        Self {
            positions,
            normals,
            uvs: None,
            indices,
            uv_origin: UvOrigin::TopLeft,
        }
    }

    /// Inverts the v component of every UV. Applying it twice restores the data.
    pub fn flip_uvs_v(&mut self) -> usize {
        let Some(uvs) = self.uvs.as_mut() else {
            return 0;
        };
        for uv in uvs.iter_mut() {
            uv[1] = 1.0 - uv[1];
        }
        self.uv_origin = match self.uv_origin {
            UvOrigin::TopLeft => UvOrigin::BottomLeft,
            UvOrigin::BottomLeft => UvOrigin::TopLeft,
        };
        uvs.len()
    }

    /// Converts UVs to `origin`, returning whether anything changed.
    pub fn set_uv_origin(&mut self, origin: UvOrigin) -> bool {
        if self.uvs.is_none() || self.uv_origin == origin {
            return false;
        }
        self.flip_uvs_v();
        true
    }

    /// UVs as uploaded to the GPU: the stored data, in whatever convention it
    /// was converted to. Meshes without UVs sample the texture origin.
    pub fn sampling_uvs(&self) -> Vec<[f32; 2]> {
        match &self.uvs {
            Some(uvs) => uvs.clone(),
            None => vec![[0.0, 0.0]; self.positions.len()],
        }
    }

    pub fn local_bounds(&self) -> bounds::Aabb {
        let mut aabb = bounds::Aabb::EMPTY;
        for position in &self.positions {
            aabb.expand(Vec3::from_array(*position));
        }
        aabb
    }

    pub fn triangles(&self) -> impl Iterator<Item = [Vec3; 3]> + '_ {
        self.indices.chunks_exact(3).filter_map(|tri| {
            let a = self.positions.get(tri[0] as usize)?;
            let b = self.positions.get(tri[1] as usize)?;
            let c = self.positions.get(tri[2] as usize)?;
            Some([Vec3::from_array(*a), Vec3::from_array(*b), Vec3::from_array(*c)])
        })
    }

    #[cfg(test)]
    pub fn quad(width: f32, height: f32) -> Self {
        let (w, h) = (width * 0.5, height * 0.5);
        let mut geometry = Self::new(
            vec![[-w, -h, 0.0], [w, -h, 0.0], [w, h, 0.0], [-w, h, 0.0]],
            vec![0, 1, 2, 0, 2, 3],
        );
        geometry.uvs = Some(vec![[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]]);
        geometry
    }
}

/// Smooth per-vertex normals, used when the source mesh has none.
pub fn compute_normals(positions: &[[f32; 3]], indices: &[u32]) -> Vec<[f32; 3]> {
    let mut normals = vec![Vec3::ZERO; positions.len()];
    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        if a >= positions.len() || b >= positions.len() || c >= positions.len() {
            continue;
        }
        let pa = Vec3::from_array(positions[a]);
        let face = (Vec3::from_array(positions[b]) - pa).cross(Vec3::from_array(positions[c]) - pa);
        normals[a] += face;
        normals[b] += face;
        normals[c] += face;
    }
    normals
        .into_iter()
        .map(|normal| normal.try_normalize().unwrap_or(Vec3::Y).to_array())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Front,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureSource {
    Image(ImageId),
    Video(VideoId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureMap {
    pub source: TextureSource,
    /// Sample the texture with the rows reversed.
    pub flip_y: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub base_color: [f32; 4],
    pub map: Option<TextureMap>,
    pub transparent: bool,
    pub opacity: f32,
    pub side: Side,
    pub video_texture_paths: Option<String>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_color: [1.0, 1.0, 1.0, 1.0],
            map: None,
            transparent: false,
            opacity: 1.0,
            side: Side::Front,
            video_texture_paths: None,
        }
    }
}

impl Material {
    /// The first entry of the `;`-separated `video_texture_paths` extra.
    pub fn video_reference(&self) -> Option<&str> {
        self.video_texture_paths
            .as_deref()?
            .split(';')
            .map(str::trim)
            .find(|entry| !entry.is_empty())
    }

    pub fn has_image_map(&self) -> bool {
        matches!(
            self.map,
            Some(TextureMap {
                source: TextureSource::Image(_),
                ..
            })
        )
    }
}

/// Decoded RGBA8 image.
#[derive(Debug, Clone)]
pub struct Image {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Default, Clone)]
pub struct SceneGraph {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
    geometries: Vec<Geometry>,
    materials: Vec<Material>,
    images: Vec<Image>,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, mut node: Node, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.parent = parent;
        self.nodes.push(node);
        match parent.and_then(|parent| self.nodes.get_mut(parent.0)) {
            Some(parent) => parent.children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn add_geometry(&mut self, geometry: Geometry) -> GeometryId {
        self.geometries.push(geometry);
        GeometryId(self.geometries.len() - 1)
    }

    pub fn add_material(&mut self, material: Material) -> MaterialId {
        self.materials.push(material);
        MaterialId(self.materials.len() - 1)
    }

    pub fn add_image(&mut self, image: Image) -> ImageId {
        self.images.push(image);
        ImageId(self.images.len() - 1)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }

    pub fn geometry(&self, id: GeometryId) -> Option<&Geometry> {
        self.geometries.get(id.0)
    }

    pub fn geometry_mut(&mut self, id: GeometryId) -> Option<&mut Geometry> {
        self.geometries.get_mut(id.0)
    }

    pub fn material(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id.0)
    }

    pub fn material_mut(&mut self, id: MaterialId) -> Option<&mut Material> {
        self.materials.get_mut(id.0)
    }

    pub fn image(&self, id: ImageId) -> Option<&Image> {
        self.images.get(id.0)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.name == name)
            .map(NodeId)
    }

    /// Depth-first, pre-order walk of `root` and everything below it.
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            order.push(id);
            stack.extend(node.children.iter().rev().copied());
        }
        order
    }

    /// Pre-order walk over every root.
    pub fn traverse(&self) -> Vec<NodeId> {
        self.roots
            .iter()
            .flat_map(|root| self.descendants(*root))
            .collect()
    }

    pub fn world_matrix(&self, id: NodeId) -> Mat4 {
        let mut matrix = Mat4::IDENTITY;
        let mut current = Some(id);
        while let Some(node) = current.and_then(|id| self.node(id)) {
            matrix = node.transform.matrix() * matrix;
            current = node.parent;
        }
        matrix
    }

    /// World matrices for every node, indexed by `NodeId`.
    pub fn world_matrices(&self) -> Vec<Mat4> {
        let mut matrices = vec![Mat4::IDENTITY; self.nodes.len()];
        for id in self.traverse() {
            let node = &self.nodes[id.0];
            let parent = node
                .parent
                .map(|parent| matrices[parent.0])
                .unwrap_or(Mat4::IDENTITY);
            matrices[id.0] = parent * node.transform.matrix();
        }
        matrices
    }

    pub fn world_position(&self, id: NodeId) -> Vec3 {
        self.world_matrix(id).w_axis.truncate()
    }

    /// Moves a node so its origin lands on `position` in world space.
    pub fn set_world_position(&mut self, id: NodeId, position: Vec3) {
        let parent = self
            .node(id)
            .and_then(|node| node.parent)
            .map(|parent| self.world_matrix(parent))
            .unwrap_or(Mat4::IDENTITY);
        let local = parent.inverse().transform_point3(position);
        if let Some(node) = self.node_mut(id) {
            node.transform.translation = local;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn flip_uvs_inverts_v_and_is_an_involution() {
        let mut geometry = Geometry::quad(1.0, 1.0);
        let original = geometry.uvs.clone().unwrap();

        assert_eq!(geometry.flip_uvs_v(), 4);
        let flipped = geometry.uvs.clone().unwrap();
        for (before, after) in original.iter().zip(&flipped) {
            assert_eq!(before[0], after[0]);
            assert!((after[1] - (1.0 - before[1])).abs() < 1e-6);
        }
        assert_eq!(geometry.uv_origin, UvOrigin::BottomLeft);

        geometry.flip_uvs_v();
        assert_eq!(geometry.uvs.unwrap(), original);
        assert_eq!(geometry.uv_origin, UvOrigin::TopLeft);
    }

    #[test]
    fn set_uv_origin_is_idempotent() {
        let mut geometry = Geometry::quad(1.0, 1.0);
        assert!(geometry.set_uv_origin(UvOrigin::BottomLeft));
        assert!(!geometry.set_uv_origin(UvOrigin::BottomLeft));

        let mut flipped_once = Geometry::quad(1.0, 1.0);
        flipped_once.flip_uvs_v();
        assert_eq!(geometry.sampling_uvs(), flipped_once.uvs.unwrap());
        assert_ne!(geometry.sampling_uvs(), Geometry::quad(1.0, 1.0).uvs.unwrap());
    }

    #[test]
    fn geometry_without_uvs_is_not_flipped() {
        let mut geometry = Geometry::new(vec![[0.0; 3]; 3], vec![0, 1, 2]);
        assert_eq!(geometry.flip_uvs_v(), 0);
        assert!(!geometry.set_uv_origin(UvOrigin::BottomLeft));
        assert_eq!(geometry.uv_origin, UvOrigin::TopLeft);
    }

    #[test]
    fn classify_prefers_role_extra_over_names() {
        let markers = RoleMarkers::default();
        let extras = serde_json::json!({ "role": "shadow_catcher" });
        assert_eq!(
            markers.classify("BackgroundVideo", Some(&extras)),
            NodeRole::ShadowCatcher
        );
        assert_eq!(markers.classify("BackgroundVideo", None), NodeRole::Background);
        assert_eq!(markers.classify("CameraAnchor.001", None), NodeRole::CameraAnchor);
        assert_eq!(markers.classify("VideoPlane_left", None), NodeRole::VideoPlane);
        assert_eq!(markers.classify("ShadowCatcher", None), NodeRole::ShadowCatcher);
        assert_eq!(markers.classify("ShadowCatcher.001", None), NodeRole::Generic);
        assert_eq!(markers.classify("Chair", None), NodeRole::Generic);
    }

    #[test]
    fn video_reference_takes_first_entry() {
        let material = Material {
            video_texture_paths: Some(" ;clips/a.mp4;clips/b.mp4".to_string()),
            ..Material::default()
        };
        assert_eq!(material.video_reference(), Some("clips/a.mp4"));
        assert_eq!(Material::default().video_reference(), None);
    }

    #[test]
    fn world_position_round_trips_through_parents() {
        let mut graph = SceneGraph::new();
        let mut parent = Node::new("parent");
        parent.transform.translation = Vec3::new(1.0, 0.0, 0.0);
        parent.transform.rotation = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2);
        parent.transform.scale = Vec3::splat(2.0);
        let parent = graph.add_node(parent, None);
        let child = graph.add_node(Node::new("child"), Some(parent));

        let target = Vec3::new(3.0, 4.0, -2.0);
        graph.set_world_position(child, target);
        assert!(vec_close(graph.world_position(child), target));
        assert_eq!(graph.world_matrices()[child.0], graph.world_matrix(child));
    }

    #[test]
    fn traverse_is_pre_order() {
        let mut graph = SceneGraph::new();
        let a = graph.add_node(Node::new("a"), None);
        let b = graph.add_node(Node::new("b"), Some(a));
        let c = graph.add_node(Node::new("c"), Some(b));
        let d = graph.add_node(Node::new("d"), Some(a));
        assert_eq!(graph.traverse(), vec![a, b, c, d]);
        assert_eq!(graph.find_by_name("d"), Some(d));
    }

    #[test]
    fn computed_normals_face_out_of_the_quad() {
        let geometry = Geometry::quad(2.0, 2.0);
        for normal in &geometry.normals {
            assert!(vec_close(Vec3::from_array(*normal), Vec3::Z));
        }
    }
}
