//! One pass over a freshly imported scene that wires up video textures,
//! shadow flags and UV conventions according to each node's role.

use glam::Vec3;

use super::bounds::subtree_bounds;
use super::{
    Material, MaterialId, NodeId, NodeRole, SceneGraph, Side, TextureMap, TextureSource,
    UvOrigin,
};
use crate::video::{VideoId, VideoRegistry, VideoRole};

#[derive(Debug, Clone)]
pub struct PostProcessOptions {
    /// Video shown on every `VideoPlane` node.
    pub plane_video: Option<String>,
    pub shadow_catcher_color: [f32; 4],
}

impl Default for PostProcessOptions {
    fn default() -> Self {
        Self {
            plane_video: None,
            shadow_catcher_color: [0.8, 0.8, 0.8, 1.0],
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ProcessReport {
    pub videos: Vec<(NodeId, VideoId)>,
    pub background: Option<NodeId>,
    /// Look-at target taken from the camera anchor node.
    pub camera_target: Option<Vec3>,
    pub shadow_catchers: Vec<NodeId>,
    pub textured: Vec<NodeId>,
    pub geometries_flipped: usize,
    pub missing_uvs: Vec<NodeId>,
}

struct Processor<'a> {
    graph: &'a mut SceneGraph,
    videos: &'a mut VideoRegistry,
    options: &'a PostProcessOptions,
    world: Vec<glam::Mat4>,
    plane: Option<(MaterialId, VideoId)>,
    shadow_catcher: Option<MaterialId>,
    report: ProcessReport,
}

/// Classified handling for every node in the graph. Safe to run more than once:
/// UV conversion is guarded by each geometry's `UvOrigin`.
pub fn process_scene(
    graph: &mut SceneGraph,
    videos: &mut VideoRegistry,
    options: &PostProcessOptions,
) -> ProcessReport {
    let world = graph.world_matrices();
    let mut processor = Processor {
        graph,
        videos,
        options,
        world,
        plane: None,
        shadow_catcher: None,
        report: ProcessReport::default(),
    };
    for id in processor.graph.traverse() {
        processor.visit(id);
    }
    log::info!(
        "Scene processed: {} video textures, {} textured meshes, {} shadow catchers",
        processor.report.videos.len(),
        processor.report.textured.len(),
        processor.report.shadow_catchers.len()
    );
    processor.report
}

impl Processor<'_> {
    fn visit(&mut self, id: NodeId) {
        let Some(node) = self.graph.node(id) else {
            return;
        };
        match node.role {
            NodeRole::Background => self.background(id),
            NodeRole::CameraAnchor => self.camera_anchor(id),
            NodeRole::VideoPlane => self.video_plane(id),
            NodeRole::ShadowCatcher => self.shadow_catcher(id),
            NodeRole::Generic => {
                let material = node
                    .material
                    .filter(|_| node.is_mesh())
                    .and_then(|material| self.graph.material(material));
                let video = material.and_then(|material| material.video_reference().map(str::to_owned));
                let textured = material.is_some_and(Material::has_image_map);
                if let Some(source) = video {
                    self.bind_video(id, &source, VideoRole::Foreground);
                } else if textured {
                    self.static_texture(id);
                }
            }
        }
    }

    fn background(&mut self, id: NodeId) {
        if let Some(node) = self.graph.node_mut(id) {
            node.cast_shadow = false;
            node.receive_shadow = false;
        }
        self.report.background = Some(id);

        let material = self
            .graph
            .node(id)
            .filter(|node| node.is_mesh())
            .and_then(|node| node.material)
            .and_then(|material| self.graph.material(material));
        let source = material.and_then(|material| material.video_reference().map(str::to_owned));
        let textured = material.is_some_and(Material::has_image_map);
        if let Some(source) = source {
            self.bind_video(id, &source, VideoRole::Background);
        } else if textured {
            // A still backdrop is an ordinary textured mesh.
            self.static_texture(id);
        }
    }

    fn camera_anchor(&mut self, id: NodeId) {
        let bounds = subtree_bounds(self.graph, &self.world, id);
        let target = if bounds.is_empty() {
            self.world[id.0].w_axis.truncate()
        } else {
            bounds.center()
        };
        self.report.camera_target = Some(target);
    }

    fn video_plane(&mut self, id: NodeId) {
        if self.graph.node(id).and_then(|node| node.geometry).is_none() {
            return;
        }
        let Some(source) = self.options.plane_video.as_deref() else {
            log::warn!(
                "Node {} is a video plane but no plane video is configured",
                self.graph.node(id).map(|node| node.name.as_str()).unwrap_or("?")
            );
            return;
        };
        let (material, video) = match self.plane {
            Some(plane) => {
                self.videos.attach(id, plane.1);
                plane
            }
            None => {
                let video = self.videos.bind(id, source, VideoRole::Plane);
                let material = self.graph.add_material(Material {
                    name: "VideoPlane".to_string(),
                    map: Some(TextureMap {
                        source: TextureSource::Video(video),
                        flip_y: false,
                    }),
                    side: Side::Double,
                    ..Material::default()
                });
                self.plane = Some((material, video));
                (material, video)
            }
        };
        if let Some(node) = self.graph.node_mut(id) {
            node.material = Some(material);
        }
        self.report.videos.push((id, video));
    }

    fn shadow_catcher(&mut self, id: NodeId) {
        let material = match self.shadow_catcher {
            Some(material) => material,
            None => {
                let material = self.graph.add_material(Material {
                    name: "ShadowCatcher".to_string(),
                    base_color: self.options.shadow_catcher_color,
                    ..Material::default()
                });
                self.shadow_catcher = Some(material);
                material
            }
        };
        if let Some(node) = self.graph.node_mut(id) {
            node.cast_shadow = true;
            node.receive_shadow = true;
            if node.geometry.is_some() {
                node.material = Some(material);
            }
        }
        self.report.shadow_catchers.push(id);
    }

    /// Clones the node's material so meshes sharing it keep their original look.
    fn bind_video(&mut self, id: NodeId, source: &str, role: VideoRole) {
        let Some(original) = self
            .graph
            .node(id)
            .and_then(|node| node.material)
            .and_then(|material| self.graph.material(material))
            .cloned()
        else {
            return;
        };
        if matches!(
            original.map,
            Some(TextureMap {
                source: TextureSource::Video(_),
                ..
            })
        ) {
            return;
        }
        if let Some(extra) = original
            .video_texture_paths
            .as_deref()
            .map(|paths| paths.split(';').filter(|entry| !entry.trim().is_empty()).count())
            .filter(|count| *count > 1)
        {
            log::warn!(
                "Material {} lists {} videos, only {} is played",
                original.name,
                extra,
                source
            );
        }

        let video = self.videos.bind(id, source, role);
        let mut material = original;
        material.map = Some(TextureMap {
            source: TextureSource::Video(video),
            flip_y: false,
        });
        material.transparent = true;
        material.side = Side::Double;
        material.opacity = 1.0;
        let material = self.graph.add_material(material);
        if let Some(node) = self.graph.node_mut(id) {
            node.material = Some(material);
        }
        self.report.videos.push((id, video));
    }

    fn static_texture(&mut self, id: NodeId) {
        let Some((geometry, material)) = self
            .graph
            .node(id)
            .and_then(|node| Some((node.geometry?, node.material?)))
        else {
            return;
        };
        if let Some(map) = self
            .graph
            .material_mut(material)
            .and_then(|material| material.map.as_mut())
        {
            map.flip_y = false;
        }
        let flipped = self
            .graph
            .geometry_mut(geometry)
            .filter(|geometry| geometry.uvs.is_some())
            .map(|geometry| geometry.set_uv_origin(UvOrigin::BottomLeft));
        match flipped {
            Some(true) => self.report.geometries_flipped += 1,
            Some(false) => {}
            None => {
                let name = self.graph.node(id).map(|node| node.name.as_str()).unwrap_or("?");
                log::warn!("Mesh {} has a texture but no UV coordinates", name);
                self.report.missing_uvs.push(id);
            }
        }
        if let Some(node) = self.graph.node_mut(id) {
            node.cast_shadow = true;
            node.receive_shadow = true;
        }
        self.report.textured.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Geometry, Image, Node, RoleMarkers};
    use crate::video::VideoTarget;

    fn registry() -> VideoRegistry {
        VideoRegistry::new(std::env::temp_dir())
    }

    fn add_mesh(graph: &mut SceneGraph, name: &str, material: Material) -> NodeId {
        let geometry = graph.add_geometry(Geometry::quad(2.0, 2.0));
        let material = graph.add_material(material);
        let mut node = Node::new(name);
        node.role = RoleMarkers::default().classify(name, None);
        node.geometry = Some(geometry);
        node.material = Some(material);
        graph.add_node(node, None)
    }

    fn video_material(path: &str) -> Material {
        Material {
            name: "screen".to_string(),
            video_texture_paths: Some(path.to_string()),
            ..Material::default()
        }
    }

    fn image_material(graph: &mut SceneGraph) -> Material {
        let image = graph.add_image(Image {
            name: "checker".to_string(),
            width: 1,
            height: 1,
            pixels: vec![255; 4],
        });
        Material {
            map: Some(TextureMap {
                source: TextureSource::Image(image),
                flip_y: true,
            }),
            ..Material::default()
        }
    }

    #[test]
    fn background_video_is_registered_as_background() {
        let mut graph = SceneGraph::new();
        let node = add_mesh(&mut graph, "BackgroundVideo", video_material("loop.mp4"));
        let mut videos = registry();
        let report = process_scene(&mut graph, &mut videos, &PostProcessOptions::default());

        assert_eq!(report.background, Some(node));
        let handle = videos.background().expect("background handle");
        assert_eq!(handle.source(), "loop.mp4");
        let material = graph.material(graph.node(node).unwrap().material.unwrap()).unwrap();
        assert!(material.transparent);
        assert_eq!(material.side, Side::Double);
        assert_eq!(
            material.map.map(|map| map.source),
            Some(TextureSource::Video(handle.id()))
        );
        assert!(!graph.node(node).unwrap().cast_shadow);
    }

    #[test]
    fn video_mesh_gets_its_own_material_and_handle() {
        let mut graph = SceneGraph::new();
        let screen = add_mesh(&mut graph, "Screen", video_material("clips/a.mp4"));
        // Anything else sharing the source material must keep it untouched.
        let shared = graph.node(screen).unwrap().material;
        let mut videos = VideoRegistry::with_decoder(
            std::env::temp_dir(),
            crate::video::decoder::testing::open_solid,
        );

        let report = process_scene(&mut graph, &mut videos, &PostProcessOptions::default());
        let (node, video) = report.videos[0];
        assert_eq!(node, screen);
        let bound = graph.node(screen).unwrap().material.unwrap();
        assert_ne!(Some(bound), shared);
        assert_eq!(graph.material(bound).unwrap().opacity, 1.0);
        assert_eq!(videos.get(video).unwrap().source(), "clips/a.mp4");
        assert!(graph.material(shared.unwrap()).unwrap().map.is_none());

        assert_eq!(videos.start(VideoTarget::Node(screen)), 1);
        assert!(videos.get(video).unwrap().is_playing());
        assert_eq!(videos.stop(VideoTarget::Video(video)), 1);
        assert_eq!(videos.get(video).unwrap().state().position, 0.0);
    }

    #[test]
    fn static_textures_are_flipped_once_across_repeated_passes() {
        let mut graph = SceneGraph::new();
        let material = image_material(&mut graph);
        let node = add_mesh(&mut graph, "Poster", material);
        let geometry = graph.node(node).unwrap().geometry.unwrap();
        let original = graph.geometry(geometry).unwrap().uvs.clone().unwrap();
        let mut videos = registry();

        let first = process_scene(&mut graph, &mut videos, &PostProcessOptions::default());
        let second = process_scene(&mut graph, &mut videos, &PostProcessOptions::default());
        assert_eq!(first.geometries_flipped, 1);
        assert_eq!(second.geometries_flipped, 0);

        let uvs = graph.geometry(geometry).unwrap().uvs.clone().unwrap();
        for (before, after) in original.iter().zip(&uvs) {
            assert!((after[1] - (1.0 - before[1])).abs() < 1e-6);
        }
        // The renderer uploads the converted coordinates, not the imported ones.
        assert_eq!(graph.geometry(geometry).unwrap().sampling_uvs(), uvs);
        assert_ne!(graph.geometry(geometry).unwrap().sampling_uvs(), original);
        let material = graph.material(graph.node(node).unwrap().material.unwrap()).unwrap();
        assert_eq!(material.map.map(|map| map.flip_y), Some(false));
        assert!(graph.node(node).unwrap().cast_shadow);
        assert!(graph.node(node).unwrap().receive_shadow);
    }

    #[test]
    fn still_background_is_handled_as_a_static_texture() {
        let mut graph = SceneGraph::new();
        let material = image_material(&mut graph);
        let node = add_mesh(&mut graph, "BackgroundWall", material);
        let geometry = graph.node(node).unwrap().geometry.unwrap();
        let original = graph.geometry(geometry).unwrap().uvs.clone().unwrap();
        let mut videos = registry();

        let report = process_scene(&mut graph, &mut videos, &PostProcessOptions::default());
        assert_eq!(report.background, Some(node));
        assert_eq!(report.geometries_flipped, 1);
        assert_eq!(report.textured, vec![node]);
        assert!(videos.background().is_none());

        let uvs = graph.geometry(geometry).unwrap().uvs.clone().unwrap();
        for (before, after) in original.iter().zip(&uvs) {
            assert!((after[1] - (1.0 - before[1])).abs() < 1e-6);
        }
        let material = graph.material(graph.node(node).unwrap().material.unwrap()).unwrap();
        assert_eq!(material.map.map(|map| map.flip_y), Some(false));
        assert!(graph.node(node).unwrap().cast_shadow);
        assert!(graph.node(node).unwrap().receive_shadow);
    }

    #[test]
    fn textured_mesh_without_uvs_is_reported() {
        let mut graph = SceneGraph::new();
        let material = image_material(&mut graph);
        let node = add_mesh(&mut graph, "Poster", material);
        let geometry = graph.node(node).unwrap().geometry.unwrap();
        graph.geometry_mut(geometry).unwrap().uvs = None;

        let report = process_scene(&mut graph, &mut registry(), &PostProcessOptions::default());
        assert_eq!(report.missing_uvs, vec![node]);
        assert_eq!(report.geometries_flipped, 0);
    }

    #[test]
    fn plane_nodes_share_one_handle_and_need_a_configured_video() {
        let mut graph = SceneGraph::new();
        let left = add_mesh(&mut graph, "VideoPlane_L", Material::default());
        let right = add_mesh(&mut graph, "VideoPlane_R", Material::default());

        let mut videos = registry();
        let report = process_scene(&mut graph, &mut videos, &PostProcessOptions::default());
        assert!(report.videos.is_empty());
        assert!(videos.is_empty());

        let options = PostProcessOptions {
            plane_video: Some("plane.mp4".to_string()),
            ..PostProcessOptions::default()
        };
        let report = process_scene(&mut graph, &mut videos, &options);
        assert_eq!(report.videos.len(), 2);
        assert_eq!(videos.len(), 1);
        assert_eq!(
            graph.node(left).unwrap().material,
            graph.node(right).unwrap().material
        );
    }

    #[test]
    fn shadow_catcher_and_anchor_are_recorded() {
        let mut graph = SceneGraph::new();
        let catcher = add_mesh(&mut graph, "ShadowCatcher", Material::default());
        let mut anchor = Node::new("CameraAnchor");
        anchor.role = NodeRole::CameraAnchor;
        anchor.transform.translation = Vec3::new(1.0, 2.0, 3.0);
        graph.add_node(anchor, None);

        let options = PostProcessOptions {
            shadow_catcher_color: [0.2, 0.2, 0.2, 1.0],
            ..PostProcessOptions::default()
        };
        let report = process_scene(&mut graph, &mut registry(), &options);
        assert_eq!(report.shadow_catchers, vec![catcher]);
        assert_eq!(report.camera_target, Some(Vec3::new(1.0, 2.0, 3.0)));
        let node = graph.node(catcher).unwrap();
        assert!(node.cast_shadow && node.receive_shadow);
        let material = graph.material(node.material.unwrap()).unwrap();
        assert_eq!(material.base_color, [0.2, 0.2, 0.2, 1.0]);
        assert!(!material.transparent);
    }
}
