//! Pointer and keyboard manipulation of the loaded scene.

pub mod pick;

use glam::{Quat, Vec3};

use crate::scene::bounds::{subtree_bounds, Aabb};
use crate::scene::{NodeId, NodeRole, SceneGraph};
use pick::{ray_plane, Ray};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragPlane {
    pub point: Vec3,
    pub normal: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragSession {
    pub node: NodeId,
    pub plane: DragPlane,
    /// Hit point minus the node's world origin at grab time.
    pub offset: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum InteractionMode {
    #[default]
    Idle,
    Orbiting,
    Dragging(DragSession),
}

#[derive(Debug, Default)]
pub struct Interaction {
    mode: InteractionMode,
    selectable: Vec<NodeId>,
    helper: Option<Aabb>,
}

impl Interaction {
    pub fn new(selectable: Vec<NodeId>) -> Self {
        Self {
            selectable,
            ..Self::default()
        }
    }

    /// Children of `model_root`, minus background and shadow catcher nodes.
    pub fn selectable_children(graph: &SceneGraph, model_root: NodeId) -> Vec<NodeId> {
        graph
            .node(model_root)
            .map(|root| {
                root.children
                    .iter()
                    .copied()
                    .filter(|child| {
                        graph.node(*child).is_some_and(|node| {
                            !matches!(node.role, NodeRole::Background | NodeRole::ShadowCatcher)
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn mode(&self) -> InteractionMode {
        self.mode
    }

    /// Orbit controls follow this: off while an object is being dragged.
    pub fn orbit_enabled(&self) -> bool {
        !matches!(self.mode, InteractionMode::Dragging(_))
    }

    /// World box around the dragged object.
    pub fn helper_bounds(&self) -> Option<Aabb> {
        self.helper
    }

    pub fn pointer_down(&mut self, graph: &SceneGraph, ray: &Ray, view_direction: Vec3) -> InteractionMode {
        self.mode = match pick::pick(graph, &self.selectable, ray) {
            Some(hit) => {
                let origin = graph.world_position(hit.node);
                let normal = (-view_direction).try_normalize().unwrap_or(Vec3::Z);
                let session = DragSession {
                    node: hit.node,
                    plane: DragPlane {
                        point: hit.point,
                        normal,
                    },
                    offset: hit.point - origin,
                };
                self.helper = Some(self.bounds_of(graph, hit.node));
                log::debug!("Grabbed node {:?} at {:?}", hit.node, hit.point);
                InteractionMode::Dragging(session)
            }
            None => InteractionMode::Orbiting,
        };
        self.mode
    }

    /// Moves the dragged node along its plane. Returns the refreshed helper box.
    pub fn pointer_move(&mut self, graph: &mut SceneGraph, ray: &Ray) -> Option<Aabb> {
        let InteractionMode::Dragging(session) = self.mode else {
            return None;
        };
        let point = ray_plane(ray, session.plane.point, session.plane.normal)?;
        graph.set_world_position(session.node, point - session.offset);
        self.helper = Some(self.bounds_of(graph, session.node));
        self.helper
    }

    pub fn pointer_up(&mut self) {
        self.mode = InteractionMode::Idle;
        self.helper = None;
    }

    fn bounds_of(&self, graph: &SceneGraph, node: NodeId) -> Aabb {
        subtree_bounds(graph, &graph.world_matrices(), node)
    }
}

/// Quarter turns of one node about +Y, driven by a key.
#[derive(Debug, Clone, Copy)]
pub struct GroupRotator {
    pub node: NodeId,
    pub step: f32,
    angle: f32,
    /// Rotation the node was imported with; turns are applied on top of it.
    base: Quat,
}

impl GroupRotator {
    pub fn new(graph: &SceneGraph, node: NodeId) -> Self {
        let base = graph
            .node(node)
            .map(|node| node.transform.rotation)
            .unwrap_or(Quat::IDENTITY);
        Self {
            node,
            step: std::f32::consts::FRAC_PI_2,
            angle: 0.0,
            base,
        }
    }

    pub fn angle(&self) -> f32 {
        self.angle
    }

    /// Adds one step and writes the base rotation turned by the total angle.
    pub fn rotate(&mut self, graph: &mut SceneGraph) -> f32 {
        self.angle = (self.angle + self.step).rem_euclid(std::f32::consts::TAU);
        if let Some(node) = graph.node_mut(self.node) {
            node.transform.rotation = Quat::from_rotation_y(self.angle) * self.base;
        }
        self.angle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Geometry, Node};

    fn model() -> (SceneGraph, NodeId, NodeId, NodeId) {
        let mut graph = SceneGraph::new();
        let root = graph.add_node(Node::new("Scene"), None);
        let geometry = graph.add_geometry(Geometry::quad(2.0, 2.0));

        let mut chair = Node::new("Chair");
        chair.geometry = Some(geometry);
        chair.transform.translation = Vec3::new(1.0, 0.0, 0.0);
        chair.transform.rotation = Quat::from_rotation_z(0.3);
        let chair = graph.add_node(chair, Some(root));

        let mut background = Node::new("Background");
        background.geometry = Some(geometry);
        background.role = NodeRole::Background;
        background.transform.translation = Vec3::new(0.0, 0.0, -5.0);
        let background = graph.add_node(background, Some(root));
        (graph, root, chair, background)
    }

    #[test]
    fn selectable_excludes_background() {
        let (graph, root, chair, _) = model();
        assert_eq!(Interaction::selectable_children(&graph, root), vec![chair]);
    }

    #[test]
    fn drag_keeps_grab_offset_and_rotation() {
        let (mut graph, root, chair, _) = model();
        let mut interaction = Interaction::new(Interaction::selectable_children(&graph, root));
        let rotation = graph.node(chair).unwrap().transform.rotation;

        let down = Ray::new(Vec3::new(1.2, 0.3, 10.0), Vec3::NEG_Z);
        let InteractionMode::Dragging(session) = interaction.pointer_down(&graph, &down, Vec3::NEG_Z)
        else {
            panic!("expected a drag to start");
        };
        let grabbed = Vec3::new(1.2, 0.3, 0.0);
        assert!((session.offset - (grabbed - Vec3::new(1.0, 0.0, 0.0))).length() < 1e-5);
        assert!(!interaction.orbit_enabled());
        assert!(interaction.helper_bounds().is_some());

        let moved = Ray::new(Vec3::new(3.2, -1.7, 10.0), Vec3::NEG_Z);
        let helper = interaction.pointer_move(&mut graph, &moved).unwrap();
        let target = Vec3::new(3.2, -1.7, 0.0) - session.offset;
        assert!((graph.world_position(chair) - target).length() < 1e-4);
        assert_eq!(graph.node(chair).unwrap().transform.rotation, rotation);
        assert!((helper.center() - target).length() < 1e-4);

        interaction.pointer_up();
        assert_eq!(interaction.mode(), InteractionMode::Idle);
        assert!(interaction.orbit_enabled());
        assert!(interaction.helper_bounds().is_none());
    }

    #[test]
    fn missing_every_object_orbits() {
        let (mut graph, root, chair, _) = model();
        let mut interaction = Interaction::new(Interaction::selectable_children(&graph, root));
        // Straight at the background, which is not selectable.
        let ray = Ray::new(Vec3::new(-0.5, 0.0, 10.0), Vec3::NEG_Z);
        assert_eq!(
            interaction.pointer_down(&graph, &ray, Vec3::NEG_Z),
            InteractionMode::Orbiting
        );
        assert!(interaction.orbit_enabled());
        let before = graph.world_position(chair);
        assert!(interaction.pointer_move(&mut graph, &ray).is_none());
        assert_eq!(graph.world_position(chair), before);
    }

    #[test]
    fn rotator_wraps_after_four_presses() {
        let (mut graph, root, _, _) = model();
        let mut rotator = GroupRotator::new(&graph, root);
        for _ in 0..3 {
            rotator.rotate(&mut graph);
        }
        assert!((rotator.angle() - 3.0 * std::f32::consts::FRAC_PI_2).abs() < 1e-5);
        let angle = rotator.rotate(&mut graph);
        assert!(angle.abs() < 1e-5 || (angle - std::f32::consts::TAU).abs() < 1e-5);
        let rotation = graph.node(root).unwrap().transform.rotation;
        assert!(rotation.angle_between(Quat::IDENTITY) < 1e-3);
    }

    #[test]
    fn rotator_turns_on_top_of_the_imported_rotation() {
        let (mut graph, root, _, _) = model();
        let base = Quat::from_rotation_x(-std::f32::consts::FRAC_PI_2);
        graph.node_mut(root).unwrap().transform.rotation = base;
        let mut rotator = GroupRotator::new(&graph, root);

        rotator.rotate(&mut graph);
        let turned = graph.node(root).unwrap().transform.rotation;
        let expected = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2) * base;
        assert!(turned.angle_between(expected) < 1e-3);

        for _ in 0..3 {
            rotator.rotate(&mut graph);
        }
        let rotation = graph.node(root).unwrap().transform.rotation;
        assert!(rotation.angle_between(base) < 1e-3);
    }
}
