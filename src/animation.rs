//! Embedded animation clips, played in a loop like the scene file intends.

use glam::{Quat, Vec3};

use crate::scene::{NodeId, SceneGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Step,
    Linear,
    /// Stored as the value component only, sampled linearly.
    CubicSpline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValues {
    Translation(Vec<Vec3>),
    Rotation(Vec<Quat>),
    Scale(Vec<Vec3>),
}

impl ChannelValues {
    fn len(&self) -> usize {
        match self {
            Self::Translation(values) | Self::Scale(values) => values.len(),
            Self::Rotation(values) => values.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub target: NodeId,
    /// Keyframe times in seconds, ascending.
    pub times: Vec<f32>,
    pub values: ChannelValues,
    pub interpolation: Interpolation,
}

impl Channel {
    /// Keyframe pair around `time` and the blend factor between them.
    fn locate(&self, time: f32) -> Option<(usize, usize, f32)> {
        let count = self.times.len().min(self.values.len());
        if count == 0 {
            return None;
        }
        if count == 1 || time <= self.times[0] {
            return Some((0, 0, 0.0));
        }
        if time >= self.times[count - 1] {
            return Some((count - 1, count - 1, 0.0));
        }
        let next = self.times[..count].partition_point(|key| *key <= time);
        let previous = next - 1;
        let span = self.times[next] - self.times[previous];
        let factor = if span > 0.0 {
            (time - self.times[previous]) / span
        } else {
            0.0
        };
        match self.interpolation {
            Interpolation::Step => Some((previous, previous, 0.0)),
            Interpolation::Linear | Interpolation::CubicSpline => Some((previous, next, factor)),
        }
    }

    pub fn apply(&self, time: f32, graph: &mut SceneGraph) {
        let Some((a, b, t)) = self.locate(time) else {
            return;
        };
        let Some(node) = graph.node_mut(self.target) else {
            return;
        };
        match &self.values {
            ChannelValues::Translation(values) => {
                node.transform.translation = values[a].lerp(values[b], t);
            }
            ChannelValues::Rotation(values) => {
                node.transform.rotation = values[a].slerp(values[b], t).normalize();
            }
            ChannelValues::Scale(values) => {
                node.transform.scale = values[a].lerp(values[b], t);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnimationClip {
    pub name: String,
    pub channels: Vec<Channel>,
}

impl AnimationClip {
    pub fn duration(&self) -> f32 {
        self.channels
            .iter()
            .filter(|channel| channel.values.len() > 0)
            .filter_map(|channel| channel.times.last().copied())
            .fold(0.0, f32::max)
    }
}

/// Plays every clip at once, each looping over its own duration.
#[derive(Debug, Default)]
pub struct AnimationMixer {
    clips: Vec<AnimationClip>,
    time: f32,
    pub paused: bool,
}

impl AnimationMixer {
    pub fn new(clips: Vec<AnimationClip>) -> Self {
        if !clips.is_empty() {
            log::info!("Playing {} animation clip(s)", clips.len());
        }
        Self {
            clips,
            time: 0.0,
            paused: false,
        }
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn update(&mut self, dt: f32, graph: &mut SceneGraph) {
        if self.clips.is_empty() || self.paused {
            return;
        }
        self.time += dt.max(0.0);
        for clip in &self.clips {
            let duration = clip.duration();
            let local = if duration > 0.0 {
                self.time % duration
            } else {
                0.0
            };
            for channel in &clip.channels {
                channel.apply(local, graph);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Node;

    fn graph_with_node() -> (SceneGraph, NodeId) {
        let mut graph = SceneGraph::new();
        let node = graph.add_node(Node::new("animated"), None);
        (graph, node)
    }

    fn slide(target: NodeId, interpolation: Interpolation) -> AnimationClip {
        AnimationClip {
            name: "slide".to_string(),
            channels: vec![Channel {
                target,
                times: vec![0.0, 2.0],
                values: ChannelValues::Translation(vec![Vec3::ZERO, Vec3::new(4.0, 0.0, 0.0)]),
                interpolation,
            }],
        }
    }

    #[test]
    fn linear_translation_is_interpolated() {
        let (mut graph, node) = graph_with_node();
        let mut mixer = AnimationMixer::new(vec![slide(node, Interpolation::Linear)]);
        mixer.update(0.5, &mut graph);
        assert_eq!(graph.node(node).unwrap().transform.translation, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn step_holds_previous_key() {
        let (mut graph, node) = graph_with_node();
        let mut mixer = AnimationMixer::new(vec![slide(node, Interpolation::Step)]);
        mixer.update(1.9, &mut graph);
        assert_eq!(graph.node(node).unwrap().transform.translation, Vec3::ZERO);
    }

    #[test]
    fn clips_loop_over_their_duration() {
        let (mut graph, node) = graph_with_node();
        let mut mixer = AnimationMixer::new(vec![slide(node, Interpolation::Linear)]);
        mixer.update(3.0, &mut graph);
        let translation = graph.node(node).unwrap().transform.translation;
        assert!((translation.x - 2.0).abs() < 1e-5);
    }

    #[test]
    fn rotation_uses_slerp() {
        let (mut graph, node) = graph_with_node();
        let clip = AnimationClip {
            name: "spin".to_string(),
            channels: vec![Channel {
                target: node,
                times: vec![0.0, 1.0],
                values: ChannelValues::Rotation(vec![
                    Quat::IDENTITY,
                    Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
                ]),
                interpolation: Interpolation::Linear,
            }],
        };
        assert_eq!(clip.duration(), 1.0);
        let mut mixer = AnimationMixer::new(vec![clip]);
        mixer.update(0.5, &mut graph);
        let rotation = graph.node(node).unwrap().transform.rotation;
        let expected = Quat::from_rotation_y(std::f32::consts::FRAC_PI_4);
        assert!(rotation.angle_between(expected) < 1e-4);
    }

    #[test]
    fn empty_channels_are_ignored() {
        let (mut graph, node) = graph_with_node();
        let clip = AnimationClip {
            name: "empty".to_string(),
            channels: vec![Channel {
                target: node,
                times: Vec::new(),
                values: ChannelValues::Scale(Vec::new()),
                interpolation: Interpolation::Linear,
            }],
        };
        let mut mixer = AnimationMixer::new(vec![clip]);
        mixer.update(1.0, &mut graph);
        assert_eq!(graph.node(node).unwrap().transform.scale, Vec3::ONE);
    }
}
