use glam::{Mat4, Vec3};

use crate::scene::bounds::Aabb;

pub const MAX_POINT_LIGHTS: usize = 4;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AmbientLight {
    pub color: [f32; 3],
    pub intensity: f32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PointLight {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub intensity: f32,
    /// Distance at which the light fades out completely.
    pub range: f32,
    pub cast_shadow: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ShadowSettings {
    pub map_size: u32,
    pub near: f32,
    pub far: f32,
    pub bias: f32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DirectionalLight {
    pub position: [f32; 3],
    pub target: [f32; 3],
    pub color: [f32; 3],
    pub intensity: f32,
    pub cast_shadow: bool,
    pub shadow: ShadowSettings,
}

impl DirectionalLight {
    /// Unit vector pointing from the scene toward the light.
    pub fn direction(&self) -> Vec3 {
        (Vec3::from_array(self.position) - Vec3::from_array(self.target))
            .try_normalize()
            .unwrap_or(Vec3::Y)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LightRig {
    pub ambient: AmbientLight,
    pub points: Vec<PointLight>,
    pub directional: DirectionalLight,
}

impl Default for LightRig {
    fn default() -> Self {
        let point = |position: [f32; 3]| PointLight {
            position,
            color: [1.0, 1.0, 1.0],
            intensity: 1.5,
            range: 100.0,
            cast_shadow: true,
        };
        Self {
            ambient: AmbientLight {
                color: [1.0, 1.0, 1.0],
                intensity: 1.5,
            },
            points: vec![point([10.0, 20.0, 10.0]), point([0.0, 0.0, 10.0])],
            directional: DirectionalLight {
                position: [10.0, 20.0, -10.0],
                target: [0.0, 0.0, 0.0],
                color: [1.0, 1.0, 1.0],
                intensity: 1.0,
                cast_shadow: true,
                shadow: ShadowSettings {
                    map_size: 2048,
                    near: 0.5,
                    far: 50.0,
                    bias: 0.002,
                },
            },
        }
    }
}

/// Light-space matrix for the directional shadow map.
///
/// The orthographic box is centered on the light target and sized to cover
/// `bounds`; depth is clipped to the configured near/far.
pub fn shadow_view_projection(light: &DirectionalLight, bounds: &Aabb) -> Mat4 {
    let target = Vec3::from_array(light.target);
    let eye = target + light.direction() * light.shadow.far * 0.5;
    let up = if light.direction().cross(Vec3::Y).length_squared() < 1e-6 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let view = Mat4::look_at_rh(eye, target, up);
    let half_extent = if bounds.is_empty() {
        10.0
    } else {
        // Radius around the light target that still contains every corner.
        bounds
            .corners()
            .iter()
            .map(|corner| corner.distance(target))
            .fold(0.0_f32, f32::max)
            .max(1.0)
    };
    let near = light.shadow.near.max(1e-3);
    let far = light.shadow.far.max(near + 1e-3);
    let projection = Mat4::orthographic_rh(
        -half_extent,
        half_extent,
        -half_extent,
        half_extent,
        near,
        far,
    );
    projection * view
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightsUniform {
    pub ambient: [f32; 4],
    /// xyz toward the light, w = 1 when shadows are enabled.
    pub direction: [f32; 4],
    pub directional_color: [f32; 4],
    /// xyz position, w = range.
    pub point_positions: [[f32; 4]; MAX_POINT_LIGHTS],
    pub point_colors: [[f32; 4]; MAX_POINT_LIGHTS],
    /// x = point light count.
    pub counts: [u32; 4],
    pub shadow_view_proj: [[f32; 4]; 4],
    /// x = depth bias, y = shadow map texel size.
    pub shadow_params: [f32; 4],
}

impl LightsUniform {
    /// `environment` adds the irradiance of an HDR probe to the ambient term.
    pub fn new(rig: &LightRig, shadow: Mat4, environment: Option<[f32; 3]>) -> Self {
        let env = environment.unwrap_or([0.0; 3]);
        let ambient = rig.ambient.color.map(|channel| channel * rig.ambient.intensity);
        let mut point_positions = [[0.0; 4]; MAX_POINT_LIGHTS];
        let mut point_colors = [[0.0; 4]; MAX_POINT_LIGHTS];
        if rig.points.len() > MAX_POINT_LIGHTS {
            log::warn!(
                "{} point lights configured, only the first {} are used",
                rig.points.len(),
                MAX_POINT_LIGHTS
            );
        }
        let count = rig.points.len().min(MAX_POINT_LIGHTS);
        for (index, light) in rig.points.iter().take(count).enumerate() {
            point_positions[index] = [
                light.position[0],
                light.position[1],
                light.position[2],
                light.range,
            ];
            let [r, g, b] = light.color.map(|channel| channel * light.intensity);
            point_colors[index] = [r, g, b, 1.0];
        }
        let directional = &rig.directional;
        let direction = directional.direction();
        let [r, g, b] = directional.color.map(|channel| channel * directional.intensity);
        Self {
            ambient: [ambient[0] + env[0], ambient[1] + env[1], ambient[2] + env[2], 1.0],
            direction: [
                direction.x,
                direction.y,
                direction.z,
                if directional.cast_shadow { 1.0 } else { 0.0 },
            ],
            directional_color: [r, g, b, 1.0],
            point_positions,
            point_colors,
            counts: [count as u32, 0, 0, 0],
            shadow_view_proj: shadow.to_cols_array_2d(),
            shadow_params: [
                directional.shadow.bias,
                1.0 / directional.shadow.map_size.max(1) as f32,
                0.0,
                0.0,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rig_matches_scene_defaults() {
        let rig = LightRig::default();
        assert_eq!(rig.ambient.intensity, 1.5);
        assert_eq!(rig.points.len(), 2);
        assert!(rig.points.iter().all(|light| light.range == 100.0 && light.cast_shadow));
        assert_eq!(rig.directional.shadow.map_size, 2048);
        assert_eq!(rig.directional.shadow.near, 0.5);
        assert_eq!(rig.directional.shadow.far, 50.0);
    }

    #[test]
    fn shadow_frustum_contains_scene_bounds() {
        let rig = LightRig::default();
        let bounds = Aabb::new(Vec3::splat(-3.0), Vec3::splat(3.0));
        let matrix = shadow_view_projection(&rig.directional, &bounds);
        for corner in bounds.corners() {
            let clip = matrix.project_point3(corner);
            assert!(clip.x.abs() <= 1.0 + 1e-4, "{clip:?}");
            assert!(clip.y.abs() <= 1.0 + 1e-4, "{clip:?}");
            assert!((0.0..=1.0).contains(&clip.z), "{clip:?}");
        }
    }

    #[test]
    fn shadow_frustum_follows_near_far_changes() {
        let mut light = LightRig::default().directional;
        let bounds = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let before = shadow_view_projection(&light, &bounds);
        light.shadow.far = 80.0;
        let after = shadow_view_projection(&light, &bounds);
        assert_ne!(before, after);
    }

    #[test]
    fn uniform_packs_lights_and_environment() {
        let uniform = LightsUniform::new(&LightRig::default(), Mat4::IDENTITY, Some([0.5, 0.25, 0.0]));
        assert_eq!(uniform.counts[0], 2);
        assert_eq!(uniform.ambient, [2.0, 1.75, 1.5, 1.0]);
        assert_eq!(uniform.point_positions[0], [10.0, 20.0, 10.0, 100.0]);
        assert_eq!(uniform.direction[3], 1.0);
        assert_eq!(std::mem::size_of::<LightsUniform>() % 16, 0);
    }
}
