pub mod orbit;

use glam::{Mat4, Quat, Vec3};

use crate::scene::bounds::Aabb;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CameraError {
    #[error("invalid camera configuration: {0}")]
    InvalidConfig(String),
    #[error("scene has no embedded camera")]
    NoEmbeddedCamera,
    #[error("scene bounds are empty, cannot place a camera")]
    EmptyBounds,
}

/// How the active camera is placed after a scene loads.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum CameraStrategy {
    /// Copy the first camera stored in the scene file.
    #[default]
    Embedded,
    /// Frame the scene bounds at the configured field of view.
    #[serde(rename = "bounds")]
    #[value(name = "bounds")]
    BoundingBox,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub strategy: CameraStrategy,
    pub fov_deg: f32,
    pub near: f32,
    pub far: f32,
    pub aspect: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            strategy: CameraStrategy::Embedded,
            fov_deg: 50.0,
            near: 0.1,
            far: 1000.0,
            aspect: 16.0 / 9.0,
        }
    }
}

impl CameraConfig {
    pub fn validate(&self) -> Result<(), CameraError> {
        validate_projection(self.fov_deg, self.near, self.far, self.aspect)
    }
}

fn validate_projection(fov_deg: f32, near: f32, far: f32, aspect: f32) -> Result<(), CameraError> {
    if !(fov_deg > 0.0 && fov_deg < 180.0) {
        return Err(CameraError::InvalidConfig(format!(
            "fov must be between 0 and 180 degrees, got {fov_deg}"
        )));
    }
    if !(near > 0.0) {
        return Err(CameraError::InvalidConfig(format!("near must be positive, got {near}")));
    }
    if !(near < far) {
        return Err(CameraError::InvalidConfig(format!(
            "near ({near}) must be less than far ({far})"
        )));
    }
    if !(aspect > 0.0) || !aspect.is_finite() {
        return Err(CameraError::InvalidConfig(format!("aspect must be positive, got {aspect}")));
    }
    Ok(())
}

/// A perspective camera stored in the scene file, already in world space.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedCamera {
    pub name: String,
    pub fov_deg: f32,
    pub near: f32,
    pub far: Option<f32>,
    pub aspect: Option<f32>,
    pub position: Vec3,
    pub rotation: Quat,
    /// Offset added to the position, read from the `random_delta_transform` extra.
    pub delta: Option<Vec3>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub fov_deg: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Camera {
    fn default() -> Self {
        let mut camera = Self {
            fov_deg: 50.0,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
            position: Vec3::new(0.0, 0.0, 10.0),
            rotation: Quat::IDENTITY,
        };
        camera.look_at(Vec3::ZERO);
        camera
    }
}

impl Camera {
    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }

    pub fn look_at(&mut self, target: Vec3) {
        let Some(direction) = (target - self.position).try_normalize() else {
            return;
        };
        let up = if direction.cross(Vec3::Y).length_squared() < 1e-8 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        let view = Mat4::look_at_rh(self.position, target, up);
        let (_, rotation, _) = view.inverse().to_scale_rotation_translation();
        self.rotation = rotation.normalize();
    }

    pub fn set_aspect(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position).inverse()
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_deg.to_radians(), self.aspect, self.near, self.far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn validate(&self) -> Result<(), CameraError> {
        validate_projection(self.fov_deg, self.near, self.far, self.aspect)
    }
}

/// Distance at which an object of size `max_extent` fills a `fov_deg` frustum.
pub fn framing_distance(max_extent: f32, fov_deg: f32) -> f32 {
    (max_extent * 0.5) / (fov_deg.to_radians() * 0.5).tan()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedCamera {
    pub camera: Camera,
    /// Point the orbit controls circle around.
    pub orbit_target: Vec3,
}

/// Places the active camera according to `config.strategy`.
///
/// `anchor` is the camera-anchor look-at point found during post-processing.
pub fn derive_camera(
    config: &CameraConfig,
    embedded: &[EmbeddedCamera],
    bounds: &Aabb,
    anchor: Option<Vec3>,
) -> Result<DerivedCamera, CameraError> {
    config.validate()?;
    let derived = match config.strategy {
        CameraStrategy::Embedded => from_embedded(config, embedded, bounds, anchor)?,
        CameraStrategy::BoundingBox => from_bounds(config, bounds, anchor)?,
    };
    derived.camera.validate()?;
    Ok(derived)
}

fn from_embedded(
    config: &CameraConfig,
    embedded: &[EmbeddedCamera],
    bounds: &Aabb,
    anchor: Option<Vec3>,
) -> Result<DerivedCamera, CameraError> {
    let source = embedded.first().ok_or(CameraError::NoEmbeddedCamera)?;
    let near = source.near;
    // Infinite projections get a finite far plane.
    let far = source
        .far
        .unwrap_or(if config.far > near { config.far } else { near * 10_000.0 });
    let camera = Camera {
        fov_deg: source.fov_deg,
        aspect: source.aspect.unwrap_or(config.aspect),
        near,
        far,
        position: source.position + source.delta.unwrap_or(Vec3::ZERO),
        rotation: source.rotation,
    };

    let orbit_target = anchor.unwrap_or_else(|| {
        let reach = if bounds.is_empty() {
            10.0
        } else {
            (bounds.center() - camera.position).length().max(near * 10.0)
        };
        camera.position + camera.forward() * reach
    });
    Ok(DerivedCamera {
        camera,
        orbit_target,
    })
}

fn from_bounds(
    config: &CameraConfig,
    bounds: &Aabb,
    anchor: Option<Vec3>,
) -> Result<DerivedCamera, CameraError> {
    let length = bounds.diagonal();
    if bounds.is_empty() || length <= f32::EPSILON {
        return Err(CameraError::EmptyBounds);
    }
    let target = anchor.unwrap_or_else(|| bounds.center());
    let distance = framing_distance(bounds.max_extent(), config.fov_deg);
    let mut camera = Camera {
        fov_deg: config.fov_deg,
        aspect: config.aspect,
        near: length / 100.0,
        far: length * 100.0,
        position: target + Vec3::Z * distance,
        rotation: Quat::IDENTITY,
    };
    camera.look_at(target);
    Ok(DerivedCamera {
        camera,
        orbit_target: target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_bounds(size: f32) -> Aabb {
        Aabb::new(Vec3::splat(-size * 0.5), Vec3::splat(size * 0.5))
    }

    fn embedded_camera() -> EmbeddedCamera {
        EmbeddedCamera {
            name: "Camera".to_string(),
            fov_deg: 40.0,
            near: 0.5,
            far: Some(200.0),
            aspect: None,
            position: Vec3::new(0.0, 2.0, 12.0),
            rotation: Quat::IDENTITY,
            delta: Some(Vec3::new(1.0, 0.0, 0.0)),
        }
    }

    #[test]
    fn framing_distance_matches_known_value() {
        let distance = framing_distance(10.0, 60.0);
        assert!((distance - 8.660254).abs() < 1e-3);
    }

    #[test]
    fn config_validation_rejects_bad_projections() {
        let base = CameraConfig::default();
        assert!(base.validate().is_ok());
        for config in [
            CameraConfig { fov_deg: 0.0, ..base.clone() },
            CameraConfig { fov_deg: 180.0, ..base.clone() },
            CameraConfig { near: 0.0, ..base.clone() },
            CameraConfig { near: 5.0, far: 5.0, ..base.clone() },
            CameraConfig { aspect: 0.0, ..base.clone() },
            CameraConfig { fov_deg: f32::NAN, ..base.clone() },
        ] {
            assert!(matches!(config.validate(), Err(CameraError::InvalidConfig(_))));
        }
    }

    #[test]
    fn bounds_strategy_frames_the_scene() {
        let config = CameraConfig {
            strategy: CameraStrategy::BoundingBox,
            fov_deg: 60.0,
            ..CameraConfig::default()
        };
        let bounds = unit_bounds(10.0);
        let derived = derive_camera(&config, &[], &bounds, None).unwrap();
        let camera = derived.camera;

        let length = bounds.diagonal();
        assert!((camera.near - length / 100.0).abs() < 1e-5);
        assert!((camera.far - length * 100.0).abs() < 1e-2);
        assert!((camera.position - Vec3::new(0.0, 0.0, 8.660254)).length() < 1e-3);
        assert!((camera.forward() - Vec3::NEG_Z).length() < 1e-5);
        assert_eq!(derived.orbit_target, Vec3::ZERO);
    }

    #[test]
    fn bounds_strategy_looks_at_anchor() {
        let config = CameraConfig {
            strategy: CameraStrategy::BoundingBox,
            ..CameraConfig::default()
        };
        let anchor = Vec3::new(2.0, 1.0, 0.0);
        let derived = derive_camera(&config, &[], &unit_bounds(4.0), Some(anchor)).unwrap();
        let to_anchor = (anchor - derived.camera.position).normalize();
        assert!((derived.camera.forward() - to_anchor).length() < 1e-4);
    }

    #[test]
    fn empty_bounds_are_reported() {
        let config = CameraConfig {
            strategy: CameraStrategy::BoundingBox,
            ..CameraConfig::default()
        };
        assert_eq!(
            derive_camera(&config, &[], &Aabb::EMPTY, None),
            Err(CameraError::EmptyBounds)
        );
    }

    #[test]
    fn embedded_strategy_copies_camera_and_applies_delta() {
        let derived =
            derive_camera(&CameraConfig::default(), &[embedded_camera()], &unit_bounds(2.0), None)
                .unwrap();
        let camera = derived.camera;
        assert_eq!(camera.fov_deg, 40.0);
        assert_eq!(camera.near, 0.5);
        assert_eq!(camera.far, 200.0);
        assert_eq!(camera.position, Vec3::new(1.0, 2.0, 12.0));
        assert!(camera.near < camera.far);
        assert!(derived.orbit_target.z < camera.position.z);
    }

    #[test]
    fn missing_embedded_camera_is_reported() {
        assert_eq!(
            derive_camera(&CameraConfig::default(), &[], &unit_bounds(1.0), None),
            Err(CameraError::NoEmbeddedCamera)
        );
    }

    #[test]
    fn invalid_embedded_camera_is_rejected() {
        let mut broken = embedded_camera();
        broken.far = Some(0.1);
        assert!(matches!(
            derive_camera(&CameraConfig::default(), &[broken], &unit_bounds(1.0), None),
            Err(CameraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn look_at_straight_down_stays_finite() {
        let mut camera = Camera {
            position: Vec3::new(0.0, 10.0, 0.0),
            ..Camera::default()
        };
        camera.look_at(Vec3::ZERO);
        assert!((camera.forward() - Vec3::NEG_Y).length() < 1e-4);
    }
}
