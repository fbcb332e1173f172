use glam::Vec3;

use super::Camera;

const PITCH_LIMIT: f32 = 1.45;

/// Orbit controls: rotate on drag, zoom on scroll. Panning stays disabled.
#[derive(Debug, Clone, Copy)]
pub struct OrbitControls {
    pub target: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub distance: f32,
    pub enabled: bool,
    pub enable_zoom: bool,
    pub enable_pan: bool,
    pub rotate_speed: f32,
    pub zoom_speed: f32,
    pub min_distance: f32,
    pub max_distance: f32,
}

impl Default for OrbitControls {
    fn default() -> Self {
        Self {
            target: Vec3::ZERO,
            yaw: 0.0,
            pitch: 0.0,
            distance: 10.0,
            enabled: true,
            enable_zoom: true,
            enable_pan: false,
            rotate_speed: 0.005,
            zoom_speed: 0.1,
            min_distance: 0.05,
            max_distance: f32::INFINITY,
        }
    }
}

impl OrbitControls {
    /// Controls that keep `camera` where it is and circle around `target`.
    pub fn looking_at(camera: &Camera, target: Vec3) -> Self {
        let offset = camera.position - target;
        let distance = offset.length().max(1e-3);
        let (yaw, pitch) = offset_to_yaw_pitch(offset);
        Self {
            target,
            yaw,
            pitch: pitch.clamp(-PITCH_LIMIT, PITCH_LIMIT),
            distance,
            min_distance: (distance * 0.01).max(1e-3),
            max_distance: distance * 50.0,
            ..Self::default()
        }
    }

    pub fn eye_position(&self) -> Vec3 {
        let cos_pitch = self.pitch.cos();
        let offset = Vec3::new(
            self.yaw.sin() * cos_pitch,
            self.pitch.sin(),
            self.yaw.cos() * cos_pitch,
        );
        self.target + offset * self.distance
    }

    /// Returns whether the camera needs updating.
    pub fn on_drag(&mut self, dx: f32, dy: f32) -> bool {
        if !self.enabled || (dx == 0.0 && dy == 0.0) {
            return false;
        }
        self.yaw -= dx * self.rotate_speed;
        self.pitch = (self.pitch + dy * self.rotate_speed).clamp(-PITCH_LIMIT, PITCH_LIMIT);
        wrap_angle(&mut self.yaw);
        true
    }

    /// Positive `delta` zooms in.
    pub fn on_scroll(&mut self, delta: f32) -> bool {
        if !self.enabled || !self.enable_zoom || delta == 0.0 {
            return false;
        }
        let scale = (1.0 - delta * self.zoom_speed).clamp(0.2, 5.0);
        self.distance = (self.distance * scale).clamp(self.min_distance, self.max_distance);
        true
    }

    pub fn apply(&self, camera: &mut Camera) {
        camera.position = self.eye_position();
        camera.look_at(self.target);
    }
}

fn offset_to_yaw_pitch(offset: Vec3) -> (f32, f32) {
    let direction = offset.try_normalize().unwrap_or(Vec3::Z);
    let yaw = direction.x.atan2(direction.z);
    let pitch = direction.y.clamp(-1.0, 1.0).asin();
    (yaw, pitch)
}

fn wrap_angle(angle: &mut f32) {
    const TWO_PI: f32 = std::f32::consts::PI * 2.0;
    if angle.is_finite() {
        *angle = (*angle + std::f32::consts::PI).rem_euclid(TWO_PI) - std::f32::consts::PI;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_at(position: Vec3) -> Camera {
        let mut camera = Camera {
            position,
            ..Camera::default()
        };
        camera.look_at(Vec3::ZERO);
        camera
    }

    #[test]
    fn looking_at_preserves_camera_position() {
        let camera = camera_at(Vec3::new(3.0, 2.0, 6.0));
        let controls = OrbitControls::looking_at(&camera, Vec3::ZERO);
        assert!((controls.eye_position() - camera.position).length() < 1e-4);
    }

    #[test]
    fn drag_keeps_distance_and_clamps_pitch() {
        let mut camera = camera_at(Vec3::new(0.0, 0.0, 5.0));
        let mut controls = OrbitControls::looking_at(&camera, Vec3::ZERO);
        assert!(controls.on_drag(120.0, 10_000.0));
        controls.apply(&mut camera);

        assert!((camera.position.length() - 5.0).abs() < 1e-4);
        assert!(controls.pitch <= PITCH_LIMIT);
        assert!(controls.yaw.is_finite());
        let to_target = (-camera.position).normalize();
        assert!((camera.forward() - to_target).length() < 1e-4);
    }

    #[test]
    fn disabled_controls_ignore_input() {
        let mut controls = OrbitControls::looking_at(&camera_at(Vec3::Z * 5.0), Vec3::ZERO);
        controls.enabled = false;
        assert!(!controls.on_drag(10.0, 0.0));
        assert!(!controls.on_scroll(1.0));
        assert_eq!(controls.distance, 5.0);
    }

    #[test]
    fn scroll_zooms_within_limits() {
        let mut controls = OrbitControls::looking_at(&camera_at(Vec3::Z * 5.0), Vec3::ZERO);
        assert!(controls.on_scroll(1.0));
        assert!(controls.distance < 5.0);
        for _ in 0..1000 {
            controls.on_scroll(1.0);
        }
        assert_eq!(controls.distance, controls.min_distance);
    }

    #[test]
    fn wrap_angle_stays_in_range() {
        let mut angle = 7.5 * std::f32::consts::PI;
        wrap_angle(&mut angle);
        assert!(angle >= -std::f32::consts::PI && angle <= std::f32::consts::PI);
    }
}
