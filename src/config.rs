use std::path::{Path, PathBuf};

use crate::camera::{CameraConfig, CameraError};
use crate::render::lights::LightRig;
use crate::scene::postprocess::PostProcessOptions;
use crate::scene::RoleMarkers;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "loopview".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Everything the viewer can be told up front. Every field has a default.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub scene: PathBuf,
    pub camera: CameraConfig,
    pub markers: RoleMarkers,
    /// Video for nodes classified as video planes, relative to the scene file.
    pub plane_video: Option<String>,
    pub autoplay: bool,
    pub environment_hdr: Option<PathBuf>,
    pub environment_intensity: f32,
    pub lights: LightRig,
    pub background_color: [f32; 3],
    pub shadow_catcher_color: [f32; 4],
    /// Node turned by the rotate key; the whole model when unset.
    pub rotate_group: Option<String>,
    pub window: WindowConfig,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            scene: PathBuf::from("output.glb"),
            camera: CameraConfig::default(),
            markers: RoleMarkers::default(),
            plane_video: None,
            autoplay: true,
            environment_hdr: None,
            environment_intensity: 1.0,
            lights: LightRig::default(),
            background_color: [0.5, 0.5, 0.5],
            shadow_catcher_color: [0.8, 0.8, 0.8, 1.0],
            rotate_group: None,
            window: WindowConfig::default(),
        }
    }
}

impl ViewerConfig {
    pub fn validate(&self) -> Result<()> {
        self.camera.validate()?;
        if self.window.width == 0 || self.window.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "window size must be non-zero, got {}x{}",
                self.window.width, self.window.height
            )));
        }
        let shadow = &self.lights.directional.shadow;
        if !(shadow.near > 0.0 && shadow.near < shadow.far) {
            return Err(ConfigError::Invalid(format!(
                "shadow near ({}) must be positive and below far ({})",
                shadow.near, shadow.far
            )));
        }
        if shadow.map_size == 0 || shadow.map_size > 8192 {
            return Err(ConfigError::Invalid(format!(
                "shadow map size must be within 1..=8192, got {}",
                shadow.map_size
            )));
        }
        if self.lights.points.iter().any(|light| !(light.range > 0.0)) {
            return Err(ConfigError::Invalid("point light range must be positive".to_string()));
        }
        Ok(())
    }

    pub fn postprocess_options(&self) -> PostProcessOptions {
        PostProcessOptions {
            plane_video: self.plane_video.clone(),
            shadow_catcher_color: self.shadow_catcher_color,
        }
    }
}

pub fn save_config(config: &ViewerConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)?;
    Ok(())
}

pub fn load_config(path: &Path) -> Result<ViewerConfig> {
    let json = std::fs::read_to_string(path)?;
    let config: ViewerConfig = serde_json::from_str(&json)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraStrategy;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_file(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "loopview_{label}_{}_{nanos}.json",
            std::process::id()
        ))
    }

    #[test]
    fn defaults_are_valid() {
        ViewerConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let json = r#"{ "scene": "room.glb", "camera": { "strategy": "bounds", "fov_deg": 60.0 } }"#;
        let config: ViewerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.scene, PathBuf::from("room.glb"));
        assert_eq!(config.camera.strategy, CameraStrategy::BoundingBox);
        assert_eq!(config.camera.fov_deg, 60.0);
        assert_eq!(config.camera.near, CameraConfig::default().near);
        assert!(config.autoplay);
        assert_eq!(config.lights, LightRig::default());
    }

    #[test]
    fn save_then_load_keeps_settings() {
        let path = temp_file("config");
        let mut config = ViewerConfig::default();
        config.plane_video = Some("plane.mp4".to_string());
        config.lights.directional.shadow.far = 80.0;
        save_config(&config, &path).unwrap();
        let loaded = load_config(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn invalid_values_are_rejected_on_load() {
        let path = temp_file("invalid");
        std::fs::write(&path, r#"{ "camera": { "near": 10.0, "far": 1.0 } }"#).unwrap();
        let result = load_config(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ConfigError::Camera(CameraError::InvalidConfig(_)))));

        let mut config = ViewerConfig::default();
        config.lights.directional.shadow.near = 60.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
