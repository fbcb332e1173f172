//! loopview: a desktop viewer for glTF scenes with looping video textures.
//!
//! Loads one scene, places a camera, binds videos to the meshes that ask for
//! them and renders continuously with orbit, drag and keyboard controls.

mod animation;
mod app;
mod assets;
mod camera;
mod config;
mod interaction;
mod render;
mod scene;
mod ui;
mod video;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use camera::CameraStrategy;
use config::ViewerConfig;

#[derive(Parser, Debug)]
#[command(about = "glTF viewer with looping video textures", version)]
struct Args {
    /// Scene file (.glb or .gltf); defaults to the config's scene
    scene: Option<PathBuf>,

    /// JSON viewer configuration; every field is optional
    #[arg(long)]
    config: Option<PathBuf>,

    /// How the initial camera is placed
    #[arg(long, value_enum)]
    camera: Option<CameraStrategy>,

    /// Vertical field of view in degrees for the bounding-box camera
    #[arg(long)]
    fov: Option<f32>,

    /// Equirectangular HDR panorama used as ambient lighting
    #[arg(long)]
    hdr: Option<PathBuf>,

    /// Video shown on nodes marked as video planes, relative to the scene
    #[arg(long)]
    plane_video: Option<String>,

    /// Bind videos paused instead of playing them on load
    #[arg(long)]
    no_autoplay: bool,

    /// Write the effective configuration to this file and exit
    #[arg(long)]
    save_config: Option<PathBuf>,
}

impl Args {
    /// Reads the config file when given, then layers the flags on top.
    fn into_config(self) -> anyhow::Result<(ViewerConfig, Option<PathBuf>)> {
        let mut config = match &self.config {
            Some(path) => config::load_config(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => ViewerConfig::default(),
        };
        if let Some(scene) = self.scene {
            config.scene = scene;
        }
        if let Some(strategy) = self.camera {
            config.camera.strategy = strategy;
        }
        if let Some(fov) = self.fov {
            config.camera.fov_deg = fov;
        }
        if let Some(hdr) = self.hdr {
            config.environment_hdr = Some(hdr);
        }
        if let Some(video) = self.plane_video {
            config.plane_video = Some(video);
        }
        if self.no_autoplay {
            config.autoplay = false;
        }
        config.validate().context("invalid viewer configuration")?;
        Ok((config, self.save_config))
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let (config, save_path) = Args::parse().into_config()?;
    if let Some(path) = save_path {
        config::save_config(&config, &path)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        log::info!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    app::run(config)
}
