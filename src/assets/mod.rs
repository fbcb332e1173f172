//! Background scene loading.
//!
//! [`AssetLoader::spawn`] reads and converts the scene on its own thread and
//! reports through a channel the frame loop polls every frame.

pub mod draco;
pub mod gltf_import;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use crate::animation::AnimationClip;
use crate::camera::EmbeddedCamera;
use crate::scene::{NodeId, RoleMarkers, SceneGraph};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("failed to read scene at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse glTF: {0}")]
    Parse(String),
    #[error("failed to load glTF buffers or images: {0}")]
    Resources(String),
    #[error("failed to decode compressed mesh: {0}")]
    Draco(#[from] draco::DracoError),
    #[error("glTF file contains no scene")]
    NoScene,
}

pub struct LoadedScene {
    pub graph: SceneGraph,
    pub model_root: NodeId,
    pub clips: Vec<AnimationClip>,
    pub cameras: Vec<EmbeddedCamera>,
    pub source_path: PathBuf,
}

impl LoadedScene {
    /// Directory that relative video references resolve against.
    pub fn base_dir(&self) -> PathBuf {
        self.source_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

pub enum LoadEvent {
    Progress { bytes_loaded: u64, bytes_total: u64 },
    Loaded(Box<LoadedScene>),
    Failed { path: PathBuf, reason: String },
}

pub struct AssetLoader {
    path: PathBuf,
    receiver: Receiver<LoadEvent>,
}

impl AssetLoader {
    pub fn spawn(path: impl Into<PathBuf>, markers: RoleMarkers) -> Self {
        let path = path.into();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let thread_path = path.clone();
        let thread_sender = sender.clone();
        let spawned = thread::Builder::new()
            .name("scene-loader".to_string())
            .spawn(move || run_load(&thread_path, &markers, &thread_sender));
        if let Err(err) = spawned {
            let _ = sender.send(LoadEvent::Failed {
                path: path.clone(),
                reason: format!("failed to start loader thread: {err}"),
            });
        }
        log::info!("Loading scene {}", path.display());
        Self { path, receiver }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events received since the last poll. Never blocks.
    pub fn poll(&self) -> Vec<LoadEvent> {
        self.receiver.try_iter().collect()
    }
}

fn run_load(path: &Path, markers: &RoleMarkers, sender: &Sender<LoadEvent>) {
    let result = load_scene(path, markers, |bytes_loaded, bytes_total| {
        let _ = sender.send(LoadEvent::Progress {
            bytes_loaded,
            bytes_total,
        });
    });
    let event = match result {
        Ok(scene) => LoadEvent::Loaded(Box::new(scene)),
        Err(err) => LoadEvent::Failed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        },
    };
    // The viewer may have moved on to another file; nobody listening is fine.
    let _ = sender.send(event);
}

/// Reads and converts a `.glb`/`.gltf` file, reporting read progress in bytes.
pub fn load_scene(
    path: &Path,
    markers: &RoleMarkers,
    mut progress: impl FnMut(u64, u64),
) -> Result<LoadedScene, AssetError> {
    let read_error = |source| AssetError::Read {
        path: path.display().to_string(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(read_error)?;
    let total = file.metadata().map(|meta| meta.len()).unwrap_or(0);
    let mut bytes = Vec::with_capacity(total as usize);
    let mut chunk = vec![0_u8; READ_CHUNK];
    loop {
        let read = file.read(&mut chunk).map_err(read_error)?;
        if read == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..read]);
        progress(bytes.len() as u64, total.max(bytes.len() as u64));
    }

    let imported = gltf_import::import_gltf(&bytes, path.parent(), markers)?;
    log::info!(
        "Loaded {}: {} nodes, {} clips, {} cameras",
        path.display(),
        imported.graph.len(),
        imported.clips.len(),
        imported.cameras.len()
    );
    Ok(LoadedScene {
        graph: imported.graph,
        model_root: imported.model_root,
        clips: imported.clips,
        cameras: imported.cameras,
        source_path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::NodeRole;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "loopview_{label}_{}_{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// One textured triangle tagged as a background video plus a camera node.
    fn write_scene(dir: &Path) -> PathBuf {
        let mut buffer = Vec::new();
        for value in [0.0_f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0] {
            buffer.extend_from_slice(&value.to_le_bytes());
        }
        for value in [0.0_f32, 0.0, 1.0, 0.0, 0.0, 1.0] {
            buffer.extend_from_slice(&value.to_le_bytes());
        }
        for index in [0_u16, 1, 2] {
            buffer.extend_from_slice(&index.to_le_bytes());
        }
        std::fs::write(dir.join("scene.bin"), &buffer).unwrap();

        let json = serde_json::json!({
            "asset": { "version": "2.0" },
            "scene": 0,
            "scenes": [{ "nodes": [0, 1] }],
            "nodes": [
                { "name": "BackgroundVideo", "mesh": 0, "translation": [0.0, 0.0, -5.0] },
                {
                    "name": "Camera",
                    "camera": 0,
                    "translation": [0.0, 1.0, 10.0],
                    "extras": { "random_delta_transform": [1.0, 0.0, 0.0] }
                }
            ],
            "cameras": [{
                "type": "perspective",
                "perspective": { "yfov": 0.8, "znear": 0.1, "zfar": 100.0 }
            }],
            "meshes": [{
                "name": "Tri",
                "primitives": [{
                    "attributes": { "POSITION": 0, "TEXCOORD_0": 1 },
                    "indices": 2,
                    "material": 0
                }]
            }],
            "materials": [{
                "name": "Screen",
                "pbrMetallicRoughness": { "baseColorFactor": [1.0, 1.0, 1.0, 1.0] },
                "extras": { "video_texture_paths": "loop.mp4" }
            }],
            "buffers": [{ "uri": "scene.bin", "byteLength": buffer.len() }],
            "bufferViews": [
                { "buffer": 0, "byteOffset": 0, "byteLength": 36, "target": 34962 },
                { "buffer": 0, "byteOffset": 36, "byteLength": 24, "target": 34962 },
                { "buffer": 0, "byteOffset": 60, "byteLength": 6, "target": 34963 }
            ],
            "accessors": [
                {
                    "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
                    "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0]
                },
                { "bufferView": 1, "componentType": 5126, "count": 3, "type": "VEC2" },
                { "bufferView": 2, "componentType": 5123, "count": 3, "type": "SCALAR" }
            ]
        });
        let path = dir.join("scene.gltf");
        std::fs::write(&path, serde_json::to_vec_pretty(&json).unwrap()).unwrap();
        path
    }

    #[test]
    fn load_scene_converts_nodes_materials_and_cameras() {
        let dir = temp_dir("load");
        let path = write_scene(&dir);
        let mut last_progress = (0, 0);
        let scene = load_scene(&path, &RoleMarkers::default(), |loaded, total| {
            last_progress = (loaded, total)
        })
        .unwrap();

        assert_eq!(last_progress.0, last_progress.1);
        assert_eq!(scene.base_dir(), dir);
        let graph = &scene.graph;
        let background = graph.find_by_name("BackgroundVideo").unwrap();
        let node = graph.node(background).unwrap();
        assert_eq!(node.role, NodeRole::Background);
        assert_eq!(node.parent, Some(scene.model_root));
        let material = graph.material(node.material.unwrap()).unwrap();
        assert_eq!(material.video_reference(), Some("loop.mp4"));
        let geometry = graph.geometry(node.geometry.unwrap()).unwrap();
        assert_eq!(geometry.indices, vec![0, 1, 2]);
        assert_eq!(geometry.uvs.as_ref().map(Vec::len), Some(3));
        assert_eq!(geometry.normals.len(), 3);

        assert_eq!(scene.cameras.len(), 1);
        let camera = &scene.cameras[0];
        assert!((camera.fov_deg - 0.8_f32.to_degrees()).abs() < 1e-4);
        assert_eq!(camera.far, Some(100.0));
        assert_eq!(camera.position, glam::Vec3::new(0.0, 1.0, 10.0));
        assert_eq!(camera.delta, Some(glam::Vec3::new(1.0, 0.0, 0.0)));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn loader_thread_reports_loaded_scene() {
        let dir = temp_dir("spawn");
        let path = write_scene(&dir);
        let loader = AssetLoader::spawn(&path, RoleMarkers::default());

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut loaded = None;
        let mut progress_events = 0;
        while loaded.is_none() && std::time::Instant::now() < deadline {
            for event in loader.poll() {
                match event {
                    LoadEvent::Progress { .. } => progress_events += 1,
                    LoadEvent::Loaded(scene) => loaded = Some(scene),
                    LoadEvent::Failed { reason, .. } => panic!("load failed: {reason}"),
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let scene = loaded.expect("scene loaded in time");
        assert!(progress_events >= 1);
        assert_eq!(scene.source_path, path);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_fails_without_panicking() {
        let path = temp_dir("missing").join("nope.glb");
        let loader = AssetLoader::spawn(&path, RoleMarkers::default());
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            assert!(std::time::Instant::now() < deadline, "no failure reported");
            if let Some(LoadEvent::Failed { path: failed, reason }) = loader
                .poll()
                .into_iter()
                .find(|event| matches!(event, LoadEvent::Failed { .. }))
            {
                assert_eq!(failed, path);
                assert!(reason.contains("nope.glb"));
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
