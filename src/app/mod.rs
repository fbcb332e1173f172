pub mod egui_host;
mod input;
mod timing;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{Mat4, Vec2, Vec3};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowAttributes, WindowId};

use crate::animation::AnimationMixer;
use crate::assets::{AssetLoader, LoadEvent, LoadedScene};
use crate::camera::orbit::OrbitControls;
use crate::camera::{derive_camera, Camera, CameraError, CameraStrategy};
use crate::config::ViewerConfig;
use crate::interaction::pick::Ray;
use crate::interaction::{GroupRotator, Interaction, InteractionMode};
use crate::render::environment::EnvironmentProbe;
use crate::render::lights::{shadow_view_projection, LightRig, LightsUniform};
use crate::render::{FrameParams, RenderContext};
use crate::scene::bounds::{scene_bounds, Aabb};
use crate::scene::postprocess::process_scene;
use crate::scene::SceneGraph;
use crate::ui::{DebugPanel, FrameStats, LoadStatus, PanelModel, Playback, UiAction};
use crate::video::VideoRegistry;
use egui_host::EguiHost;
use input::{InputAction, PointerState};
use timing::FrameTiming;

/// Pixel wheel deltas are scaled to roughly match one line step.
const PIXELS_PER_LINE: f32 = 50.0;

/// Everything that belongs to the currently loaded scene file.
struct SceneState {
    graph: SceneGraph,
    source_path: PathBuf,
    videos: VideoRegistry,
    mixer: AnimationMixer,
    interaction: Interaction,
    rotator: GroupRotator,
    bounds: Aabb,
}

impl SceneState {
    /// Recomputes the world bounds after objects moved. True when they changed.
    fn refresh_bounds(&mut self) -> bool {
        let bounds = scene_bounds(&self.graph);
        let changed = bounds != self.bounds;
        self.bounds = bounds;
        changed
    }
}

pub struct App {
    config: ViewerConfig,
    window: Option<Arc<Window>>,
    render: Option<RenderContext>,
    egui: Option<EguiHost>,
    loader: Option<AssetLoader>,
    status: LoadStatus,
    scene: Option<SceneState>,
    camera: Camera,
    orbit: OrbitControls,
    lights: LightRig,
    shadow_matrix: Mat4,
    environment: Option<EnvironmentProbe>,
    panel: DebugPanel,
    pointer: PointerState,
    timing: FrameTiming,
    target_frame_duration: Duration,
    next_frame_time: Instant,
    error: Option<anyhow::Error>,
}

impl App {
    fn new(config: ViewerConfig) -> Self {
        let lights = config.lights.clone();
        let environment = config.environment_hdr.as_deref().and_then(|path| {
            match EnvironmentProbe::load(path) {
                Ok(mut probe) => {
                    probe.intensity = config.environment_intensity;
                    Some(probe)
                }
                Err(err) => {
                    log::warn!("{err}; continuing without environment lighting");
                    None
                }
            }
        });
        let mut camera = Camera::default();
        camera.fov_deg = config.camera.fov_deg;
        let orbit = OrbitControls::looking_at(&camera, Vec3::ZERO);
        let timing = FrameTiming::new(config.window.title.clone());
        Self {
            config,
            window: None,
            render: None,
            egui: None,
            loader: None,
            status: LoadStatus::Idle,
            scene: None,
            camera,
            orbit,
            lights,
            shadow_matrix: Mat4::IDENTITY,
            environment,
            panel: DebugPanel::new(),
            pointer: PointerState::default(),
            timing,
            target_frame_duration: Duration::from_millis(16),
            next_frame_time: Instant::now(),
            error: None,
        }
    }

    fn init_window(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let window_attrs = WindowAttributes::default()
            .with_title(self.config.window.title.clone())
            .with_inner_size(PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(true);
        let window = Arc::new(event_loop.create_window(window_attrs)?);
        let render = RenderContext::new(
            window.clone(),
            self.config.lights.directional.shadow.map_size,
        )?;
        let size = render.size();
        self.camera.set_aspect(size.width, size.height);
        self.egui = Some(EguiHost::new(&window));
        self.render = Some(render);
        self.update_target_frame_duration(&window);
        self.window = Some(window);
        self.update_shadow();
        Ok(())
    }

    fn load(&mut self, path: PathBuf) {
        self.status = LoadStatus::Loading {
            bytes_loaded: 0,
            bytes_total: 0,
        };
        self.loader = Some(AssetLoader::spawn(path, self.config.markers.clone()));
    }

    fn poll_loader(&mut self) {
        let events = match &self.loader {
            Some(loader) => loader.poll(),
            None => return,
        };
        for event in events {
            match event {
                LoadEvent::Progress {
                    bytes_loaded,
                    bytes_total,
                } => {
                    self.status = LoadStatus::Loading {
                        bytes_loaded,
                        bytes_total,
                    };
                }
                LoadEvent::Loaded(scene) => {
                    self.loader = None;
                    self.install_scene(*scene);
                }
                LoadEvent::Failed { path, reason } => {
                    log::error!("Failed to load {}: {}", path.display(), reason);
                    self.loader = None;
                    self.status = LoadStatus::Failed(reason);
                }
            }
        }
    }

    fn install_scene(&mut self, loaded: LoadedScene) {
        let base_dir = loaded.base_dir();
        let LoadedScene {
            mut graph,
            model_root,
            clips,
            cameras,
            source_path,
        } = loaded;

        let mut videos = VideoRegistry::new(base_dir);
        let report = process_scene(&mut graph, &mut videos, &self.config.postprocess_options());
        log::info!(
            "Processed scene: {} video binding(s), {} textured mesh(es), {} UV set(s) converted",
            report.videos.len(),
            report.textured.len(),
            report.geometries_flipped
        );
        if self.config.autoplay && !videos.is_empty() {
            let playing = videos.autoplay_all();
            log::info!("Autoplaying {}/{} video(s)", playing, videos.len());
        }

        let bounds = scene_bounds(&graph);
        let derived = match derive_camera(&self.config.camera, &cameras, &bounds, report.camera_target)
        {
            Ok(derived) => Some(derived),
            Err(CameraError::NoEmbeddedCamera) => {
                log::warn!("No camera found in the scene, framing its bounds instead");
                let mut fallback = self.config.camera.clone();
                fallback.strategy = CameraStrategy::BoundingBox;
                derive_camera(&fallback, &cameras, &bounds, report.camera_target)
                    .map_err(|err| log::warn!("{err}; keeping the default camera"))
                    .ok()
            }
            Err(err) => {
                log::warn!("{err}; keeping the default camera");
                None
            }
        };
        let (mut camera, orbit_target) = match derived {
            Some(derived) => (derived.camera, derived.orbit_target),
            None => {
                let mut camera = Camera::default();
                camera.fov_deg = self.config.camera.fov_deg;
                (camera, Vec3::ZERO)
            }
        };
        if let Some(render) = &self.render {
            let size = render.size();
            camera.set_aspect(size.width, size.height);
        }
        self.orbit = OrbitControls::looking_at(&camera, orbit_target);
        self.camera = camera;

        let selectable = Interaction::selectable_children(&graph, model_root);
        let rotate_node = self
            .config
            .rotate_group
            .as_deref()
            .and_then(|name| {
                let found = graph.find_by_name(name);
                if found.is_none() {
                    log::warn!("Rotate group '{name}' not found, rotating the whole model");
                }
                found
            })
            .unwrap_or(model_root);

        self.status = LoadStatus::Loaded {
            nodes: graph.len(),
            selectable: selectable.len(),
            clips: clips.len(),
        };
        if let Some(render) = &mut self.render {
            render.clear_scene();
        }
        let file_name = source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.timing
            .set_base_title(format!("{} - {}", self.config.window.title, file_name));
        let rotator = GroupRotator::new(&graph, rotate_node);
        self.scene = Some(SceneState {
            graph,
            source_path,
            videos,
            mixer: AnimationMixer::new(clips),
            interaction: Interaction::new(selectable),
            rotator,
            bounds,
        });
        self.update_shadow();
    }

    fn update_shadow(&mut self) {
        let bounds = self
            .scene
            .as_ref()
            .map(|scene| scene.bounds)
            .unwrap_or(Aabb::EMPTY);
        self.shadow_matrix = shadow_view_projection(&self.lights.directional, &bounds);
    }

    fn update_target_frame_duration(&mut self, window: &Window) {
        let mut target = Duration::from_millis(16);
        if let Some(monitor) = window.current_monitor() {
            if let Some(millihz) = monitor.refresh_rate_millihertz() {
                let hz = millihz as f32 / 1000.0;
                if hz > 1.0 {
                    target = Duration::from_secs_f32(1.0 / hz);
                }
            }
        }
        self.target_frame_duration = target;
        self.next_frame_time = Instant::now() + self.target_frame_duration;
    }

    fn cursor_ray(&self) -> Option<Ray> {
        let (x, y) = self.pointer.position?;
        let size = self.render.as_ref()?.size();
        Ray::from_screen(
            Vec2::new(x, y),
            Vec2::new(size.width as f32, size.height as f32),
            self.camera.view_projection(),
        )
    }

    fn on_pointer_pressed(&mut self) {
        self.pointer.left_down = true;
        let ray = self.cursor_ray();
        let Some(scene) = &mut self.scene else {
            return;
        };
        if let Some(ray) = ray {
            let mode = scene
                .interaction
                .pointer_down(&scene.graph, &ray, self.camera.forward());
            if let InteractionMode::Dragging(session) = mode {
                let name = scene
                    .graph
                    .node(session.node)
                    .map(|node| node.name.as_str())
                    .unwrap_or("?");
                log::debug!("Dragging '{name}'");
            }
        }
        self.orbit.enabled = scene.interaction.orbit_enabled();
    }

    fn on_pointer_released(&mut self) {
        self.pointer.left_down = false;
        let moved = self.scene.as_mut().is_some_and(|scene| {
            let was_dragging = matches!(scene.interaction.mode(), InteractionMode::Dragging(_));
            scene.interaction.pointer_up();
            was_dragging && scene.refresh_bounds()
        });
        if moved {
            self.update_shadow();
        }
        self.orbit.enabled = true;
    }

    fn on_pointer_moved(&mut self, x: f32, y: f32) {
        let (dx, dy) = self.pointer.move_to(x, y);
        if !self.pointer.left_down {
            return;
        }
        let dragging = self
            .scene
            .as_ref()
            .is_some_and(|scene| matches!(scene.interaction.mode(), InteractionMode::Dragging(_)));
        if dragging {
            let ray = self.cursor_ray();
            let moved = match (&mut self.scene, ray) {
                (Some(scene), Some(ray)) => {
                    scene.interaction.pointer_move(&mut scene.graph, &ray).is_some()
                        && scene.refresh_bounds()
                }
                _ => false,
            };
            if moved {
                self.update_shadow();
            }
        } else if self.orbit.on_drag(dx, dy) {
            self.orbit.apply(&mut self.camera);
        }
    }

    fn on_scroll(&mut self, delta: MouseScrollDelta) {
        let lines = match delta {
            MouseScrollDelta::LineDelta(_, y) => y,
            MouseScrollDelta::PixelDelta(position) => position.y as f32 / PIXELS_PER_LINE,
        };
        if self.orbit.on_scroll(lines) {
            self.orbit.apply(&mut self.camera);
        }
    }

    fn rotate_group(&mut self) {
        let Some(scene) = &mut self.scene else {
            return;
        };
        let angle = scene.rotator.rotate(&mut scene.graph);
        log::info!("Group rotated to {:.0}°", angle.to_degrees());
        if scene.refresh_bounds() {
            self.update_shadow();
        }
    }

    fn handle_action(&mut self, action: InputAction, event_loop: &ActiveEventLoop) {
        match action {
            InputAction::RotateGroup => self.rotate_group(),
            InputAction::ToggleVideo => {
                if let Some(scene) = &mut self.scene {
                    scene.videos.toggle_active();
                }
            }
            InputAction::Quit => event_loop.exit(),
            InputAction::None => {}
        }
    }

    fn handle_ui_action(&mut self, action: UiAction) {
        if let Some((command, target)) = action.playback() {
            self.with_videos(|videos| match command {
                Playback::Start => videos.start(target),
                Playback::Stop => videos.stop(target),
            });
            return;
        }
        match action {
            UiAction::OpenScene => {
                let picked = rfd::FileDialog::new()
                    .set_title("Open scene")
                    .add_filter("glTF", &["glb", "gltf"])
                    .pick_file();
                if let Some(path) = picked {
                    self.load(path);
                }
            }
            UiAction::RotateGroup => self.rotate_group(),
            _ => {}
        }
    }

    fn with_videos(&mut self, apply: impl FnOnce(&mut VideoRegistry) -> usize) {
        if let Some(scene) = &mut self.scene {
            let affected = apply(&mut scene.videos);
            log::debug!("Video command affected {affected} handle(s)");
        }
    }

    fn frame(&mut self) {
        let Some(window) = self.window.clone() else {
            return;
        };
        let now = Instant::now();
        self.timing.update(Some(window.as_ref()), now);
        let dt = self.timing.frame_dt;

        self.poll_loader();
        if let Some(scene) = &mut self.scene {
            scene.mixer.update(dt, &mut scene.graph);
            let frames = scene.videos.update(dt as f64);
            if let Some(render) = &mut self.render {
                for (video, frame) in &frames {
                    render.upload_video_frame(*video, frame);
                }
            }
        }

        let before = (self.lights.clone(), self.camera.fov_deg);
        let mut actions = Vec::new();
        let ui_output = self.egui.as_mut().map(|egui| {
            let stats = FrameStats {
                fps: self.timing.fps(),
                frame_ms: self.timing.frame_ms(),
                render_ms: self.timing.render_ms(),
            };
            egui.run_ui(&window, |ctx| {
                let mut model = PanelModel {
                    stats,
                    scene_path: self
                        .loader
                        .as_ref()
                        .map(AssetLoader::path)
                        .or_else(|| self.scene.as_ref().map(|scene| scene.source_path.as_path())),
                    status: &self.status,
                    videos: self.scene.as_ref().map(|scene| &scene.videos),
                    lights: &mut self.lights,
                    environment: self.environment.as_mut(),
                    fov_deg: &mut self.camera.fov_deg,
                    group_angle_deg: self
                        .scene
                        .as_ref()
                        .map(|scene| scene.rotator.angle().to_degrees())
                        .unwrap_or(0.0),
                };
                actions = self.panel.show(ctx, &mut model);
            })
        });
        for action in actions {
            self.handle_ui_action(action);
        }
        if before != (self.lights.clone(), self.camera.fov_deg) {
            log::debug!("Light or camera parameters changed, recomputing the shadow frustum");
            self.update_shadow();
        }

        let lights = LightsUniform::new(
            &self.lights,
            self.shadow_matrix,
            self.environment.as_ref().map(EnvironmentProbe::irradiance),
        );
        let render_start = Instant::now();
        if let Some(render) = &mut self.render {
            let params = FrameParams {
                graph: self.scene.as_ref().map(|scene| &scene.graph),
                camera: &self.camera,
                lights: &lights,
                helper: self
                    .scene
                    .as_ref()
                    .and_then(|scene| scene.interaction.helper_bounds()),
                background: self.config.background_color,
                ui: ui_output.as_ref(),
            };
            if let Err(err) = render.render(&params) {
                log::error!("Render failed: {err}");
            }
        }
        self.timing
            .set_render_ms(render_start.elapsed().as_secs_f32() * 1000.0);
    }

    fn pointer_captured_by_ui(&self) -> bool {
        self.egui
            .as_ref()
            .is_some_and(|egui| egui.wants_pointer_input())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(err) = self.init_window(event_loop) {
            log::error!("Failed to initialise the viewer: {err:#}");
            self.error = Some(err);
            event_loop.exit();
            return;
        }
        let scene = self.config.scene.clone();
        self.load(scene);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        let consumed = match (&mut self.egui, &self.window) {
            (Some(egui), Some(window)) => egui.on_window_event(window, &event),
            _ => false,
        };

        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(new_size) => {
                if let Some(render) = &mut self.render {
                    render.resize(new_size);
                }
                self.camera.set_aspect(new_size.width, new_size.height);
                if let Some(window) = self.window.clone() {
                    self.update_target_frame_duration(&window);
                }
            }
            WindowEvent::Moved(_) => {
                if let Some(window) = self.window.clone() {
                    self.update_target_frame_duration(&window);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                let keyboard_taken = self
                    .egui
                    .as_ref()
                    .is_some_and(|egui| egui.wants_keyboard_input());
                if consumed && keyboard_taken {
                    return;
                }
                let action = input::action_for_key(
                    event.physical_key,
                    event.state == ElementState::Pressed,
                    event.repeat,
                );
                self.handle_action(action, event_loop);
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.on_pointer_moved(position.x as f32, position.y as f32);
            }
            WindowEvent::CursorLeft { .. } => {
                self.pointer.position = None;
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => match state {
                ElementState::Pressed if !consumed && !self.pointer_captured_by_ui() => {
                    self.on_pointer_pressed();
                }
                ElementState::Pressed => {}
                ElementState::Released => self.on_pointer_released(),
            },
            WindowEvent::MouseWheel { delta, .. } => {
                if !consumed && !self.pointer_captured_by_ui() {
                    self.on_scroll(delta);
                }
            }
            WindowEvent::RedrawRequested => self.frame(),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let now = Instant::now();
        if now >= self.next_frame_time {
            if let Some(window) = &self.window {
                window.request_redraw();
            }
            self.next_frame_time = now + self.target_frame_duration;
        }
        event_loop.set_control_flow(ControlFlow::WaitUntil(self.next_frame_time));
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Joins the decode threads before the GPU context goes away.
        self.scene = None;
        log::info!("Goodbye");
    }
}

pub fn run(config: ViewerConfig) -> anyhow::Result<()> {
    log::info!("loopview: {}", display_scene(&config.scene));
    log::info!("   Drag to orbit or move objects, R rotates, Space toggles video, Esc quits");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Wait);
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    match app.error.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn display_scene(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Geometry, Node};

    fn scene_with_block() -> (SceneState, crate::scene::NodeId) {
        let mut graph = SceneGraph::new();
        let root = graph.add_node(Node::new("Scene"), None);
        let geometry = graph.add_geometry(Geometry::quad(2.0, 2.0));
        let mut block = Node::new("Block");
        block.geometry = Some(geometry);
        block.transform.translation = Vec3::new(3.0, 0.0, 0.0);
        let block = graph.add_node(block, Some(root));
        let bounds = scene_bounds(&graph);
        let rotator = GroupRotator::new(&graph, root);
        let scene = SceneState {
            graph,
            source_path: PathBuf::from("block.glb"),
            videos: VideoRegistry::new(std::env::temp_dir()),
            mixer: AnimationMixer::new(Vec::new()),
            interaction: Interaction::new(vec![block]),
            rotator,
            bounds,
        };
        (scene, block)
    }

    #[test]
    fn moved_objects_update_bounds_and_shadow_frustum() {
        let (mut scene, block) = scene_with_block();
        let light = LightRig::default().directional;
        let before = shadow_view_projection(&light, &scene.bounds);
        assert!(!scene.refresh_bounds());

        scene.graph.node_mut(block).unwrap().transform.translation = Vec3::new(-20.0, 0.0, 0.0);
        assert!(scene.refresh_bounds());
        assert!(scene.bounds.min.x < -20.0);
        let after = shadow_view_projection(&light, &scene.bounds);
        assert_ne!(before, after);
    }

    #[test]
    fn group_rotation_moves_the_bounds() {
        let (mut scene, _) = scene_with_block();
        let before = scene.bounds;
        scene.rotator.rotate(&mut scene.graph);
        assert!(scene.refresh_bounds());
        assert!((scene.bounds.center() - before.center()).length() > 1.0);
    }
}
