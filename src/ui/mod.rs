use std::path::Path;

use crate::render::environment::EnvironmentProbe;
use crate::render::lights::LightRig;
use crate::video::{VideoId, VideoRegistry, VideoTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiAction {
    /// Start or Stop: the most recently bound video.
    StartActive,
    StopActive,
    StartVideo(VideoId),
    StopVideo(VideoId),
    StartAll,
    StopAll,
    OpenScene,
    RotateGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playback {
    Start,
    Stop,
}

impl UiAction {
    /// The playback command this action stands for, if any.
    pub fn playback(self) -> Option<(Playback, VideoTarget)> {
        match self {
            UiAction::StartActive => Some((Playback::Start, VideoTarget::Active)),
            UiAction::StopActive => Some((Playback::Stop, VideoTarget::Active)),
            UiAction::StartVideo(id) => Some((Playback::Start, VideoTarget::Video(id))),
            UiAction::StopVideo(id) => Some((Playback::Stop, VideoTarget::Video(id))),
            UiAction::StartAll => Some((Playback::Start, VideoTarget::All)),
            UiAction::StopAll => Some((Playback::Stop, VideoTarget::All)),
            UiAction::OpenScene | UiAction::RotateGroup => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub fps: f32,
    pub frame_ms: f32,
    pub render_ms: f32,
}

/// Loader status shown at the top of the panel.
#[derive(Debug, Clone, Default)]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading {
        bytes_loaded: u64,
        bytes_total: u64,
    },
    Loaded {
        nodes: usize,
        selectable: usize,
        clips: usize,
    },
    Failed(String),
}

/// Everything the panel reads, plus the values it edits in place.
pub struct PanelModel<'a> {
    pub stats: FrameStats,
    pub scene_path: Option<&'a Path>,
    pub status: &'a LoadStatus,
    pub videos: Option<&'a VideoRegistry>,
    pub lights: &'a mut LightRig,
    pub environment: Option<&'a mut EnvironmentProbe>,
    pub fov_deg: &'a mut f32,
    pub group_angle_deg: f32,
}

pub struct DebugPanel {
    open: bool,
}

impl Default for DebugPanel {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugPanel {
    pub fn new() -> Self {
        Self { open: true }
    }

    pub fn show(&mut self, ctx: &egui::Context, model: &mut PanelModel<'_>) -> Vec<UiAction> {
        let mut actions = Vec::new();
        egui::Window::new("Debug")
            .open(&mut self.open)
            .default_width(300.0)
            .resizable(true)
            .show(ctx, |ui| {
                stats_section(ui, model, &mut actions);
                ui.separator();
                video_section(ui, model.videos, &mut actions);
                ui.separator();
                light_section(ui, model.lights);
                if let Some(environment) = model.environment.as_deref_mut() {
                    environment_section(ui, environment);
                }
                ui.separator();
                shadow_section(ui, model);
            });
        actions
    }
}

fn stats_section(ui: &mut egui::Ui, model: &PanelModel<'_>, actions: &mut Vec<UiAction>) {
    ui.label(format!(
        "{:.1} fps | frame {:.2} ms | render {:.2} ms",
        model.stats.fps, model.stats.frame_ms, model.stats.render_ms
    ));
    let scene = model
        .scene_path
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "(none)".to_string());
    ui.label(format!("Scene: {scene}"));
    match model.status {
        LoadStatus::Idle => {}
        LoadStatus::Loading {
            bytes_loaded,
            bytes_total,
        } => {
            let fraction = if *bytes_total > 0 {
                *bytes_loaded as f32 / *bytes_total as f32
            } else {
                0.0
            };
            ui.add(egui::ProgressBar::new(fraction).show_percentage());
        }
        LoadStatus::Loaded {
            nodes,
            selectable,
            clips,
        } => {
            ui.label(format!(
                "{nodes} nodes, {selectable} draggable, {clips} clip(s)"
            ));
        }
        LoadStatus::Failed(reason) => {
            ui.colored_label(egui::Color32::LIGHT_RED, format!("Load failed: {reason}"));
        }
    }
    ui.horizontal(|ui| {
        if ui.button("Open…").clicked() {
            actions.push(UiAction::OpenScene);
        }
        if ui
            .button(format!("Rotate ({:.0}°)", model.group_angle_deg))
            .clicked()
        {
            actions.push(UiAction::RotateGroup);
        }
    });
}

fn video_section(ui: &mut egui::Ui, videos: Option<&VideoRegistry>, actions: &mut Vec<UiAction>) {
    ui.heading("Videos");
    let Some(videos) = videos.filter(|videos| !videos.is_empty()) else {
        ui.label("No video textures in this scene");
        return;
    };
    ui.horizontal(|ui| {
        if ui.button("Start").clicked() {
            actions.push(UiAction::StartActive);
        }
        if ui.button("Stop").clicked() {
            actions.push(UiAction::StopActive);
        }
        if ui.small_button("Start all").clicked() {
            actions.push(UiAction::StartAll);
        }
        if ui.small_button("Stop all").clicked() {
            actions.push(UiAction::StopAll);
        }
    });
    for handle in videos.handles() {
        ui.horizontal(|ui| {
            let state = handle.state();
            let marker = match (handle.has_decoder(), handle.is_playing()) {
                (false, _) => "○",
                (true, true) => "▶",
                (true, false) => "⏸",
            };
            let frame = handle
                .frame_index()
                .map(|index| format!(" #{index}"))
                .unwrap_or_default();
            ui.label(format!(
                "{marker} {:?} {} @ {:.2}s{frame}",
                handle.role(),
                handle.source(),
                state.position
            ))
            .on_hover_text(format!(
                "{}\n{} mesh(es)",
                handle.path().display(),
                handle.nodes().len()
            ));
            if ui.small_button("Start").clicked() {
                actions.push(UiAction::StartVideo(handle.id()));
            }
            if ui.small_button("Stop").clicked() {
                actions.push(UiAction::StopVideo(handle.id()));
            }
        });
        if let Some(error) = handle.last_error() {
            ui.colored_label(egui::Color32::LIGHT_RED, error);
        }
    }
}

fn light_section(ui: &mut egui::Ui, lights: &mut LightRig) {
    ui.heading("Lights");
    ui.horizontal(|ui| {
        ui.label("Ambient");
        ui.color_edit_button_rgb(&mut lights.ambient.color);
        ui.add(egui::Slider::new(&mut lights.ambient.intensity, 0.0..=5.0));
    });
    for (index, light) in lights.points.iter_mut().enumerate() {
        ui.horizontal(|ui| {
            ui.label(format!("Point {}", index + 1));
            ui.color_edit_button_rgb(&mut light.color);
            ui.add(egui::Slider::new(&mut light.intensity, 0.0..=10.0).text("intensity"));
        });
        ui.add(egui::Slider::new(&mut light.range, 1.0..=500.0).text("range"));
    }
    ui.horizontal(|ui| {
        ui.label("Directional");
        ui.color_edit_button_rgb(&mut lights.directional.color);
        ui.add(egui::Slider::new(&mut lights.directional.intensity, 0.0..=10.0));
    });
}

fn environment_section(ui: &mut egui::Ui, environment: &mut EnvironmentProbe) {
    let (width, height) = environment.size();
    ui.horizontal(|ui| {
        ui.label("Environment")
            .on_hover_text(format!("{} ({width}x{height})", environment.path().display()));
        ui.add(egui::Slider::new(&mut environment.intensity, 0.0..=4.0));
    });
}

fn shadow_section(ui: &mut egui::Ui, model: &mut PanelModel<'_>) {
    ui.heading("Shadow & camera");
    ui.checkbox(&mut model.lights.directional.cast_shadow, "Directional shadows");
    let shadow = &mut model.lights.directional.shadow;
    ui.add(
        egui::DragValue::new(&mut shadow.near)
            .speed(0.05)
            .range(0.01..=1000.0)
            .prefix("near "),
    );
    ui.add(
        egui::DragValue::new(&mut shadow.far)
            .speed(0.5)
            .range(0.02..=5000.0)
            .prefix("far "),
    );
    if shadow.far <= shadow.near {
        shadow.far = shadow.near + 0.01;
    }
    ui.add(egui::Slider::new(model.fov_deg, 10.0..=120.0).text("fov"));
}
