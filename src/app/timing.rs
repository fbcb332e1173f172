use std::time::{Duration, Instant};

use winit::window::Window;

const FPS_WINDOW: Duration = Duration::from_millis(500);

pub struct FrameTiming {
    last_frame_time: Option<Instant>,
    last_fps_time: Instant,
    frame_count: u32,
    pub frame_dt: f32,
    fps: f32,
    render_ms: f32,
    base_title: String,
}

impl FrameTiming {
    pub fn new(base_title: String) -> Self {
        Self {
            last_frame_time: None,
            last_fps_time: Instant::now(),
            frame_count: 0,
            frame_dt: 1.0 / 60.0,
            fps: 0.0,
            render_ms: 0.0,
            base_title,
        }
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn frame_ms(&self) -> f32 {
        self.frame_dt * 1000.0
    }

    pub fn render_ms(&self) -> f32 {
        self.render_ms
    }

    pub fn set_render_ms(&mut self, render_ms: f32) {
        self.render_ms = render_ms;
    }

    pub fn set_base_title(&mut self, base_title: String) {
        self.base_title = base_title;
    }

    /// Advances the clock; refreshes the fps figure and window title twice a second.
    pub fn update(&mut self, window: Option<&Window>, now: Instant) {
        let dt = self
            .last_frame_time
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(Duration::from_millis(16));
        self.last_frame_time = Some(now);
        // Long stalls (window drag, breakpoints) should not fast-forward videos.
        self.frame_dt = dt.as_secs_f32().min(0.25);

        self.frame_count = self.frame_count.saturating_add(1);
        let elapsed = now.saturating_duration_since(self.last_fps_time);
        if elapsed >= FPS_WINDOW {
            self.fps = self.frame_count as f32 / elapsed.as_secs_f32();
            if let Some(window) = window {
                window.set_title(&format!(
                    "{} - {:.1} fps ({:.2} ms, render {:.2} ms)",
                    self.base_title,
                    self.fps,
                    self.frame_ms(),
                    self.render_ms
                ));
            }
            self.frame_count = 0;
            self.last_fps_time = now;
        }
    }
}
