use winit::event::WindowEvent;
use winit::window::Window;

/// Tessellated debug panel, ready for the renderer's overlay pass.
pub struct EguiFrameOutput {
    pub clipped_primitives: Vec<egui::ClippedPrimitive>,
    pub textures_delta: egui::TexturesDelta,
    pub pixels_per_point: f32,
}

/// Owns the egui context and its winit glue; painting is done by the renderer.
pub struct EguiHost {
    ctx: egui::Context,
    state: egui_winit::State,
}

impl EguiHost {
    pub fn new(window: &Window) -> Self {
        let ctx = egui::Context::default();
        ctx.style_mut(|style| style.visuals.window_shadow = egui::epaint::Shadow::NONE);
        let state = egui_winit::State::new(
            ctx.clone(),
            egui::ViewportId::ROOT,
            window,
            Some(window.scale_factor() as f32),
            None,
            None,
        );
        Self { ctx, state }
    }

    /// True when egui consumed the event.
    pub fn on_window_event(&mut self, window: &Window, event: &WindowEvent) -> bool {
        self.state.on_window_event(window, event).consumed
    }

    /// The panel is under the cursor or mid-interaction; scene input should wait.
    pub fn wants_pointer_input(&self) -> bool {
        self.ctx.is_pointer_over_area() || self.ctx.wants_pointer_input()
    }

    pub fn wants_keyboard_input(&self) -> bool {
        self.ctx.wants_keyboard_input()
    }

    pub fn run_ui(&mut self, window: &Window, build: impl FnMut(&egui::Context)) -> EguiFrameOutput {
        let input = self.state.take_egui_input(window);
        let output = self.ctx.run(input, build);
        self.state
            .handle_platform_output(window, output.platform_output);
        EguiFrameOutput {
            clipped_primitives: self.ctx.tessellate(output.shapes, output.pixels_per_point),
            textures_delta: output.textures_delta,
            pixels_per_point: output.pixels_per_point,
        }
    }
}
