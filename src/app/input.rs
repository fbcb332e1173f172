use winit::keyboard::{KeyCode, PhysicalKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    RotateGroup,
    ToggleVideo,
    Quit,
    None,
}

/// Maps a key press to an action. Releases and repeats do nothing.
pub fn action_for_key(key: PhysicalKey, pressed: bool, repeat: bool) -> InputAction {
    if !pressed || repeat {
        return InputAction::None;
    }
    match key {
        PhysicalKey::Code(KeyCode::KeyR) => InputAction::RotateGroup,
        PhysicalKey::Code(KeyCode::Space) => InputAction::ToggleVideo,
        PhysicalKey::Code(KeyCode::Escape) => InputAction::Quit,
        _ => InputAction::None,
    }
}

/// Left button state and the last cursor position, in physical pixels.
#[derive(Debug, Default, Clone, Copy)]
pub struct PointerState {
    pub position: Option<(f32, f32)>,
    pub left_down: bool,
}

impl PointerState {
    /// Moves the cursor and returns the delta since the last position.
    pub fn move_to(&mut self, x: f32, y: f32) -> (f32, f32) {
        let delta = self
            .position
            .map(|(px, py)| (x - px, y - py))
            .unwrap_or((0.0, 0.0));
        self.position = Some((x, y));
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_map_to_actions_on_press_only() {
        let r = PhysicalKey::Code(KeyCode::KeyR);
        assert_eq!(action_for_key(r, true, false), InputAction::RotateGroup);
        assert_eq!(action_for_key(r, false, false), InputAction::None);
        assert_eq!(action_for_key(r, true, true), InputAction::None);
        assert_eq!(
            action_for_key(PhysicalKey::Code(KeyCode::Space), true, false),
            InputAction::ToggleVideo
        );
        assert_eq!(
            action_for_key(PhysicalKey::Code(KeyCode::Escape), true, false),
            InputAction::Quit
        );
        assert_eq!(
            action_for_key(PhysicalKey::Code(KeyCode::KeyQ), true, false),
            InputAction::None
        );
    }

    #[test]
    fn pointer_delta_starts_at_zero() {
        let mut pointer = PointerState::default();
        assert_eq!(pointer.move_to(10.0, 10.0), (0.0, 0.0));
        assert_eq!(pointer.move_to(15.0, 7.0), (5.0, -3.0));
    }
}
