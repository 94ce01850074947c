//! Free-fly camera control
//!
//! The window layer reports discrete key transitions and mouse motion into a
//! [`CameraInput`]; [`FreeFlyController::update`] turns that into camera motion.

use glam::{Vec2, Vec3};

use super::Camera;

/// Movement keys the controller understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraKey {
    Forward,
    Backward,
    Left,
    Right,
    Up,
    Down,
    Sprint,
}

/// Input state for the camera controller
#[derive(Debug, Clone, Default)]
pub struct CameraInput {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
    pub sprint: bool,

    /// Mouse delta since last frame (in pixels)
    pub mouse_delta: Vec2,

    /// Mouse scroll delta (positive = scroll up)
    pub scroll_delta: f32,

    /// Right mouse button held
    pub mouse_look_active: bool,
}

impl CameraInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a key-down (`pressed`) or key-up event.
    pub fn set_key(&mut self, key: CameraKey, pressed: bool) {
        let flag = match key {
            CameraKey::Forward => &mut self.forward,
            CameraKey::Backward => &mut self.backward,
            CameraKey::Left => &mut self.left,
            CameraKey::Right => &mut self.right,
            CameraKey::Up => &mut self.up,
            CameraKey::Down => &mut self.down,
            CameraKey::Sprint => &mut self.sprint,
        };
        *flag = pressed;
    }

    /// Reset per-frame deltas (call after update)
    pub fn reset_deltas(&mut self) {
        self.mouse_delta = Vec2::ZERO;
        self.scroll_delta = 0.0;
    }
}

/// FPS-style camera controller
///
/// - WASD: Move forward/backward/left/right
/// - QE: Move down/up
/// - Mouse: Look around while the right button is held
/// - Scroll: Adjust movement speed
/// - Shift: Sprint
#[derive(Debug, Clone)]
pub struct FreeFlyController {
    /// Horizontal rotation in radians
    pub yaw: f32,
    /// Vertical rotation in radians
    pub pitch: f32,
    /// Units per second
    pub move_speed: f32,
    pub min_speed: f32,
    pub max_speed: f32,
    /// Radians per pixel
    pub mouse_sensitivity: f32,
    pub sprint_multiplier: f32,
    pub scroll_speed_factor: f32,
}

impl Default for FreeFlyController {
    fn default() -> Self {
        Self {
            yaw: 0.0,
            pitch: 0.0,
            move_speed: 5.0,
            min_speed: 0.05,
            max_speed: 500.0,
            mouse_sensitivity: 0.003,
            sprint_multiplier: 3.0,
            scroll_speed_factor: 1.2,
        }
    }
}

impl FreeFlyController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take yaw and pitch from the camera's current orientation.
    pub fn sync_with_camera(&mut self, camera: &Camera) {
        let forward = camera.forward();
        if forward == Vec3::ZERO {
            return;
        }
        self.yaw = forward.z.atan2(forward.x);
        self.pitch = (-forward.y).clamp(-1.0, 1.0).asin();
    }

    fn forward_direction(&self) -> Vec3 {
        Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            -self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize()
    }

    fn right_direction(&self) -> Vec3 {
        Vec3::new(-self.yaw.sin(), 0.0, self.yaw.cos()).normalize()
    }

    pub fn update(&mut self, camera: &mut Camera, input: &CameraInput, dt: f32) {
        if input.scroll_delta > 0.0 {
            self.move_speed *= self.scroll_speed_factor;
        } else if input.scroll_delta < 0.0 {
            self.move_speed /= self.scroll_speed_factor;
        }
        self.move_speed = self.move_speed.clamp(self.min_speed, self.max_speed);

        if input.mouse_look_active && input.mouse_delta != Vec2::ZERO {
            self.yaw += input.mouse_delta.x * self.mouse_sensitivity;
            self.pitch += input.mouse_delta.y * self.mouse_sensitivity;

            let max_pitch = std::f32::consts::FRAC_PI_2 - 0.01;
            self.pitch = self.pitch.clamp(-max_pitch, max_pitch);
            self.yaw %= std::f32::consts::TAU;
        }

        let forward = self.forward_direction();
        let right = self.right_direction();

        let mut velocity = Vec3::ZERO;
        for (held, direction) in [
            (input.forward, forward),
            (input.backward, -forward),
            (input.right, right),
            (input.left, -right),
            (input.up, Vec3::Y),
            (input.down, Vec3::NEG_Y),
        ] {
            if held {
                velocity += direction;
            }
        }
        let velocity = velocity.normalize_or_zero();

        let speed = if input.sprint {
            self.move_speed * self.sprint_multiplier
        } else {
            self.move_speed
        };

        camera.position += velocity * speed * dt;
        camera.target = camera.position + forward;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_events_toggle_movement() {
        let mut input = CameraInput::new();
        input.set_key(CameraKey::Forward, true);
        input.set_key(CameraKey::Sprint, true);
        assert!(input.forward && input.sprint);
        input.set_key(CameraKey::Forward, false);
        assert!(!input.forward);
    }

    #[test]
    fn forward_moves_along_view_direction() {
        let mut camera = Camera::new(Vec3::ZERO, Vec3::NEG_Z);
        let mut controller = FreeFlyController::new();
        controller.sync_with_camera(&camera);

        let mut input = CameraInput::new();
        input.set_key(CameraKey::Forward, true);
        controller.update(&mut camera, &input, 1.0);

        assert!((camera.position - Vec3::new(0.0, 0.0, -5.0)).length() < 1e-4);
        assert!((camera.forward() - Vec3::NEG_Z).length() < 1e-4);
    }

    #[test]
    fn idle_input_keeps_position() {
        let mut camera = Camera::new(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO);
        let mut controller = FreeFlyController::new();
        controller.sync_with_camera(&camera);
        let before = camera.forward();
        controller.update(&mut camera, &CameraInput::new(), 0.016);
        assert_eq!(camera.position, Vec3::new(1.0, 2.0, 3.0));
        assert!((camera.forward() - before).length() < 1e-4);
    }
}
