//! Window and event loop using winit
//!
//! The window size is fixed at creation; the frame targets are sized once.

use crate::asset::SceneAsset;
use crate::backend::wgpu_backend::WgpuBackend;
use crate::egui_integration::{draw_overlay, WgpuEguiIntegration};
use crate::engine::FrameLoop;
use crate::scene::{CameraInput, CameraKey, FreeFlyController};
use crate::{ViewerConfig, ViewerError};
use glam::Vec2;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    dpi::PhysicalSize,
    event::{DeviceEvent, ElementState, Event, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window as WinitWindow, WindowBuilder},
};

/// Map a physical key to the camera movement it drives.
pub fn camera_key(code: KeyCode) -> Option<CameraKey> {
    match code {
        KeyCode::KeyW | KeyCode::ArrowUp => Some(CameraKey::Forward),
        KeyCode::KeyS | KeyCode::ArrowDown => Some(CameraKey::Backward),
        KeyCode::KeyA | KeyCode::ArrowLeft => Some(CameraKey::Left),
        KeyCode::KeyD | KeyCode::ArrowRight => Some(CameraKey::Right),
        KeyCode::KeyE | KeyCode::Space => Some(CameraKey::Up),
        KeyCode::KeyQ => Some(CameraKey::Down),
        KeyCode::ShiftLeft | KeyCode::ShiftRight => Some(CameraKey::Sprint),
        _ => None,
    }
}

/// Translate window events into camera input. Returns whether the viewer should quit.
fn apply_window_event(input: &mut CameraInput, event: &WindowEvent) -> bool {
    match event {
        WindowEvent::CloseRequested => return true,
        WindowEvent::KeyboardInput {
            event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(code),
                    state,
                    ..
                },
            ..
        } => {
            if *code == KeyCode::Escape && *state == ElementState::Pressed {
                return true;
            }
            if let Some(key) = camera_key(*code) {
                input.set_key(key, *state == ElementState::Pressed);
            }
        }
        WindowEvent::MouseInput {
            button: MouseButton::Right,
            state,
            ..
        } => {
            input.mouse_look_active = *state == ElementState::Pressed;
        }
        WindowEvent::MouseWheel { delta, .. } => {
            input.scroll_delta += match delta {
                MouseScrollDelta::LineDelta(_, y) => *y,
                MouseScrollDelta::PixelDelta(p) => p.y as f32 / 40.0,
            };
        }
        WindowEvent::Focused(false) => {
            // Keys released while unfocused never arrive
            *input = CameraInput::new();
        }
        _ => {}
    }
    false
}

/// Open a window, upload `asset` and render until closed or the frame limit.
pub fn run_viewer(config: ViewerConfig, asset: &SceneAsset) -> Result<(), ViewerError> {
    let event_loop = EventLoop::new().map_err(|e| ViewerError::Window(e.to_string()))?;
    let window: Arc<WinitWindow> = Arc::new(
        WindowBuilder::new()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(false)
            .build(&event_loop)
            .map_err(|e| ViewerError::Window(e.to_string()))?,
    );

    let backend = WgpuBackend::new(Arc::clone(&window), config.vsync)?;
    let mut frame_loop = FrameLoop::new(backend, &config)?;
    frame_loop.load_scene(asset)?;

    let mut egui = WgpuEguiIntegration::new(frame_loop.backend(), &window);
    let mut controller = FreeFlyController::new();
    controller.sync_with_camera(frame_loop.camera());
    let mut input = CameraInput::new();
    let mut last_frame = Instant::now();
    let mut failure: Option<ViewerError> = None;

    event_loop
        .run(|event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    let consumed = egui.on_window_event(&window, &event);
                    if let WindowEvent::RedrawRequested = event {
                        let now = Instant::now();
                        let dt = now.duration_since(last_frame).as_secs_f32();
                        last_frame = now;
                        controller.update(frame_loop.camera_mut(), &input, dt);
                        input.reset_deltas();

                        let result = frame_loop.render_frame_with(|backend, frame, stats| {
                            egui.begin_frame(&window);
                            draw_overlay(egui.context(), stats);
                            egui.end_frame(&window);
                            egui.render(backend, frame.width, frame.height);
                            Ok(())
                        });
                        match result {
                            Ok(stats) => {
                                if config.frame_limit.is_some_and(|limit| stats.frame_index + 1 >= limit) {
                                    log::info!("Frame limit reached");
                                    elwt.exit();
                                }
                            }
                            Err(err) => {
                                failure = Some(err);
                                elwt.exit();
                            }
                        }
                        return;
                    }
                    let keyboard = matches!(event, WindowEvent::KeyboardInput { .. });
                    if consumed && keyboard && egui.wants_keyboard_input() {
                        return;
                    }
                    if consumed && !keyboard && egui.wants_pointer_input() {
                        return;
                    }
                    if apply_window_event(&mut input, &event) {
                        elwt.exit();
                    }
                }
                Event::DeviceEvent {
                    event: DeviceEvent::MouseMotion { delta },
                    ..
                } => {
                    if input.mouse_look_active {
                        input.mouse_delta += Vec2::new(delta.0 as f32, delta.1 as f32);
                    }
                }
                Event::AboutToWait => {
                    window.request_redraw();
                }
                _ => {}
            }
        })
        .map_err(|e| ViewerError::Window(e.to_string()))?;

    if let Some(err) = failure {
        return Err(err);
    }
    frame_loop.shutdown()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(KeyCode::KeyW, Some(CameraKey::Forward))]
    #[case(KeyCode::KeyS, Some(CameraKey::Backward))]
    #[case(KeyCode::KeyA, Some(CameraKey::Left))]
    #[case(KeyCode::KeyD, Some(CameraKey::Right))]
    #[case(KeyCode::KeyE, Some(CameraKey::Up))]
    #[case(KeyCode::KeyQ, Some(CameraKey::Down))]
    #[case(KeyCode::ShiftRight, Some(CameraKey::Sprint))]
    #[case(KeyCode::KeyZ, None)]
    fn keys_map_to_camera_moves(#[case] code: KeyCode, #[case] expected: Option<CameraKey>) {
        assert_eq!(camera_key(code), expected);
    }

    #[test]
    fn close_request_quits() {
        let mut input = CameraInput::new();
        assert!(apply_window_event(&mut input, &WindowEvent::CloseRequested));
    }

    #[test]
    fn focus_loss_releases_keys() {
        let mut input = CameraInput::new();
        input.set_key(CameraKey::Forward, true);
        input.mouse_look_active = true;
        assert!(!apply_window_event(&mut input, &WindowEvent::Focused(false)));
        assert!(!input.forward);
        assert!(!input.mouse_look_active);
    }
}
