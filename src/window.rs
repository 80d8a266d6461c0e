//! Window management using winit.
//!
//! The renderer only consumes the drawable size, the pixel density and a
//! stream of resize/close/input events; this wrapper collects them into
//! the shape the tick loop wants.

use std::sync::Arc;

use winit::{
    dpi::PhysicalSize,
    event::{ElementState, MouseButton, WindowEvent},
    event_loop::EventLoop,
    window::{Window as WinitWindow, WindowBuilder},
};

use crate::simulation::FrameInput;

/// Wrapper around a winit window with per-tick event state.
pub struct Window {
    window: Arc<WinitWindow>,
    resized: bool,
    close_requested: bool,
    mouse_x: f32,
    mouse_y: f32,
    mouse_down: bool,
}

impl Window {
    /// Create a new window with the given title and dimensions.
    pub fn new(event_loop: &EventLoop<()>, title: &str, width: u32, height: u32) -> Self {
        let window = Arc::new(
            WindowBuilder::new()
                .with_title(title)
                .with_inner_size(PhysicalSize::new(width, height))
                .build(event_loop)
                .expect("Failed to create window"),
        );

        Self {
            window,
            resized: false,
            close_requested: false,
            mouse_x: 0.0,
            mouse_y: 0.0,
            mouse_down: false,
        }
    }

    /// Shared handle for backend initialization.
    pub fn winit_window(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    /// Current drawable size in pixels.
    pub fn drawable_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    /// Window pixel density.
    pub fn scale_factor(&self) -> f32 {
        self.window.scale_factor() as f32
    }

    /// Consume the resize flag set since the last tick.
    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }

    /// Check if close was requested.
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Fold a window event into the per-tick state.
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(_) => {
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::CursorMoved { position, .. } => {
                let logical = position.to_logical::<f64>(self.window.scale_factor());
                self.mouse_x = logical.x as f32;
                self.mouse_y = logical.y as f32;
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => {
                self.mouse_down = *state == ElementState::Pressed;
            }
            _ => {}
        }
    }

    /// Snapshot the input state for one tick.
    pub fn frame_input(&self, dt: f32) -> FrameInput {
        FrameInput {
            dt,
            mouse_x: self.mouse_x,
            mouse_y: self.mouse_y,
            mouse_down: self.mouse_down,
            scale_factor: self.scale_factor(),
        }
    }

    /// Request a redraw.
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}
