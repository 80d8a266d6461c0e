//! The per-tick simulation boundary.
//!
//! The engine drives a [`Simulation`] once per tick: it resets the
//! [`PushBuffer`](crate::push_buffer::PushBuffer), invokes
//! [`update`](Simulation::update) with the tick's input, and then renders
//! whatever the simulation recorded. The engine owns the queue's backing
//! memory and never inspects simulation state.

use crate::push_buffer::PushBuffer;

/// Input snapshot handed to the simulation each tick.
#[derive(Debug, Clone, Copy)]
pub struct FrameInput {
    /// Seconds elapsed since the previous tick.
    pub dt: f32,
    /// Cursor position in logical window coordinates.
    pub mouse_x: f32,
    pub mouse_y: f32,
    /// Whether the primary mouse button is held.
    pub mouse_down: bool,
    /// Window pixel density. Multiply logical coordinates by this to get
    /// the pixel coordinates draw commands are expressed in.
    pub scale_factor: f32,
}

impl Default for FrameInput {
    fn default() -> Self {
        Self {
            dt: 0.0,
            mouse_x: 0.0,
            mouse_y: 0.0,
            mouse_down: false,
            scale_factor: 1.0,
        }
    }
}

/// Per-tick game/simulation logic.
///
/// Implementations populate the push buffer via its submit methods before
/// returning; nothing recorded outside `update` is rendered.
///
/// The trait is object safe so a host that reloads simulation code at
/// runtime can hide module swapping behind `Box<dyn Simulation>` — the
/// engine holds the box across swaps, so persistent state kept by the
/// implementor must stay at a stable address and layout for as long as the
/// host keeps handing out the same instance.
pub trait Simulation {
    fn update(&mut self, input: &FrameInput, frame: &mut PushBuffer);
}

impl<F> Simulation for F
where
    F: FnMut(&FrameInput, &mut PushBuffer),
{
    fn update(&mut self, input: &FrameInput, frame: &mut PushBuffer) {
        self(input, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_simulations() {
        let mut ticks = 0u32;
        let mut sim = |_input: &FrameInput, frame: &mut PushBuffer| {
            frame.submit_quad(0.0, 0.0, 1.0, 1.0, [1.0, 0.0, 0.0]);
            ticks += 1;
        };

        let mut buffer = PushBuffer::new(8);
        let input = FrameInput::default();

        for _ in 0..3 {
            buffer.reset();
            sim.update(&input, &mut buffer);
            assert_eq!(buffer.len(), 1);
        }
        assert_eq!(ticks, 3);
    }
}
