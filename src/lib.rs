//! pulse-renderer - a frame-paced instanced 2D renderer.
//!
//! Each tick, a simulation callback records draw commands into an
//! append-only push buffer; the renderer packs them into per-instance
//! data, uploads through a staging region and draws everything with a
//! handful of instanced calls, presented through an N-buffered swapchain
//! with per-slot fences and semaphores.
//!
//! # Architecture
//!
//! - [`arena`] — bump allocator with scoped rollback backing per-tick
//!   transient data
//! - [`push_buffer`] — the draw command queue filled by the simulation
//! - [`simulation`] — the per-tick callback boundary
//! - [`backend`] — GPU data layouts and the Vulkan implementation
//!   (swapchain lifecycle, upload pipeline, frame scheduler)
//! - [`engine`] — the driver loop tying window, simulation and renderer
//!   together

pub mod arena;
pub mod backend;
pub mod engine;
pub mod error;
pub mod push_buffer;
pub mod simulation;
pub mod window;

pub use backend::vulkan::frame::{FrameOutcome, Renderer};
pub use engine::run;
pub use error::{RenderError, RenderResult};
pub use push_buffer::{DrawCommand, PushBuffer};
pub use simulation::{FrameInput, Simulation};

use backend::types::InstanceData;

/// Fewest frame slots that still overlap CPU and GPU work.
pub const MIN_FRAMES_IN_FLIGHT: usize = 2;
/// Most frame slots worth the added latency.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Configuration for the engine and renderer.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title.
    pub title: String,
    /// Initial window width in pixels.
    pub width: u32,
    /// Initial window height in pixels.
    pub height: u32,
    /// Present with vsync (FIFO); otherwise prefer MAILBOX.
    pub vsync: bool,
    /// Number of frame slots cycled by the scheduler (2 or 3).
    pub frames_in_flight: usize,
    /// Capacity of the push buffer and of each slot's instance region,
    /// in draw commands per tick.
    pub max_draw_commands: usize,
    /// Size of the per-tick transient arena in bytes. Must hold one
    /// tick's packed instance array.
    pub transient_arena_size: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            title: "pulse".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            frames_in_flight: 2,
            max_draw_commands: 65_536,
            transient_arena_size: 16 * 1024 * 1024,
        }
    }
}

impl RendererConfig {
    /// Check the configuration before any GPU object is created.
    pub fn validate(&self) -> RenderResult<()> {
        if self.frames_in_flight < MIN_FRAMES_IN_FLIGHT
            || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT
        {
            return Err(RenderError::InitializationFailed(format!(
                "frames_in_flight must be {MIN_FRAMES_IN_FLIGHT}..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if self.max_draw_commands == 0 {
            return Err(RenderError::InitializationFailed(
                "max_draw_commands must be non-zero".to_string(),
            ));
        }
        let packed = self.max_draw_commands * std::mem::size_of::<InstanceData>();
        if self.transient_arena_size < packed {
            return Err(RenderError::InitializationFailed(format!(
                "transient arena of {} bytes cannot hold a full tick's instance array \
                 ({packed} bytes for {} commands)",
                self.transient_arena_size, self.max_draw_commands
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_config_is_valid() {
        assert!(RendererConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(4)]
    fn frame_slot_count_is_bounded(#[case] frames_in_flight: usize) {
        let config = RendererConfig {
            frames_in_flight,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn arena_must_hold_packed_instances() {
        let config = RendererConfig {
            max_draw_commands: 1024,
            transient_arena_size: 1024,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("transient arena"));
    }
}
