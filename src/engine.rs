//! Top-level driver loop.
//!
//! One CPU thread drives the whole tick: reset the push buffer, run the
//! simulation, then hand the recorded commands to the frame scheduler.
//! The GPU executes asynchronously, overlapping with the CPU preparing
//! the next slot's work. All loop state lives in [`Engine`]; there are no
//! process-wide flags or counters.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use winit::event::Event;
use winit::event_loop::{ControlFlow, EventLoop};

use crate::arena::Arena;
use crate::backend::vulkan::frame::{FrameOutcome, Renderer};
use crate::error::{RenderError, RenderResult};
use crate::push_buffer::PushBuffer;
use crate::simulation::Simulation;
use crate::window::Window;
use crate::RendererConfig;

struct Engine {
    window: Window,
    renderer: Renderer,
    arena: Arena,
    push_buffer: PushBuffer,
    simulation: Box<dyn Simulation>,
    last_tick: Instant,
}

impl Engine {
    fn tick(&mut self) -> RenderResult<()> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f32();
        self.last_tick = now;

        if self.window.take_resized() {
            self.renderer.note_resize();
        }

        let input = self.window.frame_input(dt);
        self.push_buffer.reset();
        self.simulation.update(&input, &mut self.push_buffer);

        match self.renderer.draw_frame(&self.push_buffer, &mut self.arena)? {
            FrameOutcome::Presented => {}
            FrameOutcome::Skipped => log::trace!("Tick abandoned; surface not ready"),
        }
        Ok(())
    }
}

/// Run the tick loop until the window closes or a fatal error occurs.
///
/// Surface transience (resize, stale presentation, minimized window) is
/// absorbed internally; an `Err` from here means initialization failed or
/// the device is gone.
pub fn run(config: RendererConfig, simulation: Box<dyn Simulation>) -> RenderResult<()> {
    config.validate()?;

    let event_loop = EventLoop::new().map_err(|e| {
        RenderError::InitializationFailed(format!("failed to create event loop: {e}"))
    })?;
    let window = Window::new(&event_loop, &config.title, config.width, config.height);
    let renderer = Renderer::new(window.winit_window(), &config)?;

    let mut engine = Engine {
        arena: Arena::new("frame-transient", config.transient_arena_size),
        push_buffer: PushBuffer::new(config.max_draw_commands),
        window,
        renderer,
        simulation,
        last_tick: Instant::now(),
    };

    // The closure outlives this frame, so a fatal error is parked here
    // and picked up once the loop exits.
    let failure: Rc<RefCell<Option<RenderError>>> = Rc::new(RefCell::new(None));
    let failure_slot = Rc::clone(&failure);

    event_loop
        .run(move |event, elwt| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    engine.window.handle_event(&event);
                    if engine.window.should_close() {
                        elwt.exit();
                    }
                }
                Event::AboutToWait => match engine.tick() {
                    Ok(()) => engine.window.request_redraw(),
                    Err(err) => {
                        log::error!("Fatal render error: {err}");
                        *failure_slot.borrow_mut() = Some(err);
                        elwt.exit();
                    }
                },
                _ => {}
            }
        })
        .map_err(|e| RenderError::InitializationFailed(format!("event loop failed: {e}")))?;

    let result = match failure.borrow_mut().take() {
        Some(err) => Err(err),
        None => Ok(()),
    };
    result
}
