//! Interactive demo: a grid of tinted quads, a triangle and a quad that
//! follows the cursor.
//!
//! Run with `cargo run --example demo`.

use pulse_renderer::{engine, FrameInput, PushBuffer, RendererConfig, Simulation};

const CELL: f32 = 90.0;
const GRID_COLS: u32 = 20;
const GRID_ROWS: u32 = 12;

struct Playground {
    elapsed: f32,
}

impl Simulation for Playground {
    fn update(&mut self, input: &FrameInput, frame: &mut PushBuffer) {
        self.elapsed += input.dt;

        for row in 0..GRID_ROWS {
            for col in 0..GRID_COLS {
                let r = col as f32 / GRID_COLS as f32;
                let g = row as f32 / GRID_ROWS as f32;
                frame.submit_quad(
                    col as f32 * CELL,
                    row as f32 * CELL,
                    CELL - 2.0,
                    CELL - 2.0,
                    [r, g, 0.5],
                );
            }
        }

        let pulse = 150.0 + 50.0 * self.elapsed.sin();
        frame.submit_triangle(40.0, 40.0, pulse, pulse, [1.0, 0.9, 0.1]);

        let size = 50.0;
        let x = input.mouse_x * input.scale_factor - size / 2.0;
        let y = input.mouse_y * input.scale_factor - size / 2.0;
        let color = if input.mouse_down {
            [1.0, 0.3, 0.3]
        } else {
            [0.0, 1.0, 0.0]
        };
        frame.submit_quad(x, y, size, size, color);
    }
}

fn main() -> pulse_renderer::RenderResult<()> {
    env_logger::init();

    let config = RendererConfig {
        title: "pulse demo".to_string(),
        ..Default::default()
    };

    engine::run(config, Box::new(Playground { elapsed: 0.0 }))
}
