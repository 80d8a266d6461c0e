//! GPU-visible data layouts shared by the upload pipeline and the
//! graphics pipeline, plus the instance packing step that turns recorded
//! draw commands into the per-instance array the shader consumes.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::arena::{Arena, TypedSlice};
use crate::push_buffer::{DrawCommand, PushBuffer};

/// A vertex of the shared unit geometry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex2D {
    pub pos: [f32; 2],
}

/// Per-instance attributes consumed by the instanced draw.
///
/// `transform` positions unit geometry in pixel space; `color` is linear
/// RGBA. Layout matches vertex attribute locations 1–4 (matrix columns)
/// and 5.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InstanceData {
    pub transform: Mat4,
    pub color: Vec4,
}

/// Per-frame camera uniforms, rewritten every tick.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameUniforms {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl FrameUniforms {
    /// Uniforms projecting pixel coordinates (top-left origin, y down)
    /// onto the full drawable of the given extent.
    ///
    /// Vulkan clip space has y = -1 at the top, so mapping pixel y = 0 to
    /// clip -1 needs the `bottom = 0, top = height` ordering here.
    pub fn for_extent(width: u32, height: u32) -> Self {
        Self {
            model: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            proj: Mat4::orthographic_rh_gl(0.0, width as f32, 0.0, height as f32, -1.0, 1.0),
        }
    }
}

/// Unit quad covering (0,0)..(1,1), drawn as two triangles.
pub const UNIT_QUAD_VERTICES: [Vertex2D; 4] = [
    Vertex2D { pos: [1.0, 0.0] },
    Vertex2D { pos: [0.0, 0.0] },
    Vertex2D { pos: [0.0, 1.0] },
    Vertex2D { pos: [1.0, 1.0] },
];

pub const UNIT_QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

/// Unit right triangle covering half of (0,0)..(1,1). Its indices address
/// the combined vertex region, after the quad's four vertices.
pub const UNIT_TRIANGLE_VERTICES: [Vertex2D; 3] = [
    Vertex2D { pos: [0.0, 0.0] },
    Vertex2D { pos: [1.0, 0.0] },
    Vertex2D { pos: [0.0, 1.0] },
];

pub const UNIT_TRIANGLE_INDICES: [u32; 3] = [4, 5, 6];

/// Index of the first triangle index within the combined index region.
pub const TRIANGLE_FIRST_INDEX: u32 = UNIT_QUAD_INDICES.len() as u32;

/// Instance counts produced by [`pack_instances`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceCounts {
    pub quads: u32,
    pub triangles: u32,
}

impl InstanceCounts {
    pub fn total(&self) -> u32 {
        self.quads + self.triangles
    }
}

fn instance_for(x: f32, y: f32, width: f32, height: f32, color: [f32; 3]) -> InstanceData {
    // Column-vector convention: the unit geometry is scaled to
    // (width, height) first, then translated to (x, y).
    InstanceData {
        transform: Mat4::from_translation(Vec3::new(x, y, 0.0))
            * Mat4::from_scale(Vec3::new(width, height, 1.0)),
        color: Vec4::new(color[0], color[1], color[2], 1.0),
    }
}

/// Pack every recorded command into a contiguous arena-backed instance
/// array, quads first, then triangles.
///
/// The region lives in the caller's arena (typically a temp scope opened
/// for the tick) and is copied to the GPU through the staging path before
/// the scope closes.
pub fn pack_instances(
    frame: &PushBuffer,
    arena: &mut Arena,
) -> (TypedSlice<InstanceData>, InstanceCounts) {
    let slice = arena.push_slice::<InstanceData>(frame.len());

    let mut counts = InstanceCounts {
        quads: 0,
        triangles: 0,
    };

    for command in frame.iter() {
        match *command {
            DrawCommand::Quad {
                x,
                y,
                width,
                height,
                color,
            } => {
                arena.get_mut(slice)[counts.quads as usize] =
                    instance_for(x, y, width, height, color);
                counts.quads += 1;
            }
            DrawCommand::Triangle { .. } => {}
        }
    }

    let quads = counts.quads as usize;
    for command in frame.iter() {
        match *command {
            DrawCommand::Triangle {
                x,
                y,
                width,
                height,
                color,
            } => {
                arena.get_mut(slice)[quads + counts.triangles as usize] =
                    instance_for(x, y, width, height, color);
                counts.triangles += 1;
            }
            DrawCommand::Quad { .. } => {}
        }
    }

    (slice, counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    #[test]
    fn packed_instances_match_commands() {
        let mut frame = PushBuffer::new(8);
        frame.submit_quad(0.0, 0.0, 10.0, 10.0, [1.0, 0.0, 0.0]);
        frame.submit_quad(10.0, 0.0, 10.0, 10.0, [1.0, 0.0, 0.0]);
        frame.submit_quad(0.0, 10.0, 10.0, 10.0, [1.0, 0.0, 0.0]);

        let mut arena = Arena::new("test", 4096);
        let (slice, counts) = pack_instances(&frame, &mut arena);

        assert_eq!(
            counts,
            InstanceCounts {
                quads: 3,
                triangles: 0
            }
        );

        let expected = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)];
        for (instance, (x, y)) in arena.get(slice).iter().zip(expected) {
            let want = Mat4::from_translation(Vec3::new(x, y, 0.0))
                * Mat4::from_scale(Vec3::new(10.0, 10.0, 1.0));
            assert_eq!(instance.transform, want);
            assert_eq!(instance.color, Vec4::new(1.0, 0.0, 0.0, 1.0));
        }
    }

    #[test]
    fn transform_scales_then_positions() {
        let instance = instance_for(5.0, 7.0, 20.0, 30.0, [0.0; 3]);

        let origin = instance.transform.transform_point3(Vec3::ZERO);
        let far = instance.transform.transform_point3(Vec3::new(1.0, 1.0, 0.0));

        assert_eq!(origin.truncate(), Vec2::new(5.0, 7.0));
        assert_eq!(far.truncate(), Vec2::new(25.0, 37.0));
    }

    #[test]
    fn quads_pack_before_triangles() {
        let mut frame = PushBuffer::new(8);
        frame.submit_triangle(0.0, 0.0, 1.0, 1.0, [0.0, 0.0, 1.0]);
        frame.submit_quad(0.0, 0.0, 1.0, 1.0, [0.0, 1.0, 0.0]);
        frame.submit_triangle(2.0, 0.0, 1.0, 1.0, [0.0, 0.0, 1.0]);

        let mut arena = Arena::new("test", 4096);
        let (slice, counts) = pack_instances(&frame, &mut arena);

        assert_eq!(
            counts,
            InstanceCounts {
                quads: 1,
                triangles: 2
            }
        );

        let instances = arena.get(slice);
        assert_eq!(instances[0].color, Vec4::new(0.0, 1.0, 0.0, 1.0));
        assert_eq!(instances[1].color, Vec4::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(instances[2].color, Vec4::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn projection_maps_pixels_to_clip_corners() {
        let uniforms = FrameUniforms::for_extent(800, 600);

        let top_left = uniforms.proj.transform_point3(Vec3::ZERO);
        let bottom_right = uniforms.proj.transform_point3(Vec3::new(800.0, 600.0, 0.0));

        assert_eq!(top_left.truncate(), Vec2::new(-1.0, -1.0));
        assert_eq!(bottom_right.truncate(), Vec2::new(1.0, 1.0));
    }

    #[test]
    fn instance_layout_matches_attribute_offsets() {
        assert_eq!(std::mem::size_of::<InstanceData>(), 80);
        assert_eq!(std::mem::offset_of!(InstanceData, color), 64);
        assert_eq!(std::mem::size_of::<Vertex2D>(), 8);
    }
}
