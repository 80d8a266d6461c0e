//! Frame scheduling: N frame slots cycled per tick, each with its own
//! command buffer, synchronization objects and upload regions.
//!
//! The CPU only ever blocks on the fence of the slot about to be reused,
//! so up to N ticks can be in flight on the GPU at once. A slot's staging,
//! instance and uniform regions are exclusively owned by the tick using
//! that slot; the fence wait at the top of the tick is the sole mutual
//! exclusion over them.

use std::sync::Arc;

use ash::vk;

use super::buffers::{DeviceRegions, MappedBuffer};
use super::pipeline::PipelineResources;
use super::swapchain::{current_surface_extent, SurfaceState, Swapchain};
use super::VulkanContext;
use crate::arena::Arena;
use crate::backend::types::{
    pack_instances, FrameUniforms, InstanceCounts, InstanceData, TRIANGLE_FIRST_INDEX,
    UNIT_QUAD_INDICES, UNIT_TRIANGLE_INDICES,
};
use crate::error::{RenderError, RenderResult};
use crate::push_buffer::PushBuffer;
use crate::RendererConfig;

/// An unresponsive device is fatal, not worth retrying: bound every fence
/// wait instead of blocking forever.
pub const FENCE_TIMEOUT_NS: u64 = 5_000_000_000;

/// Cycles the frame slot index: `tick mod N`.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    index: usize,
    slots: usize,
}

impl FrameClock {
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0, "frame clock needs at least one slot");
        Self { index: 0, slots }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.slots;
    }
}

/// What a tick produced on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// The tick was abandoned at a defined checkpoint (stale surface or
    /// minimized window); simulation state advanced, no GPU work ran.
    Skipped,
}

/// Per-slot GPU resources, created once and reused every N ticks.
struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    in_flight_fence: vk::Fence,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    uniform: MappedBuffer,
    staging: MappedBuffer,
    instance_buffer: vk::Buffer,
    descriptor_set: vk::DescriptorSet,
}

/// The frame scheduler and everything it submits.
pub struct Renderer {
    window: Arc<winit::window::Window>,
    ctx: VulkanContext,
    swapchain: Swapchain,
    surface_state: SurfaceState,
    regions: DeviceRegions,
    pipeline: PipelineResources,
    slots: Vec<FrameSlot>,
    clock: FrameClock,
    max_instances: usize,
    vsync: bool,
}

impl Renderer {
    pub fn new(window: Arc<winit::window::Window>, config: &RendererConfig) -> RenderResult<Self> {
        let ctx = VulkanContext::new(&window)?;

        let size = window.inner_size();
        let swapchain = Swapchain::create(
            &ctx,
            config.vsync,
            (size.width, size.height),
            vk::SwapchainKHR::null(),
        )?;

        let instance_region_size =
            (config.max_draw_commands * std::mem::size_of::<InstanceData>()) as vk::DeviceSize;
        let regions = DeviceRegions::new(&ctx, instance_region_size, config.frames_in_flight)?;

        let uniforms: Vec<MappedBuffer> = (0..config.frames_in_flight)
            .map(|_| {
                MappedBuffer::new(
                    &ctx,
                    std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                )
            })
            .collect::<RenderResult<_>>()?;

        let mut stagings: Vec<MappedBuffer> = (0..config.frames_in_flight)
            .map(|_| {
                MappedBuffer::new(
                    &ctx,
                    instance_region_size
                        .max(DeviceRegions::VERTEX_REGION_SIZE)
                        .max(DeviceRegions::INDEX_REGION_SIZE),
                    vk::BufferUsageFlags::TRANSFER_SRC,
                )
            })
            .collect::<RenderResult<_>>()?;

        regions.seed_geometry(&ctx, &mut stagings[0])?;

        let pipeline = PipelineResources::new(&ctx, swapchain.format, &uniforms)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(ctx.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(config.frames_in_flight as u32);
        let command_buffers = unsafe { ctx.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| {
                RenderError::InitializationFailed(format!(
                    "failed to allocate command buffers: {e:?}"
                ))
            })?;

        let mut slots = Vec::with_capacity(config.frames_in_flight);
        let descriptor_sets = pipeline.descriptor_sets.clone();
        for (((command_buffer, uniform), staging), (instance_buffer, descriptor_set)) in
            command_buffers
                .into_iter()
                .zip(uniforms)
                .zip(stagings)
                .zip(
                    regions
                        .instance_buffers
                        .iter()
                        .copied()
                        .zip(descriptor_sets),
                )
        {
            // Fences start signalled so the first wait on a fresh slot
            // returns immediately.
            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let in_flight_fence = unsafe { ctx.device.create_fence(&fence_info, None) }
                .map_err(|e| {
                    RenderError::InitializationFailed(format!("failed to create fence: {e:?}"))
                })?;

            slots.push(FrameSlot {
                command_buffer,
                in_flight_fence,
                image_available: create_semaphore(&ctx.device)?,
                render_finished: create_semaphore(&ctx.device)?,
                uniform,
                staging,
                instance_buffer,
                descriptor_set,
            });
        }

        log::info!(
            "Renderer ready: {} frames in flight, {} instances per slot",
            config.frames_in_flight,
            config.max_draw_commands
        );

        Ok(Self {
            window,
            ctx,
            swapchain,
            surface_state: SurfaceState::Valid,
            regions,
            pipeline,
            slots,
            clock: FrameClock::new(config.frames_in_flight),
            max_instances: config.max_draw_commands,
            vsync: config.vsync,
        })
    }

    /// The windowing layer observed a resize; recreate before the next
    /// tick's GPU work.
    pub fn note_resize(&mut self) {
        self.surface_state = SurfaceState::Invalidated;
    }

    /// Extent of the current swapchain.
    pub fn extent(&self) -> (u32, u32) {
        (self.swapchain.extent.width, self.swapchain.extent.height)
    }

    /// Run one tick's GPU work for the recorded draw commands.
    ///
    /// `arena` provides the tick's transient scratch; a temp scope opened
    /// here covers the instance packing and closes before returning.
    ///
    /// # Panics
    ///
    /// Panics if the queue holds more commands than the instance region
    /// reserved at startup.
    pub fn draw_frame(
        &mut self,
        frame: &PushBuffer,
        arena: &mut Arena,
    ) -> RenderResult<FrameOutcome> {
        if self.surface_state == SurfaceState::Invalidated && !self.recreate_swapchain()? {
            return Ok(FrameOutcome::Skipped);
        }

        let slot_index = self.clock.index();
        let fence = self.slots[slot_index].in_flight_fence;

        // Block only on the slot about to be reused. After this wait the
        // slot's command buffer and upload regions are ours to rewrite.
        match unsafe {
            self.ctx
                .device
                .wait_for_fences(&[fence], true, FENCE_TIMEOUT_NS)
        } {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                return Err(RenderError::DeviceLost(format!(
                    "fence wait for frame slot {slot_index} exceeded {}s",
                    FENCE_TIMEOUT_NS / 1_000_000_000
                )));
            }
            Err(e) => return Err(RenderError::DeviceLost(format!("{e:?}"))),
        }

        let image_available = self.slots[slot_index].image_available;
        let acquired = unsafe {
            self.ctx.swapchain_fn.acquire_next_image(
                self.swapchain.handle,
                u64::MAX,
                image_available,
                vk::Fence::null(),
            )
        };
        let (image_index, suboptimal) = match acquired {
            Ok(result) => result,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                // Abort before resetting the fence so the slot stays
                // reusable next tick.
                log::debug!("Swapchain out of date on acquire; recreating next tick");
                self.surface_state = SurfaceState::Invalidated;
                return Ok(FrameOutcome::Skipped);
            }
            Err(e) => return Err(RenderError::AcquireImageFailed(format!("{e:?}"))),
        };
        if suboptimal {
            // The image is still usable; render to it and recreate at the
            // next tick boundary.
            log::debug!("Swapchain suboptimal on acquire");
            self.surface_state = SurfaceState::Invalidated;
        }

        unsafe { self.ctx.device.reset_fences(&[fence]) }
            .map_err(|e| RenderError::DeviceLost(format!("{e:?}")))?;

        if frame.len() > self.max_instances {
            panic!(
                "instance region overflow: {} draw commands exceed the reserved capacity of {}",
                frame.len(),
                self.max_instances
            );
        }

        // Upload: pack instances into the tick's temp scope, then copy
        // them into this slot's staging region; rewrite the slot's
        // uniforms for the current extent.
        let extent = self.swapchain.extent;
        let counts = {
            let slot = &mut self.slots[slot_index];
            let mut tick = arena.temp();
            let (slice, counts) = pack_instances(frame, &mut tick);
            slot.staging.write(0, bytemuck::cast_slice(tick.get(slice)));

            let uniforms = FrameUniforms::for_extent(extent.width, extent.height);
            slot.uniform.write(0, bytemuck::bytes_of(&uniforms));
            counts
        };

        let cmd = self.slots[slot_index].command_buffer;
        unsafe {
            self.ctx
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .map_err(|e| RenderError::SubmissionFailed(format!("{e:?}")))?;

        self.record_commands(cmd, image_index, slot_index, counts)?;

        // Submit: color writes wait for the acquired image; completion
        // signals the present semaphore and this slot's fence.
        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [self.slots[slot_index].render_finished];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.graphics_queue, &[submit_info], fence)
        }
        .map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost(format!("{e:?}")),
            _ => RenderError::SubmissionFailed(format!("{e:?}")),
        })?;

        let swapchains = [self.swapchain.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe {
            self.ctx
                .swapchain_fn
                .queue_present(self.ctx.graphics_queue, &present_info)
        } {
            Ok(false) => {}
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                log::debug!("Present reported stale swapchain; recreating next tick");
                self.surface_state = SurfaceState::Invalidated;
            }
            Err(e) => return Err(RenderError::PresentFailed(format!("{e:?}"))),
        }

        self.clock.advance();
        Ok(FrameOutcome::Presented)
    }

    fn record_commands(
        &self,
        cmd: vk::CommandBuffer,
        image_index: u32,
        slot_index: usize,
        counts: InstanceCounts,
    ) -> RenderResult<()> {
        let device = &self.ctx.device;
        let slot = &self.slots[slot_index];
        let extent = self.swapchain.extent;
        let image = self.swapchain.images[image_index as usize];
        let view = self.swapchain.image_views[image_index as usize];

        unsafe {
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
                .map_err(|e| RenderError::SubmissionFailed(format!("{e:?}")))?;

            // Stream this tick's instances into the slot's device-local
            // region before any vertex input reads them.
            let instance_bytes =
                counts.total() as vk::DeviceSize * std::mem::size_of::<InstanceData>() as vk::DeviceSize;
            if instance_bytes > 0 {
                let copy = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: instance_bytes,
                };
                device.cmd_copy_buffer(cmd, slot.staging.buffer(), slot.instance_buffer, &[copy]);

                let barrier = vk::BufferMemoryBarrier::default()
                    .buffer(slot.instance_buffer)
                    .offset(0)
                    .size(instance_bytes)
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::VERTEX_ATTRIBUTE_READ)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::VERTEX_INPUT,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[barrier],
                    &[],
                );
            }

            transition_image(
                device,
                cmd,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            );

            let clear_value = vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            };
            let color_attachments = [vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(clear_value)];
            let rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .layer_count(1)
                .color_attachments(&color_attachments);

            device.cmd_begin_rendering(cmd, &rendering_info);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);

            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            device.cmd_set_scissor(cmd, 0, &[scissor]);

            device.cmd_bind_vertex_buffers(
                cmd,
                0,
                &[self.regions.vertex_buffer, slot.instance_buffer],
                &[0, 0],
            );
            device.cmd_bind_index_buffer(cmd, self.regions.index_buffer, 0, vk::IndexType::UINT32);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.pipeline_layout,
                0,
                &[slot.descriptor_set],
                &[],
            );

            // One instanced draw covers every batched quad; triangles
            // share the instance array, packed after the quads.
            if counts.quads > 0 {
                device.cmd_draw_indexed(cmd, UNIT_QUAD_INDICES.len() as u32, counts.quads, 0, 0, 0);
            }
            if counts.triangles > 0 {
                device.cmd_draw_indexed(
                    cmd,
                    UNIT_TRIANGLE_INDICES.len() as u32,
                    counts.triangles,
                    TRIANGLE_FIRST_INDEX,
                    0,
                    counts.quads,
                );
            }

            device.cmd_end_rendering(cmd);

            transition_image(
                device,
                cmd,
                image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            );

            device
                .end_command_buffer(cmd)
                .map_err(|e| RenderError::SubmissionFailed(format!("{e:?}")))?;
        }

        Ok(())
    }

    /// Rebuild the swapchain for the current drawable.
    ///
    /// Returns `Ok(false)` while the drawable has zero area (minimized
    /// window); the surface stays invalidated and the tick is retried
    /// later.
    fn recreate_swapchain(&mut self) -> RenderResult<bool> {
        let size = self.window.inner_size();
        let extent = current_surface_extent(&self.ctx, (size.width, size.height))?;
        if extent.width == 0 || extent.height == 0 {
            log::debug!("Drawable has zero area; deferring swapchain recreation");
            return Ok(false);
        }

        // Let every in-flight frame finish before the old image views go
        // away. A per-slot fence wait would be finer-grained; a full idle
        // is correct and recreation is rare.
        unsafe { self.ctx.device.device_wait_idle() }
            .map_err(|e| RenderError::DeviceLost(format!("{e:?}")))?;

        self.swapchain.destroy_views(&self.ctx.device);
        let old_handle = self.swapchain.handle;

        let new_swapchain = Swapchain::create(
            &self.ctx,
            self.vsync,
            (size.width, size.height),
            old_handle,
        )?;
        unsafe { self.ctx.swapchain_fn.destroy_swapchain(old_handle, None) };
        self.swapchain = new_swapchain;

        // An acquire that aborted its tick leaves its semaphore
        // signalled; fresh semaphores make every slot reusable.
        for slot in &mut self.slots {
            unsafe {
                self.ctx.device.destroy_semaphore(slot.image_available, None);
                self.ctx.device.destroy_semaphore(slot.render_finished, None);
            }
            slot.image_available = create_semaphore(&self.ctx.device)?;
            slot.render_finished = create_semaphore(&self.ctx.device)?;
        }

        self.surface_state = SurfaceState::Valid;
        Ok(true)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        unsafe {
            let _ = self.ctx.device.device_wait_idle();
        }
        let device = &self.ctx.device;
        for slot in &self.slots {
            unsafe {
                device.destroy_semaphore(slot.image_available, None);
                device.destroy_semaphore(slot.render_finished, None);
                device.destroy_fence(slot.in_flight_fence, None);
            }
            slot.uniform.destroy(device);
            slot.staging.destroy(device);
        }
        self.pipeline.destroy(device);
        self.regions.destroy(device);
        self.swapchain.destroy_views(device);
        unsafe {
            self.ctx
                .swapchain_fn
                .destroy_swapchain(self.swapchain.handle, None)
        };
        // The context's own Drop tears down pool, device, surface and
        // instance after the objects above are gone.
    }
}

fn create_semaphore(device: &ash::Device) -> RenderResult<vk::Semaphore> {
    unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
        .map_err(|e| RenderError::InitializationFailed(format!("failed to create semaphore: {e:?}")))
}

#[allow(clippy::too_many_arguments)]
fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::double_buffered(2, vec![0, 1, 0, 1, 0])]
    #[case::triple_buffered(3, vec![0, 1, 2, 0, 1])]
    fn frame_index_cycles_deterministically(#[case] slots: usize, #[case] expected: Vec<usize>) {
        let mut clock = FrameClock::new(slots);
        let mut observed = Vec::new();
        for _ in 0..expected.len() {
            observed.push(clock.index());
            clock.advance();
        }
        assert_eq!(observed, expected);
        assert_eq!(clock.slots(), slots);
    }

    #[test]
    #[should_panic(expected = "at least one slot")]
    fn zero_slots_is_rejected() {
        FrameClock::new(0);
    }
}
