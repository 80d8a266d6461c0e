//! GPU buffer memory.
//!
//! Device-local data lives in a single allocation subdivided at init into
//! fixed regions: the shared unit geometry (vertex + index) and one
//! instance region per frame slot. Host-visible staging and uniform
//! buffers are persistently mapped and rewritten every tick; all copies
//! into device-local memory go through a staging region, both the one-shot
//! seeding of static geometry and the per-tick instance upload.

use ash::vk;
use bytemuck::cast_slice;

use super::VulkanContext;
use crate::backend::types::{
    Vertex2D, UNIT_QUAD_INDICES, UNIT_QUAD_VERTICES, UNIT_TRIANGLE_INDICES, UNIT_TRIANGLE_VERTICES,
};
use crate::error::{RenderError, RenderResult};

/// A buffer with its own dedicated memory allocation.
pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl AllocatedBuffer {
    pub fn new(
        ctx: &VulkanContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<Self> {
        let buffer = create_raw_buffer(&ctx.device, size, usage)?;
        let requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };

        let memory_type = ctx
            .find_memory_type(requirements.memory_type_bits, properties)
            .ok_or_else(|| {
                RenderError::InitializationFailed(format!(
                    "no memory type for buffer (usage {usage:?}, properties {properties:?})"
                ))
            })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);

        let memory = unsafe { ctx.device.allocate_memory(&alloc_info, None) }.map_err(|e| {
            RenderError::InitializationFailed(format!("failed to allocate buffer memory: {e:?}"))
        })?;

        unsafe { ctx.device.bind_buffer_memory(buffer, memory, 0) }.map_err(|e| {
            RenderError::InitializationFailed(format!("failed to bind buffer memory: {e:?}"))
        })?;

        Ok(Self {
            buffer,
            memory,
            size,
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// A host-visible, host-coherent buffer that stays mapped for its whole
/// lifetime.
pub struct MappedBuffer {
    pub inner: AllocatedBuffer,
    ptr: *mut u8,
}

impl MappedBuffer {
    pub fn new(
        ctx: &VulkanContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<Self> {
        let inner = AllocatedBuffer::new(
            ctx,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let ptr = unsafe {
            ctx.device
                .map_memory(inner.memory, 0, size, vk::MemoryMapFlags::empty())
        }
        .map_err(|e| {
            RenderError::InitializationFailed(format!("failed to map buffer memory: {e:?}"))
        })? as *mut u8;

        Ok(Self { inner, ptr })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.inner.buffer
    }

    /// Copy `bytes` into the mapped region at `offset`. The memory is
    /// host-coherent, so no flush is needed.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.inner.size as usize,
            "write of {} bytes at offset {offset} exceeds mapped buffer of {} bytes",
            bytes.len(),
            self.inner.size
        );
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.unmap_memory(self.inner.memory) };
        self.inner.destroy(device);
    }
}

/// The device-local allocation and the fixed regions carved from it.
pub struct DeviceRegions {
    memory: vk::DeviceMemory,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    /// One instance region per frame slot; a region is only rewritten
    /// once its slot's fence has signalled.
    pub instance_buffers: Vec<vk::Buffer>,
    pub instance_region_size: vk::DeviceSize,
}

impl DeviceRegions {
    pub const VERTEX_REGION_SIZE: vk::DeviceSize = ((UNIT_QUAD_VERTICES.len()
        + UNIT_TRIANGLE_VERTICES.len())
        * std::mem::size_of::<Vertex2D>()) as vk::DeviceSize;
    pub const INDEX_REGION_SIZE: vk::DeviceSize = ((UNIT_QUAD_INDICES.len()
        + UNIT_TRIANGLE_INDICES.len())
        * std::mem::size_of::<u32>()) as vk::DeviceSize;

    /// Create the buffers, bump-allocate their offsets within one
    /// device-local allocation and bind them.
    pub fn new(
        ctx: &VulkanContext,
        instance_region_size: vk::DeviceSize,
        slots: usize,
    ) -> RenderResult<Self> {
        let device = &ctx.device;

        let vertex_buffer = create_raw_buffer(
            device,
            Self::VERTEX_REGION_SIZE,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        let index_buffer = create_raw_buffer(
            device,
            Self::INDEX_REGION_SIZE,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        let instance_buffers: Vec<vk::Buffer> = (0..slots)
            .map(|_| {
                create_raw_buffer(
                    device,
                    instance_region_size,
                    vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                )
            })
            .collect::<RenderResult<_>>()?;

        // Bump offsets for every region within the shared allocation,
        // honoring each buffer's alignment requirement.
        let mut offset: vk::DeviceSize = 0;
        let mut type_bits = u32::MAX;
        let mut offsets = Vec::with_capacity(2 + slots);
        for &buffer in std::iter::once(&vertex_buffer)
            .chain(std::iter::once(&index_buffer))
            .chain(instance_buffers.iter())
        {
            let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
            offset = align_up(offset, requirements.alignment);
            offsets.push(offset);
            offset += requirements.size;
            type_bits &= requirements.memory_type_bits;
        }

        let memory_type = ctx
            .find_memory_type(type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .ok_or_else(|| {
                RenderError::InitializationFailed(
                    "no device-local memory type covers all buffer regions".to_string(),
                )
            })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(offset)
            .memory_type_index(memory_type);
        let memory = unsafe { device.allocate_memory(&alloc_info, None) }.map_err(|e| {
            RenderError::InitializationFailed(format!(
                "failed to allocate device-local memory: {e:?}"
            ))
        })?;

        for (&buffer, &region_offset) in std::iter::once(&vertex_buffer)
            .chain(std::iter::once(&index_buffer))
            .chain(instance_buffers.iter())
            .zip(offsets.iter())
        {
            unsafe { device.bind_buffer_memory(buffer, memory, region_offset) }.map_err(|e| {
                RenderError::InitializationFailed(format!("failed to bind region: {e:?}"))
            })?;
        }

        log::debug!(
            "Device regions: {} bytes total ({} instance bytes x {} slots)",
            offset,
            instance_region_size,
            slots
        );

        Ok(Self {
            memory,
            vertex_buffer,
            index_buffer,
            instance_buffers,
            instance_region_size,
        })
    }

    /// Seed the static unit geometry through the staging buffer.
    pub fn seed_geometry(&self, ctx: &VulkanContext, staging: &mut MappedBuffer) -> RenderResult<()> {
        let mut vertices = Vec::with_capacity(
            UNIT_QUAD_VERTICES.len() + UNIT_TRIANGLE_VERTICES.len(),
        );
        vertices.extend_from_slice(&UNIT_QUAD_VERTICES);
        vertices.extend_from_slice(&UNIT_TRIANGLE_VERTICES);

        staging.write(0, cast_slice(&vertices));
        copy_buffer(
            ctx,
            staging.buffer(),
            self.vertex_buffer,
            Self::VERTEX_REGION_SIZE,
        )?;

        let mut indices =
            Vec::with_capacity(UNIT_QUAD_INDICES.len() + UNIT_TRIANGLE_INDICES.len());
        indices.extend_from_slice(&UNIT_QUAD_INDICES);
        indices.extend_from_slice(&UNIT_TRIANGLE_INDICES);

        staging.write(0, cast_slice(&indices));
        copy_buffer(
            ctx,
            staging.buffer(),
            self.index_buffer,
            Self::INDEX_REGION_SIZE,
        )
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_buffer(self.vertex_buffer, None);
            device.destroy_buffer(self.index_buffer, None);
            for &buffer in &self.instance_buffers {
                device.destroy_buffer(buffer, None);
            }
            device.free_memory(self.memory, None);
        }
    }
}

fn create_raw_buffer(
    device: &ash::Device,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> RenderResult<vk::Buffer> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    unsafe { device.create_buffer(&buffer_info, None) }.map_err(|e| {
        RenderError::InitializationFailed(format!("failed to create buffer: {e:?}"))
    })
}

/// Blocking one-shot copy, used to seed static regions at init.
fn copy_buffer(
    ctx: &VulkanContext,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> RenderResult<()> {
    ctx.one_shot_commands(|device, cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
    })
}

pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 256), 256);
    }

    #[test]
    fn static_region_sizes() {
        // 7 vertices of 8 bytes, 9 indices of 4 bytes.
        assert_eq!(DeviceRegions::VERTEX_REGION_SIZE, 56);
        assert_eq!(DeviceRegions::INDEX_REGION_SIZE, 36);
    }
}
