//! Shader compilation and the instanced graphics pipeline.
//!
//! The WGSL source is compiled to SPIR-V with naga once at startup; the
//! pipeline uses dynamic rendering (no render pass object) and dynamic
//! viewport/scissor so a resized swapchain never forces a rebuild.

use ash::vk;

use super::buffers::MappedBuffer;
use super::VulkanContext;
use crate::backend::types::{FrameUniforms, InstanceData, Vertex2D};
use crate::error::{RenderError, RenderResult};

const SHADER_SOURCE: &str = include_str!("../../../shaders/quad.wgsl");

/// Pipeline objects plus the per-slot descriptor sets feeding it.
pub struct PipelineResources {
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

impl PipelineResources {
    /// Build the pipeline targeting `color_format` and bind one uniform
    /// buffer per frame slot.
    pub fn new(
        ctx: &VulkanContext,
        color_format: vk::Format,
        uniform_buffers: &[MappedBuffer],
    ) -> RenderResult<Self> {
        let device = &ctx.device;
        let slots = uniform_buffers.len() as u32;

        let spirv = compile_wgsl(SHADER_SOURCE)?;
        let module_info = vk::ShaderModuleCreateInfo::default().code(&spirv);
        let shader_module = unsafe { device.create_shader_module(&module_info, None) }
            .map_err(|e| {
                RenderError::InitializationFailed(format!("failed to create shader module: {e:?}"))
            })?;

        // Descriptor set layout: one uniform buffer in the vertex stage.
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let descriptor_set_layout =
            unsafe { device.create_descriptor_set_layout(&layout_info, None) }.map_err(|e| {
                RenderError::InitializationFailed(format!(
                    "failed to create descriptor set layout: {e:?}"
                ))
            })?;

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(slots)];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(slots);
        let descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| {
                RenderError::InitializationFailed(format!(
                    "failed to create descriptor pool: {e:?}"
                ))
            })?;

        let set_layouts = vec![descriptor_set_layout; uniform_buffers.len()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&set_layouts);
        let descriptor_sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| {
                RenderError::InitializationFailed(format!(
                    "failed to allocate descriptor sets: {e:?}"
                ))
            })?;

        for (&set, uniform) in descriptor_sets.iter().zip(uniform_buffers) {
            let buffer_info = [vk::DescriptorBufferInfo::default()
                .buffer(uniform.buffer())
                .offset(0)
                .range(std::mem::size_of::<FrameUniforms>() as vk::DeviceSize)];
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info);
            unsafe { device.update_descriptor_sets(&[write], &[]) };
        }

        let set_layouts = [descriptor_set_layout];
        let pipeline_layout_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let pipeline_layout = unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }
            .map_err(|e| {
                RenderError::InitializationFailed(format!(
                    "failed to create pipeline layout: {e:?}"
                ))
            })?;

        // Binding 0: per-vertex unit geometry. Binding 1: per-instance
        // transform columns (locations 1-4) and color (location 5).
        let binding_descriptions = [
            vk::VertexInputBindingDescription {
                binding: 0,
                stride: std::mem::size_of::<Vertex2D>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            },
            vk::VertexInputBindingDescription {
                binding: 1,
                stride: std::mem::size_of::<InstanceData>() as u32,
                input_rate: vk::VertexInputRate::INSTANCE,
            },
        ];

        let mut attribute_descriptions = vec![vk::VertexInputAttributeDescription {
            binding: 0,
            location: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: 0,
        }];
        for i in 0..4u32 {
            attribute_descriptions.push(vk::VertexInputAttributeDescription {
                binding: 1,
                location: 1 + i,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: i * 16,
            });
        }
        attribute_descriptions.push(vk::VertexInputAttributeDescription {
            binding: 1,
            location: 5,
            format: vk::Format::R32G32B32A32_SFLOAT,
            offset: 64,
        });

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(shader_module)
                .name(c"vs_main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(shader_module)
                .name(c"fs_main"),
        ];

        let color_formats = [color_format];
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(pipeline_layout)
            .push_next(&mut rendering_info);

        let pipelines = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| {
            RenderError::InitializationFailed(format!("failed to create pipeline: {e:?}"))
        })?;

        unsafe { device.destroy_shader_module(shader_module, None) };

        Ok(Self {
            descriptor_set_layout,
            descriptor_pool,
            descriptor_sets,
            pipeline_layout,
            pipeline: pipelines[0],
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

/// Compile WGSL to SPIR-V words.
///
/// The coordinate-space adjustment is disabled: positions leave the
/// vertex shader already in Vulkan clip space, which is what the
/// projection in [`FrameUniforms::for_extent`] produces.
fn compile_wgsl(source: &str) -> RenderResult<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| {
        RenderError::InitializationFailed(format!("WGSL parse error: {}", e.message()))
    })?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let module_info = validator
        .validate(&module)
        .map_err(|e| RenderError::InitializationFailed(format!("WGSL validation error: {e}")))?;

    let mut options = naga::back::spv::Options::default();
    options
        .flags
        .remove(naga::back::spv::WriterFlags::ADJUST_COORDINATE_SPACE);

    naga::back::spv::write_vec(&module, &module_info, &options, None)
        .map_err(|e| RenderError::InitializationFailed(format!("SPIR-V generation failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_shader_compiles() {
        let spirv = compile_wgsl(SHADER_SOURCE).expect("bundled WGSL must compile");
        // 0x07230203 is the SPIR-V magic number.
        assert_eq!(spirv[0], 0x0723_0203);
    }

    #[test]
    fn invalid_wgsl_is_reported() {
        let err = compile_wgsl("fn broken( {").unwrap_err();
        assert!(err.to_string().contains("WGSL parse error"));
    }
}
