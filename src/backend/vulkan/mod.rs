//! Vulkan backend via ash.
//!
//! [`VulkanContext`] owns the API objects with process lifetime: instance,
//! surface, device, queue and command pool. Everything frame-related lives
//! in the sibling modules ([`swapchain`], [`buffers`], [`pipeline`],
//! [`frame`]).

pub mod buffers;
pub mod debug;
pub mod frame;
pub mod pipeline;
pub mod swapchain;

use std::ffi::CStr;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::error::{RenderError, RenderResult};

/// Validation layer name.
const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

const REQUIRED_API_VERSION: u32 = vk::API_VERSION_1_3;

/// Process-lifetime Vulkan objects.
pub struct VulkanContext {
    _entry: ash::Entry,
    pub instance: ash::Instance,
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub surface: vk::SurfaceKHR,
    pub surface_fn: ash::khr::surface::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub swapchain_fn: ash::khr::swapchain::Device,
    pub graphics_queue: vk::Queue,
    pub queue_family: u32,
    pub command_pool: vk::CommandPool,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanContext {
    /// Initialize Vulkan against the given window.
    ///
    /// Validation layers are enabled when available in debug builds.
    pub fn new(window: &winit::window::Window) -> RenderResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RenderError::InitializationFailed(format!("failed to load Vulkan: {e}")))?;

        let validation = cfg!(debug_assertions) && check_validation_layer_support(&entry);
        if cfg!(debug_assertions) && !validation {
            log::warn!("Validation layers requested but not available");
        }

        let display_handle = window
            .display_handle()
            .map_err(|e| RenderError::InitializationFailed(e.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| RenderError::InitializationFailed(e.to_string()))?
            .as_raw();

        // Instance
        let app_name = c"pulse-renderer";
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(app_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(REQUIRED_API_VERSION);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(|e| {
                RenderError::InitializationFailed(format!(
                    "failed to query surface extensions: {e:?}"
                ))
            })?
            .to_vec();
        if validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        #[allow(unused_mut)]
        let mut create_flags = vk::InstanceCreateFlags::empty();
        #[cfg(target_os = "macos")]
        {
            extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
            create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let layer_names: Vec<*const std::ffi::c_char> = if validation {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            vec![]
        };

        let instance_info = vk::InstanceCreateInfo::default()
            .flags(create_flags)
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&instance_info, None) }.map_err(|e| {
            RenderError::InitializationFailed(format!("failed to create Vulkan instance: {e:?}"))
        })?;

        let debug = if validation {
            let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger = debug::create_debug_messenger(&debug_utils)?;
            Some((debug_utils, messenger))
        } else {
            None
        };

        // Surface
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .map_err(|e| RenderError::SurfaceCreationFailed(format!("{e:?}")))?;
        let surface_fn = ash::khr::surface::Instance::new(&entry, &instance);

        // Device
        let physical_device = select_physical_device(&instance)?;
        let queue_family = find_graphics_queue_family(&instance, physical_device, &surface_fn, surface)?;
        let device = create_logical_device(&instance, physical_device, queue_family)?;
        let graphics_queue = unsafe { device.get_device_queue(queue_family, 0) };
        let swapchain_fn = ash::khr::swapchain::Device::new(&instance, &device);

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        // Command pool for per-frame and one-shot command buffers.
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
            RenderError::InitializationFailed(format!("failed to create command pool: {e:?}"))
        })?;

        log::info!("Vulkan context ready (queue family {queue_family})");

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            surface,
            surface_fn,
            physical_device,
            device,
            swapchain_fn,
            graphics_queue,
            queue_family,
            command_pool,
            memory_properties,
        })
    }

    /// Find a memory type matching the filter and property flags.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&i| {
            (type_bits & (1 << i)) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
    }

    /// Record and submit a one-shot command buffer, waiting for it to
    /// complete. Used for init-time staging copies.
    pub fn one_shot_commands(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> RenderResult<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| {
                RenderError::SubmissionFailed(format!(
                    "failed to allocate one-shot command buffer: {e:?}"
                ))
            })?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        // The command buffer is freed on every path, including errors.
        let result = (|| unsafe {
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| RenderError::SubmissionFailed(format!("{e:?}")))?;
            record(&self.device, cmd);
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| RenderError::SubmissionFailed(format!("{e:?}")))?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                .map_err(|e| RenderError::SubmissionFailed(format!("{e:?}")))?;
            self.device
                .queue_wait_idle(self.graphics_queue)
                .map_err(|e| RenderError::DeviceLost(format!("{e:?}")))
        })();

        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        result
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Check if the validation layer is available.
fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let available_layers = match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers,
        Err(_) => return false,
    };

    available_layers.iter().any(|layer| {
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == VALIDATION_LAYER_NAME
    })
}

/// Select the best physical device, preferring discrete GPUs.
fn select_physical_device(instance: &ash::Instance) -> RenderResult<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        RenderError::InitializationFailed(format!("failed to enumerate physical devices: {e:?}"))
    })?;

    if devices.is_empty() {
        return Err(RenderError::InitializationFailed(
            "no Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best_device = None;
    let mut best_score = 0;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };

        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        if score > best_score {
            best_score = score;
            best_device = Some(device);
        }
    }

    best_device
        .ok_or_else(|| RenderError::InitializationFailed("no suitable GPU found".to_string()))
}

/// Find a queue family supporting both graphics and presentation to the
/// surface.
fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface_fn: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> RenderResult<u32> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    for (index, family) in queue_families.iter().enumerate() {
        let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let supports_surface = unsafe {
            surface_fn
                .get_physical_device_surface_support(physical_device, index as u32, surface)
                .unwrap_or(false)
        };

        if supports_graphics && supports_surface {
            return Ok(index as u32);
        }
    }

    Err(RenderError::InitializationFailed(
        "no graphics queue family with presentation support found".to_string(),
    ))
}

/// Create a logical device with dynamic rendering enabled.
fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> RenderResult<ash::Device> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&queue_priorities)];

    let device_extensions = [ash::khr::swapchain::NAME.as_ptr()];

    let mut vulkan_13_features =
        vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .push_next(&mut vulkan_13_features);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        RenderError::InitializationFailed(format!("failed to create logical device: {e:?}"))
    })
}
