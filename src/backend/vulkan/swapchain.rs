//! Swap-surface lifecycle.
//!
//! The presentable image chain is rebuilt whenever acquisition or
//! presentation reports it stale, or the window is resized. Recreation
//! passes the retired handle as `old_swapchain` so the driver can finish
//! presenting from the old chain while the new one comes up; the old image
//! views are only torn down once the device is idle.

use ash::vk;

use super::VulkanContext;
use crate::error::{RenderError, RenderResult};

/// Health of the presentable surface as observed by the frame scheduler.
///
/// `Invalidated` is entered on out-of-date/suboptimal acquire or present
/// results and on window resize; it is left once recreation succeeds with
/// a non-degenerate drawable. Transitions through this state are expected
/// control flow, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Valid,
    Invalidated,
}

/// The swapchain and its dependent per-image resources.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
}

impl Swapchain {
    /// Create a swapchain for the context's surface.
    ///
    /// `fallback_extent` is the current drawable size, used only when the
    /// surface does not dictate an exact extent. Passing the retired chain
    /// as `old_swapchain` lets the backend transition smoothly; pass null
    /// at startup.
    pub fn create(
        ctx: &VulkanContext,
        vsync: bool,
        fallback_extent: (u32, u32),
        old_swapchain: vk::SwapchainKHR,
    ) -> RenderResult<Self> {
        let capabilities = unsafe {
            ctx.surface_fn
                .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)
        }
        .map_err(|e| RenderError::SwapchainCreationFailed(format!("{e:?}")))?;

        let formats = unsafe {
            ctx.surface_fn
                .get_physical_device_surface_formats(ctx.physical_device, ctx.surface)
        }
        .map_err(|e| RenderError::SwapchainCreationFailed(format!("{e:?}")))?;

        let present_modes = unsafe {
            ctx.surface_fn
                .get_physical_device_surface_present_modes(ctx.physical_device, ctx.surface)
        }
        .map_err(|e| RenderError::SwapchainCreationFailed(format!("{e:?}")))?;

        let surface_format = choose_surface_format(&formats);
        let present_mode = choose_present_mode(&present_modes, vsync);
        let extent = choose_extent(&capabilities, fallback_extent);
        let image_count = choose_image_count(&capabilities);

        if extent.width == 0 || extent.height == 0 {
            return Err(RenderError::SwapchainCreationFailed(
                "zero-area drawable".to_string(),
            ));
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(ctx.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe { ctx.swapchain_fn.create_swapchain(&create_info, None) }
            .map_err(|e| RenderError::SwapchainCreationFailed(format!("{e:?}")))?;

        let images = unsafe { ctx.swapchain_fn.get_swapchain_images(handle) }
            .map_err(|e| RenderError::SwapchainCreationFailed(format!("{e:?}")))?;

        let image_views: Vec<vk::ImageView> = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe { ctx.device.create_image_view(&view_info, None) }
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RenderError::SwapchainCreationFailed(format!("{e:?}")))?;

        log::info!(
            "Created swapchain: {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            images.len(),
            surface_format.format,
            present_mode
        );

        Ok(Self {
            handle,
            format: surface_format.format,
            extent,
            images,
            image_views,
        })
    }

    /// Destroy the per-image views. The caller must have ensured the
    /// device is no longer using them.
    pub fn destroy_views(&mut self, device: &ash::Device) {
        for view in self.image_views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
    }

    /// Destroy views and the chain itself.
    pub fn destroy(mut self, ctx: &VulkanContext) {
        self.destroy_views(&ctx.device);
        unsafe { ctx.swapchain_fn.destroy_swapchain(self.handle, None) };
    }
}

/// Current drawable extent as the surface reports it, clamped to its
/// bounds. A zero extent means the window is minimized.
pub fn current_surface_extent(
    ctx: &VulkanContext,
    fallback_extent: (u32, u32),
) -> RenderResult<vk::Extent2D> {
    let capabilities = unsafe {
        ctx.surface_fn
            .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)
    }
    .map_err(|e| RenderError::SwapchainCreationFailed(format!("{e:?}")))?;

    Ok(choose_extent(&capabilities, fallback_extent))
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .copied()
        .unwrap_or(formats[0])
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        // FIFO is always available.
        vk::PresentModeKHR::FIFO
    } else {
        modes
            .iter()
            .copied()
            .find(|&m| m == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO)
    }
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    fallback_extent: (u32, u32),
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: fallback_extent.0.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: fallback_extent.1.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    (capabilities.min_image_count + 1).min(if capabilities.max_image_count > 0 {
        capabilities.max_image_count
    } else {
        u32::MAX
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(
        current: (u32, u32),
        min: (u32, u32),
        max: (u32, u32),
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let caps = capabilities((1024, 768), (1, 1), (4096, 4096));
        let extent = choose_extent(&caps, (800, 600));
        assert_eq!((extent.width, extent.height), (1024, 768));
    }

    #[test]
    fn extent_clamps_window_size_when_flexible() {
        let caps = capabilities((u32::MAX, u32::MAX), (200, 200), (1000, 1000));
        let extent = choose_extent(&caps, (5000, 100));
        assert_eq!((extent.width, extent.height), (1000, 200));
    }

    #[test]
    fn zero_area_surface_reports_zero_extent() {
        let caps = capabilities((0, 0), (0, 0), (4096, 4096));
        let extent = choose_extent(&caps, (800, 600));
        assert_eq!((extent.width, extent.height), (0, 0));
    }

    #[test]
    fn image_count_prefers_one_over_minimum() {
        let mut caps = capabilities((800, 600), (1, 1), (4096, 4096));
        caps.min_image_count = 2;
        caps.max_image_count = 8;
        assert_eq!(choose_image_count(&caps), 3);

        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);

        // Zero means no upper bound.
        caps.max_image_count = 0;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn vsync_always_uses_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(
            choose_present_mode(&modes, false),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn format_prefers_srgb_bgra() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::B8G8R8A8_SRGB
        );

        // Falls back to whatever the surface offers first.
        assert_eq!(
            choose_surface_format(&formats[..1]).format,
            vk::Format::R8G8B8A8_UNORM
        );
    }
}
