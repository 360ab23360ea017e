// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::khr::swapchain;
use ash::vk;
use tracing::{debug, info};
use vkd_display::WindowParameters;

use crate::device::DeviceContext;
use crate::error::{DisplayError, DisplayResult};

/// Prefers `B8G8R8A8_SRGB` with the sRGB colour space, else the first reported.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    // A lone UNDEFINED entry means the surface takes anything.
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(preferred);
        }
    }
    formats
        .iter()
        .copied()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    let wanted = if vsync {
        [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED]
    } else {
        [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
    };
    wanted
        .into_iter()
        .find(|m| modes.contains(m))
        .or_else(|| modes.first().copied())
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn clamp_extent(caps: &vk::SurfaceCapabilitiesKHR, window: WindowParameters) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&bit| supported.contains(bit))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    }
}

/// A window without area never acquires a swapchain image, even when a
/// swapchain from an earlier size still exists.
pub fn can_present(has_swapchain: bool, window: WindowParameters) -> bool {
    has_swapchain && !window.is_degenerate()
}

/// Picks the swapchain format once; it stays fixed across rebuilds.
pub fn query_surface_format(ctx: &DeviceContext) -> DisplayResult<vk::SurfaceFormatKHR> {
    let formats = unsafe {
        ctx.surface_loader()
            .get_physical_device_surface_formats(ctx.physical_device(), ctx.surface())
    }
    .map_err(DisplayError::vulkan("get_physical_device_surface_formats"))?;
    let chosen = choose_surface_format(&formats).ok_or(DisplayError::Vulkan {
        context: "surface reports no formats",
        result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
    })?;
    debug!(format = ?chosen.format, color_space = ?chosen.color_space, "surface format");
    Ok(chosen)
}

/// The swapchain and everything sized to it.
///
/// A zero-area window leaves the context without a swapchain; it is rebuilt
/// once the window has an area again.
pub struct PresentationContext {
    ctx: Arc<DeviceContext>,
    loader: swapchain::Device,
    surface_format: vk::SurfaceFormatKHR,
    render_pass: vk::RenderPass,

    window: WindowParameters,
    swapchain: vk::SwapchainKHR,
    extent: vk::Extent2D,
    views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
}

impl PresentationContext {
    pub fn new(
        ctx: Arc<DeviceContext>,
        surface_format: vk::SurfaceFormatKHR,
        render_pass: vk::RenderPass,
        window: WindowParameters,
    ) -> DisplayResult<Self> {
        let loader = swapchain::Device::new(ctx.instance(), ctx.device());
        let mut this = Self {
            ctx,
            loader,
            surface_format,
            render_pass,
            window,
            swapchain: vk::SwapchainKHR::null(),
            extent: vk::Extent2D::default(),
            views: Vec::new(),
            framebuffers: Vec::new(),
        };
        if !window.is_degenerate() {
            this.rebuild()?;
        }
        Ok(this)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    /// A swapchain exists and the window has an area.
    pub fn is_ready(&self) -> bool {
        can_present(self.swapchain != vk::SwapchainKHR::null(), self.window)
    }

    /// Records new window parameters and rebuilds if they changed and the
    /// window has an area. Returns whether a rebuild happened.
    pub fn update(&mut self, window: WindowParameters) -> DisplayResult<bool> {
        if window == self.window && self.swapchain != vk::SwapchainKHR::null() {
            return Ok(false);
        }
        self.window = window;
        if window.is_degenerate() {
            debug!("window has no area, keeping swapchain");
            return Ok(false);
        }
        self.rebuild()?;
        Ok(true)
    }

    /// Recreates the swapchain for the current window parameters.
    pub fn rebuild(&mut self) -> DisplayResult<()> {
        let ctx = Arc::clone(&self.ctx);
        unsafe {
            ctx.device()
                .device_wait_idle()
                .map_err(DisplayError::vulkan("device_wait_idle"))?;
            self.destroy_targets();

            let surface_loader = ctx.surface_loader();
            let phys = ctx.physical_device();
            let surface = ctx.surface();
            let caps = surface_loader
                .get_physical_device_surface_capabilities(phys, surface)
                .map_err(DisplayError::vulkan("get_physical_device_surface_capabilities"))?;

            let extent = clamp_extent(&caps, self.window);
            if extent.width == 0 || extent.height == 0 {
                debug!("surface has no area, dropping swapchain");
                self.destroy_swapchain();
                return Ok(());
            }

            let modes = surface_loader
                .get_physical_device_surface_present_modes(phys, surface)
                .map_err(DisplayError::vulkan("get_physical_device_surface_present_modes"))?;
            let present_mode = choose_present_mode(&modes, self.window.vsync);

            let old_swapchain = self.swapchain;
            let swap_info = vk::SwapchainCreateInfoKHR {
                s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
                surface,
                min_image_count: choose_image_count(&caps),
                image_format: self.surface_format.format,
                image_color_space: self.surface_format.color_space,
                image_extent: extent,
                image_array_layers: 1,
                image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                image_sharing_mode: vk::SharingMode::EXCLUSIVE,
                pre_transform: caps.current_transform,
                composite_alpha: choose_composite_alpha(caps.supported_composite_alpha),
                present_mode,
                clipped: vk::TRUE,
                old_swapchain,
                ..Default::default()
            };
            let created = self.loader.create_swapchain(&swap_info, None);
            self.destroy_swapchain();
            self.swapchain = created.map_err(DisplayError::vulkan("create_swapchain"))?;
            self.extent = extent;

            let images = self
                .loader
                .get_swapchain_images(self.swapchain)
                .map_err(DisplayError::vulkan("get_swapchain_images"))?;
            self.create_targets(&images)?;

            info!(
                width = extent.width,
                height = extent.height,
                mode = ?present_mode,
                images = images.len(),
                "swapchain ready"
            );
        }
        Ok(())
    }

    unsafe fn create_targets(&mut self, images: &[vk::Image]) -> DisplayResult<()> {
        let device = self.ctx.device();
        for &image in images {
            let iv_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: self.surface_format.format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            let view = device
                .create_image_view(&iv_info, None)
                .map_err(DisplayError::allocation("swapchain image view"))?;
            self.views.push(view);

            let fb_info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: self.render_pass,
                attachment_count: 1,
                p_attachments: &view,
                width: self.extent.width,
                height: self.extent.height,
                layers: 1,
                ..Default::default()
            };
            let framebuffer = device
                .create_framebuffer(&fb_info, None)
                .map_err(DisplayError::allocation("framebuffer"))?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    unsafe fn destroy_targets(&mut self) {
        let device = self.ctx.device();
        for fb in self.framebuffers.drain(..) {
            device.destroy_framebuffer(fb, None);
        }
        for iv in self.views.drain(..) {
            device.destroy_image_view(iv, None);
        }
    }

    unsafe fn destroy_swapchain(&mut self) {
        if self.swapchain != vk::SwapchainKHR::null() {
            self.loader.destroy_swapchain(self.swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }

    /// Returns the image index and whether the swapchain is suboptimal.
    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> DisplayResult<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
        }
        .map_err(DisplayError::vulkan("acquire_next_image"))
    }

    /// Queues `image_index` for presentation. Returns whether the swapchain
    /// is suboptimal.
    pub fn present(&self, wait: vk::Semaphore, image_index: u32) -> DisplayResult<bool> {
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        unsafe { self.loader.queue_present(self.ctx.queue(), &present) }
            .map_err(DisplayError::vulkan("queue_present"))
    }
}

impl Drop for PresentationContext {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().device_wait_idle().ok();
            self.destroy_targets();
            self.destroy_swapchain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn test_zero_area_window_never_presents() {
        assert!(can_present(true, WindowParameters::new(800, 600, true)));
        assert!(!can_present(true, WindowParameters::new(0, 600, true)));
        assert!(!can_present(true, WindowParameters::new(800, 0, false)));
        assert!(!can_present(false, WindowParameters::new(800, 600, true)));
    }

    #[test]
    fn test_surface_format_prefers_bgra_srgb() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
    }

    #[test]
    fn test_surface_format_falls_back_to_first() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_UNORM)
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_surface_format_undefined_means_any() {
        let formats = [format(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
    }

    #[test]
    fn test_present_mode_vsync() {
        use vk::PresentModeKHR as M;
        assert_eq!(choose_present_mode(&[M::MAILBOX, M::FIFO], true), M::FIFO);
        assert_eq!(
            choose_present_mode(&[M::IMMEDIATE, M::FIFO_RELAXED], true),
            M::FIFO_RELAXED
        );
        assert_eq!(choose_present_mode(&[M::IMMEDIATE], true), M::IMMEDIATE);
    }

    #[test]
    fn test_present_mode_no_vsync() {
        use vk::PresentModeKHR as M;
        assert_eq!(
            choose_present_mode(&[M::FIFO, M::IMMEDIATE, M::MAILBOX], false),
            M::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[M::FIFO, M::IMMEDIATE], false),
            M::IMMEDIATE
        );
        assert_eq!(choose_present_mode(&[M::FIFO], false), M::FIFO);
        assert_eq!(choose_present_mode(&[], false), M::FIFO);
    }

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
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
    fn test_extent_uses_surface_size_when_fixed() {
        let caps = caps((800, 600), (1, 1), (4096, 4096));
        let extent = clamp_extent(&caps, WindowParameters::new(1024, 768, true));
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_extent_clamps_window_size() {
        let caps = caps((u32::MAX, u32::MAX), (64, 64), (2048, 1024));
        let extent = clamp_extent(&caps, WindowParameters::new(4000, 10, true));
        assert_eq!((extent.width, extent.height), (2048, 64));
    }

    #[test]
    fn test_composite_alpha_first_supported() {
        use vk::CompositeAlphaFlagsKHR as A;
        assert_eq!(choose_composite_alpha(A::OPAQUE | A::INHERIT), A::OPAQUE);
        assert_eq!(
            choose_composite_alpha(A::INHERIT | A::PRE_MULTIPLIED),
            A::PRE_MULTIPLIED
        );
        assert_eq!(choose_composite_alpha(A::empty()), A::OPAQUE);
    }

    #[test]
    fn test_image_count_one_above_minimum() {
        let mut c = caps((1, 1), (1, 1), (1, 1));
        c.min_image_count = 2;
        c.max_image_count = 0;
        assert_eq!(choose_image_count(&c), 3);
        c.max_image_count = 2;
        assert_eq!(choose_image_count(&c), 2);
    }
}
