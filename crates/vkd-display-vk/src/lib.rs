// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend for the display pipeline.
//!
//! [`VkDisplay`] owns the device, a pool of linear host-visible transfer
//! images and the swapchain, and implements [`vkd_display::Presenter`].

mod device;
mod display;
mod error;
mod pipeline;
mod slots;
mod swapchain;
mod transfer_image;

pub use device::{list_gpus, DeviceContext, GpuInfo};
pub use display::{DisplayConfig, VkDisplay};
pub use error::{DisplayError, DisplayResult, FailureLatch};
pub use swapchain::{
    can_present, choose_composite_alpha, choose_image_count, choose_present_mode,
    choose_surface_format, clamp_extent, PresentationContext,
};
pub use transfer_image::{vk_format, ImageAccessState, LayoutTransition, TransferImage};
