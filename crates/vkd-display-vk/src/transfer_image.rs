// SPDX-License-Identifier: CEPL-1.0
//! Host-writable images that carry producer pixels to the GPU.
//!
//! Images use linear tiling in host-visible, host-coherent memory, so a
//! producer writes straight into the mapping and the fragment shader samples
//! the same allocation. No staging copy is involved.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};
use vkd_display::{ImageDescription, PixelFormat, PoolImage};

use crate::device::DeviceContext;
use crate::error::{DisplayError, DisplayResult};
use crate::pipeline::FRAME_BINDING;

pub fn vk_format(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        PixelFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        PixelFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        PixelFormat::Rgba16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
    }
}

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Layout and access mask the image was last left in by recorded commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageAccessState {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
}

/// One pipeline barrier moving an image between access states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub from: ImageAccessState,
    pub to: ImageAccessState,
}

impl ImageAccessState {
    /// Freshly created linear image, contents written by the host.
    pub const PREINITIALIZED: Self = Self {
        layout: vk::ImageLayout::PREINITIALIZED,
        access: vk::AccessFlags::HOST_WRITE,
    };
    pub const SHADER_READ: Self = Self {
        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        access: vk::AccessFlags::SHADER_READ,
    };
    pub const HOST_WRITE: Self = Self {
        layout: vk::ImageLayout::GENERAL,
        access: vk::AccessFlags::HOST_WRITE,
    };

    /// Records a move to `to` and returns the barrier that performs it.
    pub fn transition(&mut self, to: ImageAccessState) -> LayoutTransition {
        let from = std::mem::replace(self, to);
        LayoutTransition {
            src_stage: stage_for(from.access),
            dst_stage: stage_for(to.access),
            from,
            to,
        }
    }
}

fn stage_for(access: vk::AccessFlags) -> vk::PipelineStageFlags {
    if access.intersects(vk::AccessFlags::HOST_READ | vk::AccessFlags::HOST_WRITE) {
        vk::PipelineStageFlags::HOST
    } else if access.contains(vk::AccessFlags::SHADER_READ) {
        vk::PipelineStageFlags::FRAGMENT_SHADER
    } else {
        vk::PipelineStageFlags::TOP_OF_PIPE
    }
}

impl LayoutTransition {
    pub fn image_barrier(&self, image: vk::Image) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
            src_access_mask: self.from.access,
            dst_access_mask: self.to.access,
            old_layout: self.from.layout,
            new_layout: self.to.layout,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            subresource_range: COLOR_RANGE,
            ..Default::default()
        }
    }
}

pub struct TransferImage {
    ctx: Arc<DeviceContext>,
    index: usize,
    description: Option<ImageDescription>,

    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    mapped: *mut u8,
    mapped_len: usize,
    row_pitch: usize,
    access: ImageAccessState,

    fence: vk::Fence,
    fence_pending: bool,
    descriptor_dirty: bool,
}

// SAFETY: `mapped` points into memory this image owns exclusively; the
// image moves between threads as a whole and is never shared.
unsafe impl Send for TransferImage {}

impl TransferImage {
    /// An unallocated image for pool slot `index`. Storage is created on
    /// first acquire.
    pub fn new(ctx: Arc<DeviceContext>, index: usize) -> DisplayResult<Self> {
        let fence_info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let fence = unsafe { ctx.device().create_fence(&fence_info, None) }
            .map_err(DisplayError::allocation("transfer fence"))?;

        Ok(Self {
            ctx,
            index,
            description: None,
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            mapped: std::ptr::null_mut(),
            mapped_len: 0,
            row_pitch: 0,
            access: ImageAccessState::PREINITIALIZED,
            fence,
            fence_pending: false,
            descriptor_dirty: true,
        })
    }

    pub fn fence_pending(&self) -> bool {
        self.fence_pending
    }

    /// Moves the image to `to` in recorded-command terms and returns the
    /// stage masks and barrier to record.
    pub fn barrier(
        &mut self,
        to: ImageAccessState,
    ) -> (
        vk::PipelineStageFlags,
        vk::PipelineStageFlags,
        vk::ImageMemoryBarrier<'static>,
    ) {
        let transition = self.access.transition(to);
        (
            transition.src_stage,
            transition.dst_stage,
            transition.image_barrier(self.image),
        )
    }

    /// Points the slot's descriptor set at this image's view if it changed
    /// since it was last bound.
    pub fn refresh_binding(&mut self, set: vk::DescriptorSet, sampler: vk::Sampler) {
        if !self.descriptor_dirty {
            return;
        }
        let info = vk::DescriptorImageInfo {
            sampler,
            image_view: self.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: set,
            dst_binding: FRAME_BINDING,
            dst_array_element: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            p_image_info: &info,
            ..Default::default()
        };
        unsafe {
            self.ctx
                .device()
                .update_descriptor_sets(std::slice::from_ref(&write), &[])
        };
        self.descriptor_dirty = false;
    }

    /// Resets the completion fence ahead of a submission that will signal it.
    pub fn begin_submission(&mut self) -> DisplayResult<vk::Fence> {
        unsafe { self.ctx.device().reset_fences(&[self.fence]) }
            .map_err(DisplayError::vulkan("reset_fences"))?;
        Ok(self.fence)
    }

    /// The submission signalling this image's fence was accepted.
    pub fn mark_in_use(&mut self) {
        self.fence_pending = true;
    }

    unsafe fn allocate(&mut self, description: ImageDescription) -> DisplayResult<()> {
        if description.width == 0 || description.height == 0 {
            return Err(DisplayError::Allocation {
                what: "zero-sized transfer image",
                result: vk::Result::ERROR_INITIALIZATION_FAILED,
            });
        }
        let device = self.ctx.device();
        let format = vk_format(description.format);
        let features = self.ctx.format_properties(format).linear_tiling_features;
        if !features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE) {
            return Err(DisplayError::Allocation {
                what: "linearly sampled transfer image",
                result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
            });
        }

        let image_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: description.width,
                height: description.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::LINEAR,
            usage: vk::ImageUsageFlags::SAMPLED,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::PREINITIALIZED,
            ..Default::default()
        };
        self.image = device
            .create_image(&image_ci, None)
            .map_err(DisplayError::allocation("transfer image"))?;

        let requirements = device.get_image_memory_requirements(self.image);
        let memory_type = self
            .ctx
            .find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .ok_or(DisplayError::NoHostVisibleMemory)?;
        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: requirements.size,
            memory_type_index: memory_type,
            ..Default::default()
        };
        self.memory = device
            .allocate_memory(&alloc, None)
            .map_err(DisplayError::allocation("transfer image memory"))?;
        device
            .bind_image_memory(self.image, self.memory, 0)
            .map_err(DisplayError::allocation("bind transfer image memory"))?;

        let layout = device.get_image_subresource_layout(
            self.image,
            vk::ImageSubresource {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                array_layer: 0,
            },
        );
        let base = device
            .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            .map_err(DisplayError::allocation("map transfer image memory"))?;
        self.mapped = base.cast::<u8>().add(layout.offset as usize);
        self.mapped_len = layout.size as usize;
        self.row_pitch = layout.row_pitch as usize;

        let view_ci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: self.image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: COLOR_RANGE,
            ..Default::default()
        };
        self.view = device
            .create_image_view(&view_ci, None)
            .map_err(DisplayError::allocation("transfer image view"))?;

        self.access = ImageAccessState::PREINITIALIZED;
        self.descriptor_dirty = true;
        self.description = Some(description);
        Ok(())
    }

    /// Frees the image, view and memory. The fence is kept.
    unsafe fn release_storage(&mut self) {
        let device = self.ctx.device();
        if self.view != vk::ImageView::null() {
            device.destroy_image_view(self.view, None);
            self.view = vk::ImageView::null();
        }
        if self.image != vk::Image::null() {
            device.destroy_image(self.image, None);
            self.image = vk::Image::null();
        }
        if self.memory != vk::DeviceMemory::null() {
            if !self.mapped.is_null() {
                device.unmap_memory(self.memory);
            }
            device.free_memory(self.memory, None);
            self.memory = vk::DeviceMemory::null();
        }
        self.mapped = std::ptr::null_mut();
        self.mapped_len = 0;
        self.row_pitch = 0;
        self.description = None;
    }
}

impl PoolImage for TransferImage {
    type Error = DisplayError;

    fn pool_index(&self) -> usize {
        self.index
    }

    fn description(&self) -> Option<ImageDescription> {
        self.description
    }

    fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    fn pixels_mut(&mut self) -> &mut [u8] {
        if self.mapped.is_null() {
            return &mut [];
        }
        // SAFETY: the mapping stays valid until `release_storage`, which
        // needs `&mut self`, and this image is its only owner.
        unsafe { std::slice::from_raw_parts_mut(self.mapped, self.mapped_len) }
    }

    fn wait_until_free(&mut self) -> DisplayResult<()> {
        if !self.fence_pending {
            return Ok(());
        }
        unsafe {
            self.ctx
                .device()
                .wait_for_fences(&[self.fence], true, u64::MAX)
        }
        .map_err(DisplayError::vulkan("wait_for_fences"))?;
        self.fence_pending = false;
        Ok(())
    }

    fn create(&mut self, description: ImageDescription) -> DisplayResult<()> {
        debug!(
            index = self.index,
            width = description.width,
            height = description.height,
            format = ?description.format,
            "allocating transfer image"
        );
        unsafe {
            self.release_storage();
            let result = self.allocate(description);
            if result.is_err() {
                self.release_storage();
            }
            result
        }
    }
}

impl Drop for TransferImage {
    fn drop(&mut self) {
        if let Err(err) = self.wait_until_free() {
            warn!(index = self.index, %err, "transfer image dropped while in use");
        }
        unsafe {
            self.release_storage();
            self.ctx.device().destroy_fence(self.fence, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_then_return_to_host() {
        let mut state = ImageAccessState::PREINITIALIZED;

        let to_read = state.transition(ImageAccessState::SHADER_READ);
        assert_eq!(to_read.from.layout, vk::ImageLayout::PREINITIALIZED);
        assert_eq!(to_read.to.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(to_read.src_stage, vk::PipelineStageFlags::HOST);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(state, ImageAccessState::SHADER_READ);

        let to_host = state.transition(ImageAccessState::HOST_WRITE);
        assert_eq!(to_host.from, ImageAccessState::SHADER_READ);
        assert_eq!(to_host.to.layout, vk::ImageLayout::GENERAL);
        assert_eq!(to_host.src_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(to_host.dst_stage, vk::PipelineStageFlags::HOST);
    }

    #[test]
    fn test_second_frame_starts_from_general() {
        let mut state = ImageAccessState::PREINITIALIZED;
        state.transition(ImageAccessState::SHADER_READ);
        state.transition(ImageAccessState::HOST_WRITE);
        let next = state.transition(ImageAccessState::SHADER_READ);
        assert_eq!(next.from.layout, vk::ImageLayout::GENERAL);
        assert_eq!(next.from.access, vk::AccessFlags::HOST_WRITE);
    }

    #[test]
    fn test_barrier_fields() {
        let mut state = ImageAccessState::PREINITIALIZED;
        let barrier = state
            .transition(ImageAccessState::SHADER_READ)
            .image_barrier(vk::Image::null());
        assert_eq!(barrier.old_layout, vk::ImageLayout::PREINITIALIZED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::HOST_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.subresource_range.layer_count, 1);
    }

    #[test]
    fn test_pixel_formats_map() {
        assert_eq!(vk_format(PixelFormat::Rgba8Srgb), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(vk_format(PixelFormat::Bgra8Unorm), vk::Format::B8G8R8A8_UNORM);
        assert_eq!(
            vk_format(PixelFormat::Rgba16Sfloat),
            vk::Format::R16G16B16A16_SFLOAT
        );
    }
}
