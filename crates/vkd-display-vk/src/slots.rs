// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::vk;

use crate::device::DeviceContext;
use crate::error::{DisplayError, DisplayResult};

/// Per-image GPU objects, looked up by pool index.
#[derive(Clone, Copy, Debug)]
pub struct Slot {
    pub command_buffer: vk::CommandBuffer,
    pub descriptor_set: vk::DescriptorSet,
    pub image_acquired: vk::Semaphore,
    pub image_rendered: vk::Semaphore,
}

/// One [`Slot`] for each transfer image, stored as parallel arrays.
pub struct FrameSlots {
    ctx: Arc<DeviceContext>,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    image_acquired: Vec<vk::Semaphore>,
    image_rendered: Vec<vk::Semaphore>,
}

impl FrameSlots {
    pub fn new(
        ctx: Arc<DeviceContext>,
        set_layout: vk::DescriptorSetLayout,
        count: usize,
    ) -> DisplayResult<Self> {
        let mut this = Self {
            ctx,
            command_pool: vk::CommandPool::null(),
            command_buffers: Vec::new(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            image_acquired: Vec::with_capacity(count),
            image_rendered: Vec::with_capacity(count),
        };
        unsafe { this.allocate(set_layout, count)? };
        Ok(this)
    }

    unsafe fn allocate(
        &mut self,
        set_layout: vk::DescriptorSetLayout,
        count: usize,
    ) -> DisplayResult<()> {
        let device = self.ctx.device();

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: self.ctx.queue_family(),
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        self.command_pool = device
            .create_command_pool(&pool_info, None)
            .map_err(DisplayError::allocation("command pool"))?;
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count as u32,
            ..Default::default()
        };
        self.command_buffers = device
            .allocate_command_buffers(&alloc_info)
            .map_err(DisplayError::allocation("command buffers"))?;

        let pool_size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: count as u32,
        };
        let desc_pool_info = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: count as u32,
            pool_size_count: 1,
            p_pool_sizes: &pool_size,
            ..Default::default()
        };
        self.descriptor_pool = device
            .create_descriptor_pool(&desc_pool_info, None)
            .map_err(DisplayError::allocation("descriptor pool"))?;
        let layouts = vec![set_layout; count];
        let set_info = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: layouts.len() as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        self.descriptor_sets = device
            .allocate_descriptor_sets(&set_info)
            .map_err(DisplayError::allocation("descriptor sets"))?;

        let sem_info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        for _ in 0..count {
            let acquired = device
                .create_semaphore(&sem_info, None)
                .map_err(DisplayError::allocation("semaphore"))?;
            self.image_acquired.push(acquired);
            let rendered = device
                .create_semaphore(&sem_info, None)
                .map_err(DisplayError::allocation("semaphore"))?;
            self.image_rendered.push(rendered);
        }
        Ok(())
    }

    pub fn slot(&self, index: usize) -> Slot {
        Slot {
            command_buffer: self.command_buffers[index],
            descriptor_set: self.descriptor_sets[index],
            image_acquired: self.image_acquired[index],
            image_rendered: self.image_rendered[index],
        }
    }
}

impl Drop for FrameSlots {
    fn drop(&mut self) {
        unsafe {
            let d = self.ctx.device();
            for &s in self.image_acquired.iter().chain(&self.image_rendered) {
                d.destroy_semaphore(s, None);
            }
            // Sets and buffers go with their pools.
            d.destroy_descriptor_pool(self.descriptor_pool, None);
            if !self.command_buffers.is_empty() {
                d.free_command_buffers(self.command_pool, &self.command_buffers);
            }
            d.destroy_command_pool(self.command_pool, None);
        }
    }
}
