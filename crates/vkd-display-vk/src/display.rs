// SPDX-License-Identifier: CEPL-1.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info, warn};
use vkd_display::{
    fit, DisplayOutcome, ImageDescription, ImageHandle, ImagePool, NextFrame, PoolImage,
    Presenter, RenderArea, WindowParameters, WindowSource,
};

use crate::device::{DeviceContext, GpuInfo};
use crate::error::{DisplayError, DisplayResult, FailureLatch};
use crate::pipeline::{QuadPipeline, QUAD_VERTICES};
use crate::slots::{FrameSlots, Slot};
use crate::swapchain::{query_surface_format, PresentationContext};
use crate::transfer_image::{ImageAccessState, TransferImage};

/// Swapchain acquisitions tried per frame while the swapchain keeps going
/// out of date.
const MAX_ACQUIRE_ATTEMPTS: usize = 4;

#[derive(Clone, Debug)]
pub struct DisplayConfig {
    /// Transfer images, and so frames that can be in flight at once.
    pub frames_in_flight: usize,
    /// Index into the enumerated GPUs; `None` picks automatically.
    pub gpu_index: Option<usize>,
    pub validation: bool,
    pub clear_color: [f32; 4],
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            gpu_index: None,
            validation: cfg!(debug_assertions),
            clear_color: [0.01, 0.01, 0.01, 1.0],
        }
    }
}

/// Whether `display` has to look at the window before drawing.
fn needs_refresh(resized: bool, stale: bool, ready: bool) -> bool {
    resized || stale || !ready
}

/// An invalidated swapchain is rebuilt even at an unchanged size, but never
/// for a window without area.
fn forces_rebuild(rebuilt: bool, invalidated: bool, window: WindowParameters) -> bool {
    !rebuilt && invalidated && !window.is_degenerate()
}

/// Everything the display thread touches while talking to the GPU.
// Field order is drop order: framebuffers before the render pass they use.
struct PresentState {
    swapchain: PresentationContext,
    slots: FrameSlots,
    pipeline: QuadPipeline,
    clear: vk::ClearValue,
    last_description: Option<ImageDescription>,
    area: RenderArea,
    area_dirty: bool,
    /// A present reported the swapchain suboptimal or out of date.
    stale: bool,
}

/// Vulkan presentation engine.
pub struct VkDisplay {
    pool: ImagePool<TransferImage>,
    present: Mutex<PresentState>,
    window: Arc<dyn WindowSource>,
    resized: AtomicBool,
    failed: FailureLatch,
    ctx: Arc<DeviceContext>,
}

impl VkDisplay {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        window_source: Arc<dyn WindowSource>,
        config: DisplayConfig,
    ) -> DisplayResult<Self> {
        let ctx = Arc::new(DeviceContext::new(
            window,
            display,
            config.gpu_index,
            config.validation,
        )?);
        let count = config.frames_in_flight.max(1);

        let surface_format = query_surface_format(&ctx)?;
        let pipeline = QuadPipeline::new(Arc::clone(&ctx), surface_format.format)?;
        let slots = FrameSlots::new(Arc::clone(&ctx), pipeline.set_layout(), count)?;
        let swapchain = PresentationContext::new(
            Arc::clone(&ctx),
            surface_format,
            pipeline.render_pass(),
            window_source.window_parameters(),
        )?;
        let images = (0..count)
            .map(|index| TransferImage::new(Arc::clone(&ctx), index))
            .collect::<DisplayResult<Vec<_>>>()?;

        info!(frames_in_flight = count, "display ready");
        Ok(Self {
            pool: ImagePool::new(images),
            present: Mutex::new(PresentState {
                swapchain,
                slots,
                pipeline,
                clear: vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: config.clear_color,
                    },
                },
                last_description: None,
                area: RenderArea::default(),
                area_dirty: true,
                stale: false,
            }),
            window: window_source,
            resized: AtomicBool::new(false),
            failed: FailureLatch::default(),
            ctx,
        })
    }

    pub fn gpu(&self) -> &GpuInfo {
        self.ctx.gpu()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.pool.capacity()
    }

    fn display_next(&self) -> DisplayResult<DisplayOutcome> {
        let degenerate = {
            let mut state = self.present.lock();
            self.refresh_swapchain(&mut state)?;
            !state.swapchain.is_ready()
        };

        let mut frame = match self.pool.next_for_display(degenerate) {
            NextFrame::Frame(frame) => frame,
            NextFrame::Discarded => return Ok(DisplayOutcome::Discarded),
            NextFrame::Idle => return Ok(DisplayOutcome::Idle),
            NextFrame::Shutdown => return Ok(DisplayOutcome::Shutdown),
        };
        frame.apply_transform();
        let mut image = frame.into_image();

        let presented = {
            let mut state = self.present.lock();
            self.present_image(&mut state, &mut image)
        };

        // Submitted images still have GPU work pending; hand out idle ones first.
        if image.fence_pending() {
            self.pool.recycle(image);
        } else {
            self.pool.release(image);
        }

        Ok(if presented? {
            DisplayOutcome::Presented
        } else {
            DisplayOutcome::Discarded
        })
    }

    /// Applies pending window changes and rebuilds a stale swapchain.
    fn refresh_swapchain(&self, state: &mut PresentState) -> DisplayResult<()> {
        let resized = self.resized.swap(false, Ordering::AcqRel);
        if !needs_refresh(resized, state.stale, state.swapchain.is_ready()) {
            return Ok(());
        }

        let window = self.window.window_parameters();
        let mut rebuilt = state.swapchain.update(window)?;
        if forces_rebuild(rebuilt, state.stale, window) {
            state.swapchain.rebuild()?;
            rebuilt = true;
        }
        if rebuilt {
            state.stale = false;
            state.area_dirty = true;
        }
        Ok(())
    }

    /// Returns `Ok(false)` when the frame was dropped without GPU work.
    fn present_image(
        &self,
        state: &mut PresentState,
        image: &mut TransferImage,
    ) -> DisplayResult<bool> {
        self.refresh_swapchain(state)?;
        let Some(description) = image.description() else {
            return Ok(false);
        };

        let slot = state.slots.slot(image.pool_index());
        let Some(image_index) = self.acquire_swapchain_image(state, slot.image_acquired)? else {
            return Ok(false);
        };

        if state.area_dirty || state.last_description != Some(description) {
            let extent = state.swapchain.extent();
            state.area = fit(
                (extent.width, extent.height),
                (description.width, description.height),
            );
            state.last_description = Some(description);
            state.area_dirty = false;
            debug!(area = ?state.area, "render area");
        }

        image.refresh_binding(slot.descriptor_set, state.pipeline.sampler());
        unsafe { self.record(state, image, slot, image_index)? };
        self.submit(image, slot)?;

        match state.swapchain.present(slot.image_rendered, image_index) {
            Ok(false) => {}
            Ok(true) => {
                warn!("present reported a suboptimal swapchain");
                state.stale = true;
            }
            Err(DisplayError::SwapchainInvalidated) => {
                warn!("swapchain went out of date during present");
                state.stale = true;
            }
            Err(err) => return Err(err),
        }
        Ok(true)
    }

    fn acquire_swapchain_image(
        &self,
        state: &mut PresentState,
        signal: vk::Semaphore,
    ) -> DisplayResult<Option<u32>> {
        for attempt in 0..MAX_ACQUIRE_ATTEMPTS {
            if !state.swapchain.is_ready() {
                debug!("nothing to present into, dropping frame");
                return Ok(None);
            }
            match state.swapchain.acquire_next_image(signal) {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        debug!("acquired from a suboptimal swapchain");
                        state.stale = true;
                    }
                    return Ok(Some(index));
                }
                Err(DisplayError::SwapchainInvalidated) => {
                    debug!(attempt, "swapchain out of date, rebuilding");
                    let window = self.window.window_parameters();
                    let rebuilt = state.swapchain.update(window)?;
                    if forces_rebuild(rebuilt, true, window) {
                        state.swapchain.rebuild()?;
                    }
                    state.stale = false;
                    state.area_dirty = true;
                }
                Err(err) => return Err(err),
            }
        }
        warn!(
            attempts = MAX_ACQUIRE_ATTEMPTS,
            "swapchain stayed out of date, dropping frame"
        );
        Ok(None)
    }

    unsafe fn record(
        &self,
        state: &PresentState,
        image: &mut TransferImage,
        slot: Slot,
        image_index: u32,
    ) -> DisplayResult<()> {
        let d = self.ctx.device();
        let cmd = slot.command_buffer;

        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        d.begin_command_buffer(cmd, &begin)
            .map_err(DisplayError::vulkan("begin_command_buffer"))?;

        let (src, dst, to_read) = image.barrier(ImageAccessState::SHADER_READ);
        d.cmd_pipeline_barrier(
            cmd,
            src,
            dst,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_read],
        );

        let clears = [state.clear];
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: state.pipeline.render_pass(),
            framebuffer: state.swapchain.framebuffer(image_index),
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: state.swapchain.extent(),
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);

        let area = state.area;
        let viewport = vk::Viewport {
            x: area.x as f32,
            y: area.y as f32,
            width: area.width as f32,
            height: area.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: area.x as i32,
                y: area.y as i32,
            },
            extent: vk::Extent2D {
                width: area.width,
                height: area.height,
            },
        };
        let layout = state.pipeline.layout();
        d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, state.pipeline.pipeline());
        d.cmd_set_viewport(cmd, 0, &[viewport]);
        d.cmd_set_scissor(cmd, 0, &[scissor]);
        d.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            layout,
            0,
            &[slot.descriptor_set],
            &[],
        );
        d.cmd_push_constants(
            cmd,
            layout,
            vk::ShaderStageFlags::FRAGMENT,
            0,
            bytemuck::bytes_of(&area),
        );
        d.cmd_draw(cmd, QUAD_VERTICES, 1, 0, 0);
        d.cmd_end_render_pass(cmd);

        let (src, dst, to_host) = image.barrier(ImageAccessState::HOST_WRITE);
        d.cmd_pipeline_barrier(
            cmd,
            src,
            dst,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_host],
        );

        d.end_command_buffer(cmd)
            .map_err(DisplayError::vulkan("end_command_buffer"))
    }

    fn submit(&self, image: &mut TransferImage, slot: Slot) -> DisplayResult<()> {
        let fence = image.begin_submission()?;
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &slot.image_acquired,
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &slot.command_buffer,
            signal_semaphore_count: 1,
            p_signal_semaphores: &slot.image_rendered,
            ..Default::default()
        };
        unsafe {
            self.ctx
                .device()
                .queue_submit(self.ctx.queue(), std::slice::from_ref(&submit), fence)
        }
        .map_err(DisplayError::vulkan("queue_submit"))?;
        image.mark_in_use();
        Ok(())
    }
}

impl Presenter for VkDisplay {
    type Image = TransferImage;
    type Error = DisplayError;

    fn acquire(&self, description: ImageDescription) -> DisplayResult<ImageHandle<TransferImage>> {
        self.failed.ensure_usable()?;
        self.failed.check(self.pool.acquire(description))
    }

    fn queue(&self, handle: ImageHandle<TransferImage>) {
        self.pool.queue(handle);
    }

    fn copy_and_queue(&self, pixels: &[u8], description: ImageDescription) -> DisplayResult<()> {
        self.failed.ensure_usable()?;
        self.failed.check(self.pool.copy_and_queue(pixels, description))
    }

    fn display(&self) -> DisplayResult<DisplayOutcome> {
        self.failed.ensure_usable()?;
        self.failed.check(self.display_next())
    }

    fn notify_resize(&self) {
        self.resized.store(true, Ordering::Release);
    }

    fn shutdown(&self) {
        debug!("shutdown requested");
        self.pool.shutdown();
    }
}

impl Drop for VkDisplay {
    fn drop(&mut self) {
        unsafe { self.ctx.device().device_wait_idle().ok() };
        info!("display released");
    }
}
