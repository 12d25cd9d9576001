//! Queue submission and swapchain image ownership transfer

use ash::{vk, Device};

use super::sync::{Fence, Semaphore};
use crate::vulkan::initialization::{DeviceAccess, QueueHandle};
use crate::vulkan::resources::{CommandBuffer, CommandPool};
use crate::vulkan::state::swapchain::color_subresource_range;
use crate::vulkan::{VulkanError, VulkanResult};

/// Stage graphics work waits at for a swapchain image to become available
pub const GRAPHICS_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;

/// Stage presentation-queue work waits at for rendering to finish
pub const PRESENTATION_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::ALL_COMMANDS;

/// One command buffer plus the semaphores it waits on and signals
#[derive(Debug, Clone, Default)]
pub struct SubmitBatch {
    command_buffers: Vec<vk::CommandBuffer>,
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stages: Vec<vk::PipelineStageFlags>,
    signal_semaphores: Vec<vk::Semaphore>,
}

impl SubmitBatch {
    /// Batch submitting `command_buffer` with no semaphores
    pub fn new(command_buffer: vk::CommandBuffer) -> Self {
        Self {
            command_buffers: vec![command_buffer],
            ..Self::default()
        }
    }

    /// Wait on `semaphore` at `stage` before executing
    pub fn wait(mut self, semaphore: Option<&Semaphore>, stage: vk::PipelineStageFlags) -> Self {
        if let Some(semaphore) = semaphore {
            self.wait_semaphores.push(semaphore.handle());
            self.wait_stages.push(stage);
        }
        self
    }

    /// Signal `semaphore` once execution completes
    pub fn signal(mut self, semaphore: Option<&Semaphore>) -> Self {
        if let Some(semaphore) = semaphore {
            self.signal_semaphores.push(semaphore.handle());
        }
        self
    }

    /// Submit info pointing into this batch; valid while the batch is alive
    pub fn info(&self) -> vk::SubmitInfo {
        vk::SubmitInfo::builder()
            .command_buffers(&self.command_buffers)
            .wait_semaphores(&self.wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .signal_semaphores(&self.signal_semaphores)
            .build()
    }

    /// Submit to `queue`, signaling `fence` on completion
    pub fn submit(&self, device: &Device, queue: vk::Queue, fence: Option<&Fence>) -> VulkanResult<()> {
        let fence = fence.map_or_else(vk::Fence::null, Fence::handle);
        unsafe {
            device
                .queue_submit(queue, &[self.info()], fence)
                .map_err(|e| {
                    log::error!("Queue submission failed: {e:?}");
                    VulkanError::Submission(e)
                })
        }
    }
}

impl DeviceAccess {
    /// Submit to the graphics queue, waiting at COLOR_ATTACHMENT_OUTPUT
    pub fn submit_graphics(
        &self,
        command_buffer: vk::CommandBuffer,
        wait: Option<&Semaphore>,
        signal: Option<&Semaphore>,
        fence: Option<&Fence>,
    ) -> VulkanResult<()> {
        let queue = self.queues().graphics()?;
        SubmitBatch::new(command_buffer)
            .wait(wait, GRAPHICS_WAIT_STAGE)
            .signal(signal)
            .submit(self.device(), queue.queue, fence)
    }

    /// Submit to the compute queue
    pub fn submit_compute(
        &self,
        command_buffer: vk::CommandBuffer,
        wait: Option<&Semaphore>,
        signal: Option<&Semaphore>,
        fence: Option<&Fence>,
    ) -> VulkanResult<()> {
        let queue = self.queues().compute()?;
        SubmitBatch::new(command_buffer)
            .wait(wait, vk::PipelineStageFlags::COMPUTE_SHADER)
            .signal(signal)
            .submit(self.device(), queue.queue, fence)
    }

    /// Submit to the presentation queue, waiting at ALL_COMMANDS
    pub fn submit_presentation(
        &self,
        command_buffer: vk::CommandBuffer,
        wait: Option<&Semaphore>,
        signal: Option<&Semaphore>,
        fence: Option<&Fence>,
    ) -> VulkanResult<()> {
        let queue = self.queues().presentation()?;
        SubmitBatch::new(command_buffer)
            .wait(wait, PRESENTATION_WAIT_STAGE)
            .signal(signal)
            .submit(self.device(), queue.queue, fence)
    }
}

/// Barrier handing a presentable image from the graphics family to the present family
pub fn ownership_transfer_barrier(image: vk::Image, graphics_family: u32, present_family: u32) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(graphics_family)
        .dst_queue_family_index(present_family)
        .image(image)
        .subresource_range(color_subresource_range())
        .build()
}

/// Record the ownership transfer of `image` from graphics to presentation
///
/// Record it on both queues: once on graphics to release, once on
/// presentation to acquire.
pub fn cmd_transfer_image_ownership(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    graphics_family: u32,
    present_family: u32,
) {
    let barrier = ownership_transfer_barrier(image, graphics_family, present_family);
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Presentation-queue command buffer that acquires swapchain images
///
/// Only exists when presentation runs on its own queue family; with a
/// shared family no ownership transfer is needed.
pub struct PresentationOwnership {
    access: DeviceAccess,
    command_buffer: CommandBuffer,
    graphics: QueueHandle,
    // Destroyed after the command buffer it allocated
    _pool: CommandPool,
}

impl PresentationOwnership {
    /// Create the pool and command buffer, or `None` when families are shared
    pub fn new(access: &DeviceAccess) -> VulkanResult<Option<Self>> {
        if !access.queues().presentation_is_separate() {
            return Ok(None);
        }
        let graphics = access.queues().graphics()?;
        let presentation = access.queues().presentation()?;

        let pool = CommandPool::new(access.device(), presentation.family)?;
        let command_buffer = pool.allocate()?;
        log::debug!(
            "Presentation ownership transfer enabled: family {} -> {}",
            graphics.family,
            presentation.family
        );

        Ok(Some(Self {
            access: access.clone(),
            command_buffer,
            graphics,
            _pool: pool,
        }))
    }

    /// Acquire `image` on the presentation queue after rendering finished
    pub fn acquire_image_ownership(
        &mut self,
        image: vk::Image,
        rendering_done: Option<&Semaphore>,
        ownership_done: Option<&Semaphore>,
        fence: Option<&Fence>,
    ) -> VulkanResult<()> {
        let presentation = self.access.queues().presentation()?;
        let command_buffer = self.command_buffer.begin_one_time()?;
        cmd_transfer_image_ownership(
            self.access.device(),
            command_buffer,
            image,
            self.graphics.family,
            presentation.family,
        );
        self.command_buffer.end()?;

        self.access
            .submit_presentation(command_buffer, rendering_done, ownership_done, fence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_empty_batch_has_no_semaphores() {
        let batch = SubmitBatch::new(vk::CommandBuffer::from_raw(1))
            .wait(None, GRAPHICS_WAIT_STAGE)
            .signal(None);
        let info = batch.info();
        assert_eq!(info.command_buffer_count, 1);
        assert_eq!(info.wait_semaphore_count, 0);
        assert_eq!(info.signal_semaphore_count, 0);
    }

    #[test]
    fn test_stage_constants() {
        assert_eq!(PRESENTATION_WAIT_STAGE, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(GRAPHICS_WAIT_STAGE, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    }

    #[test]
    fn test_ownership_barrier() {
        let image = vk::Image::from_raw(7);
        let barrier = ownership_transfer_barrier(image, 0, 2);
        assert_eq!(barrier.src_queue_family_index, 0);
        assert_eq!(barrier.dst_queue_family_index, 2);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::empty());
        assert_eq!(barrier.old_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(barrier.image, image);
        assert_eq!(barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(barrier.subresource_range.level_count, 1);
    }
}
