//! Command pools and command buffer recording

use ash::{vk, Device};

use crate::vulkan::handle::{destroy, OwnedHandle};
use crate::vulkan::{VulkanError, VulkanResult};

/// Command pool wrapper with RAII cleanup
///
/// Destroying the pool frees every command buffer allocated from it.
#[derive(Debug)]
pub struct CommandPool {
    command_pool: OwnedHandle<vk::CommandPool>,
    queue_family_index: u32,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset individually
    pub fn new(device: &Device, queue_family_index: u32) -> VulkanResult<Self> {
        Self::with_flags(device, queue_family_index, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
    }

    /// Create a pool with explicit creation flags
    pub fn with_flags(
        device: &Device,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(flags)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device.create_command_pool(&pool_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            command_pool: OwnedHandle::new(device, command_pool, destroy::command_pool),
            queue_family_index,
        })
    }

    /// Allocate raw primary command buffers
    pub fn allocate_command_buffers(&self, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool.raw())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe {
            self.command_pool.device().allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)
        }
    }

    /// Allocate one primary command buffer wrapped for recording
    pub fn allocate(&self) -> VulkanResult<CommandBuffer> {
        let command_buffer = self
            .allocate_command_buffers(1)?
            .pop()
            .ok_or_else(|| VulkanError::invalid("driver returned no command buffer"))?;
        Ok(CommandBuffer::new(command_buffer, self.command_pool.device().clone()))
    }

    /// Family the pool allocates for
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool.raw()
    }
}

/// Command buffer with tracked recording state
pub struct CommandBuffer {
    command_buffer: vk::CommandBuffer,
    device: Device,
    recording: bool,
}

impl CommandBuffer {
    /// Wrap a command buffer allocated elsewhere
    pub fn new(command_buffer: vk::CommandBuffer, device: Device) -> Self {
        Self {
            command_buffer,
            device,
            recording: false,
        }
    }

    /// Begin recording for a single submission
    pub fn begin_one_time(&mut self) -> VulkanResult<vk::CommandBuffer> {
        self.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    }

    /// Begin recording with explicit usage flags
    pub fn begin(&mut self, flags: vk::CommandBufferUsageFlags) -> VulkanResult<vk::CommandBuffer> {
        if self.recording {
            return Err(VulkanError::InvalidOperation {
                reason: "Command buffer already recording".to_string(),
            });
        }

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);

        unsafe {
            self.device.begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        self.recording = true;
        Ok(self.command_buffer)
    }

    /// End command recording
    pub fn end(&mut self) -> VulkanResult<vk::CommandBuffer> {
        if !self.recording {
            return Err(VulkanError::InvalidOperation {
                reason: "Command buffer not recording".to_string(),
            });
        }

        // The buffer leaves the recording state even if the driver reports an error
        self.recording = false;
        unsafe {
            self.device.end_command_buffer(self.command_buffer)
                .map_err(VulkanError::Api)?;
        }

        Ok(self.command_buffer)
    }

    /// Whether `begin` has been called without a matching `end`
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Get the command buffer handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
}
