//! Vulkan synchronization primitives for GPU/CPU coordination
//!
//! RAII wrappers for fences, semaphores and events, all built on
//! [`OwnedHandle`] so ownership is exclusive and move-only.
//!
//! ## Which primitive to use
//!
//! - [`Fence`]: CPU waits for GPU completion. Staged transfers block on one.
//! - [`Semaphore`]: GPU-only ordering between queue submissions and present.
//! - [`Event`]: split barrier inside or across command buffers, settable from
//!   either the host or the device, waited on with explicit barrier lists.
//!
//! ```text
//! Queue A: [Work] -> Signal Semaphore ->
//! Queue B:          Wait Semaphore -> [Work]
//! ```

use ash::vk;
use ash::Device;

use crate::vulkan::handle::{destroy, OwnedHandle};
use crate::vulkan::{VulkanError, VulkanResult};

/// Memory barrier builder for common synchronization patterns
///
/// Feeds the memory barrier lists of [`Event::cmd_wait`] and plain pipeline
/// barriers around transfer work.
pub struct MemoryBarrierBuilder;

impl MemoryBarrierBuilder {
    /// Host write → Transfer read barrier (staging buffer filled by the CPU)
    pub fn host_write_to_transfer_read() -> vk::MemoryBarrier {
        vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::HOST_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .build()
    }

    /// Transfer write → Vertex attribute read barrier (vertex buffer uploads)
    pub fn transfer_write_to_vertex_read() -> vk::MemoryBarrier {
        vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::VERTEX_ATTRIBUTE_READ)
            .build()
    }

    /// Transfer write → Host read barrier (readback into a staging buffer)
    pub fn transfer_write_to_host_read() -> vk::MemoryBarrier {
        vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .build()
    }

    /// Compute shader write → Shader read barrier (compute to graphics)
    pub fn shader_write_to_shader_read() -> vk::MemoryBarrier {
        vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .build()
    }
}

/// Non-blocking fence poll result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The GPU has signaled the fence
    Signaled,
    /// Work guarded by the fence is still pending
    Unsignaled,
}

impl From<bool> for FenceStatus {
    fn from(signaled: bool) -> Self {
        if signaled {
            Self::Signaled
        } else {
            Self::Unsignaled
        }
    }
}

/// Fence wrapper with RAII cleanup
#[derive(Debug)]
pub struct Fence {
    fence: OwnedHandle<vk::Fence>,
}

impl Fence {
    /// Create a new fence
    pub fn new(device: &Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe {
            device.create_fence(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            fence: OwnedHandle::new(device, fence, destroy::fence),
        })
    }

    /// Block until the fence is signaled
    pub fn wait(&self) -> VulkanResult<()> {
        self.wait_timeout(u64::MAX).map(|_| ())
    }

    /// Wait up to `timeout_ns`; `Ok(false)` means the wait timed out
    pub fn wait_timeout(&self, timeout_ns: u64) -> VulkanResult<bool> {
        let result = unsafe {
            self.fence.device().wait_for_fences(&[self.fence.raw()], true, timeout_ns)
        };
        match result {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    /// Reset fence
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe {
            self.fence.device().reset_fences(&[self.fence.raw()])
                .map_err(VulkanError::Api)
        }
    }

    /// Wait for the fence, then reset it for reuse
    pub fn wait_and_reset(&self) -> VulkanResult<()> {
        self.wait()?;
        self.reset()
    }

    /// Poll the fence without blocking; `Err` means the query itself failed
    pub fn status(&self) -> VulkanResult<FenceStatus> {
        unsafe {
            self.fence.device().get_fence_status(self.fence.raw())
                .map(FenceStatus::from)
                .map_err(VulkanError::Api)
        }
    }

    /// Get the fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence.raw()
    }
}

/// GPU-GPU synchronization primitive with automatic resource management
///
/// Consumed only by queue submission and present calls.
#[derive(Debug)]
pub struct Semaphore {
    semaphore: OwnedHandle<vk::Semaphore>,
}

impl Semaphore {
    /// Create a new binary semaphore
    pub fn new(device: &Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = unsafe {
            device.create_semaphore(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            semaphore: OwnedHandle::new(device, semaphore, destroy::semaphore),
        })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore.raw()
    }
}

/// Barrier lists attached to [`Event::cmd_wait`]
#[derive(Debug, Default, Clone)]
pub struct EventBarriers {
    /// Global memory barriers
    pub memory: Vec<vk::MemoryBarrier>,
    /// Buffer range barriers
    pub buffer: Vec<vk::BufferMemoryBarrier>,
    /// Image subresource barriers
    pub image: Vec<vk::ImageMemoryBarrier>,
}

impl EventBarriers {
    /// Only global memory barriers
    pub fn memory(barriers: impl Into<Vec<vk::MemoryBarrier>>) -> Self {
        Self {
            memory: barriers.into(),
            ..Self::default()
        }
    }

    /// Whether no barrier of any kind is attached
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffer.is_empty() && self.image.is_empty()
    }
}

/// Event wrapper: a signal that can be set and waited on mid-command-buffer
#[derive(Debug)]
pub struct Event {
    event: OwnedHandle<vk::Event>,
}

impl Event {
    /// Create a new event in the unset state
    pub fn new(device: &Device) -> VulkanResult<Self> {
        let create_info = vk::EventCreateInfo::builder();

        let event = unsafe {
            device.create_event(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            event: OwnedHandle::new(device, event, destroy::event),
        })
    }

    /// Set the event from the host
    pub fn set(&self) -> VulkanResult<()> {
        unsafe {
            self.event.device().set_event(self.event.raw())
                .map_err(VulkanError::Api)
        }
    }

    /// Reset the event from the host
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe {
            self.event.device().reset_event(self.event.raw())
                .map_err(VulkanError::Api)
        }
    }

    /// Whether the event is currently set
    pub fn status(&self) -> VulkanResult<bool> {
        unsafe {
            self.event.device().get_event_status(self.event.raw())
                .map_err(VulkanError::Api)
        }
    }

    /// Record a device-side set once `stage` completes
    pub fn cmd_set(&self, command_buffer: vk::CommandBuffer, stage: vk::PipelineStageFlags) {
        unsafe {
            self.event.device().cmd_set_event(command_buffer, self.event.raw(), stage);
        }
    }

    /// Record a device-side reset once `stage` completes
    pub fn cmd_reset(&self, command_buffer: vk::CommandBuffer, stage: vk::PipelineStageFlags) {
        unsafe {
            self.event.device().cmd_reset_event(command_buffer, self.event.raw(), stage);
        }
    }

    /// Record a wait on this event, applying `barriers` once it is set
    pub fn cmd_wait(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barriers: &EventBarriers,
    ) {
        unsafe {
            self.event.device().cmd_wait_events(
                command_buffer,
                &[self.event.raw()],
                src_stage,
                dst_stage,
                &barriers.memory,
                &barriers.buffer,
                &barriers.image,
            );
        }
    }

    /// Get the event handle
    pub fn handle(&self) -> vk::Event {
        self.event.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_status_from_query() {
        assert_eq!(FenceStatus::from(true), FenceStatus::Signaled);
        assert_eq!(FenceStatus::from(false), FenceStatus::Unsignaled);
    }

    #[test]
    fn test_staging_barrier_masks() {
        let barrier = MemoryBarrierBuilder::host_write_to_transfer_read();
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::HOST_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::TRANSFER_READ);

        let readback = MemoryBarrierBuilder::transfer_write_to_host_read();
        assert_eq!(readback.dst_access_mask, vk::AccessFlags::HOST_READ);
    }

    #[test]
    fn test_event_barrier_lists() {
        let empty = EventBarriers::default();
        assert!(empty.is_empty());

        let barriers = EventBarriers::memory(vec![MemoryBarrierBuilder::shader_write_to_shader_read()]);
        assert!(!barriers.is_empty());
        assert_eq!(barriers.memory.len(), 1);
        assert!(barriers.image.is_empty());
    }
}
