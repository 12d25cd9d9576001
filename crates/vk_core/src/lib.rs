//! # vk_core
//!
//! Vulkan device, swapchain and resource lifecycle core.
//!
//! ## Features
//!
//! - **Device context**: instance, queue families, logical device and
//!   swapchain brought up in order, with lifecycle observers
//! - **Swapchain recovery**: one automatic recreate on stale acquire/present;
//!   a minimized window is skipped rather than treated as an error
//! - **Resources**: buffers and images built by create, allocate, bind
//! - **Transfers**: direct host writes or staged copies fenced on the
//!   graphics queue, plus blit-based texture uploads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vk_core::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut context = DeviceContext::new(ContextConfig::new("quick start"))?;
//!     context.create_instance()?;
//!     context.select_first_suitable()?;
//!     context.create_device()?;
//!
//!     let access = context.access()?.clone();
//!     let mut transfer = TransferPipeline::new(&access)?;
//!     let vertices = VertexBuffer::new(&access, 1024, vk::BufferUsageFlags::empty())?;
//!     transfer.transfer_data(vertices.resource(), &[0u8; 1024], 0)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod vulkan;

/// Common imports for crate users
pub mod prelude {
    pub use crate::{
        config::{Config, ConfigError, ContextConfig},
        foundation::logging::{init_logging, init_logging_with_level},
        vulkan::{
            initialization::{DeviceAccess, DeviceContext, LifecycleEvent},
            resources::{
                BufferResource, DescriptorPool, DescriptorSetLayoutBuilder, DeviceLocalBuffer, ImageResource,
                IndexBuffer, Sampler, SamplerSettings, ShaderModule, StorageBuffer, UniformBuffer, VertexBuffer,
            },
            state::{Fence, ImageBarrier, Semaphore},
            transfer::{StridedCopy, TransferPipeline, TransferSettings},
            SwapchainStatus, VulkanError, VulkanResult,
        },
    };
    pub use ash::vk;
}
