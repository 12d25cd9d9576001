//! Vulkan backend
//!
//! Organized into initialization, resources, state and transfer modules.

/// Driver error taxonomy
pub mod error;

/// Move-only RAII wrapper for device-owned handles
pub mod handle;

/// Instance, surface, device and the root context
pub mod initialization;

/// Memory, buffers, images and command recording
pub mod resources;

/// Swapchain, synchronization, barriers and submission
pub mod state;

/// Staged uploads and read-backs
pub mod transfer;

pub use error::{SwapchainStatus, VulkanError, VulkanResult};
pub use initialization::{ContextState, DeviceAccess, DeviceContext, LifecycleEvent};
pub use transfer::TransferPipeline;
