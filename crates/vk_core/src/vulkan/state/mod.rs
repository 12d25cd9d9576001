//! Vulkan state management

pub mod barrier;
pub mod recreate;
pub mod submit;
pub mod swapchain;
pub mod sync;

pub use barrier::{cmd_blit_image, cmd_copy_buffer_to_image, BarrierPlan, ImageBarrier};
pub use recreate::SwapchainHost;
pub use submit::{PresentationOwnership, SubmitBatch};
pub use swapchain::{Swapchain, SwapchainSettings};
pub use sync::{Event, EventBarriers, Fence, FenceStatus, MemoryBarrierBuilder, Semaphore};
