//! Vulkan initialization components

pub mod context;
pub mod device;
pub mod instance;
pub mod lifecycle;
pub mod queue_family;
pub mod surface;

pub use context::{ContextOperation, ContextState, DeviceContext};
pub use device::{DeviceAccess, DeviceCapabilities, DeviceQueues, LogicalDevice, QueueHandle};
pub use instance::{InstanceNames, InstanceSettings, VulkanInstance, VALIDATION_LAYER};
pub use lifecycle::{LifecycleBus, LifecycleEvent, LifecycleObserver};
pub use queue_family::{
    resolve_queue_families, QueueFamilyCache, QueueFamilyCapabilities, QueueFamilyIndices, QueueFamilySlot,
    QueueRequest,
};
pub use surface::{required_surface_extensions, Surface};
