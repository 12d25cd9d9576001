//! Vulkan error types
//!
//! Every fallible operation in the crate returns [`VulkanResult`]. Callers
//! branch on three outcomes: success, a recoverable swapchain state, or a
//! fatal error that must not be retried.

use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// The Vulkan loader library could not be opened
    #[error("Failed to load Vulkan entry points: {0}")]
    Loading(String),

    /// `vkCreateInstance` failed
    #[error("Instance creation failed: {0:?}")]
    InstanceCreation(vk::Result),

    /// A required instance/device layer or extension is not available
    #[error("Required layer or extension not available: {name}")]
    MissingLayerOrExtension {
        /// Name of the missing layer or extension
        name: String,
    },

    /// The instance reported no physical devices at all
    #[error("No Vulkan physical device available")]
    NoPhysicalDevice,

    /// A required queue family could not be found on the physical device
    #[error("No compatible queue family: {reason}")]
    NoCompatibleQueueFamily {
        /// Which capability was missing
        reason: String,
    },

    /// `vkCreateDevice` failed
    #[error("Device creation failed: {0:?}")]
    DeviceCreation(vk::Result),

    /// Swapchain creation or recreation failed
    #[error("Swapchain creation failed: {0:?}")]
    SwapchainCreation(vk::Result),

    /// The swapchain stayed out of date after the automatic recreate
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    /// The surface backing the swapchain is gone
    #[error("Surface lost")]
    SurfaceLost,

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Binding memory to a buffer or image failed
    #[error("Memory bind failed: {0:?}")]
    BindFailed(vk::Result),

    /// Queue submission failed
    #[error("Command submission failed: {0:?}")]
    Submission(vk::Result),

    /// A staged transfer's fence was not signaled in time
    ///
    /// The command buffer may still be executing; the next transfer waits
    /// for it before reusing the buffer.
    #[error("Staged transfer did not complete within {timeout_ns} ns")]
    TransferTimeout {
        /// Timeout that elapsed
        timeout_ns: u64,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

impl VulkanError {
    /// Shorthand for [`VulkanError::InvalidOperation`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }

    /// Hardware/driver mismatches that no retry can fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoPhysicalDevice | Self::NoCompatibleQueueFamily { .. } | Self::Loading(_)
        )
    }

    /// States the caller can recover from by skipping the frame
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SwapchainOutOfDate => true,
            other => matches!(
                other.result_code(),
                Some(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR)
            ),
        }
    }

    /// The raw driver code behind this error, if there is one
    pub fn result_code(&self) -> Option<vk::Result> {
        match self {
            Self::Api(code)
            | Self::InstanceCreation(code)
            | Self::DeviceCreation(code)
            | Self::SwapchainCreation(code)
            | Self::BindFailed(code)
            | Self::Submission(code) => Some(*code),
            Self::SurfaceLost => Some(vk::Result::ERROR_SURFACE_LOST_KHR),
            Self::TransferTimeout { .. } => Some(vk::Result::TIMEOUT),
            _ => None,
        }
    }

    /// Maps surface-specific driver codes onto dedicated variants
    pub(crate) fn from_surface_result(code: vk::Result) -> Self {
        match code {
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            other => Self::Api(other),
        }
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Outcome of an operation that may be legitimately skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    /// The swapchain is usable
    Ready,
    /// The surface has a zero extent (minimized window); nothing was touched
    Skipped,
}

impl SwapchainStatus {
    /// Whether the operation actually ran
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(VulkanError::NoPhysicalDevice.is_fatal());
        assert!(VulkanError::NoCompatibleQueueFamily { reason: "graphics".into() }.is_fatal());
        assert!(!VulkanError::NoSuitableMemoryType.is_fatal());
        assert!(!VulkanError::Api(vk::Result::ERROR_DEVICE_LOST).is_fatal());
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(VulkanError::SwapchainOutOfDate.is_recoverable());
        assert!(VulkanError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR).is_recoverable());
        assert!(!VulkanError::Api(vk::Result::ERROR_DEVICE_LOST).is_recoverable());
        assert!(!VulkanError::invalid("nope").is_recoverable());
    }

    #[test]
    fn test_surface_result_mapping() {
        assert!(matches!(
            VulkanError::from_surface_result(vk::Result::ERROR_SURFACE_LOST_KHR),
            VulkanError::SurfaceLost
        ));
        assert_eq!(
            VulkanError::SurfaceLost.result_code(),
            Some(vk::Result::ERROR_SURFACE_LOST_KHR)
        );
    }

    #[test]
    fn test_transfer_timeout_classification() {
        let err = VulkanError::TransferTimeout { timeout_ns: 5 };
        assert_eq!(err.result_code(), Some(vk::Result::TIMEOUT));
        assert!(!err.is_fatal());
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("5 ns"));
    }
}
