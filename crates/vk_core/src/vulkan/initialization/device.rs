//! Physical device capabilities and logical device creation

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::vk;
use ash::{Device, Instance};
use std::ffi::{CStr, CString};

use super::queue_family::{QueueFamilyIndices, QueueFamilySlot};
use crate::vulkan::{VulkanError, VulkanResult};

/// Properties captured from the physical device when the logical device is created
#[derive(Clone, Copy)]
pub struct DeviceCapabilities {
    /// Physical device the logical device was created from
    pub physical_device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Every feature the physical device supports; all of them are enabled on the logical device
    pub features: vk::PhysicalDeviceFeatures,
}

impl DeviceCapabilities {
    /// Query everything from the driver
    pub fn query(instance: &Instance, physical_device: vk::PhysicalDevice) -> Self {
        unsafe {
            Self {
                physical_device,
                properties: instance.get_physical_device_properties(physical_device),
                memory_properties: instance.get_physical_device_memory_properties(physical_device),
                features: instance.get_physical_device_features(physical_device),
            }
        }
    }

    /// Human-readable device name
    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Granularity of flushes and invalidations on non-coherent memory
    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    /// Minimum offset alignment for uniform buffer bindings
    pub fn min_uniform_buffer_alignment(&self) -> vk::DeviceSize {
        self.properties.limits.min_uniform_buffer_offset_alignment
    }

    /// Minimum offset alignment for storage buffer bindings
    pub fn min_storage_buffer_alignment(&self) -> vk::DeviceSize {
        self.properties.limits.min_storage_buffer_offset_alignment
    }
}

/// A queue and the family it was fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHandle {
    /// Queue family index
    pub family: u32,
    /// Queue handle
    pub queue: vk::Queue,
}

/// The up to three queues a logical device was created with; they may alias
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceQueues {
    /// Graphics queue, also used for staged transfers
    pub graphics: Option<QueueHandle>,
    /// Presentation queue
    pub presentation: Option<QueueHandle>,
    /// Compute queue
    pub compute: Option<QueueHandle>,
}

impl DeviceQueues {
    /// Graphics queue or an error naming the missing capability
    pub fn graphics(&self) -> VulkanResult<QueueHandle> {
        self.graphics.ok_or_else(|| VulkanError::invalid("device was created without a graphics queue"))
    }

    /// Compute queue or an error naming the missing capability
    pub fn compute(&self) -> VulkanResult<QueueHandle> {
        self.compute.ok_or_else(|| VulkanError::invalid("device was created without a compute queue"))
    }

    /// Presentation queue or an error naming the missing capability
    pub fn presentation(&self) -> VulkanResult<QueueHandle> {
        self.presentation
            .ok_or_else(|| VulkanError::invalid("device was created without a presentation queue"))
    }

    /// Whether presentation happens on a different family than graphics
    pub fn presentation_is_separate(&self) -> bool {
        match (self.graphics, self.presentation) {
            (Some(graphics), Some(presentation)) => graphics.family != presentation.family,
            _ => false,
        }
    }
}

/// Everything a resource needs to talk to the device
///
/// Cloned into the resources and pipelines built from a context; dependent
/// objects must be dropped before the context terminates the device.
#[derive(Clone)]
pub struct DeviceAccess {
    device: Device,
    instance: Instance,
    capabilities: DeviceCapabilities,
    queues: DeviceQueues,
}

impl DeviceAccess {
    /// Logical device dispatch table
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Instance dispatch table, for physical-device queries
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Captured physical device properties
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Queues the device was created with
    pub fn queues(&self) -> &DeviceQueues {
        &self.queues
    }

    /// Block until the whole device is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device.device_wait_idle().map_err(VulkanError::Api) }
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    access: DeviceAccess,
    indices: QueueFamilyIndices,
    swapchain_loader: Option<SwapchainLoader>,
    extensions: Vec<CString>,
}

impl LogicalDevice {
    /// Create a logical device with one queue per distinct family in `indices`
    ///
    /// The swapchain extension is enabled whenever a presentation family was
    /// resolved.
    pub fn new(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        indices: QueueFamilyIndices,
        extra_extensions: &[CString],
    ) -> VulkanResult<Self> {
        let unique_families = indices.unique_families();
        if unique_families.is_empty() {
            return Err(VulkanError::invalid("no queue family was resolved for the device"));
        }

        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&[1.0])
                    .build()
            })
            .collect();

        let mut extensions: Vec<CString> = extra_extensions.to_vec();
        let wants_swapchain = indices.presentation.index().is_some();
        if wants_swapchain && !extensions.iter().any(|name| name.as_c_str() == SwapchainLoader::name()) {
            extensions.push(SwapchainLoader::name().to_owned());
        }
        let extension_ptrs: Vec<*const std::os::raw::c_char> =
            extensions.iter().map(|name| name.as_ptr()).collect();

        let capabilities = DeviceCapabilities::query(instance, physical_device);
        let features = capabilities.features;

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&features);

        let device = unsafe {
            instance.create_device(physical_device, &create_info, None)
                .map_err(VulkanError::DeviceCreation)?
        };

        let fetch = |slot: QueueFamilySlot| {
            slot.index().map(|family| QueueHandle {
                family,
                queue: unsafe { device.get_device_queue(family, 0) },
            })
        };
        let queues = DeviceQueues {
            graphics: fetch(indices.graphics),
            presentation: fetch(indices.presentation),
            compute: fetch(indices.compute),
        };

        let swapchain_loader = wants_swapchain.then(|| SwapchainLoader::new(instance, &device));

        log::info!(
            "Logical device created on {} (Vulkan {}.{}.{}), queues: {:?}",
            capabilities.device_name(),
            vk::api_version_major(capabilities.properties.api_version),
            vk::api_version_minor(capabilities.properties.api_version),
            vk::api_version_patch(capabilities.properties.api_version),
            queues
        );

        Ok(Self {
            access: DeviceAccess {
                device,
                instance: instance.clone(),
                capabilities,
                queues,
            },
            indices,
            swapchain_loader,
            extensions,
        })
    }

    /// Shared device access handle
    pub fn access(&self) -> &DeviceAccess {
        &self.access
    }

    /// Logical device dispatch table
    pub fn device(&self) -> &Device {
        &self.access.device
    }

    /// Queue family indices the device was created for
    pub fn indices(&self) -> QueueFamilyIndices {
        self.indices
    }

    /// Swapchain extension loader, present when presentation was requested
    pub fn swapchain_loader(&self) -> Option<&SwapchainLoader> {
        self.swapchain_loader.as_ref()
    }

    /// Device extensions that were enabled
    pub fn extensions(&self) -> &[CString] {
        &self.extensions
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            // Ensure device is idle before destruction
            let _ = self.access.device.device_wait_idle();
            self.access.device.destroy_device(None);
        }
        log::debug!("Logical device destroyed");
    }
}
