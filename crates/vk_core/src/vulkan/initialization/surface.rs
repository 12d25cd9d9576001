//! Vulkan surface management
//!
//! The windowing toolkit stays outside the crate: a surface is created from
//! raw window/display handles, or adopted from an existing `vk::SurfaceKHR`.

use ash::extensions::khr;
use ash::{vk, Entry, Instance};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

use crate::vulkan::{VulkanError, VulkanResult};

/// Instance extensions needed to present on `display`
pub fn required_surface_extensions(display: RawDisplayHandle) -> VulkanResult<Vec<&'static CStr>> {
    let names = ash_window::enumerate_required_extensions(display).map_err(VulkanError::Api)?;
    Ok(names
        .iter()
        .map(|&name| unsafe { CStr::from_ptr(name) })
        .collect())
}

/// Vulkan surface wrapper for presentation
pub struct Surface {
    surface_loader: khr::Surface,
    surface: vk::SurfaceKHR,
}

impl Surface {
    /// Create a new surface from raw platform handles
    pub fn from_handles(
        entry: &Entry,
        instance: &Instance,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> VulkanResult<Self> {
        let surface = unsafe {
            ash_window::create_surface(entry, instance, display, window, None)
                .map_err(|e| VulkanError::InitializationFailed(format!("Failed to create surface: {e:?}")))?
        };
        log::debug!("Surface created from window handles");
        Ok(Self::adopt(entry, instance, surface))
    }

    /// Take ownership of a surface created elsewhere
    pub fn adopt(entry: &Entry, instance: &Instance, surface: vk::SurfaceKHR) -> Self {
        Self {
            surface_loader: khr::Surface::new(entry, instance),
            surface,
        }
    }

    /// Get the underlying surface handle
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Get the surface loader
    pub fn loader(&self) -> &khr::Surface {
        &self.surface_loader
    }

    /// Get surface capabilities for a physical device
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .map_err(VulkanError::from_surface_result)
        }
    }

    /// Get surface formats for a physical device
    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .map_err(VulkanError::from_surface_result)
        }
    }

    /// Get surface present modes for a physical device
    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .map_err(VulkanError::from_surface_result)
        }
    }

    /// Check if a queue family supports presentation to this surface
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family_index: u32) -> VulkanResult<bool> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(physical_device, queue_family_index, self.surface)
                .map_err(VulkanError::from_surface_result)
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
        log::debug!("Surface destroyed");
    }
}
