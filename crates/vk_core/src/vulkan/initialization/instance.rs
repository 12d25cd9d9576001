//! Vulkan instance creation, layer/extension bookkeeping and validation output

use ash::extensions::ext::DebugUtils;
use ash::vk;
use ash::{Entry, Instance};
use std::ffi::{CStr, CString};

use crate::vulkan::{VulkanError, VulkanResult};

/// Khronos validation layer name
pub const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

const ENGINE_NAME: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"vk_core\0") };

/// Ordered, de-duplicated instance layer and extension names
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstanceNames {
    layers: Vec<CString>,
    extensions: Vec<CString>,
}

impl InstanceNames {
    /// Create empty name lists
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a layer; duplicates are ignored
    pub fn add_layer(&mut self, name: &CStr) {
        push_unique(&mut self.layers, name);
    }

    /// Request an extension; duplicates are ignored
    pub fn add_extension(&mut self, name: &CStr) {
        push_unique(&mut self.extensions, name);
    }

    /// Requested layers in insertion order
    pub fn layers(&self) -> &[CString] {
        &self.layers
    }

    /// Requested extensions in insertion order
    pub fn extensions(&self) -> &[CString] {
        &self.extensions
    }

    /// Whether a layer was requested
    pub fn has_layer(&self, name: &CStr) -> bool {
        self.layers.iter().any(|layer| layer.as_c_str() == name)
    }

    /// Whether an extension was requested
    pub fn has_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|extension| extension.as_c_str() == name)
    }

    /// Drop names the driver does not offer and return what was dropped
    pub fn retain_available(
        &mut self,
        available_layers: &[CString],
        available_extensions: &[CString],
    ) -> Vec<CString> {
        let mut dropped = Vec::new();
        for (names, available) in [
            (&mut self.layers, available_layers),
            (&mut self.extensions, available_extensions),
        ] {
            names.retain(|name| {
                let keep = available.contains(name);
                if !keep {
                    dropped.push(name.clone());
                }
                keep
            });
        }
        dropped
    }

    /// First requested name the driver does not offer, if any
    pub fn first_missing(
        &self,
        available_layers: &[CString],
        available_extensions: &[CString],
    ) -> Option<&CStr> {
        self.layers
            .iter()
            .find(|name| !available_layers.contains(name))
            .or_else(|| self.extensions.iter().find(|name| !available_extensions.contains(name)))
            .map(CString::as_c_str)
    }
}

fn push_unique(names: &mut Vec<CString>, name: &CStr) {
    if !names.iter().any(|existing| existing.as_c_str() == name) {
        names.push(name.to_owned());
    }
}

/// Layers the loader reports as installed
pub fn available_layers(entry: &Entry) -> VulkanResult<Vec<CString>> {
    let properties = entry.enumerate_instance_layer_properties().map_err(VulkanError::Api)?;
    Ok(properties
        .iter()
        .map(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }.to_owned())
        .collect())
}

/// Instance extensions the loader and implicit layers report
pub fn available_extensions(entry: &Entry) -> VulkanResult<Vec<CString>> {
    let properties = entry
        .enumerate_instance_extension_properties(None)
        .map_err(VulkanError::Api)?;
    Ok(properties
        .iter()
        .map(|extension| unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) }.to_owned())
        .collect())
}

/// Highest instance API version the loader supports
pub fn latest_api_version(entry: &Entry) -> u32 {
    match entry.try_enumerate_instance_version() {
        Ok(Some(version)) => version,
        _ => vk::API_VERSION_1_0,
    }
}

/// Application-facing instance parameters
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    /// Application name reported to the driver
    pub application_name: String,
    /// Packed application version
    pub application_version: u32,
    /// Packed API version to request
    pub api_version: u32,
    /// Enable the validation layer and debug-utils messenger when available
    pub enable_validation: bool,
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    instance: Instance,
    names: InstanceNames,
    api_version: u32,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create an instance with the requested names plus validation if enabled
    ///
    /// Validation is best-effort: a missing validation layer or debug-utils
    /// extension is logged and skipped. Anything else in `names` the driver
    /// does not offer fails with [`VulkanError::MissingLayerOrExtension`].
    pub fn new(entry: &Entry, settings: &InstanceSettings, mut names: InstanceNames) -> VulkanResult<Self> {
        let layers = available_layers(entry)?;
        let extensions = available_extensions(entry)?;

        if settings.enable_validation {
            if layers.iter().any(|layer| layer.as_c_str() == VALIDATION_LAYER) {
                names.add_layer(VALIDATION_LAYER);
            } else {
                log::warn!("Validation requested but {VALIDATION_LAYER:?} is not installed");
            }
            if extensions.iter().any(|extension| extension.as_c_str() == DebugUtils::name()) {
                names.add_extension(DebugUtils::name());
            } else {
                log::warn!("Validation requested but {:?} is not available", DebugUtils::name());
            }
        }

        if let Some(missing) = names.first_missing(&layers, &extensions) {
            return Err(VulkanError::MissingLayerOrExtension {
                name: missing.to_string_lossy().into_owned(),
            });
        }

        let app_name = CString::new(settings.application_name.as_str())
            .map_err(|e| VulkanError::InitializationFailed(format!("Invalid application name: {e}")))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(settings.application_version)
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(settings.api_version);

        let layer_ptrs: Vec<*const std::os::raw::c_char> =
            names.layers().iter().map(|name| name.as_ptr()).collect();
        let extension_ptrs: Vec<*const std::os::raw::c_char> =
            names.extensions().iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        let instance = unsafe {
            entry.create_instance(&create_info, None)
                .map_err(VulkanError::InstanceCreation)?
        };

        let debug_utils = if names.has_extension(DebugUtils::name()) {
            let loader = DebugUtils::new(entry, &instance);
            match Self::setup_debug_messenger(&loader) {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::info!(
            "Vulkan instance created (API {}.{}), layers: {:?}, extensions: {:?}",
            vk::api_version_major(settings.api_version),
            vk::api_version_minor(settings.api_version),
            names.layers(),
            names.extensions()
        );

        Ok(Self {
            instance,
            names,
            api_version: settings.api_version,
            debug_utils,
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils.create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    /// Instance dispatch table
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Layers and extensions the instance was created with
    pub fn names(&self) -> &InstanceNames {
        &self.names
    }

    /// API version the instance was created for
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// Whether validation output is routed to the log
    pub fn has_debug_messenger(&self) -> bool {
        self.debug_utils.is_some()
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::debug!("Vulkan instance destroyed");
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        log::info!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(names: &[&str]) -> Vec<CString> {
        names.iter().map(|name| CString::new(*name).unwrap()).collect()
    }

    #[test]
    fn test_names_are_deduplicated() {
        let mut names = InstanceNames::new();
        names.add_layer(VALIDATION_LAYER);
        names.add_layer(VALIDATION_LAYER);
        names.add_extension(DebugUtils::name());
        names.add_extension(DebugUtils::name());

        assert_eq!(names.layers().len(), 1);
        assert_eq!(names.extensions().len(), 1);
        assert!(names.has_layer(VALIDATION_LAYER));
    }

    #[test]
    fn test_retain_available_reports_dropped() {
        let mut names = InstanceNames::new();
        names.add_layer(VALIDATION_LAYER);
        names.add_extension(&CString::new("VK_KHR_surface").unwrap());
        names.add_extension(&CString::new("VK_KHR_fictional").unwrap());

        let dropped = names.retain_available(&[], &owned(&["VK_KHR_surface"]));
        assert_eq!(dropped, owned(&["VK_LAYER_KHRONOS_validation", "VK_KHR_fictional"]));
        assert!(names.layers().is_empty());
        assert_eq!(names.extensions(), owned(&["VK_KHR_surface"]).as_slice());
    }

    #[test]
    fn test_first_missing() {
        let mut names = InstanceNames::new();
        names.add_extension(&CString::new("VK_KHR_surface").unwrap());
        assert_eq!(names.first_missing(&[], &owned(&["VK_KHR_surface"])), None);

        names.add_extension(&CString::new("VK_KHR_xcb_surface").unwrap());
        let missing = names.first_missing(&[], &owned(&["VK_KHR_surface"]));
        assert_eq!(missing.map(|n| n.to_str().unwrap()), Some("VK_KHR_xcb_surface"));
    }
}
