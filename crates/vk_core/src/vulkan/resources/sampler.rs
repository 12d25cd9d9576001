//! Texture samplers

use ash::vk;

use crate::vulkan::handle::{destroy, OwnedHandle};
use crate::vulkan::initialization::DeviceAccess;
use crate::vulkan::{VulkanError, VulkanResult};

/// Sampler creation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerSettings {
    /// Magnification filter
    pub mag_filter: vk::Filter,
    /// Minification filter
    pub min_filter: vk::Filter,
    /// Filter between mip levels
    pub mipmap_mode: vk::SamplerMipmapMode,
    /// Addressing on all three axes
    pub address_mode: vk::SamplerAddressMode,
    /// Requested anisotropy; `None` disables anisotropic filtering
    pub max_anisotropy: Option<f32>,
    /// Smallest mip level that may be sampled
    pub min_lod: f32,
    /// Largest mip level that may be sampled
    pub max_lod: f32,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

impl SamplerSettings {
    /// Nearest filtering with clamped addressing
    pub fn nearest_clamped() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            ..Self::default()
        }
    }

    /// Request anisotropic filtering
    pub fn with_anisotropy(mut self, max_anisotropy: f32) -> Self {
        self.max_anisotropy = Some(max_anisotropy);
        self
    }

    /// Check the settings against what the device supports
    ///
    /// `device_max_anisotropy` is `None` when the feature is not enabled.
    pub fn validate(&self, device_max_anisotropy: Option<f32>) -> VulkanResult<()> {
        if self.min_lod < 0.0 || self.max_lod < self.min_lod {
            return Err(VulkanError::invalid(format!(
                "sampler LOD range [{}, {}] is invalid",
                self.min_lod, self.max_lod
            )));
        }
        if let Some(requested) = self.max_anisotropy {
            let Some(limit) = device_max_anisotropy else {
                return Err(VulkanError::invalid("sampler anisotropy is not supported by the device"));
            };
            if !(1.0..=limit).contains(&requested) {
                return Err(VulkanError::invalid(format!(
                    "sampler anisotropy {requested} is outside [1, {limit}]"
                )));
            }
        }
        Ok(())
    }

    fn create_info(&self) -> vk::SamplerCreateInfo {
        vk::SamplerCreateInfo::builder()
            .mag_filter(self.mag_filter)
            .min_filter(self.min_filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .anisotropy_enable(self.max_anisotropy.is_some())
            .max_anisotropy(self.max_anisotropy.unwrap_or(1.0))
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .min_lod(self.min_lod)
            .max_lod(self.max_lod)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .build()
    }
}

/// Sampler wrapper with RAII cleanup
#[derive(Debug)]
pub struct Sampler {
    sampler: OwnedHandle<vk::Sampler>,
    settings: SamplerSettings,
}

impl Sampler {
    /// Validate `settings` against the device and create the sampler
    pub fn new(access: &DeviceAccess, settings: &SamplerSettings) -> VulkanResult<Self> {
        let capabilities = access.capabilities();
        let device_max_anisotropy = (capabilities.features.sampler_anisotropy == vk::TRUE)
            .then_some(capabilities.properties.limits.max_sampler_anisotropy);
        settings.validate(device_max_anisotropy)?;

        let create_info = settings.create_info();
        let device = access.device();
        let sampler = unsafe {
            device.create_sampler(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            sampler: OwnedHandle::new(device, sampler, destroy::sampler),
            settings: *settings,
        })
    }

    /// Get the sampler handle
    pub fn handle(&self) -> vk::Sampler {
        self.sampler.raw()
    }

    /// Settings the sampler was created with
    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_validate() {
        assert!(SamplerSettings::default().validate(None).is_ok());
        assert!(SamplerSettings::nearest_clamped().validate(Some(16.0)).is_ok());
    }

    #[test]
    fn test_anisotropy_limits() {
        let settings = SamplerSettings::default().with_anisotropy(8.0);
        assert!(settings.validate(Some(16.0)).is_ok());
        assert!(settings.validate(Some(4.0)).is_err());
        assert!(settings.validate(None).is_err());
        assert!(SamplerSettings::default().with_anisotropy(0.5).validate(Some(16.0)).is_err());
    }

    #[test]
    fn test_lod_range() {
        let inverted = SamplerSettings { min_lod: 4.0, max_lod: 1.0, ..SamplerSettings::default() };
        assert!(inverted.validate(None).is_err());

        let negative = SamplerSettings { min_lod: -1.0, ..SamplerSettings::default() };
        assert!(negative.validate(None).is_err());
    }

    #[test]
    fn test_create_info_fields() {
        let info = SamplerSettings::nearest_clamped().with_anisotropy(4.0).create_info();
        assert_eq!(info.mag_filter, vk::Filter::NEAREST);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert!((info.max_anisotropy - 4.0).abs() < f32::EPSILON);
    }
}
