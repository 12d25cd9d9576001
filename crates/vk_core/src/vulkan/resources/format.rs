//! Texel sizes and cached format properties

use ash::vk;
use std::cell::RefCell;
use std::collections::HashMap;

use crate::vulkan::initialization::DeviceAccess;

/// Size of one texel in bytes, or `None` for compressed, planar and unknown formats
pub fn bytes_per_pixel(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SINT
        | vk::Format::R8_SRGB | vk::Format::S8_UINT => 1,

        vk::Format::R8G8_UNORM | vk::Format::R8G8_SNORM | vk::Format::R8G8_UINT | vk::Format::R8G8_SINT
        | vk::Format::R8G8_SRGB | vk::Format::R16_UNORM | vk::Format::R16_SNORM | vk::Format::R16_UINT
        | vk::Format::R16_SINT | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM
        | vk::Format::R5G6B5_UNORM_PACK16 | vk::Format::B5G6R5_UNORM_PACK16
        | vk::Format::R4G4B4A4_UNORM_PACK16 | vk::Format::B4G4R4A4_UNORM_PACK16
        | vk::Format::R5G5B5A1_UNORM_PACK16 | vk::Format::A1R5G5B5_UNORM_PACK16 => 2,

        vk::Format::R8G8B8_UNORM | vk::Format::R8G8B8_SRGB | vk::Format::B8G8R8_UNORM
        | vk::Format::B8G8R8_SRGB | vk::Format::D16_UNORM_S8_UINT => 3,

        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SNORM | vk::Format::R8G8B8A8_UINT
        | vk::Format::R8G8B8A8_SINT | vk::Format::R8G8B8A8_SRGB | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB | vk::Format::A8B8G8R8_UNORM_PACK32
        | vk::Format::A2R10G10B10_UNORM_PACK32 | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32 | vk::Format::E5B9G9R9_UFLOAT_PACK32
        | vk::Format::R16G16_UNORM | vk::Format::R16G16_SFLOAT | vk::Format::R16G16_UINT
        | vk::Format::R16G16_SINT | vk::Format::R32_UINT | vk::Format::R32_SINT
        | vk::Format::R32_SFLOAT | vk::Format::D32_SFLOAT | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::X8_D24_UNORM_PACK32 => 4,

        vk::Format::D32_SFLOAT_S8_UINT => 5,

        vk::Format::R16G16B16_UNORM | vk::Format::R16G16B16_SFLOAT => 6,

        vk::Format::R16G16B16A16_UNORM | vk::Format::R16G16B16A16_SNORM | vk::Format::R16G16B16A16_UINT
        | vk::Format::R16G16B16A16_SINT | vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_UINT
        | vk::Format::R32G32_SINT | vk::Format::R32G32_SFLOAT => 8,

        vk::Format::R32G32B32_UINT | vk::Format::R32G32B32_SINT | vk::Format::R32G32B32_SFLOAT => 12,

        vk::Format::R32G32B32A32_UINT | vk::Format::R32G32B32A32_SINT | vk::Format::R32G32B32A32_SFLOAT => 16,

        _ => return None,
    };
    Some(size)
}

/// Tightly packed byte size of a 2D image in `format`
pub fn image_data_size(format: vk::Format, extent: vk::Extent2D) -> Option<vk::DeviceSize> {
    bytes_per_pixel(format).map(|texel| {
        vk::DeviceSize::from(texel) * vk::DeviceSize::from(extent.width) * vk::DeviceSize::from(extent.height)
    })
}

/// Per-format properties of one physical device, queried on first use
pub struct FormatTable {
    access: DeviceAccess,
    cache: RefCell<HashMap<vk::Format, vk::FormatProperties>>,
}

impl FormatTable {
    /// Create an empty table for the device behind `access`
    pub fn new(access: &DeviceAccess) -> Self {
        Self {
            access: access.clone(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Properties of `format`
    pub fn properties(&self, format: vk::Format) -> vk::FormatProperties {
        *self.cache.borrow_mut().entry(format).or_insert_with(|| unsafe {
            self.access
                .instance()
                .get_physical_device_format_properties(self.access.capabilities().physical_device, format)
        })
    }

    /// Whether linear tiling of `format` supports every feature in `features`
    pub fn supports_linear(&self, format: vk::Format, features: vk::FormatFeatureFlags) -> bool {
        self.properties(format).linear_tiling_features.contains(features)
    }

    /// Whether optimal tiling of `format` supports every feature in `features`
    pub fn supports_optimal(&self, format: vk::Format, features: vk::FormatFeatureFlags) -> bool {
        self.properties(format).optimal_tiling_features.contains(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_texel_sizes() {
        assert_eq!(bytes_per_pixel(vk::Format::R8_UNORM), Some(1));
        assert_eq!(bytes_per_pixel(vk::Format::R16_SFLOAT), Some(2));
        assert_eq!(bytes_per_pixel(vk::Format::R8G8B8_SRGB), Some(3));
        assert_eq!(bytes_per_pixel(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(bytes_per_pixel(vk::Format::B8G8R8A8_UNORM), Some(4));
        assert_eq!(bytes_per_pixel(vk::Format::R16G16B16A16_SFLOAT), Some(8));
        assert_eq!(bytes_per_pixel(vk::Format::R32G32B32A32_SFLOAT), Some(16));
    }

    #[test]
    fn test_compressed_formats_have_no_texel_size() {
        assert_eq!(bytes_per_pixel(vk::Format::BC1_RGB_UNORM_BLOCK), None);
        assert_eq!(bytes_per_pixel(vk::Format::UNDEFINED), None);
    }

    #[test]
    fn test_image_data_size() {
        let extent = vk::Extent2D { width: 4, height: 4 };
        assert_eq!(image_data_size(vk::Format::R8G8B8A8_UNORM, extent), Some(64));
        assert_eq!(image_data_size(vk::Format::R32G32B32A32_SFLOAT, extent), Some(256));
        assert_eq!(image_data_size(vk::Format::BC7_UNORM_BLOCK, extent), None);
    }
}
