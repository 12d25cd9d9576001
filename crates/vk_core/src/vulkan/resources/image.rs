//! Image resources and image views

use ash::{vk, Device};

use super::binding::{BindPhase, MemoryBinding};
use super::memory::MemoryAllocation;
use crate::vulkan::handle::{destroy, OwnedHandle};
use crate::vulkan::initialization::DeviceAccess;
use crate::vulkan::{VulkanError, VulkanResult};

/// Image view wrapper with RAII cleanup
#[derive(Debug)]
pub struct ImageView {
    view: OwnedHandle<vk::ImageView>,
}

impl ImageView {
    /// Create a 2D view over `range` of `image`
    pub fn new(
        device: &Device,
        image: vk::Image,
        format: vk::Format,
        range: vk::ImageSubresourceRange,
    ) -> VulkanResult<Self> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(range);

        let view = unsafe {
            device.create_image_view(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            view: OwnedHandle::new(device, view, destroy::image_view),
        })
    }

    /// Get the image view handle
    pub fn handle(&self) -> vk::ImageView {
        self.view.raw()
    }
}

/// Image wrapper with memory management
///
/// The handle is declared before the binding so it is destroyed before the
/// memory it is bound to.
#[derive(Debug)]
pub struct ImageResource {
    image: OwnedHandle<vk::Image>,
    binding: MemoryBinding,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
}

impl ImageResource {
    /// Create, allocate and bind an optimal-tiling 2D image in device-local memory
    pub fn new_2d(
        access: &DeviceAccess,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> VulkanResult<Self> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut resource = Self::create_handle(access, &create_info)?;
        resource.allocate_memory(access, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        resource.bind_memory()?;
        Ok(resource)
    }

    /// Create the image handle only
    pub fn create_handle(access: &DeviceAccess, create_info: &vk::ImageCreateInfo) -> VulkanResult<Self> {
        let device = access.device();
        let image = unsafe {
            device.create_image(create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            image: OwnedHandle::new(device, image, destroy::image),
            binding: MemoryBinding::default(),
            format: create_info.format,
            extent: create_info.extent,
            mip_levels: create_info.mip_levels,
        })
    }

    /// Allocate memory with `desired` properties
    ///
    /// A LAZILY_ALLOCATED request falls back to plain memory when no lazy
    /// type fits.
    pub fn allocate_memory(&mut self, access: &DeviceAccess, desired: vk::MemoryPropertyFlags) -> VulkanResult<()> {
        let requirements = unsafe { access.device().get_image_memory_requirements(self.image.raw()) };
        self.binding.allocate(access, requirements, &[desired])
    }

    /// Bind the allocated memory at offset zero
    pub fn bind_memory(&mut self) -> VulkanResult<()> {
        let device = self.image.device();
        let image = self.image.raw();
        self.binding.bind(|memory| unsafe { device.bind_image_memory(image, memory, 0) })
    }

    /// Create a view over every mip level of the color aspect
    pub fn create_view(&self) -> VulkanResult<ImageView> {
        self.binding.phase().require(BindPhase::Bound, "create_view")?;
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        };
        ImageView::new(self.image.device(), self.image.raw(), self.format, range)
    }

    /// Whether create, allocate and bind all succeeded
    pub fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    /// Construction phase reached so far
    pub fn phase(&self) -> BindPhase {
        self.binding.phase()
    }

    /// The bound allocation
    pub fn memory(&self) -> VulkanResult<&MemoryAllocation> {
        self.binding.bound_memory()
    }

    /// Get the image handle
    pub fn handle(&self) -> vk::Image {
        self.image.raw()
    }

    /// Image format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Image extent
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    /// Width and height of mip level zero
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }
}
