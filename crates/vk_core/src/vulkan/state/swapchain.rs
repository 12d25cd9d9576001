//! Swapchain creation, rebuild and the choices that go into them
//!
//! Every choice (image count, extent, alpha, usage, format, present mode)
//! is a pure function of what the surface reports, gathered into a
//! [`SwapchainSettings`] that is kept for rebuilds. [`Swapchain`] owns the
//! handle and its image views; images and views are replaced together so the
//! two lists always have the same length.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

use crate::vulkan::handle::{destroy, OwnedHandle};
use crate::vulkan::{VulkanError, VulkanResult};

/// Formats tried in order when the caller has no preference
const PREFERRED_FORMATS: [vk::SurfaceFormatKHR; 2] = [
    vk::SurfaceFormatKHR {
        format: vk::Format::R8G8B8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    },
    vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    },
];

/// One more image than the minimum, unless the maximum forbids it (0 means unbounded)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let min = capabilities.min_image_count;
    let max = capabilities.max_image_count;
    if max == 0 || max > min {
        min + 1
    } else {
        min
    }
}

/// The surface's current extent, or `fallback` clamped to its bounds when undefined
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, fallback: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: fallback.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width.max(capabilities.min_image_extent.width),
        ),
        height: fallback.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height.max(capabilities.min_image_extent.height),
        ),
    }
}

/// Whether an extent has no area (minimized window)
pub fn is_zero_extent(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

/// INHERIT when supported, otherwise the first supported mode
pub fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> Option<vk::CompositeAlphaFlagsKHR> {
    if supported.contains(vk::CompositeAlphaFlagsKHR::INHERIT) {
        return Some(vk::CompositeAlphaFlagsKHR::INHERIT);
    }
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&mode| supported.contains(mode))
}

/// Color attachment plus whichever transfer usages the surface allows
pub fn choose_image_usage(supported: vk::ImageUsageFlags) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
    if supported.contains(vk::ImageUsageFlags::TRANSFER_SRC) {
        usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if supported.contains(vk::ImageUsageFlags::TRANSFER_DST) {
        usage |= vk::ImageUsageFlags::TRANSFER_DST;
    } else {
        log::warn!("Swapchain images do not support TRANSFER_DST; blits into them are unavailable");
    }
    usage
}

/// Find `wanted` in `available`; an UNDEFINED format matches on color space alone
pub fn match_surface_format(
    available: &[vk::SurfaceFormatKHR],
    wanted: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    available.iter().copied().find(|candidate| {
        candidate.color_space == wanted.color_space
            && (wanted.format == vk::Format::UNDEFINED || candidate.format == wanted.format)
    })
}

/// Pick the first preferred four-channel UNORM format, else the first available
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    PREFERRED_FORMATS
        .iter()
        .find_map(|&wanted| match_surface_format(available, wanted))
        .or_else(|| {
            let first = available.first().copied();
            if let Some(format) = first {
                log::warn!("No preferred surface format available, falling back to {format:?}");
            }
            first
        })
}

/// MAILBOX when the frame rate is uncapped and it is available, FIFO otherwise
pub fn choose_present_mode(available: &[vk::PresentModeKHR], limit_frame_rate: bool) -> vk::PresentModeKHR {
    if !limit_frame_rate && available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Everything needed to (re)create a swapchain, retained between rebuilds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainSettings {
    /// Target surface
    pub surface: vk::SurfaceKHR,
    /// Requested minimum image count
    pub min_image_count: u32,
    /// Image format and color space
    pub surface_format: vk::SurfaceFormatKHR,
    /// Image extent
    pub extent: vk::Extent2D,
    /// Image usage
    pub usage: vk::ImageUsageFlags,
    /// Transform applied before presentation
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Alpha compositing mode
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    /// Presentation mode
    pub present_mode: vk::PresentModeKHR,
}

impl SwapchainSettings {
    /// Derive settings from what the surface reports
    ///
    /// `preferred_format` overrides the default format choice when the
    /// surface offers it.
    pub fn plan(
        surface: vk::SurfaceKHR,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        formats: &[vk::SurfaceFormatKHR],
        present_modes: &[vk::PresentModeKHR],
        preferred_format: Option<vk::SurfaceFormatKHR>,
        limit_frame_rate: bool,
        fallback_extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let surface_format = preferred_format
            .and_then(|wanted| match_surface_format(formats, wanted))
            .or_else(|| choose_surface_format(formats))
            .ok_or(VulkanError::SwapchainCreation(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?;

        let composite_alpha = choose_composite_alpha(capabilities.supported_composite_alpha)
            .ok_or_else(|| VulkanError::invalid("surface supports no composite alpha mode"))?;

        Ok(Self {
            surface,
            min_image_count: choose_image_count(capabilities),
            surface_format,
            extent: choose_extent(capabilities, fallback_extent),
            usage: choose_image_usage(capabilities.supported_usage_flags),
            pre_transform: capabilities.current_transform,
            composite_alpha,
            present_mode: choose_present_mode(present_modes, limit_frame_rate),
        })
    }

    fn create_info(&self, old_swapchain: vk::SwapchainKHR) -> vk::SwapchainCreateInfoKHR {
        vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(self.min_image_count)
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(self.extent)
            .image_array_layers(1)
            .image_usage(self.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(self.pre_transform)
            .composite_alpha(self.composite_alpha)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain)
            .build()
    }
}

/// Swapchain management wrapper with RAII cleanup
pub struct Swapchain {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    retired: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<OwnedHandle<vk::ImageView>>,
    settings: SwapchainSettings,
}

impl Swapchain {
    /// Create a swapchain, its images and one view per image
    pub fn new(device: &Device, loader: &SwapchainLoader, settings: SwapchainSettings) -> VulkanResult<Self> {
        let mut swapchain = Self {
            device: device.clone(),
            loader: loader.clone(),
            swapchain: vk::SwapchainKHR::null(),
            retired: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            settings,
        };
        swapchain.build(settings)?;
        Ok(swapchain)
    }

    /// Replace the swapchain with one built from `settings`
    ///
    /// Old views are released first. The old handle is passed to the driver
    /// for resource reuse and kept until [`Swapchain::destroy_retired`].
    pub fn rebuild(&mut self, settings: SwapchainSettings) -> VulkanResult<()> {
        self.image_views.clear();
        self.images.clear();
        self.build(settings)
    }

    fn build(&mut self, settings: SwapchainSettings) -> VulkanResult<()> {
        let create_info = settings.create_info(self.swapchain);
        let swapchain = unsafe {
            self.loader
                .create_swapchain(&create_info, None)
                .map_err(VulkanError::SwapchainCreation)?
        };

        let (images, image_views) = match self.create_views(swapchain, settings.surface_format.format) {
            Ok(built) => built,
            Err(e) => {
                unsafe { self.loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        self.destroy_retired();
        self.retired = std::mem::replace(&mut self.swapchain, swapchain);
        self.images = images;
        self.image_views = image_views;
        self.settings = settings;

        log::info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            settings.extent.width,
            settings.extent.height,
            self.images.len(),
            settings.surface_format.format,
            settings.present_mode
        );
        Ok(())
    }

    fn create_views(
        &self,
        swapchain: vk::SwapchainKHR,
        format: vk::Format,
    ) -> VulkanResult<(Vec<vk::Image>, Vec<OwnedHandle<vk::ImageView>>)> {
        let images = unsafe {
            self.loader
                .get_swapchain_images(swapchain)
                .map_err(VulkanError::SwapchainCreation)?
        };

        let image_views: VulkanResult<Vec<_>> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(color_subresource_range());

                unsafe { self.device.create_image_view(&create_info, None) }
                    .map(|view| OwnedHandle::new(&self.device, view, destroy::image_view))
                    .map_err(VulkanError::Api)
            })
            .collect();

        Ok((images, image_views?))
    }

    /// Destroy the handle left behind by the last rebuild, if any
    pub fn destroy_retired(&mut self) {
        if self.retired != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.retired, None) };
            self.retired = vk::SwapchainKHR::null();
            log::debug!("Retired swapchain destroyed");
        }
    }

    /// Get the swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Swapchain extension loader
    pub fn loader(&self) -> &SwapchainLoader {
        &self.loader
    }

    /// Driver-owned images
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Image view for image `index`
    pub fn image_view(&self, index: usize) -> Option<vk::ImageView> {
        self.image_views.get(index).map(OwnedHandle::raw)
    }

    /// All image views, in image order
    pub fn image_views(&self) -> Vec<vk::ImageView> {
        self.image_views.iter().map(OwnedHandle::raw).collect()
    }

    /// Number of images in the swapchain
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Settings the current swapchain was built from
    pub fn settings(&self) -> &SwapchainSettings {
        &self.settings
    }

    /// Current image extent
    pub fn extent(&self) -> vk::Extent2D {
        self.settings.extent
    }

    /// Current image format
    pub fn format(&self) -> vk::Format {
        self.settings.surface_format.format
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.image_views.clear();
        self.destroy_retired();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
        }
        log::debug!("Swapchain destroyed");
    }
}

/// Single-level, single-layer color subresource range
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}
