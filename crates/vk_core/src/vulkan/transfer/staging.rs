//! Host-visible staging region
//!
//! One buffer serves every staged upload and read-back. It is reallocated
//! only when a request outgrows it, so after warm-up uploads allocate
//! nothing. The same memory can be viewed as a linearly tiled image for
//! blit-based texture uploads.

use ash::vk;

use crate::vulkan::handle::{destroy, OwnedHandle};
use crate::vulkan::initialization::DeviceAccess;
use crate::vulkan::resources::format::image_data_size;
use crate::vulkan::resources::{BufferResource, FormatTable};
use crate::vulkan::{VulkanError, VulkanResult};

/// Usage of the staging buffer: source for uploads, destination for read-backs
pub const STAGING_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

/// New capacity for a request of `requested` bytes, `None` if `current` suffices
pub fn next_capacity(current: vk::DeviceSize, requested: vk::DeviceSize) -> Option<vk::DeviceSize> {
    (requested > current).then_some(requested)
}

/// Allocate a replacement of `capacity` bytes, then swap it into `slot`
///
/// `slot` is only touched once `allocate` succeeds, so a failed allocation
/// keeps the old value. The previous value is handed back to the caller.
fn swap_in_grown<T, A>(slot: &mut Option<T>, capacity: vk::DeviceSize, allocate: A) -> VulkanResult<Option<T>>
where
    A: FnOnce(vk::DeviceSize) -> VulkanResult<T>,
{
    let grown = allocate(capacity)?;
    Ok(slot.replace(grown))
}

/// Grow-only host-visible buffer used as the source and sink of staged copies
pub struct StagingBuffer {
    access: DeviceAccess,
    // Bound to the buffer's memory, so it goes first
    aliased_image: Option<OwnedHandle<vk::Image>>,
    buffer: Option<BufferResource>,
    mapped: Option<vk::DeviceSize>,
}

impl StagingBuffer {
    /// Create an empty staging region; memory is allocated on first use
    pub fn new(access: &DeviceAccess) -> Self {
        Self {
            access: access.clone(),
            aliased_image: None,
            buffer: None,
            mapped: None,
        }
    }

    /// Create a staging region of at least `size` bytes
    pub fn with_capacity(access: &DeviceAccess, size: vk::DeviceSize) -> VulkanResult<Self> {
        let mut staging = Self::new(access);
        staging.expand(size)?;
        Ok(staging)
    }

    /// Usable size in bytes
    pub fn capacity(&self) -> vk::DeviceSize {
        self.buffer.as_ref().map_or(0, BufferResource::size)
    }

    /// Make room for `size` bytes, reallocating only when the region is too small
    ///
    /// Previous contents are not preserved across a reallocation. If the new
    /// allocation fails the old buffer and its capacity are kept.
    pub fn expand(&mut self, size: vk::DeviceSize) -> VulkanResult<()> {
        let Some(capacity) = next_capacity(self.capacity(), size) else {
            return Ok(());
        };
        if self.mapped.is_some() {
            return Err(VulkanError::invalid("cannot grow a mapped staging buffer"));
        }

        let access = &self.access;
        let previous = swap_in_grown(&mut self.buffer, capacity, |capacity| {
            BufferResource::new(access, capacity, STAGING_USAGE, &[vk::MemoryPropertyFlags::HOST_VISIBLE])
        })?;
        // The aliased image is bound to the old memory
        self.aliased_image = None;
        drop(previous);
        log::debug!("Staging buffer grown to {capacity} bytes");
        Ok(())
    }

    /// Destroy the buffer, its memory and any aliased image
    pub fn release(&mut self) {
        if let Some(buffer) = &self.buffer {
            if let Some(size) = self.mapped.take() {
                if let Ok(memory) = buffer.memory() {
                    if let Err(e) = memory.unmap(0, size) {
                        log::warn!("Failed to unmap staging buffer on release: {e}");
                    }
                }
            }
        }
        self.aliased_image = None;
        self.buffer = None;
    }

    fn buffer(&self) -> VulkanResult<&BufferResource> {
        self.buffer
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("staging buffer has no memory"))
    }

    /// Buffer handle for copy commands
    pub fn handle(&self) -> VulkanResult<vk::Buffer> {
        self.buffer().map(BufferResource::handle)
    }

    /// Map the first `size` bytes, growing first if needed
    ///
    /// The pointer stays valid until [`StagingBuffer::unmap`].
    pub fn map(&mut self, size: vk::DeviceSize) -> VulkanResult<*mut u8> {
        if self.mapped.is_some() {
            return Err(VulkanError::invalid("staging buffer is already mapped"));
        }
        self.expand(size)?;
        let ptr = self.buffer()?.memory()?.map(0, size)?;
        self.mapped = Some(size);
        Ok(ptr)
    }

    /// Flush and unmap the range mapped by [`StagingBuffer::map`]
    pub fn unmap(&mut self) -> VulkanResult<()> {
        let size = self
            .mapped
            .take()
            .ok_or_else(|| VulkanError::invalid("staging buffer is not mapped"))?;
        self.buffer()?.memory()?.unmap(0, size)
    }

    /// Whether a mapping is outstanding
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Copy `data` to the start of the region, growing it if needed
    pub fn write(&mut self, data: &[u8]) -> VulkanResult<()> {
        self.expand(data.len() as vk::DeviceSize)?;
        self.buffer()?.write_bytes(data, 0)
    }

    /// Copy the first `out.len()` bytes of the region to `out`
    pub fn read(&self, out: &mut [u8]) -> VulkanResult<()> {
        self.buffer()?.read_bytes(out, 0)
    }

    /// View the staging memory as a linear 2D image usable as a blit source
    ///
    /// Returns `Ok(None)` when the format cannot be blitted from linear
    /// tiling, the data does not fit, the extent exceeds the format limits
    /// or the driver pads the rows. The image starts in PREINITIALIZED
    /// layout and lives until the next call, `expand` or `release`.
    pub fn aliased_image_2d(
        &mut self,
        formats: &FormatTable,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> VulkanResult<Option<vk::Image>> {
        if !formats.supports_linear(format, vk::FormatFeatureFlags::BLIT_SRC) {
            log::debug!("{format:?} cannot be a linear blit source, aliasing skipped");
            return Ok(None);
        }
        let Some(data_size) = image_data_size(format, extent) else {
            return Ok(None);
        };
        if data_size > self.capacity() {
            return Ok(None);
        }

        let limits = unsafe {
            self.access.instance().get_physical_device_image_format_properties(
                self.access.capabilities().physical_device,
                format,
                vk::ImageType::TYPE_2D,
                vk::ImageTiling::LINEAR,
                vk::ImageUsageFlags::TRANSFER_SRC,
                vk::ImageCreateFlags::empty(),
            )
        };
        let limits = match limits {
            Ok(limits) => limits,
            Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => return Ok(None),
            Err(e) => return Err(VulkanError::Api(e)),
        };
        if extent.width > limits.max_extent.width
            || extent.height > limits.max_extent.height
            || data_size > limits.max_resource_size
        {
            return Ok(None);
        }

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
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::PREINITIALIZED);

        self.aliased_image = None;
        let device = self.access.device();
        let image = unsafe { device.create_image(&create_info, None).map_err(VulkanError::Api)? };
        let image = OwnedHandle::new(device, image, destroy::image);

        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let layout = unsafe { device.get_image_subresource_layout(image.raw(), subresource) };
        if layout.size != data_size {
            log::debug!(
                "Linear {format:?} rows are padded ({} bytes for {data_size}), aliasing skipped",
                layout.size
            );
            return Ok(None);
        }

        let requirements = unsafe { device.get_image_memory_requirements(image.raw()) };
        let memory = self.buffer()?.memory()?;
        if requirements.size > memory.size() || requirements.memory_type_bits & (1 << memory.memory_type_index()) == 0 {
            return Ok(None);
        }
        unsafe {
            device
                .bind_image_memory(image.raw(), memory.handle(), 0)
                .map_err(VulkanError::BindFailed)?;
        }

        let raw = image.raw();
        self.aliased_image = Some(image);
        Ok(Some(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_only_grows() {
        assert_eq!(next_capacity(0, 1024), Some(1024));
        assert_eq!(next_capacity(1024, 512), None);
        assert_eq!(next_capacity(1024, 1024), None);
        assert_eq!(next_capacity(1024, 4096), Some(4096));
    }

    #[test]
    fn test_failed_growth_keeps_old_allocation() {
        let mut slot = Some(vec![0u8; 256]);
        let result = swap_in_grown(&mut slot, 1024, |_| Err(VulkanError::NoSuitableMemoryType));

        assert!(matches!(result, Err(VulkanError::NoSuitableMemoryType)));
        assert_eq!(slot.as_ref().map(Vec::len), Some(256));
    }

    #[test]
    fn test_growth_beyond_current_capacity_swaps() {
        let mut slot = Some(vec![0u8; 256]);
        let requested = next_capacity(256, 4096).unwrap();
        let previous = swap_in_grown(&mut slot, requested, |capacity| Ok(vec![0u8; capacity as usize])).unwrap();

        assert_eq!(previous.map(|old| old.len()), Some(256));
        assert_eq!(slot.as_ref().map(Vec::len), Some(4096));

        let mut empty: Option<Vec<u8>> = None;
        let previous = swap_in_grown(&mut empty, 64, |capacity| Ok(vec![0u8; capacity as usize])).unwrap();
        assert!(previous.is_none());
        assert_eq!(empty.map(|v| v.len()), Some(64));
    }

    #[test]
    fn test_staging_usage() {
        assert!(STAGING_USAGE.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(STAGING_USAGE.contains(vk::BufferUsageFlags::TRANSFER_DST));
    }
}
