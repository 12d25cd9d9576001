//! Device memory allocation and host mapping
//!
//! Memory-type selection is a pure function over the physical device's memory
//! properties so it can be exercised without a GPU. [`MemoryAllocation`] owns
//! one `vk::DeviceMemory` and takes care of the invalidate/flush dance that
//! non-coherent memory needs around every host access.

use ash::vk;

use crate::vulkan::handle::{destroy, OwnedHandle};
use crate::vulkan::initialization::DeviceAccess;
use crate::vulkan::{VulkanError, VulkanResult};

/// Find the first memory type allowed by `type_bits` whose flags contain `desired`
///
/// When `desired` asks for lazily allocated memory and nothing matches, the
/// search is repeated once without that bit.
pub fn select_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    desired: vk::MemoryPropertyFlags,
) -> Option<u32> {
    find_memory_type(properties, type_bits, desired).or_else(|| {
        if desired.contains(vk::MemoryPropertyFlags::LAZILY_ALLOCATED) {
            find_memory_type(
                properties,
                type_bits,
                desired & !vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
            )
        } else {
            None
        }
    })
}

fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    desired: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = (properties.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
    properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(desired)
        })
        .map(|(index, _)| index as u32)
}

/// A host-mapped range after rounding to the non-coherent atom size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    /// Aligned start of the mapping
    pub offset: vk::DeviceSize,
    /// Aligned length of the mapping
    pub size: vk::DeviceSize,
    /// Distance from the aligned start to the caller's offset
    pub delta: vk::DeviceSize,
}

/// Round `[offset, offset + size)` outwards to `atom` boundaries, clamped to the allocation
pub fn non_coherent_range(
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    atom: vk::DeviceSize,
    allocation_size: vk::DeviceSize,
) -> MappedRange {
    let atom = atom.max(1);
    let start = offset / atom * atom;
    let end = (offset + size).div_ceil(atom).saturating_mul(atom).min(allocation_size);
    MappedRange {
        offset: start,
        size: end.saturating_sub(start),
        delta: offset - start,
    }
}

/// Owned device memory plus what was learned when allocating it
#[derive(Debug)]
pub struct MemoryAllocation {
    memory: OwnedHandle<vk::DeviceMemory>,
    size: vk::DeviceSize,
    memory_type_index: u32,
    properties: vk::MemoryPropertyFlags,
    non_coherent_atom: vk::DeviceSize,
    bound: bool,
}

impl MemoryAllocation {
    /// Allocate memory satisfying `requirements` with at least the `desired` properties
    pub fn allocate(
        access: &DeviceAccess,
        requirements: vk::MemoryRequirements,
        desired: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let capabilities = access.capabilities();
        let memory_type_index = select_memory_type(
            &capabilities.memory_properties,
            requirements.memory_type_bits,
            desired,
        )
        .ok_or(VulkanError::NoSuitableMemoryType)?;

        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let device = access.device();
        let memory = unsafe {
            device.allocate_memory(&allocate_info, None)
                .map_err(VulkanError::Api)?
        };

        let properties = capabilities.memory_properties.memory_types[memory_type_index as usize].property_flags;
        log::debug!(
            "Allocated {} bytes from memory type {} ({:?})",
            requirements.size, memory_type_index, properties
        );

        Ok(Self {
            memory: OwnedHandle::new(device, memory, destroy::memory),
            size: requirements.size,
            memory_type_index,
            properties,
            non_coherent_atom: capabilities.properties.limits.non_coherent_atom_size,
            bound: false,
        })
    }

    /// Get the memory handle
    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory.raw()
    }

    /// Allocated size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Index of the memory type this allocation came from
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Property flags of the resolved memory type
    pub fn property_flags(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    /// Whether the host can map this memory
    pub fn is_host_visible(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Whether host writes need an explicit flush
    pub fn is_coherent(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Whether a resource has been bound to this memory
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub(crate) fn mark_bound(&mut self) {
        self.bound = true;
    }

    fn check_range(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> VulkanResult<()> {
        if !self.is_host_visible() {
            return Err(VulkanError::invalid("memory is not host visible"));
        }
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(VulkanError::invalid(format!(
                "range {offset}+{size} exceeds allocation of {} bytes",
                self.size
            ))),
        }
    }

    fn mapped_range(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> MappedRange {
        if self.is_coherent() {
            MappedRange { offset, size, delta: 0 }
        } else {
            non_coherent_range(offset, size, self.non_coherent_atom, self.size)
        }
    }

    fn range_info(&self, range: MappedRange) -> vk::MappedMemoryRange {
        vk::MappedMemoryRange::builder()
            .memory(self.memory.raw())
            .offset(range.offset)
            .size(range.size)
            .build()
    }

    /// Map `size` bytes at `offset`, invalidating non-coherent memory first
    ///
    /// Pair every call with [`MemoryAllocation::unmap`] using the same range.
    pub fn map(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> VulkanResult<*mut u8> {
        self.check_range(offset, size)?;
        let range = self.mapped_range(offset, size);
        let device = self.memory.device();

        let mapped = unsafe {
            device.map_memory(self.memory.raw(), range.offset, range.size, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?
        };

        if !self.is_coherent() {
            let invalidated = unsafe { device.invalidate_mapped_memory_ranges(&[self.range_info(range)]) };
            if let Err(e) = invalidated {
                unsafe { device.unmap_memory(self.memory.raw()) };
                return Err(VulkanError::Api(e));
            }
        }

        Ok(unsafe { mapped.cast::<u8>().add(range.delta as usize) })
    }

    /// Flush non-coherent memory for the range, then unmap
    pub fn unmap(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> VulkanResult<()> {
        let device = self.memory.device();
        let flushed = if self.is_coherent() {
            Ok(())
        } else {
            let range = self.mapped_range(offset, size);
            unsafe { device.flush_mapped_memory_ranges(&[self.range_info(range)]) }
        };
        unsafe { device.unmap_memory(self.memory.raw()) };
        flushed.map_err(VulkanError::Api)
    }

    /// Map a range, hand it to `access` as a byte slice, then flush and unmap
    pub fn with_mapped<R>(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        access: impl FnOnce(&mut [u8]) -> R,
    ) -> VulkanResult<R> {
        let ptr = self.map(offset, size)?;
        // The mapping covers at least `size` bytes past `ptr` and stays alive until unmap.
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, size as usize) };
        let result = access(bytes);
        self.unmap(offset, size)?;
        Ok(result)
    }

    /// Copy `data` into the memory at `offset`
    pub fn write_bytes(&self, data: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        self.with_mapped(offset, data.len() as vk::DeviceSize, |mapped| {
            mapped.copy_from_slice(data);
        })
    }

    /// Copy `out.len()` bytes at `offset` back to the host
    pub fn read_bytes(&self, out: &mut [u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        self.with_mapped(offset, out.len() as vk::DeviceSize, |mapped| {
            out.copy_from_slice(mapped);
        })
    }
}
