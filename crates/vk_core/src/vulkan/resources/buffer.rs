//! Buffer resources: one buffer handle paired with one memory allocation
//!
//! [`BufferResource`] is the generic building block. [`DeviceLocalBuffer`]
//! adds the transfer usages and memory preferences used for GPU-resident
//! data, and [`TypedBuffer`] fixes the usage for vertex, index, uniform and
//! storage data.

use ash::{vk, Device};
use std::marker::PhantomData;
use std::ops::Deref;

use super::binding::{BindPhase, MemoryBinding};
use super::memory::MemoryAllocation;
use crate::vulkan::handle::{destroy, OwnedHandle};
use crate::vulkan::initialization::{DeviceAccess, DeviceCapabilities};
use crate::vulkan::{VulkanError, VulkanResult};

/// Largest payload `vkCmdUpdateBuffer` accepts
pub const MAX_INLINE_UPDATE: usize = 65536;

/// Round `size` up to a power-of-two `alignment`
pub fn align_up(size: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        return size;
    }
    (size + alignment - 1) & !(alignment - 1)
}

/// Buffer wrapper with memory management
#[derive(Debug)]
pub struct BufferResource {
    buffer: OwnedHandle<vk::Buffer>,
    binding: MemoryBinding,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
}

impl BufferResource {
    /// Create, allocate and bind in one go
    ///
    /// Memory property sets in `candidates` are tried in order.
    pub fn new(
        access: &DeviceAccess,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        candidates: &[vk::MemoryPropertyFlags],
    ) -> VulkanResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let mut resource = Self::create_handle(access, &buffer_info)?;
        resource.allocate_memory(access, candidates)?;
        resource.bind_memory()?;
        Ok(resource)
    }

    /// Create the buffer handle only
    pub fn create_handle(access: &DeviceAccess, create_info: &vk::BufferCreateInfo) -> VulkanResult<Self> {
        let device = access.device();
        let buffer = unsafe {
            device.create_buffer(create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            buffer: OwnedHandle::new(device, buffer, destroy::buffer),
            binding: MemoryBinding::default(),
            size: create_info.size,
            usage: create_info.usage,
        })
    }

    /// Allocate memory matching the buffer's requirements
    pub fn allocate_memory(
        &mut self,
        access: &DeviceAccess,
        candidates: &[vk::MemoryPropertyFlags],
    ) -> VulkanResult<()> {
        let requirements = unsafe { access.device().get_buffer_memory_requirements(self.buffer.raw()) };
        self.binding.allocate(access, requirements, candidates)
    }

    /// Bind the allocated memory at offset zero
    pub fn bind_memory(&mut self) -> VulkanResult<()> {
        let device = self.buffer.device();
        let buffer = self.buffer.raw();
        self.binding.bind(|memory| unsafe { device.bind_buffer_memory(buffer, memory, 0) })
    }

    /// Whether create, allocate and bind all succeeded
    pub fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    /// Construction phase reached so far
    pub fn phase(&self) -> BindPhase {
        self.binding.phase()
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.raw()
    }

    /// Requested size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Usage the buffer was created with
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// The bound allocation
    pub fn memory(&self) -> VulkanResult<&MemoryAllocation> {
        self.binding.bound_memory()
    }

    /// Whether the host can write the buffer directly
    pub fn is_host_visible(&self) -> bool {
        self.binding.memory().is_some_and(MemoryAllocation::is_host_visible)
    }

    /// Device the buffer was created on
    pub fn device(&self) -> &Device {
        self.buffer.device()
    }

    pub(crate) fn check_range(&self, offset: vk::DeviceSize, len: usize) -> VulkanResult<()> {
        match offset.checked_add(len as vk::DeviceSize) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(VulkanError::invalid(format!(
                "range {offset}+{len} exceeds buffer of {} bytes",
                self.size
            ))),
        }
    }

    /// Write `data` at `offset` through a host mapping
    pub fn write_bytes(&self, data: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        self.check_range(offset, data.len())?;
        self.memory()?.write_bytes(data, offset)
    }

    /// Read `out.len()` bytes at `offset` through a host mapping
    pub fn read_bytes(&self, out: &mut [u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        self.check_range(offset, out.len())?;
        self.memory()?.read_bytes(out, offset)
    }
}

/// Memory preference for GPU-resident buffers: host-visible VRAM first
const DEVICE_LOCAL_CANDIDATES: [vk::MemoryPropertyFlags; 2] = [
    vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::DEVICE_LOCAL.as_raw() | vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw(),
    ),
    vk::MemoryPropertyFlags::DEVICE_LOCAL,
];

/// Device-local buffer filled through the transfer pipeline
#[derive(Debug)]
pub struct DeviceLocalBuffer {
    resource: BufferResource,
}

impl DeviceLocalBuffer {
    /// Create a buffer with `usage` plus both transfer usages
    pub fn new(access: &DeviceAccess, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> VulkanResult<Self> {
        let usage = usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC;
        let resource = BufferResource::new(access, size, usage, &DEVICE_LOCAL_CANDIDATES)?;
        log::debug!(
            "Device-local buffer: {} bytes, {:?}, host visible: {}",
            size,
            usage,
            resource.is_host_visible()
        );
        Ok(Self { resource })
    }

    /// Replace the buffer with a new one of `size` bytes, after the device idles
    ///
    /// On failure the old buffer is kept.
    pub fn recreate(&mut self, access: &DeviceAccess, size: vk::DeviceSize) -> VulkanResult<()> {
        access.wait_idle()?;
        let usage = self.resource.usage();
        self.resource = BufferResource::new(access, size, usage, &DEVICE_LOCAL_CANDIDATES)?;
        Ok(())
    }

    /// Record an inline update of at most [`MAX_INLINE_UPDATE`] bytes
    pub fn cmd_update(&self, command_buffer: vk::CommandBuffer, data: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        if data.is_empty() || data.len() > MAX_INLINE_UPDATE || data.len() % 4 != 0 || offset % 4 != 0 {
            return Err(VulkanError::invalid(format!(
                "inline update of {} bytes at {} must be 4-byte aligned and at most {} bytes",
                data.len(),
                offset,
                MAX_INLINE_UPDATE
            )));
        }
        self.resource.check_range(offset, data.len())?;
        unsafe {
            self.resource
                .device()
                .cmd_update_buffer(command_buffer, self.resource.handle(), offset, data);
        }
        Ok(())
    }

    /// Underlying resource
    pub fn resource(&self) -> &BufferResource {
        &self.resource
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.resource.handle()
    }

    /// Size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.resource.size()
    }

    /// Whether writes can bypass the staging buffer
    pub fn is_host_visible(&self) -> bool {
        self.resource.is_host_visible()
    }
}

/// Usage role fixed by a [`TypedBuffer`]
pub trait BufferRole {
    /// Usage added on top of the transfer usages
    const USAGE: vk::BufferUsageFlags;
}

/// Vertex attribute data
#[derive(Debug)]
pub struct Vertex;
/// Index data
#[derive(Debug)]
pub struct Index;
/// Uniform data
#[derive(Debug)]
pub struct Uniform;
/// Shader storage data
#[derive(Debug)]
pub struct Storage;

impl BufferRole for Vertex {
    const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::VERTEX_BUFFER;
}

impl BufferRole for Index {
    const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::INDEX_BUFFER;
}

impl BufferRole for Uniform {
    const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::UNIFORM_BUFFER;
}

impl BufferRole for Storage {
    const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::STORAGE_BUFFER;
}

/// Device-local buffer with its usage fixed by `R`
#[derive(Debug)]
pub struct TypedBuffer<R: BufferRole> {
    buffer: DeviceLocalBuffer,
    _role: PhantomData<R>,
}

/// Vertex buffer
pub type VertexBuffer = TypedBuffer<Vertex>;
/// Index buffer
pub type IndexBuffer = TypedBuffer<Index>;
/// Uniform buffer
pub type UniformBuffer = TypedBuffer<Uniform>;
/// Storage buffer
pub type StorageBuffer = TypedBuffer<Storage>;

impl<R: BufferRole> TypedBuffer<R> {
    /// Create a buffer of `size` bytes with the role's usage plus `extra_usage`
    pub fn new(access: &DeviceAccess, size: vk::DeviceSize, extra_usage: vk::BufferUsageFlags) -> VulkanResult<Self> {
        Ok(Self {
            buffer: DeviceLocalBuffer::new(access, size, R::USAGE | extra_usage)?,
            _role: PhantomData,
        })
    }

    /// Usage fixed by the role
    pub fn role_usage() -> vk::BufferUsageFlags {
        R::USAGE
    }
}

impl<R: BufferRole> Deref for TypedBuffer<R> {
    type Target = DeviceLocalBuffer;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl<R: BufferRole> std::ops::DerefMut for TypedBuffer<R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl UniformBuffer {
    /// `size` rounded up to the device's uniform offset alignment
    pub fn aligned_size(capabilities: &DeviceCapabilities, size: vk::DeviceSize) -> vk::DeviceSize {
        align_up(size, capabilities.min_uniform_buffer_alignment())
    }
}

impl StorageBuffer {
    /// `size` rounded up to the device's storage offset alignment
    pub fn aligned_size(capabilities: &DeviceCapabilities, size: vk::DeviceSize) -> vk::DeviceSize {
        align_up(size, capabilities.min_storage_buffer_alignment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(100, 1), 100);
        assert_eq!(align_up(100, 0), 100);
    }

    #[test]
    fn test_device_local_candidates_prefer_host_visible() {
        assert_eq!(
            DEVICE_LOCAL_CANDIDATES[0],
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE
        );
        assert_eq!(DEVICE_LOCAL_CANDIDATES[1], vk::MemoryPropertyFlags::DEVICE_LOCAL);
    }

    #[test]
    fn test_role_usage() {
        assert_eq!(VertexBuffer::role_usage(), vk::BufferUsageFlags::VERTEX_BUFFER);
        assert_eq!(IndexBuffer::role_usage(), vk::BufferUsageFlags::INDEX_BUFFER);
        assert_eq!(UniformBuffer::role_usage(), vk::BufferUsageFlags::UNIFORM_BUFFER);
        assert_eq!(StorageBuffer::role_usage(), vk::BufferUsageFlags::STORAGE_BUFFER);
    }

    #[test]
    fn test_aligned_sizes_follow_device_limits() {
        let mut capabilities = DeviceCapabilities {
            physical_device: vk::PhysicalDevice::null(),
            properties: vk::PhysicalDeviceProperties::default(),
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
            features: vk::PhysicalDeviceFeatures::default(),
        };
        capabilities.properties.limits.min_uniform_buffer_offset_alignment = 256;
        capabilities.properties.limits.min_storage_buffer_offset_alignment = 64;

        assert_eq!(UniformBuffer::aligned_size(&capabilities, 80), 256);
        assert_eq!(StorageBuffer::aligned_size(&capabilities, 80), 128);
    }
}
