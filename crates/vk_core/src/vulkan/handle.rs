//! Move-only RAII wrapper for device-level Vulkan handles
//!
//! One generic type replaces a hand-written wrapper per handle kind. The
//! wrapper owns a clone of the device dispatch table plus a destroy function,
//! and nulls itself when the handle is moved out with [`OwnedHandle::into_raw`].

use ash::vk::{self, Handle};
use ash::Device;
use std::fmt;

/// Destroy function for a device-level handle
pub type DestroyFn<H> = unsafe fn(&Device, H);

/// Exclusively owned Vulkan handle, destroyed on drop
pub struct OwnedHandle<H: Handle + Copy> {
    device: Device,
    raw: H,
    destroy: DestroyFn<H>,
}

impl<H: Handle + Copy> OwnedHandle<H> {
    /// Take ownership of `raw`; it will be released with `destroy`
    pub fn new(device: &Device, raw: H, destroy: DestroyFn<H>) -> Self {
        Self {
            device: device.clone(),
            raw,
            destroy,
        }
    }

    /// Get the raw handle
    pub fn raw(&self) -> H {
        self.raw
    }

    /// Whether the wrapper currently holds nothing
    pub fn is_null(&self) -> bool {
        self.raw.as_raw() == 0
    }

    /// Device this handle belongs to
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Release ownership without destroying the handle
    pub fn into_raw(mut self) -> H {
        std::mem::replace(&mut self.raw, H::from_raw(0))
    }
}

impl<H: Handle + Copy> Drop for OwnedHandle<H> {
    fn drop(&mut self) {
        if !self.is_null() {
            unsafe { (self.destroy)(&self.device, self.raw) };
        }
    }
}

impl<H: Handle + Copy + fmt::Debug> fmt::Debug for OwnedHandle<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedHandle").field(&self.raw).finish()
    }
}

/// Destroy functions matching [`DestroyFn`] for every handle kind the crate owns
#[allow(missing_docs, clippy::missing_safety_doc)]
pub mod destroy {
    use super::{vk, Device};

    pub unsafe fn fence(device: &Device, handle: vk::Fence) {
        device.destroy_fence(handle, None);
    }

    pub unsafe fn semaphore(device: &Device, handle: vk::Semaphore) {
        device.destroy_semaphore(handle, None);
    }

    pub unsafe fn event(device: &Device, handle: vk::Event) {
        device.destroy_event(handle, None);
    }

    pub unsafe fn buffer(device: &Device, handle: vk::Buffer) {
        device.destroy_buffer(handle, None);
    }

    pub unsafe fn image(device: &Device, handle: vk::Image) {
        device.destroy_image(handle, None);
    }

    pub unsafe fn image_view(device: &Device, handle: vk::ImageView) {
        device.destroy_image_view(handle, None);
    }

    pub unsafe fn memory(device: &Device, handle: vk::DeviceMemory) {
        device.free_memory(handle, None);
    }

    pub unsafe fn shader_module(device: &Device, handle: vk::ShaderModule) {
        device.destroy_shader_module(handle, None);
    }

    pub unsafe fn sampler(device: &Device, handle: vk::Sampler) {
        device.destroy_sampler(handle, None);
    }

    pub unsafe fn descriptor_set_layout(device: &Device, handle: vk::DescriptorSetLayout) {
        device.destroy_descriptor_set_layout(handle, None);
    }

    pub unsafe fn descriptor_pool(device: &Device, handle: vk::DescriptorPool) {
        device.destroy_descriptor_pool(handle, None);
    }

    pub unsafe fn command_pool(device: &Device, handle: vk::CommandPool) {
        // Buffers allocated from the pool may still be executing
        let _ = device.device_wait_idle();
        device.destroy_command_pool(handle, None);
    }
}
