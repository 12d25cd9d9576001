//! Descriptor set layouts, pools and sets
//!
//! Sets allocated from a pool are freed with the pool; [`DescriptorSet`] is a
//! plain handle that only records updates.

use ash::{vk, Device};

use crate::vulkan::handle::{destroy, OwnedHandle};
use crate::vulkan::initialization::DeviceAccess;
use crate::vulkan::{VulkanError, VulkanResult};

/// Builder for a descriptor set layout
#[derive(Debug, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding of `count` descriptors
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags)
                .build(),
        );
        self
    }

    /// Add a single uniform buffer binding
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a single storage buffer binding
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a single combined image sampler binding
    pub fn combined_image_sampler(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1, stage_flags)
    }

    /// Check that binding numbers are unique and every binding is non-empty
    pub fn validate(&self) -> VulkanResult<()> {
        for (i, binding) in self.bindings.iter().enumerate() {
            if binding.descriptor_count == 0 {
                return Err(VulkanError::invalid(format!(
                    "descriptor binding {} has a zero count",
                    binding.binding
                )));
            }
            if self.bindings[..i].iter().any(|b| b.binding == binding.binding) {
                return Err(VulkanError::invalid(format!(
                    "descriptor binding {} is declared twice",
                    binding.binding
                )));
            }
        }
        Ok(())
    }

    /// Create the layout
    pub fn build(self, access: &DeviceAccess) -> VulkanResult<DescriptorSetLayout> {
        self.validate()?;
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);
        let device = access.device();
        let layout = unsafe {
            device.create_descriptor_set_layout(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(DescriptorSetLayout {
            layout: OwnedHandle::new(device, layout, destroy::descriptor_set_layout),
            bindings: self.bindings,
        })
    }
}

/// Descriptor set layout wrapper with RAII cleanup
#[derive(Debug)]
pub struct DescriptorSetLayout {
    layout: OwnedHandle<vk::DescriptorSetLayout>,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    /// Get the layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout.raw()
    }

    /// Bindings the layout was built from
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }
}

/// Check the pool parameters before creation
pub fn validate_pool(max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> VulkanResult<()> {
    if max_sets == 0 {
        return Err(VulkanError::invalid("descriptor pool must allow at least one set"));
    }
    if sizes.is_empty() {
        return Err(VulkanError::invalid("descriptor pool needs at least one pool size"));
    }
    if let Some(size) = sizes.iter().find(|s| s.descriptor_count == 0) {
        return Err(VulkanError::invalid(format!(
            "descriptor pool size for {:?} has a zero count",
            size.ty
        )));
    }
    Ok(())
}

/// Number of sets to allocate for `set_count` requested sets and `layout_count` layouts
///
/// Fewer layouts than sets is an error. Extra layouts are ignored.
pub fn set_layout_count(set_count: usize, layout_count: usize) -> VulkanResult<usize> {
    if layout_count < set_count {
        return Err(VulkanError::invalid(format!(
            "{set_count} descriptor sets requested but only {layout_count} layouts given"
        )));
    }
    if layout_count > set_count {
        log::warn!("{} extra descriptor set layouts ignored", layout_count - set_count);
    }
    Ok(set_count)
}

/// Descriptor pool wrapper with RAII cleanup
#[derive(Debug)]
pub struct DescriptorPool {
    pool: OwnedHandle<vk::DescriptorPool>,
    max_sets: u32,
    flags: vk::DescriptorPoolCreateFlags,
}

impl DescriptorPool {
    /// Create a pool for up to `max_sets` sets drawing from `sizes`
    pub fn new(
        access: &DeviceAccess,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> VulkanResult<Self> {
        validate_pool(max_sets, sizes)?;
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(flags)
            .max_sets(max_sets)
            .pool_sizes(sizes);
        let device = access.device();
        let pool = unsafe {
            device.create_descriptor_pool(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            pool: OwnedHandle::new(device, pool, destroy::descriptor_pool),
            max_sets,
            flags,
        })
    }

    /// Get the pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool.raw()
    }

    /// Maximum number of sets the pool was sized for
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    /// Allocate `count` sets, one per layout in order
    pub fn allocate_sets(&self, count: usize, layouts: &[&DescriptorSetLayout]) -> VulkanResult<Vec<DescriptorSet>> {
        let count = set_layout_count(count, layouts.len())?;
        let handles: Vec<vk::DescriptorSetLayout> = layouts[..count].iter().map(|l| l.handle()).collect();
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.handle())
            .set_layouts(&handles);

        let sets = unsafe {
            self.pool.device().allocate_descriptor_sets(&alloc_info)
                .map_err(VulkanError::Api)?
        };
        Ok(sets.into_iter().map(|set| DescriptorSet { set }).collect())
    }

    /// Return sets to the pool
    ///
    /// Requires a pool created with `FREE_DESCRIPTOR_SET`.
    pub fn free_sets(&self, sets: Vec<DescriptorSet>) -> VulkanResult<()> {
        if !self.flags.contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            return Err(VulkanError::invalid("descriptor pool does not allow freeing individual sets"));
        }
        let handles: Vec<vk::DescriptorSet> = sets.iter().map(DescriptorSet::handle).collect();
        unsafe {
            self.pool.device().free_descriptor_sets(self.handle(), &handles)
                .map_err(VulkanError::Api)
        }
    }

    /// Free every set allocated from the pool
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe {
            self.pool.device().reset_descriptor_pool(self.handle(), vk::DescriptorPoolResetFlags::empty())
                .map_err(VulkanError::Api)
        }
    }
}

/// Descriptor set allocated from a [`DescriptorPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSet {
    set: vk::DescriptorSet,
}

impl DescriptorSet {
    /// Get the set handle
    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Write buffer descriptors starting at `array_element` of `binding`
    pub fn write_buffers(
        &self,
        device: &Device,
        binding: u32,
        array_element: u32,
        descriptor_type: vk::DescriptorType,
        infos: &[vk::DescriptorBufferInfo],
    ) {
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(array_element)
            .descriptor_type(descriptor_type)
            .buffer_info(infos)
            .build();
        update(device, &[write], &[]);
    }

    /// Write image descriptors starting at `array_element` of `binding`
    pub fn write_images(
        &self,
        device: &Device,
        binding: u32,
        array_element: u32,
        descriptor_type: vk::DescriptorType,
        infos: &[vk::DescriptorImageInfo],
    ) {
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(array_element)
            .descriptor_type(descriptor_type)
            .image_info(infos)
            .build();
        update(device, &[write], &[]);
    }

    /// Write texel buffer view descriptors starting at `array_element` of `binding`
    pub fn write_texel_views(
        &self,
        device: &Device,
        binding: u32,
        array_element: u32,
        descriptor_type: vk::DescriptorType,
        views: &[vk::BufferView],
    ) {
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(array_element)
            .descriptor_type(descriptor_type)
            .texel_buffer_view(views)
            .build();
        update(device, &[write], &[]);
    }
}

/// Apply descriptor writes and copies in one call
pub fn update(device: &Device, writes: &[vk::WriteDescriptorSet], copies: &[vk::CopyDescriptorSet]) {
    unsafe { device.update_descriptor_sets(writes, copies) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(ty: vk::DescriptorType, descriptor_count: u32) -> vk::DescriptorPoolSize {
        vk::DescriptorPoolSize { ty, descriptor_count }
    }

    #[test]
    fn test_pool_validation() {
        let sizes = [size(vk::DescriptorType::UNIFORM_BUFFER, 4)];
        assert!(validate_pool(2, &sizes).is_ok());
        assert!(validate_pool(0, &sizes).is_err());
        assert!(validate_pool(2, &[]).is_err());
        assert!(validate_pool(2, &[size(vk::DescriptorType::STORAGE_BUFFER, 0)]).is_err());
    }

    #[test]
    fn test_layout_count() {
        assert_eq!(set_layout_count(2, 2).unwrap(), 2);
        assert_eq!(set_layout_count(1, 3).unwrap(), 1);
        assert!(set_layout_count(3, 1).is_err());
    }

    #[test]
    fn test_layout_builder_validation() {
        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let good = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, stages)
            .combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT);
        assert!(good.validate().is_ok());

        let duplicate = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, stages)
            .storage_buffer(0, stages);
        assert!(duplicate.validate().is_err());

        let empty_binding = DescriptorSetLayoutBuilder::new()
            .binding(3, vk::DescriptorType::SAMPLER, 0, stages);
        assert!(empty_binding.validate().is_err());
    }
}
