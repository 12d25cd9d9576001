//! Staged uploads, read-backs and texture creation
//!
//! Host-visible destinations are written through a mapping. Everything
//! else goes through the staging region and a one-time command buffer on
//! the graphics queue, and the call returns once the copy has completed.

use ash::vk;
use bytemuck::Pod;

use super::staging::StagingBuffer;
use crate::config::ContextConfig;
use crate::vulkan::initialization::DeviceAccess;
use crate::vulkan::resources::format::image_data_size;
use crate::vulkan::resources::{BufferResource, CommandBuffer, CommandPool, FormatTable, ImageResource};
use crate::vulkan::state::barrier::{
    cmd_blit_image, cmd_copy_buffer_to_image, full_blit_region, full_copy_region, ImageBarrier, DEFAULT_BLIT_FILTER,
};
use crate::vulkan::state::swapchain::color_subresource_range;
use crate::vulkan::state::sync::{Fence, MemoryBarrierBuilder};
use crate::vulkan::{VulkanError, VulkanResult};

/// Default fence timeout for staged transfers
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 10_000_000_000;

/// `element_count` elements of `element_size` bytes, spaced differently in source and destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StridedCopy {
    /// Number of elements to copy
    pub element_count: u32,
    /// Bytes copied per element
    pub element_size: vk::DeviceSize,
    /// Distance between element starts in the source slice
    pub src_stride: vk::DeviceSize,
    /// Distance between element starts in the destination buffer
    pub dst_stride: vk::DeviceSize,
    /// Destination offset of the first element
    pub dst_offset: vk::DeviceSize,
}

impl StridedCopy {
    /// Tightly packed source spread out to `dst_stride` in the destination
    pub fn scatter(element_count: u32, element_size: vk::DeviceSize, dst_stride: vk::DeviceSize) -> Self {
        Self {
            element_count,
            element_size,
            src_stride: element_size,
            dst_stride,
            dst_offset: 0,
        }
    }

    /// Start writing at `offset` in the destination
    pub fn at_offset(mut self, offset: vk::DeviceSize) -> Self {
        self.dst_offset = offset;
        self
    }

    fn span(count: u32, stride: vk::DeviceSize, element_size: vk::DeviceSize) -> Option<vk::DeviceSize> {
        match count {
            0 => Some(0),
            n => stride.checked_mul(vk::DeviceSize::from(n - 1))?.checked_add(element_size),
        }
    }

    /// Bytes of source the copy reads
    pub fn source_span(&self) -> Option<vk::DeviceSize> {
        Self::span(self.element_count, self.src_stride, self.element_size)
    }

    /// Bytes of destination the copy touches, starting at `dst_offset`
    pub fn destination_span(&self) -> Option<vk::DeviceSize> {
        Self::span(self.element_count, self.dst_stride, self.element_size)
    }

    /// Check strides and bounds against a source of `src_len` bytes and a destination of `dst_size` bytes
    pub fn validate(&self, src_len: usize, dst_size: vk::DeviceSize) -> VulkanResult<()> {
        if self.element_size > self.src_stride || self.element_size > self.dst_stride {
            return Err(VulkanError::invalid(format!(
                "element size {} exceeds a stride ({} src, {} dst)",
                self.element_size, self.src_stride, self.dst_stride
            )));
        }
        let source = self
            .source_span()
            .ok_or_else(|| VulkanError::invalid("strided source span overflows"))?;
        if source > src_len as vk::DeviceSize {
            return Err(VulkanError::invalid(format!(
                "strided copy reads {source} bytes from a {src_len} byte source"
            )));
        }
        let end = self
            .destination_span()
            .and_then(|span| span.checked_add(self.dst_offset))
            .ok_or_else(|| VulkanError::invalid("strided destination span overflows"))?;
        if end > dst_size {
            return Err(VulkanError::invalid(format!(
                "strided copy writes up to byte {end} of a {dst_size} byte buffer"
            )));
        }
        Ok(())
    }

    /// One copy region per element, reading from the start of a staged source
    pub fn regions(&self) -> Vec<vk::BufferCopy> {
        (0..vk::DeviceSize::from(self.element_count))
            .map(|i| vk::BufferCopy {
                src_offset: self.src_stride * i,
                dst_offset: self.dst_offset + self.dst_stride * i,
                size: self.element_size,
            })
            .collect()
    }
}

/// Whether a destination can skip staging
pub fn is_direct_path(memory_properties: vk::MemoryPropertyFlags) -> bool {
    memory_properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
}

/// Tunables for a [`TransferPipeline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    /// Longest a staged transfer waits on its fence
    pub fence_timeout_ns: u64,
    /// Stage every buffer transfer, even into host-visible memory
    ///
    /// Destinations then need TRANSFER_DST usage and sources TRANSFER_SRC.
    pub force_staging: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
            force_staging: false,
        }
    }
}

impl From<&ContextConfig> for TransferSettings {
    fn from(config: &ContextConfig) -> Self {
        Self {
            fence_timeout_ns: config.fence_timeout_ns,
            force_staging: config.force_staging,
        }
    }
}

impl TransferSettings {
    /// Whether memory with `memory_properties` is written through a mapping
    pub fn writes_directly(&self, memory_properties: vk::MemoryPropertyFlags) -> bool {
        !self.force_staging && is_direct_path(memory_properties)
    }
}

/// Wait for an outstanding submission and make the fence reusable
///
/// Does nothing unless `pending` is set. It stays set when `wait` times out,
/// so the command buffer is not re-recorded while it may still execute.
fn settle_pending<W, R>(pending: &mut bool, timeout_ns: u64, wait: W, reset: R) -> VulkanResult<()>
where
    W: FnOnce(u64) -> VulkanResult<bool>,
    R: FnOnce() -> VulkanResult<()>,
{
    if !*pending {
        return Ok(());
    }
    if !wait(timeout_ns)? {
        log::error!("Staged transfer did not finish within {timeout_ns} ns");
        return Err(VulkanError::TransferTimeout { timeout_ns });
    }
    reset()?;
    *pending = false;
    Ok(())
}

/// Moves data between host slices and device memory
///
/// Owns a graphics-family command buffer, the staging region, a format
/// table and the fence staged copies wait on. Calls block until the GPU
/// has finished the copy, so one pipeline serves one thread.
pub struct TransferPipeline {
    access: DeviceAccess,
    staging: StagingBuffer,
    formats: FormatTable,
    fence: Fence,
    command_buffer: CommandBuffer,
    // Destroyed after the command buffer it allocated
    _pool: CommandPool,
    settings: TransferSettings,
    // Submitted work the fence has not yet been seen signaled for
    pending: bool,
    copy_commands: u64,
}

impl TransferPipeline {
    /// Create a pipeline submitting on the graphics queue with default settings
    pub fn new(access: &DeviceAccess) -> VulkanResult<Self> {
        Self::with_settings(access, TransferSettings::default())
    }

    /// Create a pipeline submitting on the graphics queue
    pub fn with_settings(access: &DeviceAccess, settings: TransferSettings) -> VulkanResult<Self> {
        let graphics = access.queues().graphics()?;
        let pool = CommandPool::new(access.device(), graphics.family)?;
        let command_buffer = pool.allocate()?;

        Ok(Self {
            access: access.clone(),
            staging: StagingBuffer::new(access),
            formats: FormatTable::new(access),
            fence: Fence::new(access.device(), false)?,
            command_buffer,
            _pool: pool,
            settings,
            pending: false,
            copy_commands: 0,
        })
    }

    /// Fail staged transfers whose fence is not signaled within `timeout_ns`
    pub fn with_fence_timeout(mut self, timeout_ns: u64) -> Self {
        self.settings.fence_timeout_ns = timeout_ns;
        self
    }

    /// Stage buffer transfers even when the memory is host visible
    pub fn with_force_staging(mut self, force: bool) -> Self {
        self.settings.force_staging = force;
        self
    }

    /// Settings in effect
    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Copy and blit commands recorded so far
    pub fn copy_commands_recorded(&self) -> u64 {
        self.copy_commands
    }

    /// The staging region
    pub fn staging(&mut self) -> &mut StagingBuffer {
        &mut self.staging
    }

    /// Cached format properties of the device
    pub fn formats(&self) -> &FormatTable {
        &self.formats
    }

    /// Record with `record`, submit to the graphics queue and wait for completion
    ///
    /// After a [`VulkanError::TransferTimeout`] the next call first waits for
    /// the earlier submission again and fails the same way if it is still
    /// running.
    pub fn execute_graphics<F>(&mut self, record: F) -> VulkanResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> VulkanResult<()>,
    {
        self.settle()?;

        let command_buffer = self.command_buffer.begin_one_time()?;
        let recorded = record(self.access.device(), command_buffer);
        let ended = self.command_buffer.end();
        recorded?;
        ended?;

        self.access
            .submit_graphics(command_buffer, None, None, Some(&self.fence))?;
        self.pending = true;
        self.settle()
    }

    fn settle(&mut self) -> VulkanResult<()> {
        let fence = &self.fence;
        settle_pending(
            &mut self.pending,
            self.settings.fence_timeout_ns,
            |timeout_ns| fence.wait_timeout(timeout_ns),
            || fence.reset(),
        )
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) -> VulkanResult<()> {
        self.execute_graphics(|device, command_buffer| {
            unsafe { device.cmd_copy_buffer(command_buffer, src, dst, regions) };
            Ok(())
        })?;
        self.copy_commands += 1;
        Ok(())
    }

    /// Copy `data` into `dst` at `offset`
    ///
    /// Host-visible memory is written directly unless staging is forced;
    /// anything else is staged and copied on the graphics queue with one
    /// copy command.
    pub fn transfer_data(&mut self, dst: &BufferResource, data: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        dst.check_range(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        if self.settings.writes_directly(dst.memory()?.property_flags()) {
            return dst.write_bytes(data, offset);
        }

        self.staging.write(data)?;
        let src = self.staging.handle()?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size: data.len() as vk::DeviceSize,
        };
        self.copy_buffer(src, dst.handle(), &[region])
    }

    /// Copy a slice of plain values into `dst` at `offset`
    pub fn transfer_slice<T: Pod>(&mut self, dst: &BufferResource, data: &[T], offset: vk::DeviceSize) -> VulkanResult<()> {
        self.transfer_data(dst, bytemuck::cast_slice(data), offset)
    }

    /// Copy strided elements from `src` into `dst`
    ///
    /// Host-visible memory gets one copy per element through a single
    /// mapping. Otherwise the source span is staged once and copied with one
    /// region per element.
    pub fn transfer_strided(&mut self, dst: &BufferResource, src: &[u8], copy: StridedCopy) -> VulkanResult<()> {
        copy.validate(src.len(), dst.size())?;
        if copy.element_count == 0 {
            return Ok(());
        }
        let element_size = copy.element_size as usize;

        let memory = dst.memory()?;
        if self.settings.writes_directly(memory.property_flags()) {
            let span = copy.destination_span().unwrap_or(0);
            return memory.with_mapped(copy.dst_offset, span, |mapped| {
                for i in 0..copy.element_count as usize {
                    let from = i * copy.src_stride as usize;
                    let to = i * copy.dst_stride as usize;
                    mapped[to..to + element_size].copy_from_slice(&src[from..from + element_size]);
                }
            });
        }

        let staged = copy.source_span().unwrap_or(0) as usize;
        self.staging.write(&src[..staged])?;
        let staging = self.staging.handle()?;
        self.copy_buffer(staging, dst.handle(), &copy.regions())
    }

    /// Copy `out.len()` bytes at `offset` of `src` back to the host
    ///
    /// `src` needs TRANSFER_SRC usage unless its memory is host visible.
    pub fn read_back(&mut self, src: &BufferResource, out: &mut [u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        src.check_range(offset, out.len())?;
        if out.is_empty() {
            return Ok(());
        }

        if self.settings.writes_directly(src.memory()?.property_flags()) {
            return src.read_bytes(out, offset);
        }

        let size = out.len() as vk::DeviceSize;
        self.staging.expand(size)?;
        let staging = self.staging.handle()?;
        let region = vk::BufferCopy {
            src_offset: offset,
            dst_offset: 0,
            size,
        };
        let src_buffer = src.handle();
        self.execute_graphics(|device, command_buffer| {
            unsafe {
                device.cmd_copy_buffer(command_buffer, src_buffer, staging, &[region]);
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    vk::DependencyFlags::empty(),
                    &[MemoryBarrierBuilder::transfer_write_to_host_read()],
                    &[],
                    &[],
                );
            }
            Ok(())
        })?;
        self.copy_commands += 1;
        self.staging.read(out)
    }

    /// Create a sampled 2D texture from tightly packed `pixels`
    ///
    /// Blits from an image aliased over the staging memory when the device
    /// allows it, otherwise copies from the staging buffer. The texture ends
    /// in `final_state`'s layout; pass [`ImageBarrier::shader_read`] for
    /// sampling.
    pub fn create_texture_2d(
        &mut self,
        format: vk::Format,
        extent: vk::Extent2D,
        pixels: &[u8],
        final_state: ImageBarrier,
    ) -> VulkanResult<ImageResource> {
        if extent.width == 0 || extent.height == 0 {
            return Err(VulkanError::invalid("texture extent has no area"));
        }
        let expected = image_data_size(format, extent)
            .ok_or_else(|| VulkanError::invalid(format!("no pixel size known for {format:?}")))?;
        if pixels.len() as vk::DeviceSize != expected {
            return Err(VulkanError::invalid(format!(
                "{} bytes of pixels for a {}x{} {format:?} image needing {expected}",
                pixels.len(),
                extent.width,
                extent.height
            )));
        }

        let usage = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
        let texture = ImageResource::new_2d(&self.access, format, extent, usage)?;
        self.staging.write(pixels)?;

        let aliased = if self.formats.supports_optimal(format, vk::FormatFeatureFlags::BLIT_DST) {
            self.staging.aliased_image_2d(&self.formats, format, extent)?
        } else {
            None
        };
        let staging = self.staging.handle()?;
        let dst = texture.handle();

        match aliased {
            Some(src) => {
                log::debug!("Uploading {format:?} texture by blit from aliased staging image");
                self.execute_graphics(|device, command_buffer| {
                    let to_source = vk::ImageMemoryBarrier::builder()
                        .src_access_mask(vk::AccessFlags::HOST_WRITE)
                        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                        .old_layout(vk::ImageLayout::PREINITIALIZED)
                        .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(src)
                        .subresource_range(color_subresource_range())
                        .build();
                    unsafe {
                        device.cmd_pipeline_barrier(
                            command_buffer,
                            vk::PipelineStageFlags::HOST,
                            vk::PipelineStageFlags::TRANSFER,
                            vk::DependencyFlags::empty(),
                            &[],
                            &[],
                            &[to_source],
                        );
                    }
                    cmd_blit_image(
                        device,
                        command_buffer,
                        src,
                        dst,
                        &full_blit_region(extent, extent),
                        ImageBarrier::undefined(),
                        final_state,
                        DEFAULT_BLIT_FILTER,
                    );
                    Ok(())
                })?;
            }
            None => {
                log::debug!("Uploading {format:?} texture by buffer-to-image copy");
                self.execute_graphics(|device, command_buffer| {
                    cmd_copy_buffer_to_image(
                        device,
                        command_buffer,
                        staging,
                        dst,
                        &full_copy_region(0, extent),
                        ImageBarrier::undefined(),
                        final_state,
                    );
                    Ok(())
                })?;
            }
        }
        self.copy_commands += 1;

        Ok(texture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_path_needs_host_visible() {
        assert!(is_direct_path(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL));
        assert!(is_direct_path(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT));
        assert!(!is_direct_path(vk::MemoryPropertyFlags::DEVICE_LOCAL));
    }

    #[test]
    fn test_forced_staging_skips_direct_path() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let settings = TransferSettings::default();
        assert!(settings.writes_directly(host));
        assert!(!settings.writes_directly(vk::MemoryPropertyFlags::DEVICE_LOCAL));

        let forced = TransferSettings { force_staging: true, ..settings };
        assert!(!forced.writes_directly(host));
    }

    #[test]
    fn test_settings_follow_context_config() {
        let config = ContextConfig::new("transfer").with_fence_timeout(1_234).with_force_staging(true);
        let settings = TransferSettings::from(&config);
        assert_eq!(settings.fence_timeout_ns, 1_234);
        assert!(settings.force_staging);

        let defaults = TransferSettings::from(&ContextConfig::default());
        assert_eq!(defaults, TransferSettings::default());
    }

    #[test]
    fn test_settle_without_pending_work_is_a_no_op() {
        let mut pending = false;
        let result = settle_pending(&mut pending, 10, |_| panic!("no wait expected"), || panic!("no reset expected"));
        assert!(result.is_ok());
    }

    #[test]
    fn test_settle_timeout_keeps_work_pending() {
        let mut pending = true;
        let mut resets = 0;
        let result = settle_pending(&mut pending, 10, |_| Ok(false), || {
            resets += 1;
            Ok(())
        });

        assert!(matches!(result, Err(VulkanError::TransferTimeout { timeout_ns: 10 })));
        assert!(pending);
        assert_eq!(resets, 0);

        // Retried once the GPU catches up
        let mut waited_for = 0;
        let result = settle_pending(
            &mut pending,
            20,
            |timeout_ns| {
                waited_for = timeout_ns;
                Ok(true)
            },
            || {
                resets += 1;
                Ok(())
            },
        );
        assert!(result.is_ok());
        assert!(!pending);
        assert_eq!(waited_for, 20);
        assert_eq!(resets, 1);
    }

    #[test]
    fn test_settle_propagates_wait_errors() {
        let mut pending = true;
        let result = settle_pending(&mut pending, 10, |_| Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST)), || Ok(()));
        assert!(matches!(result, Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST))));
        assert!(pending);
    }

    #[test]
    fn test_strided_regions() {
        let copy = StridedCopy {
            element_count: 3,
            element_size: 12,
            src_stride: 16,
            dst_stride: 32,
            dst_offset: 64,
        };
        let regions = copy.regions();

        assert_eq!(regions.len(), 3);
        assert_eq!((regions[0].src_offset, regions[0].dst_offset, regions[0].size), (0, 64, 12));
        assert_eq!((regions[1].src_offset, regions[1].dst_offset), (16, 96));
        assert_eq!((regions[2].src_offset, regions[2].dst_offset), (32, 128));
    }

    #[test]
    fn test_strided_spans_exclude_trailing_padding() {
        let copy = StridedCopy::scatter(4, 8, 24);
        assert_eq!(copy.source_span(), Some(32));
        assert_eq!(copy.destination_span(), Some(3 * 24 + 8));

        let empty = StridedCopy::scatter(0, 8, 24);
        assert_eq!(empty.source_span(), Some(0));
        assert!(empty.regions().is_empty());
    }

    #[test]
    fn test_strided_validation() {
        let copy = StridedCopy::scatter(4, 8, 24);
        assert!(copy.validate(32, 80).is_ok());
        assert!(copy.validate(31, 80).is_err());
        assert!(copy.validate(32, 79).is_err());
        assert!(copy.at_offset(1).validate(32, 80).is_err());

        let overlapping = StridedCopy {
            element_size: 32,
            ..copy
        };
        assert!(overlapping.validate(1024, 1024).is_err());
    }
}
