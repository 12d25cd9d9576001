//! Layout transitions around transfer commands
//!
//! Copy-to-image and blit both write an image in TRANSFER_DST_OPTIMAL. The
//! caller describes where the image comes from and where it goes next with a
//! pair of [`ImageBarrier`]s; a side whose `needed` is false emits nothing,
//! for images the caller already keeps in the right layout.

use ash::{vk, Device};

/// One side of a layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    /// Whether a barrier is emitted for this side at all
    pub needed: bool,
    /// Stage that produced (from) or will consume (to) the image
    pub stage: vk::PipelineStageFlags,
    /// Access that produced (from) or will consume (to) the image
    pub access: vk::AccessFlags,
    /// Layout before (from) or after (to) the transfer
    pub layout: vk::ImageLayout,
}

impl ImageBarrier {
    /// No transition on this side
    pub const NONE: Self = Self {
        needed: false,
        stage: vk::PipelineStageFlags::empty(),
        access: vk::AccessFlags::empty(),
        layout: vk::ImageLayout::UNDEFINED,
    };

    /// A needed transition
    pub const fn new(stage: vk::PipelineStageFlags, access: vk::AccessFlags, layout: vk::ImageLayout) -> Self {
        Self {
            needed: true,
            stage,
            access,
            layout,
        }
    }

    /// Fresh image whose contents may be discarded
    pub const fn undefined() -> Self {
        Self::new(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::ImageLayout::UNDEFINED,
        )
    }

    /// Image read by fragment shaders afterwards
    pub const fn shader_read() -> Self {
        Self::new(
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    }

    /// Swapchain image handed to the presentation engine afterwards
    pub const fn present() -> Self {
        Self::new(
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
    }
}

impl Default for ImageBarrier {
    fn default() -> Self {
        Self::NONE
    }
}

/// A single pipeline barrier ready to record
#[derive(Debug, Clone, Copy)]
pub struct PlannedBarrier {
    /// Source stage mask
    pub src_stage: vk::PipelineStageFlags,
    /// Destination stage mask
    pub dst_stage: vk::PipelineStageFlags,
    /// The image barrier itself
    pub barrier: vk::ImageMemoryBarrier,
}

impl PlannedBarrier {
    fn record(&self, device: &Device, command_buffer: vk::CommandBuffer) {
        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                self.src_stage,
                self.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[self.barrier],
            );
        }
    }
}

/// The barriers recorded before and after a transfer write
#[derive(Debug, Clone, Copy, Default)]
pub struct BarrierPlan {
    /// Transition into TRANSFER_DST_OPTIMAL
    pub before: Option<PlannedBarrier>,
    /// Transition out of TRANSFER_DST_OPTIMAL
    pub after: Option<PlannedBarrier>,
}

impl BarrierPlan {
    /// Number of barriers the plan records
    pub fn barrier_count(&self) -> usize {
        usize::from(self.before.is_some()) + usize::from(self.after.is_some())
    }
}

/// Plan the transitions around a transfer write to `image`
pub fn plan_transfer_dst_barriers(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    from: ImageBarrier,
    to: ImageBarrier,
) -> BarrierPlan {
    let barrier = |src_access, dst_access, old_layout, new_layout| {
        vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
            .build()
    };

    let before = from.needed.then(|| PlannedBarrier {
        src_stage: from.stage,
        dst_stage: vk::PipelineStageFlags::TRANSFER,
        barrier: barrier(
            from.access,
            vk::AccessFlags::TRANSFER_WRITE,
            from.layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ),
    });

    let after = to.needed.then(|| PlannedBarrier {
        src_stage: vk::PipelineStageFlags::TRANSFER,
        dst_stage: to.stage,
        barrier: barrier(
            vk::AccessFlags::TRANSFER_WRITE,
            to.access,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            to.layout,
        ),
    });

    BarrierPlan { before, after }
}

/// The single mip level a transfer region writes
pub fn subresource_range(layers: vk::ImageSubresourceLayers) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: layers.aspect_mask,
        base_mip_level: layers.mip_level,
        level_count: 1,
        base_array_layer: layers.base_array_layer,
        layer_count: layers.layer_count,
    }
}

/// Mip level zero, layer zero of the color aspect
pub fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Region copying a tightly packed buffer into a whole 2D image
pub fn full_copy_region(buffer_offset: vk::DeviceSize, extent: vk::Extent2D) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: color_layers(),
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

fn corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: i32::try_from(extent.width).unwrap_or(i32::MAX),
        y: i32::try_from(extent.height).unwrap_or(i32::MAX),
        z: 1,
    }
}

/// Region blitting all of `src_extent` onto all of `dst_extent`, scaling as needed
pub fn full_blit_region(src_extent: vk::Extent2D, dst_extent: vk::Extent2D) -> vk::ImageBlit {
    vk::ImageBlit {
        src_subresource: color_layers(),
        src_offsets: [vk::Offset3D::default(), corner(src_extent)],
        dst_subresource: color_layers(),
        dst_offsets: [vk::Offset3D::default(), corner(dst_extent)],
    }
}

/// Record a buffer-to-image copy wrapped in the transitions `from` and `to` ask for
pub fn cmd_copy_buffer_to_image(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    buffer: vk::Buffer,
    image: vk::Image,
    region: &vk::BufferImageCopy,
    from: ImageBarrier,
    to: ImageBarrier,
) {
    let plan = plan_transfer_dst_barriers(image, subresource_range(region.image_subresource), from, to);

    if let Some(before) = &plan.before {
        before.record(device, command_buffer);
    }
    unsafe {
        device.cmd_copy_buffer_to_image(
            command_buffer,
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(region),
        );
    }
    if let Some(after) = &plan.after {
        after.record(device, command_buffer);
    }
}

/// Record a blit from `src` (in TRANSFER_SRC_OPTIMAL) into `dst`
///
/// The transitions apply to the destination image; `filter` is used when
/// the regions differ in size. [`vk::Filter::LINEAR`] is the usual choice.
pub fn cmd_blit_image(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    region: &vk::ImageBlit,
    dst_from: ImageBarrier,
    dst_to: ImageBarrier,
    filter: vk::Filter,
) {
    let plan = plan_transfer_dst_barriers(dst, subresource_range(region.dst_subresource), dst_from, dst_to);

    if let Some(before) = &plan.before {
        before.record(device, command_buffer);
    }
    unsafe {
        device.cmd_blit_image(
            command_buffer,
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(region),
            filter,
        );
    }
    if let Some(after) = &plan.after {
        after.record(device, command_buffer);
    }
}

/// Blit filter when the caller has no preference
pub const DEFAULT_BLIT_FILTER: vk::Filter = vk::Filter::LINEAR;

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn image() -> vk::Image {
        vk::Image::from_raw(0x42)
    }

    #[test]
    fn test_copy_to_present_emits_two_barriers() {
        let from = ImageBarrier::undefined();
        let to = ImageBarrier::present();
        let plan = plan_transfer_dst_barriers(image(), subresource_range(color_layers()), from, to);

        assert_eq!(plan.barrier_count(), 2);

        let before = plan.before.unwrap();
        assert_eq!(before.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(before.dst_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(before.barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(before.barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(before.barrier.src_access_mask, vk::AccessFlags::empty());
        assert_eq!(before.barrier.dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);

        let after = plan.after.unwrap();
        assert_eq!(after.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(after.dst_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert_eq!(after.barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(after.barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(after.barrier.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(after.barrier.dst_access_mask, vk::AccessFlags::empty());
    }

    #[test]
    fn test_unneeded_sides_are_skipped() {
        let range = subresource_range(color_layers());
        let plan = plan_transfer_dst_barriers(image(), range, ImageBarrier::NONE, ImageBarrier::NONE);
        assert_eq!(plan.barrier_count(), 0);

        let plan = plan_transfer_dst_barriers(image(), range, ImageBarrier::NONE, ImageBarrier::shader_read());
        assert!(plan.before.is_none());
        assert_eq!(plan.after.unwrap().barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn test_barriers_target_given_image_and_level() {
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 3,
            base_array_layer: 1,
            layer_count: 2,
        };
        let plan = plan_transfer_dst_barriers(
            image(),
            subresource_range(layers),
            ImageBarrier::undefined(),
            ImageBarrier::NONE,
        );
        let barrier = plan.before.unwrap().barrier;
        assert_eq!(barrier.image, image());
        assert_eq!(barrier.subresource_range.base_mip_level, 3);
        assert_eq!(barrier.subresource_range.level_count, 1);
        assert_eq!(barrier.subresource_range.base_array_layer, 1);
        assert_eq!(barrier.subresource_range.layer_count, 2);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn test_blit_region_spans_both_extents() {
        let region = full_blit_region(
            vk::Extent2D { width: 64, height: 32 },
            vk::Extent2D { width: 128, height: 128 },
        );
        assert_eq!(region.src_offsets[1], vk::Offset3D { x: 64, y: 32, z: 1 });
        assert_eq!(region.dst_offsets[1], vk::Offset3D { x: 128, y: 128, z: 1 });
        assert_eq!(DEFAULT_BLIT_FILTER, vk::Filter::LINEAR);
    }

    #[test]
    fn test_default_is_no_transition() {
        assert_eq!(ImageBarrier::default(), ImageBarrier::NONE);
        assert!(!ImageBarrier::default().needed);
    }
}
