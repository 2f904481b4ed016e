//! Command recording helpers.
//!
//! Thin wrappers over the transfer commands the viewer and upload paths
//! record into pooled command buffers.

use ash::vk;

/// Full colour subresource range of a single-mip, single-layer image.
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

fn color_subresource_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1)
}

/// Stage and access masks a layout is used with.
fn layout_usage(layout: vk::ImageLayout) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
        ),
        _ => (
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        ),
    }
}

/// Record a layout transition of a colour image.
///
/// # Safety
/// The command buffer must be recording and the image valid.
pub unsafe fn transition_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_stage, src_access) = layout_usage(old_layout);
    let (dst_stage, dst_access) = layout_usage(new_layout);

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range())
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

    device.cmd_pipeline_barrier(
        cmd,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

/// Copy tightly packed pixels from `buffer` at `offset` into the whole image.
///
/// # Safety
/// The command buffer must be recording, and the image must be in
/// `TRANSFER_DST_OPTIMAL` layout.
pub unsafe fn copy_buffer_to_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    image: vk::Image,
    extent: vk::Extent2D,
) {
    let region = vk::BufferImageCopy::default()
        .buffer_offset(offset)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(color_subresource_layers())
        .image_offset(vk::Offset3D::default())
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        });

    device.cmd_copy_buffer_to_image(
        cmd,
        buffer,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[region],
    );
}

/// Fill a colour image with a single value.
///
/// # Safety
/// The command buffer must be recording, and the image must be in
/// `TRANSFER_DST_OPTIMAL` layout.
pub unsafe fn clear_color_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    color: [f32; 4],
) {
    let clear = vk::ClearColorValue { float32: color };
    device.cmd_clear_color_image(
        cmd,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &clear,
        &[color_subresource_range()],
    );
}

/// Region of a 2D image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn from_extent(extent: vk::Extent2D) -> Self {
        Self {
            x: 0,
            y: 0,
            width: extent.width,
            height: extent.height,
        }
    }

    /// The largest rect of `aspect` (width over height) centred inside
    /// `self`.
    pub fn fit_aspect(self, aspect: f32) -> Self {
        if self.width == 0 || self.height == 0 || aspect <= 0.0 {
            return self;
        }

        let own = self.width as f32 / self.height as f32;
        let (width, height) = if own > aspect {
            ((self.height as f32 * aspect).round() as u32, self.height)
        } else {
            (self.width, (self.width as f32 / aspect).round() as u32)
        };

        Self {
            x: self.x + ((self.width - width) / 2) as i32,
            y: self.y + ((self.height - height) / 2) as i32,
            width,
            height,
        }
    }

    fn corners(self) -> [vk::Offset3D; 2] {
        [
            vk::Offset3D {
                x: self.x,
                y: self.y,
                z: 0,
            },
            vk::Offset3D {
                x: self.x + self.width as i32,
                y: self.y + self.height as i32,
                z: 1,
            },
        ]
    }
}

/// Scale-copy `src_rect` of one image into `dst_rect` of another.
///
/// # Safety
/// The command buffer must be recording, `src` must be in
/// `TRANSFER_SRC_OPTIMAL` and `dst` in `TRANSFER_DST_OPTIMAL` layout.
pub unsafe fn blit_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Image,
    src_rect: Rect,
    dst: vk::Image,
    dst_rect: Rect,
    filter: vk::Filter,
) {
    let region = vk::ImageBlit::default()
        .src_subresource(color_subresource_layers())
        .src_offsets(src_rect.corners())
        .dst_subresource(color_subresource_layers())
        .dst_offsets(dst_rect.corners());

    device.cmd_blit_image(
        cmd,
        src,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        dst,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[region],
        filter,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_aspect_pillarboxes_wide_targets() {
        let target = Rect::from_extent(vk::Extent2D {
            width: 1600,
            height: 900,
        });
        let fitted = target.fit_aspect(1.0);
        assert_eq!(
            fitted,
            Rect {
                x: 350,
                y: 0,
                width: 900,
                height: 900
            }
        );
    }

    #[test]
    fn fit_aspect_letterboxes_tall_targets() {
        let target = Rect::from_extent(vk::Extent2D {
            width: 400,
            height: 800,
        });
        let fitted = target.fit_aspect(2.0);
        assert_eq!(
            fitted,
            Rect {
                x: 0,
                y: 300,
                width: 400,
                height: 200
            }
        );
    }

    #[test]
    fn transfer_layouts_use_transfer_stage() {
        let (stage, access) = layout_usage(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(access, vk::AccessFlags::TRANSFER_WRITE);

        let (stage, access) = layout_usage(vk::ImageLayout::UNDEFINED);
        assert_eq!(stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert!(access.is_empty());
    }
}
