//! Viewer application: uploads a test pattern once and blits it into every
//! swapchain image.

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::{info, warn};

use lumen_app::{AppContext, Application, FrameContext};
use lumen_gpu::command::{self, Rect};
use lumen_gpu::{GpuImage, HostBufferPoolConfig, HostBufferUsage, OneTimeSubmit, QueueSelector};

use crate::pattern::Checkerboard;

/// Edge length of the uploaded pattern in pixels.
const PATTERN_SIZE: u32 = 512;

/// Edge length of one checkerboard square.
const PATTERN_CELL: u32 = 32;

/// Viewer application state.
pub struct Viewer {
    /// Pattern image, kept in `TRANSFER_SRC_OPTIMAL` after the upload.
    pattern: GpuImage,
    pattern_rect: Rect,
    pattern_aspect: f32,
    /// Seconds since start, drives the background colour.
    time: f32,
}

impl Application for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let board = Checkerboard::new(PATTERN_SIZE, PATTERN_SIZE, PATTERN_CELL);
        let pattern = upload_pattern(ctx, &board)?;

        info!(
            width = board.width,
            height = board.height,
            "Test pattern uploaded"
        );

        Ok(Self {
            pattern,
            pattern_rect: Rect::from_extent(vk::Extent2D {
                width: board.width,
                height: board.height,
            }),
            pattern_aspect: board.aspect(),
            time: 0.0,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.time += dt;
    }

    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
        let device = ctx.gpu.device();
        let cmd = frame.command_buffer;
        let target = frame.swapchain_image;
        let dst_rect = Rect::from_extent(frame.extent).fit_aspect(self.pattern_aspect);

        // SAFETY: the command buffer is recording, the pattern is in
        // TRANSFER_SRC_OPTIMAL and the swapchain image starts UNDEFINED.
        unsafe {
            command::transition_image_layout(
                device,
                cmd,
                target,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            command::clear_color_image(device, cmd, target, background_color(self.time));

            // Order the blit after the clear.
            command::transition_image_layout(
                device,
                cmd,
                target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            command::blit_image(
                device,
                cmd,
                self.pattern.image,
                self.pattern_rect,
                target,
                dst_rect,
                vk::Filter::NEAREST,
            );

            command::transition_image_layout(
                device,
                cmd,
                target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        }

        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        let fitted = Rect {
            x: 0,
            y: 0,
            width,
            height,
        }
        .fit_aspect(self.pattern_aspect);
        info!(
            width = fitted.width,
            height = fitted.height,
            "Pattern rescaled"
        );
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        let freed = ctx
            .gpu
            .vulkan_device()
            .allocator()
            .lock()
            .free_image(&mut self.pattern);
        if let Err(e) = freed {
            warn!("Failed to free pattern image: {e}");
        }
    }
}

/// Create the pattern image and fill it through a staging pool and a
/// one-time submission on the presentation family.
fn upload_pattern(ctx: &AppContext, board: &Checkerboard) -> anyhow::Result<GpuImage> {
    let extent = vk::Extent2D {
        width: board.width,
        height: board.height,
    };
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_UNORM)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let allocator = ctx.gpu.vulkan_device().allocator();
    let mut image = allocator
        .lock()
        .create_image(&image_info, MemoryLocation::GpuOnly, "viewer_pattern")?;

    let mut staging =
        ctx.create_host_buffer_pool(HostBufferPoolConfig::new(HostBufferUsage::Staging));

    let uploaded = staging
        .suballocate(&board.pixels())
        .and_then(|upload| staging.flush().map(|()| upload))
        .map_err(anyhow::Error::from)
        .and_then(|upload| {
            let device = ctx.gpu.device();
            let target = image.image;
            let options = OneTimeSubmit::new().with_await_completion(true);

            ctx.gpu
                .submit_one_time(
                    QueueSelector::Family(ctx.present_family),
                    &options,
                    |cmd| {
                        // SAFETY: the buffer is recording and the image is
                        // only used by this submission.
                        unsafe {
                            command::transition_image_layout(
                                device,
                                cmd,
                                target,
                                vk::ImageLayout::UNDEFINED,
                                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            );
                            command::copy_buffer_to_image(
                                device,
                                cmd,
                                upload.buffer,
                                upload.offset,
                                target,
                                extent,
                            );
                            command::transition_image_layout(
                                device,
                                cmd,
                                target,
                                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            );
                        }
                        true
                    },
                )
                .into_result()
                .map_err(anyhow::Error::from)
        });

    if uploaded.is_err() {
        // The submission may still be pending after a failed wait.
        if let Err(e) = ctx.gpu.wait_idle() {
            warn!("Failed to wait for device idle: {e}");
        }
    }
    if let Err(e) = staging.destroy() {
        warn!("Failed to free staging pages: {e}");
    }

    match uploaded {
        Ok(result) => {
            tracing::debug!(
                family = ?result.family_index,
                queue = ?result.queue_index,
                "Pattern upload completed"
            );
            Ok(image)
        }
        Err(e) => {
            if let Err(free_err) = allocator.lock().free_image(&mut image) {
                warn!("Failed to free pattern image: {free_err}");
            }
            Err(e.context("uploading the test pattern"))
        }
    }
}

/// Slowly cycling dark background.
pub fn background_color(time: f32) -> [f32; 4] {
    let phase = time * 0.5;
    [
        0.08 + 0.06 * phase.sin().abs(),
        0.10 + 0.04 * (phase * 0.7).sin().abs(),
        0.16 + 0.08 * (phase * 0.3).cos().abs(),
        1.0,
    ]
}
