//! Per-frame resources and the context handed to `render`.

use ash::vk;
use lumen_gpu::sync::FrameSync;
use lumen_gpu::{HostBufferPool, HostBufferPoolConfig, HostBufferUsage};

use crate::context::AppContext;

/// Context for the current frame being rendered.
///
/// Provides access to the command buffer, the swapchain image and the
/// frame's host buffer pool, which was reset when the frame began and is
/// flushed before submission.
pub struct FrameContext<'a> {
    /// Command buffer for recording rendering commands.
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// The swapchain image for this frame, in `UNDEFINED` layout. It must
    /// be left in `PRESENT_SRC_KHR`.
    pub swapchain_image: vk::Image,
    pub extent: vk::Extent2D,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Current frame number.
    pub frame_number: u64,
    /// Slot in the frames-in-flight ring.
    pub frame_index: usize,
    /// Uniform data staged for this frame.
    pub uniforms: &'a mut HostBufferPool,
}

/// Synchronization and host memory owned by one frame in flight.
pub(crate) struct FrameResources {
    pub sync: FrameSync,
    pub uniforms: HostBufferPool,
}

/// Ring of frame resources, advanced once per presented frame.
pub(crate) struct FrameRing {
    frames: Vec<FrameResources>,
    current: usize,
}

impl FrameRing {
    /// # Safety
    /// The context's device must be valid.
    pub unsafe fn new(ctx: &AppContext, count: usize) -> anyhow::Result<Self> {
        let mut ring = Self {
            frames: Vec::with_capacity(count),
            current: 0,
        };

        for _ in 0..count.max(1) {
            let sync = match unsafe { FrameSync::new(ctx.gpu.vulkan_device()) } {
                Ok(sync) => sync,
                Err(e) => {
                    unsafe { ring.destroy(ctx) };
                    return Err(e.into());
                }
            };
            ring.frames.push(FrameResources {
                sync,
                uniforms: HostBufferPool::new(
                    ctx.gpu.device_api(),
                    HostBufferPoolConfig::new(HostBufferUsage::Uniform),
                ),
            });
        }

        Ok(ring)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&mut self) -> &mut FrameResources {
        &mut self.frames[self.current]
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames.len();
    }

    /// # Safety
    /// The GPU must be idle.
    pub unsafe fn destroy(&mut self, ctx: &AppContext) {
        for mut frame in self.frames.drain(..) {
            if let Err(e) = frame.uniforms.destroy() {
                tracing::warn!("Failed to destroy frame uniforms: {e}");
            }
            unsafe { frame.sync.destroy(ctx.gpu.vulkan_device()) };
        }
    }
}
