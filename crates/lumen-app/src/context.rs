//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use lumen_gpu::sync::{create_semaphore, destroy_semaphore};
use lumen_gpu::{
    GpuContext, HostBufferPool, HostBufferPoolConfig, Surface, Swapchain, SwapchainRequest,
};
use winit::window::Window;

/// Application context shared across all app methods.
///
/// Provides access to the GPU context, window, surface and swapchain.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// Surface of the window.
    pub surface: Surface,
    /// Current swapchain.
    pub swapchain: Swapchain,
    /// Queue family used for rendering and presentation.
    pub present_family: u32,
    /// Per-swapchain-image render finished semaphores.
    pub(crate) render_finished: Vec<vk::Semaphore>,
    /// Extent the swapchain was last requested with.
    pub(crate) requested_extent: vk::Extent2D,
    /// Set when presentation reported the chain out of date.
    pub(crate) needs_recreate: bool,
    /// Total frames rendered.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
    /// Whether vsync is enabled.
    pub vsync: bool,
    pub(crate) frames_in_flight: usize,
    /// GPU context with device and pools. Dropped last.
    pub gpu: GpuContext,
}

impl AppContext {
    /// Create a new application context.
    ///
    /// # Safety
    /// The window must have valid handles and outlive the context.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: GpuContext,
        vsync: bool,
        frames_in_flight: usize,
    ) -> anyhow::Result<Self> {
        let surface = unsafe { gpu.create_surface(window.as_ref())? };
        let present_family = unsafe { surface.find_present_family(gpu.queues())? };
        tracing::debug!(present_family, "Selected present queue family");

        let size = window.inner_size();
        let mut ctx = Self {
            window,
            surface,
            swapchain: gpu.create_swapchain(),
            present_family,
            render_finished: Vec::new(),
            requested_extent: vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            needs_recreate: false,
            frame_count: 0,
            last_frame_time: Instant::now(),
            vsync,
            frames_in_flight: frames_in_flight.max(1),
            gpu,
        };

        // On failure the context drops here and releases what was created.
        unsafe { ctx.recreate_swapchain(size.width, size.height)? };

        Ok(ctx)
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Get the swapchain width.
    pub fn width(&self) -> u32 {
        self.swapchain.extent().width
    }

    /// Get the swapchain height.
    pub fn height(&self) -> u32 {
        self.swapchain.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.swapchain.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Create a host buffer pool on this context's device.
    ///
    /// The pool must be dropped before the context.
    pub fn create_host_buffer_pool(&self, config: HostBufferPoolConfig) -> HostBufferPool {
        HostBufferPool::new(self.gpu.device_api(), config)
    }

    /// Whether the window size no longer matches the swapchain request.
    pub(crate) fn window_resized(&self) -> bool {
        let size = self.window.inner_size();
        size.width != self.requested_extent.width || size.height != self.requested_extent.height
    }

    /// Recreate the swapchain for a window of `width` x `height`.
    ///
    /// # Safety
    /// The GPU must be idle.
    pub(crate) unsafe fn recreate_swapchain(
        &mut self,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()> {
        self.requested_extent = vk::Extent2D { width, height };
        self.needs_recreate = false;

        let request = SwapchainRequest::new(width, height)
            .with_image_count(self.frames_in_flight as u32 + 1)
            .with_vsync(self.vsync);
        unsafe {
            self.swapchain
                .recreate(self.gpu.vulkan_device(), &mut self.surface, &request)?;
        }

        unsafe { self.destroy_render_finished() };
        for _ in 0..self.swapchain.images().len() {
            let semaphore = unsafe { create_semaphore(self.gpu.vulkan_device())? };
            self.render_finished.push(semaphore);
        }

        Ok(())
    }

    unsafe fn destroy_render_finished(&mut self) {
        let device = self.gpu.vulkan_device();
        for semaphore in self.render_finished.drain(..) {
            unsafe { destroy_semaphore(device, semaphore) };
        }
    }

    /// Cleanup all resources. Safe to call more than once.
    ///
    /// # Safety
    /// The GPU must be idle and all resources must not be in use.
    pub(crate) unsafe fn cleanup(&mut self) {
        unsafe {
            self.destroy_render_finished();
            self.swapchain.destroy(self.gpu.vulkan_device());
            self.surface.destroy();
        }
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            tracing::warn!("Failed to wait for device idle: {e}");
        }
        // SAFETY: the device is idle.
        unsafe { self.cleanup() };
    }
}
