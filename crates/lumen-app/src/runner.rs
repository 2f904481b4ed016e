//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ash::vk;
use lumen_gpu::{
    AcquiredCommandBuffer, FrameOutcome, GpuContextBuilder, GpuError, QueueSelector, SubmitBatch,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::Application;
use crate::context::AppContext;
use crate::frame::{FrameContext, FrameRing};

/// Stages the first frame commands touch the acquired swapchain image at.
const SWAPCHAIN_WAIT_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::TRANSFER.as_raw()
        | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT.as_raw(),
);

/// Application configuration.
#[derive(Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Lumen".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
            frames_in_flight: 2,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the number of frames in flight (at least one).
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|fps| *fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Run an application with the given configuration.
///
/// This function initializes logging, creates the window and GPU context,
/// and runs the event loop until the application exits. Initialization
/// failures, and frames that leave their slot unusable, are returned once
/// the event loop has stopped.
pub fn run_app<A: Application + 'static>(config: AppConfig) -> anyhow::Result<()> {
    // A subscriber may already be installed by the host program.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        fatal_error: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.fatal_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Internal application runner that implements winit's ApplicationHandler.
struct AppRunner<A: Application> {
    config: AppConfig,
    state: Option<AppState<A>>,
    fatal_error: Option<anyhow::Error>,
}

/// Internal application state.
///
/// Field order is drop order: the app and the frame ring release their GPU
/// objects before the context tears down the device.
struct AppState<A: Application> {
    app: A,
    frames: FrameRing,
    ctx: AppContext,
    target_frame_time: Option<Duration>,
    /// A frame slot's fence or acquire semaphore can no longer be trusted.
    slot_lost: bool,
    cleaned_up: bool,
    // FPS tracking
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: Application + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.fatal_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        // Let the app handle the event first
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.render_frame() {
                    Ok(()) => state.ctx.window.request_redraw(),
                    Err(e) if state.slot_lost => {
                        error!("Frame slot lost, shutting down: {e:#}");
                        if let Some(mut state) = self.state.take() {
                            state.cleanup();
                        }
                        self.fatal_error = Some(e);
                        event_loop.exit();
                    }
                    Err(e) => {
                        error!("Render error: {e:#}");
                        state.ctx.window.request_redraw();
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
    }
}

impl<A: Application + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build()?;

        info!("GPU: {}", gpu.capabilities().summary());

        // SAFETY: the window is kept alive by the context.
        let mut ctx = unsafe {
            AppContext::new(window, gpu, self.config.vsync, self.config.frames_in_flight)?
        };
        // SAFETY: the context's device is valid for the ring's lifetime.
        let mut frames = unsafe { FrameRing::new(&ctx, ctx.frames_in_flight())? };

        let app = match A::init(&mut ctx) {
            Ok(app) => app,
            Err(e) => {
                // SAFETY: nothing has been submitted yet.
                unsafe { frames.destroy(&ctx) };
                return Err(e);
            }
        };

        info!(frames_in_flight = frames.len(), "Frame ring ready");

        Ok(AppState {
            app,
            frames,
            ctx,
            target_frame_time: self.config.target_frame_time(),
            slot_lost: false,
            cleaned_up: false,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }
}

impl<A: Application> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;
        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(&self.ctx, dt);

        {
            let frame = self.frames.current();
            // SAFETY: the fence belongs to this device.
            unsafe { frame.sync.wait(&**self.ctx.gpu.vulkan_device())? };
            frame.uniforms.reset()?;
        }

        if self.ctx.needs_recreate || self.ctx.window_resized() {
            let size = self.ctx.window.inner_size();
            if size.width == 0 || size.height == 0 {
                // Minimized; nothing to present to.
                return Ok(());
            }
            self.handle_resize(size.width, size.height)?;
        }

        let image_available = self.frames.current().sync.image_available;
        // SAFETY: the swapchain is initialized and the semaphore was
        // consumed by this frame slot's previous submission.
        let acquired = unsafe {
            self.ctx
                .swapchain
                .acquire_next_image(image_available, u64::MAX)
        };
        let image_index = match acquired {
            Ok((index, suboptimal)) => {
                self.ctx.needs_recreate |= suboptimal;
                index
            }
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                self.ctx.needs_recreate = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let command = self
            .ctx
            .gpu
            .commands()
            .acquire(QueueSelector::Family(self.ctx.present_family), false);
        let command = match command {
            Ok(command) => command,
            Err(e) => {
                self.recover(image_available)?;
                return Err(e.into());
            }
        };

        if let Err(e) = self.record(&command, image_index, dt) {
            self.ctx.gpu.commands().release(command, vk::Fence::null());
            self.recover(image_available)?;
            return Err(e);
        }

        let fence = self.frames.current().sync.in_flight;
        let submitted = self.submit_and_present(&command, image_index, image_available, fence);
        self.ctx.gpu.commands().release(command, fence);
        submitted?;

        self.frames.advance();
        self.ctx.frame_count += 1;

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    /// Reset, begin and record the frame's command buffer, then flush the
    /// frame's host buffers.
    fn record(
        &mut self,
        command: &AcquiredCommandBuffer,
        image_index: u32,
        dt: f32,
    ) -> anyhow::Result<()> {
        let device = self.ctx.gpu.device_api();

        // SAFETY: the ticket gives exclusive use of the pool, and the pool
        // only hands out buffers whose last submission has completed.
        unsafe {
            device.reset_command_pool(command.command_pool)?;
            device.begin_command_buffer(
                command.command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;
        }

        let swapchain_image = self
            .ctx
            .swapchain
            .images()
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "acquired image {image_index} is not part of the swapchain"
                ))
            })?;

        let frame_index = self.frames.current_index();
        let rendered = {
            let mut frame = FrameContext {
                command_buffer: command.command_buffer,
                image_index,
                swapchain_image,
                extent: self.ctx.swapchain.extent(),
                dt,
                frame_number: self.ctx.frame_count,
                frame_index,
                uniforms: &mut self.frames.current().uniforms,
            };
            self.app.render(&self.ctx, &mut frame)
        };

        // SAFETY: the buffer is recording.
        let ended = unsafe { device.end_command_buffer(command.command_buffer) };
        rendered?;
        ended?;

        self.frames.current().uniforms.flush()?;
        Ok(())
    }

    fn submit_and_present(
        &mut self,
        command: &AcquiredCommandBuffer,
        image_index: u32,
        image_available: vk::Semaphore,
        fence: vk::Fence,
    ) -> anyhow::Result<()> {
        let render_finished = match self.ctx.render_finished.get(image_index as usize) {
            Some(semaphore) => *semaphore,
            None => {
                self.recover(image_available)?;
                return Err(GpuError::InvalidState(format!(
                    "no render semaphore for image {image_index}"
                ))
                .into());
            }
        };

        let command_buffers = [command.command_buffer];
        let wait_semaphores = [image_available];
        let wait_stages = [SWAPCHAIN_WAIT_STAGES];
        let signal_semaphores = [render_finished];
        let batch = SubmitBatch {
            command_buffers: &command_buffers,
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            signal_semaphores: &signal_semaphores,
        };

        let swapchain = &self.ctx.swapchain;
        // SAFETY: the frame fence was waited on at the start of the frame, and
        // the present family was verified to present to this surface.
        let outcome = unsafe {
            self.ctx
                .gpu
                .submit_frame(self.ctx.present_family, &batch, fence, |queue| {
                    swapchain.present(queue, image_index, &signal_semaphores)
                })
        };

        match outcome {
            Ok(FrameOutcome::Presented(presented)) => {
                if presented? {
                    self.ctx.needs_recreate = true;
                }
                Ok(())
            }
            Ok(FrameOutcome::Recovered(e)) => {
                self.ctx.needs_recreate = true;
                Err(e.into())
            }
            Err(e) => {
                self.slot_lost = true;
                Err(anyhow::Error::from(e).context("frame could not be submitted or recovered"))
            }
        }
    }

    /// Consume an acquired image's semaphore after the frame could not be
    /// submitted, and schedule a swapchain rebuild to reclaim the image.
    fn recover(&mut self, image_available: vk::Semaphore) -> anyhow::Result<()> {
        self.ctx.needs_recreate = true;

        let fence = self.frames.current().sync.in_flight;
        // SAFETY: the frame fence was waited on at the start of the frame and
        // nothing was submitted with it since.
        let recovered = unsafe {
            self.ctx
                .gpu
                .recover_frame(self.ctx.present_family, &[image_available], fence)
        };
        if let Err(e) = recovered {
            self.slot_lost = true;
            return Err(anyhow::Error::from(e).context("unsubmitted frame could not be recovered"));
        }
        Ok(())
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.ctx.gpu.wait_idle()?;
        // SAFETY: the device is idle.
        unsafe { self.ctx.recreate_swapchain(width, height)? };

        // Notify the application
        self.app.on_resize(&mut self.ctx, width, height)?;

        info!("Resized to {}x{}", width, height);
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        // Print FPS statistics
        if self.ctx.frame_count > 0 {
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        // Let the app cleanup first
        self.app.cleanup(&mut self.ctx);

        // SAFETY: the device is idle.
        unsafe {
            self.frames.destroy(&self.ctx);
            self.ctx.cleanup();
        }

        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_in_flight_is_at_least_one() {
        let config = AppConfig::new("test").with_frames_in_flight(0);
        assert_eq!(config.frames_in_flight, 1);
        assert_eq!(AppConfig::default().frames_in_flight, 2);
    }

    #[test]
    fn target_fps_converts_to_frame_time() {
        let config = AppConfig::new("test").with_target_fps(50);
        assert_eq!(config.target_frame_time(), Some(Duration::from_millis(20)));
        assert_eq!(AppConfig::new("test").target_frame_time(), None);
        assert_eq!(
            AppConfig::new("test").with_target_fps(0).target_frame_time(),
            None
        );
    }
}
