//! The hooks a windowed program implements.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::WindowEvent;

/// A program driven by [`run_app`](crate::run_app).
///
/// The runner owns the window, the GPU context, the swapchain and the ring of
/// per-frame fences and uniform pools. Implementors only record work.
pub trait Application: Sized {
    /// Build the program once the surface and swapchain exist.
    ///
    /// Returning an error shuts the runner down before the first frame and
    /// hands the error back from `run_app`.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Advance state by `dt` seconds. Runs before every [`render`](Self::render).
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Record the frame into `frame.command_buffer`.
    ///
    /// The buffer is already recording and the swapchain image has been
    /// acquired. The image arrives in an undefined layout and must be left in
    /// `PRESENT_SRC_KHR`; submission and presentation happen afterwards.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()>;

    /// The swapchain now has a `width` x `height` extent.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Returning `true` consumes the event before the runner sees it.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Release GPU objects. The device is idle when this runs.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
