//! Application framework for the Lumen viewer.
//!
//! This crate provides a trait-based application framework that handles
//! common boilerplate like:
//! - Window creation and management
//! - GPU context initialization
//! - Swapchain creation and recreation
//! - Per-frame synchronization and uniform memory
//! - Command buffer and queue acquisition from the GPU pools
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use lumen_app::{Application, AppContext, FrameContext, AppConfig, run_app};
//!
//! struct MyApp {
//!     // Application state
//! }
//!
//! impl Application for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp {})
//!     }
//!
//!     fn update(&mut self, ctx: &AppContext, dt: f32) {
//!         // Update logic
//!     }
//!
//!     fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
//!         // Record commands, leaving the swapchain image in PRESENT_SRC_KHR
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::Application;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};

// Re-export commonly used types for convenience
pub use lumen_gpu::{GpuContext, GpuContextBuilder};
pub use winit::event::WindowEvent;
