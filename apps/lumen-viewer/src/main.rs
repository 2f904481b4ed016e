//! Lumen Viewer
//!
//! Uploads a checkerboard through a staging host buffer pool and a one-time
//! submission, then clears every swapchain image with a slowly changing
//! colour and blits the pattern into it.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p lumen-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--vsync`: Wait for vertical blank (FIFO presentation, default)
//! - `--no-vsync`: Prefer mailbox or immediate presentation
//! - `--validation`: Enable Vulkan validation layers
//! - `--no-validation`: Disable Vulkan validation layers
//! - `--frames-in-flight <N>`: Frames recorded ahead of the GPU (default: 2)
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;
mod pattern;

use lumen_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

/// Command line options.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ViewerArgs {
    vsync: bool,
    validation: bool,
    frames_in_flight: usize,
    help: bool,
}

impl Default for ViewerArgs {
    fn default() -> Self {
        Self {
            vsync: true,
            validation: cfg!(debug_assertions),
            frames_in_flight: 2,
            help: false,
        }
    }
}

impl ViewerArgs {
    /// Parse arguments, skipping the program name. Unknown flags and
    /// malformed values are reported and ignored.
    fn parse<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = args.into_iter().skip(1);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--vsync" => parsed.vsync = true,
                "--no-vsync" => parsed.vsync = false,
                "--validation" => parsed.validation = true,
                "--no-validation" => parsed.validation = false,
                "--frames-in-flight" => match args.next().map(|v| v.parse::<usize>()) {
                    Some(Ok(n)) if n > 0 => parsed.frames_in_flight = n,
                    _ => eprintln!("--frames-in-flight expects a positive number"),
                },
                "-h" | "--help" => parsed.help = true,
                other => eprintln!("Ignoring unknown argument: {other}"),
            }
        }

        parsed
    }
}

fn main() -> anyhow::Result<()> {
    let args = ViewerArgs::parse(std::env::args());
    if args.help {
        print_help();
        return Ok(());
    }

    run_app::<Viewer>(
        AppConfig::new("Lumen Viewer")
            .with_size(WIDTH, HEIGHT)
            .with_vsync(args.vsync)
            .with_validation(args.validation)
            .with_frames_in_flight(args.frames_in_flight),
    )
}

fn print_help() {
    eprintln!(
        "Lumen Viewer

USAGE:
    cargo run -p lumen-viewer -- [OPTIONS]

OPTIONS:
    --vsync                   Wait for vertical blank (default)
    --no-vsync                Prefer mailbox or immediate presentation
    --validation              Enable Vulkan validation layers
                              (default in debug builds)
    --no-validation           Disable Vulkan validation layers
    --frames-in-flight <N>    Frames recorded ahead of the GPU (default: 2)
    -h, --help                Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                  Set log level (e.g., info, debug, trace)"
    );
}
