//! # Textured Mesh Demo
//!
//! Demonstrates:
//! - Frame slots rotating on the fence (begin_frame / end_frame)
//! - Per-frame constants through the upload ring
//! - Mipmap generation with a compute pass at startup
//! - Direct descriptor tables and persistent bindless slots, switchable at runtime
//! - Explicit resource state transitions
//!
//! Runs headless for a fixed number of frames and logs frame timing.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use gpuframe_demos::{BindingMode, DemoSettings, TexturedMeshScene};
use gpuframe_graphics::{BackendKind, FrameTimer, GraphicsContext, GraphicsError};

/// Backend selection on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliBackend {
    /// Vulkan when available, otherwise the dummy backend.
    #[default]
    Auto,
    /// Simulated GPU.
    Dummy,
    /// Native Vulkan.
    Vulkan,
}

impl From<CliBackend> for BackendKind {
    fn from(backend: CliBackend) -> Self {
        match backend {
            CliBackend::Auto => BackendKind::Auto,
            CliBackend::Dummy => BackendKind::Dummy,
            CliBackend::Vulkan => BackendKind::Vulkan,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "textured_mesh_demo",
    about = "Spinning textured cube on the gpuframe orchestration layer"
)]
struct Args {
    /// Graphics backend.
    #[arg(long, value_enum)]
    backend: Option<CliBackend>,

    /// TOML settings file with [context] and [scene] sections.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frames to render before exiting.
    #[arg(long)]
    frames: Option<u64>,

    /// Back buffer width in pixels.
    #[arg(long)]
    width: Option<u32>,

    /// Back buffer height in pixels.
    #[arg(long)]
    height: Option<u32>,

    /// Start on the bindless descriptor path.
    #[arg(long)]
    bindless: bool,

    /// Switch descriptor paths every N frames.
    #[arg(long)]
    toggle_every: Option<u64>,

    /// Disable API validation.
    #[arg(long)]
    no_validation: bool,
}

impl Args {
    fn settings(&self) -> Result<DemoSettings, GraphicsError> {
        let mut settings = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    GraphicsError::InvalidParameter(format!("{}: {}", path.display(), e))
                })?;
                DemoSettings::from_toml_str(&text)?
            }
            None => DemoSettings::default(),
        };

        if let Some(backend) = self.backend {
            settings.context.backend = backend.into();
        }
        if let Some(width) = self.width {
            settings.context.width = width;
        }
        if let Some(height) = self.height {
            settings.context.height = height;
        }
        if self.no_validation {
            settings.context.validation = false;
        }
        if let Some(frames) = self.frames {
            settings.scene.frames = frames;
        }
        if let Some(toggle_every) = self.toggle_every {
            settings.scene.toggle_every = toggle_every;
        }
        settings.scene.bindless |= self.bindless;
        settings.context.validate()?;
        Ok(settings)
    }
}

fn run(args: &Args) -> Result<(), GraphicsError> {
    let settings = args.settings()?;
    gpuframe_graphics::init();

    let mut ctx = GraphicsContext::new(settings.context.clone())?;
    log::info!(
        "Backend: {} ({}x{}, {} frames in flight)",
        ctx.backend().name(),
        ctx.frame_width(),
        ctx.frame_height(),
        ctx.frames().frames_in_flight()
    );

    let mut scene = TexturedMeshScene::new(&mut ctx, &settings.scene)?;
    let mut timer = FrameTimer::new();

    for frame in 0..settings.scene.frames {
        let toggle_every = settings.scene.toggle_every;
        if toggle_every > 0 && frame > 0 && frame % toggle_every == 0 {
            scene.set_mode(scene.mode().toggled());
        }

        let dt = timer.tick();
        match scene.render(&mut ctx, dt) {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => log::warn!("Skipping frame {}: {}", frame, e),
        }

        if frame > 0 && frame % 120 == 0 {
            let summary = timer.summary();
            log::info!(
                "Frame {}: {:.1} fps ({:.2} ms), {} mode",
                summary.frame_count,
                summary.fps,
                summary.average_frame_time_ms,
                match scene.mode() {
                    BindingMode::Direct => "direct",
                    BindingMode::Bindless => "bindless",
                }
            );
        }
    }

    let summary = timer.summary();
    log::info!(
        "Rendered {} frames, last fence {}, {:.1} fps average",
        ctx.frames().frame_count(),
        ctx.next_signal_value().saturating_sub(1),
        summary.fps
    );
    ctx.shutdown()
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("textured_mesh_demo failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
