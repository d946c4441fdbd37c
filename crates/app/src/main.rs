use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use voice_orb_core::{
    headless::{
        GpuFailure, HeadlessAudioHost, HeadlessGraphicsHost, HeadlessSignal, ManualScheduler,
    },
    LifecycleCoordinator, OrbConfig, OrbFrame, SurfaceSize,
};

#[cfg(feature = "gpu")]
mod gpu;
#[cfg(feature = "microphone")]
mod microphone;

const FRAMES_PER_SECOND: f32 = 60.0;

fn main() -> voice_orb_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            level,
            seconds,
            fail_gpu,
            fail_draw_at,
            deny_microphone,
            config,
        } => {
            let options = SimulateOptions {
                level,
                seconds,
                fail_gpu: fail_gpu.map(GpuFailure::from),
                fail_draw_at,
                deny_microphone,
            };
            run_simulate(&options, config.as_deref())
        }
        #[cfg(feature = "microphone")]
        Commands::Listen { seconds, config } => run_listen(seconds, config.as_deref()),
    }
}

struct SimulateOptions {
    level: f32,
    seconds: f32,
    fail_gpu: Option<GpuFailure>,
    fail_draw_at: Option<u64>,
    deny_microphone: bool,
}

fn run_simulate(options: &SimulateOptions, config: Option<&Path>) -> voice_orb_core::Result<()> {
    let config = load_config(config)?;
    tracing::info!(
        level = options.level,
        seconds = options.seconds,
        fail_gpu = ?options.fail_gpu,
        fail_draw_at = ?options.fail_draw_at,
        "starting headless simulation"
    );

    let audio = if options.deny_microphone {
        HeadlessAudioHost::denied("NotAllowedError: microphone access was denied")
    } else {
        HeadlessAudioHost::new(HeadlessSignal::normalized(options.level))
    };
    let mut graphics = HeadlessGraphicsHost::new(SurfaceSize::new(320.0, 320.0, 2.0));
    if let Some(stage) = options.fail_gpu {
        graphics = graphics.with_failure(stage);
    }
    if let Some(draw) = options.fail_draw_at {
        graphics = graphics.with_draw_failure_at(draw);
    }

    let mut orb = LifecycleCoordinator::new(audio, graphics, ManualScheduler::new(), config);
    orb.set_active(true, None);

    let frames = frame_count(options.seconds);
    for frame in 1..=frames {
        orb.pump();
        if frame % 15 == 0 || frame == frames {
            log_frame(frame, orb.last_frame());
        }
    }

    let status = orb.status();
    let draws = orb.graphics().stats().draw_calls;
    tracing::info!(
        mode = ?status.mode,
        ready = status.ready,
        error = ?status.error,
        ui_level = orb.ui_level(),
        draws,
        "simulation finished"
    );
    orb.unmount();
    Ok(())
}

#[cfg(feature = "microphone")]
fn run_listen(seconds: f32, config: Option<&Path>) -> voice_orb_core::Result<()> {
    use std::{thread, time::Duration};

    let config = load_config(config)?;
    let audio = microphone::CpalAudioHost::new(config.level.fft_size);
    let surface = SurfaceSize::new(320.0, 320.0, 1.0);
    #[cfg(feature = "gpu")]
    let graphics = gpu::WgpuGraphicsHost::new(surface);
    #[cfg(not(feature = "gpu"))]
    let graphics = HeadlessGraphicsHost::new(surface);
    let mut orb = LifecycleCoordinator::new(audio, graphics, ManualScheduler::new(), config);

    orb.set_active(true, None);
    if let Some(err) = orb.take_audio_error() {
        return Err(err);
    }
    tracing::info!(seconds, mode = ?orb.mode(), "listening to the default input device");

    let refresh = Duration::from_secs_f32(1.0 / FRAMES_PER_SECOND);
    for frame in 1..=frame_count(seconds) {
        orb.pump();
        if frame % 6 == 0 {
            let level = orb.ui_level();
            tracing::info!(level, meter = %meter(level, 40), "listening");
        }
        thread::sleep(refresh);
    }

    orb.unmount();
    Ok(())
}

fn log_frame(frame: u64, last: Option<&OrbFrame>) {
    match last {
        Some(OrbFrame::Gpu(params)) => tracing::info!(
            frame,
            level = params.level,
            amplitude = params.amplitude,
            speed = params.speed,
            scale = params.scale,
            "shader frame"
        ),
        Some(OrbFrame::Fallback(style)) => tracing::info!(
            frame,
            level = style.level,
            css = %style.to_css(),
            "fallback frame"
        ),
        None => tracing::debug!(frame, "nothing rendered yet"),
    }
}

fn load_config(path: Option<&Path>) -> voice_orb_core::Result<OrbConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            OrbConfig::from_json_file(path)
        }
        None => Ok(OrbConfig::default()),
    }
}

fn frame_count(seconds: f32) -> u64 {
    (seconds.max(0.0) * FRAMES_PER_SECOND).round() as u64
}

#[cfg_attr(not(feature = "microphone"), allow(dead_code))]
fn meter(level: f32, width: usize) -> String {
    let filled = ((level.clamp(0.0, 1.0) * width as f32).round() as usize).min(width);
    format!("[{}{}]", "#".repeat(filled), " ".repeat(width - filled))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-reactive voice orb", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the whole pipeline against in-memory audio and graphics hosts.
    Simulate {
        /// Constant normalised input level.
        #[arg(long, default_value_t = 0.6)]
        level: f32,
        /// Simulated duration at 60 frames per second.
        #[arg(long, default_value_t = 2.0)]
        seconds: f32,
        /// Make GPU initialisation fail at this stage.
        #[arg(long, value_enum)]
        fail_gpu: Option<GpuStage>,
        /// Make the n-th draw call fail (1-based).
        #[arg(long)]
        fail_draw_at: Option<u64>,
        /// Refuse microphone access.
        #[arg(long)]
        deny_microphone: bool,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Drive the orb from the default input device.
    #[cfg(feature = "microphone")]
    Listen {
        #[arg(long, default_value_t = 10.0)]
        seconds: f32,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum GpuStage {
    Context,
    VertexCompile,
    FragmentCompile,
    Link,
    Attribute,
    Uniform,
    Buffer,
}

impl From<GpuStage> for GpuFailure {
    fn from(stage: GpuStage) -> Self {
        match stage {
            GpuStage::Context => Self::Context,
            GpuStage::VertexCompile => Self::VertexCompile,
            GpuStage::FragmentCompile => Self::FragmentCompile,
            GpuStage::Link => Self::Link,
            GpuStage::Attribute => Self::Attribute,
            GpuStage::Uniform => Self::Uniform,
            GpuStage::Buffer => Self::Buffer,
        }
    }
}
