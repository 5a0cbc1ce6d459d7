use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use redisca::audio;
use redisca::camera::{self, CameraDevice, CameraSettings, Resolution};
use redisca::config::Config;
use redisca::formula::DEFAULT_FORMULA;
use redisca::pipeline::Pipeline;

/// Tick period of the capture loop (~30 fps).
const TICK: Duration = Duration::from_millis(33);

/// Parse and validate resolution (WIDTHxHEIGHT format)
fn parse_resolution(s: &str) -> Result<Resolution, String> {
    let parts: Vec<&str> = s.split('x').collect();
    if parts.len() != 2 {
        return Err(format!(
            "Invalid resolution format '{}'. Use WIDTHxHEIGHT (e.g., 640x480)",
            s
        ));
    }
    let width: u32 = parts[0]
        .parse()
        .map_err(|_| format!("Invalid width '{}' in resolution", parts[0]))?;
    let height: u32 = parts[1]
        .parse()
        .map_err(|_| format!("Invalid height '{}' in resolution", parts[1]))?;
    if width == 0 || height == 0 {
        return Err("Resolution width and height must be greater than 0".to_string());
    }
    Ok(Resolution { width, height })
}

/// Parse and validate framerate (1-120 fps)
fn parse_framerate(s: &str) -> Result<u32, String> {
    let fps: u32 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid framerate", s))?;
    if !(1..=120).contains(&fps) {
        return Err(format!(
            "Framerate must be between 1 and 120 fps, got {}",
            fps
        ));
    }
    Ok(fps)
}

/// redisca: webcam recorder with formula-driven distortion
#[derive(Parser)]
#[command(name = "redisca")]
#[command(version, about = "Webcam recorder with formula-driven distortion")]
#[command(long_about = "Preview a webcam feed warped by a mathematical formula over x, \
    record the distorted video together with a separately captured audio \
    track, and grab distorted photos.")]
#[command(after_help = "EXAMPLES:
    # Preview with the default formula (50*sinh(x))
    redisca run

    # Record ten seconds into ~/captures with a custom formula
    redisca run -o ~/captures -f \"20*cos(x)\" --record --duration 10

    # Disable distortion entirely
    redisca run -f \"\"

    # Take a single distorted photo
    redisca photo -o ~/captures

    # List available devices
    redisca list-cameras
    redisca list-mics")]
struct Cli {
    /// Path to a config file (default: ~/.config/redisca/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by the capture subcommands; unset values fall back to the
/// config file, then to built-in defaults.
#[derive(Args)]
struct CaptureOpts {
    /// Camera device index
    #[arg(short, long)]
    device: Option<u32>,

    /// Capture resolution as WIDTHxHEIGHT
    #[arg(short, long, value_parser = parse_resolution)]
    resolution: Option<Resolution>,

    /// Capture framerate
    #[arg(long, value_parser = parse_framerate)]
    fps: Option<u32>,

    /// Directory recordings and photos are written to
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Distortion formula over x (empty string disables distortion)
    #[arg(short, long)]
    formula: Option<String>,
}

impl CaptureOpts {
    fn camera_settings(&self, config: &Config) -> CameraSettings {
        CameraSettings {
            device_index: self.device.unwrap_or(config.camera.device),
            resolution: self.resolution.unwrap_or(Resolution {
                width: config.camera.width,
                height: config.camera.height,
            }),
            fps: self.fps.unwrap_or(config.camera.fps),
        }
    }

    fn formula_text(&self, config: &Config) -> String {
        self.formula
            .clone()
            .or_else(|| config.formula.startup.clone())
            .unwrap_or_else(|| DEFAULT_FORMULA.to_string())
    }

    fn output_dir(&self, config: &Config) -> Option<PathBuf> {
        self.output_dir
            .clone()
            .or_else(|| config.output.directory.clone())
    }
}

#[derive(Subcommand)]
enum Command {
    /// Preview the distorted feed, optionally recording video and audio
    Run {
        #[command(flatten)]
        opts: CaptureOpts,

        /// Start recording immediately
        #[arg(long)]
        record: bool,

        /// Stop after this many seconds (otherwise runs until Ctrl-C)
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Capture a single distorted photo
    Photo {
        #[command(flatten)]
        opts: CaptureOpts,

        /// Frames to capture before taking the photo, letting the camera
        /// settle
        #[arg(long, default_value_t = 5)]
        warmup: u32,
    },
    /// List camera devices
    ListCameras,
    /// List audio input devices
    ListMics,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Run {
            opts,
            record,
            duration,
        } => cmd_run(&opts, &config, record, duration),
        Command::Photo { opts, warmup } => cmd_photo(&opts, &config, warmup),
        Command::ListCameras => cmd_list_cameras(),
        Command::ListMics => cmd_list_mics(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn open_camera(settings: CameraSettings) -> Result<CameraDevice, Box<dyn std::error::Error>> {
    let camera = CameraDevice::open(settings)?;
    log::info!(
        "camera open: device {} at {}, {} fps",
        camera.settings().device_index,
        camera.settings().resolution,
        camera.fps()
    );
    Ok(camera)
}

fn cmd_run(
    opts: &CaptureOpts,
    config: &Config,
    record: bool,
    duration: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Hard startup requirements: a camera and an audio input. Missing
    // devices are fatal here, before any loop starts.
    let camera = open_camera(opts.camera_settings(config))?;
    let mic = audio::default_input_device_name()?;
    log::info!("audio input: {}", mic);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)) {
            eprintln!("Warning: Could not set up Ctrl+C handler: {}", e);
        }
    }

    let mut pipeline = Pipeline::new(camera);
    if let Some(dir) = opts.output_dir(config) {
        pipeline.set_output_dir(&dir)?;
    }
    pipeline.apply_formula(&opts.formula_text(config))?;

    if record {
        let path = pipeline.start_recording()?;
        println!("Recording to {}", path.display());
    }

    let started = Instant::now();
    let mut ticks: u64 = 0;
    while !stop.load(Ordering::SeqCst) {
        let tick_started = Instant::now();

        if let Err(e) = pipeline.tick() {
            // The only error a tick surfaces is a sink write failure; stop
            // and salvage what is already on disk.
            log::error!("tick failed: {}", e);
            if pipeline.is_recording() {
                match pipeline.stop_recording() {
                    Ok(summary) => log::warn!(
                        "recording stopped after sink failure; partial video at {}",
                        summary.video_path.display()
                    ),
                    Err(teardown) => log::error!("teardown failed: {}", teardown),
                }
            }
            return Err(e.into());
        }

        ticks += 1;
        if ticks % 300 == 0 {
            log::info!("{} frames captured", ticks);
        }

        if let Some(limit) = duration {
            if started.elapsed() >= Duration::from_secs(limit) {
                break;
            }
        }

        let elapsed = tick_started.elapsed();
        if elapsed < TICK {
            thread::sleep(TICK - elapsed);
        }
    }

    if pipeline.is_recording() {
        let summary = pipeline.stop_recording()?;
        println!(
            "Saved {} ({} frames)",
            summary.video_path.display(),
            summary.frames
        );
        if let Some(audio_path) = summary.audio_path {
            println!("Saved {}", audio_path.display());
        }
    }
    Ok(())
}

fn cmd_photo(
    opts: &CaptureOpts,
    config: &Config,
    warmup: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let camera = open_camera(opts.camera_settings(config))?;

    let mut pipeline = Pipeline::new(camera);
    if let Some(dir) = opts.output_dir(config) {
        pipeline.set_output_dir(&dir)?;
    }
    pipeline.apply_formula(&opts.formula_text(config))?;

    // A few ticks let exposure settle and guarantee a current frame even if
    // the first reads miss.
    for _ in 0..warmup.max(1) {
        pipeline.tick()?;
        thread::sleep(TICK);
    }

    let path = pipeline.take_photo()?;
    println!("Photo saved to {}", path.display());
    Ok(())
}

fn cmd_list_cameras() -> Result<(), Box<dyn std::error::Error>> {
    let devices = camera::list_devices()?;
    if devices.is_empty() {
        println!("No cameras found");
    } else {
        for device in devices {
            println!("{}", device);
        }
    }
    Ok(())
}

fn cmd_list_mics() -> Result<(), Box<dyn std::error::Error>> {
    let devices = audio::list_input_devices()?;
    if devices.is_empty() {
        println!("No audio input devices found");
    } else {
        for (index, name) in devices.iter().enumerate() {
            println!("[{}] {}", index, name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        let res = parse_resolution("1280x720").unwrap();
        assert_eq!(res.width, 1280);
        assert_eq!(res.height, 720);

        assert!(parse_resolution("1280").is_err());
        assert!(parse_resolution("0x720").is_err());
        assert!(parse_resolution("axb").is_err());
    }

    #[test]
    fn test_parse_framerate() {
        assert_eq!(parse_framerate("30").unwrap(), 30);
        assert!(parse_framerate("0").is_err());
        assert!(parse_framerate("500").is_err());
        assert!(parse_framerate("fast").is_err());
    }

    #[test]
    fn test_capture_opts_fall_back_to_config() {
        let opts = CaptureOpts {
            device: None,
            resolution: None,
            fps: None,
            output_dir: None,
            formula: None,
        };
        let config = Config::default();
        let settings = opts.camera_settings(&config);
        assert_eq!(settings.device_index, 0);
        assert_eq!(settings.resolution.width, 640);
        assert_eq!(settings.fps, 30);
        assert_eq!(opts.formula_text(&config), DEFAULT_FORMULA);
        assert!(opts.output_dir(&config).is_none());
    }

    #[test]
    fn test_capture_opts_cli_wins() {
        let opts = CaptureOpts {
            device: Some(2),
            resolution: Some(Resolution {
                width: 320,
                height: 240,
            }),
            fps: Some(15),
            output_dir: Some(PathBuf::from("/tmp/out")),
            formula: Some(String::new()),
        };
        let config = Config::default();
        let settings = opts.camera_settings(&config);
        assert_eq!(settings.device_index, 2);
        assert_eq!(settings.resolution.width, 320);
        assert_eq!(settings.fps, 15);
        // Empty string is a deliberate "no distortion" choice, not a fall
        // through to the default.
        assert_eq!(opts.formula_text(&config), "");
    }
}
