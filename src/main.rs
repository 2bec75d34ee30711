//! pi-cam-server binary: drives the capture core from the command line.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::{error, info};

use pi_cam_server::device::MOCK_PREFIX;
use pi_cam_server::mock::{MockCamera, MockOpener};
use pi_cam_server::{Camera, CameraError, Config, Result, StreamEvent, SystemOpener};

#[derive(Parser, Debug)]
#[command(name = "pi-cam-server", about = "Single-camera V4L2 capture service")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "PI_CAM_CONFIG")]
    config: Option<PathBuf>,

    /// Device to open (`/dev/videoN` or `mock://name`)
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached cameras
    List,
    /// Open the camera and print its status as JSON
    Status,
    /// Capture a single photo
    Snapshot {
        /// Output file
        path: PathBuf,
    },
    /// Run a timelapse session
    Timelapse {
        /// Seconds between snapshots
        #[arg(long, default_value_t = 5.0)]
        interval: f64,
        /// Number of snapshots to take
        #[arg(long, default_value_t = 3)]
        count: u32,
    },
    /// Record for a fixed duration
    Record {
        /// Recording length in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Stream frames and log their stats
    Stream {
        /// Frames to receive before exiting (0 = until Ctrl-C)
        #[arg(long, default_value_t = 0)]
        frames: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "pi-cam-server failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(device) = cli.device {
        config.device = Some(device);
    }

    let mock = MockOpener::new();
    if let Some(id) = config.device.as_deref().filter(|id| id.starts_with(MOCK_PREFIX)) {
        mock.add(MockCamera::new(id));
    }
    let opener = SystemOpener::with_mock(config.buffer_count, mock);
    let camera = Arc::new(Camera::new(Arc::new(opener), &config));

    let command = cli.command.unwrap_or(Command::Stream { frames: 0 });
    if matches!(command, Command::List) {
        for info in camera.list_cameras() {
            println!("{}\t{}", info.id, info.name);
        }
        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .map_err(|err| CameraError::Io(std::io::Error::other(err.to_string())))?;
    }

    camera.open(None)?;
    let result = execute(&camera, command, &stop, &config);
    camera.shutdown();
    result
}

fn execute(camera: &Camera, command: Command, stop: &AtomicBool, config: &Config) -> Result<()> {
    match command {
        Command::List => Ok(()),
        Command::Status => {
            let json = serde_json::to_string_pretty(&camera.status())
                .map_err(|err| CameraError::Encode(err.to_string()))?;
            println!("{json}");
            Ok(())
        }
        Command::Snapshot { path } => {
            let written = camera.capture_photo(&path)?;
            info!(path = %written.display(), "snapshot saved");
            Ok(())
        }
        Command::Timelapse { interval, count } => {
            let interval = Duration::try_from_secs_f64(interval)
                .map_err(|err| CameraError::Config(format!("invalid interval: {err}")))?;
            config.ensure_dirs()?;
            camera.start_timelapse(interval)?;
            // Half an interval of slack so the last snapshot lands before the stop.
            let run_for = interval.saturating_mul(count) + interval / 2;
            wait(stop, run_for);
            camera.stop_timelapse();
            let status = camera.status().sessions.timelapse;
            info!(frames = status.frames_written, outcome = ?status.last_outcome, "timelapse finished");
            Ok(())
        }
        Command::Record { seconds } => {
            config.ensure_dirs()?;
            let path = camera.start_recording()?;
            wait(stop, Duration::from_secs(seconds));
            camera.stop_recording();
            let status = camera.status().sessions.recording;
            info!(path = %path.display(), frames = status.frames_written, "recording finished");
            Ok(())
        }
        Command::Stream { frames } => {
            let mut subscriber = camera.subscribe();
            let mut received = 0u64;
            while !stop.load(Ordering::SeqCst) && (frames == 0 || received < frames) {
                match subscriber.next(Duration::from_millis(500)) {
                    Some(StreamEvent::Frame(frame)) => {
                        received += 1;
                        info!(
                            sequence = frame.sequence,
                            bytes = frame.jpeg.len(),
                            resolution = %frame.resolution,
                            "frame"
                        );
                    }
                    Some(StreamEvent::Ended(reason)) => {
                        error!(reason = %reason, "stream ended");
                        break;
                    }
                    None => {}
                }
            }
            info!(received, "stream finished");
            Ok(())
        }
    }
}

fn wait(stop: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
}
