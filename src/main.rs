//! mplane-capture binary: stream frames from a multi-planar V4L2 device.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mplane_capture::config::device_path;
use mplane_capture::validation::check_capabilities;
use mplane_capture::{
    CaptureConfig, CaptureDevice, CaptureError, CaptureStream, DecodedFrame, V4L2Device,
};

/// Capture frames from a multi-planar V4L2 device and decode them to BGR.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Device node path or index.
    #[arg(short, long, value_name = "INDEX or PATH", default_value = "0")]
    device: String,

    /// Number of buffers to request.
    #[arg(short, long, default_value_t = 1)]
    buffers: u32,

    /// Stop after this many frames.
    #[arg(short = 'n', long = "count", value_name = "FRAMES")]
    frame_limit: Option<u64>,

    /// Use the active format as-is instead of re-applying it.
    #[arg(long)]
    no_reapply: bool,

    /// Write the last decoded frame to this PNG file.
    #[arg(short, long, value_name = "PATH")]
    snapshot: Option<PathBuf>,
}

impl From<Args> for CaptureConfig {
    fn from(args: Args) -> Self {
        Self {
            device: device_path(&args.device),
            buffer_count: args.buffers,
            frame_limit: args.frame_limit,
            reapply_format: !args.no_reapply,
            snapshot: args.snapshot,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run(Args::parse().into()) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(config: CaptureConfig) -> Result<()> {
    let mut device = V4L2Device::open(&config.device)?;
    check_capabilities(device.capabilities())?;

    let mut stream = CaptureStream::with_config(&mut device, &config)
        .context("failed to set up capture")?;
    stream.start()?;

    let mut attempts: u64 = 0;
    let mut captured: u64 = 0;
    let mut last: Option<DecodedFrame> = None;

    // Skipped frames count toward the limit.
    while config.frame_limit.is_none_or(|limit| attempts < limit) {
        attempts += 1;
        match stream.capture_frame() {
            Ok(frame) => {
                captured += 1;
                info!(
                    index = frame.index,
                    sequence = frame.metadata.sequence,
                    timestamp = ?frame.metadata.timestamp,
                    bytes_used = ?frame.metadata.bytes_used,
                    "captured frame"
                );
                last = Some(frame.frame);
            }
            Err(CaptureError::RequeueFailed { index, reason }) => {
                warn!(index, %reason, "requeue failed, retrying once");
                if let Err(err) = stream.release(index) {
                    stream.stop();
                    bail!(err);
                }
            }
            Err(err) if !err.is_fatal() => warn!(%err, "frame skipped"),
            Err(err) => {
                stream.stop();
                bail!(err);
            }
        }
    }

    stream.close();
    info!(frames = captured, attempts, "capture finished");

    if let Some(path) = &config.snapshot {
        let Some(frame) = last else {
            bail!("no frame decoded, nothing to write to {}", path.display());
        };
        let image = frame
            .to_rgb_image()
            .context("decoded frame has inconsistent size")?;
        image
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "wrote snapshot");
    }

    device.close();
    Ok(())
}
