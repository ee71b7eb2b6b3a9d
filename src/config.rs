//! Capture configuration.

use std::path::PathBuf;

/// Settings for one capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Device node to open.
    pub device: PathBuf,
    /// Number of buffers to request. The driver may grant more.
    pub buffer_count: u32,
    /// Stop after this many frames; `None` captures until an error.
    pub frame_limit: Option<u64>,
    /// Re-submit the active format before allocating buffers.
    pub reapply_format: bool,
    /// Write the last decoded frame to this PNG file.
    pub snapshot: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            buffer_count: 1,
            frame_limit: None,
            reapply_format: true,
            snapshot: None,
        }
    }
}

/// Expand a device argument: a bare number `N` means `/dev/videoN`, anything
/// else is taken as a path.
pub fn device_path(arg: &str) -> PathBuf {
    if !arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit()) {
        PathBuf::from(format!("/dev/video{arg}"))
    } else {
        PathBuf::from(arg)
    }
}
