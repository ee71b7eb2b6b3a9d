//! Format, capability and frame validation.
//!
//! Format and capability checks gate buffer allocation. The frame validators
//! verify decoded test patterns and are used by tests against mock and vivid
//! devices.

use crate::decode::DecodedFrame;
use crate::error::{CaptureError, Result};
use crate::traits::{DeviceCapabilities, FrameMetadata, ImageFormat};

/// Maximum number of memory planes per buffer (`VIDEO_MAX_PLANES`).
pub const MAX_PLANES: usize = 8;

/// Validates a negotiated format before it is used to size buffers.
///
/// # Errors
///
/// Returns `InvalidFormat` if:
/// - Width or height is zero
/// - The plane count is zero or exceeds [`MAX_PLANES`]
/// - Any plane reports a zero size
pub fn validate_format(format: &ImageFormat) -> Result<()> {
    if format.width == 0 || format.height == 0 {
        return Err(CaptureError::InvalidFormat(format!(
            "zero dimension {}x{}",
            format.width, format.height
        )));
    }

    let planes = format.num_planes();
    if planes == 0 {
        return Err(CaptureError::InvalidFormat(
            "format reports zero planes".to_owned(),
        ));
    }
    if planes > MAX_PLANES {
        return Err(CaptureError::InvalidFormat(format!(
            "{planes} planes exceeds maximum of {MAX_PLANES}"
        )));
    }

    if let Some(plane) = format.planes.iter().position(|p| p.size_image == 0) {
        return Err(CaptureError::InvalidFormat(format!(
            "plane {plane} reports zero size"
        )));
    }

    Ok(())
}

/// Rejects devices that cannot stream multi-planar capture.
pub fn check_capabilities(caps: &DeviceCapabilities) -> Result<()> {
    if !caps.can_capture_mplane {
        return Err(CaptureError::QueryFailed(format!(
            "{} ({}) does not support multi-planar capture",
            caps.card, caps.driver
        )));
    }
    if !caps.can_stream {
        return Err(CaptureError::QueryFailed(format!(
            "{} ({}) does not support streaming i/o",
            caps.card, caps.driver
        )));
    }
    Ok(())
}

/// Expected BGR values for 100% color bars after BT.601 limited-range conversion.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const COLOR_BARS_BGR: [[u8; 3]; 8] = [
    [255, 255, 255], // White
    [0, 255, 255],   // Yellow
    [255, 255, 0],   // Cyan
    [0, 255, 0],     // Green
    [255, 0, 255],   // Magenta
    [0, 0, 255],     // Red
    [255, 0, 0],     // Blue
    [0, 0, 0],       // Black
];

/// Tolerance for color matching (accounts for chroma rounding).
const COLOR_TOLERANCE: u8 = 15;

/// Validates that a decoded frame contains the 8-bar color pattern.
///
/// Samples the center of each of 8 vertical stripes on the middle row.
pub fn validate_color_bars(frame: &DecodedFrame) -> Result<()> {
    let bar_width = frame.width / 8;
    let center_y = frame.height / 2;

    for (bar_idx, expected) in COLOR_BARS_BGR.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let sample_x = (bar_idx as u32 * bar_width) + (bar_width / 2);

        let actual = frame.pixel_at(sample_x, center_y).ok_or_else(|| {
            CaptureError::InvalidBuffer(format!("no pixel at ({sample_x}, {center_y})"))
        })?;

        if !colors_match(actual, *expected, COLOR_TOLERANCE) {
            return Err(CaptureError::InvalidBuffer(format!(
                "color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected BGR{expected:?}, got BGR{actual:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that a decoded frame contains a left-to-right luminance ramp.
pub fn validate_gradient(frame: &DecodedFrame) -> Result<()> {
    let center_y = frame.height / 2;
    let sample_step = (frame.width / 64).max(1);

    let mut first: Option<f32> = None;
    let mut prev: Option<f32> = None;

    for x in (0..frame.width).step_by(sample_step as usize) {
        let [b, g, r] = frame.pixel_at(x, center_y).ok_or_else(|| {
            CaptureError::InvalidBuffer(format!("no pixel at ({x}, {center_y})"))
        })?;

        // Y' in Rec. 601
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = prev {
            if luminance < prev - 1.0 {
                return Err(CaptureError::InvalidBuffer(format!(
                    "gradient not monotonically increasing at x={x}: \
                     luminance {luminance} < previous {prev}"
                )));
            }
        }

        first.get_or_insert(luminance);
        prev = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first, prev) {
        let change = last - first;
        if change < 50.0 {
            return Err(CaptureError::InvalidBuffer(format!(
                "insufficient luminance change for gradient: {change} (expected at least 50.0)"
            )));
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by exactly 1.
pub fn validate_frame_sequence(frames: &[FrameMetadata]) -> Result<()> {
    if frames.is_empty() {
        return Err(CaptureError::InvalidBuffer(
            "cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (i, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if curr.sequence != prev.sequence.wrapping_add(1) {
                return Err(CaptureError::InvalidBuffer(format!(
                    "frame sequence gap at index {}: expected {}, got {}",
                    i + 1,
                    prev.sequence.wrapping_add(1),
                    curr.sequence
                )));
            }
        }
    }

    Ok(())
}

fn colors_match(actual: [u8; 3], expected: [u8; 3], tolerance: u8) -> bool {
    actual
        .iter()
        .zip(expected.iter())
        .all(|(a, e)| a.abs_diff(*e) <= tolerance)
}
