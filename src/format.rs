//! Format negotiation.
//!
//! There is no preferred format: the device's active format is read and
//! re-applied, and whatever the driver returns is authoritative.

use tracing::{info, warn};

use crate::error::Result;
use crate::traits::{CaptureDevice, ImageFormat};
use crate::validation::validate_format;

/// Read the device's active format.
pub fn get_format<D: CaptureDevice>(device: &D) -> Result<ImageFormat> {
    let format = device.format()?;
    info!(
        width = format.width,
        height = format.height,
        fourcc = %format.fourcc,
        planes = format.num_planes(),
        field = format.field,
        colorspace = format.colorspace,
        "active format"
    );
    Ok(format)
}

/// Submit `format` and return what the driver actually applied.
///
/// Every field the driver changed is logged.
pub fn apply_format<D: CaptureDevice>(device: &mut D, format: &ImageFormat) -> Result<ImageFormat> {
    let applied = device.set_format(format)?;
    log_adjustments(format, &applied);
    Ok(applied)
}

/// Read, re-apply and validate the active format.
///
/// # Errors
///
/// Propagates `FormatQueryFailed` and `FormatSetFailed`, and returns
/// `InvalidFormat` if the applied format cannot size buffers.
pub fn negotiate<D: CaptureDevice>(device: &mut D) -> Result<ImageFormat> {
    let current = get_format(device)?;
    let applied = apply_format(device, &current)?;
    validate_format(&applied)?;
    info!(format = %applied, "negotiated format");
    Ok(applied)
}

fn log_adjustments(requested: &ImageFormat, applied: &ImageFormat) {
    if requested.width != applied.width || requested.height != applied.height {
        warn!(
            requested = %format_args!("{}x{}", requested.width, requested.height),
            applied = %format_args!("{}x{}", applied.width, applied.height),
            "driver adjusted resolution"
        );
    }
    if requested.fourcc != applied.fourcc {
        warn!(requested = %requested.fourcc, applied = %applied.fourcc, "driver adjusted encoding");
    }
    if requested.planes != applied.planes {
        warn!(
            requested = ?requested.planes,
            applied = ?applied.planes,
            "driver adjusted plane layout"
        );
    }
}
