//! mplane-capture: multi-planar V4L2 frame capture and 4:2:0 YUV decoding.
//!
//! The device is driven through the [`CaptureDevice`] trait, so the buffer
//! pool and stream state machine run the same way over real hardware
//! ([`V4L2Device`]) and over the mock device used in tests.
//!
//! A typical session opens the device, builds a [`CaptureStream`] from a
//! [`CaptureConfig`], starts it and calls [`CaptureStream::capture_frame`]
//! in a loop.

pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod format;
pub mod pool;
pub mod stream;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use config::CaptureConfig;
pub use decode::{decode, yuv_to_bgr, DecodedFrame, Encoding};
pub use device::{MmapPlane, V4L2Device};
pub use error::{CaptureError, Result};
pub use format::{apply_format, get_format, negotiate};
pub use pool::{BufferPool, MappedBuffer, Owner};
pub use stream::{CaptureStream, CapturedFrame, StreamState};
pub use traits::{
    CaptureDevice, DequeuedBuffer, DeviceCapabilities, FourCC, FrameMetadata, ImageFormat,
    PlaneDescriptor, PlaneFormat,
};
