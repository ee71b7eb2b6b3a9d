//! Core traits and types for multi-planar V4L2 capture.

use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Pixel encoding tag (e.g., NV12, NV21, YU12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Y plane followed by interleaved U/V, one memory plane.
    pub const NV12: Self = Self::new(b"NV12");
    /// Y plane followed by interleaved V/U, one memory plane.
    pub const NV21: Self = Self::new(b"NV21");
    /// Fully planar 4:2:0 (Y, U, V), one memory plane.
    pub const YU12: Self = Self::new(b"YU12");
    /// NV12 with luma and chroma in separate memory planes.
    pub const NM12: Self = Self::new(b"NM12");
    /// NV21 with luma and chroma in separate memory planes.
    pub const NM21: Self = Self::new(b"NM21");
    /// YU12 with Y, U and V in separate memory planes.
    pub const YM12: Self = Self::new(b"YM12");
    /// Semi-planar 4:4:4, reported by some HDMI bridges.
    pub const NV24: Self = Self::new(b"NV24");
}

impl From<u32> for FourCC {
    fn from(code: u32) -> Self {
        Self(code.to_le_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> Self {
        Self::from_le_bytes(fourcc.0)
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            if byte.is_ascii_graphic() || byte == b' ' {
                write!(f, "{}", char::from(byte))?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        Ok(())
    }
}

/// Layout of one memory plane as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneFormat {
    /// Bytes per row (stride) of the first component stored in this plane.
    pub bytes_per_line: u32,
    /// Maximum number of bytes the plane can hold.
    pub size_image: u32,
}

impl PlaneFormat {
    /// Create a plane layout.
    #[must_use]
    pub const fn new(bytes_per_line: u32, size_image: u32) -> Self {
        Self {
            bytes_per_line,
            size_image,
        }
    }
}

/// Agreed capture geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFormat {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel encoding.
    pub fourcc: FourCC,
    /// Raw V4L2 field order, passed back unchanged when re-applied.
    pub field: u32,
    /// Raw V4L2 colorspace, passed back unchanged when re-applied.
    pub colorspace: u32,
    /// Per-plane layout; its length is the memory plane count.
    pub planes: Vec<PlaneFormat>,
}

impl ImageFormat {
    /// Create a format with progressive field order and default colorspace.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC, planes: Vec<PlaneFormat>) -> Self {
        Self {
            width,
            height,
            fourcc,
            field: 1, // V4L2_FIELD_NONE
            colorspace: 0,
            planes,
        }
    }

    /// Number of memory planes per buffer.
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Per-plane byte counts submitted with each queue call.
    pub fn bytes_used(&self) -> Vec<u32> {
        self.planes.iter().map(|plane| plane.size_image).collect()
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {} [", self.width, self.height, self.fourcc)?;
        for (i, plane) in self.planes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}@{}", plane.size_image, plane.bytes_per_line)?;
        }
        write!(f, "]")
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture single-planar video.
    pub can_capture: bool,
    /// Whether the device can capture multi-planar video.
    pub can_capture_mplane: bool,
    /// Whether the device supports streaming I/O.
    pub can_stream: bool,
}

/// Location of one plane of one device buffer, as returned by a buffer query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDescriptor {
    /// Buffer index within the pool.
    pub buffer: u32,
    /// Plane index within the buffer.
    pub plane: usize,
    /// Offset to pass to `mmap`.
    pub offset: u32,
    /// Length of the plane in bytes.
    pub length: u32,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Bytes written by the device into each plane.
    pub bytes_used: Vec<u32>,
}

/// A buffer handed back by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Index of the completed buffer.
    pub index: u32,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Abstraction over the kernel capture interface.
///
/// Each method is one device primitive and fails with the error variant of the
/// corresponding capture phase.
pub trait CaptureDevice {
    /// A mapped plane. Dropping it unmaps the memory.
    type Plane: AsRef<[u8]>;

    /// Capabilities cached when the device was opened.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Query capabilities from the device.
    fn query_capabilities(&self) -> Result<DeviceCapabilities>;

    /// Get the currently active format.
    fn format(&self) -> Result<ImageFormat>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &ImageFormat) -> Result<ImageFormat>;

    /// Request `count` buffers. Returns the number granted; zero releases all.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    /// Query the plane locations of buffer `index`.
    fn query_buffer(&mut self, index: u32, num_planes: usize) -> Result<Vec<PlaneDescriptor>>;

    /// Map one plane into process memory.
    fn map_plane(&mut self, plane: &PlaneDescriptor) -> Result<Self::Plane>;

    /// Hand buffer `index` to the device.
    fn queue_buffer(&mut self, index: u32, bytes_used: &[u32]) -> Result<()>;

    /// Block until the device completes a buffer.
    fn dequeue_buffer(&mut self, num_planes: usize) -> Result<DequeuedBuffer>;

    /// Begin streaming.
    fn stream_on(&mut self) -> Result<()>;

    /// End streaming. Every queued buffer returns to the application.
    fn stream_off(&mut self) -> Result<()>;

    /// Release the device. Calling it again has no effect.
    fn close(&mut self);
}
