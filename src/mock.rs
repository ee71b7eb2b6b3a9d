//! Mock device implementation for testing without hardware.
//!
//! The mock follows the kernel's buffer bookkeeping: buffers complete in the
//! order they were queued, dequeue fails while streaming is off, and
//! stream-off returns every queued buffer. Mapped planes are filled with a
//! test pattern laid out for the current format.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::decode::Encoding;
use crate::error::{CaptureError, Result};
use crate::traits::{
    CaptureDevice, DequeuedBuffer, DeviceCapabilities, FourCC, FrameMetadata, ImageFormat,
    PlaneDescriptor, PlaneFormat,
};

/// A device primitive invoked on the mock, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    QueryCapabilities,
    Format,
    SetFormat,
    RequestBuffers(u32),
    QueryBuffer(u32),
    MapPlane { buffer: u32, plane: usize },
    Queue(u32),
    Dequeue,
    StreamOn,
    StreamOff,
    Close,
}

#[derive(Debug, Default)]
struct MapCounters {
    live: Cell<usize>,
    mapped: Cell<usize>,
    unmapped: Cell<usize>,
}

/// Plane memory handed out by [`MockDevice`]. Dropping it counts as an unmap.
#[derive(Debug)]
pub struct MockPlane {
    bytes: Vec<u8>,
    counters: Rc<MapCounters>,
}

impl AsRef<[u8]> for MockPlane {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for MockPlane {
    fn drop(&mut self) {
        self.counters.live.set(self.counters.live.get() - 1);
        self.counters.unmapped.set(self.counters.unmapped.get() + 1);
    }
}

/// Mock device for testing without hardware.
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    format: ImageFormat,
    pattern: TestPattern,
    allocated: u32,
    queued: VecDeque<u32>,
    streaming: bool,
    sequence: u32,
    closed: bool,
    fail_map_at: Option<(u32, usize)>,
    fail_queue: bool,
    fail_stream_on: bool,
    fail_stream_off: bool,
    fail_dequeue: bool,
    calls: RefCell<Vec<DeviceCall>>,
    counters: Rc<MapCounters>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a mock reporting 640x480 NV12 in one plane.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_capture_mplane: true,
                can_stream: true,
            },
            format: ImageFormat::new(
                640,
                480,
                FourCC::NV12,
                vec![PlaneFormat::new(640, 640 * 480 * 3 / 2)],
            ),
            pattern: TestPattern::ColorBars,
            allocated: 0,
            queued: VecDeque::new(),
            streaming: false,
            sequence: 0,
            closed: false,
            fail_map_at: None,
            fail_queue: false,
            fail_stream_on: false,
            fail_stream_off: false,
            fail_dequeue: false,
            calls: RefCell::new(Vec::new()),
            counters: Rc::default(),
        }
    }

    /// Set the format for this mock device.
    #[must_use]
    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the capabilities for this mock device.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the pattern written into mapped planes.
    #[must_use]
    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Fail mapping of the given plane of the given buffer.
    #[must_use]
    pub fn fail_map_at(mut self, buffer: u32, plane: usize) -> Self {
        self.fail_map_at = Some((buffer, plane));
        self
    }

    /// Reject every queue call.
    #[must_use]
    pub fn fail_queue(mut self, fail: bool) -> Self {
        self.fail_queue = fail;
        self
    }

    /// Reject stream-on.
    #[must_use]
    pub fn fail_stream_on(mut self, fail: bool) -> Self {
        self.fail_stream_on = fail;
        self
    }

    /// Toggle queue failures on a device already in use.
    pub fn set_fail_queue(&mut self, fail: bool) {
        self.fail_queue = fail;
    }

    /// Toggle dequeue failures.
    pub fn set_fail_dequeue(&mut self, fail: bool) {
        self.fail_dequeue = fail;
    }

    /// Toggle stream-off failures. The queue is still dropped.
    pub fn set_fail_stream_off(&mut self, fail: bool) {
        self.fail_stream_off = fail;
    }

    /// Device primitives invoked so far.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.borrow().clone()
    }

    /// Planes currently mapped.
    pub fn live_mappings(&self) -> usize {
        self.counters.live.get()
    }

    /// Planes mapped since creation.
    pub fn total_mapped(&self) -> usize {
        self.counters.mapped.get()
    }

    /// Planes unmapped since creation.
    pub fn total_unmapped(&self) -> usize {
        self.counters.unmapped.get()
    }

    /// Whether streaming is on.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether [`CaptureDevice::close`] was called.
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    fn record(&self, call: DeviceCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl CaptureDevice for MockDevice {
    type Plane = MockPlane;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn query_capabilities(&self) -> Result<DeviceCapabilities> {
        self.record(DeviceCall::QueryCapabilities);
        Ok(self.capabilities.clone())
    }

    fn format(&self) -> Result<ImageFormat> {
        self.record(DeviceCall::Format);
        Ok(self.format.clone())
    }

    fn set_format(&mut self, format: &ImageFormat) -> Result<ImageFormat> {
        self.record(DeviceCall::SetFormat);
        if self.allocated > 0 {
            return Err(CaptureError::FormatSetFailed(
                "device busy: buffers allocated".to_owned(),
            ));
        }
        self.format = format.clone();
        Ok(self.format.clone())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        self.record(DeviceCall::RequestBuffers(count));
        if self.streaming {
            return Err(CaptureError::AllocFailed("device busy: streaming".to_owned()));
        }
        self.queued.clear();
        self.allocated = count;
        Ok(count)
    }

    fn query_buffer(&mut self, index: u32, num_planes: usize) -> Result<Vec<PlaneDescriptor>> {
        self.record(DeviceCall::QueryBuffer(index));
        if index >= self.allocated {
            return Err(CaptureError::AllocFailed(format!("no buffer {index}")));
        }
        if num_planes != self.format.num_planes() {
            return Err(CaptureError::AllocFailed(format!(
                "expected {} planes, caller passed {num_planes}",
                self.format.num_planes()
            )));
        }

        Ok(self
            .format
            .planes
            .iter()
            .enumerate()
            .map(|(plane, layout)| {
                #[allow(clippy::cast_possible_truncation)]
                let offset = index * 0x0100_0000 + plane as u32 * 0x0010_0000;
                PlaneDescriptor {
                    buffer: index,
                    plane,
                    offset,
                    length: layout.size_image,
                }
            })
            .collect())
    }

    fn map_plane(&mut self, descriptor: &PlaneDescriptor) -> Result<MockPlane> {
        self.record(DeviceCall::MapPlane {
            buffer: descriptor.buffer,
            plane: descriptor.plane,
        });
        if self.fail_map_at == Some((descriptor.buffer, descriptor.plane)) {
            return Err(CaptureError::AllocFailed(format!(
                "mmap of buffer {} plane {} failed",
                descriptor.buffer, descriptor.plane
            )));
        }

        let mut bytes = generate_test_planes(&self.format, self.pattern)
            .into_iter()
            .nth(descriptor.plane)
            .unwrap_or_default();
        bytes.resize(descriptor.length as usize, 0);

        self.counters.live.set(self.counters.live.get() + 1);
        self.counters.mapped.set(self.counters.mapped.get() + 1);
        Ok(MockPlane {
            bytes,
            counters: Rc::clone(&self.counters),
        })
    }

    fn queue_buffer(&mut self, index: u32, _bytes_used: &[u32]) -> Result<()> {
        self.record(DeviceCall::Queue(index));
        let reject = |reason: &str| CaptureError::RequeueFailed {
            index,
            reason: reason.to_owned(),
        };
        if self.fail_queue {
            return Err(reject("injected queue failure"));
        }
        if index >= self.allocated {
            return Err(reject("index out of range"));
        }
        if self.queued.contains(&index) {
            return Err(reject("already queued"));
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self, num_planes: usize) -> Result<DequeuedBuffer> {
        self.record(DeviceCall::Dequeue);
        if self.fail_dequeue {
            return Err(CaptureError::DequeueFailed("injected dequeue failure".to_owned()));
        }
        if !self.streaming {
            return Err(CaptureError::DequeueFailed("stream is off".to_owned()));
        }
        let index = self
            .queued
            .pop_front()
            .ok_or_else(|| CaptureError::DequeueFailed("no buffer queued".to_owned()))?;

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        Ok(DequeuedBuffer {
            index,
            metadata: FrameMetadata {
                sequence,
                timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
                bytes_used: self.format.bytes_used().into_iter().take(num_planes).collect(),
            },
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        self.record(DeviceCall::StreamOn);
        if self.fail_stream_on {
            return Err(CaptureError::StreamOnFailed("injected stream on failure".to_owned()));
        }
        if self.allocated == 0 {
            return Err(CaptureError::StreamOnFailed("no buffers allocated".to_owned()));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.record(DeviceCall::StreamOff);
        // The kernel drops the queue even when reporting an error.
        self.queued.clear();
        self.streaming = false;
        if self.fail_stream_off {
            return Err(CaptureError::DequeueFailed("injected stream off failure".to_owned()));
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.record(DeviceCall::Close);
            self.closed = true;
        }
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

impl TestPattern {
    fn sample(self, x: u32, width: u32) -> (u8, u8, u8) {
        match self {
            Self::ColorBars => {
                // White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
                const BARS: [(u8, u8, u8); 8] = [
                    (235, 128, 128),
                    (210, 16, 146),
                    (170, 166, 16),
                    (145, 54, 34),
                    (106, 202, 222),
                    (81, 90, 240),
                    (41, 240, 110),
                    (16, 128, 128),
                ];
                let bar_width = (width / 8).max(1);
                let bar = ((x / bar_width) as usize).min(BARS.len() - 1);
                BARS.get(bar).copied().unwrap_or((16, 128, 128))
            }
            Self::Gradient => {
                #[allow(clippy::cast_possible_truncation)]
                let luma = ((x * 255) / width) as u8;
                (luma, 128, 128)
            }
            Self::Solid(y, u, v) => (y, u, v),
        }
    }
}

fn stride_of(format: &ImageFormat, plane: usize, min: usize) -> usize {
    format
        .planes
        .get(plane)
        .map_or(min, |p| (p.bytes_per_line as usize).max(min))
}

fn fill_luma(out: &mut [u8], stride: usize, width: u32, height: u32, pattern: TestPattern) {
    for line in out.chunks_mut(stride).take(height as usize) {
        for (x, byte) in (0..width).zip(line.iter_mut()) {
            *byte = pattern.sample(x, width).0;
        }
    }
}

fn fill_interleaved(
    out: &mut [u8],
    stride: usize,
    width: u32,
    height: u32,
    swapped: bool,
    pattern: TestPattern,
) {
    let chroma_height = height.div_ceil(2) as usize;
    for line in out.chunks_mut(stride).take(chroma_height) {
        for (x, pair) in (0..width).step_by(2).zip(line.chunks_exact_mut(2)) {
            let (_, u, v) = pattern.sample(x, width);
            let (first, second) = if swapped { (v, u) } else { (u, v) };
            pair.copy_from_slice(&[first, second]);
        }
    }
}

fn fill_component(
    out: &mut [u8],
    stride: usize,
    width: u32,
    height: u32,
    pattern: TestPattern,
    pick: fn((u8, u8, u8)) -> u8,
) {
    let chroma_height = height.div_ceil(2) as usize;
    for line in out.chunks_mut(stride).take(chroma_height) {
        for (x, byte) in (0..width).step_by(2).zip(line.iter_mut()) {
            *byte = pick(pattern.sample(x, width));
        }
    }
}

/// Generate plane contents for `format`, one vector per memory plane.
///
/// Single-plane formats get luma followed by chroma; two-plane semi-planar
/// and three-plane planar formats get one component group per plane. Each
/// plane is at least as long as its `size_image`. Unsupported encodings get
/// zero-filled planes.
pub fn generate_test_planes(format: &ImageFormat, pattern: TestPattern) -> Vec<Vec<u8>> {
    let zeroed = || {
        format
            .planes
            .iter()
            .map(|p| vec![0u8; p.size_image as usize])
            .collect()
    };
    let Ok(encoding) = Encoding::from_fourcc(format.fourcc) else {
        return zeroed();
    };

    let (width, height) = (format.width, format.height);
    let chroma_width = width.div_ceil(2) as usize;
    let chroma_height = height.div_ceil(2) as usize;
    let luma_stride = stride_of(format, 0, width as usize);
    let luma_size = luma_stride * height as usize;
    let sized = |plane: usize, needed: usize| {
        let size = format.planes.get(plane).map_or(0, |p| p.size_image as usize);
        vec![0u8; size.max(needed)]
    };
    let swapped = encoding == Encoding::Nv21;

    match (encoding, format.num_planes()) {
        (Encoding::Nv12 | Encoding::Nv21, 1) => {
            let chroma_stride = luma_stride.max(chroma_width * 2);
            let mut data = sized(0, luma_size + chroma_stride * chroma_height);
            let (luma, chroma) = data.split_at_mut(luma_size);
            fill_luma(luma, luma_stride, width, height, pattern);
            fill_interleaved(chroma, chroma_stride, width, height, swapped, pattern);
            vec![data]
        }
        (Encoding::Nv12 | Encoding::Nv21, 2) => {
            let chroma_stride = stride_of(format, 1, chroma_width * 2);
            let mut luma = sized(0, luma_size);
            let mut chroma = sized(1, chroma_stride * chroma_height);
            fill_luma(&mut luma, luma_stride, width, height, pattern);
            fill_interleaved(&mut chroma, chroma_stride, width, height, swapped, pattern);
            vec![luma, chroma]
        }
        (Encoding::Yuv420, 1) => {
            let chroma_stride = luma_stride.div_ceil(2).max(chroma_width);
            let chroma_size = chroma_stride * chroma_height;
            let mut data = sized(0, luma_size + 2 * chroma_size);
            let (luma, rest) = data.split_at_mut(luma_size);
            let (u, v) = rest.split_at_mut(chroma_size);
            fill_luma(luma, luma_stride, width, height, pattern);
            fill_component(u, chroma_stride, width, height, pattern, |s| s.1);
            fill_component(v, chroma_stride, width, height, pattern, |s| s.2);
            vec![data]
        }
        (Encoding::Yuv420, 3) => {
            let u_stride = stride_of(format, 1, chroma_width);
            let v_stride = stride_of(format, 2, chroma_width);
            let mut luma = sized(0, luma_size);
            let mut u = sized(1, u_stride * chroma_height);
            let mut v = sized(2, v_stride * chroma_height);
            fill_luma(&mut luma, luma_stride, width, height, pattern);
            fill_component(&mut u, u_stride, width, height, pattern, |s| s.1);
            fill_component(&mut v, v_stride, width, height, pattern, |s| s.2);
            vec![luma, u, v]
        }
        _ => zeroed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;

    fn views(planes: &[Vec<u8>]) -> Vec<&[u8]> {
        planes.iter().map(Vec::as_slice).collect()
    }

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new();
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture_mplane);
        assert!(device.capabilities().can_stream);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_mock_device_format() {
        let mut device = MockDevice::new();
        let format = device.format().expect("format should succeed");
        assert_eq!(format.width, 640);
        assert_eq!(format.height, 480);
        assert_eq!(format.fourcc, FourCC::NV12);

        let new_format = ImageFormat::new(
            1280,
            720,
            FourCC::NV21,
            vec![PlaneFormat::new(1280, 1280 * 720 * 3 / 2)],
        );
        let actual = device.set_format(&new_format).expect("set_format should succeed");
        assert_eq!(actual, new_format);
        assert_eq!(device.calls(), vec![DeviceCall::Format, DeviceCall::SetFormat]);
    }

    #[test]
    fn test_mock_dequeue_follows_queue_order() {
        let mut device = MockDevice::new();
        device.request_buffers(2).expect("request");
        device.queue_buffer(1, &[]).expect("queue 1");
        device.queue_buffer(0, &[]).expect("queue 0");

        assert!(device.dequeue_buffer(1).is_err());

        device.stream_on().expect("stream on");
        let first = device.dequeue_buffer(1).expect("first");
        let second = device.dequeue_buffer(1).expect("second");
        assert_eq!((first.index, second.index), (1, 0));
        assert_eq!(second.metadata.sequence, first.metadata.sequence + 1);
        assert_eq!(second.metadata.timestamp, Duration::from_millis(33));
        assert_eq!(first.metadata.bytes_used, vec![640 * 480 * 3 / 2]);
        assert!(device.dequeue_buffer(1).is_err());
    }

    #[test]
    fn test_mock_stream_off_drops_queue() {
        let mut device = MockDevice::new();
        device.request_buffers(1).expect("request");
        device.queue_buffer(0, &[]).expect("queue");
        device.stream_on().expect("stream on");
        device.stream_off().expect("stream off");

        assert!(!device.is_streaming());
        device.queue_buffer(0, &[]).expect("requeue after stream off");
    }

    #[test]
    fn test_mock_close_is_idempotent() {
        let mut device = MockDevice::new();
        device.close();
        device.close();
        assert!(device.is_closed());
        assert_eq!(device.calls(), vec![DeviceCall::Close]);
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = ImageFormat::new(64, 48, FourCC::NV12, vec![PlaneFormat::new(64, 64 * 48 * 3 / 2)]);
        let planes = generate_test_planes(&format, TestPattern::ColorBars);

        assert_eq!(planes.len(), 1);
        assert_eq!(planes[0].len(), 64 * 48 * 3 / 2);
        // First bar is white, last is black.
        assert_eq!(planes[0][0], 235);
        assert_eq!(planes[0][63], 16);
    }

    #[test]
    fn test_gradient_pattern() {
        let format = ImageFormat::new(
            640,
            480,
            FourCC::NM12,
            vec![PlaneFormat::new(640, 640 * 480), PlaneFormat::new(640, 640 * 240)],
        );
        let planes = generate_test_planes(&format, TestPattern::Gradient);

        assert_eq!(planes.len(), 2);
        assert!(planes[0][0] < 10);
        assert!(planes[0][479 * 640 + 638] > 200);
        assert!(planes[1].iter().all(|b| *b == 128));
    }

    #[test]
    fn test_solid_pattern_in_every_layout() {
        let layouts = [
            ImageFormat::new(4, 2, FourCC::NV21, vec![PlaneFormat::new(4, 12)]),
            ImageFormat::new(4, 2, FourCC::YU12, vec![PlaneFormat::new(4, 12)]),
            ImageFormat::new(
                4,
                2,
                FourCC::YM12,
                vec![PlaneFormat::new(4, 8), PlaneFormat::new(2, 2), PlaneFormat::new(2, 2)],
            ),
        ];

        for format in layouts {
            let planes = generate_test_planes(&format, TestPattern::Solid(200, 60, 180));
            let frame = decode(&views(&planes), &format).expect("decode");
            assert!(
                frame
                    .data
                    .chunks_exact(3)
                    .all(|px| px == [77, 198, 255]),
                "{format} decoded wrongly"
            );
        }
    }

    #[test]
    fn test_unsupported_encoding_gets_zeroed_planes() {
        let format = ImageFormat::new(8, 2, FourCC::new(b"YUYV"), vec![PlaneFormat::new(16, 32)]);
        let planes = generate_test_planes(&format, TestPattern::ColorBars);
        assert_eq!(planes, vec![vec![0u8; 32]]);
    }
}
