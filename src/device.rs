//! Multi-planar V4L2 capture device over raw ioctls.
//!
//! The `v4l` crate's high-level streams only cover single-planar buffers, so
//! this module drives the kernel interface directly through `v4l::v4l2` and the
//! `v4l::v4l_sys` bindings.

#![allow(unsafe_code)]

use std::iter;
use std::os::raw::{c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::time::Duration;
use std::{io, mem, slice};

use tracing::{debug, info, warn};
use v4l::capability::Flags;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, v4l2_buffer, v4l2_capability, v4l2_format,
    v4l2_memory_V4L2_MEMORY_MMAP, v4l2_plane, v4l2_requestbuffers,
};

use crate::error::{CaptureError, Result};
use crate::traits::{
    CaptureDevice, DequeuedBuffer, DeviceCapabilities, FourCC, FrameMetadata, ImageFormat,
    PlaneDescriptor, PlaneFormat,
};
use crate::validation::MAX_PLANES;

const BUF_TYPE: u32 = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
const MEMORY: u32 = v4l2_memory_V4L2_MEMORY_MMAP;

/// One plane of a device buffer mapped into process memory.
///
/// Unmapped when dropped.
pub struct MmapPlane {
    ptr: NonNull<u8>,
    len: usize,
}

impl AsRef<[u8]> for MmapPlane {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: `ptr` is a live shared mapping of `len` bytes until drop.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapPlane {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `mmap` with this length and is
        // unmapped only here.
        if let Err(err) = unsafe { v4l2::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } {
            warn!(%err, length = self.len, "munmap failed");
        }
    }
}

/// V4L2 multi-planar capture device.
pub struct V4L2Device {
    fd: Option<c_int>,
    path: PathBuf,
    capabilities: DeviceCapabilities,
}

impl V4L2Device {
    /// Open a device node in blocking mode and check it can capture
    /// multi-planar video.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let display = path.display().to_string();
        let open_failed = |reason: String| CaptureError::OpenFailed {
            path: display.clone(),
            reason,
        };

        let fd = v4l2::open(&path, libc::O_RDWR).map_err(|err| open_failed(err.to_string()))?;
        let mut device = Self {
            fd: Some(fd),
            path,
            capabilities: DeviceCapabilities::default(),
        };

        let capabilities = device
            .query_capabilities()
            .map_err(|err| open_failed(err.to_string()))?;
        if !capabilities.can_capture_mplane {
            return Err(open_failed(format!(
                "{} ({}) is not a multi-planar capture device",
                capabilities.card, capabilities.driver
            )));
        }

        info!(
            path = %device.path.display(),
            driver = %capabilities.driver,
            card = %capabilities.card,
            bus = %capabilities.bus_info,
            "opened capture device"
        );
        device.capabilities = capabilities;
        Ok(device)
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> io::Result<c_int> {
        self.fd
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device is closed"))
    }

    /// # Safety
    ///
    /// `arg` must be the structure type `request` expects.
    unsafe fn xioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        let fd = self.fd()?;
        loop {
            match v4l2::ioctl(fd, request, ptr::from_mut(arg).cast::<c_void>()) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn raw_format(&self) -> io::Result<v4l2_format> {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut raw: v4l2_format = unsafe { mem::zeroed() };
        raw.type_ = BUF_TYPE;
        // SAFETY: VIDIOC_G_FMT takes a v4l2_format.
        unsafe { self.xioctl(vidioc::VIDIOC_G_FMT, &mut raw)? };
        Ok(raw)
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(bytes.get(..end).unwrap_or_default()).into_owned()
}

/// Converts a driver format, keeping the plane count the driver reported.
///
/// Planes past the end of `plane_fmt` have no layout and are recorded empty,
/// leaving the count for `validate_format` to reject.
fn image_format(raw: &v4l2_format) -> ImageFormat {
    // SAFETY: the format was read with the multi-planar buffer type, so
    // `pix_mp` is the active member.
    let pix = unsafe { raw.fmt.pix_mp };
    let planes = pix
        .plane_fmt
        .iter()
        .map(|plane| PlaneFormat::new(plane.bytesperline, plane.sizeimage))
        .chain(iter::repeat(PlaneFormat::new(0, 0)))
        .take(usize::from(pix.num_planes))
        .collect();

    ImageFormat {
        width: pix.width,
        height: pix.height,
        fourcc: FourCC::from(pix.pixelformat),
        field: pix.field,
        colorspace: pix.colorspace,
        planes,
    }
}

impl CaptureDevice for V4L2Device {
    type Plane = MmapPlane;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn query_capabilities(&self) -> Result<DeviceCapabilities> {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut raw: v4l2_capability = unsafe { mem::zeroed() };
        // SAFETY: VIDIOC_QUERYCAP takes a v4l2_capability.
        unsafe { self.xioctl(vidioc::VIDIOC_QUERYCAP, &mut raw) }
            .map_err(|err| CaptureError::QueryFailed(format!("VIDIOC_QUERYCAP: {err}")))?;

        let mut flags = Flags::from(raw.capabilities);
        if flags.contains(Flags::DEVICE_CAPS) {
            flags = Flags::from(raw.device_caps);
        }

        Ok(DeviceCapabilities {
            driver: c_string(&raw.driver),
            card: c_string(&raw.card),
            bus_info: c_string(&raw.bus_info),
            can_capture: flags.contains(Flags::VIDEO_CAPTURE),
            can_capture_mplane: flags.contains(Flags::VIDEO_CAPTURE_MPLANE),
            can_stream: flags.contains(Flags::STREAMING),
        })
    }

    fn format(&self) -> Result<ImageFormat> {
        let raw = self
            .raw_format()
            .map_err(|err| CaptureError::FormatQueryFailed(format!("VIDIOC_G_FMT: {err}")))?;
        let format = image_format(&raw);
        debug!(%format, "read active format");
        Ok(format)
    }

    fn set_format(&mut self, format: &ImageFormat) -> Result<ImageFormat> {
        let mut raw = self
            .raw_format()
            .map_err(|err| CaptureError::FormatSetFailed(format!("VIDIOC_G_FMT: {err}")))?;

        // SAFETY: `raw` was filled for the multi-planar buffer type.
        let mut pix = unsafe { raw.fmt.pix_mp };
        pix.width = format.width;
        pix.height = format.height;
        pix.pixelformat = u32::from(format.fourcc);
        pix.field = format.field;
        pix.colorspace = format.colorspace;
        #[allow(clippy::cast_possible_truncation)]
        {
            pix.num_planes = format.num_planes().min(MAX_PLANES) as u8;
        }
        for (slot, plane) in pix.plane_fmt.iter_mut().zip(&format.planes) {
            slot.bytesperline = plane.bytes_per_line;
            slot.sizeimage = plane.size_image;
        }
        raw.fmt.pix_mp = pix;

        // SAFETY: VIDIOC_S_FMT takes a v4l2_format.
        unsafe { self.xioctl(vidioc::VIDIOC_S_FMT, &mut raw) }
            .map_err(|err| CaptureError::FormatSetFailed(format!("VIDIOC_S_FMT: {err}")))?;

        Ok(image_format(&raw))
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut raw: v4l2_requestbuffers = unsafe { mem::zeroed() };
        raw.type_ = BUF_TYPE;
        raw.memory = MEMORY;
        raw.count = count;

        // SAFETY: VIDIOC_REQBUFS takes a v4l2_requestbuffers.
        unsafe { self.xioctl(vidioc::VIDIOC_REQBUFS, &mut raw) }
            .map_err(|err| CaptureError::AllocFailed(format!("VIDIOC_REQBUFS({count}): {err}")))?;

        debug!(requested = count, granted = raw.count, "requested buffers");
        Ok(raw.count)
    }

    fn query_buffer(&mut self, index: u32, num_planes: usize) -> Result<Vec<PlaneDescriptor>> {
        // SAFETY: all-zero is a valid bit pattern for these plain C structs.
        let mut planes: [v4l2_plane; MAX_PLANES] = unsafe { mem::zeroed() };
        let mut raw: v4l2_buffer = unsafe { mem::zeroed() };
        raw.type_ = BUF_TYPE;
        raw.memory = MEMORY;
        raw.index = index;
        raw.m.planes = planes.as_mut_ptr();
        #[allow(clippy::cast_possible_truncation)]
        {
            raw.length = num_planes.min(MAX_PLANES) as u32;
        }

        // SAFETY: VIDIOC_QUERYBUF takes a v4l2_buffer whose `m.planes` points
        // at `length` plane structs; `planes` outlives the call.
        unsafe { self.xioctl(vidioc::VIDIOC_QUERYBUF, &mut raw) }
            .map_err(|err| CaptureError::AllocFailed(format!("VIDIOC_QUERYBUF({index}): {err}")))?;

        Ok(planes
            .iter()
            .take(raw.length as usize)
            .enumerate()
            .map(|(plane, info)| PlaneDescriptor {
                buffer: index,
                plane,
                // SAFETY: MMAP buffers report their offset in `mem_offset`.
                offset: unsafe { info.m.mem_offset },
                length: info.length,
            })
            .collect())
    }

    fn map_plane(&mut self, descriptor: &PlaneDescriptor) -> Result<MmapPlane> {
        let fd = self
            .fd()
            .map_err(|err| CaptureError::AllocFailed(err.to_string()))?;
        let len = descriptor.length as usize;

        // SAFETY: maps a fresh shared region; the kernel validates offset and
        // length against the buffer it belongs to.
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                libc::off_t::from(descriptor.offset),
            )
        }
        .map_err(|err| {
            CaptureError::AllocFailed(format!(
                "mmap of buffer {} plane {}: {err}",
                descriptor.buffer, descriptor.plane
            ))
        })?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| CaptureError::AllocFailed("mmap returned null".to_owned()))?;
        Ok(MmapPlane { ptr, len })
    }

    fn queue_buffer(&mut self, index: u32, bytes_used: &[u32]) -> Result<()> {
        // SAFETY: all-zero is a valid bit pattern for these plain C structs.
        let mut planes: [v4l2_plane; MAX_PLANES] = unsafe { mem::zeroed() };
        for (plane, used) in planes.iter_mut().zip(bytes_used) {
            plane.bytesused = *used;
        }
        let mut raw: v4l2_buffer = unsafe { mem::zeroed() };
        raw.type_ = BUF_TYPE;
        raw.memory = MEMORY;
        raw.index = index;
        raw.m.planes = planes.as_mut_ptr();
        #[allow(clippy::cast_possible_truncation)]
        {
            raw.length = bytes_used.len().min(MAX_PLANES) as u32;
        }

        // SAFETY: VIDIOC_QBUF takes a v4l2_buffer; `planes` outlives the call.
        unsafe { self.xioctl(vidioc::VIDIOC_QBUF, &mut raw) }.map_err(|err| {
            CaptureError::RequeueFailed {
                index,
                reason: format!("VIDIOC_QBUF: {err}"),
            }
        })
    }

    fn dequeue_buffer(&mut self, num_planes: usize) -> Result<DequeuedBuffer> {
        // SAFETY: all-zero is a valid bit pattern for these plain C structs.
        let mut planes: [v4l2_plane; MAX_PLANES] = unsafe { mem::zeroed() };
        let mut raw: v4l2_buffer = unsafe { mem::zeroed() };
        raw.type_ = BUF_TYPE;
        raw.memory = MEMORY;
        raw.m.planes = planes.as_mut_ptr();
        #[allow(clippy::cast_possible_truncation)]
        {
            raw.length = num_planes.min(MAX_PLANES) as u32;
        }

        // SAFETY: VIDIOC_DQBUF takes a v4l2_buffer; `planes` outlives the call.
        unsafe { self.xioctl(vidioc::VIDIOC_DQBUF, &mut raw) }
            .map_err(|err| CaptureError::DequeueFailed(format!("VIDIOC_DQBUF: {err}")))?;

        // V4L2 timestamps are non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = raw.timestamp.tv_sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (raw.timestamp.tv_usec.max(0) as u32).saturating_mul(1000);

        Ok(DequeuedBuffer {
            index: raw.index,
            metadata: FrameMetadata {
                sequence: raw.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: planes
                    .iter()
                    .take(raw.length as usize)
                    .map(|plane| plane.bytesused)
                    .collect(),
            },
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut kind = BUF_TYPE;
        // SAFETY: VIDIOC_STREAMON takes the buffer type as an int.
        unsafe { self.xioctl(vidioc::VIDIOC_STREAMON, &mut kind) }
            .map_err(|err| CaptureError::StreamOnFailed(format!("VIDIOC_STREAMON: {err}")))?;
        debug!(path = %self.path.display(), "streaming on");
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut kind = BUF_TYPE;
        // SAFETY: VIDIOC_STREAMOFF takes the buffer type as an int.
        unsafe { self.xioctl(vidioc::VIDIOC_STREAMOFF, &mut kind) }
            .map_err(|err| CaptureError::DequeueFailed(format!("VIDIOC_STREAMOFF: {err}")))?;
        debug!(path = %self.path.display(), "streaming off");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            match v4l2::close(fd) {
                Ok(()) => debug!(path = %self.path.display(), "closed device"),
                Err(err) => warn!(%err, path = %self.path.display(), "close failed"),
            }
        }
    }
}

impl Drop for V4L2Device {
    fn drop(&mut self) {
        self.close();
    }
}
