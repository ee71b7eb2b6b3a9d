//! Queue/dequeue state machine over a mapped buffer pool.

use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::decode::{decode, DecodedFrame, Encoding};
use crate::error::{CaptureError, Result};
use crate::format::{get_format, negotiate};
use crate::pool::{BufferPool, MappedBuffer, Owner};
use crate::traits::{CaptureDevice, FrameMetadata, ImageFormat};
use crate::validation::validate_format;

/// Streaming state of a [`CaptureStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No stream-on issued, or stopped since.
    Idle,
    /// The device is filling queued buffers.
    Streaming,
}

/// A decoded frame together with the buffer it came from.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Index of the buffer the frame was read from.
    pub index: u32,
    /// Converted image, independent of the buffer memory.
    pub frame: DecodedFrame,
    /// Metadata reported by the device.
    pub metadata: FrameMetadata,
}

/// Capture stream over one device and its buffer pool.
///
/// The stream borrows the device for its whole lifetime, so the device cannot
/// be closed while buffers are mapped. Dropping the stream stops it and tears
/// the pool down.
pub struct CaptureStream<'d, D: CaptureDevice> {
    device: &'d mut D,
    pool: BufferPool<D::Plane>,
    format: ImageFormat,
    state: StreamState,
}

impl<'d, D: CaptureDevice> CaptureStream<'d, D> {
    /// Wrap an allocated pool. The stream starts idle.
    ///
    /// `format` must be the format the pool was allocated for; it stays fixed
    /// for the stream's lifetime.
    pub fn new(device: &'d mut D, pool: BufferPool<D::Plane>, format: ImageFormat) -> Self {
        Self {
            device,
            pool,
            format,
            state: StreamState::Idle,
        }
    }

    /// Negotiate a format and allocate buffers as described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedEncoding` before any buffer is requested when the
    /// active encoding cannot be decoded.
    pub fn with_config(device: &'d mut D, config: &CaptureConfig) -> Result<Self> {
        let format = if config.reapply_format {
            negotiate(&mut *device)?
        } else {
            let format = get_format(&*device)?;
            validate_format(&format)?;
            format
        };
        Encoding::from_fourcc(format.fourcc)?;

        let pool = BufferPool::allocate(&mut *device, &format, config.buffer_count)?;
        Ok(Self::new(device, pool, format))
    }

    /// Current state.
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// The format buffers were sized for and frames are decoded with.
    pub const fn format(&self) -> &ImageFormat {
        &self.format
    }

    /// The underlying buffer pool.
    pub const fn pool(&self) -> &BufferPool<D::Plane> {
        &self.pool
    }

    /// Queue every application-owned buffer, then begin streaming.
    ///
    /// Does nothing if already streaming. On failure every buffer is returned
    /// to the application and the stream stays idle.
    ///
    /// # Errors
    ///
    /// Returns `StreamOnFailed` if a buffer cannot be queued or the device
    /// refuses to start.
    pub fn start(&mut self) -> Result<()> {
        if self.state == StreamState::Streaming {
            return Ok(());
        }

        let pending: Vec<u32> = self
            .pool
            .iter()
            .filter(|buffer| buffer.owner() == Owner::Application)
            .map(MappedBuffer::index)
            .collect();

        for index in pending {
            if let Err(err) = self.pool.queue(&mut *self.device, index) {
                self.abort_start();
                return Err(CaptureError::StreamOnFailed(err.to_string()));
            }
        }

        if let Err(err) = self.device.stream_on() {
            self.abort_start();
            return Err(err);
        }

        self.state = StreamState::Streaming;
        info!(buffers = self.pool.len(), format = %self.format, "stream started");
        Ok(())
    }

    fn abort_start(&mut self) {
        if self.pool.queued() > 0 {
            if let Err(err) = self.device.stream_off() {
                warn!(%err, "failed to reclaim buffers after aborted start");
            }
        }
        self.pool.reclaim_all();
    }

    /// Block until the device completes a buffer and take ownership of it.
    ///
    /// # Errors
    ///
    /// Returns `NotStreaming` without touching the device while idle. Returns
    /// `DequeueFailed` without touching the device when no buffer is queued,
    /// and also if the device fails or returns a buffer that was not queued.
    pub fn capture_next(&mut self) -> Result<u32> {
        if self.state != StreamState::Streaming {
            return Err(CaptureError::NotStreaming);
        }
        // A blocking DQBUF with an empty queue never returns.
        if self.pool.queued() == 0 {
            return Err(CaptureError::DequeueFailed(
                "no buffer is queued with the device".to_owned(),
            ));
        }

        let dequeued = self.device.dequeue_buffer(self.format.num_planes())?;
        let sequence = dequeued.metadata.sequence;
        let index = self.pool.complete(dequeued)?;
        debug!(index, sequence, "dequeued buffer");
        Ok(index)
    }

    /// Return a buffer obtained from [`Self::capture_next`] to the device.
    ///
    /// A failed release leaves the buffer application-owned; the caller may
    /// retry or stop the stream.
    pub fn release(&mut self, index: u32) -> Result<()> {
        self.pool.queue(&mut *self.device, index)?;
        debug!(index, "requeued buffer");
        Ok(())
    }

    /// Buffer by index, only while application-owned.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBuffer` for an unknown index or a device-owned buffer.
    pub fn buffer(&self, index: u32) -> Result<&MappedBuffer<D::Plane>> {
        let buffer = self
            .pool
            .get(index)
            .ok_or_else(|| CaptureError::InvalidBuffer(format!("no buffer with index {index}")))?;
        if buffer.owner() == Owner::Device {
            return Err(CaptureError::InvalidBuffer(format!(
                "buffer {index} is owned by the device"
            )));
        }
        Ok(buffer)
    }

    /// Decode the contents of an application-owned buffer.
    pub fn decode(&self, index: u32) -> Result<DecodedFrame> {
        let planes = self.buffer(index)?.planes()?;
        decode(&planes, &self.format)
    }

    /// Dequeue, decode and re-queue one frame.
    ///
    /// The buffer is returned to the device even when decoding fails. If the
    /// re-queue itself fails, the `RequeueFailed` error names the buffer,
    /// which stays application-owned. It takes precedence over a decode error.
    pub fn capture_frame(&mut self) -> Result<CapturedFrame> {
        let index = self.capture_next()?;
        let metadata = self
            .pool
            .get(index)
            .and_then(MappedBuffer::metadata)
            .cloned()
            .unwrap_or_default();

        let decoded = self.decode(index);
        let released = self.release(index);

        match (decoded, released) {
            (Ok(frame), Ok(())) => Ok(CapturedFrame {
                index,
                frame,
                metadata,
            }),
            (Ok(_), Err(requeue)) => Err(requeue),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(requeue)) => {
                warn!(%err, index, "decode failed and buffer could not be requeued");
                Err(requeue)
            }
        }
    }

    /// End streaming. Every buffer returns to the application.
    ///
    /// Does nothing while idle. A device error is logged and the stream still
    /// becomes idle.
    pub fn stop(&mut self) {
        if self.state == StreamState::Idle {
            return;
        }

        if let Err(err) = self.device.stream_off() {
            warn!(%err, "stream off failed");
        }
        self.pool.reclaim_all();
        self.state = StreamState::Idle;
        info!("stream stopped");
    }

    /// Stop streaming and unmap every buffer.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop();
        self.pool.teardown(&mut *self.device);
    }
}

impl<D: CaptureDevice> Drop for CaptureStream<'_, D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
