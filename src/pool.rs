//! Device buffers mapped into process memory, each tagged with its owner.
//!
//! A buffer is device-owned between a successful queue and the matching
//! dequeue, application-owned otherwise. Only application-owned buffers expose
//! their bytes. Mapped planes unmap themselves when dropped, so every plane is
//! unmapped exactly once whichever path releases the pool.

use tracing::{debug, info, warn};

use crate::error::{CaptureError, Result};
use crate::traits::{CaptureDevice, DequeuedBuffer, FrameMetadata, ImageFormat};
use crate::validation::validate_format;

/// Which party may touch a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Queued; the hardware may write it at any time.
    Device,
    /// Dequeued and not yet re-queued; safe to read.
    Application,
}

/// One device buffer and its mapped planes.
pub struct MappedBuffer<P> {
    index: u32,
    planes: Vec<P>,
    owner: Owner,
    metadata: Option<FrameMetadata>,
}

impl<P: AsRef<[u8]>> MappedBuffer<P> {
    /// Index of the buffer within the pool.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Current owner.
    pub const fn owner(&self) -> Owner {
        self.owner
    }

    /// Number of mapped planes.
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Mapped length of each plane.
    pub fn plane_lengths(&self) -> Vec<usize> {
        self.planes.iter().map(|p| p.as_ref().len()).collect()
    }

    /// Metadata of the frame held by the buffer, set when it was last dequeued.
    pub const fn metadata(&self) -> Option<&FrameMetadata> {
        self.metadata.as_ref()
    }

    /// Plane contents.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBuffer` while the buffer is owned by the device.
    pub fn planes(&self) -> Result<Vec<&[u8]>> {
        if self.owner == Owner::Device {
            return Err(CaptureError::InvalidBuffer(format!(
                "buffer {} is owned by the device",
                self.index
            )));
        }
        Ok(self.planes.iter().map(AsRef::as_ref).collect())
    }
}

/// Fixed set of mapped buffers for one stream.
pub struct BufferPool<P> {
    buffers: Vec<MappedBuffer<P>>,
    bytes_used: Vec<u32>,
}

impl<P: AsRef<[u8]>> BufferPool<P> {
    /// Requests `count` buffers and maps every plane of each.
    ///
    /// The plane count comes from `format`, which is validated before any
    /// device call. If a query or mapping fails, everything mapped so far is
    /// unmapped and the device allocation is released before returning.
    ///
    /// # Errors
    ///
    /// Returns `AllocFailed` for an unusable format, a zero count, a refused
    /// request or a failed query or mapping.
    pub fn allocate<D>(device: &mut D, format: &ImageFormat, count: u32) -> Result<Self>
    where
        D: CaptureDevice<Plane = P>,
    {
        validate_format(format).map_err(|err| CaptureError::AllocFailed(err.to_string()))?;
        if count == 0 {
            return Err(CaptureError::AllocFailed(
                "buffer count must be at least 1".to_owned(),
            ));
        }

        let granted = device.request_buffers(count)?;
        if granted == 0 {
            return Err(CaptureError::AllocFailed(
                "device granted no buffers".to_owned(),
            ));
        }
        if granted != count {
            debug!(requested = count, granted, "driver adjusted buffer count");
        }

        match Self::map_buffers(device, granted, format.num_planes()) {
            Ok(buffers) => {
                info!(
                    buffers = buffers.len(),
                    planes = format.num_planes(),
                    "mapped buffer pool"
                );
                Ok(Self {
                    buffers,
                    bytes_used: format.bytes_used(),
                })
            }
            Err(err) => {
                // Partial mappings are already dropped; release the driver side too.
                if let Err(release) = device.request_buffers(0) {
                    warn!(%release, "failed to release device buffers after allocation error");
                }
                Err(err)
            }
        }
    }

    fn map_buffers<D>(device: &mut D, count: u32, num_planes: usize) -> Result<Vec<MappedBuffer<P>>>
    where
        D: CaptureDevice<Plane = P>,
    {
        let mut buffers = Vec::with_capacity(count as usize);

        for index in 0..count {
            let descriptors = device.query_buffer(index, num_planes)?;
            if descriptors.len() != num_planes {
                return Err(CaptureError::AllocFailed(format!(
                    "buffer {index} reports {} planes, format has {num_planes}",
                    descriptors.len()
                )));
            }

            let planes = descriptors
                .iter()
                .map(|descriptor| -> Result<P> {
                    let plane = device.map_plane(descriptor)?;
                    debug!(
                        buffer = index,
                        plane = descriptor.plane,
                        length = descriptor.length,
                        "mapped plane"
                    );
                    Ok(plane)
                })
                .collect::<Result<Vec<P>>>()?;

            buffers.push(MappedBuffer {
                index,
                planes,
                owner: Owner::Application,
                metadata: None,
            });
        }

        Ok(buffers)
    }

    /// Number of buffers in the pool.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pool holds no buffers (after teardown).
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffer by index.
    pub fn get(&self, index: u32) -> Option<&MappedBuffer<P>> {
        self.buffers.get(index as usize)
    }

    /// Iterates over all buffers.
    pub fn iter(&self) -> impl Iterator<Item = &MappedBuffer<P>> {
        self.buffers.iter()
    }

    /// Number of buffers currently owned by the device.
    pub fn queued(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.owner == Owner::Device)
            .count()
    }

    /// Hands an application-owned buffer to the device.
    ///
    /// # Errors
    ///
    /// Returns `RequeueFailed` if the index is unknown, the buffer is already
    /// queued, or the device rejects it. The buffer stays application-owned on
    /// failure.
    pub fn queue<D>(&mut self, device: &mut D, index: u32) -> Result<()>
    where
        D: CaptureDevice<Plane = P>,
    {
        let buffer = self
            .buffers
            .get_mut(index as usize)
            .ok_or_else(|| CaptureError::RequeueFailed {
                index,
                reason: "no such buffer".to_owned(),
            })?;

        if buffer.owner == Owner::Device {
            return Err(CaptureError::RequeueFailed {
                index,
                reason: "buffer is already queued".to_owned(),
            });
        }

        device.queue_buffer(index, &self.bytes_used)?;
        buffer.owner = Owner::Device;
        buffer.metadata = None;
        Ok(())
    }

    /// Records that the device handed a buffer back.
    ///
    /// # Errors
    ///
    /// Returns `DequeueFailed` if the index is unknown or the buffer was not
    /// queued, which means the device and the pool disagree about ownership.
    pub fn complete(&mut self, dequeued: DequeuedBuffer) -> Result<u32> {
        let index = dequeued.index;
        let buffer = self.buffers.get_mut(index as usize).ok_or_else(|| {
            CaptureError::DequeueFailed(format!("device returned unknown buffer {index}"))
        })?;

        if buffer.owner == Owner::Application {
            return Err(CaptureError::DequeueFailed(format!(
                "buffer {index} dequeued while not queued"
            )));
        }

        buffer.owner = Owner::Application;
        buffer.metadata = Some(dequeued.metadata);
        Ok(index)
    }

    /// Marks every buffer application-owned, as after a stream-off.
    pub fn reclaim_all(&mut self) {
        for buffer in &mut self.buffers {
            buffer.owner = Owner::Application;
        }
    }

    /// Unmaps every buffer and releases the device allocation.
    ///
    /// Must only be called while the stream is idle. Calling it again is a
    /// no-op.
    pub fn teardown<D>(&mut self, device: &mut D)
    where
        D: CaptureDevice<Plane = P>,
    {
        if self.buffers.is_empty() {
            return;
        }

        let queued = self.queued();
        if queued > 0 {
            warn!(queued, "tearing down pool with buffers still owned by the device");
        }

        let count = self.buffers.len();
        let planes: usize = self.buffers.iter().map(MappedBuffer::plane_count).sum();
        self.buffers.clear();
        info!(buffers = count, planes, "unmapped buffer pool");

        if let Err(err) = device.request_buffers(0) {
            warn!(%err, "failed to release device buffers");
        }
    }
}
