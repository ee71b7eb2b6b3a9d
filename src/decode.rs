//! Conversion of captured 4:2:0 YUV buffers into interleaved BGR images.
//!
//! Decoding is a pure function of the plane bytes and the format. It never
//! writes to the source planes, so it can run against mapped device memory
//! while the buffer is application-owned.

use image::RgbImage;

use crate::error::{CaptureError, Result};
use crate::traits::{FourCC, ImageFormat};

// BT.601 limited range, 20-bit fixed point.
const SHIFT: i32 = 20;
const HALF: i32 = 1 << (SHIFT - 1);
const CY: i32 = 1_220_542;
const CUB: i32 = 2_116_026;
const CUG: i32 = -409_993;
const CVG: i32 = -852_492;
const CVR: i32 = 1_673_527;

/// Supported pixel layouts.
///
/// Only 4:2:0 subsampling is decoded. `NV24` and the other 4:4:4 tags are
/// rejected with `UnsupportedEncoding`; `YU12`/`YM12` is the planar layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Luma plane followed by interleaved U/V pairs.
    Nv12,
    /// Luma plane followed by interleaved V/U pairs.
    Nv21,
    /// Luma plane followed by a U plane and a V plane.
    Yuv420,
}

impl Encoding {
    /// Maps a pixel encoding tag onto a supported layout.
    pub fn from_fourcc(fourcc: FourCC) -> Result<Self> {
        match &fourcc.0 {
            b"NV12" | b"NM12" => Ok(Self::Nv12),
            b"NV21" | b"NM21" => Ok(Self::Nv21),
            b"YU12" | b"YM12" => Ok(Self::Yuv420),
            _ => Err(CaptureError::UnsupportedEncoding(fourcc)),
        }
    }
}

/// Interleaved 8-bit BGR image copied out of a capture buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// `width * height * 3` bytes, B G R per pixel, rows top to bottom.
    pub data: Vec<u8>,
}

impl DecodedFrame {
    /// BGR value of the pixel at `(x, y)`, or `None` outside the image.
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        match self.data.get(offset..offset + 3)? {
            [b, g, r] => Some([*b, *g, *r]),
            _ => None,
        }
    }

    /// Converts to an RGB image for encoders that expect RGB order.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        let mut rgb = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(3) {
            if let [b, g, r] = px {
                rgb.extend_from_slice(&[*r, *g, *b]);
            }
        }
        RgbImage::from_raw(self.width, self.height, rgb)
    }
}

/// Converts one YUV sample to BGR.
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let u = i32::from(u) - 128;
    let v = i32::from(v) - 128;
    let luma = (i32::from(y) - 16).max(0) * CY + HALF;

    let clamp = |val: i32| -> u8 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            (val >> SHIFT).clamp(0, 255) as u8
        }
    };

    [
        clamp(luma + CUB * u),
        clamp(luma + CVG * v + CUG * u),
        clamp(luma + CVR * v),
    ]
}

/// One plane of component data with its row stride.
#[derive(Clone, Copy)]
struct PlaneView<'a> {
    data: &'a [u8],
    stride: usize,
}

impl<'a> PlaneView<'a> {
    fn row(&self, row: usize, len: usize) -> Result<&'a [u8]> {
        let start = row * self.stride;
        self.data.get(start..start + len).ok_or_else(|| {
            CaptureError::InvalidBuffer(format!(
                "plane too short for row {row} ({} bytes)",
                self.data.len()
            ))
        })
    }
}

enum Chroma<'a> {
    /// Interleaved pairs; `swapped` is true when V precedes U.
    Interleaved { plane: PlaneView<'a>, swapped: bool },
    Planar { u: PlaneView<'a>, v: PlaneView<'a> },
}

struct Layout<'a> {
    luma: PlaneView<'a>,
    chroma: Chroma<'a>,
}

/// Decodes the planes of one buffer into a BGR image.
///
/// `planes` holds one slice per memory plane. Single-plane buffers carry
/// luma followed by chroma contiguously (`height + height / 2` rows);
/// multi-plane buffers carry each component group in its own plane.
///
/// # Errors
///
/// - `UnsupportedEncoding` if the format's tag is outside the supported set
/// - `InvalidBuffer` if a plane is missing, empty or too short
pub fn decode(planes: &[&[u8]], format: &ImageFormat) -> Result<DecodedFrame> {
    let encoding = Encoding::from_fourcc(format.fourcc)?;

    if planes.is_empty() {
        return Err(CaptureError::InvalidBuffer("buffer has no planes".to_owned()));
    }
    if let Some(plane) = planes.iter().position(|p| p.is_empty()) {
        return Err(CaptureError::InvalidBuffer(format!("plane {plane} is empty")));
    }
    if format.width == 0 || format.height == 0 {
        return Err(CaptureError::InvalidBuffer(format!(
            "zero dimension {}x{}",
            format.width, format.height
        )));
    }

    let layout = resolve_layout(encoding, planes, format)?;
    convert(&layout, format.width as usize, format.height as usize)
}

fn stride_of(format: &ImageFormat, plane: usize, min: usize) -> usize {
    format
        .planes
        .get(plane)
        .map_or(min, |p| (p.bytes_per_line as usize).max(min))
}

fn split_at_checked(data: &[u8], at: usize) -> Result<(&[u8], &[u8])> {
    if at > data.len() {
        return Err(CaptureError::InvalidBuffer(format!(
            "plane holds {} bytes, layout needs at least {at}",
            data.len()
        )));
    }
    Ok(data.split_at(at))
}

fn resolve_layout<'a>(
    encoding: Encoding,
    planes: &[&'a [u8]],
    format: &ImageFormat,
) -> Result<Layout<'a>> {
    let width = format.width as usize;
    let height = format.height as usize;
    let chroma_width = width.div_ceil(2);
    let chroma_height = height.div_ceil(2);
    let luma_stride = stride_of(format, 0, width);

    match (encoding, planes) {
        (Encoding::Nv12 | Encoding::Nv21, &[single]) => {
            let (luma, chroma) = split_at_checked(single, luma_stride * height)?;
            Ok(Layout {
                luma: PlaneView {
                    data: luma,
                    stride: luma_stride,
                },
                chroma: Chroma::Interleaved {
                    plane: PlaneView {
                        data: chroma,
                        stride: luma_stride.max(chroma_width * 2),
                    },
                    swapped: encoding == Encoding::Nv21,
                },
            })
        }
        (Encoding::Nv12 | Encoding::Nv21, &[luma, chroma, ..]) => Ok(Layout {
            luma: PlaneView {
                data: luma,
                stride: luma_stride,
            },
            chroma: Chroma::Interleaved {
                plane: PlaneView {
                    data: chroma,
                    stride: stride_of(format, 1, chroma_width * 2),
                },
                swapped: encoding == Encoding::Nv21,
            },
        }),
        (Encoding::Yuv420, &[single]) => {
            let chroma_stride = luma_stride.div_ceil(2).max(chroma_width);
            let chroma_size = chroma_stride * chroma_height;
            let (luma, rest) = split_at_checked(single, luma_stride * height)?;
            let (u, v) = split_at_checked(rest, chroma_size)?;
            Ok(Layout {
                luma: PlaneView {
                    data: luma,
                    stride: luma_stride,
                },
                chroma: Chroma::Planar {
                    u: PlaneView {
                        data: u,
                        stride: chroma_stride,
                    },
                    v: PlaneView {
                        data: v,
                        stride: chroma_stride,
                    },
                },
            })
        }
        (Encoding::Yuv420, &[luma, u, v, ..]) => Ok(Layout {
            luma: PlaneView {
                data: luma,
                stride: luma_stride,
            },
            chroma: Chroma::Planar {
                u: PlaneView {
                    data: u,
                    stride: stride_of(format, 1, chroma_width),
                },
                v: PlaneView {
                    data: v,
                    stride: stride_of(format, 2, chroma_width),
                },
            },
        }),
        (Encoding::Yuv420, _) => Err(CaptureError::InvalidBuffer(format!(
            "planar 4:2:0 needs 1 or 3 planes, got {}",
            planes.len()
        ))),
        (_, &[]) => Err(CaptureError::InvalidBuffer("buffer has no planes".to_owned())),
    }
}

/// Writes one BGR row, sharing each chroma pair between two luma samples.
fn convert_row<I>(luma: &[u8], out_row: &mut [u8], pairs: I)
where
    I: Iterator<Item = (u8, u8)>,
{
    for ((lumas, outs), (u, v)) in luma.chunks(2).zip(out_row.chunks_mut(6)).zip(pairs) {
        for (y, px) in lumas.iter().zip(outs.chunks_exact_mut(3)) {
            px.copy_from_slice(&yuv_to_bgr(*y, u, v));
        }
    }
}

fn convert(layout: &Layout<'_>, width: usize, height: usize) -> Result<DecodedFrame> {
    let chroma_width = width.div_ceil(2);
    let row_bytes = width * 3;
    let mut data = vec![0u8; row_bytes * height];

    for (row, out_row) in data.chunks_exact_mut(row_bytes).enumerate() {
        let luma = layout.luma.row(row, width)?;
        let chroma_row = row / 2;

        match &layout.chroma {
            Chroma::Interleaved { plane, swapped } => {
                let row = plane.row(chroma_row, chroma_width * 2)?;
                let swapped = *swapped;
                let pairs = row
                    .iter()
                    .step_by(2)
                    .copied()
                    .zip(row.iter().skip(1).step_by(2).copied())
                    .map(move |(a, b)| if swapped { (b, a) } else { (a, b) });
                convert_row(luma, out_row, pairs);
            }
            Chroma::Planar { u, v } => {
                let pairs = u
                    .row(chroma_row, chroma_width)?
                    .iter()
                    .copied()
                    .zip(v.row(chroma_row, chroma_width)?.iter().copied());
                convert_row(luma, out_row, pairs);
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    Ok(DecodedFrame {
        width: width as u32,
        height: height as u32,
        data,
    })
}
