//! In-memory pixel buffers that can cross the worker boundary.
//!
//! The set of shapes is closed: every buffer the worker can hand back is one of the
//! [`PixelBuffer`] variants, each carrying its dimensions, row stride and raw samples.
//! A plane always holds exactly `stride * rows` bytes.

use imageproc::image::{
    DynamicImage, GenericImageView, GrayImage, ImageBuffer, Rgb, Rgba as RgbaPixel, RgbImage,
    RgbaImage,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::VariantTag;

/// Chroma subsampling of a planar [`Ycbcr`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChromaSubsampling {
    Ratio444,
    Ratio422,
    Ratio420,
    Ratio440,
    Ratio411,
    Ratio410,
}

impl ChromaSubsampling {
    /// Horizontal and vertical luma pixels per chroma sample.
    fn divisors(self) -> (u32, u32) {
        match self {
            ChromaSubsampling::Ratio444 => (1, 1),
            ChromaSubsampling::Ratio422 => (2, 1),
            ChromaSubsampling::Ratio420 => (2, 2),
            ChromaSubsampling::Ratio440 => (1, 2),
            ChromaSubsampling::Ratio411 => (4, 1),
            ChromaSubsampling::Ratio410 => (4, 2),
        }
    }

    pub fn chroma_dimensions(self, width: u32, height: u32) -> (u32, u32) {
        let (dx, dy) = self.divisors();
        (width.div_ceil(dx), height.div_ceil(dy))
    }
}

/// Planar luma/chroma image, the native output of most JPEG decoders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ycbcr {
    pub width: u32,
    pub height: u32,
    pub y_stride: usize,
    pub c_stride: usize,
    pub subsampling: ChromaSubsampling,
    #[serde(with = "serde_bytes")]
    pub y: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub cb: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub cr: Vec<u8>,
}

/// Packed 8-bit RGBA, four bytes per pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rgba {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    #[serde(with = "serde_bytes")]
    pub pix: Vec<u8>,
}

/// Packed 16-bit RGBA, eight bytes per pixel, big-endian samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rgba64 {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    #[serde(with = "serde_bytes")]
    pub pix: Vec<u8>,
}

/// 8-bit grayscale, one byte per pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gray {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    #[serde(with = "serde_bytes")]
    pub pix: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    Ycbcr(Ycbcr),
    Rgba(Rgba),
    Rgba64(Rgba64),
    Gray(Gray),
}

fn check_plane(name: &str, len: usize, stride: usize, min_stride: usize, rows: u32) -> Result<()> {
    if stride < min_stride {
        return Err(Error::Decode(format!(
            "{name} stride {stride} is smaller than a row of {min_stride} bytes"
        )));
    }
    let expected = stride.checked_mul(rows as usize).ok_or_else(|| {
        Error::Decode(format!("{name} of {rows} rows with stride {stride} is too large"))
    })?;
    if len != expected {
        return Err(Error::Decode(format!(
            "{name} holds {len} bytes, expected {expected} ({stride} x {rows})"
        )));
    }
    Ok(())
}

/// Copies `rows` rows of `row_len` bytes out of a strided plane into a tight buffer.
fn pack_rows(pix: &[u8], stride: usize, row_len: usize, rows: u32) -> Vec<u8> {
    if stride == row_len {
        return pix[..row_len * rows as usize].to_vec();
    }
    pix.chunks(stride)
        .take(rows as usize)
        .flat_map(|row| &row[..row_len])
        .copied()
        .collect()
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// JFIF RGB to Y'CbCr in 16.16 fixed point.
fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = (19595 * r + 38470 * g + 7471 * b + (1 << 15)) >> 16;
    let cb = (-11056 * r - 21712 * g + 32768 * b + (257 << 15)) >> 16;
    let cr = (32768 * r - 27440 * g - 5328 * b + (257 << 15)) >> 16;
    (clamp_u8(y), clamp_u8(cb), clamp_u8(cr))
}

fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let yy = y as i32 * 0x10101;
    let cb = cb as i32 - 128;
    let cr = cr as i32 - 128;
    let r = (yy + 91881 * cr) >> 16;
    let g = (yy - 22554 * cb - 46802 * cr) >> 16;
    let b = (yy + 116130 * cb) >> 16;
    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

impl Ycbcr {
    /// Full-resolution (4:4:4) conversion of an RGB image.
    pub fn from_rgb(img: &RgbImage) -> Self {
        let (width, height) = img.dimensions();
        let len = width as usize * height as usize;
        let mut y = Vec::with_capacity(len);
        let mut cb = Vec::with_capacity(len);
        let mut cr = Vec::with_capacity(len);

        for px in img.pixels() {
            let (py, pcb, pcr) = rgb_to_ycbcr(px[0], px[1], px[2]);
            y.push(py);
            cb.push(pcb);
            cr.push(pcr);
        }

        Self {
            width,
            height,
            y_stride: width as usize,
            c_stride: width as usize,
            subsampling: ChromaSubsampling::Ratio444,
            y,
            cb,
            cr,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (cw, ch) = self.subsampling.chroma_dimensions(self.width, self.height);
        check_plane("luma plane", self.y.len(), self.y_stride, self.width as usize, self.height)?;
        check_plane("cb plane", self.cb.len(), self.c_stride, cw as usize, ch)?;
        check_plane("cr plane", self.cr.len(), self.c_stride, cw as usize, ch)
    }

    fn to_rgb(&self) -> RgbImage {
        let (dx, dy) = self.subsampling.divisors();
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let yi = y as usize * self.y_stride + x as usize;
            let ci = (y / dy) as usize * self.c_stride + (x / dx) as usize;
            Rgb(ycbcr_to_rgb(self.y[yi], self.cb[ci], self.cr[ci]))
        })
    }
}

impl Rgba {
    pub fn new(width: u32, height: u32, pix: Vec<u8>) -> Result<Self> {
        let rgba = Self {
            width,
            height,
            stride: width as usize * 4,
            pix,
        };
        rgba.validate()?;
        Ok(rgba)
    }

    pub fn validate(&self) -> Result<()> {
        check_plane("rgba", self.pix.len(), self.stride, self.width as usize * 4, self.height)
    }
}

impl Rgba64 {
    pub fn validate(&self) -> Result<()> {
        check_plane("rgba64", self.pix.len(), self.stride, self.width as usize * 8, self.height)
    }
}

impl Gray {
    pub fn new(width: u32, height: u32, pix: Vec<u8>) -> Result<Self> {
        let gray = Self {
            width,
            height,
            stride: width as usize,
            pix,
        };
        gray.validate()?;
        Ok(gray)
    }

    pub fn validate(&self) -> Result<()> {
        check_plane("gray", self.pix.len(), self.stride, self.width as usize, self.height)
    }
}

impl PixelBuffer {
    pub fn tag(&self) -> VariantTag {
        match self {
            PixelBuffer::Ycbcr(_) => VariantTag::Ycbcr,
            PixelBuffer::Rgba(_) => VariantTag::Rgba,
            PixelBuffer::Rgba64(_) => VariantTag::Rgba64,
            PixelBuffer::Gray(_) => VariantTag::Gray,
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            PixelBuffer::Ycbcr(b) => b.width,
            PixelBuffer::Rgba(b) => b.width,
            PixelBuffer::Rgba64(b) => b.width,
            PixelBuffer::Gray(b) => b.width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            PixelBuffer::Ycbcr(b) => b.height,
            PixelBuffer::Rgba(b) => b.height,
            PixelBuffer::Rgba64(b) => b.height,
            PixelBuffer::Gray(b) => b.height,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            PixelBuffer::Ycbcr(b) => b.validate(),
            PixelBuffer::Rgba(b) => b.validate(),
            PixelBuffer::Rgba64(b) => b.validate(),
            PixelBuffer::Gray(b) => b.validate(),
        }
    }

    /// Picks the closest shape for a decoded image.
    ///
    /// Color JPEG sources keep a planar representation; 16-bit sources keep their depth.
    pub fn from_dynamic(img: DynamicImage, jpeg_source: bool) -> Self {
        let (width, height) = img.dimensions();
        match img {
            DynamicImage::ImageLuma8(gray) => PixelBuffer::Gray(Gray {
                width,
                height,
                stride: width as usize,
                pix: gray.into_raw(),
            }),
            DynamicImage::ImageRgb8(rgb) if jpeg_source => PixelBuffer::Ycbcr(Ycbcr::from_rgb(&rgb)),
            img @ (DynamicImage::ImageLuma16(_)
            | DynamicImage::ImageLumaA16(_)
            | DynamicImage::ImageRgb16(_)
            | DynamicImage::ImageRgba16(_)) => {
                let pix = img
                    .to_rgba16()
                    .into_raw()
                    .into_iter()
                    .flat_map(u16::to_be_bytes)
                    .collect();
                PixelBuffer::Rgba64(Rgba64 {
                    width,
                    height,
                    stride: width as usize * 8,
                    pix,
                })
            }
            img => PixelBuffer::Rgba(Rgba {
                width,
                height,
                stride: width as usize * 4,
                pix: img.to_rgba8().into_raw(),
            }),
        }
    }

    /// Converts back into an [`image`](imageproc::image) buffer, dropping any row padding.
    pub fn to_dynamic(&self) -> Result<DynamicImage> {
        self.validate()?;
        let mismatch = || Error::Decode("pixel buffer does not match its dimensions".into());

        let img = match self {
            PixelBuffer::Ycbcr(b) => DynamicImage::ImageRgb8(b.to_rgb()),
            PixelBuffer::Rgba(b) => {
                let pix = pack_rows(&b.pix, b.stride, b.width as usize * 4, b.height);
                DynamicImage::ImageRgba8(
                    RgbaImage::from_raw(b.width, b.height, pix).ok_or_else(mismatch)?,
                )
            }
            PixelBuffer::Rgba64(b) => {
                let samples = pack_rows(&b.pix, b.stride, b.width as usize * 8, b.height)
                    .chunks_exact(2)
                    .map(|s| u16::from_be_bytes([s[0], s[1]]))
                    .collect();
                let buf: ImageBuffer<RgbaPixel<u16>, Vec<u16>> =
                    ImageBuffer::from_raw(b.width, b.height, samples).ok_or_else(mismatch)?;
                DynamicImage::ImageRgba16(buf)
            }
            PixelBuffer::Gray(b) => {
                let pix = pack_rows(&b.pix, b.stride, b.width as usize, b.height);
                DynamicImage::ImageLuma8(
                    GrayImage::from_raw(b.width, b.height, pix).ok_or_else(mismatch)?,
                )
            }
        };

        Ok(img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::image::Luma;

    #[test]
    fn chroma_dimensions_round_up() {
        assert_eq!(ChromaSubsampling::Ratio444.chroma_dimensions(5, 3), (5, 3));
        assert_eq!(ChromaSubsampling::Ratio420.chroma_dimensions(5, 3), (3, 2));
        assert_eq!(ChromaSubsampling::Ratio422.chroma_dimensions(5, 3), (3, 3));
        assert_eq!(ChromaSubsampling::Ratio411.chroma_dimensions(5, 3), (2, 3));
        assert_eq!(ChromaSubsampling::Ratio410.chroma_dimensions(5, 3), (2, 2));
    }

    #[test]
    fn rejects_buffer_that_disagrees_with_stride() {
        let err = Rgba::new(4, 4, vec![0; 4 * 4 * 4 - 1]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));

        let gray = Gray {
            width: 4,
            height: 2,
            stride: 3,
            pix: vec![0; 6],
        };
        assert!(gray.validate().is_err());
    }

    #[test]
    fn padded_rows_are_stripped() {
        let gray = Gray {
            width: 2,
            height: 2,
            stride: 3,
            pix: vec![1, 2, 99, 3, 4, 99],
        };
        let img = PixelBuffer::Gray(gray).to_dynamic().unwrap();
        assert_eq!(img.to_luma8().into_raw(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn jpeg_sources_become_planar() {
        let rgb: RgbImage = ImageBuffer::from_pixel(7, 5, Rgb([200, 30, 90]));
        let buf = PixelBuffer::from_dynamic(DynamicImage::ImageRgb8(rgb.clone()), true);
        assert_eq!(buf.tag(), VariantTag::Ycbcr);
        assert_eq!(buf.dimensions(), (7, 5));

        // fixed-point conversion drifts by at most one step per channel
        let back = buf.to_dynamic().unwrap().to_rgb8();
        for (a, b) in back.pixels().zip(rgb.pixels()) {
            for c in 0..3 {
                assert!((a[c] as i32 - b[c] as i32).abs() <= 2, "{a:?} vs {b:?}");
            }
        }

        let other = PixelBuffer::from_dynamic(DynamicImage::ImageRgb8(rgb), false);
        assert_eq!(other.tag(), VariantTag::Rgba);
    }

    #[test]
    fn sixteen_bit_sources_keep_depth() {
        let img: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_pixel(3, 2, Luma([0xABCD]));
        let buf = PixelBuffer::from_dynamic(DynamicImage::ImageLuma16(img), false);
        let PixelBuffer::Rgba64(rgba64) = &buf else {
            panic!("expected rgba64, got {:?}", buf.tag());
        };
        assert_eq!(&rgba64.pix[..2], &[0xAB, 0xCD]);

        let back = buf.to_dynamic().unwrap().to_rgba16();
        assert_eq!(back.get_pixel(2, 1).0, [0xABCD, 0xABCD, 0xABCD, 0xFFFF]);
    }
}
