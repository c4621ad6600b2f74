//! Image codec used inside the worker process.

use std::borrow::Cow;
use std::io::Cursor;

use anyhow::{Context, Result};
use imageproc::image::codecs::jpeg::JpegEncoder;
use imageproc::image::codecs::png::{CompressionType, FilterType, PngEncoder};
use imageproc::image::{ColorType, DynamicImage, ImageEncoder, ImageFormat, ImageReader};

use crate::protocol::{ImageConfig, OutputFormat};

pub struct Decoded {
    /// Lowercase container name, e.g. `jpeg` or `png`.
    pub format: String,
    pub image: DynamicImage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeSettings {
    pub quality: Option<u8>,
    pub progressive: bool,
}

/// Native decode/encode routines the worker exposes over the wire.
///
/// Implementations may panic or fail on hostile input; the worker catches both.
pub trait Codec: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<Decoded>;

    /// Reads only as much of the input as needed to learn its format and dimensions.
    fn decode_config(&self, data: &[u8]) -> Result<ImageConfig>;

    fn encode(&self, img: &DynamicImage, format: OutputFormat, settings: EncodeSettings)
        -> Result<Vec<u8>>;
}

/// [`Codec`] backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

pub fn format_name(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "jpeg".to_string(),
        other => other
            .extensions_str()
            .first()
            .map(|ext| ext.to_string())
            .unwrap_or_else(|| format!("{other:?}").to_lowercase()),
    }
}

impl Codec for ImageCodec {
    fn decode(&self, data: &[u8]) -> Result<Decoded> {
        let format = imageproc::image::guess_format(data).context("unrecognized image format")?;
        let image = imageproc::image::load_from_memory_with_format(data, format)
            .with_context(|| format!("failed to decode {}", format_name(format)))?;

        Ok(Decoded {
            format: format_name(format),
            image,
        })
    }

    fn decode_config(&self, data: &[u8]) -> Result<ImageConfig> {
        let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
        let format = reader.format().context("unrecognized image format")?;
        let (width, height) = reader
            .into_dimensions()
            .with_context(|| format!("failed to read {} header", format_name(format)))?;

        Ok(ImageConfig {
            format: format_name(format),
            width,
            height,
        })
    }

    fn encode(
        &self,
        img: &DynamicImage,
        format: OutputFormat,
        settings: EncodeSettings,
    ) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(img.width() as usize * img.height() as usize);
        match format {
            OutputFormat::Jpeg => {
                if settings.progressive {
                    log::debug!("progressive JPEG is not supported by this codec, writing baseline");
                }
                let quality = settings.quality.unwrap_or(crate::render::DEFAULT_QUALITY);
                compress_to_jpeg(img, &mut buffer, quality)?;
            }
            OutputFormat::Png => compress_to_png(img, &mut buffer)?,
        }
        Ok(buffer)
    }
}

/// Compress an image to JPEG format with the specified quality
pub fn compress_to_jpeg<W>(img: &DynamicImage, writer: &mut W, quality: u8) -> Result<()>
where
    W: std::io::Write,
{
    // JPEG has no alpha channel and only 8-bit samples
    let img = match img.color() {
        ColorType::L8 | ColorType::Rgb8 => Cow::Borrowed(img),
        ColorType::La8 | ColorType::L16 | ColorType::La16 => {
            Cow::Owned(DynamicImage::ImageLuma8(img.to_luma8()))
        }
        _ => Cow::Owned(DynamicImage::ImageRgb8(img.to_rgb8())),
    };

    let encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
    encoder
        .write_image(
            img.as_bytes(),
            img.width(),
            img.height(),
            img.color().into(),
        )
        .with_context(|| "Failed to compress image to JPEG")?;

    Ok(())
}

/// Compress an image to PNG format
pub fn compress_to_png<W>(img: &DynamicImage, writer: &mut W) -> Result<()>
where
    W: std::io::Write,
{
    let img = match img.color() {
        ColorType::Rgb32F | ColorType::Rgba32F => {
            Cow::Owned(DynamicImage::ImageRgba16(img.to_rgba16()))
        }
        _ => Cow::Borrowed(img),
    };

    let is_grayscale = matches!(img.color(), ColorType::L8 | ColorType::La8);

    let encoder = PngEncoder::new_with_quality(
        writer,
        CompressionType::Default,
        if is_grayscale {
            FilterType::NoFilter
        } else {
            FilterType::Adaptive
        },
    );

    encoder
        .write_image(
            img.as_bytes(),
            img.width(),
            img.height(),
            img.color().into(),
        )
        .with_context(|| "Failed to compress image to PNG")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::image::{GrayImage, Luma, Rgba, RgbaImage};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 200])
        }))
    }

    #[test]
    fn renders_keep_dimensions() {
        let codec = ImageCodec;
        let img = gradient(37, 21);

        for format in [OutputFormat::Jpeg, OutputFormat::Png] {
            let bytes = codec.encode(&img, format, EncodeSettings::default()).unwrap();
            let decoded = codec.decode(&bytes).unwrap();
            assert_eq!(decoded.format, format.to_string());
            assert_eq!((decoded.image.width(), decoded.image.height()), (37, 21));

            let config = codec.decode_config(&bytes).unwrap();
            assert_eq!(
                config,
                ImageConfig {
                    format: format.to_string(),
                    width: 37,
                    height: 21
                }
            );
        }
    }

    #[test]
    fn lower_quality_makes_smaller_jpegs() {
        let codec = ImageCodec;
        let img = gradient(128, 128);
        let size = |quality| {
            codec
                .encode(
                    &img,
                    OutputFormat::Jpeg,
                    EncodeSettings {
                        quality: Some(quality),
                        progressive: true,
                    },
                )
                .unwrap()
                .len()
        };
        assert!(size(95) > size(55));
    }

    #[test]
    fn grayscale_png_round_trips_exactly() {
        let codec = ImageCodec;
        let img = DynamicImage::ImageLuma8(GrayImage::from_fn(9, 4, |x, y| Luma([(x * 20 + y) as u8])));
        let bytes = codec.encode(&img, OutputFormat::Png, EncodeSettings::default()).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.image.to_luma8(), img.to_luma8());
    }

    #[test]
    fn garbage_is_rejected() {
        let codec = ImageCodec;
        assert!(codec.decode(b"definitely not an image").is_err());
        assert!(codec.decode_config(b"definitely not an image").is_err());
        // valid signature, truncated body
        assert!(codec.decode(b"\x89PNG\r\n\x1a\n\0\0").is_err());
    }
}
