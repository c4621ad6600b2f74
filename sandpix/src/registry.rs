//! Tagged wire encoding for [`PixelBuffer`] values.
//!
//! A payload is one tag byte followed by the MessagePack body of the concrete shape.
//! Both processes must register the same set of tags; the set is the wire contract
//! between a host and its worker build.

use num_enum::TryFromPrimitive;
use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::error::{Error, Result};
use crate::pixel::{Gray, PixelBuffer, Rgba, Rgba64, Ycbcr};

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, EnumCount, EnumIter, strum::Display,
)]
#[repr(u8)]
pub enum VariantTag {
    Ycbcr = 1,
    Rgba = 2,
    Rgba64 = 3,
    Gray = 4,
}

impl VariantTag {
    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// The set of pixel-buffer shapes a process has agreed to send and receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registry {
    registered: u8,
}

impl Registry {
    /// An empty registry; nothing can be encoded or decoded until shapes are registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every shape this build knows about.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for tag in VariantTag::iter() {
            registry.register(tag);
        }
        registry
    }

    /// Registering the same shape twice is a no-op.
    pub fn register(&mut self, tag: VariantTag) -> &mut Self {
        self.registered |= tag.bit();
        self
    }

    pub fn is_registered(&self, tag: VariantTag) -> bool {
        self.registered & tag.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.registered.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.registered == 0
    }

    pub fn encode(&self, value: &PixelBuffer) -> Result<Vec<u8>> {
        let tag = value.tag();
        if !self.is_registered(tag) {
            return Err(Error::UnknownVariant(tag as u8));
        }

        let mut out = vec![tag as u8];
        let written = match value {
            PixelBuffer::Ycbcr(b) => rmp_serde::encode::write_named(&mut out, b),
            PixelBuffer::Rgba(b) => rmp_serde::encode::write_named(&mut out, b),
            PixelBuffer::Rgba64(b) => rmp_serde::encode::write_named(&mut out, b),
            PixelBuffer::Gray(b) => rmp_serde::encode::write_named(&mut out, b),
        };
        written.map_err(|e| Error::Transport(format!("encoding {tag} pixel buffer: {e}")))?;

        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer> {
        let (&raw, body) = bytes
            .split_first()
            .ok_or_else(|| Error::Decode("empty pixel buffer payload".into()))?;

        let tag = VariantTag::try_from(raw).map_err(|_| Error::UnknownVariant(raw))?;
        if !self.is_registered(tag) {
            return Err(Error::UnknownVariant(raw));
        }

        let value = match tag {
            VariantTag::Ycbcr => from_body::<Ycbcr>(tag, body).map(PixelBuffer::Ycbcr),
            VariantTag::Rgba => from_body::<Rgba>(tag, body).map(PixelBuffer::Rgba),
            VariantTag::Rgba64 => from_body::<Rgba64>(tag, body).map(PixelBuffer::Rgba64),
            VariantTag::Gray => from_body::<Gray>(tag, body).map(PixelBuffer::Gray),
        }?;

        value.validate()?;
        Ok(value)
    }
}

fn from_body<T: serde::de::DeserializeOwned>(tag: VariantTag, body: &[u8]) -> Result<T> {
    rmp_serde::from_slice(body).map_err(|e| Error::Decode(format!("malformed {tag} pixel buffer: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::ChromaSubsampling;

    fn ycbcr_420() -> PixelBuffer {
        // 3x3 luma with 2x2 chroma, padded luma rows
        PixelBuffer::Ycbcr(Ycbcr {
            width: 3,
            height: 3,
            y_stride: 4,
            c_stride: 2,
            subsampling: ChromaSubsampling::Ratio420,
            y: (0..12).collect(),
            cb: vec![10, 20, 30, 40],
            cr: vec![50, 60, 70, 80],
        })
    }

    #[test]
    fn standard_registry_covers_every_shape() {
        let registry = Registry::standard();
        assert_eq!(registry.len(), VariantTag::COUNT);
        assert!(VariantTag::iter().all(|tag| registry.is_registered(tag)));
    }

    #[test]
    fn registering_twice_is_a_no_op() {
        let mut once = Registry::new();
        once.register(VariantTag::Gray);

        let mut twice = Registry::new();
        twice.register(VariantTag::Gray).register(VariantTag::Gray);

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn round_trip_preserves_planes_and_strides() {
        let registry = Registry::standard();
        let original = ycbcr_420();

        let bytes = registry.encode(&original).unwrap();
        assert_eq!(bytes[0], VariantTag::Ycbcr as u8);

        assert_eq!(registry.decode(&bytes).unwrap(), original);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let registry = Registry::standard();
        assert!(matches!(registry.decode(&[0xEE, 0x90]), Err(Error::UnknownVariant(0xEE))));

        let mut gray_only = Registry::new();
        gray_only.register(VariantTag::Gray);
        let bytes = registry.encode(&ycbcr_420()).unwrap();
        assert!(matches!(gray_only.decode(&bytes), Err(Error::UnknownVariant(1))));
        assert!(matches!(gray_only.encode(&ycbcr_420()), Err(Error::UnknownVariant(1))));
    }

    #[test]
    fn inconsistent_body_is_a_decode_error() {
        let registry = Registry::standard();
        let bad = PixelBuffer::Gray(Gray {
            width: 10,
            height: 10,
            stride: 10,
            pix: vec![0; 5],
        });
        let bytes = registry.encode(&bad).unwrap();
        assert!(matches!(registry.decode(&bytes), Err(Error::Decode(_))));

        assert!(matches!(
            registry.decode(&[VariantTag::Rgba as u8, 0xC1]),
            Err(Error::Decode(_))
        ));
        assert!(matches!(registry.decode(&[]), Err(Error::Decode(_))));
    }

    #[test]
    fn overflowing_stride_is_a_decode_error() {
        let registry = Registry::standard();
        let gray = PixelBuffer::Gray(Gray {
            width: 1,
            height: 2,
            stride: usize::MAX / 2 + 1,
            pix: vec![],
        });
        let bytes = registry.encode(&gray).unwrap();
        assert!(matches!(registry.decode(&bytes), Err(Error::Decode(_))));

        let ycbcr = PixelBuffer::Ycbcr(Ycbcr {
            width: 2,
            height: 2,
            y_stride: 2,
            c_stride: usize::MAX / 2 + 1,
            subsampling: ChromaSubsampling::Ratio444,
            y: vec![0; 4],
            cb: vec![],
            cr: vec![],
        });
        let bytes = registry.encode(&ycbcr).unwrap();
        assert!(matches!(registry.decode(&bytes), Err(Error::Decode(_))));
    }
}
