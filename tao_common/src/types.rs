//! Wire-stable element types and the pixel encoding tag.
//!
//! Both enumerations are part of the on-the-wire contract: values must
//! never be renumbered.

use crate::error::TaoError;

/// The ten element types a shared array payload may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ElementType {
    /// Signed 8-bit integer.
    I8 = 1,
    /// Unsigned 8-bit integer.
    U8 = 2,
    /// Signed 16-bit integer.
    I16 = 3,
    /// Unsigned 16-bit integer.
    U16 = 4,
    /// Signed 32-bit integer.
    I32 = 5,
    /// Unsigned 32-bit integer.
    U32 = 6,
    /// Signed 64-bit integer.
    I64 = 7,
    /// Unsigned 64-bit integer.
    U64 = 8,
    /// 32-bit IEEE-754 float.
    F32 = 9,
    /// 64-bit IEEE-754 float.
    F64 = 10,
}

impl ElementType {
    /// Size in bytes of one element of this type.
    pub const fn size(self) -> usize {
        match self {
            ElementType::I8 | ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::U64 | ElementType::F64 => 8,
        }
    }

    /// Decode a wire value (1..=10) into an [`ElementType`].
    pub fn from_wire(value: i32) -> Result<Self, TaoError> {
        Ok(match value {
            1 => ElementType::I8,
            2 => ElementType::U8,
            3 => ElementType::I16,
            4 => ElementType::U16,
            5 => ElementType::I32,
            6 => ElementType::U32,
            7 => ElementType::I64,
            8 => ElementType::U64,
            9 => ElementType::F32,
            10 => ElementType::F64,
            other => return Err(TaoError::BadPixelType(other)),
        })
    }

    /// The wire value (1..=10) for this type.
    pub const fn to_wire(self) -> i32 {
        self as i32
    }
}

bitflags::bitflags! {
    /// Pixel-encoding flag bits (bits 24-31 of the tag).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PixelFlags: u8 {
        /// Most-significant-bit padding within a packed unit.
        const MSB_PAD = 0b0000_0001;
        /// Least-significant-bit padding within a packed unit.
        const LSB_PAD = 0b0000_0010;
        /// Data is entropy-coded rather than raw.
        const CODED = 0b0000_0100;
        /// Multiple parallel taps/lanes are interleaved.
        const PARALLEL = 0b0000_1000;
    }
}

/// A 32-bit pixel encoding tag: bits-per-pixel (0-7), bits-per-packet
/// (8-15), colorant id (16-23), flags (24-31).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelEncoding(u32);

impl PixelEncoding {
    /// Build a tag from its four fields.
    pub const fn new(bits_per_pixel: u8, bits_per_packet: u8, colorant: u8, flags: PixelFlags) -> Self {
        PixelEncoding(
            (bits_per_pixel as u32)
                | ((bits_per_packet as u32) << 8)
                | ((colorant as u32) << 16)
                | ((flags.bits() as u32) << 24),
        )
    }

    /// Decode from a raw wire value.
    pub const fn from_raw(raw: u32) -> Self {
        PixelEncoding(raw)
    }

    /// Raw wire value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Bits per pixel.
    pub const fn bits_per_pixel(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Bits per packet (the smallest group of bytes pixels are packed into).
    pub const fn bits_per_packet(self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    /// Colorant identifier (mono, RGB, Bayer, ...).
    pub const fn colorant(self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    /// Flag bits.
    pub fn flags(self) -> PixelFlags {
        PixelFlags::from_bits_truncate(((self.0 >> 24) & 0xFF) as u8)
    }
}

/// Known colorant ids.
pub mod colorant {
    /// Monochrome.
    pub const MONO: u8 = 0;
    /// RGB, byte order R,G,B.
    pub const RGB: u8 = 1;
    /// BGR, byte order B,G,R.
    pub const BGR: u8 = 2;
    /// ARGB with leading alpha byte.
    pub const ARGB: u8 = 3;
    /// Bayer-patterned mosaic.
    pub const BAYER: u8 = 4;
    /// YUV family (4:2:2 and friends).
    pub const YUV: u8 = 5;
}

/// Known encodings referenced elsewhere in this workspace (mono
/// 8/12/12-packed/16/32, and the 22-bit-packed-as-4-pixels-in-11-bytes
/// camera quirk).
pub mod known_encodings {
    use super::{colorant, PixelEncoding, PixelFlags};

    /// 8 bits per pixel, monochrome, byte-aligned.
    pub const MONO8: PixelEncoding = PixelEncoding::new(8, 8, colorant::MONO, PixelFlags::empty());
    /// 12 bits per pixel, monochrome, stored in 16-bit words, MSB padded.
    pub const MONO12: PixelEncoding =
        PixelEncoding::new(12, 16, colorant::MONO, PixelFlags::MSB_PAD);
    /// 12 bits per pixel, two pixels packed into three bytes.
    pub const MONO12_PACKED: PixelEncoding =
        PixelEncoding::new(12, 24, colorant::MONO, PixelFlags::empty());
    /// 16 bits per pixel, monochrome.
    pub const MONO16: PixelEncoding = PixelEncoding::new(16, 16, colorant::MONO, PixelFlags::empty());
    /// 32 bits per pixel, monochrome.
    pub const MONO32: PixelEncoding = PixelEncoding::new(32, 32, colorant::MONO, PixelFlags::empty());
    /// 22-bit samples, 4 pixels packed into 11 bytes, parallel taps.
    pub const PACKED22_4IN11: PixelEncoding =
        PixelEncoding::new(22, 88, colorant::MONO, PixelFlags::PARALLEL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_type_wire_roundtrip() {
        for v in 1..=10i32 {
            let et = ElementType::from_wire(v).unwrap();
            assert_eq!(et.to_wire(), v);
        }
        assert!(ElementType::from_wire(0).is_err());
        assert!(ElementType::from_wire(11).is_err());
    }

    #[test]
    fn element_sizes() {
        assert_eq!(ElementType::I8.size(), 1);
        assert_eq!(ElementType::U16.size(), 2);
        assert_eq!(ElementType::F32.size(), 4);
        assert_eq!(ElementType::F64.size(), 8);
    }

    #[test]
    fn pixel_encoding_fields() {
        let enc = PixelEncoding::new(12, 24, colorant::MONO, PixelFlags::empty());
        assert_eq!(enc.bits_per_pixel(), 12);
        assert_eq!(enc.bits_per_packet(), 24);
        assert_eq!(enc.colorant(), colorant::MONO);
        assert!(enc.flags().is_empty());
        assert_eq!(enc, PixelEncoding::from_raw(enc.raw()));
    }

    #[test]
    fn known_encoding_quirk() {
        let enc = known_encodings::PACKED22_4IN11;
        assert_eq!(enc.bits_per_pixel(), 22);
        assert!(enc.flags().contains(PixelFlags::PARALLEL));
    }
}
