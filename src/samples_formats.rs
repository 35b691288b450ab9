use std::fmt;

/// Format of each sample on the wire, as requested by the caller.
///
/// Samples wider than 16 bits are carried in 32-bit containers, so [`SampleFormat::I24`] occupies
/// four bytes per sample with 24 valid bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// `u8` with a valid range of `u8::MIN..=u8::MAX` with `1 << 7 == 128` being the origin.
    U8,
    /// `i16` with a valid range of `i16::MIN..=i16::MAX` with `0` being the origin.
    I16,
    /// 24-bit signed integer, left-justified in a 32-bit container.
    I24,
    /// `i32` with a valid range of `i32::MIN..=i32::MAX` with `0` being the origin.
    I32,
    /// `f32` with a valid range of `-1.0..=1.0` with `0.0` being the origin.
    F32,
}

impl SampleFormat {
    /// Number of meaningful bits per sample.
    #[inline]
    pub const fn bits_per_sample(self) -> u16 {
        match self {
            SampleFormat::U8 => 8,
            SampleFormat::I16 => 16,
            SampleFormat::I24 => 24,
            SampleFormat::I32 | SampleFormat::F32 => 32,
        }
    }

    /// Number of bits of the container the sample travels in.
    #[inline]
    pub const fn container_bits(self) -> u16 {
        let bits = self.bits_per_sample();
        if bits > 16 {
            32
        } else {
            bits
        }
    }

    /// Returns the size in bytes of a sample of this format.
    #[inline]
    pub const fn sample_size(self) -> usize {
        (self.container_bits() / 8) as usize
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, SampleFormat::F32)
    }

    #[inline]
    pub const fn is_int(self) -> bool {
        !self.is_float()
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SampleFormat::U8 => "u8",
            SampleFormat::I16 => "i16",
            SampleFormat::I24 => "i24",
            SampleFormat::I32 => "i32",
            SampleFormat::F32 => "f32",
        }
        .fmt(f)
    }
}
