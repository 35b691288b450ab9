//! Wire formats exchanged with the hardware.
//!
//! A [`WaveFormat`] mirrors the fields of a `WAVEFORMATEXTENSIBLE` without tying the rest of the
//! crate to a platform header. Backends convert it to their native layout at the boundary.

use std::fmt;
use std::ops::{BitOr, Deref};

use crate::{ChannelCount, SampleFormat, SampleRate};

/// Most channels a stream may request.
pub const MAX_CHANNELS: ChannelCount = 64;

/// Speaker positions carried by a multichannel wire format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChannelMask(pub u32);

impl ChannelMask {
    pub const NONE: ChannelMask = ChannelMask(0);

    pub const FRONT_LEFT: ChannelMask = ChannelMask(0x1);
    pub const FRONT_RIGHT: ChannelMask = ChannelMask(0x2);
    pub const FRONT_CENTER: ChannelMask = ChannelMask(0x4);
    pub const LOW_FREQUENCY: ChannelMask = ChannelMask(0x8);
    pub const BACK_LEFT: ChannelMask = ChannelMask(0x10);
    pub const BACK_RIGHT: ChannelMask = ChannelMask(0x20);
    pub const FRONT_LEFT_OF_CENTER: ChannelMask = ChannelMask(0x40);
    pub const FRONT_RIGHT_OF_CENTER: ChannelMask = ChannelMask(0x80);
    pub const BACK_CENTER: ChannelMask = ChannelMask(0x100);
    pub const SIDE_LEFT: ChannelMask = ChannelMask(0x200);
    pub const SIDE_RIGHT: ChannelMask = ChannelMask(0x400);

    pub const MONO: ChannelMask = Self::FRONT_CENTER;
    pub const STEREO: ChannelMask = ChannelMask(Self::FRONT_LEFT.0 | Self::FRONT_RIGHT.0);
    pub const QUAD: ChannelMask =
        ChannelMask(Self::STEREO.0 | Self::BACK_LEFT.0 | Self::BACK_RIGHT.0);
    pub const SURROUND_5_1: ChannelMask =
        ChannelMask(Self::QUAD.0 | Self::FRONT_CENTER.0 | Self::LOW_FREQUENCY.0);
    pub const SURROUND_7_1: ChannelMask = ChannelMask(
        Self::SURROUND_5_1.0 | Self::FRONT_LEFT_OF_CENTER.0 | Self::FRONT_RIGHT_OF_CENTER.0,
    );

    /// The speaker layout implied by a bare channel count.
    pub const fn for_channels(channels: ChannelCount) -> ChannelMask {
        match channels {
            1 => Self::MONO,
            2 => Self::STEREO,
            3 => ChannelMask(Self::STEREO.0 | Self::LOW_FREQUENCY.0),
            4 => Self::QUAD,
            5 => ChannelMask(Self::QUAD.0 | Self::LOW_FREQUENCY.0),
            6 => Self::SURROUND_5_1,
            7 => ChannelMask(Self::SURROUND_5_1.0 | Self::BACK_CENTER.0),
            8 => Self::SURROUND_7_1,
            _ => Self::NONE,
        }
    }

    /// Number of speaker positions set in the mask.
    pub const fn speakers(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ChannelMask {
    type Output = ChannelMask;

    fn bitor(self, rhs: ChannelMask) -> ChannelMask {
        ChannelMask(self.0 | rhs.0)
    }
}

/// How the bits of a sample are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    Pcm,
    Float,
}

/// A concrete wire format as understood by an audio endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaveFormat {
    pub channels: ChannelCount,
    pub sample_rate: SampleRate,
    /// Container size of one sample.
    pub bits_per_sample: u16,
    pub valid_bits_per_sample: u16,
    pub encoding: SampleEncoding,
    pub channel_mask: ChannelMask,
    /// Whether the format needs the extensible layout (sub-format, valid bits and mask).
    pub extensible: bool,
}

impl WaveFormat {
    /// Builds the candidate wire format for a channel count, rate and sample format.
    ///
    /// A plain PCM layout is used for 8 or 16 bit integers at one or two channels when no mask is
    /// forced; everything else uses the extensible layout, with the mask implied by the channel
    /// count unless `mask` overrides it.
    pub fn new(
        channels: ChannelCount,
        sample_rate: SampleRate,
        sample_format: SampleFormat,
        mask: Option<ChannelMask>,
    ) -> WaveFormat {
        let plain = channels <= 2
            && matches!(sample_format, SampleFormat::U8 | SampleFormat::I16)
            && mask.is_none();
        let encoding = if sample_format.is_float() {
            SampleEncoding::Float
        } else {
            SampleEncoding::Pcm
        };
        WaveFormat {
            channels,
            sample_rate,
            bits_per_sample: sample_format.container_bits(),
            valid_bits_per_sample: sample_format.bits_per_sample(),
            encoding,
            channel_mask: if plain {
                ChannelMask::NONE
            } else {
                mask.unwrap_or(ChannelMask::for_channels(channels))
            },
            extensible: !plain,
        }
    }

    /// Plain 16-bit stereo PCM, the format every endpoint is expected to understand.
    pub fn pcm16_stereo(sample_rate: SampleRate) -> WaveFormat {
        WaveFormat::new(2, sample_rate, SampleFormat::I16, None)
    }

    /// Bytes per frame.
    #[inline]
    pub fn block_align(&self) -> u16 {
        self.channels.saturating_mul(self.bits_per_sample / 8)
    }

    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.block_align() as usize
    }

    #[inline]
    pub fn avg_bytes_per_sec(&self) -> u32 {
        self.sample_rate.0 * u32::from(self.block_align())
    }

    #[inline]
    pub fn frames_to_bytes(&self, frames: crate::FrameCount) -> usize {
        frames as usize * self.bytes_per_frame()
    }

    /// The sample format this wire format carries, if it is one the engine can convert.
    pub fn sample_format(&self) -> Option<SampleFormat> {
        match (
            self.encoding,
            self.bits_per_sample,
            self.valid_bits_per_sample,
        ) {
            (SampleEncoding::Float, 32, _) => Some(SampleFormat::F32),
            (SampleEncoding::Pcm, 8, _) => Some(SampleFormat::U8),
            (SampleEncoding::Pcm, 16, _) => Some(SampleFormat::I16),
            (SampleEncoding::Pcm, 32, 24) => Some(SampleFormat::I24),
            (SampleEncoding::Pcm, 32, 32) => Some(SampleFormat::I32),
            _ => None,
        }
    }

    /// Compares the sample layout of two formats, ignoring whether the plain or the extensible
    /// header is used to describe it.
    pub fn same_layout(&self, other: &WaveFormat) -> bool {
        self.channels == other.channels
            && self.sample_rate == other.sample_rate
            && self.bits_per_sample == other.bits_per_sample
            && self.valid_bits_per_sample == other.valid_bits_per_sample
            && self.encoding == other.encoding
            && self.effective_mask() == other.effective_mask()
    }

    fn effective_mask(&self) -> ChannelMask {
        if self.channel_mask.is_empty() {
            ChannelMask::for_channels(self.channels)
        } else {
            self.channel_mask
        }
    }
}

impl fmt::Display for WaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let encoding = match self.encoding {
            SampleEncoding::Pcm => "pcm",
            SampleEncoding::Float => "float",
        };
        write!(
            f,
            "{} ch, {} Hz, {}-bit {} ({} valid), mask {:#x}{}",
            self.channels,
            self.sample_rate.0,
            self.bits_per_sample,
            encoding,
            self.valid_bits_per_sample,
            self.channel_mask.0,
            if self.extensible { ", extensible" } else { "" }
        )
    }
}

/// What the caller asks the negotiator for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatRequest {
    pub channels: ChannelCount,
    pub sample_rate: SampleRate,
    pub sample_format: SampleFormat,
    /// Overrides the speaker layout implied by the channel count.
    pub channel_mask: Option<ChannelMask>,
}

impl FormatRequest {
    pub fn new(channels: ChannelCount, sample_rate: SampleRate, sample_format: SampleFormat) -> Self {
        FormatRequest {
            channels,
            sample_rate,
            sample_format,
            channel_mask: None,
        }
    }

    pub fn with_channel_mask(mut self, mask: ChannelMask) -> Self {
        self.channel_mask = Some(mask);
        self
    }

    /// The candidate wire format for this request.
    pub fn wave_format(&self) -> WaveFormat {
        WaveFormat::new(
            self.channels,
            self.sample_rate,
            self.sample_format,
            self.channel_mask,
        )
    }

    /// A request that reproduces `format` exactly, or `None` if its samples are not convertible.
    pub fn from_wave_format(format: &WaveFormat) -> Option<FormatRequest> {
        Some(FormatRequest {
            channels: format.channels,
            sample_rate: format.sample_rate,
            sample_format: format.sample_format()?,
            channel_mask: format.extensible.then_some(format.channel_mask),
        })
    }
}

/// A wire format that an endpoint has accepted.
///
/// Only the negotiator creates these, so holding one means the device said yes to exactly this
/// layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NegotiatedFormat(WaveFormat);

impl NegotiatedFormat {
    pub(crate) fn accepted(format: WaveFormat) -> Self {
        NegotiatedFormat(format)
    }

    pub fn wave_format(&self) -> &WaveFormat {
        &self.0
    }
}

impl Deref for NegotiatedFormat {
    type Target = WaveFormat;

    fn deref(&self) -> &WaveFormat {
        &self.0
    }
}

impl fmt::Display for NegotiatedFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}
