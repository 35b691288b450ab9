//! Duration arithmetic in the platform's native 100-nanosecond units and hardware packet
//! alignment.

use std::ops::{Add, Sub};
use std::time::Duration;

use crate::{FrameCount, SampleRate};

/// Reference time units per second.
pub const UNITS_PER_SECOND: i64 = 10_000_000;

/// Reference time units per millisecond.
pub const UNITS_PER_MILLISECOND: i64 = 10_000;

/// Exclusive-mode buffers must hold a whole number of HD Audio packets of this many bytes.
pub const PACKET_SIZE_BYTES: u32 = 128;

/// A duration in 100-nanosecond units, as used by the audio client for periods and latencies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReferenceTime(pub i64);

impl ReferenceTime {
    pub const ZERO: ReferenceTime = ReferenceTime(0);

    pub const fn from_millis(millis: i64) -> ReferenceTime {
        ReferenceTime(millis * UNITS_PER_MILLISECOND)
    }

    /// The playback duration of `frames` at `rate`, rounded to the nearest unit.
    pub fn from_frames(frames: FrameCount, rate: SampleRate) -> ReferenceTime {
        if rate.0 == 0 {
            return ReferenceTime::ZERO;
        }
        let units = UNITS_PER_SECOND as f64 / f64::from(rate.0) * f64::from(frames) + 0.5;
        ReferenceTime(units as i64)
    }

    /// The number of frames that play in this duration at `rate`, rounded to the nearest frame.
    pub fn to_frames(self, rate: SampleRate) -> FrameCount {
        if self.0 <= 0 {
            return 0;
        }
        let frames = self.0 as f64 * f64::from(rate.0) / UNITS_PER_SECOND as f64 + 0.5;
        frames as FrameCount
    }

    pub fn from_duration(duration: Duration) -> ReferenceTime {
        ReferenceTime((duration.as_nanos() / 100).min(i64::MAX as u128) as i64)
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.0.max(0) as u64 * 100)
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / UNITS_PER_SECOND as f64
    }

    pub fn as_millis(self) -> i64 {
        self.0 / UNITS_PER_MILLISECOND
    }
}

impl Add for ReferenceTime {
    type Output = ReferenceTime;

    fn add(self, rhs: ReferenceTime) -> ReferenceTime {
        ReferenceTime(self.0 + rhs.0)
    }
}

impl Sub for ReferenceTime {
    type Output = ReferenceTime;

    fn sub(self, rhs: ReferenceTime) -> ReferenceTime {
        ReferenceTime(self.0 - rhs.0)
    }
}

/// The wall-clock length of `frames` at `rate`.
pub fn frames_to_duration(frames: FrameCount, rate: SampleRate) -> Duration {
    if rate.0 == 0 {
        return Duration::ZERO;
    }
    let nanos = u64::from(frames) * 1_000_000_000 / u64::from(rate.0);
    Duration::from_nanos(nanos)
}

/// Which way [`align_frames`] rounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alignment {
    /// Round down, never below one packet.
    Backward,
    /// Round up.
    Forward,
}

/// Smallest frame count whose byte size is a whole number of hardware packets.
pub fn packet_frames(block_align: u16) -> FrameCount {
    let block = u32::from(block_align.max(1));
    lcm(PACKET_SIZE_BYTES, block) / block
}

/// Rounds `frames` to a multiple of the hardware packet boundary for frames of `block_align`
/// bytes. The result is never zero.
pub fn align_frames(frames: FrameCount, block_align: u16, alignment: Alignment) -> FrameCount {
    let step = packet_frames(block_align);
    let aligned = match alignment {
        Alignment::Backward => frames / step * step,
        Alignment::Forward => frames.div_ceil(step).saturating_mul(step),
    };
    aligned.max(step)
}

/// True if `frames` of `block_align` bytes fill a whole number of hardware packets.
pub fn is_packet_aligned(frames: FrameCount, block_align: u16) -> bool {
    (u64::from(frames) * u64::from(block_align)) % u64::from(PACKET_SIZE_BYTES) == 0
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn lcm(a: u32, b: u32) -> u32 {
    a / gcd(a, b) * b
}
