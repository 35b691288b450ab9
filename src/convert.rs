//! Conversion between interleaved wire samples and `f32`.
//!
//! This is the default buffer adapter: it feeds the callbacks and the blocking adapter interleaved
//! `f32` samples and writes theirs back in the negotiated wire format. All wire samples are
//! little endian. 24-bit samples travel left-justified in a 32-bit container.

use dasp_sample::{Sample, I24};

use crate::SampleFormat;

/// Decodes `wire` into `out`, one `f32` per wire sample, and returns the number of samples
/// written. Extra space in `out` is left untouched.
pub(crate) fn wire_to_f32(format: SampleFormat, wire: &[u8], out: &mut [f32]) -> usize {
    let size = format.sample_size();
    let mut written = 0;
    for (bytes, sample) in wire.chunks_exact(size).zip(out.iter_mut()) {
        *sample = decode(format, bytes);
        written += 1;
    }
    written
}

/// Encodes `input` into `wire` and returns the number of samples written.
pub(crate) fn f32_to_wire(format: SampleFormat, input: &[f32], wire: &mut [u8]) -> usize {
    let size = format.sample_size();
    let mut written = 0;
    for (sample, bytes) in input.iter().zip(wire.chunks_exact_mut(size)) {
        encode(format, *sample, bytes);
        written += 1;
    }
    written
}

/// Fills `wire` with the silent value of `format`.
pub(crate) fn fill_silence(format: SampleFormat, wire: &mut [u8]) {
    match format {
        SampleFormat::U8 => wire.fill(u8::EQUILIBRIUM),
        _ => wire.fill(0),
    }
}

fn decode(format: SampleFormat, bytes: &[u8]) -> f32 {
    match format {
        SampleFormat::U8 => bytes[0].to_sample::<f32>(),
        SampleFormat::I16 => i16::from_le_bytes([bytes[0], bytes[1]]).to_sample::<f32>(),
        SampleFormat::I24 => {
            let container = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            I24::new_unchecked(container >> 8).to_sample::<f32>()
        }
        SampleFormat::I32 => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).to_sample::<f32>()
        }
        SampleFormat::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

fn encode(format: SampleFormat, sample: f32, bytes: &mut [u8]) {
    let sample = sample.clamp(-1.0, 1.0);
    match format {
        SampleFormat::U8 => bytes[0] = sample.to_sample::<u8>(),
        SampleFormat::I16 => bytes.copy_from_slice(&sample.to_sample::<i16>().to_le_bytes()),
        SampleFormat::I24 => {
            let container = sample.to_sample::<I24>().inner().clamp(-0x80_0000, 0x7f_ffff) << 8;
            bytes.copy_from_slice(&container.to_le_bytes());
        }
        SampleFormat::I32 => bytes.copy_from_slice(&sample.to_sample::<i32>().to_le_bytes()),
        SampleFormat::F32 => bytes.copy_from_slice(&sample.to_le_bytes()),
    }
}
