//! Translation between [`WaveFormat`] and the native `WAVEFORMATEX` family.

use std::{mem, ptr};

use windows::core::GUID;
use windows::Win32::Media::{Audio, KernelStreaming, Multimedia};
use windows::Win32::System::Com;

use crate::format::{ChannelMask, SampleEncoding};
use crate::{SampleRate, WaveFormat};

const EXTENSION_SIZE: usize =
    mem::size_of::<Audio::WAVEFORMATEXTENSIBLE>() - mem::size_of::<Audio::WAVEFORMATEX>();

// Use RAII to make sure CoTaskMemFree is called when we are responsible for freeing.
pub(super) struct WaveFormatExPtr(pub(super) *mut Audio::WAVEFORMATEX);

impl Drop for WaveFormatExPtr {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { Com::CoTaskMemFree(Some(self.0 as *const _)) };
        }
    }
}

/// The native layout of `format`: a plain `WAVEFORMATEX` at the head of the extensible struct, or
/// the whole extensible struct.
pub(super) fn to_native(format: &WaveFormat) -> Audio::WAVEFORMATEXTENSIBLE {
    let (format_tag, cb_size) = if format.extensible {
        (KernelStreaming::WAVE_FORMAT_EXTENSIBLE, EXTENSION_SIZE as u16)
    } else {
        let tag = match format.encoding {
            SampleEncoding::Pcm => Audio::WAVE_FORMAT_PCM,
            SampleEncoding::Float => Multimedia::WAVE_FORMAT_IEEE_FLOAT,
        };
        (tag, 0)
    };
    let sub_format = match format.encoding {
        SampleEncoding::Pcm => KernelStreaming::KSDATAFORMAT_SUBTYPE_PCM,
        SampleEncoding::Float => Multimedia::KSDATAFORMAT_SUBTYPE_IEEE_FLOAT,
    };
    Audio::WAVEFORMATEXTENSIBLE {
        Format: Audio::WAVEFORMATEX {
            wFormatTag: format_tag as u16,
            nChannels: format.channels,
            nSamplesPerSec: format.sample_rate.0,
            nAvgBytesPerSec: format.avg_bytes_per_sec(),
            nBlockAlign: format.block_align(),
            wBitsPerSample: format.bits_per_sample,
            cbSize: cb_size,
        },
        Samples: Audio::WAVEFORMATEXTENSIBLE_0 {
            wValidBitsPerSample: format.valid_bits_per_sample,
        },
        dwChannelMask: format.channel_mask.0,
        SubFormat: sub_format,
    }
}

/// Pointer to the head of a native format, as the audio client APIs take it.
pub(super) fn as_waveformatex(native: &Audio::WAVEFORMATEXTENSIBLE) -> *const Audio::WAVEFORMATEX {
    native as *const Audio::WAVEFORMATEXTENSIBLE as *const Audio::WAVEFORMATEX
}

/// Reads a native format handed out by the audio engine.
///
/// Returns `None` for encodings other than integer PCM and IEEE float.
///
/// # Safety
///
/// `format` must point to a valid `WAVEFORMATEX`, followed by the extension its `cbSize` claims.
pub(super) unsafe fn from_native(format: *const Audio::WAVEFORMATEX) -> Option<WaveFormat> {
    if format.is_null() {
        return None;
    }
    let head = ptr::read_unaligned(format);
    let (encoding, valid_bits, mask, extensible) = match head.wFormatTag as u32 {
        Audio::WAVE_FORMAT_PCM => (SampleEncoding::Pcm, head.wBitsPerSample, 0, false),
        Multimedia::WAVE_FORMAT_IEEE_FLOAT => {
            (SampleEncoding::Float, head.wBitsPerSample, 0, false)
        }
        KernelStreaming::WAVE_FORMAT_EXTENSIBLE if head.cbSize as usize >= EXTENSION_SIZE => {
            let ext = ptr::read_unaligned(format as *const Audio::WAVEFORMATEXTENSIBLE);
            let sub_format: GUID = ext.SubFormat;
            let encoding = if sub_format == KernelStreaming::KSDATAFORMAT_SUBTYPE_PCM {
                SampleEncoding::Pcm
            } else if sub_format == Multimedia::KSDATAFORMAT_SUBTYPE_IEEE_FLOAT {
                SampleEncoding::Float
            } else {
                return None;
            };
            let valid_bits = match ext.Samples.wValidBitsPerSample {
                0 => head.wBitsPerSample,
                bits => bits,
            };
            (encoding, valid_bits, ext.dwChannelMask, true)
        }
        _ => return None,
    };
    Some(WaveFormat {
        channels: head.nChannels,
        sample_rate: SampleRate(head.nSamplesPerSec),
        bits_per_sample: head.wBitsPerSample,
        valid_bits_per_sample: valid_bits,
        encoding,
        channel_mask: ChannelMask(mask),
        extensible,
    })
}
