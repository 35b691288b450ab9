//! # How to use wasapi-engine
//!
//! wasapi-engine drives audio streams on a WASAPI-style device service. It finds out what the
//! endpoints can do, negotiates a wire format, sizes and initializes the hardware clients, and
//! runs one delivery thread per stream that exchanges buffers with the hardware.
//!
//! Here are the concepts it exposes:
//!
//! - A [`Host`] enumerates the audio endpoints once and opens streams on them. On Windows,
//!   [`Host::new`] talks to WASAPI. Everywhere, [`Host::with_backend`] accepts any
//!   [`AudioBackend`](traits::AudioBackend), such as the in-process
//!   [`SimulatedBackend`](host::simulated::SimulatedBackend).
//! - A device is addressed by its [`DeviceIndex`] in the host's table.
//! - A [`Stream`] is an open flow of audio in one or both directions. It is driven either by
//!   callbacks ([`StreamMode::Callback`]) or by the caller's own [`Stream::read`] and
//!   [`Stream::write`] calls ([`StreamMode::Blocking`]).
//!
//! ```no_run
//! use wasapi_engine::{
//!     Callbacks, Host, SampleFormat, SampleRate, StreamConfig, StreamMode, StreamParameters,
//! };
//!
//! let host = Host::new()?;
//! let device = host.default_output_device().expect("no output device available");
//! let params = StreamParameters::new(device, 2, SampleFormat::F32);
//! let config = StreamConfig::output(params, SampleRate(48_000));
//!
//! let callbacks = Callbacks::new().on_output(|data: &mut [f32], _info| {
//!     for sample in data.iter_mut() {
//!         *sample = 0.0;
//!     }
//! });
//! let stream = host.open_stream(config, StreamMode::Callback(callbacks))?;
//! stream.start()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Streams default to shared mode with event-driven delivery. [`WasapiOptions`] selects exclusive
//! mode, forces the polling engine, overrides the speaker mask or the thread priority, and can
//! hand raw hardware buffers to the callbacks instead of converted `f32` samples.
//!
//! The delivery thread is elevated to a real-time scheduling category while it runs. Threads that
//! perform their own blocking transfers can do the same with [`boost_current_thread`].

use std::fmt;
use std::time::Duration;

pub use device_description::{DataFlow, DeviceInfo, DeviceState, FormFactor};
pub use error::*;
pub use format::{
    ChannelMask, FormatRequest, NegotiatedFormat, SampleEncoding, WaveFormat, MAX_CHANNELS,
};
pub use host::Host;
pub use priority::{boost_current_thread, PriorityBoost, ThreadPriority};
pub use registry::DeviceDescriptor;
pub use samples_formats::SampleFormat;
pub use stream::{
    Callbacks, InputCallbackInfo, OutputCallbackInfo, Stream, StreamInfo, StreamMode, StreamState,
    SubStreamInfo,
};

mod blocking;
mod build;
mod convert;
mod device_description;
mod engine;
mod error;
pub mod format;
pub mod host;
mod negotiate;
pub mod priority;
mod registry;
mod samples_formats;
pub mod signal;
mod stream;
pub mod timing;
pub mod traits;

/// Number of channels.
pub type ChannelCount = u16;

/// The number of samples processed per second for a single channel of audio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleRate(pub u32);

/// A number of frames. One frame holds one sample per channel.
pub type FrameCount = u32;

/// Position of a device in the host's device table.
pub type DeviceIndex = usize;

/// One side of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    /// The endpoint data flow that serves this direction.
    pub fn data_flow(self) -> DataFlow {
        match self {
            Direction::Input => DataFlow::Capture,
            Direction::Output => DataFlow::Render,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Whether a stream owns the device or goes through the system mixer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ShareMode {
    #[default]
    Shared,
    Exclusive,
}

/// How the delivery thread learns that the hardware wants a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// The hardware signals an event for every buffer.
    #[default]
    Event,
    /// The thread wakes on a fixed interval and checks the buffer state.
    Poll,
}

/// Host-specific options of one stream direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WasapiOptions {
    /// Open the device in exclusive mode.
    pub exclusive: bool,
    /// Deliver raw hardware buffers to the raw callbacks instead of converted `f32` samples.
    pub redirect_raw_processor: bool,
    /// Overrides the speaker layout implied by the channel count.
    pub channel_mask: Option<ChannelMask>,
    /// Use the polling engine even where event-driven delivery is available.
    pub force_polling: bool,
    /// Overrides the default scheduling category of the delivery thread.
    pub thread_priority: Option<ThreadPriority>,
}

impl WasapiOptions {
    pub fn share_mode(&self) -> ShareMode {
        if self.exclusive {
            ShareMode::Exclusive
        } else {
            ShareMode::Shared
        }
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.force_polling {
            DeliveryMode::Poll
        } else {
            DeliveryMode::Event
        }
    }
}

/// Parameters of one direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParameters {
    pub device: DeviceIndex,
    pub channels: ChannelCount,
    pub sample_format: SampleFormat,
    /// Latency the caller is prepared to accept on top of the buffer size.
    pub suggested_latency: Duration,
    pub options: WasapiOptions,
}

impl StreamParameters {
    pub fn new(device: DeviceIndex, channels: ChannelCount, sample_format: SampleFormat) -> Self {
        StreamParameters {
            device,
            channels,
            sample_format,
            suggested_latency: Duration::ZERO,
            options: WasapiOptions::default(),
        }
    }

    pub fn with_latency(mut self, suggested_latency: Duration) -> Self {
        self.suggested_latency = suggested_latency;
        self
    }

    pub fn with_options(mut self, options: WasapiOptions) -> Self {
        self.options = options;
        self
    }

    /// The format request this direction hands to the negotiator.
    pub fn format_request(&self, sample_rate: SampleRate) -> FormatRequest {
        FormatRequest {
            channels: self.channels,
            sample_rate,
            sample_format: self.sample_format,
            channel_mask: self.options.channel_mask,
        }
    }
}

/// The set of parameters used to describe how to open a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub input: Option<StreamParameters>,
    pub output: Option<StreamParameters>,
    pub sample_rate: SampleRate,
    /// Frames the caller wants per buffer. `None` lets the device period decide.
    pub frames_per_buffer: Option<FrameCount>,
}

impl StreamConfig {
    pub fn input(params: StreamParameters, sample_rate: SampleRate) -> Self {
        StreamConfig {
            input: Some(params),
            output: None,
            sample_rate,
            frames_per_buffer: None,
        }
    }

    pub fn output(params: StreamParameters, sample_rate: SampleRate) -> Self {
        StreamConfig {
            input: None,
            output: Some(params),
            sample_rate,
            frames_per_buffer: None,
        }
    }

    pub fn duplex(
        input: StreamParameters,
        output: StreamParameters,
        sample_rate: SampleRate,
    ) -> Self {
        StreamConfig {
            input: Some(input),
            output: Some(output),
            sample_rate,
            frames_per_buffer: None,
        }
    }

    pub fn with_frames_per_buffer(mut self, frames: FrameCount) -> Self {
        self.frames_per_buffer = Some(frames);
        self
    }

    pub fn is_full_duplex(&self) -> bool {
        self.input.is_some() && self.output.is_some()
    }

    /// The parameters of `direction`, if configured.
    pub fn parameters(&self, direction: Direction) -> Option<&StreamParameters> {
        match direction {
            Direction::Input => self.input.as_ref(),
            Direction::Output => self.output.as_ref(),
        }
    }

    /// The thread priority the delivery thread runs at.
    ///
    /// An explicit choice on either direction wins. Otherwise exclusive streams get `ProAudio`
    /// and shared streams get `Audio`.
    pub fn thread_priority(&self) -> ThreadPriority {
        let directions = || self.input.iter().chain(self.output.iter());
        directions()
            .filter_map(|p| p.options.thread_priority)
            .find(|p| *p != ThreadPriority::None)
            .unwrap_or_else(|| {
                ThreadPriority::default_for(directions().any(|p| p.options.exclusive))
            })
    }
}
