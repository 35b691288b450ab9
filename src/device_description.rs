use std::fmt;
use std::time::Duration;

use crate::{ChannelCount, SampleRate};

/// Which way audio flows through an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFlow {
    /// The endpoint plays audio (speakers, headphones, HDMI).
    Render,
    /// The endpoint records audio (microphones, line in).
    Capture,
}

/// Activity state of an endpoint at enumeration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceState {
    #[default]
    Active,
    Disabled,
    NotPresent,
    Unplugged,
}

/// Physical role of an endpoint, as reported by the endpoint's form-factor property.
///
/// The discriminants match the platform's `EndpointFormFactor` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FormFactor {
    /// Remote network device
    RemoteNetworkDevice = 0,

    /// Speakers (built-in or external)
    Speakers = 1,

    /// Line-level analog connection (line in/out)
    LineLevel = 2,

    /// Headphones (output only)
    Headphones = 3,

    /// Microphone (built-in or external)
    Microphone = 4,

    /// Headset (headphones + microphone)
    Headset = 5,

    /// Telephone-style handset
    Handset = 6,

    /// Digital passthrough of unknown type
    UnknownDigitalPassthrough = 7,

    /// S/PDIF digital interface
    Spdif = 8,

    /// HDMI or DisplayPort audio on a display
    DigitalAudioDisplayDevice = 9,

    /// Unknown or unclassified form factor
    #[default]
    Unknown = 10,
}

impl FormFactor {
    /// Maps the raw property value, treating out-of-range values as unknown.
    pub fn from_raw(value: u32) -> FormFactor {
        match value {
            0 => FormFactor::RemoteNetworkDevice,
            1 => FormFactor::Speakers,
            2 => FormFactor::LineLevel,
            3 => FormFactor::Headphones,
            4 => FormFactor::Microphone,
            5 => FormFactor::Headset,
            6 => FormFactor::Handset,
            7 => FormFactor::UnknownDigitalPassthrough,
            8 => FormFactor::Spdif,
            9 => FormFactor::DigitalAudioDisplayDevice,
            _ => FormFactor::Unknown,
        }
    }
}

impl fmt::Display for DataFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFlow::Render => write!(f, "Render"),
            DataFlow::Capture => write!(f, "Capture"),
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Active => write!(f, "Active"),
            DeviceState::Disabled => write!(f, "Disabled"),
            DeviceState::NotPresent => write!(f, "Not present"),
            DeviceState::Unplugged => write!(f, "Unplugged"),
        }
    }
}

impl fmt::Display for FormFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormFactor::RemoteNetworkDevice => write!(f, "Remote network device"),
            FormFactor::Speakers => write!(f, "Speakers"),
            FormFactor::LineLevel => write!(f, "Line level"),
            FormFactor::Headphones => write!(f, "Headphones"),
            FormFactor::Microphone => write!(f, "Microphone"),
            FormFactor::Headset => write!(f, "Headset"),
            FormFactor::Handset => write!(f, "Handset"),
            FormFactor::UnknownDigitalPassthrough => write!(f, "Digital passthrough"),
            FormFactor::Spdif => write!(f, "S/PDIF"),
            FormFactor::DigitalAudioDisplayDevice => write!(f, "HDMI"),
            FormFactor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Summary of an enumerated device, in the terms a stream opener cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Human-readable device name
    pub name: String,

    /// Stable endpoint identifier
    pub id: String,

    pub data_flow: DataFlow,

    pub form_factor: FormFactor,

    /// Channels of the device's default format
    pub max_channels: ChannelCount,

    /// Rate of the device's default format
    pub default_sample_rate: SampleRate,

    /// The minimum device period, the lowest latency an exclusive stream can ask for.
    pub default_low_latency: Duration,

    /// The default device period, the latency of a typical shared stream.
    pub default_high_latency: Duration,

    pub is_default: bool,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;

        if self.form_factor != FormFactor::Unknown {
            write!(f, " [{}]", self.form_factor)?;
        }

        write!(
            f,
            " {} ch @ {} Hz, {:.1}-{:.1} ms",
            self.max_channels,
            self.default_sample_rate.0,
            self.default_low_latency.as_secs_f64() * 1000.0,
            self.default_high_latency.as_secs_f64() * 1000.0,
        )?;

        if self.is_default {
            write!(f, " (default)")?;
        }

        Ok(())
    }
}
