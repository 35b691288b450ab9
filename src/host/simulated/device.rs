use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::client::SimulatedClient;
use crate::timing::ReferenceTime;
use crate::traits::{AudioClient, ClientInit, DevicePeriod, Endpoint};
use crate::{
    BackendSpecificError, ClientError, DataFlow, DeviceState, FormFactor, FrameCount,
    SampleRate, WaveFormat,
};

/// Failures a simulated device produces on purpose.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Faults {
    /// Every initialize fails as if another process held the device exclusively.
    pub busy: bool,
    /// The period probe fails, so enumeration skips the device.
    pub probe_fails: bool,
    /// Starting a client fails.
    pub start_fails: bool,
    /// This many exclusive initializations report a misaligned buffer, even an aligned one.
    pub unaligned_inits: u32,
    /// Buffers longer than this fail to allocate.
    pub out_of_memory_above: Option<ReferenceTime>,
    /// Buffers longer than this are refused as a bad buffer size.
    pub buffer_size_error_above: Option<ReferenceTime>,
    /// The hardware clock never ticks: no buffer is consumed, captured or signaled.
    pub stall: bool,
    /// This many render buffer requests are refused as too large.
    pub too_large_render: u32,
    /// The clock runs but nothing is captured.
    pub capture_starved: bool,
}

/// Describes one simulated endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSpec {
    pub id: String,
    pub name: String,
    pub flow: DataFlow,
    pub form_factor: FormFactor,
    pub state: DeviceState,
    /// The shared-mode mix format, also reported as the device's default format.
    pub mix_format: WaveFormat,
    pub default_period: ReferenceTime,
    pub minimum_period: ReferenceTime,
    pub stream_latency: ReferenceTime,
    /// Formats shared mode accepts besides the mix format.
    pub shared_formats: Vec<WaveFormat>,
    /// Formats exclusive mode accepts. Empty accepts any convertible format of up to eight
    /// channels between 8 kHz and 192 kHz.
    pub exclusive_formats: Vec<WaveFormat>,
    /// Whether shared mode answers an unsupported format with the mix format.
    pub suggest_mix_format: bool,
    /// Level of every captured sample.
    pub capture_level: f32,
    pub is_default: bool,
    pub faults: Faults,
}

impl DeviceSpec {
    fn new(id: &str, name: &str, flow: DataFlow, form_factor: FormFactor) -> Self {
        DeviceSpec {
            id: id.to_owned(),
            name: name.to_owned(),
            flow,
            form_factor,
            state: DeviceState::Active,
            mix_format: WaveFormat::new(2, SampleRate(48_000), crate::SampleFormat::F32, None),
            default_period: ReferenceTime::from_millis(10),
            minimum_period: ReferenceTime::from_millis(3),
            stream_latency: ReferenceTime::from_millis(1),
            shared_formats: Vec::new(),
            exclusive_formats: Vec::new(),
            suggest_mix_format: true,
            capture_level: 0.25,
            is_default: false,
            faults: Faults::default(),
        }
    }

    /// A stereo 48 kHz float render endpoint.
    pub fn render(id: &str, name: &str) -> Self {
        DeviceSpec::new(id, name, DataFlow::Render, FormFactor::Speakers)
    }

    /// A stereo 48 kHz float capture endpoint.
    pub fn capture(id: &str, name: &str) -> Self {
        DeviceSpec::new(id, name, DataFlow::Capture, FormFactor::Microphone)
    }

    /// Makes this the system default endpoint of its flow.
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn with_mix_format(mut self, format: WaveFormat) -> Self {
        self.mix_format = format;
        self
    }

    pub fn with_periods(mut self, default: ReferenceTime, minimum: ReferenceTime) -> Self {
        self.default_period = default;
        self.minimum_period = minimum;
        self
    }

    pub(crate) fn period(&self) -> DevicePeriod {
        DevicePeriod {
            default: self.default_period,
            minimum: self.minimum_period,
        }
    }

    pub(crate) fn accepts_exclusive(&self, format: &WaveFormat) -> bool {
        if !self.exclusive_formats.is_empty() {
            return self.exclusive_formats.iter().any(|f| f.same_layout(format));
        }
        format.sample_format().is_some()
            && (1..=8).contains(&format.channels)
            && (8_000..=192_000).contains(&format.sample_rate.0)
    }

    pub(crate) fn accepts_shared(&self, format: &WaveFormat) -> bool {
        self.mix_format.same_layout(format)
            || self.shared_formats.iter().any(|f| f.same_layout(format))
    }
}

/// One initialize call and how it ended.
#[derive(Clone, Debug, PartialEq)]
pub struct InitRecord {
    pub init: ClientInit,
    pub format: WaveFormat,
    pub result: Result<(), ClientError>,
}

/// One committed render buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transfer {
    pub frames: FrameCount,
    pub at: Instant,
    /// Largest absolute sample value in the buffer, zero for silence.
    pub peak: f32,
}

/// What the engine did to a simulated device.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceStats {
    pub activations: u32,
    pub initializations: Vec<InitRecord>,
    pub render_transfers: Vec<Transfer>,
    pub capture_packets: u32,
    pub starts: u32,
    pub stops: u32,
}

pub(crate) struct SimulatedDevice {
    pub(crate) spec: DeviceSpec,
    stats: Mutex<DeviceStats>,
    unaligned_left: AtomicU32,
    too_large_left: AtomicU32,
    removed: AtomicBool,
}

impl SimulatedDevice {
    pub(crate) fn new(spec: DeviceSpec) -> Self {
        SimulatedDevice {
            unaligned_left: AtomicU32::new(spec.faults.unaligned_inits),
            too_large_left: AtomicU32::new(spec.faults.too_large_render),
            stats: Mutex::new(DeviceStats::default()),
            removed: AtomicBool::new(false),
            spec,
        }
    }

    pub(crate) fn stats(&self) -> MutexGuard<'_, DeviceStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn take_unaligned(&self) -> bool {
        Self::take_one(&self.unaligned_left)
    }

    pub(crate) fn take_too_large(&self) -> bool {
        Self::take_one(&self.too_large_left)
    }

    pub(crate) fn remove(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Fails every call on a client of a removed device, the way an unplugged endpoint does.
    pub(crate) fn present(&self) -> Result<(), ClientError> {
        if self.removed.load(Ordering::Acquire) {
            Err(ClientError::DeviceInvalidated)
        } else {
            Ok(())
        }
    }
}

pub(crate) struct SimulatedEndpoint(pub(crate) Arc<SimulatedDevice>);

impl Endpoint for SimulatedEndpoint {
    fn id(&self) -> Result<String, BackendSpecificError> {
        Ok(self.0.spec.id.clone())
    }

    fn friendly_name(&self) -> Result<String, BackendSpecificError> {
        Ok(self.0.spec.name.clone())
    }

    fn state(&self) -> DeviceState {
        self.0.spec.state
    }

    fn data_flow(&self) -> Result<DataFlow, BackendSpecificError> {
        Ok(self.0.spec.flow)
    }

    fn form_factor(&self) -> FormFactor {
        self.0.spec.form_factor
    }

    fn default_format(&self) -> Result<WaveFormat, ClientError> {
        Ok(self.0.spec.mix_format)
    }

    fn device_period(&self) -> Result<DevicePeriod, ClientError> {
        if self.0.spec.faults.probe_fails {
            return Err(BackendSpecificError::new("simulated probe failure").into());
        }
        Ok(self.0.spec.period())
    }

    fn activate(&self) -> Result<Box<dyn AudioClient>, ClientError> {
        if self.0.spec.state != DeviceState::Active {
            return Err(ClientError::DeviceInvalidated);
        }
        self.0.present()?;
        self.0.stats().activations += 1;
        Ok(Box::new(SimulatedClient::new(self.0.clone())))
    }
}
