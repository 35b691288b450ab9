//! Building the hardware side of a stream.
//!
//! One [`SubStream`] per direction: negotiate a format, size the period, initialize the client
//! (recovering from the few initialization failures the hardware is known to produce), and read
//! back what the hardware actually allocated.

use std::thread;
use std::time::{Duration, Instant};

use crate::negotiate::negotiate;
use crate::registry::{DeviceDescriptor, DeviceRegistry};
use crate::signal::Event;
use crate::timing::{align_frames, frames_to_duration, Alignment, ReferenceTime};
use crate::traits::{AudioClient, CaptureClient, ClientInit, DevicePeriod, RenderClient};
use crate::{
    BuildStreamError, ClientError, DeliveryMode, Direction, FormatRequest, FrameCount,
    NegotiatedFormat, SampleRate, ShareMode, StreamConfig, StreamParameters, SubStreamInfo,
    ThreadPriority, MAX_CHANNELS,
};

/// Longest buffer an exclusive event-driven client accepts.
const MAX_EVENT_BUFFER: ReferenceTime = ReferenceTime::from_millis(500);

/// Longest buffer an exclusive polled client accepts.
const MAX_POLL_BUFFER: ReferenceTime = ReferenceTime::from_millis(2000);

/// Step and floor of the out-of-memory recovery.
const OUT_OF_MEMORY_STEP: ReferenceTime = ReferenceTime::from_millis(100);

/// The service half of an initialized client.
pub(crate) enum Service {
    Capture(Box<dyn CaptureClient>),
    Render(Box<dyn RenderClient>),
}

/// One direction of an open stream.
pub(crate) struct SubStream {
    pub(crate) direction: Direction,
    pub(crate) service: Service,
    pub(crate) client: Box<dyn AudioClient>,
    /// Buffer-ready event, present only for event-driven delivery.
    pub(crate) event: Option<Event>,
    pub(crate) format: NegotiatedFormat,
    /// Capacity of the hardware buffer as allocated, not as requested.
    pub(crate) buffer_frames: FrameCount,
    pub(crate) frames_per_cycle: FrameCount,
    pub(crate) period: ReferenceTime,
    pub(crate) device_latency: ReferenceTime,
    pub(crate) latency: Duration,
    pub(crate) share_mode: ShareMode,
    pub(crate) delivery: DeliveryMode,
    pub(crate) params: StreamParameters,
}

impl SubStream {
    pub(crate) fn sample_rate(&self) -> SampleRate {
        self.format.sample_rate
    }

    pub(crate) fn bytes_per_frame(&self) -> usize {
        self.format.bytes_per_frame()
    }

    /// Playback duration of the whole hardware buffer.
    pub(crate) fn buffer_duration(&self) -> Duration {
        frames_to_duration(self.buffer_frames, self.sample_rate())
    }

    /// Waits for queued output to play, at most one buffer duration.
    pub(crate) fn drain_playback(&self) {
        let deadline = Instant::now() + self.buffer_duration();
        while Instant::now() < deadline {
            match self.client.current_padding() {
                Ok(0) | Err(_) => return,
                Ok(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
        log::debug!("output drain timed out, stopping with queued frames");
    }

    pub(crate) fn info(&self) -> SubStreamInfo {
        SubStreamInfo {
            format: self.format,
            buffer_frames: self.buffer_frames,
            frames_per_cycle: self.frames_per_cycle,
            period: self.period,
            device_latency: self.device_latency,
            latency: self.latency,
            share_mode: self.share_mode,
            delivery: self.delivery,
        }
    }
}

/// What one direction asks of the builder.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DirectionRequest {
    pub(crate) direction: Direction,
    pub(crate) format: FormatRequest,
    pub(crate) share_mode: ShareMode,
    pub(crate) delivery: DeliveryMode,
    pub(crate) latency_hint: Duration,
    pub(crate) frames_per_buffer: Option<FrameCount>,
    pub(crate) full_duplex: bool,
    /// Buffer frames of the input side, for the output side of a full-duplex stream.
    pub(crate) input_frames: Option<FrameCount>,
}

/// The sizing decision for one initialize attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PeriodPlan {
    pub(crate) frames: FrameCount,
    pub(crate) period: ReferenceTime,
}

struct Sizing {
    share_mode: ShareMode,
    delivery: DeliveryMode,
    rate: SampleRate,
    block_align: u16,
    device: DevicePeriod,
}

impl Sizing {
    fn align(&self, frames: FrameCount, alignment: Alignment) -> FrameCount {
        match self.share_mode {
            ShareMode::Exclusive => align_frames(frames, self.block_align, alignment),
            ShareMode::Shared => frames,
        }
    }

    fn plan(&self, frames: FrameCount, alignment: Alignment) -> PeriodPlan {
        let frames = self.align(frames, alignment);
        PeriodPlan {
            frames,
            period: ReferenceTime::from_frames(frames, self.rate),
        }
    }

    fn plan_for(&self, period: ReferenceTime, alignment: Alignment) -> PeriodPlan {
        self.plan(period.to_frames(self.rate), alignment)
    }

    /// Applies the device limits to a requested frame count.
    fn limit(&self, frames: FrameCount) -> PeriodPlan {
        let mut plan = self.plan(frames, Alignment::Backward);
        match self.share_mode {
            ShareMode::Shared => {
                if plan.period < self.device.default {
                    plan = self.plan_for(self.device.default, Alignment::Backward);
                }
            }
            ShareMode::Exclusive => {
                if plan.period < self.device.minimum {
                    plan = self.plan_for(self.device.minimum, Alignment::Forward);
                }
                let max = match self.delivery {
                    DeliveryMode::Event => MAX_EVENT_BUFFER,
                    DeliveryMode::Poll => MAX_POLL_BUFFER,
                };
                if plan.period > max {
                    plan = self.plan_for(max, Alignment::Backward);
                }
            }
        }
        plan
    }

    fn client_init(&self, period: ReferenceTime) -> ClientInit {
        ClientInit {
            share_mode: self.share_mode,
            event_driven: self.delivery == DeliveryMode::Event,
            buffer_duration: period,
            periodicity: match self.share_mode {
                ShareMode::Exclusive => period,
                ShareMode::Shared => ReferenceTime::ZERO,
            },
        }
    }
}

/// The frame count a direction asks for before device limits are applied.
pub(crate) fn requested_frames(
    request: &DirectionRequest,
    rate: SampleRate,
    default_period: ReferenceTime,
) -> FrameCount {
    let default_frames = default_period.to_frames(rate);
    let base = request
        .frames_per_buffer
        .filter(|frames| *frames > 0)
        .unwrap_or(default_frames);
    let hint = ReferenceTime::from_duration(request.latency_hint).to_frames(rate);
    let mut frames = match request.delivery {
        DeliveryMode::Event => base.saturating_add(hint),
        DeliveryMode::Poll => base.saturating_add(base.max(hint)),
    };
    if let Some(input_frames) = request.input_frames {
        frames = input_frames;
    }
    if frames == 0 {
        frames = default_frames;
    }
    frames
}

fn activate(device: &DeviceDescriptor) -> Result<Box<dyn AudioClient>, BuildStreamError> {
    device.endpoint.activate().map_err(|err| {
        log::warn!("failed to activate {:?}: {err}", device.name());
        BuildStreamError::from(err)
    })
}

/// Builds one direction on `device`.
pub(crate) fn build_substream(
    device: &DeviceDescriptor,
    request: &DirectionRequest,
    params: StreamParameters,
) -> Result<SubStream, BuildStreamError> {
    let mut client = activate(device)?;
    let format = negotiate(&*client, &request.format, request.share_mode)?;
    let rate = format.sample_rate;
    let sizing = Sizing {
        share_mode: request.share_mode,
        delivery: request.delivery,
        rate,
        block_align: format.block_align(),
        device: device.period(),
    };

    let base_frames = request
        .frames_per_buffer
        .filter(|frames| *frames > 0)
        .unwrap_or_else(|| device.default_period().to_frames(rate));
    let mut plan = sizing.limit(requested_frames(request, rate, device.default_period()));
    log::debug!(
        "{} on {:?}: {} frames, period {:.2} ms",
        request.direction,
        device.name(),
        plan.frames,
        plan.period.as_secs_f64() * 1000.0
    );

    let mut result = client.initialize(&sizing.client_init(plan.period), &format);

    while result == Err(ClientError::OutOfMemory) && plan.period > OUT_OF_MEMORY_STEP {
        plan = sizing.plan_for(plan.period - OUT_OF_MEMORY_STEP, Alignment::Backward);
        log::debug!(
            "buffer allocation failed, retrying with {:.2} ms",
            plan.period.as_secs_f64() * 1000.0
        );
        client = activate(device)?;
        result = client.initialize(&sizing.client_init(plan.period), &format);
    }

    if result == Err(ClientError::BufferSizeError) {
        plan.period = device.default_period();
        log::debug!(
            "buffer duration refused, retrying with the default period of {:.2} ms",
            plan.period.as_secs_f64() * 1000.0
        );
        client = activate(device)?;
        result = client.initialize(&sizing.client_init(plan.period), &format);
    }

    match result {
        Ok(()) => {}
        Err(ClientError::BufferSizeNotAligned) => {
            let aligned = client.buffer_size()?;
            // The retry keeps the format negotiated above instead of negotiating again, so both
            // attempts describe the same wire layout.
            log::debug!("buffer not aligned, retrying with {aligned} frames and {format}");
            client = activate(device)?;
            plan = PeriodPlan {
                frames: aligned,
                period: ReferenceTime::from_frames(aligned, rate),
            };
            client
                .initialize(&sizing.client_init(plan.period), &format)
                .map_err(BuildStreamError::AlignmentRetryExhausted)?;
        }
        Err(err) => return Err(err.into()),
    }

    let buffer_frames = client.buffer_size()?;
    let device_latency = client.stream_latency()?;
    let latency = frames_to_duration(buffer_frames, rate) + device_latency.as_duration();

    let whole_buffer = request.delivery == DeliveryMode::Event
        && (request.share_mode == ShareMode::Exclusive || request.full_duplex);
    let frames_per_cycle = if whole_buffer {
        buffer_frames
    } else {
        base_frames.min(buffer_frames)
    }
    .max(1);

    let event = match request.delivery {
        DeliveryMode::Event => {
            let event = Event::new(false, false)?;
            client.set_event_handle(&event)?;
            Some(event)
        }
        DeliveryMode::Poll => None,
    };

    let service = match request.direction {
        Direction::Input => Service::Capture(client.capture_service()?),
        Direction::Output => Service::Render(client.render_service()?),
    };

    log::debug!(
        "{} ready: {} frames buffered, {} per cycle, latency {:.2} ms, {:?}/{:?}",
        request.direction,
        buffer_frames,
        frames_per_cycle,
        latency.as_secs_f64() * 1000.0,
        request.share_mode,
        request.delivery
    );

    Ok(SubStream {
        direction: request.direction,
        service,
        client,
        event,
        format,
        buffer_frames,
        frames_per_cycle,
        period: plan.period,
        device_latency,
        latency,
        share_mode: request.share_mode,
        delivery: request.delivery,
        params,
    })
}

/// Both directions of a stream, built and checked against each other.
pub(crate) struct BuiltStream {
    pub(crate) input: Option<SubStream>,
    pub(crate) output: Option<SubStream>,
    pub(crate) sample_rate: SampleRate,
    pub(crate) priority: ThreadPriority,
}

impl BuiltStream {
    pub(crate) fn delivery(&self) -> DeliveryMode {
        self.input
            .as_ref()
            .or(self.output.as_ref())
            .map(|sub| sub.delivery)
            .unwrap_or_default()
    }
}

/// Resolves and checks the device a direction is opened on.
pub(crate) fn device_for<'a>(
    registry: &'a DeviceRegistry,
    direction: Direction,
    params: &StreamParameters,
) -> Result<&'a DeviceDescriptor, BuildStreamError> {
    let device = registry.device(params.device).map_err(|_| {
        BuildStreamError::InvalidArgument(format!(
            "there is no device at index {}",
            params.device
        ))
    })?;
    if device.data_flow() != direction.data_flow() {
        return Err(BuildStreamError::InvalidArgument(format!(
            "device {} ({:?}) cannot be used for {direction}",
            params.device,
            device.name()
        )));
    }
    if params.channels == 0 {
        return Err(BuildStreamError::InvalidArgument(format!(
            "{direction} requests zero channels"
        )));
    }
    if params.channels > MAX_CHANNELS {
        return Err(BuildStreamError::InvalidArgument(format!(
            "{direction} requests {} channels, at most {MAX_CHANNELS} are supported",
            params.channels
        )));
    }
    Ok(device)
}

/// Checks a stream configuration without touching any device.
pub(crate) fn validate(config: &StreamConfig) -> Result<(), BuildStreamError> {
    if config.input.is_none() && config.output.is_none() {
        return Err(BuildStreamError::InvalidArgument(
            "a stream needs an input or an output".into(),
        ));
    }
    if config.sample_rate.0 == 0 {
        return Err(BuildStreamError::InvalidArgument(
            "the sample rate must not be zero".into(),
        ));
    }
    if let (Some(input), Some(output)) = (&config.input, &config.output) {
        if input.options.force_polling != output.options.force_polling {
            return Err(BuildStreamError::InvalidArgument(
                "polling must be forced on both directions or on neither".into(),
            ));
        }
    }
    Ok(())
}

fn direction_request(
    config: &StreamConfig,
    direction: Direction,
    params: &StreamParameters,
    input_frames: Option<FrameCount>,
    blocking: bool,
) -> DirectionRequest {
    DirectionRequest {
        direction,
        format: params.format_request(config.sample_rate),
        share_mode: params.options.share_mode(),
        // Blocking transfers pace themselves, nothing would wait on a buffer event.
        delivery: if blocking {
            DeliveryMode::Poll
        } else {
            params.options.delivery_mode()
        },
        latency_hint: params.suggested_latency,
        frames_per_buffer: config.frames_per_buffer,
        full_duplex: config.is_full_duplex(),
        input_frames,
    }
}

/// Builds every configured direction of `config`.
///
/// A direction built before a later failure is dropped, which releases its client, so a failed
/// open leaves nothing behind. Streams for blocking transfers are always polled.
pub(crate) fn build_stream(
    registry: &DeviceRegistry,
    config: &StreamConfig,
    blocking: bool,
) -> Result<BuiltStream, BuildStreamError> {
    validate(config)?;

    let input = match &config.input {
        Some(params) => {
            let device = device_for(registry, Direction::Input, params)?;
            let request = direction_request(config, Direction::Input, params, None, blocking);
            Some(build_substream(device, &request, *params)?)
        }
        None => None,
    };

    let output = match &config.output {
        Some(params) => {
            let device = device_for(registry, Direction::Output, params)?;
            let input_frames = input.as_ref().map(|sub| sub.buffer_frames);
            let request =
                direction_request(config, Direction::Output, params, input_frames, blocking);
            Some(build_substream(device, &request, *params)?)
        }
        None => None,
    };

    if let (Some(input), Some(output)) = (&input, &output) {
        let event_driven = input.delivery == DeliveryMode::Event;
        let same_period = input.period.to_frames(config.sample_rate)
            == output.period.to_frames(config.sample_rate);
        if event_driven && (!same_period || input.frames_per_cycle != output.frames_per_cycle) {
            log::warn!(
                "input and output cycles differ: {} frames / {:.2} ms vs {} frames / {:.2} ms",
                input.frames_per_cycle,
                input.period.as_secs_f64() * 1000.0,
                output.frames_per_cycle,
                output.period.as_secs_f64() * 1000.0
            );
            return Err(BuildStreamError::PeriodMismatch {
                input_frames: input.frames_per_cycle,
                output_frames: output.frames_per_cycle,
            });
        }
    }

    Ok(BuiltStream {
        input,
        output,
        sample_rate: config.sample_rate,
        priority: config.thread_priority(),
    })
}
