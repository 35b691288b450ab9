use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::device::{InitRecord, SimulatedDevice, Transfer};
use crate::convert::{f32_to_wire, wire_to_f32};
use crate::signal::Event;
use crate::timing::{align_frames, is_packet_aligned, Alignment, ReferenceTime};
use crate::traits::{
    AudioClient, BufferFlags, CaptureClient, ClientInit, FormatSupport, RawCapture, RenderClient,
};
use crate::{BackendSpecificError, ClientError, DataFlow, FrameCount, ShareMode, WaveFormat};

struct Packet {
    data: Vec<u8>,
    frames: FrameCount,
    flags: BufferFlags,
}

/// The buffer state a client shares with its services and its clock.
struct Hardware {
    format: WaveFormat,
    buffer_frames: FrameCount,
    /// Frames the clock consumes or produces per tick.
    tick_frames: FrameCount,
    tick: Duration,
    /// Unplayed render frames.
    padding: FrameCount,
    captured: VecDeque<Packet>,
    /// One tick of captured audio at the device's capture level.
    capture_template: Vec<u8>,
}

impl Hardware {
    fn queued_capture_frames(&self) -> FrameCount {
        self.captured.iter().map(|packet| packet.frames).sum()
    }
}

type SharedHardware = Arc<Mutex<Hardware>>;

fn lock(hw: &SharedHardware) -> MutexGuard<'_, Hardware> {
    hw.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The virtual hardware clock of a started client.
struct Clock {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Clock {
    fn start(
        device: Arc<SimulatedDevice>,
        hw: SharedHardware,
        event: Option<Event>,
    ) -> Result<Clock, ClientError> {
        let (stop, ticks) = mpsc::channel::<()>();
        let tick = lock(&hw).tick;
        let thread = thread::Builder::new()
            .name(format!("simulated-clock-{}", device.spec.id))
            .spawn(move || loop {
                match ticks.recv_timeout(tick) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
                if device.spec.faults.stall {
                    continue;
                }
                // A removed device keeps signaling so the engine notices on its next call.
                if device.present().is_ok() {
                    advance(&device, &hw);
                }
                if let Some(event) = &event {
                    let _ = event.set();
                }
            })
            .map_err(|err| {
                BackendSpecificError::new(format!("failed to start the simulated clock: {err}"))
            })?;
        Ok(Clock {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// One tick of the device: plays a period of render data or captures one.
fn advance(device: &SimulatedDevice, hw: &SharedHardware) {
    let mut hw = lock(hw);
    match device.spec.flow {
        DataFlow::Render => {
            hw.padding = hw.padding.saturating_sub(hw.tick_frames);
        }
        DataFlow::Capture => {
            if device.spec.faults.capture_starved {
                return;
            }
            let mut flags = BufferFlags::NONE;
            // The capture queue holds two buffers. An overrun drops the oldest packet.
            while hw.queued_capture_frames() + hw.tick_frames > hw.buffer_frames * 2 {
                if hw.captured.pop_front().is_none() {
                    break;
                }
                flags = BufferFlags::DATA_DISCONTINUITY;
            }
            let packet = Packet {
                data: hw.capture_template.clone(),
                frames: hw.tick_frames,
                flags,
            };
            hw.captured.push_back(packet);
            drop(hw);
            device.stats().capture_packets += 1;
        }
    }
}

/// A simulated audio client.
pub(crate) struct SimulatedClient {
    device: Arc<SimulatedDevice>,
    hw: Option<SharedHardware>,
    event_driven: bool,
    event: Option<Event>,
    /// Frame count reported after a misaligned initialize.
    aligned_hint: Option<FrameCount>,
    clock: Option<Clock>,
}

impl SimulatedClient {
    pub(crate) fn new(device: Arc<SimulatedDevice>) -> Self {
        SimulatedClient {
            device,
            hw: None,
            event_driven: false,
            event: None,
            aligned_hint: None,
            clock: None,
        }
    }

    fn hardware(&self) -> Result<&SharedHardware, ClientError> {
        self.hw.as_ref().ok_or(ClientError::NotInitialized)
    }

    fn try_initialize(
        &mut self,
        init: &ClientInit,
        format: &WaveFormat,
    ) -> Result<(), ClientError> {
        let spec = &self.device.spec;
        if self.hw.is_some() {
            return Err(ClientError::AlreadyInitialized);
        }
        if spec.faults.busy {
            return Err(ClientError::DeviceInUse);
        }
        let supported = match init.share_mode {
            ShareMode::Shared => spec.accepts_shared(format),
            ShareMode::Exclusive => spec.accepts_exclusive(format),
        };
        if !supported {
            return Err(ClientError::UnsupportedFormat);
        }
        if matches!(spec.faults.out_of_memory_above, Some(limit) if init.buffer_duration > limit) {
            return Err(ClientError::OutOfMemory);
        }
        if matches!(spec.faults.buffer_size_error_above, Some(limit) if init.buffer_duration > limit)
        {
            return Err(ClientError::BufferSizeError);
        }

        let rate = format.sample_rate;
        let requested = init.buffer_duration.to_frames(rate);
        let (buffer_frames, tick) = match init.share_mode {
            ShareMode::Exclusive => {
                if init.buffer_duration < spec.minimum_period {
                    return Err(ClientError::BufferSizeError);
                }
                let block_align = format.block_align();
                let aligned = is_packet_aligned(requested, block_align);
                if !aligned || self.device.take_unaligned() {
                    let next = if aligned { requested + 1 } else { requested };
                    self.aligned_hint = Some(align_frames(next, block_align, Alignment::Forward));
                    return Err(ClientError::BufferSizeNotAligned);
                }
                let period = if init.periodicity > ReferenceTime::ZERO {
                    init.periodicity
                } else {
                    init.buffer_duration
                };
                (requested, period)
            }
            ShareMode::Shared => {
                let default_frames = spec.default_period.to_frames(rate);
                (requested.max(default_frames), spec.default_period)
            }
        };
        let tick_frames = tick.to_frames(rate).clamp(1, buffer_frames.max(1));

        let mut capture_template = vec![0u8; format.frames_to_bytes(tick_frames)];
        if let Some(sample_format) = format.sample_format() {
            let samples =
                vec![spec.capture_level; tick_frames as usize * usize::from(format.channels)];
            f32_to_wire(sample_format, &samples, &mut capture_template);
        }

        self.event_driven = init.event_driven;
        self.aligned_hint = None;
        self.hw = Some(Arc::new(Mutex::new(Hardware {
            format: *format,
            buffer_frames,
            tick_frames,
            tick: tick.as_duration().max(Duration::from_millis(1)),
            padding: 0,
            captured: VecDeque::new(),
            capture_template,
        })));
        Ok(())
    }

    fn stop_clock(&mut self) -> bool {
        self.clock.take().is_some()
    }
}

impl AudioClient for SimulatedClient {
    fn is_format_supported(
        &self,
        share_mode: ShareMode,
        format: &WaveFormat,
    ) -> Result<FormatSupport, ClientError> {
        let spec = &self.device.spec;
        Ok(match share_mode {
            ShareMode::Exclusive if spec.accepts_exclusive(format) => FormatSupport::Exact,
            ShareMode::Exclusive => FormatSupport::Unsupported,
            ShareMode::Shared if spec.accepts_shared(format) => FormatSupport::Exact,
            ShareMode::Shared if spec.suggest_mix_format => FormatSupport::Closest(spec.mix_format),
            ShareMode::Shared => FormatSupport::Unsupported,
        })
    }

    fn mix_format(&self) -> Result<WaveFormat, ClientError> {
        Ok(self.device.spec.mix_format)
    }

    fn initialize(&mut self, init: &ClientInit, format: &WaveFormat) -> Result<(), ClientError> {
        let result = self.try_initialize(init, format);
        self.device.stats().initializations.push(InitRecord {
            init: *init,
            format: *format,
            result: result.clone(),
        });
        result
    }

    fn buffer_size(&self) -> Result<FrameCount, ClientError> {
        if let Some(hint) = self.aligned_hint {
            return Ok(hint);
        }
        Ok(lock(self.hardware()?).buffer_frames)
    }

    fn stream_latency(&self) -> Result<ReferenceTime, ClientError> {
        self.hardware()?;
        Ok(self.device.spec.stream_latency)
    }

    fn set_event_handle(&mut self, event: &Event) -> Result<(), ClientError> {
        self.hardware()?;
        if !self.event_driven {
            return Err(BackendSpecificError::new("client was not initialized event driven").into());
        }
        self.event = Some(event.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<(), ClientError> {
        self.device.present()?;
        let hw = self.hardware()?.clone();
        if self.clock.is_some() {
            return Ok(());
        }
        if self.event_driven && self.event.is_none() {
            return Err(BackendSpecificError::new("no event handle was set").into());
        }
        if self.device.spec.faults.start_fails {
            return Err(BackendSpecificError::new("simulated start failure").into());
        }
        self.clock = Some(Clock::start(self.device.clone(), hw, self.event.clone())?);
        self.device.stats().starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ClientError> {
        self.hardware()?;
        if self.stop_clock() {
            self.device.stats().stops += 1;
        }
        Ok(())
    }

    fn current_padding(&self) -> Result<FrameCount, ClientError> {
        self.device.present()?;
        let hw = lock(self.hardware()?);
        Ok(match self.device.spec.flow {
            DataFlow::Render => hw.padding,
            DataFlow::Capture => hw.queued_capture_frames(),
        })
    }

    fn capture_service(&mut self) -> Result<Box<dyn CaptureClient>, ClientError> {
        let hw = self.hardware()?.clone();
        if self.device.spec.flow != DataFlow::Capture {
            return Err(ClientError::WrongEndpointType);
        }
        Ok(Box::new(SimulatedCapture {
            hw,
            device: self.device.clone(),
            held: None,
        }))
    }

    fn render_service(&mut self) -> Result<Box<dyn RenderClient>, ClientError> {
        let hw = self.hardware()?.clone();
        if self.device.spec.flow != DataFlow::Render {
            return Err(ClientError::WrongEndpointType);
        }
        Ok(Box::new(SimulatedRender {
            hw,
            device: self.device.clone(),
            scratch: Vec::new(),
            decoded: Vec::new(),
            pending: None,
        }))
    }
}

struct SimulatedCapture {
    hw: SharedHardware,
    device: Arc<SimulatedDevice>,
    /// The packet handed out and not yet released.
    held: Option<Packet>,
}

// The held packet's storage is not touched until `release_buffer`.
unsafe impl CaptureClient for SimulatedCapture {
    fn get_buffer(&mut self) -> Result<Option<RawCapture>, ClientError> {
        self.device.present()?;
        if self.held.is_some() {
            return Err(BackendSpecificError::new("previous capture packet not released").into());
        }
        let Some(packet) = lock(&self.hw).captured.pop_front() else {
            return Ok(None);
        };
        let raw = RawCapture {
            data: packet.data.as_ptr(),
            frames: packet.frames,
            flags: packet.flags,
        };
        self.held = Some(packet);
        Ok(Some(raw))
    }

    fn release_buffer(&mut self, frames: FrameCount) -> Result<(), ClientError> {
        match self.held.take() {
            Some(packet) if frames == 0 || frames == packet.frames => Ok(()),
            Some(_) => Err(BackendSpecificError::new("partial capture release").into()),
            None => Err(BackendSpecificError::new("no capture packet to release").into()),
        }
    }
}

struct SimulatedRender {
    hw: SharedHardware,
    device: Arc<SimulatedDevice>,
    scratch: Vec<u8>,
    decoded: Vec<f32>,
    /// Frames handed out and not yet released.
    pending: Option<FrameCount>,
}

impl SimulatedRender {
    fn peak(&mut self, format: &WaveFormat, frames: FrameCount) -> f32 {
        let Some(sample_format) = format.sample_format() else {
            return 0.0;
        };
        self.decoded.clear();
        self.decoded
            .resize(frames as usize * usize::from(format.channels), 0.0);
        wire_to_f32(sample_format, &self.scratch, &mut self.decoded);
        self.decoded.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }
}

// The scratch buffer is not resized until the matching `release_buffer`.
unsafe impl RenderClient for SimulatedRender {
    fn get_buffer(&mut self, frames: FrameCount) -> Result<*mut u8, ClientError> {
        self.device.present()?;
        if self.pending.is_some() {
            return Err(BackendSpecificError::new("previous render buffer not released").into());
        }
        if self.device.take_too_large() {
            return Err(ClientError::BufferTooLarge);
        }
        let bytes = {
            let hw = lock(&self.hw);
            if hw.padding + frames > hw.buffer_frames {
                return Err(ClientError::BufferTooLarge);
            }
            hw.format.frames_to_bytes(frames)
        };
        self.scratch.clear();
        self.scratch.resize(bytes, 0);
        self.pending = Some(frames);
        Ok(self.scratch.as_mut_ptr())
    }

    fn release_buffer(&mut self, frames: FrameCount, flags: BufferFlags) -> Result<(), ClientError> {
        let Some(requested) = self.pending.take() else {
            return Err(BackendSpecificError::new("no render buffer to release").into());
        };
        if frames > requested {
            return Err(BackendSpecificError::new("released more frames than acquired").into());
        }
        let format = {
            let mut hw = lock(&self.hw);
            hw.padding += frames;
            hw.format
        };
        let peak = if flags.contains(BufferFlags::SILENT) {
            0.0
        } else {
            self.peak(&format, frames)
        };
        self.device.stats().render_transfers.push(Transfer {
            frames,
            at: Instant::now(),
            peak,
        });
        Ok(())
    }
}
