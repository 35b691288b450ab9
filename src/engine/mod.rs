//! The delivery thread.
//!
//! A stream opened in callback mode owns one thread that runs a [`DeliveryEngine`]. The engine is
//! picked once when the stream is built: [`EventEngine`] blocks on the buffer-ready events the
//! hardware signals, [`PollEngine`] wakes on a fixed interval. Both exchange buffers through the
//! same [`EngineContext`] and share the start and teardown sequence in [`spawn`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::build::{Service, SubStream};
use crate::convert::{f32_to_wire, wire_to_f32};
use crate::priority::{boost_with, PriorityBoost};
use crate::signal::Event;
use crate::stream::{
    ErrorFn, FinishedFn, InputCallbackInfo, InputDataFn, OutputCallbackInfo, OutputDataFn,
    RawInputFn, RawOutputFn,
};
use crate::traits::{
    BufferFlags, CapturePacket, ElevationRequest, RealtimeScheduler, RenderPacket,
};
use crate::{
    BackendSpecificError, ClientError, FrameCount, SampleFormat, ShareMode, StreamError,
    ThreadPriority,
};

mod event;
mod poll;

pub(crate) use self::event::EventEngine;
pub(crate) use self::poll::PollEngine;

/// One of the two delivery models.
pub(crate) trait DeliveryEngine: Send {
    fn name(&self) -> &'static str;

    /// Exchanges buffers until shutdown is requested (`Ok`) or the stream faults (`Err`).
    fn run(&mut self, ctx: &mut EngineContext) -> Result<(), StreamError>;
}

/// State shared between a [`Stream`](crate::Stream) and its delivery thread.
pub(crate) struct StreamShared {
    running: AtomicBool,
    /// Manual reset. The only cancellation signal of a stream.
    pub(crate) shutdown: Event,
    /// Manual reset. Set by the delivery thread as its last action.
    pub(crate) finished: Event,
    /// Whether the thread should let queued output play out before stopping.
    drain: AtomicBool,
}

impl StreamShared {
    pub(crate) fn new() -> Result<StreamShared, BackendSpecificError> {
        Ok(StreamShared {
            running: AtomicBool::new(false),
            shutdown: Event::new(true, false)?,
            finished: Event::new(true, false)?,
            drain: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn request_drain(&self, drain: bool) {
        self.drain.store(drain, Ordering::Release);
    }

    fn drain_requested(&self) -> bool {
        self.drain.load(Ordering::Acquire)
    }

    /// Clears the signals of a previous run.
    pub(crate) fn rearm(&self) -> Result<(), BackendSpecificError> {
        self.shutdown.reset()?;
        self.finished.reset()?;
        self.request_drain(false);
        Ok(())
    }
}

/// Turns captured wire data into what the input callback expects.
pub(crate) enum InputProcessor {
    Adapter {
        callback: InputDataFn,
        sample_format: SampleFormat,
        scratch: Vec<f32>,
    },
    Raw(RawInputFn),
}

impl InputProcessor {
    fn process(&mut self, data: &[u8], frames: FrameCount, flags: BufferFlags, channels: usize) {
        let info = InputCallbackInfo::new(frames, flags);
        match self {
            InputProcessor::Adapter {
                callback,
                sample_format,
                scratch,
            } => {
                scratch.clear();
                scratch.resize(frames as usize * channels, 0.0);
                if !flags.contains(BufferFlags::SILENT) {
                    wire_to_f32(*sample_format, data, scratch);
                }
                callback(scratch.as_slice(), &info);
            }
            InputProcessor::Raw(callback) => callback(data, &info),
        }
    }
}

/// Produces wire data for the render buffer from the output callback.
pub(crate) enum OutputProcessor {
    Adapter {
        callback: OutputDataFn,
        sample_format: SampleFormat,
        scratch: Vec<f32>,
    },
    Raw(RawOutputFn),
}

impl OutputProcessor {
    fn process(&mut self, data: &mut [u8], frames: FrameCount, channels: usize) {
        let info = OutputCallbackInfo::new(frames);
        match self {
            OutputProcessor::Adapter {
                callback,
                sample_format,
                scratch,
            } => {
                scratch.clear();
                scratch.resize(frames as usize * channels, 0.0);
                callback(scratch.as_mut_slice(), &info);
                f32_to_wire(*sample_format, scratch, data);
            }
            OutputProcessor::Raw(callback) => callback(data, &info),
        }
    }
}

pub(crate) struct InputSide {
    pub(crate) sub: SubStream,
    pub(crate) processor: InputProcessor,
}

impl InputSide {
    /// Hands every queued capture packet to the processor.
    fn drain(&mut self, shutdown: &Event) -> Result<(), StreamError> {
        let bytes_per_frame = self.sub.bytes_per_frame();
        let channels = usize::from(self.sub.format.channels);
        let Service::Capture(capture) = &mut self.sub.service else {
            return Ok(());
        };
        while !shutdown.is_set() {
            let Some(packet) = CapturePacket::next(capture.as_mut(), bytes_per_frame)? else {
                break;
            };
            self.processor
                .process(packet.data(), packet.frames(), packet.flags(), channels);
            packet.release()?;
        }
        Ok(())
    }
}

pub(crate) struct OutputSide {
    pub(crate) sub: SubStream,
    pub(crate) processor: OutputProcessor,
}

impl OutputSide {
    /// Frames the next fill may queue.
    fn room(&self) -> Result<FrameCount, ClientError> {
        let sub = &self.sub;
        if sub.share_mode == ShareMode::Exclusive && sub.event.is_some() {
            // Exclusive event delivery swaps whole buffers, the padding says nothing about room.
            return Ok(sub.frames_per_cycle);
        }
        let padding = sub.client.current_padding()?;
        Ok(sub
            .buffer_frames
            .saturating_sub(padding)
            .min(sub.frames_per_cycle))
    }

    /// Queues one cycle of output and returns the frames written. A request the hardware turns
    /// down as too large is skipped until the next wake.
    fn fill(&mut self) -> Result<FrameCount, StreamError> {
        let frames = self.room()?;
        if frames == 0 {
            return Ok(0);
        }
        let bytes_per_frame = self.sub.bytes_per_frame();
        let channels = usize::from(self.sub.format.channels);
        let Service::Render(render) = &mut self.sub.service else {
            return Ok(0);
        };
        let mut packet = match RenderPacket::acquire(render.as_mut(), frames, bytes_per_frame) {
            Ok(packet) => packet,
            Err(ClientError::BufferTooLarge) => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        self.processor.process(packet.data_mut(), frames, channels);
        packet.commit()?;
        Ok(frames)
    }
}

/// Everything the delivery thread owns while it runs.
pub(crate) struct EngineContext {
    pub(crate) input: Option<InputSide>,
    pub(crate) output: Option<OutputSide>,
    pub(crate) error_callback: Option<ErrorFn>,
    pub(crate) finished_callback: Option<FinishedFn>,
    pub(crate) shared: Arc<StreamShared>,
    pub(crate) priority: ThreadPriority,
    pub(crate) scheduler: Arc<dyn RealtimeScheduler>,
}

impl EngineContext {
    fn subs_mut(&mut self) -> impl Iterator<Item = &mut SubStream> {
        let input = self.input.as_mut().map(|side| &mut side.sub);
        let output = self.output.as_mut().map(|side| &mut side.sub);
        input.into_iter().chain(output)
    }

    pub(crate) fn drain_input(&mut self) -> Result<(), StreamError> {
        match self.input.as_mut() {
            Some(input) => input.drain(&self.shared.shutdown),
            None => Ok(()),
        }
    }

    pub(crate) fn fill_output(&mut self) -> Result<FrameCount, StreamError> {
        match self.output.as_mut() {
            Some(output) => output.fill(),
            None => Ok(0),
        }
    }

    fn attach(&self) -> Result<(), StreamError> {
        let input = self.input.as_ref().map(|side| &side.sub);
        let output = self.output.as_ref().map(|side| &side.sub);
        for sub in input.into_iter().chain(output) {
            sub.client.attach_thread()?;
        }
        Ok(())
    }

    fn elevate(&self) -> Option<PriorityBoost> {
        let sub = self
            .output
            .as_ref()
            .map(|side| &side.sub)
            .or(self.input.as_ref().map(|side| &side.sub))?;
        let request = ElevationRequest {
            priority: self.priority,
            buffer_frames: sub.frames_per_cycle,
            sample_rate: sub.sample_rate(),
        };
        match boost_with(&self.scheduler, &request) {
            Ok(boost) => Some(boost),
            Err(err) => {
                log::warn!("running the delivery thread without {}: {err}", self.priority);
                None
            }
        }
    }

    /// Preloads one output cycle and starts the clients, input first.
    fn begin(&mut self) -> Result<(), StreamError> {
        self.fill_output()?;
        for sub in self.subs_mut() {
            sub.client.start()?;
        }
        Ok(())
    }

    fn stop_clients(&mut self) {
        for sub in self.subs_mut() {
            if let Err(err) = sub.client.stop() {
                log::warn!("failed to stop the {} client: {err}", sub.direction);
            }
        }
    }
}

/// The context and engine travel to the delivery thread and back, so a stopped stream can be
/// started again.
pub(crate) struct EngineParts {
    pub(crate) ctx: EngineContext,
    pub(crate) engine: Box<dyn DeliveryEngine>,
}

/// Starts the delivery thread. Exactly one message is sent on `ready`: `Ok` once both clients run,
/// or the error that kept them from running.
pub(crate) fn spawn(
    parts: EngineParts,
    ready: Sender<Result<(), StreamError>>,
) -> Result<JoinHandle<EngineParts>, StreamError> {
    let name = format!("wasapi-engine-{}", parts.engine.name());
    thread::Builder::new()
        .name(name)
        .spawn(move || run(parts, ready))
        .map_err(|err| {
            BackendSpecificError::new(format!("failed to spawn the delivery thread: {err}")).into()
        })
}

fn run(mut parts: EngineParts, ready: Sender<Result<(), StreamError>>) -> EngineParts {
    let EngineParts { ctx, engine } = &mut parts;

    if let Err(err) = ctx.attach() {
        finish(ctx, None);
        let _ = ready.send(Err(err));
        return parts;
    }
    let boost = ctx.elevate();

    if let Err(err) = ctx.begin() {
        log::error!("failed to start {} delivery: {err}", engine.name());
        ctx.stop_clients();
        finish(ctx, boost);
        let _ = ready.send(Err(err));
        return parts;
    }

    ctx.shared.set_running(true);
    let _ = ready.send(Ok(()));
    log::debug!("{} delivery running", engine.name());

    match engine.run(ctx) {
        Ok(()) => {
            if ctx.shared.drain_requested() {
                if let Some(output) = &ctx.output {
                    output.sub.drain_playback();
                }
            }
        }
        Err(err) => {
            log::error!("{} delivery stopped: {err}", engine.name());
            if let Some(callback) = ctx.error_callback.as_mut() {
                callback(err);
            }
        }
    }

    ctx.stop_clients();
    drop(boost);
    if let Some(callback) = ctx.finished_callback.as_mut() {
        callback();
    }
    finish(ctx, None);
    parts
}

fn finish(ctx: &EngineContext, boost: Option<PriorityBoost>) {
    drop(boost);
    ctx.shared.set_running(false);
    if let Err(err) = ctx.shared.finished.set() {
        log::warn!("failed to signal delivery thread exit: {err}");
    }
}
