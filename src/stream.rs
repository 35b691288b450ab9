//! Open streams and their lifecycle.
//!
//! A [`Stream`] is built with all of its hardware clients already initialized. Starting it either
//! spawns the delivery thread (callback mode) or starts the clients directly (blocking mode).
//! Stopping signals the shutdown event and waits, with a bound, for whichever side is using the
//! clients to let go of them.

use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::blocking::{BlockingInput, BlockingIo, BlockingOutput, Guarded};
use crate::build::{BuiltStream, SubStream};
use crate::engine::{
    self, DeliveryEngine, EngineContext, EngineParts, EventEngine, InputProcessor, InputSide,
    OutputProcessor, OutputSide, PollEngine, StreamShared,
};
use crate::signal::Event;
use crate::timing::ReferenceTime;
use crate::traits::{BufferFlags, RealtimeScheduler};
use crate::{
    BackendSpecificError, BuildStreamError, DeliveryMode, Direction, FrameCount,
    NegotiatedFormat, RejectReason, SampleRate, ShareMode, StreamError, ThreadPriority,
};

/// How long `start` waits for the delivery thread to report both clients running.
const START_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on waiting for the delivery thread or a blocking transfer to let go of the clients,
/// on top of the output drain.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type InputDataFn = Box<dyn FnMut(&[f32], &InputCallbackInfo) + Send + 'static>;
pub(crate) type OutputDataFn = Box<dyn FnMut(&mut [f32], &OutputCallbackInfo) + Send + 'static>;
pub(crate) type RawInputFn = Box<dyn FnMut(&[u8], &InputCallbackInfo) + Send + 'static>;
pub(crate) type RawOutputFn = Box<dyn FnMut(&mut [u8], &OutputCallbackInfo) + Send + 'static>;
pub(crate) type ErrorFn = Box<dyn FnMut(StreamError) + Send + 'static>;
pub(crate) type FinishedFn = Box<dyn FnMut() + Send + 'static>;

/// Information relevant to a single call to the input callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputCallbackInfo {
    frames: FrameCount,
    flags: BufferFlags,
}

impl InputCallbackInfo {
    pub(crate) fn new(frames: FrameCount, flags: BufferFlags) -> Self {
        InputCallbackInfo { frames, flags }
    }

    /// Number of frames in the buffer.
    pub fn frames(&self) -> FrameCount {
        self.frames
    }

    /// The flags the hardware attached to the captured packet.
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    /// True if the hardware reports a gap before this packet.
    pub fn is_discontinuity(&self) -> bool {
        self.flags.contains(BufferFlags::DATA_DISCONTINUITY)
    }
}

/// Information relevant to a single call to the output callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputCallbackInfo {
    frames: FrameCount,
}

impl OutputCallbackInfo {
    pub(crate) fn new(frames: FrameCount) -> Self {
        OutputCallbackInfo { frames }
    }

    /// Number of frames the callback must produce.
    pub fn frames(&self) -> FrameCount {
        self.frames
    }
}

/// The callbacks of a stream opened in callback mode.
///
/// The data callbacks receive interleaved `f32` samples. A direction opened with
/// [`redirect_raw_processor`](crate::WasapiOptions::redirect_raw_processor) receives the raw
/// hardware buffer in the negotiated wire format instead.
#[derive(Default)]
pub struct Callbacks {
    input: Option<InputDataFn>,
    output: Option<OutputDataFn>,
    raw_input: Option<RawInputFn>,
    raw_output: Option<RawOutputFn>,
    error: Option<ErrorFn>,
    finished: Option<FinishedFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_input<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&[f32], &InputCallbackInfo) + Send + 'static,
    {
        self.input = Some(Box::new(callback));
        self
    }

    pub fn on_output<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&mut [f32], &OutputCallbackInfo) + Send + 'static,
    {
        self.output = Some(Box::new(callback));
        self
    }

    pub fn on_raw_input<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&[u8], &InputCallbackInfo) + Send + 'static,
    {
        self.raw_input = Some(Box::new(callback));
        self
    }

    pub fn on_raw_output<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&mut [u8], &OutputCallbackInfo) + Send + 'static,
    {
        self.raw_output = Some(Box::new(callback));
        self
    }

    /// Called from the delivery thread when the stream faults. The stream is not running once the
    /// callback returns.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnMut(StreamError) + Send + 'static,
    {
        self.error = Some(Box::new(callback));
        self
    }

    /// Called from the delivery thread after the clients have been stopped.
    pub fn on_finished<F>(mut self, callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.finished = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .field("raw_input", &self.raw_input.is_some())
            .field("raw_output", &self.raw_output.is_some())
            .field("error", &self.error.is_some())
            .field("finished", &self.finished.is_some())
            .finish()
    }
}

/// How a stream exchanges audio with the caller.
#[derive(Debug)]
pub enum StreamMode {
    /// A delivery thread invokes the callbacks.
    Callback(Callbacks),
    /// The caller transfers audio with [`Stream::read`] and [`Stream::write`].
    Blocking,
}

impl StreamMode {
    pub(crate) fn is_blocking(&self) -> bool {
        matches!(self, StreamMode::Blocking)
    }
}

/// Lifecycle state of a [`Stream`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Opened and never started.
    Built,
    Running,
    /// Stopped by the caller or by a fault.
    Stopped,
    Closed,
}

/// What one direction of a stream ended up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubStreamInfo {
    pub format: NegotiatedFormat,
    /// Hardware buffer capacity as allocated.
    pub buffer_frames: FrameCount,
    pub frames_per_cycle: FrameCount,
    pub period: ReferenceTime,
    /// Latency the audio client reports on top of the buffer.
    pub device_latency: ReferenceTime,
    /// Buffer duration plus device latency.
    pub latency: Duration,
    pub share_mode: ShareMode,
    pub delivery: DeliveryMode,
}

/// What a stream ended up with after it was built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub input: Option<SubStreamInfo>,
    pub output: Option<SubStreamInfo>,
    pub sample_rate: SampleRate,
    pub thread_priority: ThreadPriority,
}

impl StreamInfo {
    pub fn direction(&self, direction: Direction) -> Option<&SubStreamInfo> {
        match direction {
            Direction::Input => self.input.as_ref(),
            Direction::Output => self.output.as_ref(),
        }
    }
}

struct CallbackDelivery {
    /// Present while the thread is not running.
    parts: Option<EngineParts>,
    thread: Option<JoinHandle<EngineParts>>,
    /// Handles of the direction events, to wake the engine on shutdown.
    wake: Vec<Event>,
    /// How long stopping may take before the thread is given up on.
    release_timeout: Duration,
}

impl CallbackDelivery {
    fn start(&mut self, shared: &StreamShared) -> Result<(), StreamError> {
        let parts = self.parts.take().ok_or_else(|| {
            StreamError::from(BackendSpecificError::new(
                "the delivery thread of a previous run never returned",
            ))
        })?;
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = engine::spawn(parts, ready_tx)?;
        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => {
                self.thread = Some(handle);
                Ok(())
            }
            Ok(Err(err)) => {
                self.parts = join(handle);
                Err(err)
            }
            Err(_) => {
                log::error!("delivery thread did not report within {START_TIMEOUT:?}");
                self.thread = Some(handle);
                self.halt(shared);
                Err(StreamError::StartTimeout)
            }
        }
    }

    /// Signals shutdown and takes the engine back from the thread.
    fn halt(&mut self, shared: &StreamShared) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        if let Err(err) = shared.shutdown.set() {
            log::error!("failed to signal shutdown: {err}");
        }
        for event in &self.wake {
            let _ = event.set();
        }
        match shared.finished.wait_timeout(self.release_timeout) {
            Ok(true) => self.parts = join(handle),
            Ok(false) => log::error!(
                "delivery thread did not finish within {:?}, leaving it detached",
                self.release_timeout
            ),
            Err(err) => log::error!("failed to wait for the delivery thread: {err}"),
        }
    }
}

fn join(handle: JoinHandle<EngineParts>) -> Option<EngineParts> {
    match handle.join() {
        Ok(parts) => Some(parts),
        Err(_) => {
            log::error!("the delivery thread panicked");
            None
        }
    }
}

enum Delivery {
    Callback(CallbackDelivery),
    Blocking(BlockingIo),
}

struct Control {
    state: StreamState,
    delivery: Delivery,
}

/// An open stream.
///
/// `start`, `stop`, `abort` and `close` are serialized internally. Blocking transfers may run on
/// other threads at the same time and are interrupted by stopping.
pub struct Stream {
    shared: Arc<StreamShared>,
    control: Mutex<Control>,
    info: StreamInfo,
}

impl Stream {
    pub(crate) fn open(
        built: BuiltStream,
        mode: StreamMode,
        scheduler: Arc<dyn RealtimeScheduler>,
    ) -> Result<Stream, BuildStreamError> {
        let info = StreamInfo {
            input: built.input.as_ref().map(SubStream::info),
            output: built.output.as_ref().map(SubStream::info),
            sample_rate: built.sample_rate,
            thread_priority: built.priority,
        };
        let shared = Arc::new(StreamShared::new()?);
        let delivery = match mode {
            StreamMode::Callback(callbacks) => {
                Delivery::Callback(callback_delivery(built, callbacks, &shared, scheduler)?)
            }
            StreamMode::Blocking => Delivery::Blocking(blocking_io(built)?),
        };
        Ok(Stream {
            shared,
            control: Mutex::new(Control {
                state: StreamState::Built,
                delivery,
            }),
            info,
        })
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the stream. Starting a running stream does nothing.
    pub fn start(&self) -> Result<(), StreamError> {
        let mut control = self.control();
        match control.state {
            StreamState::Closed => return Err(StreamError::StreamClosed),
            StreamState::Running if self.shared.is_running() => return Ok(()),
            StreamState::Running => {
                // The delivery thread ended on a fault. Take the engine back first.
                self.halt_locked(&mut control, false)?;
            }
            StreamState::Built | StreamState::Stopped => {}
        }

        self.shared.rearm()?;
        match &mut control.delivery {
            Delivery::Callback(delivery) => delivery.start(&self.shared)?,
            Delivery::Blocking(io) => {
                if let Err(err) = io.start() {
                    let _ = io.stop(Duration::ZERO, false);
                    return Err(err);
                }
                self.shared.set_running(true);
            }
        }
        control.state = StreamState::Running;
        log::debug!("stream started");
        Ok(())
    }

    /// Stops the stream after queued output has played, waiting at most one buffer duration for
    /// it. Stopping a stream that is not running does nothing.
    pub fn stop(&self) -> Result<(), StreamError> {
        self.halt(true)
    }

    /// Stops the stream without letting queued output play.
    pub fn abort(&self) -> Result<(), StreamError> {
        self.halt(false)
    }

    fn halt(&self, drain: bool) -> Result<(), StreamError> {
        let mut control = self.control();
        match control.state {
            StreamState::Closed => Err(StreamError::StreamClosed),
            StreamState::Running => self.halt_locked(&mut control, drain),
            StreamState::Built | StreamState::Stopped => Ok(()),
        }
    }

    fn halt_locked(&self, control: &mut Control, drain: bool) -> Result<(), StreamError> {
        self.shared.request_drain(drain);
        let result = match &mut control.delivery {
            Delivery::Callback(delivery) => {
                delivery.halt(&self.shared);
                Ok(())
            }
            Delivery::Blocking(io) => {
                self.shared.shutdown.set()?;
                let result = io.stop(RELEASE_TIMEOUT, drain);
                self.shared.set_running(false);
                result
            }
        };
        control.state = StreamState::Stopped;
        log::debug!("stream stopped");
        result
    }

    /// Stops the stream if needed and releases every hardware client. Closing twice does nothing.
    pub fn close(&self) -> Result<(), StreamError> {
        let mut control = self.control();
        if control.state == StreamState::Closed {
            return Ok(());
        }
        let result = if control.state == StreamState::Running {
            self.halt_locked(&mut control, false)
        } else {
            Ok(())
        };
        match &mut control.delivery {
            Delivery::Callback(delivery) => {
                delivery.parts = None;
                delivery.wake.clear();
            }
            Delivery::Blocking(io) => {
                // Transfers started after the stop observe the shutdown signal and return.
                let _ = self.shared.shutdown.set();
                io.close(RELEASE_TIMEOUT);
            }
        }
        control.state = StreamState::Closed;
        log::debug!("stream closed");
        result
    }

    /// True while audio is flowing.
    pub fn is_active(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_stopped(&self) -> bool {
        !self.is_active()
    }

    pub fn state(&self) -> StreamState {
        match self.control().state {
            StreamState::Running if !self.shared.is_running() => StreamState::Stopped,
            state => state,
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.info.sample_rate
    }

    pub fn input_latency(&self) -> Option<Duration> {
        self.info.input.map(|info| info.latency)
    }

    pub fn output_latency(&self) -> Option<Duration> {
        self.info.output.map(|info| info.latency)
    }

    fn blocking_side<T>(
        &self,
        pick: impl FnOnce(&BlockingIo) -> Option<&Arc<Guarded<T>>>,
        direction: Direction,
    ) -> Result<Arc<Guarded<T>>, StreamError> {
        // The control lock is held only long enough to find the side, so stopping can interrupt
        // a transfer in progress.
        let control = self.control();
        let io = match &control.delivery {
            Delivery::Blocking(io) => io,
            Delivery::Callback(_) => return Err(StreamError::NotBlocking),
        };
        pick(io)
            .cloned()
            .ok_or(StreamError::NoSuchDirection(direction))
    }

    fn ensure_running(&self) -> Result<(), StreamError> {
        if self.shared.is_running() {
            Ok(())
        } else {
            Err(StreamError::StreamNotRunning)
        }
    }

    /// Reads interleaved samples into `buffer`, blocking until it is full. Returns the number of
    /// frames read, which is short only if the stream was stopped meanwhile.
    pub fn read(&self, buffer: &mut [f32]) -> Result<FrameCount, StreamError> {
        let input = self.blocking_side(|io| io.input.as_ref(), Direction::Input)?;
        input.read(buffer, &self.shared.shutdown, || self.ensure_running())
    }

    /// Writes interleaved samples from `buffer`, blocking until all of them are queued. Returns
    /// the number of frames written, which is short only if the stream was stopped meanwhile.
    pub fn write(&self, buffer: &[f32]) -> Result<FrameCount, StreamError> {
        let output = self.blocking_side(|io| io.output.as_ref(), Direction::Output)?;
        output.write(buffer, &self.shared.shutdown, || self.ensure_running())
    }

    /// Frames that can be read without blocking. Answers while a read is in progress.
    pub fn read_available(&self) -> Result<FrameCount, StreamError> {
        let input = self.blocking_side(|io| io.input.as_ref(), Direction::Input)?;
        self.ensure_running()?;
        input.query(|side| side.available())
    }

    /// Frames that can be written without blocking. Answers while a write is in progress.
    pub fn write_available(&self) -> Result<FrameCount, StreamError> {
        let output = self.blocking_side(|io| io.output.as_ref(), Direction::Output)?;
        self.ensure_running()?;
        output.query(|side| side.available())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("failed to close stream: {err}");
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stream")
            .field("state", &self.state())
            .field("info", &self.info)
            .finish()
    }
}

fn convertible(sub: &SubStream) -> Result<crate::SampleFormat, BuildStreamError> {
    sub.format
        .sample_format()
        .ok_or(BuildStreamError::UnsupportedFormat(RejectReason::InvalidRequest(
            "the negotiated wire format has no sample conversion",
        )))
}

fn missing(what: &str) -> BuildStreamError {
    BuildStreamError::InvalidArgument(format!("the stream has no {what} callback"))
}

fn callback_delivery(
    built: BuiltStream,
    mut callbacks: Callbacks,
    shared: &Arc<StreamShared>,
    scheduler: Arc<dyn RealtimeScheduler>,
) -> Result<CallbackDelivery, BuildStreamError> {
    let delivery = built.delivery();
    let BuiltStream {
        input,
        output,
        priority,
        ..
    } = built;

    let input = match input {
        Some(sub) => {
            let processor = if sub.params.options.redirect_raw_processor {
                InputProcessor::Raw(callbacks.raw_input.take().ok_or_else(|| missing("raw input"))?)
            } else {
                InputProcessor::Adapter {
                    callback: callbacks.input.take().ok_or_else(|| missing("input"))?,
                    sample_format: convertible(&sub)?,
                    scratch: Vec::with_capacity(
                        sub.buffer_frames as usize * usize::from(sub.format.channels),
                    ),
                }
            };
            Some(InputSide { sub, processor })
        }
        None => None,
    };
    let output = match output {
        Some(sub) => {
            let processor = if sub.params.options.redirect_raw_processor {
                OutputProcessor::Raw(
                    callbacks.raw_output.take().ok_or_else(|| missing("raw output"))?,
                )
            } else {
                OutputProcessor::Adapter {
                    callback: callbacks.output.take().ok_or_else(|| missing("output"))?,
                    sample_format: convertible(&sub)?,
                    scratch: Vec::with_capacity(
                        sub.buffer_frames as usize * usize::from(sub.format.channels),
                    ),
                }
            };
            Some(OutputSide { sub, processor })
        }
        None => None,
    };

    let input_sub = input.as_ref().map(|side| &side.sub);
    let output_sub = output.as_ref().map(|side| &side.sub);
    let wake = input_sub
        .into_iter()
        .chain(output_sub)
        .filter_map(|sub| sub.event.clone())
        .collect();
    let longest_buffer = input_sub
        .into_iter()
        .chain(output_sub)
        .map(SubStream::buffer_duration)
        .max()
        .unwrap_or_default();
    let engine: Box<dyn DeliveryEngine> = match delivery {
        DeliveryMode::Event => Box::new(EventEngine::new()),
        DeliveryMode::Poll => Box::new(PollEngine::for_streams(input_sub, output_sub)),
    };
    log::debug!("stream uses {} delivery at {priority}", engine.name());

    Ok(CallbackDelivery {
        parts: Some(EngineParts {
            ctx: EngineContext {
                input,
                output,
                error_callback: callbacks.error,
                finished_callback: callbacks.finished,
                shared: shared.clone(),
                priority,
                scheduler,
            },
            engine,
        }),
        thread: None,
        wake,
        release_timeout: RELEASE_TIMEOUT + longest_buffer,
    })
}

fn blocking_io(built: BuiltStream) -> Result<BlockingIo, BuildStreamError> {
    let stream_error = |err: StreamError| BuildStreamError::BackendSpecific(
        BackendSpecificError::new(err.to_string()),
    );
    let input = match built.input {
        Some(sub) => {
            convertible(&sub)?;
            Some(Arc::new(
                Guarded::new(BlockingInput::new(sub)).map_err(stream_error)?,
            ))
        }
        None => None,
    };
    let output = match built.output {
        Some(sub) => {
            convertible(&sub)?;
            Some(Arc::new(
                Guarded::new(BlockingOutput::new(sub)).map_err(stream_error)?,
            ))
        }
        None => None,
    };
    Ok(BlockingIo { input, output })
}
