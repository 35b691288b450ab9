//! Synchronous transfers for streams opened without callbacks.
//!
//! Every transfer runs under its direction's in-flight guard: the guard's idle event is cleared
//! while any transfer is in progress, so stopping or closing the stream can wait for it to observe
//! the shutdown signal before the hardware client goes away. A transfer holds the slot lock only
//! for one exchange with the hardware and releases it while it waits, which keeps the
//! availability queries from queueing behind a long read or write.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use crate::build::{Service, SubStream};
use crate::convert::{f32_to_wire, fill_silence, wire_to_f32};
use crate::signal::Event;
use crate::timing::frames_to_duration;
use crate::traits::{BufferFlags, CapturePacket, RenderPacket};
use crate::{BackendSpecificError, ClientError, FrameCount, SampleFormat, ShareMode, StreamError};

const MIN_WAIT: Duration = Duration::from_millis(1);
const MAX_READ_WAIT: Duration = Duration::from_millis(2);

/// What a transfer does after one exchange with the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Go again right away.
    Continue,
    /// Nothing can move yet. Wait this long, unlocked, before going again.
    Wait(Duration),
    Done,
}

/// One direction of a blocking stream behind its in-flight guard.
pub(crate) struct Guarded<T> {
    slot: Mutex<Option<T>>,
    /// Transfers in progress.
    in_flight: Mutex<usize>,
    /// Manual reset, set while no transfer is in flight.
    idle: Event,
}

struct InFlight<'a, T>(&'a Guarded<T>);

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        let mut count = self.0.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            if let Err(err) = self.0.idle.set() {
                log::warn!("failed to release the transfer guard: {err}");
            }
        }
    }
}

impl<T> Guarded<T> {
    pub(crate) fn new(side: T) -> Result<Self, StreamError> {
        Ok(Guarded {
            slot: Mutex::new(Some(side)),
            in_flight: Mutex::new(0),
            idle: Event::new(true, true)?,
        })
    }

    fn enter(&self) -> Result<InFlight<'_, T>, StreamError> {
        let mut count = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            self.idle.reset()?;
        }
        *count += 1;
        Ok(InFlight(self))
    }

    /// Runs one transfer under the guard. `admit` is checked once the guard is held. `step` runs
    /// with the slot locked until it reports [`Step::Done`] or `shutdown` is set.
    pub(crate) fn transfer(
        &self,
        shutdown: &Event,
        admit: impl FnOnce() -> Result<(), StreamError>,
        mut step: impl FnMut(&mut T) -> Result<Step, StreamError>,
    ) -> Result<(), StreamError> {
        let _in_flight = self.enter()?;
        admit()?;
        loop {
            if shutdown.is_set() {
                return Ok(());
            }
            let next = {
                let mut slot = self.lock();
                let side = slot.as_mut().ok_or(StreamError::StreamClosed)?;
                step(side)?
            };
            match next {
                Step::Continue => {}
                Step::Wait(wait) => {
                    if shutdown.wait_timeout(wait)? {
                        return Ok(());
                    }
                }
                Step::Done => return Ok(()),
            }
        }
    }

    /// Runs a short query on the side outside the in-flight guard.
    pub(crate) fn query<R>(
        &self,
        f: impl FnOnce(&T) -> Result<R, StreamError>,
    ) -> Result<R, StreamError> {
        let slot = self.lock();
        f(slot.as_ref().ok_or(StreamError::StreamClosed)?)
    }

    /// Waits for transfers in flight to finish. Returns false if they did not within `timeout`.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> Result<bool, StreamError> {
        Ok(self.idle.wait_timeout(timeout)?)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the side out, dropping it releases the hardware client.
    pub(crate) fn take(&self) -> Option<T> {
        self.lock().take()
    }
}

impl Guarded<BlockingInput> {
    /// Fills `out` with interleaved samples. Returns the number of frames read, which is short
    /// only if shutdown was requested.
    pub(crate) fn read(
        &self,
        out: &mut [f32],
        shutdown: &Event,
        admit: impl FnOnce() -> Result<(), StreamError>,
    ) -> Result<FrameCount, StreamError> {
        let mut done = 0;
        self.transfer(shutdown, admit, |side| side.read_step(&mut *out, &mut done))?;
        Ok(done as FrameCount)
    }
}

impl Guarded<BlockingOutput> {
    /// Queues all of `input`, one device cycle per hardware transfer. Returns the number of frames
    /// written, which is short only if shutdown was requested.
    pub(crate) fn write(
        &self,
        input: &[f32],
        shutdown: &Event,
        admit: impl FnOnce() -> Result<(), StreamError>,
    ) -> Result<FrameCount, StreamError> {
        let mut done = 0;
        self.transfer(shutdown, admit, |side| side.write_step(input, &mut done))?;
        Ok(done)
    }
}

fn sample_format(sub: &SubStream) -> Result<SampleFormat, StreamError> {
    sub.format.sample_format().ok_or_else(|| {
        BackendSpecificError::new(format!(
            "{} has no sample format the blocking adapter converts",
            sub.format
        ))
        .into()
    })
}

pub(crate) struct BlockingInput {
    pub(crate) sub: SubStream,
    /// Frames of a hardware packet left over from the previous read, in wire format.
    tail: HeapRb<u8>,
    scratch: Vec<u8>,
}

impl BlockingInput {
    pub(crate) fn new(sub: SubStream) -> Self {
        let capacity = sub.format.frames_to_bytes(sub.buffer_frames).max(1);
        BlockingInput {
            tail: HeapRb::new(capacity),
            scratch: Vec::with_capacity(capacity),
            sub,
        }
    }

    fn tail_frames(&self) -> FrameCount {
        (self.tail.occupied_len() / self.sub.bytes_per_frame()) as FrameCount
    }

    /// Frames a read can return without waiting.
    pub(crate) fn available(&self) -> Result<FrameCount, StreamError> {
        Ok(self.sub.client.current_padding()? + self.tail_frames())
    }

    /// How long to wait for the capture queue to refill with `remaining` frames still to read.
    fn poll_interval(&self, remaining: FrameCount) -> Duration {
        if self.sub.share_mode == ShareMode::Exclusive {
            return MIN_WAIT;
        }
        let frames = remaining.min(self.sub.frames_per_cycle);
        (frames_to_duration(frames, self.sub.sample_rate()) / 4).clamp(MIN_WAIT, MAX_READ_WAIT)
    }

    /// Moves one packet, or what is left of the last one, into `out` after the `done` frames
    /// already read.
    fn read_step(&mut self, out: &mut [f32], done: &mut usize) -> Result<Step, StreamError> {
        let sample_format = sample_format(&self.sub)?;
        let channels = usize::from(self.sub.format.channels);
        let bytes_per_frame = self.sub.bytes_per_frame();
        let wanted = out.len() / channels;
        if *done >= wanted {
            return Ok(Step::Done);
        }

        let from_tail = (self.tail_frames() as usize).min(wanted - *done);
        if from_tail > 0 {
            self.scratch.resize(from_tail * bytes_per_frame, 0);
            self.tail.pop_slice(&mut self.scratch);
            let dst = &mut out[*done * channels..(*done + from_tail) * channels];
            wire_to_f32(sample_format, &self.scratch, dst);
            *done += from_tail;
            return Ok(Step::Continue);
        }

        let remaining = (wanted - *done) as FrameCount;
        let interval = self.poll_interval(remaining);
        let BlockingInput { sub, tail, scratch } = self;
        let Service::Capture(capture) = &mut sub.service else {
            return Ok(Step::Done);
        };
        let Some(packet) = CapturePacket::next(capture.as_mut(), bytes_per_frame)? else {
            return Ok(Step::Wait(interval));
        };

        let frames = packet.frames() as usize;
        let take = frames.min(wanted - *done);
        let silent = packet.flags().contains(BufferFlags::SILENT);
        let dst = &mut out[*done * channels..(*done + take) * channels];
        if silent {
            dst.fill(0.0);
        } else {
            wire_to_f32(sample_format, packet.data(), dst);
        }

        if take < frames {
            let leftover = if silent {
                scratch.resize((frames - take) * bytes_per_frame, 0);
                fill_silence(sample_format, scratch);
                &scratch[..]
            } else {
                &packet.data()[take * bytes_per_frame..]
            };
            let kept = tail.push_slice(leftover);
            if kept < leftover.len() {
                log::warn!(
                    "dropped {} captured frames, the read tail is full",
                    (leftover.len() - kept) / bytes_per_frame
                );
            }
        }

        *done += take;
        packet.release()?;
        Ok(Step::Continue)
    }
}

pub(crate) struct BlockingOutput {
    pub(crate) sub: SubStream,
    /// When the last transfer was queued and how many frames it held.
    last: Option<(Instant, FrameCount)>,
}

impl BlockingOutput {
    pub(crate) fn new(sub: SubStream) -> Self {
        BlockingOutput { sub, last: None }
    }

    /// Frames a write can queue without waiting.
    pub(crate) fn available(&self) -> Result<FrameCount, StreamError> {
        let padding = self.sub.client.current_padding()?;
        Ok(self.sub.buffer_frames.saturating_sub(padding))
    }

    pub(crate) fn reset_pacing(&mut self) {
        self.last = None;
    }

    /// Queues at most one device cycle of `input` after the `done` frames already written.
    fn write_step(&mut self, input: &[f32], done: &mut FrameCount) -> Result<Step, StreamError> {
        let sample_format = sample_format(&self.sub)?;
        let channels = usize::from(self.sub.format.channels);
        let bytes_per_frame = self.sub.bytes_per_frame();
        let rate = self.sub.sample_rate();
        let cycle = self.sub.frames_per_cycle.max(1);
        let total = (input.len() / channels) as FrameCount;
        if *done >= total {
            return Ok(Step::Done);
        }

        // Successive transfers are spaced at least half a transfer apart.
        if let Some((at, frames)) = self.last {
            let due = at + frames_to_duration(frames, rate) / 2;
            let now = Instant::now();
            if due > now {
                return Ok(Step::Wait(due - now));
            }
        }

        let remaining = total - *done;
        let room = self.available()?;
        if room == 0 {
            let wait = (frames_to_duration(remaining.min(cycle), rate) / 2).max(MIN_WAIT);
            return Ok(Step::Wait(wait));
        }

        let frames = room.min(remaining).min(cycle);
        let Service::Render(render) = &mut self.sub.service else {
            return Ok(Step::Done);
        };
        let mut packet = match RenderPacket::acquire(render.as_mut(), frames, bytes_per_frame) {
            Ok(packet) => packet,
            Err(ClientError::BufferTooLarge) => return Ok(Step::Continue),
            Err(err) => return Err(err.into()),
        };
        let start = *done as usize * channels;
        let end = start + frames as usize * channels;
        f32_to_wire(sample_format, &input[start..end], packet.data_mut());
        packet.commit()?;

        self.last = Some((Instant::now(), frames));
        *done += frames;
        Ok(Step::Continue)
    }
}

/// The two directions of a blocking stream.
pub(crate) struct BlockingIo {
    pub(crate) input: Option<Arc<Guarded<BlockingInput>>>,
    pub(crate) output: Option<Arc<Guarded<BlockingOutput>>>,
}

impl BlockingIo {
    /// Starts the clients, input first, on the calling thread.
    pub(crate) fn start(&self) -> Result<(), StreamError> {
        if let Some(input) = &self.input {
            if let Some(side) = input.lock().as_mut() {
                side.sub.client.attach_thread()?;
                side.sub.client.start()?;
            }
        }
        if let Some(output) = &self.output {
            if let Some(side) = output.lock().as_mut() {
                side.reset_pacing();
                side.sub.client.attach_thread()?;
                side.sub.client.start()?;
            }
        }
        Ok(())
    }

    /// Waits for transfers in flight and stops the clients. With `drain`, queued output plays
    /// first, for at most one buffer duration. The shutdown signal must already be set.
    pub(crate) fn stop(&self, timeout: Duration, drain: bool) -> Result<(), StreamError> {
        self.wait_idle(timeout)?;
        if let Some(input) = &self.input {
            if let Some(side) = input.lock().as_mut() {
                side.sub.client.stop()?;
            }
        }
        if let Some(output) = &self.output {
            if let Some(side) = output.lock().as_mut() {
                if drain {
                    side.sub.drain_playback();
                }
                side.sub.client.stop()?;
            }
        }
        Ok(())
    }

    fn wait_idle(&self, timeout: Duration) -> Result<(), StreamError> {
        let input_idle = match &self.input {
            Some(input) => input.wait_idle(timeout)?,
            None => true,
        };
        let output_idle = match &self.output {
            Some(output) => output.wait_idle(timeout)?,
            None => true,
        };
        if !(input_idle && output_idle) {
            log::warn!("a blocking transfer is still in flight after {timeout:?}");
        }
        Ok(())
    }

    /// Waits for transfers in flight and releases both clients.
    pub(crate) fn close(&self, timeout: Duration) {
        if let Err(err) = self.wait_idle(timeout) {
            log::warn!("failed to wait for blocking transfers: {err}");
        }
        drop(self.input.as_ref().and_then(|input| input.take()));
        drop(self.output.as_ref().and_then(|output| output.take()));
    }
}
