//! The platform contracts the engine is written against.
//!
//! A backend provides a device service, endpoints, and per-direction hardware audio clients. The
//! engine never talks to the operating system directly. Everything it needs from the platform
//! goes through these traits, which lets the same negotiation, build and delivery code drive the
//! real WASAPI backend on Windows and the simulated backend everywhere.

use std::slice;
use std::sync::Arc;

use crate::signal::Event;
use crate::timing::ReferenceTime;
use crate::{
    BackendSpecificError, ClientError, DataFlow, DeviceState, EnumerationError, FormFactor,
    FrameCount, SampleRate, ShareMode, ThreadPriority, WaveFormat,
};

/// A **backend** connects to a platform's audio device service.
///
/// Connecting may establish process-wide state (on Windows, a COM apartment for the calling
/// thread). That state belongs to the returned [`DeviceService`] and is released when the service
/// is dropped, and only if `connect` actually acquired it.
pub trait AudioBackend: Send + Sync {
    /// Short name of the backend, for logs.
    fn name(&self) -> &'static str;

    /// Reaches the device service.
    ///
    /// Failing here is fatal for the whole engine: no device can be used.
    fn connect(&self) -> Result<Box<dyn DeviceService>, EnumerationError>;
}

/// A connected device service.
pub trait DeviceService: Send + Sync {
    /// All active render and capture endpoints.
    fn endpoints(&self) -> Result<Vec<Arc<dyn Endpoint>>, BackendSpecificError>;

    /// The identifier of the system default endpoint for `flow`, or `None` if there is none.
    fn default_endpoint_id(&self, flow: DataFlow) -> Result<Option<String>, BackendSpecificError>;
}

/// Default and minimum scheduling periods of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevicePeriod {
    /// The period the shared-mode engine runs at.
    pub default: ReferenceTime,
    /// The shortest period an exclusive-mode stream may use.
    pub minimum: ReferenceTime,
}

/// One audio endpoint.
pub trait Endpoint: Send + Sync {
    fn id(&self) -> Result<String, BackendSpecificError>;

    fn friendly_name(&self) -> Result<String, BackendSpecificError>;

    fn state(&self) -> DeviceState;

    fn data_flow(&self) -> Result<DataFlow, BackendSpecificError>;

    fn form_factor(&self) -> FormFactor;

    /// The format the endpoint declares as its default.
    fn default_format(&self) -> Result<WaveFormat, ClientError>;

    /// Probes the scheduling periods without initializing a real-time client.
    fn device_period(&self) -> Result<DevicePeriod, ClientError>;

    /// Creates a fresh, uninitialized audio client.
    fn activate(&self) -> Result<Box<dyn AudioClient>, ClientError>;
}

/// Answer of an endpoint to "would you accept this format?".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatSupport {
    /// The exact format is accepted.
    Exact,
    /// Shared mode only: the exact format is refused but this one would be accepted.
    Closest(WaveFormat),
    Unsupported,
}

/// Parameters of [`AudioClient::initialize`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientInit {
    pub share_mode: ShareMode,
    /// Ask the client to signal an event whenever a buffer is ready.
    pub event_driven: bool,
    /// Requested buffer duration.
    pub buffer_duration: ReferenceTime,
    /// Device period for exclusive streams. Zero in shared mode.
    pub periodicity: ReferenceTime,
}

/// A per-direction hardware audio client.
///
/// Calls may fail with [`ClientError::DeviceInvalidated`] at any time if the endpoint goes away.
pub trait AudioClient: Send {
    /// Prepares the calling thread for use of this client. Called once at the top of the delivery
    /// thread before any other call from that thread.
    fn attach_thread(&self) -> Result<(), ClientError> {
        Ok(())
    }

    fn is_format_supported(
        &self,
        share_mode: ShareMode,
        format: &WaveFormat,
    ) -> Result<FormatSupport, ClientError>;

    /// The shared-mode mix format.
    fn mix_format(&self) -> Result<WaveFormat, ClientError>;

    fn initialize(&mut self, init: &ClientInit, format: &WaveFormat) -> Result<(), ClientError>;

    /// The allocated buffer capacity in frames.
    ///
    /// After `initialize` failed with [`ClientError::BufferSizeNotAligned`] this reports the
    /// next aligned frame count instead.
    fn buffer_size(&self) -> Result<FrameCount, ClientError>;

    fn stream_latency(&self) -> Result<ReferenceTime, ClientError>;

    /// Registers the event the client signals when a buffer is ready.
    fn set_event_handle(&mut self, event: &Event) -> Result<(), ClientError>;

    fn start(&mut self) -> Result<(), ClientError>;

    fn stop(&mut self) -> Result<(), ClientError>;

    /// Frames queued in the hardware buffer: unplayed for render, unread for capture.
    fn current_padding(&self) -> Result<FrameCount, ClientError>;

    fn capture_service(&mut self) -> Result<Box<dyn CaptureClient>, ClientError>;

    fn render_service(&mut self) -> Result<Box<dyn RenderClient>, ClientError>;
}

/// Flags attached to a hardware buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags(pub u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const DATA_DISCONTINUITY: BufferFlags = BufferFlags(0x1);
    pub const SILENT: BufferFlags = BufferFlags(0x2);
    pub const TIMESTAMP_ERROR: BufferFlags = BufferFlags(0x4);

    pub const fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A captured packet as handed out by the hardware.
#[derive(Clone, Copy, Debug)]
pub struct RawCapture {
    pub data: *const u8,
    pub frames: FrameCount,
    pub flags: BufferFlags,
}

/// The capture service of an initialized client.
///
/// # Safety
///
/// A pointer returned by `get_buffer` must stay valid for `frames` whole frames until the matching
/// `release_buffer` call.
pub unsafe trait CaptureClient: Send {
    /// The next captured packet, or `None` if the capture queue is empty.
    fn get_buffer(&mut self) -> Result<Option<RawCapture>, ClientError>;

    /// Releases the packet. `frames` is either the packet's frame count or zero.
    fn release_buffer(&mut self, frames: FrameCount) -> Result<(), ClientError>;
}

/// The render service of an initialized client.
///
/// # Safety
///
/// A pointer returned by `get_buffer(frames)` must stay valid and writable for `frames` whole
/// frames until the matching `release_buffer` call.
pub unsafe trait RenderClient: Send {
    /// Space for `frames` frames. Fails with [`ClientError::BufferTooLarge`] if fewer are free.
    fn get_buffer(&mut self, frames: FrameCount) -> Result<*mut u8, ClientError>;

    fn release_buffer(&mut self, frames: FrameCount, flags: BufferFlags)
        -> Result<(), ClientError>;
}

/// A captured hardware buffer, released when dropped.
pub struct CapturePacket<'a> {
    client: &'a mut dyn CaptureClient,
    data: *const u8,
    len: usize,
    frames: FrameCount,
    flags: BufferFlags,
    released: bool,
}

impl<'a> CapturePacket<'a> {
    /// Takes the next packet from the capture queue.
    pub fn next(
        client: &'a mut dyn CaptureClient,
        bytes_per_frame: usize,
    ) -> Result<Option<CapturePacket<'a>>, ClientError> {
        Ok(client.get_buffer()?.map(|raw| {
            let len = if raw.data.is_null() {
                0
            } else {
                raw.frames as usize * bytes_per_frame
            };
            CapturePacket {
                data: raw.data,
                len,
                frames: raw.frames,
                flags: raw.flags,
                released: false,
                client,
            }
        }))
    }

    pub fn data(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // Valid until release, per the `CaptureClient` contract.
        unsafe { slice::from_raw_parts(self.data, self.len) }
    }

    pub fn frames(&self) -> FrameCount {
        self.frames
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    /// Hands the packet back to the hardware.
    pub fn release(mut self) -> Result<(), ClientError> {
        self.released = true;
        self.client.release_buffer(self.frames)
    }
}

impl Drop for CapturePacket<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.client.release_buffer(self.frames);
        }
    }
}

/// Render buffer space acquired from the hardware.
///
/// [`RenderPacket::commit`] queues the written frames. Dropping the packet without committing it
/// queues silence instead.
pub struct RenderPacket<'a> {
    client: &'a mut dyn RenderClient,
    data: *mut u8,
    len: usize,
    frames: FrameCount,
    released: bool,
}

impl<'a> RenderPacket<'a> {
    pub fn acquire(
        client: &'a mut dyn RenderClient,
        frames: FrameCount,
        bytes_per_frame: usize,
    ) -> Result<RenderPacket<'a>, ClientError> {
        let data = client.get_buffer(frames)?;
        let len = if data.is_null() {
            0
        } else {
            frames as usize * bytes_per_frame
        };
        Ok(RenderPacket {
            client,
            data,
            len,
            frames,
            released: false,
        })
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // Valid and exclusively ours until release, per the `RenderClient` contract.
        unsafe { slice::from_raw_parts_mut(self.data, self.len) }
    }

    pub fn frames(&self) -> FrameCount {
        self.frames
    }

    pub fn commit(mut self) -> Result<(), ClientError> {
        self.released = true;
        self.client.release_buffer(self.frames, BufferFlags::NONE)
    }
}

impl Drop for RenderPacket<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.client.release_buffer(self.frames, BufferFlags::SILENT);
        }
    }
}

/// What the engine asks of the real-time scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElevationRequest {
    pub priority: ThreadPriority,
    /// Frames per cycle of the thread being elevated, zero if unknown.
    pub buffer_frames: FrameCount,
    /// Zero if unknown.
    pub sample_rate: SampleRate,
}

/// A real-time scheduling service: "elevate the current thread to a named category".
pub trait RealtimeScheduler: Send + Sync {
    fn elevate(
        &self,
        request: &ElevationRequest,
    ) -> Result<Box<dyn ElevatedThread>, BackendSpecificError>;
}

/// The calling thread's elevated scheduling, undone by [`ElevatedThread::revert`].
///
/// Must be reverted on the thread that was elevated.
pub trait ElevatedThread {
    fn revert(self: Box<Self>) -> Result<(), BackendSpecificError>;
}
