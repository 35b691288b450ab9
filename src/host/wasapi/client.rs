use std::ptr;

use windows::Win32::Foundation::{S_FALSE, S_OK};
use windows::Win32::Media::Audio;

use super::client_error;
use super::com;
use super::format::{as_waveformatex, from_native, to_native, WaveFormatExPtr};
use crate::signal::Event;
use crate::timing::ReferenceTime;
use crate::traits::{
    AudioClient, BufferFlags, CaptureClient, ClientInit, FormatSupport, RawCapture, RenderClient,
};
use crate::{ClientError, DataFlow, FrameCount, ShareMode, WaveFormat};

fn share_mode(mode: ShareMode) -> Audio::AUDCLNT_SHAREMODE {
    match mode {
        ShareMode::Shared => Audio::AUDCLNT_SHAREMODE_SHARED,
        ShareMode::Exclusive => Audio::AUDCLNT_SHAREMODE_EXCLUSIVE,
    }
}

/// An `IAudioClient` of one endpoint.
pub(super) struct WasapiClient {
    client: Audio::IAudioClient,
    flow: DataFlow,
}

// Audio clients are free-threaded. The engine moves each client to its delivery thread and uses it
// from there only.
unsafe impl Send for WasapiClient {}

impl WasapiClient {
    pub(super) fn new(client: Audio::IAudioClient, flow: DataFlow) -> Self {
        WasapiClient { client, flow }
    }

    fn require_flow(&self, flow: DataFlow) -> Result<(), ClientError> {
        if self.flow == flow {
            Ok(())
        } else {
            Err(ClientError::WrongEndpointType)
        }
    }
}

impl AudioClient for WasapiClient {
    fn attach_thread(&self) -> Result<(), ClientError> {
        Ok(com::com_initialized()?)
    }

    fn is_format_supported(
        &self,
        share: ShareMode,
        format: &WaveFormat,
    ) -> Result<FormatSupport, ClientError> {
        let native = to_native(format);
        let mut closest: *mut Audio::WAVEFORMATEX = ptr::null_mut();
        let result = unsafe {
            match share {
                ShareMode::Shared => self.client.IsFormatSupported(
                    share_mode(share),
                    as_waveformatex(&native),
                    Some(&mut closest as *mut _),
                ),
                // Exclusive mode never proposes an alternative.
                ShareMode::Exclusive => {
                    self.client
                        .IsFormatSupported(share_mode(share), as_waveformatex(&native), None)
                }
            }
        };
        let closest = WaveFormatExPtr(closest);
        match result {
            S_OK => Ok(FormatSupport::Exact),
            S_FALSE => Ok(unsafe { from_native(closest.0) }
                .map(FormatSupport::Closest)
                .unwrap_or(FormatSupport::Unsupported)),
            Audio::AUDCLNT_E_UNSUPPORTED_FORMAT => Ok(FormatSupport::Unsupported),
            code if code.is_err() => Err(client_error(code.into())),
            _ => Ok(FormatSupport::Exact),
        }
    }

    fn mix_format(&self) -> Result<WaveFormat, ClientError> {
        unsafe {
            let mix = WaveFormatExPtr(self.client.GetMixFormat().map_err(client_error)?);
            from_native(mix.0).ok_or(ClientError::UnsupportedFormat)
        }
    }

    fn initialize(&mut self, init: &ClientInit, format: &WaveFormat) -> Result<(), ClientError> {
        let native = to_native(format);
        let flags = if init.event_driven {
            Audio::AUDCLNT_STREAMFLAGS_EVENTCALLBACK
        } else {
            0
        };
        unsafe {
            self.client.Initialize(
                share_mode(init.share_mode),
                flags,
                init.buffer_duration.0,
                init.periodicity.0,
                as_waveformatex(&native),
                None,
            )
        }
        .map_err(client_error)
    }

    fn buffer_size(&self) -> Result<FrameCount, ClientError> {
        unsafe { self.client.GetBufferSize() }.map_err(client_error)
    }

    fn stream_latency(&self) -> Result<ReferenceTime, ClientError> {
        unsafe { self.client.GetStreamLatency() }
            .map(ReferenceTime)
            .map_err(client_error)
    }

    fn set_event_handle(&mut self, event: &Event) -> Result<(), ClientError> {
        unsafe { self.client.SetEventHandle(event.raw_handle()) }.map_err(client_error)
    }

    fn start(&mut self) -> Result<(), ClientError> {
        unsafe { self.client.Start() }.map_err(client_error)
    }

    fn stop(&mut self) -> Result<(), ClientError> {
        unsafe { self.client.Stop() }.map_err(client_error)
    }

    fn current_padding(&self) -> Result<FrameCount, ClientError> {
        unsafe { self.client.GetCurrentPadding() }.map_err(client_error)
    }

    fn capture_service(&mut self) -> Result<Box<dyn CaptureClient>, ClientError> {
        self.require_flow(DataFlow::Capture)?;
        let client = unsafe { self.client.GetService::<Audio::IAudioCaptureClient>() }
            .map_err(client_error)?;
        Ok(Box::new(WasapiCapture { client }))
    }

    fn render_service(&mut self) -> Result<Box<dyn RenderClient>, ClientError> {
        self.require_flow(DataFlow::Render)?;
        let client = unsafe { self.client.GetService::<Audio::IAudioRenderClient>() }
            .map_err(client_error)?;
        Ok(Box::new(WasapiRender { client }))
    }
}

struct WasapiCapture {
    client: Audio::IAudioCaptureClient,
}

unsafe impl Send for WasapiCapture {}

// The engine owns the packet between GetBuffer and ReleaseBuffer, during which the audio engine
// keeps the memory untouched.
unsafe impl CaptureClient for WasapiCapture {
    fn get_buffer(&mut self) -> Result<Option<RawCapture>, ClientError> {
        unsafe {
            if self.client.GetNextPacketSize().map_err(client_error)? == 0 {
                return Ok(None);
            }
            let mut data = ptr::null_mut();
            let mut frames = 0;
            let mut flags = 0;
            self.client
                .GetBuffer(&mut data, &mut frames, &mut flags, None, None)
                .map_err(client_error)?;
            if frames == 0 {
                self.client.ReleaseBuffer(0).map_err(client_error)?;
                return Ok(None);
            }
            Ok(Some(RawCapture {
                data: data as *const u8,
                frames,
                flags: BufferFlags(flags),
            }))
        }
    }

    fn release_buffer(&mut self, frames: FrameCount) -> Result<(), ClientError> {
        unsafe { self.client.ReleaseBuffer(frames) }.map_err(client_error)
    }
}

struct WasapiRender {
    client: Audio::IAudioRenderClient,
}

unsafe impl Send for WasapiRender {}

unsafe impl RenderClient for WasapiRender {
    fn get_buffer(&mut self, frames: FrameCount) -> Result<*mut u8, ClientError> {
        unsafe { self.client.GetBuffer(frames) }.map_err(client_error)
    }

    fn release_buffer(&mut self, frames: FrameCount, flags: BufferFlags) -> Result<(), ClientError> {
        unsafe { self.client.ReleaseBuffer(frames, flags.0) }.map_err(client_error)
    }
}
