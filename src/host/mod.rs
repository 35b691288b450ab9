//! The entry point of the engine and its backends.
//!
//! A [`Host`] connects to one [`AudioBackend`], enumerates its endpoints once and opens streams on
//! them. [`wasapi`] is the real backend on Windows. [`simulated`] models devices in-process and
//! runs everywhere.

use std::fmt;
use std::sync::Arc;

use crate::build::{self, build_stream};
use crate::negotiate::negotiate;
use crate::priority;
use crate::registry::{DeviceDescriptor, DeviceRegistry};
use crate::stream::{Stream, StreamMode};
use crate::traits::{AudioBackend, RealtimeScheduler};
use crate::{
    BuildStreamError, DataFlow, DeviceError, DeviceIndex, DeviceInfo, Direction,
    EnumerationError, FormFactor, FormatRequest, NegotiatedFormat, ShareMode, StreamConfig,
    WaveFormat,
};

pub mod simulated;
#[cfg(windows)]
pub mod wasapi;

/// An enumerated audio system.
///
/// The device table is built when the host is created and never refreshed. Create a new host to
/// see devices that appeared since.
pub struct Host {
    backend_name: &'static str,
    registry: DeviceRegistry,
    scheduler: Arc<dyn RealtimeScheduler>,
}

impl Host {
    /// Connects to the platform's audio service.
    #[cfg(windows)]
    pub fn new() -> Result<Host, EnumerationError> {
        Host::with_backend(wasapi::WasapiBackend::new())
    }

    /// Connects to the platform's audio service.
    ///
    /// There is none on this platform. Use [`Host::with_backend`].
    #[cfg(not(windows))]
    pub fn new() -> Result<Host, EnumerationError> {
        Err(EnumerationError::HostUnavailable)
    }

    /// Connects to `backend` and enumerates its devices.
    pub fn with_backend<B: AudioBackend>(backend: B) -> Result<Host, EnumerationError> {
        let registry = DeviceRegistry::enumerate(&backend)?;
        Ok(Host {
            backend_name: backend.name(),
            registry,
            scheduler: priority::shared_scheduler(),
        })
    }

    /// Replaces the real-time scheduler used by the delivery threads of streams opened later.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn RealtimeScheduler>) -> Host {
        self.scheduler = scheduler;
        self
    }

    /// Name of the backend the host is connected to.
    pub fn name(&self) -> &'static str {
        self.backend_name
    }

    /// Every usable device, indexed by [`DeviceIndex`].
    pub fn devices(&self) -> &[DeviceDescriptor] {
        self.registry.devices()
    }

    pub fn device(&self, index: DeviceIndex) -> Result<&DeviceDescriptor, DeviceError> {
        self.registry.device(index)
    }

    pub fn default_input_device(&self) -> Option<DeviceIndex> {
        self.registry.default_device(DataFlow::Capture)
    }

    pub fn default_output_device(&self) -> Option<DeviceIndex> {
        self.registry.default_device(DataFlow::Render)
    }

    /// The format the device declares as its default.
    pub fn default_format_for_device(&self, index: DeviceIndex) -> Result<WaveFormat, DeviceError> {
        Ok(*self.registry.device(index)?.default_format())
    }

    pub fn device_form_factor(&self, index: DeviceIndex) -> Result<FormFactor, DeviceError> {
        Ok(self.registry.device(index)?.form_factor())
    }

    pub fn device_info(&self, index: DeviceIndex) -> Result<DeviceInfo, DeviceError> {
        self.registry.info(index)
    }

    /// Negotiates `request` with the device without building a stream.
    pub fn negotiate(
        &self,
        index: DeviceIndex,
        request: &FormatRequest,
        share_mode: ShareMode,
    ) -> Result<NegotiatedFormat, BuildStreamError> {
        let device = self
            .registry
            .device(index)
            .map_err(|err| BuildStreamError::InvalidArgument(err.to_string()))?;
        let client = device.endpoint.activate()?;
        Ok(negotiate(&*client, request, share_mode)?)
    }

    /// Checks that every direction of `config` would negotiate a format, without building a
    /// stream.
    pub fn is_format_supported(&self, config: &StreamConfig) -> Result<(), BuildStreamError> {
        build::validate(config)?;
        for direction in [Direction::Input, Direction::Output] {
            let Some(params) = config.parameters(direction) else {
                continue;
            };
            build::device_for(&self.registry, direction, params)?;
            self.negotiate(
                params.device,
                &params.format_request(config.sample_rate),
                params.options.share_mode(),
            )?;
        }
        Ok(())
    }

    /// Opens a stream. A failed open releases every client it had already initialized.
    pub fn open_stream(
        &self,
        config: StreamConfig,
        mode: StreamMode,
    ) -> Result<Stream, BuildStreamError> {
        let built = build_stream(&self.registry, &config, mode.is_blocking())?;
        Stream::open(built, mode, self.scheduler.clone())
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Host")
            .field("backend", &self.backend_name)
            .field("devices", &self.registry.devices().len())
            .finish()
    }
}
