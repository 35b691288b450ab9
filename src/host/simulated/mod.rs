//! An in-process audio backend.
//!
//! Devices are described with [`DeviceSpec`] and run on a virtual hardware clock: every device
//! period a started render client plays a period of queued frames and a started capture client
//! captures one packet, then the buffer-ready event of an event-driven client is signaled.
//! [`Faults`] make a device misbehave the ways real hardware does, and [`DeviceStats`] records
//! what the engine asked of it.
//!
//! ```
//! use wasapi_engine::host::simulated::{DeviceSpec, SimulatedBackend};
//! use wasapi_engine::Host;
//!
//! let backend = SimulatedBackend::new()
//!     .with_device(DeviceSpec::render("spk", "Speakers").as_default())
//!     .with_device(DeviceSpec::capture("mic", "Microphone").as_default());
//! let host = Host::with_backend(backend.clone())?;
//! assert_eq!(host.default_output_device(), Some(0));
//! # Ok::<(), wasapi_engine::EnumerationError>(())
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::traits::{AudioBackend, DeviceService, Endpoint};
use crate::{BackendSpecificError, DataFlow, EnumerationError};

mod client;
mod device;

pub use self::device::{DeviceSpec, DeviceStats, Faults, InitRecord, Transfer};

use self::device::{SimulatedDevice, SimulatedEndpoint};

#[derive(Default)]
struct BackendState {
    devices: Mutex<Vec<Arc<SimulatedDevice>>>,
    unreachable: AtomicBool,
    connections: AtomicUsize,
    disconnections: AtomicUsize,
}

/// A backend whose devices exist only in this process.
///
/// Clones share their devices and counters, so a test can hand one clone to a [`Host`](crate::Host)
/// and inspect the other.
#[derive(Clone, Default)]
pub struct SimulatedBackend {
    state: Arc<BackendState>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A default speaker and a default microphone.
    pub fn with_default_devices() -> Self {
        SimulatedBackend::new()
            .with_device(DeviceSpec::render("speakers", "Simulated Speakers").as_default())
            .with_device(DeviceSpec::capture("microphone", "Simulated Microphone").as_default())
    }

    pub fn with_device(self, spec: DeviceSpec) -> Self {
        self.add_device(spec);
        self
    }

    /// Adds a device. Hosts created earlier do not see it.
    pub fn add_device(&self, spec: DeviceSpec) {
        self.state
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(SimulatedDevice::new(spec)));
    }

    /// Makes later connections fail, as if the device service were down.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::Release);
    }

    /// Removes the device with identifier `id` while it may be in use. Clients on it fail from now
    /// on with [`ClientError::DeviceInvalidated`](crate::ClientError::DeviceInvalidated).
    pub fn unplug(&self, id: &str) -> bool {
        let devices = self.state.devices.lock().unwrap_or_else(PoisonError::into_inner);
        match devices.iter().find(|device| device.spec.id == id) {
            Some(device) => {
                device.remove();
                true
            }
            None => false,
        }
    }

    /// What the engine did to the device with identifier `id` so far.
    pub fn stats(&self, id: &str) -> Option<DeviceStats> {
        self.state
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|device| device.spec.id == id)
            .map(|device| device.stats().clone())
    }

    /// Number of successful connections to the device service.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::Acquire)
    }

    /// Number of device service connections that have been released.
    pub fn disconnections(&self) -> usize {
        self.state.disconnections.load(Ordering::Acquire)
    }
}

impl AudioBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn connect(&self) -> Result<Box<dyn DeviceService>, EnumerationError> {
        if self.state.unreachable.load(Ordering::Acquire) {
            let err = BackendSpecificError::new("the simulated device service is unreachable");
            return Err(err.into());
        }
        self.state.connections.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(SimulatedService {
            state: self.state.clone(),
        }))
    }
}

struct SimulatedService {
    state: Arc<BackendState>,
}

impl DeviceService for SimulatedService {
    fn endpoints(&self) -> Result<Vec<Arc<dyn Endpoint>>, BackendSpecificError> {
        let devices = self.state.devices.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(devices
            .iter()
            .map(|device| Arc::new(SimulatedEndpoint(device.clone())) as Arc<dyn Endpoint>)
            .collect())
    }

    fn default_endpoint_id(&self, flow: DataFlow) -> Result<Option<String>, BackendSpecificError> {
        let devices = self.state.devices.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(devices
            .iter()
            .find(|device| device.spec.flow == flow && device.spec.is_default)
            .map(|device| device.spec.id.clone()))
    }
}

impl Drop for SimulatedService {
    fn drop(&mut self) {
        self.state.disconnections.fetch_add(1, Ordering::AcqRel);
    }
}
