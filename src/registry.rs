//! The device table, built once when a host connects.

use std::fmt;
use std::sync::Arc;

use crate::traits::{AudioBackend, DevicePeriod, DeviceService, Endpoint};
use crate::timing::ReferenceTime;
use crate::{
    ClientError, DataFlow, DeviceError, DeviceIndex, DeviceInfo, DeviceState, EnumerationError,
    FormFactor, WaveFormat,
};

/// Static capabilities of one enumerated endpoint.
///
/// Probed once during enumeration and never refreshed. A stream opened on the device later
/// activates its own client, so a device that changed in the meantime fails at open time rather
/// than here.
pub struct DeviceDescriptor {
    pub(crate) endpoint: Arc<dyn Endpoint>,
    id: String,
    name: String,
    state: DeviceState,
    flow: DataFlow,
    period: DevicePeriod,
    default_format: WaveFormat,
    form_factor: FormFactor,
}

impl DeviceDescriptor {
    fn probe(endpoint: Arc<dyn Endpoint>) -> Result<DeviceDescriptor, ClientError> {
        let id = endpoint.id()?;
        let name = endpoint.friendly_name()?;
        let flow = endpoint.data_flow()?;
        let period = endpoint.device_period()?;
        let default_format = endpoint.default_format()?;
        Ok(DeviceDescriptor {
            state: endpoint.state(),
            form_factor: endpoint.form_factor(),
            endpoint,
            id,
            name,
            flow,
            period,
            default_format,
        })
    }

    /// Stable endpoint identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn data_flow(&self) -> DataFlow {
        self.flow
    }

    pub fn default_period(&self) -> ReferenceTime {
        self.period.default
    }

    pub fn minimum_period(&self) -> ReferenceTime {
        self.period.minimum
    }

    pub(crate) fn period(&self) -> DevicePeriod {
        self.period
    }

    pub fn default_format(&self) -> &WaveFormat {
        &self.default_format
    }

    pub fn form_factor(&self) -> FormFactor {
        self.form_factor
    }
}

impl fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("flow", &self.flow)
            .field("period", &self.period)
            .field("default_format", &self.default_format)
            .field("form_factor", &self.form_factor)
            .finish()
    }
}

pub(crate) struct DeviceRegistry {
    // Declared before the service so every endpoint is released while the service still holds
    // the platform state it was created under.
    devices: Vec<DeviceDescriptor>,
    default_render: Option<DeviceIndex>,
    default_capture: Option<DeviceIndex>,
    _service: Box<dyn DeviceService>,
}

impl DeviceRegistry {
    /// Connects to the device service and probes every active endpoint.
    pub(crate) fn enumerate(backend: &dyn AudioBackend) -> Result<DeviceRegistry, EnumerationError> {
        let service = backend.connect()?;
        let endpoints = service.endpoints()?;

        let mut devices = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if endpoint.state() != DeviceState::Active {
                continue;
            }
            match DeviceDescriptor::probe(endpoint) {
                Ok(device) => {
                    log::debug!(
                        "found {} device {:?}: default period {} ms, minimum {} ms, {}",
                        device.flow,
                        device.name,
                        device.period.default.as_secs_f64() * 1000.0,
                        device.period.minimum.as_secs_f64() * 1000.0,
                        device.default_format
                    );
                    devices.push(device);
                }
                Err(err) => log::warn!("skipping audio endpoint that failed to probe: {err}"),
            }
        }

        let default_index = |flow: DataFlow| -> Option<DeviceIndex> {
            let id = match service.default_endpoint_id(flow) {
                Ok(id) => id?,
                Err(err) => {
                    log::warn!("failed to query the default {flow} endpoint: {err}");
                    return None;
                }
            };
            devices.iter().position(|d| d.flow == flow && d.id == id)
        };
        let default_render = default_index(DataFlow::Render);
        let default_capture = default_index(DataFlow::Capture);

        log::debug!(
            "{} enumerated {} devices (default render {:?}, default capture {:?})",
            backend.name(),
            devices.len(),
            default_render,
            default_capture
        );

        Ok(DeviceRegistry {
            devices,
            default_render,
            default_capture,
            _service: service,
        })
    }

    pub(crate) fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub(crate) fn device(&self, index: DeviceIndex) -> Result<&DeviceDescriptor, DeviceError> {
        self.devices
            .get(index)
            .ok_or(DeviceError::InvalidDevice(index))
    }

    pub(crate) fn default_device(&self, flow: DataFlow) -> Option<DeviceIndex> {
        match flow {
            DataFlow::Render => self.default_render,
            DataFlow::Capture => self.default_capture,
        }
    }

    pub(crate) fn info(&self, index: DeviceIndex) -> Result<DeviceInfo, DeviceError> {
        let device = self.device(index)?;
        Ok(DeviceInfo {
            name: device.name.clone(),
            id: device.id.clone(),
            data_flow: device.flow,
            form_factor: device.form_factor,
            max_channels: device.default_format.channels,
            default_sample_rate: device.default_format.sample_rate,
            default_low_latency: device.period.minimum.as_duration(),
            default_high_latency: device.period.default.as_duration(),
            is_default: self.default_device(device.flow) == Some(index),
        })
    }
}
