use std::ffi::OsString;
use std::os::windows::ffi::OsStringExt;
use std::slice;
use std::sync::Arc;

use windows::core::{Interface, GUID};
use windows::Win32::Devices::Properties;
use windows::Win32::Foundation::E_NOTFOUND;
use windows::Win32::Media::Audio;
use windows::Win32::System::Com::{self, StructuredStorage, STGM_READ};
use windows::Win32::System::Variant::{VT_LPWSTR, VT_UI4};

use super::client::WasapiClient;
use super::com::{self as apartment, ComScope};
use super::format::{from_native, WaveFormatExPtr};
use super::client_error;
use crate::timing::ReferenceTime;
use crate::traits::{AudioBackend, AudioClient, DevicePeriod, DeviceService, Endpoint};
use crate::{
    BackendSpecificError, ClientError, DataFlow, DeviceState, EnumerationError, FormFactor,
    WaveFormat,
};

// PKEY_AudioEndpoint_FormFactor
const FORM_FACTOR_KEY: Properties::DEVPROPKEY = Properties::DEVPROPKEY {
    fmtid: GUID::from_u128(0x1da5d803_d492_4edd_8c23_e0c0ffee7f0e),
    pid: 0,
};

/// The WASAPI device service of the running Windows session.
#[derive(Clone, Copy, Debug, Default)]
pub struct WasapiBackend;

impl WasapiBackend {
    pub fn new() -> Self {
        WasapiBackend
    }
}

impl AudioBackend for WasapiBackend {
    fn name(&self) -> &'static str {
        "wasapi"
    }

    fn connect(&self) -> Result<Box<dyn DeviceService>, EnumerationError> {
        let com = ComScope::enter()?;
        let enumerator: Audio::IMMDeviceEnumerator =
            unsafe { Com::CoCreateInstance(&Audio::MMDeviceEnumerator, None, Com::CLSCTX_ALL) }
                .map_err(BackendSpecificError::from)?;
        Ok(Box::new(WasapiService {
            enumerator,
            _com: com,
        }))
    }
}

struct WasapiService {
    enumerator: Audio::IMMDeviceEnumerator,
    // Dropped after the enumerator.
    _com: ComScope,
}

// The enumerator is free-threaded.
unsafe impl Send for WasapiService {}
unsafe impl Sync for WasapiService {}

impl DeviceService for WasapiService {
    fn endpoints(&self) -> Result<Vec<Arc<dyn Endpoint>>, BackendSpecificError> {
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(Audio::eAll, Audio::DEVICE_STATE_ACTIVE)?;
            let count = collection.GetCount()?;
            let mut endpoints = Vec::with_capacity(count as usize);
            for index in 0..count {
                let device = collection.Item(index)?;
                endpoints.push(Arc::new(WasapiEndpoint { device }) as Arc<dyn Endpoint>);
            }
            Ok(endpoints)
        }
    }

    fn default_endpoint_id(&self, flow: DataFlow) -> Result<Option<String>, BackendSpecificError> {
        let flow = match flow {
            DataFlow::Render => Audio::eRender,
            DataFlow::Capture => Audio::eCapture,
        };
        let device = match unsafe { self.enumerator.GetDefaultAudioEndpoint(flow, Audio::eConsole) }
        {
            Ok(device) => device,
            Err(err) if err.code() == E_NOTFOUND => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        WasapiEndpoint { device }.id().map(Some)
    }
}

pub(super) struct WasapiEndpoint {
    device: Audio::IMMDevice,
}

unsafe impl Send for WasapiEndpoint {}
unsafe impl Sync for WasapiEndpoint {}

impl WasapiEndpoint {
    fn audio_client(&self) -> Result<Audio::IAudioClient, ClientError> {
        apartment::com_initialized()?;
        unsafe { self.device.Activate::<Audio::IAudioClient>(Com::CLSCTX_ALL, None) }
            .map_err(client_error)
    }

    /// Reads a property of the endpoint, passing the raw variant to `read`.
    fn property<T>(
        &self,
        key: &Properties::DEVPROPKEY,
        read: impl FnOnce(&StructuredStorage::PROPVARIANT) -> Result<T, BackendSpecificError>,
    ) -> Result<T, BackendSpecificError> {
        unsafe {
            let store = self.device.OpenPropertyStore(STGM_READ)?;
            let mut value = store.GetValue(key as *const _ as *const _)?;
            let result = read(&value);
            StructuredStorage::PropVariantClear(&mut value).ok();
            result
        }
    }
}

impl Endpoint for WasapiEndpoint {
    fn id(&self) -> Result<String, BackendSpecificError> {
        unsafe {
            let id = self.device.GetId()?;
            let result = id.to_string().map_err(|err| {
                BackendSpecificError::new(format!("endpoint identifier is not UTF-16: {err}"))
            });
            Com::CoTaskMemFree(Some(id.0 as *const _));
            result
        }
    }

    fn friendly_name(&self) -> Result<String, BackendSpecificError> {
        self.property(&Properties::DEVPKEY_Device_FriendlyName, |value| unsafe {
            let variant = &value.as_raw().Anonymous.Anonymous;
            if variant.vt != VT_LPWSTR.0 {
                return Err(BackendSpecificError::new(format!(
                    "property store produced invalid data: {:?}",
                    variant.vt
                )));
            }
            let utf16 = *(&variant.Anonymous as *const _ as *const *const u16);
            if utf16.is_null() {
                return Ok(String::new());
            }
            let mut len = 0;
            while *utf16.add(len) != 0 {
                len += 1;
            }
            let name = OsString::from_wide(slice::from_raw_parts(utf16, len));
            Ok(name.to_string_lossy().into_owned())
        })
    }

    fn state(&self) -> DeviceState {
        match unsafe { self.device.GetState() } {
            Ok(Audio::DEVICE_STATE_ACTIVE) => DeviceState::Active,
            Ok(Audio::DEVICE_STATE_DISABLED) => DeviceState::Disabled,
            Ok(Audio::DEVICE_STATE_UNPLUGGED) => DeviceState::Unplugged,
            _ => DeviceState::NotPresent,
        }
    }

    fn data_flow(&self) -> Result<DataFlow, BackendSpecificError> {
        let flow = unsafe { self.device.cast::<Audio::IMMEndpoint>()?.GetDataFlow()? };
        if flow == Audio::eRender {
            Ok(DataFlow::Render)
        } else if flow == Audio::eCapture {
            Ok(DataFlow::Capture)
        } else {
            Err(BackendSpecificError::new(format!("unexpected data flow {}", flow.0)))
        }
    }

    fn form_factor(&self) -> FormFactor {
        let raw = self.property(&FORM_FACTOR_KEY, |value| unsafe {
            let variant = &value.as_raw().Anonymous.Anonymous;
            if variant.vt != VT_UI4.0 {
                return Ok(None);
            }
            Ok(Some(*(&variant.Anonymous as *const _ as *const u32)))
        });
        match raw {
            Ok(Some(value)) => FormFactor::from_raw(value),
            Ok(None) => FormFactor::Unknown,
            Err(err) => {
                log::debug!("form factor unavailable: {err}");
                FormFactor::Unknown
            }
        }
    }

    fn default_format(&self) -> Result<WaveFormat, ClientError> {
        let client = self.audio_client()?;
        unsafe {
            let mix = WaveFormatExPtr(client.GetMixFormat().map_err(client_error)?);
            from_native(mix.0).ok_or(ClientError::UnsupportedFormat)
        }
    }

    fn device_period(&self) -> Result<DevicePeriod, ClientError> {
        let client = self.audio_client()?;
        let (mut default, mut minimum) = (0, 0);
        unsafe { client.GetDevicePeriod(Some(&mut default), Some(&mut minimum)) }
            .map_err(client_error)?;
        Ok(DevicePeriod {
            default: ReferenceTime(default),
            minimum: ReferenceTime(minimum),
        })
    }

    fn activate(&self) -> Result<Box<dyn AudioClient>, ClientError> {
        let flow = self.data_flow()?;
        Ok(Box::new(WasapiClient::new(self.audio_client()?, flow)))
    }
}
