//! The Windows backend, over the WASAPI device enumerator and audio clients.

use std::io::Error as IoError;

use windows::core::HRESULT;
use windows::Win32::Foundation::E_OUTOFMEMORY;
use windows::Win32::Media::Audio;

use crate::{BackendSpecificError, ClientError};

mod client;
mod com;
mod device;
mod format;
mod mmcss;

pub use self::device::WasapiBackend;
pub use self::mmcss::Mmcss;

impl From<windows::core::Error> for BackendSpecificError {
    fn from(error: windows::core::Error) -> Self {
        BackendSpecificError::new(IoError::from(error).to_string())
    }
}

fn client_error(error: windows::core::Error) -> ClientError {
    client_error_code(error.code()).unwrap_or_else(|| ClientError::BackendSpecific(error.into()))
}

fn client_error_code(code: HRESULT) -> Option<ClientError> {
    Some(match code {
        Audio::AUDCLNT_E_DEVICE_INVALIDATED => ClientError::DeviceInvalidated,
        Audio::AUDCLNT_E_DEVICE_IN_USE => ClientError::DeviceInUse,
        Audio::AUDCLNT_E_UNSUPPORTED_FORMAT => ClientError::UnsupportedFormat,
        Audio::AUDCLNT_E_BUFFER_SIZE_NOT_ALIGNED => ClientError::BufferSizeNotAligned,
        Audio::AUDCLNT_E_BUFFER_SIZE_ERROR => ClientError::BufferSizeError,
        Audio::AUDCLNT_E_BUFFER_TOO_LARGE => ClientError::BufferTooLarge,
        Audio::AUDCLNT_E_NOT_INITIALIZED => ClientError::NotInitialized,
        Audio::AUDCLNT_E_ALREADY_INITIALIZED => ClientError::AlreadyInitialized,
        Audio::AUDCLNT_E_WRONG_ENDPOINT_TYPE => ClientError::WrongEndpointType,
        E_OUTOFMEMORY => ClientError::OutOfMemory,
        _ => return None,
    })
}
