use std::time::Duration;

use thiserror::Error;

use crate::{DeviceIndex, Direction, FrameCount};

/// The requested host, although supported on this platform, is unavailable.
#[derive(Clone, Debug, Error)]
#[error("the requested host is unavailable")]
pub struct HostUnavailable;

/// Some error has occurred that is specific to the backend from which it was produced.
///
/// This error is often used as a catch-all in cases where:
///
/// - It is unclear exactly what error might be produced by the backend API.
/// - It does not make sense to add a variant to the enclosing error type.
/// - No error was expected to occur at all, but we return an error to avoid the possibility of a
///   `panic!` caused by some unforeseen or unknown reason.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("a backend-specific error has occurred: {description}")]
pub struct BackendSpecificError {
    pub description: String,
}

impl BackendSpecificError {
    pub fn new(description: impl Into<String>) -> Self {
        BackendSpecificError {
            description: description.into(),
        }
    }
}

/// The platform device service could not be reached. No audio device is usable.
#[derive(Clone, Debug, Error)]
pub enum EnumerationError {
    /// There is no device service on this platform.
    #[error("the audio device service is not available on this platform")]
    HostUnavailable,
    /// See the [`BackendSpecificError`] docs for more information about this error variant.
    #[error("{0}")]
    BackendSpecific(#[from] BackendSpecificError),
}

impl From<HostUnavailable> for EnumerationError {
    fn from(_: HostUnavailable) -> Self {
        EnumerationError::HostUnavailable
    }
}

/// Error returned by queries on an enumerated device.
#[derive(Clone, Debug, Error)]
pub enum DeviceError {
    #[error("there is no device at index {0}")]
    InvalidDevice(DeviceIndex),
    /// The device no longer exists. This can happen if the device is disconnected while the
    /// program is running.
    #[error("the requested device is no longer available")]
    DeviceUnavailable,
    #[error("{0}")]
    BackendSpecific(#[from] BackendSpecificError),
}

/// A failure reported by a hardware audio client or by the endpoint that activates it.
///
/// Backends translate their native status codes into this type once, at the boundary, so the
/// rest of the engine never sees a platform error code.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("the audio endpoint has been removed or reconfigured")]
    DeviceInvalidated,
    #[error("the audio endpoint is in use by another exclusive-mode stream")]
    DeviceInUse,
    #[error("the wire format is not supported by the audio endpoint")]
    UnsupportedFormat,
    #[error("the requested buffer size is not aligned to the hardware packet size")]
    BufferSizeNotAligned,
    #[error("the requested buffer duration is not valid for this endpoint")]
    BufferSizeError,
    #[error("the requested number of frames exceeds the free buffer space")]
    BufferTooLarge,
    #[error("the endpoint could not allocate a buffer of the requested duration")]
    OutOfMemory,
    #[error("the audio client has not been initialized")]
    NotInitialized,
    #[error("the audio client is already initialized")]
    AlreadyInitialized,
    #[error("the requested service does not match the endpoint data flow")]
    WrongEndpointType,
    #[error("{0}")]
    BackendSpecific(#[from] BackendSpecificError),
}

impl ClientError {
    /// True if the error means the device itself is gone or held by someone else.
    pub fn is_device_unavailable(&self) -> bool {
        matches!(
            self,
            ClientError::DeviceInvalidated | ClientError::DeviceInUse
        )
    }
}

/// Why format negotiation turned a request down.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error("the device suggested {suggested} Hz instead of the requested {requested} Hz")]
    SampleRateChanged { requested: u32, suggested: u32 },
    #[error("the device suggested {suggested} channels instead of the requested {requested}")]
    ChannelCountChanged { requested: u16, suggested: u16 },
    #[error("the device accepted none of the offered wire formats")]
    NoAcceptableFormat,
    #[error("the request cannot be expressed as a wire format: {0}")]
    InvalidRequest(&'static str),
}

/// Error returned by format negotiation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NegotiateError {
    #[error("format rejected: {0}")]
    Rejected(#[from] RejectReason),
    #[error("{0}")]
    Client(#[from] ClientError),
}

/// Error that can happen when opening a stream.
#[derive(Clone, Debug, Error)]
pub enum BuildStreamError {
    /// Negotiation exhausted its fallback ladder.
    #[error("the requested stream format is not supported by the device: {0}")]
    UnsupportedFormat(RejectReason),
    /// The device is busy, in use by an exclusive stream, or no longer exists.
    #[error("the requested device is busy or no longer available")]
    DeviceUnavailable,
    /// The single exclusive-mode realignment retry failed as well.
    #[error("the buffer alignment retry failed: {0}")]
    AlignmentRetryExhausted(ClientError),
    /// Both directions of an event-driven stream must run on the same cycle.
    #[error(
        "input and output cycles differ ({input_frames} vs {output_frames} frames per cycle)"
    )]
    PeriodMismatch {
        input_frames: FrameCount,
        output_frames: FrameCount,
    },
    #[error("invalid stream configuration: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    BackendSpecific(#[from] BackendSpecificError),
}

impl From<ClientError> for BuildStreamError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::DeviceInvalidated | ClientError::DeviceInUse => {
                BuildStreamError::DeviceUnavailable
            }
            ClientError::UnsupportedFormat => {
                BuildStreamError::UnsupportedFormat(RejectReason::NoAcceptableFormat)
            }
            ClientError::BackendSpecific(err) => BuildStreamError::BackendSpecific(err),
            other => BuildStreamError::BackendSpecific(BackendSpecificError::new(other.to_string())),
        }
    }
}

impl From<NegotiateError> for BuildStreamError {
    fn from(err: NegotiateError) -> Self {
        match err {
            NegotiateError::Rejected(reason) => BuildStreamError::UnsupportedFormat(reason),
            NegotiateError::Client(err) => err.into(),
        }
    }
}

/// Errors that might occur while a stream is controlled or used.
#[derive(Clone, Debug, Error)]
pub enum StreamError {
    /// A blocking transfer was requested before the stream was started.
    #[error("the stream is not running")]
    StreamNotRunning,
    /// The stream was opened without the direction a transfer asked for.
    #[error("the stream has no {0} direction")]
    NoSuchDirection(Direction),
    /// Blocking transfers were requested on a stream opened with callbacks.
    #[error("the stream was opened in callback mode and does not support blocking transfers")]
    NotBlocking,
    /// The event-driven engine waited this long without any buffer-ready signal.
    #[error("the device did not signal a buffer for {0:?}")]
    DeviceStall(Duration),
    /// The device no longer exists. This can happen if the device is disconnected while the
    /// program is running.
    #[error("the requested device is no longer available")]
    DeviceUnavailable,
    #[error("the stream has been closed")]
    StreamClosed,
    /// The delivery thread did not report a running state in time.
    #[error("the delivery thread did not start in time")]
    StartTimeout,
    #[error("{0}")]
    BackendSpecific(#[from] BackendSpecificError),
}

impl From<ClientError> for StreamError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::DeviceInvalidated | ClientError::DeviceInUse => {
                StreamError::DeviceUnavailable
            }
            ClientError::BackendSpecific(err) => StreamError::BackendSpecific(err),
            other => StreamError::BackendSpecific(BackendSpecificError::new(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_clients_map_to_device_unavailable() {
        assert!(matches!(
            BuildStreamError::from(ClientError::DeviceInUse),
            BuildStreamError::DeviceUnavailable
        ));
        assert!(matches!(
            StreamError::from(ClientError::DeviceInvalidated),
            StreamError::DeviceUnavailable
        ));
    }

    #[test]
    fn rejection_keeps_its_reason() {
        let reason = RejectReason::SampleRateChanged {
            requested: 44_100,
            suggested: 48_000,
        };
        match BuildStreamError::from(NegotiateError::Rejected(reason.clone())) {
            BuildStreamError::UnsupportedFormat(r) => assert_eq!(r, reason),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn other_client_errors_become_backend_specific() {
        match BuildStreamError::from(ClientError::OutOfMemory) {
            BuildStreamError::BackendSpecific(err) => {
                assert!(err.description.contains("allocate"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
