use std::sync::Arc;
use std::time::Duration;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Threading::{
    CreateEventW, ResetEvent, SetEvent, WaitForMultipleObjects, WaitForSingleObject,
};

use super::{timeout_millis, Wake};
use crate::BackendSpecificError;

/// A kernel event object. Cloning gives another handle to the same event.
#[derive(Clone)]
pub struct Event {
    handle: Arc<OwnedHandle>,
}

struct OwnedHandle(HANDLE);

// Kernel event handles may be used from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

impl Event {
    pub fn new(manual_reset: bool, initial_state: bool) -> Result<Event, BackendSpecificError> {
        let handle = unsafe { CreateEventW(None, manual_reset, initial_state, PCWSTR::null()) }
            .map_err(|e| BackendSpecificError::new(format!("failed to create event: {e}")))?;
        Ok(Event {
            handle: Arc::new(OwnedHandle(handle)),
        })
    }

    /// The raw handle, for registration with the audio client.
    pub(crate) fn raw_handle(&self) -> HANDLE {
        self.handle.0
    }

    pub fn set(&self) -> Result<(), BackendSpecificError> {
        unsafe { SetEvent(self.handle.0) }
            .map_err(|e| BackendSpecificError::new(format!("failed to set event: {e}")))
    }

    pub fn reset(&self) -> Result<(), BackendSpecificError> {
        unsafe { ResetEvent(self.handle.0) }
            .map_err(|e| BackendSpecificError::new(format!("failed to reset event: {e}")))
    }

    /// Peeks at the signal. Only meaningful for manual-reset events, since a zero wait consumes
    /// an auto-reset signal.
    pub fn is_set(&self) -> bool {
        unsafe { WaitForSingleObject(self.handle.0, 0) == WAIT_OBJECT_0 }
    }

    /// Waits for the event, consuming the signal if the event is auto-reset.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, BackendSpecificError> {
        Ok(Event::wait_any(&[self], timeout)? == Wake::One(0))
    }

    pub fn wait_any(events: &[&Event], timeout: Duration) -> Result<Wake, BackendSpecificError> {
        Event::wait(events, false, timeout)
    }

    pub fn wait_all(events: &[&Event], timeout: Duration) -> Result<Wake, BackendSpecificError> {
        Event::wait(events, true, timeout)
    }

    fn wait(events: &[&Event], all: bool, timeout: Duration) -> Result<Wake, BackendSpecificError> {
        let handles: Vec<HANDLE> = events.iter().map(|event| event.handle.0).collect();
        let result = unsafe { WaitForMultipleObjects(&handles, all, timeout_millis(timeout)) };
        if result == WAIT_TIMEOUT {
            return Ok(Wake::TimedOut);
        }
        let index = result.0.wrapping_sub(WAIT_OBJECT_0.0) as usize;
        if index < handles.len() {
            Ok(if all { Wake::All } else { Wake::One(index) })
        } else {
            Err(BackendSpecificError::new(format!(
                "waiting for events failed: {}",
                std::io::Error::last_os_error()
            )))
        }
    }
}
