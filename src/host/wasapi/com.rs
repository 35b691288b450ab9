//! COM apartment bookkeeping.

use std::io::Error as IoError;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};

use windows::core::HRESULT;
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::{CoInitializeEx, CoUninitialize, COINIT_APARTMENTTHREADED};

use crate::BackendSpecificError;

// STA by default: some hosts (UI toolkits, ASIO drivers) insist on it. RPC_E_CHANGED_MODE means
// another library already chose MTA for this thread, which works as well through marshalling.
fn enter_apartment() -> Result<HRESULT, BackendSpecificError> {
    let result = unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) };
    if result.is_ok() || result == RPC_E_CHANGED_MODE {
        Ok(result)
    } else {
        Err(BackendSpecificError::new(format!(
            "failed to initialize COM: {}",
            IoError::from_raw_os_error(result.0)
        )))
    }
}

thread_local!(static THREAD_APARTMENT: Result<ThreadApartment, BackendSpecificError> =
    enter_apartment().map(|result| ThreadApartment {
        result,
        _not_send: PhantomData,
    }));

/// COM for the rest of the current thread's life.
struct ThreadApartment {
    result: HRESULT,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for ThreadApartment {
    fn drop(&mut self) {
        if self.result.is_ok() {
            unsafe { CoUninitialize() };
        }
    }
}

/// Ensures that COM is initialized in this thread until the thread exits.
pub(super) fn com_initialized() -> Result<(), BackendSpecificError> {
    THREAD_APARTMENT.with(|apartment| apartment.as_ref().map(|_| ()).map_err(Clone::clone))
}

/// COM initialized by a connection to the device service.
///
/// Uninitialized on drop, but only if this scope's own call initialized it and only on the thread
/// that did.
pub(super) struct ComScope {
    acquired: bool,
    thread: ThreadId,
}

impl ComScope {
    pub(super) fn enter() -> Result<ComScope, BackendSpecificError> {
        let result = enter_apartment()?;
        Ok(ComScope {
            acquired: result.is_ok(),
            thread: thread::current().id(),
        })
    }
}

impl Drop for ComScope {
    fn drop(&mut self) {
        if !self.acquired {
            return;
        }
        if thread::current().id() == self.thread {
            unsafe { CoUninitialize() };
        } else {
            log::warn!("device service released on another thread, its COM apartment stays open");
        }
    }
}
