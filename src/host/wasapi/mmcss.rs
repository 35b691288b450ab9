//! The Multimedia Class Scheduler Service, loaded from `avrt.dll` at runtime.

use std::ffi::c_void;
use std::io::Error as IoError;
use std::mem;

use windows::core::{s, w};
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

use crate::traits::{ElevatedThread, ElevationRequest, RealtimeScheduler};
use crate::BackendSpecificError;

type SetThreadCharacteristics = unsafe extern "system" fn(*const u16, *mut u32) -> *mut c_void;
type RevertThreadCharacteristics = unsafe extern "system" fn(*mut c_void) -> i32;

/// Elevates threads into MMCSS task categories. The library stays loaded until this is dropped.
pub struct Mmcss {
    library: HMODULE,
    set: SetThreadCharacteristics,
    revert: RevertThreadCharacteristics,
}

// The module handle and the entry points are process-wide.
unsafe impl Send for Mmcss {}
unsafe impl Sync for Mmcss {}

impl Mmcss {
    /// Loads `avrt.dll` and resolves the task entry points.
    pub fn load() -> Result<Mmcss, BackendSpecificError> {
        unsafe {
            let library = LoadLibraryW(w!("avrt.dll"))?;
            let set = GetProcAddress(library, s!("AvSetMmThreadCharacteristicsW"));
            let revert = GetProcAddress(library, s!("AvRevertMmThreadCharacteristics"));
            match (set, revert) {
                (Some(set), Some(revert)) => Ok(Mmcss {
                    library,
                    set: mem::transmute::<_, SetThreadCharacteristics>(set),
                    revert: mem::transmute::<_, RevertThreadCharacteristics>(revert),
                }),
                (set, _) => {
                    let _ = FreeLibrary(library);
                    let missing = if set.is_none() {
                        "AvSetMmThreadCharacteristicsW"
                    } else {
                        "AvRevertMmThreadCharacteristics"
                    };
                    Err(BackendSpecificError::new(format!("avrt.dll does not export {missing}")))
                }
            }
        }
    }
}

impl RealtimeScheduler for Mmcss {
    fn elevate(
        &self,
        request: &ElevationRequest,
    ) -> Result<Box<dyn ElevatedThread>, BackendSpecificError> {
        let name = request.priority.task_name().unwrap_or("Audio");
        let wide: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
        let mut task_index = 0u32;
        let handle = unsafe { (self.set)(wide.as_ptr(), &mut task_index) };
        if handle.is_null() {
            let err = IoError::last_os_error();
            return Err(BackendSpecificError::new(format!(
                "failed to join the MMCSS task {name:?}: {err}"
            )));
        }
        log::trace!("joined MMCSS task {name:?} with index {task_index}");
        Ok(Box::new(MmcssTask {
            handle,
            revert: self.revert,
        }))
    }
}

impl Drop for Mmcss {
    fn drop(&mut self) {
        if let Err(err) = unsafe { FreeLibrary(self.library) } {
            log::warn!("failed to unload avrt.dll: {err}");
        }
    }
}

struct MmcssTask {
    handle: *mut c_void,
    revert: RevertThreadCharacteristics,
}

impl ElevatedThread for MmcssTask {
    fn revert(self: Box<Self>) -> Result<(), BackendSpecificError> {
        if unsafe { (self.revert)(self.handle) } == 0 {
            let err = IoError::last_os_error();
            return Err(BackendSpecificError::new(format!(
                "failed to leave the MMCSS task: {err}"
            )));
        }
        Ok(())
    }
}
