//! Waitable events used between the caller, the delivery thread and the hardware.
//!
//! An [`Event`] is either auto-reset (a successful wait consumes the signal) or manual-reset
//! (the signal stays until [`Event::reset`]). On Windows an event is a kernel event object so it
//! can be handed to the audio client as its buffer-ready handle. Everywhere else it is built from
//! a mutex and condition variable.

#[cfg(any(windows, test))]
use std::time::Duration;

#[cfg(not(windows))]
mod condvar;
#[cfg(windows)]
mod win32;

#[cfg(not(windows))]
pub use self::condvar::Event;
#[cfg(windows)]
pub use self::win32::Event;

/// Outcome of waiting on a set of events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    /// The event at this index in the wait set was signaled.
    One(usize),
    /// Every event in the wait set was signaled.
    All,
    TimedOut,
}

/// Converts a wait timeout to whole milliseconds, rounding up so short waits do not spin.
#[cfg(any(windows, test))]
pub(crate) fn timeout_millis(timeout: Duration) -> u32 {
    let millis = timeout.as_micros().div_ceil(1000);
    millis.min(u128::from(u32::MAX - 1)) as u32
}
