//! Real-time scheduling of audio threads.
//!
//! The delivery thread of every stream elevates itself on entry and reverts on exit. Callers that
//! run their own blocking transfers can do the same for their thread with
//! [`boost_current_thread`].
//!
//! The platform scheduler is a process-wide capability: it is created on first use, shared by
//! every stream and boost that holds it, and released when the last holder drops it. On Windows
//! it is MMCSS (loaded from `avrt.dll` at runtime). With the `audio_thread_priority` feature on
//! Linux and the BSDs it is the `audio_thread_priority` crate. Otherwise elevation is a no-op.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::traits::{ElevatedThread, ElevationRequest, RealtimeScheduler};
use crate::{BackendSpecificError, SampleRate};

/// Scheduling category requested for an audio thread.
///
/// The categories are the MMCSS task names. `None` leaves the thread alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ThreadPriority {
    #[default]
    None,
    Audio,
    Capture,
    Distribution,
    Games,
    Playback,
    ProAudio,
    WindowManager,
}

impl ThreadPriority {
    /// The scheduler task name of this category.
    pub fn task_name(self) -> Option<&'static str> {
        match self {
            ThreadPriority::None => None,
            ThreadPriority::Audio => Some("Audio"),
            ThreadPriority::Capture => Some("Capture"),
            ThreadPriority::Distribution => Some("Distribution"),
            ThreadPriority::Games => Some("Games"),
            ThreadPriority::Playback => Some("Playback"),
            ThreadPriority::ProAudio => Some("Pro Audio"),
            ThreadPriority::WindowManager => Some("Window Manager"),
        }
    }

    /// The category a stream gets when the caller does not ask for one.
    pub fn default_for(exclusive: bool) -> ThreadPriority {
        if exclusive {
            ThreadPriority::ProAudio
        } else {
            ThreadPriority::Audio
        }
    }
}

impl fmt::Display for ThreadPriority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.task_name().unwrap_or("None"))
    }
}

/// Elevated scheduling of the current thread.
///
/// Reverted exactly once, either by [`PriorityBoost::revert`] or on drop. The token is not `Send`
/// because elevation must be undone on the thread that asked for it.
#[must_use = "dropping the boost reverts the elevation immediately"]
pub struct PriorityBoost {
    task: Option<Box<dyn ElevatedThread>>,
    priority: ThreadPriority,
    // Keeps the scheduler loaded while the thread is elevated.
    _scheduler: Option<Arc<dyn RealtimeScheduler>>,
    _not_send: PhantomData<*const ()>,
}

impl PriorityBoost {
    fn none() -> Self {
        PriorityBoost {
            task: None,
            priority: ThreadPriority::None,
            _scheduler: None,
            _not_send: PhantomData,
        }
    }

    /// The category this thread runs in, `None` if nothing was applied.
    pub fn priority(&self) -> ThreadPriority {
        self.priority
    }

    pub fn is_elevated(&self) -> bool {
        self.task.is_some()
    }

    /// Returns the thread to normal scheduling.
    pub fn revert(mut self) -> Result<(), BackendSpecificError> {
        self.revert_once()
    }

    fn revert_once(&mut self) -> Result<(), BackendSpecificError> {
        match self.task.take() {
            Some(task) => task.revert(),
            None => Ok(()),
        }
    }
}

impl Drop for PriorityBoost {
    fn drop(&mut self) {
        if let Err(err) = self.revert_once() {
            log::warn!("failed to revert thread priority: {err}");
        }
    }
}

impl fmt::Debug for PriorityBoost {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PriorityBoost")
            .field("priority", &self.priority)
            .field("elevated", &self.is_elevated())
            .finish()
    }
}

/// Elevates the calling thread to `priority` using the process-wide scheduler.
pub fn boost_current_thread(priority: ThreadPriority) -> Result<PriorityBoost, BackendSpecificError> {
    let request = ElevationRequest {
        priority,
        buffer_frames: 0,
        sample_rate: SampleRate(0),
    };
    boost_with(&shared_scheduler(), &request)
}

/// Elevates the calling thread with a specific scheduler.
pub fn boost_with(
    scheduler: &Arc<dyn RealtimeScheduler>,
    request: &ElevationRequest,
) -> Result<PriorityBoost, BackendSpecificError> {
    if request.priority == ThreadPriority::None {
        return Ok(PriorityBoost::none());
    }
    let task = scheduler.elevate(request)?;
    log::debug!("thread elevated to {}", request.priority);
    Ok(PriorityBoost {
        task: Some(task),
        priority: request.priority,
        _scheduler: Some(scheduler.clone()),
        _not_send: PhantomData,
    })
}

static CAPABILITY: Mutex<Option<Weak<dyn RealtimeScheduler>>> = Mutex::new(None);

/// The process-wide scheduler, created on first use and shared until the last holder drops it.
pub fn shared_scheduler() -> Arc<dyn RealtimeScheduler> {
    let mut slot = CAPABILITY.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(scheduler) = slot.as_ref().and_then(Weak::upgrade) {
        return scheduler;
    }
    let scheduler = platform_scheduler();
    *slot = Some(Arc::downgrade(&scheduler));
    scheduler
}

#[cfg(windows)]
fn platform_scheduler() -> Arc<dyn RealtimeScheduler> {
    match crate::host::wasapi::Mmcss::load() {
        Ok(mmcss) => Arc::new(mmcss),
        Err(err) => {
            log::warn!("MMCSS is unavailable, audio threads keep normal priority: {err}");
            Arc::new(NoopScheduler)
        }
    }
}

#[cfg(all(
    not(windows),
    feature = "audio_thread_priority",
    any(
        target_os = "linux",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "netbsd"
    )
))]
fn platform_scheduler() -> Arc<dyn RealtimeScheduler> {
    Arc::new(rt::PromotingScheduler)
}

#[cfg(not(any(
    windows,
    all(
        feature = "audio_thread_priority",
        any(
            target_os = "linux",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "netbsd"
        )
    )
)))]
fn platform_scheduler() -> Arc<dyn RealtimeScheduler> {
    Arc::new(NoopScheduler)
}

/// A scheduler that accepts every request and changes nothing.
#[derive(Debug, Default)]
pub struct NoopScheduler;

struct NoopElevation;

impl RealtimeScheduler for NoopScheduler {
    fn elevate(
        &self,
        _request: &ElevationRequest,
    ) -> Result<Box<dyn ElevatedThread>, BackendSpecificError> {
        Ok(Box::new(NoopElevation))
    }
}

impl ElevatedThread for NoopElevation {
    fn revert(self: Box<Self>) -> Result<(), BackendSpecificError> {
        Ok(())
    }
}

#[cfg(all(
    not(windows),
    feature = "audio_thread_priority",
    any(
        target_os = "linux",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "netbsd"
    )
))]
mod rt {
    use audio_thread_priority::{
        demote_current_thread_from_real_time, promote_current_thread_to_real_time,
        RtPriorityHandle,
    };

    use crate::traits::{ElevatedThread, ElevationRequest, RealtimeScheduler};
    use crate::BackendSpecificError;

    const FALLBACK_RATE: u32 = 48_000;

    pub(super) struct PromotingScheduler;

    struct Promoted(RtPriorityHandle);

    impl RealtimeScheduler for PromotingScheduler {
        fn elevate(
            &self,
            request: &ElevationRequest,
        ) -> Result<Box<dyn ElevatedThread>, BackendSpecificError> {
            let rate = if request.sample_rate.0 == 0 {
                FALLBACK_RATE
            } else {
                request.sample_rate.0
            };
            promote_current_thread_to_real_time(request.buffer_frames, rate)
                .map(|handle| Box::new(Promoted(handle)) as Box<dyn ElevatedThread>)
                .map_err(|e| BackendSpecificError::new(format!("real-time promotion failed: {e:?}")))
        }
    }

    impl ElevatedThread for Promoted {
        fn revert(self: Box<Self>) -> Result<(), BackendSpecificError> {
            demote_current_thread_from_real_time(self.0)
                .map_err(|e| BackendSpecificError::new(format!("real-time demotion failed: {e:?}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        elevated: Arc<AtomicUsize>,
        reverted: Arc<AtomicUsize>,
    }

    struct CountingTask(Arc<AtomicUsize>);

    impl RealtimeScheduler for Counting {
        fn elevate(
            &self,
            _request: &ElevationRequest,
        ) -> Result<Box<dyn ElevatedThread>, BackendSpecificError> {
            self.elevated.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingTask(self.reverted.clone())))
        }
    }

    impl ElevatedThread for CountingTask {
        fn revert(self: Box<Self>) -> Result<(), BackendSpecificError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request(priority: ThreadPriority) -> ElevationRequest {
        ElevationRequest {
            priority,
            buffer_frames: 480,
            sample_rate: SampleRate(48_000),
        }
    }

    #[test]
    fn task_names() {
        assert_eq!(ThreadPriority::ProAudio.task_name(), Some("Pro Audio"));
        assert_eq!(ThreadPriority::WindowManager.task_name(), Some("Window Manager"));
        assert_eq!(ThreadPriority::None.task_name(), None);
        assert_eq!(ThreadPriority::default_for(true), ThreadPriority::ProAudio);
        assert_eq!(ThreadPriority::default_for(false), ThreadPriority::Audio);
    }

    #[test]
    fn explicit_revert_happens_once() {
        let counting = Counting::default();
        let reverted = counting.reverted.clone();
        let scheduler: Arc<dyn RealtimeScheduler> = Arc::new(counting);
        let boost = boost_with(&scheduler, &request(ThreadPriority::Playback)).unwrap();
        assert!(boost.is_elevated());
        boost.revert().unwrap();
        assert_eq!(reverted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_reverts() {
        let counting = Counting::default();
        let (elevated, reverted) = (counting.elevated.clone(), counting.reverted.clone());
        let scheduler: Arc<dyn RealtimeScheduler> = Arc::new(counting);
        {
            let _boost = boost_with(&scheduler, &request(ThreadPriority::Audio)).unwrap();
            assert_eq!(elevated.load(Ordering::SeqCst), 1);
            assert_eq!(reverted.load(Ordering::SeqCst), 0);
        }
        assert_eq!(reverted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn none_does_not_touch_the_scheduler() {
        let counting = Counting::default();
        let elevated = counting.elevated.clone();
        let scheduler: Arc<dyn RealtimeScheduler> = Arc::new(counting);
        let boost = boost_with(&scheduler, &request(ThreadPriority::None)).unwrap();
        assert!(!boost.is_elevated());
        assert_eq!(elevated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shared_scheduler_is_reused_while_held() {
        let a = shared_scheduler();
        let b = shared_scheduler();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn helper_boost_round_trips() {
        // Promotion may be refused by the platform without the right permissions.
        if let Ok(boost) = boost_current_thread(ThreadPriority::Games) {
            assert_eq!(boost.priority(), ThreadPriority::Games);
            boost.revert().unwrap();
        }
    }
}
