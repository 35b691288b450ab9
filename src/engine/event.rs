use std::time::Duration;

use super::{DeliveryEngine, EngineContext};
use crate::signal::{Event, Wake};
use crate::{BackendSpecificError, Direction, ShareMode, StreamError};

/// How long the engine waits for a buffer-ready signal before giving up on the device.
pub(crate) const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocks on the hardware buffer-ready events.
///
/// Waits for all directions at once only when both are exclusive, which keeps their cycles in
/// lockstep. Otherwise each wake serves the one direction that signaled.
pub(crate) struct EventEngine {
    timeout: Duration,
}

impl EventEngine {
    pub(crate) fn new() -> Self {
        EventEngine::with_timeout(STALL_TIMEOUT)
    }

    pub(crate) fn with_timeout(timeout: Duration) -> Self {
        EventEngine { timeout }
    }
}

impl DeliveryEngine for EventEngine {
    fn name(&self) -> &'static str {
        "event"
    }

    fn run(&mut self, ctx: &mut EngineContext) -> Result<(), StreamError> {
        let mut events: Vec<Event> = Vec::with_capacity(2);
        let mut order: Vec<Direction> = Vec::with_capacity(2);
        let input = ctx.input.as_ref().map(|side| &side.sub);
        let output = ctx.output.as_ref().map(|side| &side.sub);
        for sub in input.into_iter().chain(output) {
            if let Some(event) = &sub.event {
                events.push(event.clone());
                order.push(sub.direction);
            }
        }
        if events.is_empty() {
            return Err(BackendSpecificError::new("event delivery without buffer events").into());
        }

        let wait_all = match (&ctx.input, &ctx.output) {
            (Some(input), Some(output)) => {
                input.sub.share_mode == ShareMode::Exclusive
                    && output.sub.share_mode == ShareMode::Exclusive
            }
            _ => false,
        };
        let handles: Vec<&Event> = events.iter().collect();

        loop {
            let wake = if wait_all {
                Event::wait_all(&handles, self.timeout)?
            } else {
                Event::wait_any(&handles, self.timeout)?
            };

            // Checked before any exchange so no callback runs once shutdown was requested.
            if ctx.shared.shutdown.is_set() {
                return Ok(());
            }

            match wake {
                Wake::TimedOut => {
                    log::error!(
                        "no buffer event for {:?}, the audio driver stopped responding",
                        self.timeout
                    );
                    return Err(StreamError::DeviceStall(self.timeout));
                }
                Wake::All => {
                    ctx.drain_input()?;
                    ctx.fill_output()?;
                }
                Wake::One(index) => match order.get(index) {
                    Some(Direction::Input) => ctx.drain_input()?,
                    Some(Direction::Output) => {
                        ctx.fill_output()?;
                    }
                    None => {}
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;

    use super::*;
    use crate::engine::test_support::*;
    use crate::host::simulated::DeviceSpec;
    use crate::DeliveryMode;

    #[test]
    fn stall_ends_the_loop_with_an_error() {
        let mut spec = DeviceSpec::render("spk", "Speakers");
        spec.faults.stall = true;
        let backend = backend(spec);
        let registry = registry(&backend);
        let sub = substream(&registry, 0, Direction::Output, DeliveryMode::Event);
        let mut ctx = output_context(sub, Arc::default(), Arc::new(Mutex::new(Vec::new())));
        let mut engine = EventEngine::with_timeout(Duration::from_millis(50));
        let err = engine.run(&mut ctx).unwrap_err();
        assert!(matches!(err, StreamError::DeviceStall(_)));
    }

    #[test]
    fn shutdown_is_checked_before_exchange() {
        let backend = backend(DeviceSpec::render("spk", "Speakers"));
        let registry = registry(&backend);
        let mut sub = substream(&registry, 0, Direction::Output, DeliveryMode::Event);
        sub.client.start().unwrap();
        let frames = Arc::new(Mutex::new(0));
        let mut ctx = output_context(sub, frames.clone(), Arc::default());
        ctx.shared.shutdown.set().unwrap();

        let mut engine = EventEngine::new();
        engine.run(&mut ctx).unwrap();
        assert_eq!(*frames.lock().unwrap(), 0);
        if let Some(output) = ctx.output.as_mut() {
            output.sub.client.stop().unwrap();
        }
    }

    #[test]
    fn each_wake_feeds_one_cycle() {
        let backend = backend(DeviceSpec::render("spk", "Speakers"));
        let registry = registry(&backend);
        let mut sub = substream(&registry, 0, Direction::Output, DeliveryMode::Event);
        let cycle = sub.frames_per_cycle;
        sub.client.start().unwrap();
        let mut ctx = output_context(sub, Arc::default(), Arc::default());
        let shared = ctx.shared.clone();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(80));
            shared.shutdown.set().unwrap();
        });
        EventEngine::new().run(&mut ctx).unwrap();
        stopper.join().unwrap();
        if let Some(output) = ctx.output.as_mut() {
            output.sub.client.stop().unwrap();
        }

        let stats = backend.stats("spk").unwrap();
        assert!(!stats.render_transfers.is_empty());
        assert!(stats.render_transfers.iter().all(|t| t.frames <= cycle));
    }
}
