use std::time::Duration;

use super::{DeliveryEngine, EngineContext};
use crate::build::SubStream;
use crate::StreamError;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Wakes on a fixed interval and services both directions on every wake.
pub(crate) struct PollEngine {
    interval: Duration,
}

impl PollEngine {
    /// The interval is half the shorter buffer duration of the configured directions.
    pub(crate) fn for_streams(input: Option<&SubStream>, output: Option<&SubStream>) -> Self {
        let interval = input
            .into_iter()
            .chain(output)
            .map(|sub| sub.buffer_duration() / 2)
            .min()
            .unwrap_or(MIN_INTERVAL);
        PollEngine::with_interval(interval)
    }

    pub(crate) fn with_interval(interval: Duration) -> Self {
        PollEngine {
            interval: interval.max(MIN_INTERVAL),
        }
    }
}

impl DeliveryEngine for PollEngine {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn run(&mut self, ctx: &mut EngineContext) -> Result<(), StreamError> {
        log::debug!("polling every {:?}", self.interval);
        loop {
            // The sleep is also the cancellation wait.
            if ctx.shared.shutdown.wait_timeout(self.interval)? {
                return Ok(());
            }
            ctx.drain_input()?;
            let cycle = ctx
                .output
                .as_ref()
                .map(|side| side.sub.frames_per_cycle)
                .unwrap_or(0);
            while cycle > 0 && ctx.fill_output()? == cycle {
                if ctx.shared.shutdown.is_set() {
                    return Ok(());
                }
            }
        }
    }
}
