//! Waiting for asynchronous statements to complete.
//!
//! Status checks back off from one time unit to five and then ten. Every
//! sleep races the execution's cancellation token, so closing the handle
//! from another task ends the wait immediately.

use std::time::Duration;

use tracing::debug;

use super::cache::ExecutionCache;
use super::Handle;
use crate::db::{PollState, Submission};
use crate::error::{ConduitError, Result};

/// Number of time units to sleep before the status check following
/// `attempt` (1-based).
pub fn backoff_units(attempt: u32) -> u32 {
    match attempt {
        0..=5 => 1,
        6..=10 => 5,
        _ => 10,
    }
}

/// Backoff schedule scaled to a concrete time unit.
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    unit: Duration,
}

impl PollSchedule {
    pub fn new(unit: Duration) -> Self {
        Self { unit }
    }

    /// Delay before the status check following `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.unit * backoff_units(attempt)
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Progress callbacks for a polled or streamed execution.
///
/// All methods default to no-ops.
pub trait PollObserver: Send + Sync {
    /// Called once when a stream executes its statement.
    fn on_execute(&self, _handle: &Handle) {}

    /// Called after every status check.
    fn on_status(&self, _state: PollState) {}

    /// Called with log text not seen by a previous call.
    fn on_log(&self, _text: &str) {}

    /// Whether the poller should fetch log text at all.
    fn wants_log(&self) -> bool {
        false
    }
}

/// Fails with a query error unless polling ended in `Available`, the only
/// state rows may be fetched from.
pub fn ensure_available(state: PollState) -> Result<()> {
    if state == PollState::Available {
        Ok(())
    } else {
        Err(ConduitError::query(format!(
            "Statement ended in state '{state}' before results were available"
        )))
    }
}

/// Observer that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PollObserver for NoopObserver {}

/// Polls `handle` until its state leaves {waiting, running, submitted}.
///
/// Returns immediately with `Available` for statements that finished at
/// submission. Fails with `QueryExpired` as soon as the handle is closed.
pub async fn until_available(
    cache: &ExecutionCache,
    handle: &Handle,
    schedule: PollSchedule,
    observer: &dyn PollObserver,
) -> Result<PollState> {
    let entry = cache.get(handle)?;
    if entry.lock().await?.submission == Submission::Finished {
        return Ok(PollState::Available);
    }

    let token = entry.cancelled().clone();
    let mut attempt: u32 = 0;
    let mut log_offset = 0usize;

    loop {
        if !cache.contains(handle) {
            return Err(ConduitError::unknown_handle(handle));
        }

        let (state, log) = {
            let mut ctx = entry.lock().await?;
            let state = entry
                .unless_released(ctx.cursor.status())
                .await
                .map_err(ConduitError::reclassify)?;
            let log = if observer.wants_log() {
                let text = entry
                    .unless_released(ctx.cursor.log(log_offset))
                    .await
                    .map_err(ConduitError::reclassify)?;
                Some(if ctx.cursor.log_is_full() {
                    text.get(log_offset..).unwrap_or_default().to_string()
                } else {
                    text
                })
            } else {
                None
            };
            (state, log)
        };

        observer.on_status(state);
        if let Some(text) = log {
            log_offset += text.len();
            observer.on_log(&text);
        }

        if !state.is_pending() {
            debug!("Execution {} reached {} after {} checks", handle, state, attempt + 1);
            return Ok(state);
        }

        attempt += 1;
        let delay = schedule.delay(attempt);
        debug!("Execution {} is {}; next check in {:?}", handle, state, delay);
        tokio::select! {
            _ = token.cancelled() => return Err(ConduitError::unknown_handle(handle)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
