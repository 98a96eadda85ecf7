//! Poll-Until-Ready.
//!
//! The daemons cannot notify anybody, so every wait in the scheduler ends up here:
//! ask `is_busy()` at a fixed granularity until the device reports ready or an
//! optional deadline passes. The device is never told anything; a timed-out device is
//! left exactly as it was found.
//!
//! Callers go through [`ReadinessWaiter`] rather than [`Poller`] directly, so an
//! event-driven proxy can later plug in its own waiter without touching the
//! acquisition routines.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::hardware::capabilities::DeviceProxy;

/// How long a wait may last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Wait until the device is ready, however long that takes.
    Unbounded,
    /// Give up after this long.
    Within(Duration),
}

impl Deadline {
    /// Deadline from seconds; zero, negative or non-finite values mean unbounded.
    pub fn from_secs(secs: f64) -> Self {
        if secs > 0.0 && secs.is_finite() {
            Deadline::Within(Duration::from_secs_f64(secs))
        } else {
            Deadline::Unbounded
        }
    }
}

impl From<Option<Duration>> for Deadline {
    fn from(value: Option<Duration>) -> Self {
        value.map_or(Deadline::Unbounded, Deadline::Within)
    }
}

/// Which of the two ways a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The device reported not busy.
    Ready {
        /// Time spent waiting
        waited: Duration,
    },
    /// The deadline elapsed first.
    TimedOut {
        /// Time spent waiting
        waited: Duration,
    },
}

impl PollOutcome {
    /// `true` for [`PollOutcome::TimedOut`].
    pub fn timed_out(&self) -> bool {
        matches!(self, PollOutcome::TimedOut { .. })
    }

    /// Time spent waiting, whichever way the wait ended.
    pub fn waited(&self) -> Duration {
        match self {
            PollOutcome::Ready { waited } | PollOutcome::TimedOut { waited } => *waited,
        }
    }
}

/// Blocks the calling flow until a device is ready.
#[async_trait]
pub trait ReadinessWaiter: Send + Sync {
    /// Wait for `device` to stop being busy, or for `deadline` to pass.
    ///
    /// Errors only when the proxy itself fails; a timeout is an `Ok` outcome.
    async fn wait_ready(&self, device: &dyn DeviceProxy, deadline: Deadline)
        -> Result<PollOutcome>;
}

/// Fixed-interval busy-poll.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    interval: Duration,
}

impl Poller {
    /// Poll at the given interval.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Sleep granularity between `is_busy` checks.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

#[async_trait]
impl ReadinessWaiter for Poller {
    async fn wait_ready(
        &self,
        device: &dyn DeviceProxy,
        deadline: Deadline,
    ) -> Result<PollOutcome> {
        let started = Instant::now();
        loop {
            // Busy is checked before the deadline, so a device finishing exactly at
            // the deadline counts as ready.
            if !device.is_busy().await? {
                return Ok(PollOutcome::Ready {
                    waited: started.elapsed(),
                });
            }
            let waited = started.elapsed();
            if let Deadline::Within(limit) = deadline {
                if waited >= limit {
                    trace!(device = device.name(), ?waited, "poll deadline elapsed");
                    return Ok(PollOutcome::TimedOut { waited });
                }
            }
            sleep(self.interval).await;
        }
    }
}
