//! The poll-and-deadline wait primitive.
//!
//! Every wait in the engine is the same shape: sample an observable
//! predicate at a fixed interval, and give up once a deadline elapses.
//! Suspension points are exactly the poll ticks, and cancellation is
//! deterministic on either outcome — a resolved wait leaves no timer
//! behind, and a firing deadline stops the sampling immediately.
//!
//! A firing deadline does not retroactively cancel infrastructure calls
//! already issued by the predicate's observers; cleaning those up is the
//! job of system-wide teardown.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use formation_core::Settings;

/// Interval and deadline for one class of provisioning wait.
#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollTiming {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
            deadline: Duration::from_secs(settings.deadline_secs),
        }
    }
}

impl Default for PollTiming {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Outcome of a poll-and-deadline wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate was satisfied.
    Ready,
    /// The deadline fired before the predicate was satisfied.
    TimedOut,
}

/// Sample `predicate` immediately and then at every `interval` tick,
/// until it returns true (`Ready`) or `deadline` elapses (`TimedOut`).
///
/// The predicate is a closure producing one sampling future per tick; it
/// must own (or copy) whatever it samples so the futures have a concrete
/// type that survives crossing `tokio::spawn`.
pub async fn poll<P, F>(mut predicate: P, interval: Duration, deadline: Duration) -> PollOutcome
where
    P: FnMut() -> F,
    F: Future<Output = bool>,
{
    let expiry = tokio::time::sleep(deadline);
    tokio::pin!(expiry);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // The first tick completes immediately, giving the caller a
            // zero-delay sample before any waiting happens.
            _ = ticker.tick() => {
                if predicate().await {
                    return PollOutcome::Ready;
                }
            }
            _ = &mut expiry => return PollOutcome::TimedOut,
        }
    }
}
