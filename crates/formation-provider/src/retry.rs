//! Bounded-attempt retry for remote commands.
//!
//! Remote command execution retries a fixed number of times with a flat
//! delay; exhausting the attempts escalates as a single error carrying
//! the last failure.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{ProviderError, ProviderResult};

/// Default number of attempts for remote commands.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default delay between attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(10);

/// Run `op` up to `attempts` times, sleeping `delay` between failures.
///
/// Returns the first success, or `CommandExhausted` wrapping the last
/// error once the attempts run out. `op` produces one attempt future per
/// call and must own what it captures.
pub async fn with_attempts<T, P, F>(attempts: u32, delay: Duration, mut op: P) -> ProviderResult<T>
where
    P: FnMut() -> F,
    F: Future<Output = ProviderResult<T>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "remote command attempt failed");
                last = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(ProviderError::CommandExhausted {
        attempts,
        reason: last
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_the_operation_does() {
        let calls = std::cell::Cell::new(0u32);
        let calls = &calls;
        let result = with_attempts(3, Duration::from_secs(10), move || async move {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(ProviderError::Command("flaky".into()))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_carries_the_last_error() {
        let calls = std::cell::Cell::new(0u32);
        let calls = &calls;
        let result: ProviderResult<()> =
            with_attempts(2, Duration::from_secs(1), move || async move {
                calls.set(calls.get() + 1);
                Err(ProviderError::Command(format!("boom {}", calls.get())))
            })
            .await;

        assert_eq!(calls.get(), 2);
        match result.unwrap_err() {
            ProviderError::CommandExhausted { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("boom 2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
