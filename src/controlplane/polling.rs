//! Step-Bounded Backoff Polling
//!
//! Cloud attach/detach and local device discovery converge asynchronously, so
//! the driver re-checks them with increasing delays. Every loop here has a
//! hard step ceiling and honours a cancellation token.

use crate::error::Result;
use backoff::backoff::Backoff;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

// =============================================================================
// Backoff Shapes
// =============================================================================

/// Exponential backoff with a fixed number of steps
///
/// A shape with `steps == n` lets a probe run `n` times: `next_backoff`
/// yields `n - 1` delays and then `None`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepBackoff {
    /// Delay before the second attempt
    pub initial: Duration,
    /// Multiplier applied after every delay
    pub factor: f64,
    /// Maximum number of probe attempts
    pub steps: u32,
    current: Duration,
    remaining: u32,
}

impl StepBackoff {
    pub fn new(initial: Duration, factor: f64, steps: u32) -> Self {
        Self {
            initial,
            factor,
            steps,
            current: initial,
            remaining: steps,
        }
    }

    /// Wait for a volume to show up as attached
    pub fn disk_attach() -> Self {
        Self::new(Duration::from_secs(1), 1.2, 15)
    }

    /// Wait for a volume to show up as detached
    pub fn disk_detach() -> Self {
        Self::new(Duration::from_secs(1), 1.2, 13)
    }

    /// Wait for the local device node of a volume
    pub fn device_resolve() -> Self {
        Self::new(Duration::from_secs(1), 1.1, 10)
    }

    /// Sum of all delays a full run would sleep
    pub fn total_delay(&self) -> Duration {
        let mut shape = Self::new(self.initial, self.factor, self.steps);
        let mut total = Duration::ZERO;
        while let Some(delay) = shape.next_backoff() {
            total += delay;
        }
        total
    }
}

impl Backoff for StepBackoff {
    fn reset(&mut self) {
        self.current = self.initial;
        self.remaining = self.steps;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        // The final attempt is not followed by a delay.
        if self.remaining <= 1 {
            self.remaining = 0;
            return None;
        }
        self.remaining -= 1;
        let delay = self.current;
        self.current = self.current.mul_f64(self.factor);
        Some(delay)
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Why a poll ended without a value
#[derive(Debug)]
pub enum PollError {
    /// The step ceiling was reached
    Exhausted { attempts: u32 },
    /// The cancellation token fired
    Cancelled { attempts: u32 },
    /// The probe failed and the loop aborted
    Failed(crate::error::Error),
}

/// Run `probe` until it yields a value, fails, the step budget runs out, or
/// `cancel` fires.
///
/// `Ok(None)` from the probe means "not yet". The first attempt runs
/// immediately. A probe still in flight when `cancel` fires is dropped.
pub async fn poll_until<T, B, F, Fut>(
    mut backoff: B,
    cancel: &CancellationToken,
    mut probe: F,
) -> std::result::Result<T, PollError>
where
    B: Backoff,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled { attempts });
        }

        attempts += 1;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled { attempts }),
            outcome = probe() => outcome,
        };
        match outcome {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => return Err(PollError::Failed(e)),
        }

        let Some(delay) = backoff.next_backoff() else {
            return Err(PollError::Exhausted { attempts });
        };

        trace!(attempts, ?delay, "condition not met, backing off");

        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled { attempts }),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_step_backoff_yields_steps_minus_one_delays() {
        let mut shape = StepBackoff::new(Duration::from_secs(1), 2.0, 4);
        assert_eq!(shape.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(shape.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(shape.next_backoff(), Some(Duration::from_secs(4)));
        assert_eq!(shape.next_backoff(), None);
        assert_eq!(shape.next_backoff(), None);

        shape.reset();
        assert_eq!(shape.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_default_shapes_budget() {
        // Attach waits are on the order of minutes, device resolution shorter.
        let attach = StepBackoff::disk_attach().total_delay();
        assert!(attach > Duration::from_secs(50));
        assert!(attach < Duration::from_secs(120));

        let resolve = StepBackoff::device_resolve().total_delay();
        assert!(resolve > Duration::from_secs(9));
        assert!(resolve < Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_returns_first_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let value = poll_until(StepBackoff::new(Duration::from_secs(1), 1.5, 5), &cancel, || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(if n == 3 { Some(n) } else { None }) }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_exhausts_after_exact_step_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let result: std::result::Result<(), _> =
            poll_until(StepBackoff::new(Duration::from_secs(1), 1.2, 7), &cancel, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            })
            .await;

        assert_matches!(result, Err(PollError::Exhausted { attempts: 7 }));
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_aborts_on_condition_error() {
        let cancel = CancellationToken::new();
        let result: std::result::Result<(), _> =
            poll_until(StepBackoff::new(Duration::from_secs(1), 1.2, 5), &cancel, || async {
                Err(Error::Internal("boom".into()))
            })
            .await;

        assert_matches!(result, Err(PollError::Failed(Error::Internal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let result: std::result::Result<(), _> =
            poll_until(StepBackoff::new(Duration::from_secs(1), 1.0, 100), &cancel, || async {
                Ok(None)
            })
            .await;

        assert_matches!(result, Err(PollError::Cancelled { attempts: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_stuck_condition() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result: std::result::Result<(), _> =
            poll_until(StepBackoff::disk_attach(), &cancel, || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(None)
            })
            .await;

        assert_matches!(result, Err(PollError::Cancelled { attempts: 1 }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
