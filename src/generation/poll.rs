//! Generic poll loop: heartbeat-rate-limited, timeout-bounded,
//! cancellation-aware. The image and video branches each supply a `check`
//! closure encoding their own terminal conditions (status field vs.
//! disappearance from a pending list); the loop itself only knows about
//! pending/succeeded/failed and the clock.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::GatewayError;

pub enum PollStatus<T> {
    Pending,
    Succeeded(T),
    Failed(String),
}

/// Poll `check` every `poll_interval` until it reports a terminal status,
/// `is_cancelled` reports true, or `timeout` elapses. `on_heartbeat` fires at
/// most once per `heartbeat_interval` while the task is still pending.
pub async fn poll_until<T, C, CFut>(
    mut check: C,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    timeout: Duration,
    mut on_heartbeat: impl FnMut(),
    mut is_cancelled: impl FnMut() -> bool,
) -> Result<T, GatewayError>
where
    C: FnMut() -> CFut,
    CFut: Future<Output = Result<PollStatus<T>, GatewayError>>,
{
    let start = Instant::now();
    let mut last_heartbeat = start;

    loop {
        if is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        match check().await? {
            PollStatus::Succeeded(value) => return Ok(value),
            PollStatus::Failed(reason) => return Err(GatewayError::Upstream { status: 0, body: reason }),
            PollStatus::Pending => {}
        }

        if start.elapsed() > timeout {
            return Err(GatewayError::UpstreamTimeout(timeout));
        }

        if last_heartbeat.elapsed() >= heartbeat_interval {
            on_heartbeat();
            last_heartbeat = Instant::now();
        }

        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_check_reports_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result = poll_until(
            move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Ok::<_, GatewayError>(PollStatus::Pending)
                    } else {
                        Ok(PollStatus::Succeeded("done"))
                    }
                }
            },
            Duration::from_millis(10),
            Duration::from_secs(10),
            Duration::from_secs(60),
            || {},
            || false,
        )
        .await;

        assert!(matches!(result, Ok("done")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_terminal() {
        let result: Result<(), GatewayError> = poll_until(
            || async { Ok(PollStatus::Pending) },
            Duration::from_millis(10),
            Duration::from_secs(10),
            Duration::from_millis(50),
            || {},
            || false,
        )
        .await;

        assert!(matches!(result, Err(GatewayError::UpstreamTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_observed_before_next_tick() {
        let result: Result<(), GatewayError> = poll_until(
            || async { Ok(PollStatus::Pending) },
            Duration::from_millis(10),
            Duration::from_secs(10),
            Duration::from_secs(60),
            || {},
            || true,
        )
        .await;

        assert!(matches!(result, Err(GatewayError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_at_configured_rate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let heartbeats = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let heartbeats_clone = heartbeats.clone();
        let result: Result<&str, GatewayError> = poll_until(
            move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 5 {
                        Ok(PollStatus::Pending)
                    } else {
                        Ok(PollStatus::Succeeded("done"))
                    }
                }
            },
            Duration::from_millis(10),
            Duration::from_millis(25),
            Duration::from_secs(60),
            move || {
                heartbeats_clone.fetch_add(1, Ordering::SeqCst);
            },
            || false,
        )
        .await;

        assert!(result.is_ok());
        assert!(heartbeats.load(Ordering::SeqCst) >= 1);
    }
}
