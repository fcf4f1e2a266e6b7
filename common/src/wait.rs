use anyhow::{Result, bail};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Poll `probe` at a fixed cadence until it reports true, the deadline
/// passes, or the token is cancelled. Returns whether the condition was
/// observed before the deadline. The probe runs at least once.
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    timeout: Duration,
    mut probe: F,
) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if probe().await {
            return Ok(true);
        }
        if Instant::now() + interval > deadline {
            return Ok(false);
        }
        tokio::select! {
            _ = cancel.cancelled() => bail!("Context cancelled"),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Exponential backoff w/ "full jitter":
/// sleep for a random duration in [0, min(cap, base * 2^attempt)].
///
/// This tends to behave well under contention and avoids lockstep retries.
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    // Exponential term: base * 2^attempt, capped.
    // Use millis math to avoid Duration overflow footguns.
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    // 2^attempt, saturating if attempt is huge.
    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1); // avoid 0ms upper bound

    // Full jitter: uniform random in [0, upper]
    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn poll_until_stops_on_first_success() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let ok = poll_until(
            &cancel,
            Duration::from_millis(1),
            Duration::from_millis(100),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { true }
            },
        )
        .await
        .unwrap();
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_until_reports_deadline() {
        let cancel = CancellationToken::new();
        let ok = poll_until(
            &cancel,
            Duration::from_millis(2),
            Duration::from_millis(10),
            || async { false },
        )
        .await
        .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn poll_until_errors_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = poll_until(
            &cancel,
            Duration::from_millis(5),
            Duration::from_secs(5),
            || async { false },
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn jitter_stays_under_cap() {
        for attempt in 0..20 {
            let d = backoff_full_jitter(
                Duration::from_millis(250),
                Duration::from_secs(10),
                attempt,
            );
            assert!(d <= Duration::from_secs(10));
        }
    }
}
