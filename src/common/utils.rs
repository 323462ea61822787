//! Utility functions for vnetdir

use std::time::Duration;
use tokio::time::Instant;

/// Parse a duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| crate::Error::InvalidConfig(format!("missing unit in duration: {s:?}")))?;
    let (num_str, unit) = s.split_at(split);

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {s:?}")))?;

    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        "h" => Ok(Duration::from_secs(num * 3600)),
        _ => Err(crate::Error::InvalidConfig(format!(
            "unknown duration unit: {unit:?}"
        ))),
    }
}

/// Seconds elapsed between two instants, zero if `earlier` is in the future
pub fn elapsed_secs(now: Instant, earlier: Instant) -> f64 {
    now.saturating_duration_since(earlier).as_secs_f64()
}

/// Format a load score for display
pub fn format_load(load: f64) -> String {
    format!("{load:.1}%")
}

/// Retry a request with exponential backoff.
///
/// Only used by the admin client; the control-plane core never waits on a
/// send and relies on its own retry counters instead.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_attempts: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!("Attempt {} failed: {}, retrying in {:?}", attempt, e, delay);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration(" 5m ").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("15").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_elapsed_secs_saturates() {
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(3);
        assert_eq!(elapsed_secs(later, t0), 3.0);
        assert_eq!(elapsed_secs(t0, later), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_stops_on_permanent_error() {
        let calls = AtomicUsize::new(0);
        let result: crate::Result<()> = retry_with_backoff(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(crate::Error::Transport("refused".into()))
                    } else {
                        Err(crate::Error::DomainNotFound(3))
                    }
                }
            },
            5,
            Duration::from_millis(10),
        )
        .await;

        assert!(matches!(result, Err(crate::Error::DomainNotFound(3))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
