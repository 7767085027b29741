//! Bounded exponential backoff for throttled engine calls.
//!
//! A [`Backoff`] is created per classification call. Every time the engine
//! throttles, the caller asks it to [`wait`](Backoff::wait); it refuses once
//! `max_retries` waits have been spent or when the wait would run past the
//! call's deadline, so a throttled call can never outlive its deadline.

use std::sync::LazyLock;
use std::time::Duration;

use chatwarden_types::ClassifyError;
use chatwarden_types::config::EngineConfig;
use rand::Rng;
use regex::Regex;
use tokio::time::Instant;
use tracing::warn;

/// Wait used when a throttling message carries no usable hint.
pub const DEFAULT_THROTTLE_HINT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3).
    pub max_retries: u32,
    /// Delay before the first retry (default: 1 second).
    pub base_delay: Duration,
    /// Upper bound for a single delay (default: 30 seconds).
    pub max_delay: Duration,
    /// Random `0..jitter_fraction * delay` added to each delay (default: 0.25).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn from_engine(engine: &EngineConfig, max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(engine.retry_base_delay_ms),
            max_delay: Duration::from_millis(engine.retry_max_delay_ms),
            ..Self::default()
        }
    }
}

/// Delay for retry `attempt` (0-indexed): `min(base * 2^attempt, max)` plus jitter.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let base_ms = config.base_delay.as_millis() as u64;
    let capped_ms = base_ms
        .saturating_mul(exp)
        .min(config.max_delay.as_millis() as u64);

    let jitter_max_ms = (capped_ms as f64 * config.jitter_fraction) as u64;
    let jitter_ms = if jitter_max_ms > 0 {
        rand::thread_rng().gen_range(0..=jitter_max_ms)
    } else {
        0
    };

    Duration::from_millis(capped_ms + jitter_ms)
}

static TRY_AGAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)try again in ([0-9]+(?:\.[0-9]+)?)\s*(ms|s)\b").expect("static regex")
});

/// Extract the wait from messages like `"Please try again in 6.5s."`.
pub fn parse_try_again(message: &str) -> Option<Duration> {
    let caps = TRY_AGAIN.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let ms = match caps.get(2)?.as_str().to_ascii_lowercase().as_str() {
        "ms" => value,
        _ => value * 1000.0,
    };
    Some(Duration::from_millis(ms.ceil().max(0.0) as u64))
}

/// Why [`Backoff::wait`] refused to wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStop {
    /// Every retry has been used; `attempts` counts the first try too.
    Exhausted { attempts: u32 },
    /// The next attempt could not start before the deadline.
    PastDeadline,
}

impl BackoffStop {
    pub fn into_classify_error(self, timeout: Duration) -> ClassifyError {
        match self {
            BackoffStop::Exhausted { attempts } => ClassifyError::RateLimitExceeded { attempts },
            BackoffStop::PastDeadline => ClassifyError::Timeout { after: timeout },
        }
    }
}

/// Retry state for one classification call.
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    retries: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, retries: 0 }
    }

    /// Retries taken so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// The engine's hint wins when it is longer than the computed delay.
    pub fn next_delay(&self, hint: Option<Duration>) -> Duration {
        let computed = compute_delay(&self.config, self.retries);
        hint.map_or(computed, |h| computed.max(h))
    }

    /// Sleep before the next attempt.
    pub async fn wait(
        &mut self,
        hint: Option<Duration>,
        deadline: Instant,
    ) -> std::result::Result<Duration, BackoffStop> {
        if self.retries >= self.config.max_retries {
            return Err(BackoffStop::Exhausted {
                attempts: self.retries + 1,
            });
        }
        let delay = self.next_delay(hint);
        if Instant::now() + delay >= deadline {
            return Err(BackoffStop::PastDeadline);
        }
        warn!(
            attempt = self.retries + 1,
            delay_ms = delay.as_millis() as u64,
            "engine throttled, backing off"
        );
        tokio::time::sleep(delay).await;
        self.retries += 1;
        Ok(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter_fraction: 0.0,
        }
    }

    #[test]
    fn compute_delay_doubles_and_caps() {
        let cfg = no_jitter(3);
        assert_eq!(compute_delay(&cfg, 0), Duration::from_millis(100));
        assert_eq!(compute_delay(&cfg, 1), Duration::from_millis(200));
        assert_eq!(compute_delay(&cfg, 3), Duration::from_millis(800));
        assert_eq!(compute_delay(&cfg, 4), Duration::from_millis(1000));
        assert_eq!(compute_delay(&cfg, 60), Duration::from_millis(1000));
    }

    #[test]
    fn compute_delay_jitter_stays_in_range() {
        let cfg = RetryConfig {
            jitter_fraction: 0.5,
            ..no_jitter(3)
        };
        for _ in 0..50 {
            let d = compute_delay(&cfg, 1).as_millis();
            assert!((200..=300).contains(&d), "{d}");
        }
    }

    #[test]
    fn parse_try_again_seconds_and_millis() {
        assert_eq!(
            parse_try_again("Rate limit reached. Please try again in 6.5s. Visit ..."),
            Some(Duration::from_millis(6500))
        );
        assert_eq!(
            parse_try_again("try again in 250ms"),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            parse_try_again("TRY AGAIN IN 2 s"),
            Some(Duration::from_secs(2))
        );
        assert_eq!(parse_try_again("slow down"), None);
    }

    #[test]
    fn hint_wins_when_longer() {
        let backoff = Backoff::new(no_jitter(3));
        assert_eq!(
            backoff.next_delay(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            backoff.next_delay(Some(Duration::from_millis(10))),
            Duration::from_millis(100)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_bounded_by_max_retries() {
        let mut backoff = Backoff::new(no_jitter(2));
        let deadline = Instant::now() + Duration::from_secs(60);

        assert!(backoff.wait(None, deadline).await.is_ok());
        assert!(backoff.wait(None, deadline).await.is_ok());
        assert_eq!(backoff.retries(), 2);
        assert_eq!(
            backoff.wait(None, deadline).await,
            Err(BackoffStop::Exhausted { attempts: 3 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_refuses_to_cross_deadline() {
        let mut backoff = Backoff::new(no_jitter(5));
        let deadline = Instant::now() + Duration::from_secs(1);
        let stop = backoff
            .wait(Some(Duration::from_secs(5)), deadline)
            .await
            .unwrap_err();
        assert_eq!(stop, BackoffStop::PastDeadline);
        assert_eq!(backoff.retries(), 0);
    }

    #[test]
    fn stop_maps_to_taxonomy() {
        let t = Duration::from_secs(60);
        assert_eq!(
            BackoffStop::Exhausted { attempts: 4 }.into_classify_error(t),
            ClassifyError::RateLimitExceeded { attempts: 4 }
        );
        assert_eq!(
            BackoffStop::PastDeadline.into_classify_error(t),
            ClassifyError::Timeout { after: t }
        );
    }
}
