use std::future::Future;
use std::time::Duration;

use rand::Rng;
use relay_types::Classify;
use tracing::{debug, warn};

/// Delay function between attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    /// `min(initial * multiplier^(n-2), max)` before attempt `n`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
    Fixed(Duration),
    Immediate,
}

/// One attempt of a retried operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based.
    pub number: u32,
    /// Time slept before this attempt (zero for the first).
    pub delay: Duration,
}

/// In-process retry policy. Holds no shared state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Adds up to 50% of the base delay, drawn per attempt.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn with_backoff(max_attempts: u32, initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial,
                multiplier,
                max,
            },
            jitter: true,
        }
    }

    pub fn with_fixed_delay(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
            jitter: false,
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Immediate,
            jitter: false,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before attempt `n`, without jitter.
    pub fn base_delay(&self, n: u32) -> Duration {
        if n < 2 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Immediate => Duration::ZERO,
            Backoff::Fixed(d) => d,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exp = (n - 2).min(i32::MAX as u32) as i32;
                let raw = initial.as_millis() as f64 * multiplier.powi(exp);
                let capped = raw.min(max.as_millis() as f64).max(0.0);
                Duration::from_millis(capped as u64)
            }
        }
    }

    /// Delay before attempt `n`, with jitter applied when enabled.
    pub fn delay_for(&self, n: u32) -> Duration {
        let base = self.base_delay(n);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=0.5);
        base + base.mul_f64(extra)
    }

    /// The planned attempts with their base delays.
    pub fn schedule(&self) -> Vec<RetryAttempt> {
        (1..=self.attempts())
            .map(|number| RetryAttempt {
                number,
                delay: self.base_delay(number),
            })
            .collect()
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// The last transient error is returned unchanged once the ceiling is hit.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(RetryAttempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let max = self.attempts();
        let mut attempt = RetryAttempt {
            number: 1,
            delay: Duration::ZERO,
        };
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => {
                    debug!(attempt = attempt.number, error = %e, "permanent error, not retrying");
                    return Err(e);
                }
                Err(e) if attempt.number >= max => {
                    warn!(attempts = attempt.number, error = %e, "retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let number = attempt.number + 1;
                    let delay = self.delay_for(number);
                    debug!(
                        next_attempt = number,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient error, backing off"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt = RetryAttempt { number, delay };
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_backoff(3, Duration::from_millis(200), 2.0, Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::ToolError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn permanent_error_runs_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let res: Result<(), _> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ToolError::invalid_input("malformed")) }
            })
            .await;
        assert_eq!(res.unwrap_err().message, "malformed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_error_runs_max_attempts_and_returns_last() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_fixed_delay(4, Duration::from_millis(1));
        let res: Result<(), _> = policy
            .run(|a| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(ToolError::transient(format!("503 on attempt {}", a.number))) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(res.unwrap_err().message, "503 on attempt 4");
    }

    #[tokio::test]
    async fn operation_sees_attempt_numbers() {
        let seen = Mutex::new(Vec::new());
        let policy = RetryPolicy::immediate(3);
        let out = policy
            .run(|a| {
                seen.lock().unwrap().push(a.number);
                async move {
                    if a.number < 3 {
                        Err(ToolError::transient("timeout"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn exponential_schedule_is_non_decreasing_and_capped() {
        let policy = RetryPolicy::with_backoff(8, Duration::from_millis(100), 2.0, Duration::from_millis(1_000));
        let delays: Vec<u64> = policy
            .schedule()
            .iter()
            .map(|a| a.delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 100, 200, 400, 800, 1_000, 1_000, 1_000]);
    }

    #[test]
    fn jitter_stays_within_half_of_base() {
        let policy = RetryPolicy::with_backoff(5, Duration::from_millis(100), 2.0, Duration::from_millis(250));
        for n in 2..=5 {
            let base = policy.base_delay(n);
            for _ in 0..50 {
                let d = policy.delay_for(n);
                assert!(d >= base && d <= base + base / 2, "attempt {n}: {d:?} vs {base:?}");
            }
        }
        assert_eq!(policy.without_jitter().delay_for(3), Duration::from_millis(200));
    }

    #[test]
    fn variants_differ_only_in_delay() {
        assert_eq!(RetryPolicy::immediate(3).base_delay(3), Duration::ZERO);
        assert_eq!(
            RetryPolicy::with_fixed_delay(3, Duration::from_millis(40)).delay_for(3),
            Duration::from_millis(40)
        );
        assert_eq!(RetryPolicy::immediate(0).schedule().len(), 1);
    }
}
