use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Bounded attempt count with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration
}
impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// As many `delay` ticks as fit into `total`, used to bound spin-waits.
    pub fn spanning(total: Duration, delay: Duration) -> Self {
        let ticks = total.as_millis() / delay.as_millis().max(1);
        Self::new(ticks.clamp(1, u32::MAX as u128) as u32, delay)
    }

    pub fn start(&self) -> Backoff {
        Backoff { policy: *self, attempt: 1 }
    }
}

/// Attempt counter for loops whose body borrows state mutably and so can't be a closure.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32
}
impl Backoff {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Sleeps before the next attempt, or returns false once every attempt has been used.
    pub async fn next(&mut self) -> bool {
        if !self.tick() {
            return false;
        }
        sleep(self.policy.delay).await;
        true
    }

    /// Counts an attempt without sleeping, for loops whose body already waits `delay`.
    pub fn tick(&mut self) -> bool {
        if self.attempt >= self.policy.attempts {
            return false;
        }
        self.attempt += 1;
        true
    }
}

/// Runs `operation` until it succeeds or the policy runs out, returning the last error.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>
{
    let mut backoff = policy.start();
    loop {
        match operation(backoff.attempt()).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !backoff.next().await {
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts() {
        let started = Instant::now();
        let mut calls = 0;
        let result: Result<(), u32> = retry(RetryPolicy::new(10, Duration::from_millis(100)), |attempt| {
            calls += 1;
            async move { Err(attempt) }
        }).await;

        assert_eq!(result, Err(10));
        assert_eq!(calls, 10);
        assert_eq!(started.elapsed(), Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_early() {
        let result: Result<u32, ()> = retry(RetryPolicy::new(5, Duration::from_millis(10)), |attempt| async move {
            if attempt == 3 { Ok(attempt) } else { Err(()) }
        }).await;
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_tick_counts_without_sleeping() {
        let mut backoff = RetryPolicy::new(3, Duration::from_secs(60)).start();
        assert!(backoff.tick());
        assert!(backoff.tick());
        assert!(!backoff.tick());
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn test_spanning() {
        let policy = RetryPolicy::spanning(Duration::from_secs(10), Duration::from_millis(10));
        assert_eq!(policy.attempts, 1000);
        assert_eq!(RetryPolicy::spanning(Duration::ZERO, Duration::from_millis(10)).attempts, 1);
    }
}
