//! Retry policy and backoff jitter
//!
//! Only transient upstream statuses (429 and the 5xx family) are retried.
//! Delays grow exponentially between attempts; a rate-limited response may
//! stretch the wait out to the advertised reset instant, up to a ceiling.

use std::time::Duration;

use aliri_clock::UnixTime;

/// Configuration for how failed upstream calls are retried
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    reset_wait_ceiling: Duration,
}

impl Default for RetryPolicy {
    /// Default retry policy
    ///
    /// Makes at most 3 attempts, starting with a 500 ms delay and doubling
    /// up to 10 seconds. Waits for a rate-limit reset no longer than one
    /// minute.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
            reset_wait_ceiling: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Constructs a policy with an explicit attempt budget and delay curve
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Caps how long a rate-limited call will wait for the advertised reset
    pub fn with_reset_wait_ceiling(mut self, ceiling: Duration) -> Self {
        self.reset_wait_ceiling = ceiling;
        self
    }

    /// The maximum number of attempts, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The backoff delay after the given number of failed attempts
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        let factor = self.multiplier.saturating_pow(exponent);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// The delay to observe before the next attempt
    ///
    /// Takes the backoff for this attempt, already jittered by the caller.
    /// A rate-limited response advertising a reset instant extends the wait
    /// to that instant when it is later than the backoff, capped by the
    /// reset wait ceiling. The reset wait itself is never jittered shorter:
    /// retrying ahead of the advertised reset would spend an attempt on a
    /// response that is already known to be rate limited.
    pub fn delay_before_retry(
        &self,
        backoff: Duration,
        rate_limit_reset: Option<UnixTime>,
        now: UnixTime,
    ) -> Duration {
        match rate_limit_reset {
            Some(reset) if reset > now => {
                let until_reset = Duration::from_secs((reset - now).0);
                backoff.max(until_reset).min(self.reset_wait_ceiling)
            }
            _ => backoff,
        }
    }
}

/// A type that provides some jittering of retry delays
pub trait JitterSource {
    /// Jitters a given delay
    fn jitter(&self, delay: Duration) -> Duration;
}

/// A jitter source that does not do any jittering
#[derive(Debug)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&self, delay: Duration) -> Duration {
        delay
    }
}

#[cfg(feature = "rand")]
mod random {
    use std::time::Duration;

    use rand::Rng;

    /// Jitters a delay earlier by a random amount
    ///
    /// Delays jittered by this type keep a uniformly random share of at
    /// least half of the original delay, so that concurrent retries do not
    /// stampede the upstream at the same instant.
    #[derive(Debug)]
    pub struct RandomEarlyJitter;

    impl super::JitterSource for RandomEarlyJitter {
        fn jitter(&self, delay: Duration) -> Duration {
            let millis = delay.as_millis() as u64;
            if millis < 2 {
                return delay;
            }
            let cut = rand::thread_rng().gen_range(0..millis / 2);
            Duration::from_millis(millis - cut)
        }
    }
}

#[cfg(feature = "rand")]
pub use random::RandomEarlyJitter;
