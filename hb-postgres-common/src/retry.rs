use std::time::Duration;

use rand::Rng;

#[derive(Copy, Clone, Debug)]
/// The retry policy the Worker Pool uses to determine a job's next `scheduled_at`
/// on failure: exponential backoff with a bounded amount of jitter mixed in so a
/// cohort of jobs that failed together doesn't retry in lockstep.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<Duration>,
    /// Fraction of the computed interval (0.0..=1.0) to randomly add as jitter.
    jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            jitter_fraction: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction.clamp(0.0, 1.0);
        self
    }

    /// Calculate the time until the next retry for a given job attempt.
    pub fn time_until_next_retry(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<Duration>,
    ) -> Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        let bounded = match (preferred_retry_interval, self.maximum_interval) {
            (Some(duration), Some(max_interval)) => std::cmp::min(
                std::cmp::max(std::cmp::min(candidate_interval, max_interval), duration),
                max_interval,
            ),
            (Some(duration), None) => std::cmp::max(candidate_interval, duration),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        };

        self.apply_jitter(bounded)
    }

    fn apply_jitter(&self, interval: Duration) -> Duration {
        if self.jitter_fraction <= 0.0 {
            return interval;
        }

        let max_extra = interval.mul_f64(self.jitter_fraction);
        let extra = rand::thread_rng().gen_range(Duration::ZERO..=max_extra);
        interval + extra
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(1),
            maximum_interval: None,
            jitter_fraction: 0.2,
        }
    }
}
