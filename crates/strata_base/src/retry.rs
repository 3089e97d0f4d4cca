//! Bounded exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct Options {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the backoff added or subtracted at random.
    pub randomization_factor: f64,
    /// `None` retries forever.
    pub max_retries: Option<usize>,
    /// When this token fires the loop reports exhaustion on the next step.
    pub closer: Option<CancellationToken>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            randomization_factor: 0.15,
            max_retries: None,
            closer: None,
        }
    }
}

/// Drives a retry loop: the first `next()` returns immediately, later calls
/// sleep the backoff first.
///
/// ```ignore
/// let mut r = retry::start(opts);
/// while r.next().await {
///     // attempt
/// }
/// ```
pub struct Retry {
    opts: Options,
    attempt: usize,
}

pub fn start(opts: Options) -> Retry {
    Retry { opts, attempt: 0 }
}

impl Retry {
    pub async fn next(&mut self) -> bool {
        if let Some(closer) = &self.opts.closer {
            if closer.is_cancelled() {
                return false;
            }
        }
        if self.attempt == 0 {
            self.attempt = 1;
            return true;
        }
        if let Some(max) = self.opts.max_retries {
            if self.attempt > max {
                return false;
            }
        }
        let backoff = self.backoff_for(self.attempt - 1);
        self.attempt += 1;
        match &self.opts.closer {
            Some(closer) => tokio::select! {
                _ = closer.cancelled() => false,
                _ = tokio::time::sleep(backoff) => true,
            },
            None => {
                tokio::time::sleep(backoff).await;
                true
            }
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempt
    }

    fn backoff_for(&self, exponent: usize) -> Duration {
        let base = self.opts.initial_backoff.as_secs_f64()
            * self.opts.multiplier.powi(exponent.min(63) as i32);
        let capped = base.min(self.opts.max_backoff.as_secs_f64());
        let jitter = if self.opts.randomization_factor > 0.0 {
            let f = self.opts.randomization_factor;
            1.0 + rand::thread_rng().gen_range(-f..=f)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}
