//! Lock-free running averages for component statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Exponential moving average of durations, stored as nanoseconds.
///
/// The first sample seeds the average; later samples are blended in with
/// weight `alpha`.
#[derive(Debug)]
pub(crate) struct Ema {
    nanos: AtomicU64,
    alpha: f64,
}

impl Ema {
    pub(crate) const fn new(alpha: f64) -> Self {
        Self {
            nanos: AtomicU64::new(0),
            alpha,
        }
    }

    pub(crate) fn record(&self, sample: Duration) {
        let sample = u64::try_from(sample.as_nanos()).unwrap_or(u64::MAX).max(1);
        let alpha = self.alpha;
        let _ = self
            .nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == 0 {
                    Some(sample)
                } else {
                    Some((alpha * sample as f64 + (1.0 - alpha) * current as f64) as u64)
                }
            });
    }

    pub(crate) fn get(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

impl Default for Ema {
    fn default() -> Self {
        Self::new(0.1)
    }
}
