//! Mergeable running statistics.
//!
//! [`RunningStats`] keeps a Welford mean/variance and a Neumaier-compensated
//! sum so a bucket can be folded incrementally, persisted, and later extended
//! with more samples (or merged with a partial aggregate computed elsewhere)
//! without accumulating floating-point drift.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    sum: f64,
    compensation: f64,
}

impl RunningStats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            sum: 0.0,
            compensation: 0.0,
        }
    }

    /// Build from an iterator of samples.
    #[must_use]
    pub fn from_samples(samples: impl IntoIterator<Item = f64>) -> Self {
        let mut stats = Self::new();
        for x in samples {
            stats.push(x);
        }
        stats
    }

    /// Fold one sample.
    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.add_compensated(x);
    }

    /// Merge another partial aggregate into this one (Chan et al.).
    #[allow(clippy::cast_precision_loss)]
    pub fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }

        let na = self.count as f64;
        let nb = other.count as f64;
        let n = na + nb;
        let delta = other.mean - self.mean;

        self.mean += delta * nb / n;
        self.m2 += other.m2 + delta * delta * na * nb / n;
        self.count += other.count;
        self.add_compensated(other.sum);
        self.add_compensated(other.compensation);
    }

    fn add_compensated(&mut self, x: f64) {
        let t = self.sum + x;
        if self.sum.abs() >= x.abs() {
            self.compensation += (self.sum - t) + x;
        } else {
            self.compensation += (x - t) + self.sum;
        }
        self.sum = t;
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub const fn mean(&self) -> f64 {
        self.mean
    }

    /// Compensated total of all samples.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum + self.compensation
    }

    /// Population variance; zero for fewer than two samples.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    #[must_use]
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: f64, b: f64) -> bool {
        let scale = a.abs().max(b.abs()).max(1.0);
        (a - b).abs() <= 1e-9 * scale
    }

    #[test]
    fn empty_stats_are_zero() {
        let stats = RunningStats::new();
        assert_eq!(stats.count(), 0);
        assert!(stats.sum().abs() < f64::EPSILON);
        assert!(stats.variance().abs() < f64::EPSILON);
    }

    #[test]
    fn mean_and_variance_match_textbook_values() {
        let stats = RunningStats::from_samples([2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(stats.count(), 8);
        assert!(close(stats.mean(), 5.0));
        assert!(close(stats.variance(), 4.0));
        assert!(close(stats.std_dev(), 2.0));
    }

    #[test]
    fn compensated_sum_survives_cancellation() {
        let stats = RunningStats::from_samples([1.0, 1e100, 1.0, -1e100]);
        assert!(close(stats.sum(), 2.0));
    }

    #[test]
    fn merge_into_empty_copies() {
        let other = RunningStats::from_samples([3.0, 5.0]);
        let mut stats = RunningStats::new();
        stats.merge(&other);
        assert_eq!(stats, other);
    }

    proptest! {
        #[test]
        fn merge_matches_sequential_push(
            values in prop::collection::vec(-1.0e6f64..1.0e6, 1..200),
            split in 0usize..200,
        ) {
            let split = split.min(values.len());
            let whole = RunningStats::from_samples(values.iter().copied());

            let mut left = RunningStats::from_samples(values[..split].iter().copied());
            let right = RunningStats::from_samples(values[split..].iter().copied());
            left.merge(&right);

            prop_assert_eq!(left.count(), whole.count());
            prop_assert!(close(left.mean(), whole.mean()));
            prop_assert!(close(left.sum(), whole.sum()));
            prop_assert!((left.variance() - whole.variance()).abs() <= 1e-6 * whole.variance().max(1.0));
        }
    }
}
