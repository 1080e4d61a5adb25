//! Distribution summaries for report metrics.
//!
//! Mean/min/max are exact. Percentiles come from a t-digest built over the
//! present values of one column, compressed to [`COMPRESSION`] centroids.

use serde::Serialize;
use tdigests::TDigest;

use crate::monitor::Episode;

/// Centroid budget for percentile estimation.
const COMPRESSION: usize = 100;

/// Summary of one metric over the samples where it was present.
///
/// All fields are zero when `count == 0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
}

impl MetricSummary {
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Option<f64>>,
    {
        let values: Vec<f64> = values.into_iter().flatten().filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return Self::default();
        }

        let count = values.len();
        let (min, max, sum) = values.iter().fold(
            (f64::MAX, f64::MIN, 0.0),
            |(min, max, sum), &v| (min.min(v), max.max(v), sum + v),
        );

        let mut digest = TDigest::from_values(values);
        digest.compress(COMPRESSION);

        Self {
            count,
            avg: sum / count as f64,
            min,
            max,
            p50: clamp(digest.estimate_quantile(0.5), min, max),
            p95: clamp(digest.estimate_quantile(0.95), min, max),
        }
    }
}

// Interpolated estimates can land a hair outside the observed range
fn clamp(estimate: f64, min: f64, max: f64) -> f64 {
    if estimate.is_finite() {
        estimate.clamp(min, max)
    } else {
        min
    }
}

/// Episode length statistics in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DurationStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

impl DurationStats {
    /// `None` when there are no episodes.
    pub fn from_episodes(episodes: &[Episode]) -> Option<Self> {
        if episodes.is_empty() {
            return None;
        }
        let durations = episodes.iter().map(|e| e.duration_secs);
        let total: f64 = durations.clone().sum();
        Some(Self {
            min: durations.clone().fold(f64::MAX, f64::min),
            avg: total / episodes.len() as f64,
            max: durations.fold(f64::MIN, f64::max),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_skips_missing() {
        let summary = MetricSummary::from_values(vec![Some(1.0), None, Some(3.0), Some(5.0), None]);
        assert_eq!(summary.count, 3);
        assert!((summary.avg - 3.0).abs() < 1e-9);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 5.0);
        assert!((summary.p50 - 3.0).abs() < 1.0);
    }

    #[test]
    fn test_empty_summary_is_zero() {
        assert_eq!(MetricSummary::from_values(vec![None, None]), MetricSummary::default());
        assert_eq!(MetricSummary::from_values(Vec::new()).count, 0);
    }

    #[test]
    fn test_percentiles_within_range() {
        let values: Vec<_> = (1..=1000).map(|v| Some(v as f64)).collect();
        let summary = MetricSummary::from_values(values);
        assert_eq!(summary.count, 1000);
        assert!((summary.p50 - 500.0).abs() < 25.0);
        assert!((summary.p95 - 950.0).abs() < 25.0);
        assert!(summary.p50 <= summary.p95);
        assert!(summary.p95 <= summary.max);
    }

    #[test]
    fn test_single_value() {
        let summary = MetricSummary::from_values(vec![Some(42.0)]);
        assert_eq!(summary.min, 42.0);
        assert_eq!(summary.max, 42.0);
        assert_eq!(summary.p50, 42.0);
        assert_eq!(summary.p95, 42.0);
    }

    #[test]
    fn test_duration_stats() {
        assert!(DurationStats::from_episodes(&[]).is_none());

        let episodes = [
            Episode {
                start: 0.0,
                end: 2.0,
                duration_secs: 2.0,
                ongoing: false,
            },
            Episode {
                start: 10.0,
                end: 16.0,
                duration_secs: 6.0,
                ongoing: true,
            },
        ];
        let stats = DurationStats::from_episodes(&episodes).unwrap();
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.avg, 4.0);
        assert_eq!(stats.max, 6.0);
    }
}
