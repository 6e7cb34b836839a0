//! Time-based down-sampling
//!
//! The query range is divided into `max_samples` equal steps. For each step
//! the first sample at or after the step cursor is kept, so the output stays
//! in time order, never repeats a sample and never exceeds the bound.

use crate::storage::types::{Sample, TimeRange};

/// Reduce `samples` to at most `max_samples` entries spread across `range`
///
/// A bound of 0 or 1 disables decimation, as does an input already within it.
/// `samples` must be sorted by timestamp.
pub fn decimate(samples: Vec<Sample>, range: TimeRange, max_samples: usize) -> Vec<Sample> {
    if max_samples <= 1 || samples.len() <= max_samples {
        return samples;
    }

    let step = (range.duration_micros() / max_samples as i64).max(1);
    let mut cursor = range.start;
    let mut kept = Vec::with_capacity(max_samples);
    let mut i = 0;

    while i < samples.len() && cursor <= range.end && kept.len() < max_samples {
        while i < samples.len() && samples[i].timestamp < cursor {
            i += 1;
        }
        let Some(sample) = samples.get(i) else {
            break;
        };
        kept.push(sample.clone());
        i += 1;
        cursor = cursor.saturating_add(step);
    }

    tracing::trace!("Decimated {} samples to {}", samples.len(), kept.len());
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(count: i64) -> Vec<Sample> {
        (0..count).map(|t| Sample::new(t, t as f64)).collect()
    }

    #[test]
    fn test_within_bound_untouched() {
        let samples = series(10);
        assert_eq!(decimate(samples.clone(), TimeRange::new(0, 9), 10), samples);
        assert_eq!(decimate(samples.clone(), TimeRange::new(0, 9), 0), samples);
        assert_eq!(decimate(samples.clone(), TimeRange::new(0, 9), 1), samples);
    }

    #[test]
    fn test_even_spread() {
        let kept = decimate(series(1000), TimeRange::new(0, 999), 10);
        assert_eq!(kept.len(), 10);
        let times: Vec<i64> = kept.iter().map(|s| s.timestamp).collect();
        assert_eq!(times, vec![0, 99, 198, 297, 396, 495, 594, 693, 792, 891]);
    }

    #[test]
    fn test_bounded_and_ordered() {
        // Short range relative to the bound forces the minimum step
        let kept = decimate(series(50), TimeRange::new(0, 5), 7);
        assert!(!kept.is_empty());
        assert!(kept.len() <= 7);
        assert!(kept.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_sparse_clusters_keep_nearest_following() {
        let mut samples: Vec<Sample> = (0..5).map(|t| Sample::new(t, 0.0)).collect();
        samples.extend((0..5).map(|t| Sample::new(900 + t, 1.0)));
        let kept = decimate(samples, TimeRange::new(0, 1000), 4);

        assert!(kept.len() <= 4);
        assert_eq!(kept[0].timestamp, 0);
        // Cursors at 250, 500 and 750 all land on the second cluster
        assert_eq!(kept[1].timestamp, 900);
        assert_eq!(kept[2].timestamp, 901);
    }

    #[test]
    fn test_samples_past_range_end_not_reached() {
        let samples = series(20);
        let kept = decimate(samples, TimeRange::new(0, 9), 5);
        assert!(kept.iter().all(|s| s.timestamp <= 10));
    }
}
