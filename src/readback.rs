use log::warn;
use serde::{Deserialize, Serialize};

/// Gathered positions with the time each was sampled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadbackSeries {
    pub positions: Vec<f64>,
    /// Seconds since the Unix epoch
    pub timestamps: Vec<f64>,
}

impl ReadbackSeries {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn push(&mut self, position: f64, timestamp: f64) {
        self.positions.push(position);
        self.timestamps.push(timestamp);
    }

    pub fn extend(&mut self, other: ReadbackSeries) {
        self.positions.extend(other.positions);
        self.timestamps.extend(other.timestamps);
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.positions
            .iter()
            .copied()
            .zip(self.timestamps.iter().copied())
    }
}

/// Timestamp the raw gathered positions of one leg.
///
/// The controller does not timestamp samples, so sample `i` is placed at the
/// middle of the segment whose entry fired its pulse:
/// `start_time + (0.5 + nr + i) * dt`. A sample count other than `n + 1`
/// is reported but the series is still returned.
pub fn align(raw: &[f64], start_time: f64, n: usize, nr: usize, dt: f64) -> ReadbackSeries {
    if raw.len() != n + 1 {
        warn!(
            "Gathered {} samples, expected {}; readback may be misaligned",
            raw.len(),
            n + 1
        );
    }

    let timestamps = (0..raw.len())
        .map(|i| start_time + (0.5 + nr as f64 + i as f64) * dt)
        .collect();

    ReadbackSeries {
        positions: raw.to_vec(),
        timestamps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_follow_segment_midpoints() {
        let raw: Vec<f64> = (0..=10).map(|i| i as f64 * 0.1).collect();
        let series = align(&raw, 1000.0, 10, 3, 0.05);

        assert_eq!(series.len(), 11);
        for i in 0..=10 {
            assert_eq!(series.timestamps[i], 1000.0 + (0.5 + 3.0 + i as f64) * 0.05);
        }
        assert_eq!(series.positions, raw);
    }

    #[test]
    fn short_readback_is_tolerated() {
        let raw = vec![0.0; 10];
        let series = align(&raw, 0.0, 10, 2, 0.1);
        assert_eq!(series.len(), 10);
        assert_eq!(series.timestamps.len(), 10);
    }

    #[test]
    fn empty_readback() {
        let series = align(&[], 5.0, 3, 2, 0.1);
        assert!(series.is_empty());
    }
}
