use std::cmp::Ordering;

use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};

/// One measured frame of a scene, frame number relative to the scene start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameScore {
    pub frame: u32,
    pub value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ScoreList {
    pub scores: Vec<FrameScore>,
}

impl From<Vec<FrameScore>> for ScoreList {
    fn from(scores: Vec<FrameScore>) -> Self {
        ScoreList { scores }
    }
}

impl ScoreList {
    /// Pairs sorted frame indices with the scores measured on them, in order.
    pub fn zip(frames: &[u32], values: &[f64]) -> Result<Self> {
        if frames.len() != values.len() {
            return Err(eyre!(
                "Received {} scores for {} frames",
                values.len(),
                frames.len()
            ));
        }
        Ok(frames
            .iter()
            .zip(values)
            .map(|(&frame, &value)| FrameScore { frame, value })
            .collect::<Vec<_>>()
            .into())
    }

    pub fn values(&self) -> Vec<f64> {
        self.scores.iter().map(|s| s.value).collect()
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let pct = pct.clamp(0.0, 100.0);

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

pub fn median(values: &[f64]) -> f64 {
    percentile(values, 50.0)
}

/// Median absolute deviation around the median, unscaled.
pub fn median_abs_deviation(values: &[f64]) -> f64 {
    let center = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations)
}

/// Piecewise linear interpolation of `x` on increasing `xp`, holding the end values outside.
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    debug_assert_eq!(xp.len(), fp.len());
    let (Some(&first), Some(&last)) = (xp.first(), xp.last()) else {
        return f64::NAN;
    };
    if x <= first {
        return fp[0];
    }
    if x >= last {
        return fp[fp.len() - 1];
    }

    let upper = xp.partition_point(|&p| p <= x);
    let lower = upper - 1;
    let span = xp[upper] - xp[lower];
    if span == 0.0 {
        return fp[upper];
    }
    fp[lower] + (fp[upper] - fp[lower]) * (x - xp[lower]) / span
}

/// Index of the first element strictly greater than `value`.
pub fn search_sorted_right(sorted: &[u32], value: f64) -> usize {
    sorted.partition_point(|&v| f64::from(v) <= value)
}

/// Indices ordered by descending value. Equal values keep the later index first.
pub fn argsort_descending(values: &[f64]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| match values[b].total_cmp(&values[a]) {
        Ordering::Equal => b.cmp(&a),
        other => other,
    });
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 4.0);
        assert!((percentile(&values, 40.0) - 2.2).abs() < 1e-12);
        assert!((percentile(&values, 25.0) - 1.75).abs() < 1e-12);
    }

    #[test]
    fn median_of_even_length_averages_the_middle() {
        assert_eq!(median(&[1.0, 5.0, 2.0, 8.0]), 3.5);
    }

    #[test]
    fn mad_ignores_a_single_outlier() {
        let values = [10.0, 11.0, 9.0, 10.0, 100.0];
        assert_eq!(median(&values), 10.0);
        assert_eq!(median_abs_deviation(&values), 1.0);
    }

    #[test]
    fn interp_holds_ends_and_is_linear_inside() {
        let xp = [0.004, 0.010, 0.028, 0.034];
        let fp = [0.0, 1.0, 1.0, 0.4];
        assert_eq!(interp(0.0, &xp, &fp), 0.0);
        assert_eq!(interp(1.0, &xp, &fp), 0.4);
        assert!((interp(0.007, &xp, &fp) - 0.5).abs() < 1e-12);
        assert!((interp(0.031, &xp, &fp) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn search_sorted_right_skips_equal_values() {
        let table = [4, 9, 10, 13];
        assert_eq!(search_sorted_right(&table, 9.0), 2);
        assert_eq!(search_sorted_right(&table, 8.5), 1);
        assert_eq!(search_sorted_right(&table, 1.0), 0);
        assert_eq!(search_sorted_right(&table, 99.0), 4);
    }

    #[test]
    fn argsort_descending_prefers_later_index_on_ties() {
        let values = [0.5, 1.0, 0.5, 1.0, 0.1];
        assert_eq!(argsort_descending(&values), vec![3, 1, 2, 0, 4]);
    }
}
