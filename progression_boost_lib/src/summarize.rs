use tracing::trace;

use crate::{
    config::MetricDirection,
    math::{FrameScore, mean, median, median_abs_deviation},
};

/// Reduces the sampled scores of one scene to a single value.
///
/// Frames scoring better than `median + 1.5 * MAD` are dropped so easy frames cannot dilute the
/// weak ones. The rest is interpolated over every frame between the first and last sample with a
/// monotone cubic, and the mean of that curve is penalised by its 8th-power deviation.
///
/// `scores` must be sorted by frame without duplicates.
pub fn summarize(scores: &[FrameScore], direction: MetricDirection) -> f64 {
    match scores {
        [] => f64::NAN,
        [only] => only.value,
        _ => {
            let values: Vec<f64> = scores.iter().map(|s| s.value).collect();
            let center = median(&values);
            let threshold = direction.make_better(center, median_abs_deviation(&values) * 1.5);

            let kept: Vec<FrameScore> = scores
                .iter()
                .filter(|s| direction.better(threshold, s.value) || s.value == threshold)
                .copied()
                .collect();
            trace!(
                "Trimmed {} of {} frames at threshold {threshold:.3}",
                scores.len() - kept.len(),
                scores.len()
            );

            let curve = interpolate_frames(&kept);
            let average = mean(&curve);
            let deviation = (curve.iter().map(|v| (v - average).powi(8)).sum::<f64>()
                / curve.len() as f64)
                .powf(1.0 / 8.0);

            direction.make_better(average, -deviation)
        }
    }
}

/// Values of the monotone cubic through `points` at every integer frame of their span.
fn interpolate_frames(points: &[FrameScore]) -> Vec<f64> {
    if points.len() == 1 {
        return vec![points[0].value];
    }

    let x: Vec<f64> = points.iter().map(|p| f64::from(p.frame)).collect();
    let y: Vec<f64> = points.iter().map(|p| p.value).collect();
    let slopes = pchip_slopes(&x, &y);

    let first = points[0].frame;
    let last = points[points.len() - 1].frame;
    let mut segment = 0;

    (first..=last)
        .map(|frame| {
            let t = f64::from(frame);
            while segment + 2 < x.len() && t > x[segment + 1] {
                segment += 1;
            }
            hermite(
                t,
                x[segment],
                x[segment + 1],
                y[segment],
                y[segment + 1],
                slopes[segment],
                slopes[segment + 1],
            )
        })
        .collect()
}

/// Derivatives at each knot following Fritsch and Butland, with one-sided three point ends.
fn pchip_slopes(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len();
    let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
    let m: Vec<f64> = y
        .windows(2)
        .zip(&h)
        .map(|(w, h)| (w[1] - w[0]) / h)
        .collect();

    if n == 2 {
        return vec![m[0], m[0]];
    }

    let mut d = vec![0.0; n];
    for k in 1..n - 1 {
        if m[k - 1] * m[k] > 0.0 {
            let w1 = 2.0 * h[k] + h[k - 1];
            let w2 = h[k] + 2.0 * h[k - 1];
            d[k] = (w1 + w2) / (w1 / m[k - 1] + w2 / m[k]);
        }
    }
    d[0] = edge_slope(h[0], h[1], m[0], m[1]);
    d[n - 1] = edge_slope(h[n - 2], h[n - 3], m[n - 2], m[n - 3]);
    d
}

fn edge_slope(h0: f64, h1: f64, m0: f64, m1: f64) -> f64 {
    let d = ((2.0 * h0 + h1) * m0 - h0 * m1) / (h0 + h1);
    if sign(d) != sign(m0) {
        0.0
    } else if sign(m0) != sign(m1) && d.abs() > 3.0 * m0.abs() {
        3.0 * m0
    } else {
        d
    }
}

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

fn hermite(t: f64, x0: f64, x1: f64, y0: f64, y1: f64, d0: f64, d1: f64) -> f64 {
    let h = x1 - x0;
    let s = (t - x0) / h;
    let s2 = s * s;
    let s3 = s2 * s;
    (2.0 * s3 - 3.0 * s2 + 1.0) * y0
        + (s3 - 2.0 * s2 + s) * h * d0
        + (-2.0 * s3 + 3.0 * s2) * y1
        + (s3 - s2) * h * d1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(points: &[(u32, f64)]) -> Vec<FrameScore> {
        points
            .iter()
            .map(|&(frame, value)| FrameScore { frame, value })
            .collect()
    }

    #[test]
    fn single_frame_is_returned_unchanged() {
        let single = scores(&[(7, 83.25)]);
        assert_eq!(summarize(&single, MetricDirection::HigherIsBetter), 83.25);
        assert_eq!(summarize(&single, MetricDirection::LowerIsBetter), 83.25);
    }

    #[test]
    fn constant_scores_have_no_penalty() {
        let flat = scores(&[(0, 80.0), (5, 80.0), (9, 80.0)]);
        assert!((summarize(&flat, MetricDirection::HigherIsBetter) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn far_better_outlier_is_trimmed() {
        let base = [(0, 80.0), (4, 81.0), (8, 79.5), (12, 80.5), (16, 80.0)];
        let with_outlier = [
            (0, 80.0),
            (4, 81.0),
            (8, 79.5),
            (10, 99.0),
            (12, 80.5),
            (16, 80.0),
        ];

        let without = summarize(&scores(&base), MetricDirection::HigherIsBetter);
        let with = summarize(&scores(&with_outlier), MetricDirection::HigherIsBetter);
        assert!((with - without).abs() / without < 0.03, "{with} vs {without}");
    }

    #[test]
    fn direction_decides_penalty_sign() {
        let spread = scores(&[(0, 1.0), (3, 3.0), (6, 1.0), (9, 3.0)]);
        let higher = summarize(&spread, MetricDirection::HigherIsBetter);
        let lower = summarize(&spread, MetricDirection::LowerIsBetter);
        assert!(higher < 2.0);
        assert!(lower > 1.5);
    }

    #[test]
    fn interpolation_passes_through_knots_without_overshoot() {
        let points = scores(&[(0, 1.0), (2, 3.0), (5, 3.5), (6, 0.0)]);
        let curve = interpolate_frames(&points);
        assert_eq!(curve.len(), 7);
        assert!((curve[0] - 1.0).abs() < 1e-12);
        assert!((curve[2] - 3.0).abs() < 1e-12);
        assert!((curve[5] - 3.5).abs() < 1e-12);
        assert!((curve[6] - 0.0).abs() < 1e-12);
        assert!(curve.iter().all(|&v| (0.0..=3.5).contains(&v)));
    }

    #[test]
    fn two_points_interpolate_linearly() {
        let curve = interpolate_frames(&scores(&[(10, 2.0), (14, 4.0)]));
        assert_eq!(curve, vec![2.0, 2.5, 3.0, 3.5, 4.0]);
    }
}
