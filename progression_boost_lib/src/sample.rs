use std::f64::consts::PI;

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use tracing::trace;

use crate::{
    config::SamplingConfig,
    math::{argsort_descending, percentile},
};

/// Every scene shuffles its brackets from the same seed so reruns pick the same frames.
const BRACKET_SEED: u64 = 1188246;

/// Frames of one scene worth measuring, relative to the scene start and sorted.
///
/// `scene_diffs` holds the luma difference of every frame of the scene. `encode_diffs`, when
/// present, holds the difference between the source and the first probe for the same frames.
pub fn select_frames(
    scene_diffs: &[f64],
    encode_diffs: Option<&[f64]>,
    sampling: &SamplingConfig,
) -> Vec<u32> {
    match scene_diffs.len() {
        0 => return Vec::new(),
        1 => return vec![0],
        _ => {}
    }

    // Offsets count from the second frame of the scene, so the first frame is -1.
    let diffs = &scene_diffs[1..];
    let frames = scene_diffs.len() as i64;
    let mut picked = Picked::default();

    for offset in low_pass_peaks(diffs)
        .into_iter()
        .take(sampling.peak_transformed_diff_frames)
    {
        picked.push(offset as i64);
    }
    trace!("Peaks of the smoothed diffs: {:?}", picked.offsets);

    picked.take_new(
        argsort_descending(diffs).into_iter().map(|i| i as i64),
        sampling.highest_diff_frames,
    );

    if let Some(encode_diffs) = encode_diffs
        && sampling.highest_probing_diff_frames > 0
    {
        picked.take_new(
            argsort_descending(encode_diffs)
                .into_iter()
                .map(|frame| frame as i64 - 1),
            sampling.highest_probing_diff_frames,
        );
    }

    if sampling.last_frame {
        picked.push_new(frames - 2);
    }

    let (upper, lower) = brackets(diffs);
    let separation = i64::from(sampling.diff_brackets_min_separation);
    let from_upper = picked.take_separated(&upper, sampling.upper_diff_bracket_frames, separation);

    let mut from_lower = sampling.lower_diff_bracket_frames;
    if from_upper < sampling.upper_diff_bracket_fallback_frames {
        from_lower += sampling.upper_diff_bracket_fallback_frames - from_upper;
    }

    if sampling.first_frame {
        picked.push_new(-1);
    }
    picked.take_separated(&lower, from_lower, separation);

    let mut selected: Vec<u32> = picked.offsets.iter().map(|&o| (o + 1) as u32).collect();
    selected.sort_unstable();
    selected
}

#[derive(Debug, Default)]
struct Picked {
    offsets: Vec<i64>,
}

impl Picked {
    fn push(&mut self, offset: i64) {
        self.offsets.push(offset);
    }

    fn push_new(&mut self, offset: i64) -> bool {
        let new = !self.offsets.contains(&offset);
        if new {
            self.offsets.push(offset);
        }
        new
    }

    fn take_new(&mut self, candidates: impl Iterator<Item = i64>, limit: usize) {
        let mut taken = 0;
        for offset in candidates {
            if taken >= limit {
                break;
            }
            if self.push_new(offset) {
                taken += 1;
            }
        }
    }

    /// Takes up to `limit` candidates at least `separation` frames away from every pick so far.
    fn take_separated(&mut self, candidates: &[i64], limit: usize, separation: i64) -> usize {
        let mut taken = 0;
        for &offset in candidates {
            if taken >= limit {
                break;
            }
            let crowded = self
                .offsets
                .iter()
                .any(|&existing| (existing - offset).abs() < separation);
            if !crowded {
                self.offsets.push(offset);
                taken += 1;
            }
        }
        taken
    }
}

/// Splits offsets into frames far above the typical difference and the rest, each shuffled
/// so that its two halves alternate.
fn brackets(diffs: &[f64]) -> (Vec<i64>, Vec<i64>) {
    let center = percentile(diffs, 40.0);
    let deviations: Vec<f64> = diffs.iter().map(|d| (d - center).abs()).collect();
    let bound = center + 5.0 * percentile(&deviations, 40.0);

    let (upper, lower): (Vec<i64>, Vec<i64>) =
        (0..diffs.len() as i64).partition(|&i| diffs[i as usize] > bound);

    let mut rng = StdRng::seed_from_u64(BRACKET_SEED);
    (interleave(&upper, &mut rng), interleave(&lower, &mut rng))
}

fn interleave(offsets: &[i64], rng: &mut StdRng) -> Vec<i64> {
    let mut front = offsets[..offsets.len().div_ceil(2)].to_vec();
    let mut back = offsets[offsets.len().div_ceil(2)..].to_vec();
    front.shuffle(rng);
    back.shuffle(rng);

    let mut mixed = Vec::with_capacity(offsets.len());
    let mut back = back.into_iter();
    for offset in front {
        mixed.push(offset);
        mixed.extend(back.next());
    }
    mixed
}

/// Local maxima of the diffs after dropping all but the lowest fifth of the cosine spectrum,
/// most prominent first.
fn low_pass_peaks(diffs: &[f64]) -> Vec<usize> {
    let mut spectrum = dct(diffs);
    let keep = diffs.len().div_ceil(5).max(7);
    for coefficient in spectrum.iter_mut().skip(keep) {
        *coefficient = 0.0;
    }
    let smoothed = idct(&spectrum);

    let peaks = local_maxima(&smoothed);
    let mut ranked: Vec<(usize, f64)> = peaks
        .iter()
        .map(|&peak| (peak, prominence(&smoothed, peak)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));
    ranked.into_iter().map(|(peak, _)| peak).collect()
}

fn dct(x: &[f64]) -> Vec<f64> {
    let n = x.len() as f64;
    (0..x.len())
        .map(|k| {
            2.0 * x
                .iter()
                .enumerate()
                .map(|(i, v)| v * (PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos())
                .sum::<f64>()
        })
        .collect()
}

/// Inverse of [`dct`], scaled so that `idct(dct(x)) == x`.
fn idct(spectrum: &[f64]) -> Vec<f64> {
    let n = spectrum.len() as f64;
    (0..spectrum.len())
        .map(|i| {
            let sum = spectrum[0]
                + 2.0
                    * spectrum
                        .iter()
                        .enumerate()
                        .skip(1)
                        .map(|(k, c)| c * (PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos())
                        .sum::<f64>();
            sum / (2.0 * n)
        })
        .collect()
}

/// Samples higher than their left neighbour and not lower than their right one. A flat top
/// reports its middle sample. The ends never count.
fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    let mut i = 1;
    while i + 1 < x.len() {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead + 1 < x.len() && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

/// Height of a peak above the higher of the lowest points reached on each side before the
/// signal climbs above the peak again.
fn prominence(x: &[f64], peak: usize) -> f64 {
    let left = lowest_before_rise(x, (0..=peak).rev());
    let right = lowest_before_rise(x, peak..x.len());
    x[peak] - left.max(right)
}

fn lowest_before_rise(x: &[f64], walk: impl Iterator<Item = usize>) -> f64 {
    let mut walk = walk.map(|i| x[i]);
    let Some(height) = walk.next() else {
        return f64::NAN;
    };
    walk.take_while(|&v| v <= height).fold(height, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wavy(len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| 0.02 + 0.01 * (i as f64 / 7.0).sin() + 0.002 * ((i * 37) % 11) as f64)
            .collect()
    }

    #[test]
    fn single_frame_scene_measures_that_frame() {
        assert_eq!(select_frames(&[0.3], None, &SamplingConfig::default()), vec![0]);
    }

    #[test]
    fn selection_is_sorted_unique_and_in_range() {
        let diffs = wavy(150);
        let frames = select_frames(&diffs, None, &SamplingConfig::default());
        assert!(frames.windows(2).all(|w| w[0] < w[1]));
        assert!(frames.iter().all(|&f| f < 150));
        assert_eq!(frames.first(), Some(&0));
        assert_eq!(frames.last(), Some(&149));
    }

    #[test]
    fn selection_is_deterministic() {
        let diffs = wavy(200);
        let sampling = SamplingConfig::default();
        assert_eq!(
            select_frames(&diffs, None, &sampling),
            select_frames(&diffs, None, &sampling)
        );
    }

    #[test]
    fn highest_difference_frames_are_included() {
        let mut diffs = wavy(120);
        diffs[61] = 0.9;
        let frames = select_frames(&diffs, None, &SamplingConfig::default());
        assert!(frames.contains(&61));
    }

    #[test]
    fn probe_differences_add_frames() {
        let diffs = vec![0.01; 80];
        let mut encode_diffs = vec![0.0; 80];
        encode_diffs[33] = 5.0;
        let sampling = SamplingConfig {
            peak_transformed_diff_frames: 0,
            highest_diff_frames: 0,
            highest_probing_diff_frames: 1,
            upper_diff_bracket_frames: 0,
            lower_diff_bracket_frames: 0,
            upper_diff_bracket_fallback_frames: 0,
            ..SamplingConfig::default()
        };
        assert_eq!(
            select_frames(&diffs, Some(&encode_diffs), &sampling),
            vec![0, 33, 79]
        );
    }

    #[test]
    fn crowded_bracket_frames_are_skipped() {
        let diffs = wavy(20);
        let sampling = SamplingConfig {
            peak_transformed_diff_frames: 0,
            highest_diff_frames: 0,
            diff_brackets_min_separation: 100,
            ..SamplingConfig::default()
        };
        // First and last frame only; every bracket frame is within 100 frames of the last one.
        assert_eq!(select_frames(&diffs, None, &sampling), vec![0, 19]);
    }

    #[test]
    fn dct_round_trips() {
        let x = [0.1, 0.4, -0.2, 0.0, 0.3];
        let back = idct(&dct(&x));
        for (a, b) in x.iter().zip(&back) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn peaks_rank_by_prominence_and_centre_plateaus() {
        let x = [0.0, 2.0, 1.0, 3.0, 3.0, 0.0];
        assert_eq!(local_maxima(&x), vec![1, 3]);
        assert_eq!(prominence(&x, 1), 1.0);
        assert_eq!(prominence(&x, 3), 3.0);
        assert!(local_maxima(&[1.0, 1.0, 1.0]).is_empty());
    }

    #[test]
    fn brackets_interleave_both_halves() {
        let offsets: Vec<i64> = (0..7).collect();
        let mut rng = StdRng::seed_from_u64(BRACKET_SEED);
        let mixed = interleave(&offsets, &mut rng);
        assert_eq!(mixed.len(), 7);
        for (slot, offset) in mixed.iter().enumerate() {
            assert_eq!(slot % 2 == 0, *offset < 4, "{mixed:?}");
        }
    }
}
