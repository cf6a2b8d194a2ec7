use std::sync::LazyLock;

use tracing::debug;

use crate::{
    config::ZoneConfig,
    math::{interp, percentile, search_sorted_right},
};

/// Quantizer step for every quarter crf from 0 to 63.75.
pub const QSTEP_TABLE: [u32; 256] = [
    4, 9, 10, 13, 15, 17, 20, 22, 25, 28, 31, 34, 37, 40, 43, 47, 50, 53, 57, 60, 64, 68, 71, 75,
    78, 82, 86, 90, 93, 97, 101, 105, 109, 113, 116, 120, 124, 128, 132, 136, 140, 143, 147, 151,
    155, 159, 163, 166, 170, 174, 178, 182, 185, 189, 193, 197, 200, 204, 208, 212, 215, 219, 223,
    226, 230, 233, 237, 241, 244, 248, 251, 255, 259, 262, 266, 269, 273, 276, 280, 283, 287, 290,
    293, 297, 300, 304, 307, 310, 314, 317, 321, 324, 327, 331, 334, 337, 343, 350, 356, 362, 369,
    375, 381, 387, 394, 400, 406, 412, 418, 424, 430, 436, 442, 448, 454, 460, 466, 472, 478, 484,
    490, 499, 507, 516, 525, 533, 542, 550, 559, 567, 576, 584, 592, 601, 609, 617, 625, 634, 644,
    655, 666, 676, 687, 698, 708, 718, 729, 739, 749, 759, 770, 782, 795, 807, 819, 831, 844, 856,
    868, 880, 891, 906, 920, 933, 947, 961, 975, 988, 1001, 1015, 1030, 1045, 1061, 1076, 1090,
    1105, 1120, 1137, 1153, 1170, 1186, 1202, 1218, 1236, 1253, 1271, 1288, 1306, 1323, 1342, 1361,
    1379, 1398, 1416, 1436, 1456, 1476, 1496, 1516, 1537, 1559, 1580, 1601, 1624, 1647, 1670, 1692,
    1717, 1741, 1766, 1791, 1817, 1844, 1871, 1900, 1929, 1958, 1990, 2021, 2054, 2088, 2123, 2159,
    2197, 2236, 2276, 2319, 2363, 2410, 2458, 2508, 2561, 2616, 2675, 2737, 2802, 2871, 2944, 3020,
    3102, 3188, 3280, 3375, 3478, 3586, 3702, 3823, 3953, 4089, 4236, 4394, 4559, 4737, 4929, 5130,
    5347,
];

pub const FIRST_QSTEP: u32 = 343;
pub const SECOND_QSTEP_LOWER_QUALITY: u32 = 891;
pub const SECOND_QSTEP_HIGHER_QUALITY: u32 = 155;

const PANNING_DIFFS: [f64; 4] = [0.004, 0.010, 0.028, 0.034];
const PANNING_CONFIDENCE: [f64; 4] = [0.0, 1.0, 1.0, 0.4];

static QSTEP_AXIS: LazyLock<(Vec<f64>, Vec<f64>)> = LazyLock::new(|| {
    (
        QSTEP_TABLE.iter().map(|&q| f64::from(q)).collect(),
        (0..QSTEP_TABLE.len()).map(|i| i as f64).collect(),
    )
});

/// The second probe goes to the side of the target the first one missed.
pub fn second_qstep(first_score: f64, zone: &ZoneConfig) -> u32 {
    if zone.metric_direction.better(first_score, zone.metric_target) {
        SECOND_QSTEP_LOWER_QUALITY
    } else {
        SECOND_QSTEP_HIGHER_QUALITY
    }
}

/// The largest quarter crf whose step does not exceed `qstep`.
pub fn probe_crf(qstep: u32) -> f64 {
    search_sorted_right(&QSTEP_TABLE, f64::from(qstep)).saturating_sub(1) as f64 / 4.0
}

/// Continuous inverse of the step table.
pub fn crf_from_qstep(qstep: f64) -> f64 {
    let (steps, indices) = &*QSTEP_AXIS;
    interp(qstep, steps, indices) / 4.0
}

pub fn format_crf(crf: f64, quarterstep: bool) -> String {
    if quarterstep {
        format!("{crf:.2}")
    } else {
        format!("{crf:.0}")
    }
}

/// How much a scene looks like a camera pan, from the lower quartile of its frame differences.
pub fn panning_confidence(scene_diffs: &[f64]) -> f64 {
    if scene_diffs.is_empty() {
        return 0.0;
    }
    interp(
        percentile(scene_diffs, 25.0),
        &PANNING_DIFFS,
        &PANNING_CONFIDENCE,
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probe {
    pub qstep: u32,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveKind {
    /// Interpolated or extrapolated from both probes.
    Linear,
    /// The probes contradicted each other; the step between them is used.
    Midpoint,
    /// The probes contradicted each other in a way that leaves no usable estimate.
    Unreliable,
    /// Measuring is disabled for the zone.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Solution {
    pub crf: f64,
    pub preset: i32,
    pub kind: SolveKind,
    /// Solved step before damping, for linear solutions.
    pub qstep: Option<f64>,
}

/// Solves for the crf that meets the zone target from two probes of one scene.
///
/// The probe spending more quality, the one with the lower step, is expected to score better.
/// When it does, score is modelled as linear in step. When it does not, the measurement is noise
/// and a fallback is used: the mean step if the first probe had the lower step, the zone's
/// unreliable crf otherwise.
pub fn solve(first: Probe, second: Probe, panning: f64, zone: &ZoneConfig) -> Solution {
    let direction = zone.metric_direction;
    let preset = zone.final_preset;

    let solution = if first.qstep < second.qstep {
        if direction.better(first.score, second.score) {
            let target = panned_target(zone, 0.20, panning, second.score - first.score);
            linear(first, second, target, zone)
        } else {
            debug!(
                "Probes contradict ({} at {}, {} at {}), using the midpoint",
                first.score, first.qstep, second.score, second.qstep
            );
            let mid = (f64::from(first.qstep) + f64::from(second.qstep)) / 2.0;
            Solution {
                crf: zone.clamp_crf(crf_from_qstep(mid)),
                preset,
                kind: SolveKind::Midpoint,
                qstep: None,
            }
        }
    } else if direction.better(second.score, first.score) {
        let target = panned_target(zone, 0.40, panning, first.score - second.score);
        linear(first, second, target, zone)
    } else {
        debug!(
            "Probes contradict ({} at {}, {} at {}), using the unreliable fallback",
            first.score, first.qstep, second.score, second.qstep
        );
        Solution {
            crf: zone.clamp_crf(zone.unreliable_crf_fallback()),
            preset,
            kind: SolveKind::Unreliable,
            qstep: None,
        }
    };

    match &zone.dynamic_crf {
        Some(dampening) => Solution {
            crf: dampening.apply(solution.crf),
            ..solution
        },
        None => solution,
    }
}

pub fn solve_disabled(zone: &ZoneConfig) -> Solution {
    Solution {
        crf: zone.clamp_crf(zone.metric_disabled_base_crf),
        preset: zone.final_preset,
        kind: SolveKind::Disabled,
        qstep: None,
    }
}

/// Moves the target towards the worse probe by `weight * sigma * confidence * gap`.
fn panned_target(zone: &ZoneConfig, weight: f64, panning: f64, gap: f64) -> f64 {
    if panning == 0.0 {
        zone.metric_target
    } else {
        zone.metric_target + weight * zone.panning_rejection_sigma * panning * gap
    }
}

fn linear(first: Probe, second: Probe, target: f64, zone: &ZoneConfig) -> Solution {
    let (q1, q2) = (f64::from(first.qstep), f64::from(second.qstep));
    let qstep = q1 + (target - first.score) * (q2 - q1) / (second.score - first.score);

    let mut crf = zone.clamp_crf(crf_from_qstep(qstep));
    let knee = zone.damping.knee;
    if qstep > knee
        && let Some(factor) = zone.damping.factor(zone.probing_preset, zone.final_preset)
    {
        let damped = (qstep - knee) * factor + knee;
        crf = zone.clamp_crf(crf_from_qstep(damped));
        debug!("Damped step {qstep:.1} to {damped:.1} (factor {factor})");
    }

    Solution {
        crf,
        preset: zone.final_preset,
        kind: SolveKind::Linear,
        qstep: Some(qstep),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CrfDampening, MetricDirection};

    fn zone() -> ZoneConfig {
        ZoneConfig {
            metric_min_crf: 0.0,
            metric_max_crf: 70.0,
            ..ZoneConfig::default()
        }
    }

    #[test]
    fn table_is_strictly_increasing() {
        assert!(QSTEP_TABLE.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn probe_steps_map_to_quarter_crfs() {
        assert_eq!(probe_crf(FIRST_QSTEP), 24.0);
        assert_eq!(probe_crf(SECOND_QSTEP_LOWER_QUALITY), 40.0);
        assert_eq!(probe_crf(SECOND_QSTEP_HIGHER_QUALITY), 11.0);
        assert_eq!(probe_crf(342), 23.75);
        assert_eq!(format_crf(23.75, true), "23.75");
        assert_eq!(format_crf(24.0, false), "24");
    }

    #[test]
    fn crf_from_qstep_inverts_the_table() {
        assert_eq!(crf_from_qstep(343.0), 24.0);
        assert!((crf_from_qstep(346.5) - 24.125).abs() < 1e-12);
        assert_eq!(crf_from_qstep(1.0), 0.0);
        assert_eq!(crf_from_qstep(9999.0), 63.75);
    }

    #[test]
    fn second_probe_follows_the_first_score() {
        let zone = ZoneConfig::default();
        assert_eq!(second_qstep(90.0, &zone), 891);
        assert_eq!(second_qstep(70.0, &zone), 155);
    }

    #[test]
    fn consistent_probes_solve_between_them() {
        let zone = zone();
        let first = Probe {
            qstep: 343,
            score: 88.0,
        };
        let second = Probe {
            qstep: 891,
            score: 78.0,
        };
        let solution = solve(first, second, 0.0, &zone);
        assert_eq!(solution.kind, SolveKind::Linear);
        let qstep = solution.qstep.unwrap();
        assert!((qstep - 562.2).abs() < 1e-9);
        assert!(qstep > 343.0 && qstep < 891.0);
        assert!(solution.crf > crf_from_qstep(163.0) && solution.crf < 40.0);
    }

    #[test]
    fn contradicting_probes_fall_back_to_the_midpoint() {
        let zone = zone();
        let first = Probe {
            qstep: 343,
            score: 78.0,
        };
        let second = Probe {
            qstep: 891,
            score: 80.0,
        };
        let solution = solve(first, second, 0.0, &zone);
        assert_eq!(solution.kind, SolveKind::Midpoint);
        assert_eq!(solution.crf, crf_from_qstep(617.0));
        assert!(solution.crf >= 24.0 && solution.crf <= 40.0);
    }

    #[test]
    fn contradicting_reversed_probes_use_the_unreliable_crf() {
        let zone = ZoneConfig::default();
        let first = Probe {
            qstep: 343,
            score: 80.0,
        };
        let second = Probe {
            qstep: 155,
            score: 79.0,
        };
        let solution = solve(first, second, 0.0, &zone);
        assert_eq!(solution.kind, SolveKind::Unreliable);
        assert_eq!(solution.crf, 17.0);
    }

    #[test]
    fn damping_pulls_high_steps_towards_the_knee() {
        let zone = zone();
        let first = Probe {
            qstep: 343,
            score: 80.0,
        };
        let second = Probe {
            qstep: 155,
            score: 90.0,
        };
        let solution = solve(first, second, 0.0, &zone);
        let qstep = solution.qstep.unwrap();
        assert!((qstep - 267.8).abs() < 1e-9);
        let damped = (qstep - 163.0) * 0.73 + 163.0;
        assert!((solution.crf - crf_from_qstep(damped)).abs() < 1e-12);
        assert!(solution.crf < crf_from_qstep(qstep));
    }

    #[test]
    fn panning_lowers_the_target() {
        let zone = zone();
        let first = Probe {
            qstep: 343,
            score: 88.0,
        };
        let second = Probe {
            qstep: 891,
            score: 78.0,
        };
        let still = solve(first, second, 0.0, &zone);
        let panning = solve(first, second, 1.0, &zone);
        assert!(panning.qstep.unwrap() > still.qstep.unwrap());
        assert!(panning.crf > still.crf);
    }

    #[test]
    fn panning_confidence_follows_breakpoints() {
        assert_eq!(panning_confidence(&[0.001; 8]), 0.0);
        assert_eq!(panning_confidence(&[0.02; 8]), 1.0);
        assert!((panning_confidence(&[0.05; 8]) - 0.4).abs() < 1e-12);
        assert_eq!(panning_confidence(&[]), 0.0);
    }

    #[test]
    fn lower_is_better_metrics_mirror_the_decisions() {
        let zone = ZoneConfig {
            metric_direction: MetricDirection::LowerIsBetter,
            metric_target: 0.5,
            ..zone()
        };
        let first = Probe {
            qstep: 343,
            score: 0.3,
        };
        let second = Probe {
            qstep: 891,
            score: 0.8,
        };
        let solution = solve(first, second, 0.0, &zone);
        assert_eq!(solution.kind, SolveKind::Linear);
        let qstep = solution.qstep.unwrap();
        assert!(qstep > 343.0 && qstep < 891.0);
    }

    #[test]
    fn dynamic_crf_and_disabled_zones() {
        let zone = ZoneConfig {
            dynamic_crf: Some(CrfDampening::Linear {
                below: 30.0,
                factor: 0.5,
            }),
            ..ZoneConfig::default()
        };
        let first = Probe {
            qstep: 343,
            score: 80.0,
        };
        let second = Probe {
            qstep: 155,
            score: 79.0,
        };
        assert_eq!(solve(first, second, 0.0, &zone).crf, 23.5);

        let disabled = solve_disabled(&ZoneConfig::default());
        assert_eq!(disabled.crf, 28.0);
        assert_eq!(disabled.preset, 2);
        assert_eq!(disabled.kind, SolveKind::Disabled);
    }
}
