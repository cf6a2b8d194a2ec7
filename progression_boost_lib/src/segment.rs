use std::sync::LazyLock;

use tracing::{debug, trace};

use crate::{
    config::{LumaRange, SplitConfig},
    error::BoostError,
    scenes::Scene,
};

/// Differences below this mark a frame as fully static.
const STILL_0012: f64 = 0.0012;
/// Differences below this mark a frame as nearly static.
const STILL_0042: f64 = 0.0042;

/// Tried coarse to fine. A side of `k * n + 1` frames lines up with the encoder's mini-GOPs.
const MODULI: [u32; 5] = [32, 16, 8, 4, 2];

pub const WWXD_WEIGHT: f64 = 0.88;
pub const X264_WEIGHT: f64 = 0.94;

const LUMA_SCENECUT_SCALE: f64 = 1.70;
const LUMA_SCENECUT_OFFSET: f64 = 1.24;

/// Frames that are close to pure black or pure white. A frame is also flagged when the frame
/// before it was, so both sides of a fade boundary are covered. Frame 0 is always flagged.
pub fn luma_scenecut(min: &[f64], max: &[f64], bits: u32, range: LumaRange) -> Vec<bool> {
    let scale = 2f64.powi(bits as i32 - 8);
    let (white, black) = match range {
        LumaRange::Limited => (231.125 * scale, 19.875 * scale),
        LumaRange::Full => (251.125 * scale, 3.875 * scale),
    };

    let mut previous = true;
    min.iter()
        .zip(max)
        .map(|(&min, &max)| {
            let current = min > white || max < black;
            let flagged = current || previous;
            previous = current;
            flagged
        })
        .collect()
}

/// Combines WWXD decisions with x264 keyframe decisions when both are available.
pub fn blend_detectors(wwxd: &[f64], x264: Option<&[f64]>) -> Vec<f64> {
    match x264 {
        Some(x264) => wwxd
            .iter()
            .zip(x264)
            .map(|(w, x)| (w * WWXD_WEIGHT + x * X264_WEIGHT).min(1.0))
            .collect(),
        None => wwxd.to_vec(),
    }
}

/// Turns raw luma differences of one zone into split scores.
///
/// Each difference has its predecessor subtracted so a sustained change scores once, floored at
/// half the raw value, and kept above the still thresholds it originally passed. Fade frames get
/// a fixed boost; every other frame gets the detector signal added on top.
pub fn preprocess(raw: &[f64], luma_scenecut: &[bool], detectors: &[f64]) -> Vec<f64> {
    raw.iter()
        .enumerate()
        .map(|(i, &d)| {
            let previous = if i == 0 { 0.0 } else { raw[i - 1] };
            let mut score = (d - previous).max(d / 2.0);
            if d >= STILL_0012 {
                score = score.max(STILL_0012);
            }
            if d >= STILL_0042 {
                score = score.max(STILL_0042);
            }

            if luma_scenecut.get(i).copied().unwrap_or(false) {
                score * LUMA_SCENECUT_SCALE + LUMA_SCENECUT_OFFSET
            } else {
                score + detectors.get(i).copied().unwrap_or(0.0)
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Len {
    Min,
    Target18,
    Target12,
    Target27,
    Extra,
}

impl Len {
    fn of(self, split: &SplitConfig) -> u32 {
        match self {
            Len::Min => split.min_scene_len,
            Len::Target18 => split.target_split_18,
            Len::Target12 => split.target_split_12,
            Len::Target27 => split.extra_target_split_27,
            Len::Extra => split.extra_split,
        }
    }
}

/// Interval lengths a tier applies to.
#[derive(Debug, Clone, Copy)]
enum Guard {
    Always,
    AtLeastTwice(Len),
    AtMostTwice(Len),
    AtMost(Len),
}

impl Guard {
    fn holds(self, n: u32, split: &SplitConfig) -> bool {
        match self {
            Guard::Always => true,
            Guard::AtLeastTwice(len) => n >= 2 * len.of(split),
            Guard::AtMostTwice(len) => n <= 2 * len.of(split),
            Guard::AtMost(len) => n <= len.of(split),
        }
    }
}

/// Where the cut may land relative to the two resulting sides.
#[derive(Debug, Clone, Copy)]
enum Placement {
    Anywhere,
    OneSideWithin(Len),
    /// One side is `k * n + 1` frames.
    Aligned,
    /// One side is `k * n + 1` frames and no longer than the given length.
    AlignedWithin(Len),
}

#[derive(Debug, Clone, Copy)]
struct Search {
    threshold: f64,
    min_side: Len,
    max_side: Option<Len>,
    placement: Placement,
    /// When set, splitting must not add more than this fraction of an `extra_split` chunk.
    slack: Option<f64>,
}

fn search(threshold: f64, min_side: Len, placement: Placement) -> Search {
    Search {
        threshold,
        min_side,
        max_side: None,
        placement,
        slack: None,
    }
}

impl Search {
    fn capped(mut self, len: Len) -> Self {
        self.max_side = Some(len);
        self
    }

    fn slack(mut self, slack: f64) -> Self {
        self.slack = Some(slack);
        self
    }

    fn find(&self, interval: &Interval) -> Option<u32> {
        match self.placement {
            Placement::Aligned | Placement::AlignedWithin(_) => MODULI
                .iter()
                .find_map(|&k| self.scan(interval, Some(k))),
            Placement::Anywhere | Placement::OneSideWithin(_) => self.scan(interval, None),
        }
    }

    fn scan(&self, interval: &Interval, modulus: Option<u32>) -> Option<u32> {
        interval
            .candidates
            .iter()
            .take_while(|&&c| interval.score(c) >= self.threshold)
            .copied()
            .find(|&c| self.fits(interval, c, modulus))
    }

    fn fits(&self, interval: &Interval, cut: u32, modulus: Option<u32>) -> bool {
        let split = interval.split;
        let len = |l: Len| l.of(split);
        let (a, b) = (cut - interval.start, interval.end - cut);

        let min = len(self.min_side);
        if a < min || b < min {
            return false;
        }
        if let Some(max) = self.max_side.map(len)
            && (a > max || b > max)
        {
            return false;
        }

        let aligned = |side: u32| modulus.is_some_and(|k| side % k == 1);
        let placed = match self.placement {
            Placement::Anywhere => true,
            Placement::OneSideWithin(l) => a <= len(l) || b <= len(l),
            Placement::Aligned => aligned(a) || aligned(b),
            Placement::AlignedWithin(l) => {
                (a <= len(l) && aligned(a)) || (b <= len(l) && aligned(b))
            }
        };

        placed
            && self.slack.is_none_or(|slack| {
                let extra = split.extra_split;
                let n = interval.end - interval.start;
                let budget = (f64::from(n) / f64::from(extra) + slack).ceil();
                f64::from(a.div_ceil(extra) + b.div_ceil(extra)) <= budget
            })
    }
}

#[derive(Debug)]
enum Tier {
    Scan {
        guard: Guard,
        searches: Vec<Search>,
        /// Take the interval whole when nothing in this tier matched.
        accept_rest: bool,
    },
    Still,
}

fn scan(searches: Vec<Search>) -> Tier {
    Tier::Scan {
        guard: Guard::Always,
        searches,
        accept_rest: false,
    }
}

fn scan_if(guard: Guard, searches: Vec<Search>, accept_rest: bool) -> Tier {
    Tier::Scan {
        guard,
        searches,
        accept_rest,
    }
}

fn wide(threshold: f64) -> Tier {
    scan(vec![
        search(threshold, Len::Target12, Placement::AlignedWithin(Len::Extra)),
        search(threshold, Len::Target12, Placement::OneSideWithin(Len::Extra)),
    ])
}

fn short_side(threshold: f64) -> Tier {
    scan(vec![
        search(threshold, Len::Min, Placement::OneSideWithin(Len::Extra)).slack(0.0),
    ])
}

/// Ordered from confident, evenly sized cuts to permissive ones.
static TIERS: LazyLock<Vec<Tier>> = LazyLock::new(|| {
    use Len::*;
    use Placement::*;

    vec![
        scan_if(
            Guard::AtLeastTwice(Extra),
            vec![search(1.27, Target27, Anywhere).slack(0.40)],
            false,
        ),
        scan_if(
            Guard::AtMostTwice(Target18),
            vec![search(1.18, Min, Aligned).capped(Target18)],
            false,
        ),
        scan(vec![search(1.18, Min, AlignedWithin(Target18))]),
        scan_if(
            Guard::AtMostTwice(Target18),
            vec![search(1.18, Min, Aligned), search(1.18, Min, Anywhere)],
            true,
        ),
        scan(vec![search(1.18, Target18, AlignedWithin(Extra))]),
        scan_if(
            Guard::AtMostTwice(Target12),
            vec![search(1.12, Target18, Aligned).capped(Target12)],
            false,
        ),
        scan(vec![search(1.12, Target18, AlignedWithin(Target12))]),
        scan_if(
            Guard::AtMost(Extra),
            vec![
                search(1.12, Target18, Aligned),
                search(1.12, Target18, Anywhere),
            ],
            true,
        ),
        wide(1.12),
        short_side(1.12),
        scan_if(
            Guard::AtLeastTwice(Extra),
            vec![search(1.15, Extra, Anywhere).slack(0.50)],
            false,
        ),
        Tier::Still,
        wide(1.08),
        wide(1.02),
        short_side(1.08),
        wide(0.96),
        short_side(1.02),
        scan(vec![
            search(0.84, Target12, AlignedWithin(Extra)).slack(0.50),
            search(0.84, Target12, OneSideWithin(Extra)).slack(0.50),
            search(0.84, Target12, Anywhere).slack(0.50),
        ]),
        short_side(0.84),
        short_side(0.96),
        scan(vec![search(0.84, Min, OneSideWithin(Extra))]),
        scan(vec![search(0.09, Target12, Aligned).slack(0.05)]),
        scan(vec![
            search(f64::NEG_INFINITY, Target12, Aligned).slack(0.0),
            search(f64::NEG_INFINITY, Target12, Anywhere).slack(0.0),
        ]),
    ]
});

struct Interval<'a> {
    start: u32,
    end: u32,
    diffs: &'a [f64],
    split: &'a SplitConfig,
    /// Frames strictly inside the interval, best score first, later frame first on ties.
    candidates: Vec<u32>,
}

impl<'a> Interval<'a> {
    fn new(start: u32, end: u32, diffs: &'a [f64], split: &'a SplitConfig) -> Self {
        let mut candidates: Vec<u32> = (start + 1..end).collect();
        candidates.sort_by(|&x, &y| {
            diffs[y as usize]
                .total_cmp(&diffs[x as usize])
                .then(y.cmp(&x))
        });
        Interval {
            start,
            end,
            diffs,
            split,
            candidates,
        }
    }

    fn score(&self, frame: u32) -> f64 {
        self.diffs[frame as usize]
    }

    fn len(&self) -> u32 {
        self.end - self.start
    }
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Whole,
    Cut(u32),
    /// Everything from the frame on is static and stays one scene.
    StillTail(u32),
    /// Everything before the frame is static and stays one scene.
    StillHead(u32),
    Divided(Vec<u32>),
}

fn decide(interval: &Interval) -> Result<Outcome, BoostError> {
    let split = interval.split;
    if interval.len() < 2 * split.min_scene_len {
        return Ok(Outcome::Whole);
    }

    for (index, tier) in TIERS.iter().enumerate() {
        match tier {
            Tier::Scan {
                guard,
                searches,
                accept_rest,
            } => {
                if !guard.holds(interval.len(), split) {
                    continue;
                }
                if let Some(cut) = searches.iter().find_map(|s| s.find(interval)) {
                    trace!(
                        "Tier {index} cuts frames [{}:{}] at {cut} (score {:.4})",
                        interval.start,
                        interval.end,
                        interval.score(cut)
                    );
                    return Ok(Outcome::Cut(cut));
                }
                if *accept_rest {
                    return Ok(Outcome::Whole);
                }
            }
            Tier::Still => {
                if let Some(outcome) = still(interval) {
                    trace!(
                        "Frames [{}:{}] are partly still: {outcome:?}",
                        interval.start, interval.end
                    );
                    return Ok(outcome);
                }
            }
        }
    }

    Err(BoostError::SegmentationExhausted {
        start: interval.start,
        end: interval.end,
    })
}

fn still(interval: &Interval) -> Option<Outcome> {
    let split = interval.split;
    let (start, end, n) = (interval.start, interval.end, interval.len());
    let section = &interval.diffs[start as usize + 1..end as usize];
    let floors = [
        (STILL_0012, split.still_0012_extra_split),
        (STILL_0042, split.still_0042_extra_split),
    ];

    for (floor, cap) in floors {
        if section.iter().all(|&d| d < floor) {
            return Some(if n <= cap {
                Outcome::Whole
            } else {
                Outcome::Divided(divide(start, end, cap))
            });
        }
    }

    let chunks = |frames: u32| frames.div_ceil(split.extra_split);
    for (floor, cap) in floors {
        let first = section.iter().position(|&d| d >= floor)? as u32;
        let last = section.iter().rposition(|&d| d >= floor)? as u32;

        let rear = (start + 1 + last)
            .max(end.saturating_sub(cap))
            .max(start + split.min_scene_len);
        if end - rear > split.target_split_12 && chunks(rear - start) + 1 <= chunks(n) {
            return Some(Outcome::StillTail(rear));
        }

        let front = (start + 1 + first)
            .min(start + cap)
            .min(end - split.min_scene_len);
        if front - start > split.target_split_12 && 1 + chunks(end - front) <= chunks(n) {
            return Some(Outcome::StillHead(front));
        }
    }

    None
}

/// Cuts a static interval into near equal chunks of `16 * n + 1` frames.
fn divide(start: u32, end: u32, cap: u32) -> Vec<u32> {
    let n = end - start;
    let sections = n.div_ceil(cap);
    let per_section = f64::from(n) / f64::from(sections);
    let step = ((((per_section - 1.0) / 16.0).ceil() * 16.0) as u32 + 1).min(cap);
    (start..end).step_by(step as usize).collect()
}

/// Scene starts for one zone, relative to the zone. `diffs` are the preprocessed scores.
pub fn scene_starts(diffs: &[f64], split: &SplitConfig) -> Result<Vec<u32>, BoostError> {
    if diffs.is_empty() {
        return Ok(Vec::new());
    }

    let mut starts = Vec::new();
    let mut pending = vec![(0, diffs.len() as u32)];
    while let Some((start, end)) = pending.pop() {
        match decide(&Interval::new(start, end, diffs, split))? {
            Outcome::Whole => starts.push(start),
            Outcome::Cut(cut) => pending.extend([(start, cut), (cut, end)]),
            Outcome::StillTail(cut) => {
                starts.push(cut);
                pending.push((start, cut));
            }
            Outcome::StillHead(cut) => {
                starts.push(start);
                pending.push((cut, end));
            }
            Outcome::Divided(cuts) => starts.extend(cuts),
        }
    }

    starts.sort_unstable();
    debug!("Segmented {} frames into {} scenes", diffs.len(), starts.len());
    Ok(starts)
}

/// Scenes covering `[zone_start, zone_end)` from zone relative starts.
pub fn starts_to_scenes(starts: &[u32], zone_start: u32, zone_end: u32) -> Vec<Scene> {
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).map_or(zone_end, |&next| zone_start + next);
            Scene::new(zone_start + start, end)
        })
        .collect()
}
