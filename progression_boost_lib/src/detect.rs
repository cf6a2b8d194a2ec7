use std::{
    fs,
    path::{Path, PathBuf},
};

use eyre::{Context, Result};
use tracing::{debug, info};

use crate::{
    encode::{Av1anJob, check_run, common_params},
    error::BoostError,
    scenes::{Scene, SceneList, ZoneOverrides},
    vapoursynth::SourcePlugin,
};

/// Zones at least this long are analysed in two halves.
const SPLIT_ZONE_LEN: u32 = 120;
/// Frames the left half reaches into the right one.
const SPLIT_OVERLAP: u32 = 4;

/// A zone whose cuts also draw on x264 keyframe decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X264Zone {
    pub index: usize,
    pub start: u32,
    pub end: u32,
    pub extra_split: u32,
    pub min_scene_len: u32,
}

/// One x264 run over part of a zone. Bounds are relative to the zone.
#[derive(Debug, Clone, PartialEq, Eq)]
struct X264Part {
    name: String,
    start: u32,
    end: u32,
    skip_first: bool,
}

impl X264Zone {
    fn len(&self) -> u32 {
        self.end - self.start
    }

    /// Long zones are cut in half so x264 looks at both ends with a fresh lookahead. The halves
    /// overlap and the right one ignores its first frame, which x264 always makes a keyframe.
    fn parts(&self) -> Vec<X264Part> {
        let len = self.len();
        if len < SPLIT_ZONE_LEN {
            return vec![X264Part {
                name: self.index.to_string(),
                start: 0,
                end: len,
                skip_first: false,
            }];
        }

        let half = len / 2;
        vec![
            X264Part {
                name: format!("{}_left", self.index),
                start: 0,
                end: half + SPLIT_OVERLAP,
                skip_first: false,
            },
            X264Part {
                name: format!("{}_right", self.index),
                start: half,
                end: len,
                skip_first: true,
            },
        ]
    }
}

fn log_path(logs: &Path, name: &str) -> PathBuf {
    logs.join(format!("{name}.log"))
}

/// Fast first-pass settings. The log is all that matters; the encode is thrown away.
fn first_pass_params(len: u32, log: &Path) -> Vec<String> {
    let mut params: Vec<String> = [
        "--output-depth",
        "10",
        "--preset",
        "veryfast",
        "--qp",
        "80",
        "--keyint",
    ]
    .map(str::to_owned)
    .to_vec();
    params.push((len + 240).to_string());
    params.extend(
        [
            "--min-keyint",
            "1",
            "--scenecut",
            "40",
            "--rc-lookahead",
            "120",
            "--ref",
            "1",
            "--aq-mode",
            "0",
            "--no-8x8dct",
            "--partition",
            "none",
            "--no-weightb",
            "--weightp",
            "0",
            "--me",
            "dia",
            "--subme",
            "2",
            "--no-psy",
            "--trellis",
            "0",
            "--no-cabac",
            "--no-deblock",
            "--slow-firstpass",
            "--pass",
            "1",
            "--stats",
        ]
        .map(str::to_owned),
    );
    params.push(log.to_string_lossy().into_owned());
    params
}

/// Scenes file that runs one x264 first pass per zone part.
pub fn x264_scene_list(zones: &[X264Zone], logs: &Path) -> SceneList {
    let mut scenes = Vec::new();
    for zone in zones {
        for part in zone.parts() {
            let (start, end) = (zone.start + part.start, zone.start + part.end);
            scenes.push(Scene {
                start_frame: start,
                end_frame: end,
                zone_overrides: Some(ZoneOverrides {
                    encoder: Some("x264".to_owned()),
                    passes: Some(1),
                    video_params: Some(first_pass_params(end - start, &log_path(logs, &part.name))),
                    photon_noise: None,
                    photon_noise_height: None,
                    photon_noise_width: None,
                    chroma_noise: Some(false),
                    extra_splits_len: Some(zone.extra_split),
                    min_scene_len: Some(zone.min_scene_len),
                }),
            });
        }
    }
    let frames = scenes.iter().map(Scene::len).sum();
    SceneList::presplit(scenes, frames)
}

/// `in:<n> out:<m> type:<T>` lines of an x264 stats file, as `(n, T)`.
fn stats_line(line: &str) -> Option<(&str, char)> {
    let is_number = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    let (input, rest) = line.strip_prefix("in:")?.split_once(' ')?;
    let (output, rest) = rest.strip_prefix("out:")?.split_once(' ')?;
    if !is_number(input) || !is_number(output) {
        return None;
    }
    let kind = rest.strip_prefix("type:")?.chars().next()?;
    (kind.is_alphanumeric() || kind == '_').then_some((input, kind))
}

/// Marks the I frames of one stats file in `keyframes`, which covers the whole zone. Frame
/// numbers in the file count from `start`.
pub fn parse_x264_stats(
    text: &str,
    start: u32,
    end: u32,
    skip_first: bool,
    keyframes: &mut [f64],
) -> Result<(), BoostError> {
    for (input, kind) in text.lines().filter_map(stats_line) {
        let offset: u32 = input
            .parse()
            .map_err(|_| BoostError::malformed("x264", format!("frame number {input} is out of range")))?;
        let frame = offset
            .checked_add(start)
            .filter(|&frame| frame < end && (frame as usize) < keyframes.len())
            .ok_or_else(|| {
                BoostError::malformed("x264", format!("frame {offset} lies outside [{start}:{end}]"))
            })?;

        if offset == 0 && skip_first {
            continue;
        }
        if kind == 'I' {
            keyframes[frame as usize] = 1.0;
        }
    }
    Ok(())
}

/// Keyframe decisions of a real encoder, used as a second opinion on where scenes change.
pub trait KeyframeDetector: Sync {
    /// One array per zone, in the order given, 1.0 where a keyframe was placed.
    fn detect(&self, zones: &[X264Zone]) -> Result<Vec<Vec<f64>>>;
}

/// Runs x264 first passes through av1an.
#[derive(Debug, Clone)]
pub struct Av1anX264 {
    pub input: PathBuf,
    pub vspipe_args: Vec<String>,
    pub source_plugin: SourcePlugin,
    /// `scene-detection/` inside the temp dir.
    pub dir: PathBuf,
    pub resume: bool,
    pub verbose: u8,
}

impl KeyframeDetector for Av1anX264 {
    fn detect(&self, zones: &[X264Zone]) -> Result<Vec<Vec<f64>>> {
        if zones.is_empty() {
            return Ok(Vec::new());
        }

        let logs = self.dir.join("x264.logs");
        fs::create_dir_all(&logs)
            .wrap_err_with(|| format!("Failed to create {}", logs.display()))?;
        let scenes_path = self.dir.join("x264.scenes.json");
        let output = self.dir.join("x264.mkv");
        x264_scene_list(zones, &logs).write_scene_list_to_file(&scenes_path)?;

        let mut params = vec![
            "--encoder".to_owned(),
            "x264".to_owned(),
            "--workers".to_owned(),
            "2".to_owned(),
        ];
        params.extend(common_params(
            self.source_plugin,
            "> progression-boost x264 scene detection <",
        ));

        let job = Av1anJob {
            input: &self.input,
            vspipe_args: &self.vspipe_args,
            temp: &self.dir.join("x264.tmp"),
            output: &output,
            scenes: &scenes_path,
            resume: self.resume,
            verbose: self.verbose,
            params,
        };
        info!("Running x264 first passes over {} zones", zones.len());
        let status = job.spawn()?.wait()?;
        check_run("av1an", status, &output)?;

        zones
            .iter()
            .map(|zone| {
                let mut keyframes = vec![0.0; zone.len() as usize];
                for part in zone.parts() {
                    let path = log_path(&logs, &part.name);
                    let text = fs::read_to_string(&path).map_err(|_| {
                        BoostError::malformed("x264", format!("{} is missing", path.display()))
                    })?;
                    parse_x264_stats(&text, part.start, part.end, part.skip_first, &mut keyframes)?;
                }
                debug!(
                    "x264 placed {} keyframes in zone {}",
                    keyframes.iter().filter(|&&k| k > 0.0).count(),
                    zone.index
                );
                Ok(keyframes)
            })
            .collect()
    }
}
