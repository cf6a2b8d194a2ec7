use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use eyre::{Context, OptionExt, Result, eyre};
use tracing::{debug, info};

use crate::{
    checkpoint::{MetricResult, SceneRecord, Stage, StageHasher, StageLedger, StageState},
    config::{Profiles, SceneDetectionMethod, ZoneConfig},
    detect::{Av1anX264, KeyframeDetector, X264Zone},
    error::BoostError,
    logging::progress_bar,
    math::ScoreList,
    metric::{MetricService, ProbeMetrics, ProbeScene},
    probe::{Av1anProbe, ProbeEncoder, ProbePass, ProbePaths, probe_scene, probe_scene_list},
    sample::select_frames,
    scenes::{Scene, SceneList, ZoneOverrides, clip_external_scenes},
    segment::{blend_detectors, luma_scenecut, preprocess, scene_starts, starts_to_scenes},
    signal::{FrameSignal, SceneSource, VapoursynthSource},
    solver::{
        FIRST_QSTEP, Probe, QSTEP_TABLE, Solution, format_crf, panning_confidence, second_qstep,
        solve, solve_disabled,
    },
    summarize::summarize,
    vapoursynth::SourcePlugin,
    zones::{ZoneEntry, ZoneMap},
};

/// Everything a run needs besides the zone profiles.
#[derive(Debug, Clone)]
pub struct BoostOptions {
    /// Reference the signal and the metrics are computed from.
    pub input: PathBuf,
    pub encode_input: PathBuf,
    pub encode_vspipe_args: Vec<String>,
    pub scene_detection_input: PathBuf,
    pub scene_detection_vspipe_args: Vec<String>,
    pub input_scenes: Option<PathBuf>,
    pub output_scenes: PathBuf,
    pub temp: PathBuf,
    pub resume: bool,
    pub verbose: u8,
    pub source_plugin: SourcePlugin,
    /// av1an workers for the probe encodes.
    pub workers: u32,
}

/// `<output>.boost.tmp` next to the output, without a trailing `.scenes`.
pub fn default_temp(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = stem.strip_suffix(".scenes").unwrap_or(&stem);
    output.with_file_name(format!("{stem}.boost.tmp"))
}

#[derive(Debug, Clone)]
struct TempLayout {
    detection: PathBuf,
    boost: PathBuf,
}

impl TempLayout {
    fn new(temp: &Path) -> Self {
        TempLayout {
            detection: temp.join("scene-detection"),
            boost: temp.join("progression-boost"),
        }
    }

    fn scenes(&self) -> PathBuf {
        self.detection.join("scenes.json")
    }

    fn stages(&self) -> PathBuf {
        self.boost.join("stages.json")
    }

    fn result(&self) -> PathBuf {
        self.boost.join("result.json")
    }

    fn create(&self) -> Result<()> {
        for dir in [&self.detection, &self.boost] {
            fs::create_dir_all(dir)
                .wrap_err_with(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Without `resume` the working directories from an earlier run are removed. Anything else the
/// user keeps in `temp` is left alone.
pub fn prepare_temp(temp: &Path, resume: bool) -> Result<()> {
    let layout = TempLayout::new(temp);
    if !resume {
        for dir in [&layout.detection, &layout.boost] {
            if dir.exists() {
                fs::remove_dir_all(dir)
                    .wrap_err_with(|| format!("Failed to remove {}", dir.display()))?;
            }
        }
    }
    layout.create()
}

/// The external collaborators of a run.
pub struct Services<'a> {
    pub source: &'a dyn SceneSource,
    pub keyframes: &'a dyn KeyframeDetector,
    pub encoder: &'a dyn ProbeEncoder,
    pub metric: &'a dyn MetricService,
}

/// Runs the whole pipeline with VapourSynth, av1an, and the configured metric.
pub fn run(options: &BoostOptions, profiles: &Profiles, zones: &[ZoneEntry]) -> Result<SceneList> {
    prepare_temp(&options.temp, options.resume)?;
    let layout = TempLayout::new(&options.temp);

    let source = VapoursynthSource::open(&options.input, options.source_plugin, &layout.detection)?;
    let keyframes = Av1anX264 {
        input: options.scene_detection_input.clone(),
        vspipe_args: options.scene_detection_vspipe_args.clone(),
        source_plugin: options.source_plugin,
        dir: layout.detection.clone(),
        resume: options.resume,
        verbose: options.verbose,
    };
    let encoder = Av1anProbe {
        input: options.encode_input.clone(),
        vspipe_args: options.encode_vspipe_args.clone(),
        source_plugin: options.source_plugin,
        workers: options.workers,
        verbose: options.verbose,
    };
    let metric = ProbeMetrics {
        source: &source,
        source_path: options.input.clone(),
        source_plugin: options.source_plugin,
        dir: layout.boost.clone(),
    };

    run_boost(
        options,
        profiles,
        zones,
        &Services {
            source: &source,
            keyframes: &keyframes,
            encoder: &encoder,
            metric: &metric,
        },
    )
}

/// Segments, probes twice, solves, and writes the boosted scenes file. Every stage is
/// checkpointed in the temp dir; with `resume` a stage whose inputs are unchanged is skipped.
pub fn run_boost(
    options: &BoostOptions,
    profiles: &Profiles,
    zones: &[ZoneEntry],
    services: &Services,
) -> Result<SceneList> {
    let layout = TempLayout::new(&options.temp);
    layout.create()?;

    let total = services.source.frame_count();
    let zone_map = ZoneMap::resolve(zones, total, profiles)?;
    let external = load_external_scenes(options, &zone_map)?;

    let mut coordinator = Coordinator {
        options,
        services,
        ledger: StageLedger::open(&layout.stages(), options.resume)?,
        layout,
    };

    println!("\n\n✧ SCENES: {total} frames in {} zones", zone_map.spans.len());
    let (segmented, scene_list, signal) = coordinator.segment(&zone_map, external.as_ref())?;
    let scenes = scene_list.scenes;
    let scene_zones = assign_zones(&scenes, &zone_map)?;
    info!("{} scenes", scenes.len());

    let result_path = coordinator.layout.result();
    let mut records = if segmented.1 == StageState::Fresh {
        MetricResult::load_or_empty(&result_path, scenes.len())
    } else {
        MetricResult::empty(scenes.len())
    };

    let targets = measured_scenes(&scenes, &scene_zones);
    let mut upstream = segmented.0;
    if targets.is_empty() {
        info!("Measuring is disabled for every scene, skipping the probe encodes");
    } else {
        for pass in [ProbePass::First, ProbePass::Second] {
            upstream = coordinator.probe(pass, &upstream, &targets, &scenes, &mut records)?;
            upstream = coordinator.measure(pass, &upstream, &targets, &signal, &mut records)?;
        }
    }

    coordinator.finalize(&upstream, &scenes, &scene_zones, &records, &signal)
}

fn load_external_scenes(options: &BoostOptions, zone_map: &ZoneMap) -> Result<Option<SceneList>> {
    let needed = zone_map
        .spans
        .iter()
        .any(|span| span.config.scene_detection_method == SceneDetectionMethod::External);
    match (&options.input_scenes, needed) {
        (Some(path), true) => SceneList::parse_scene_file(path)
            .map(Some)
            .map_err(|e| BoostError::config(format!("{e:#}")).into()),
        (None, true) => Err(BoostError::config(
            "a zone uses scene_detection_method = \"external\" but no --input-scenes was given",
        )
        .into()),
        (_, false) => Ok(None),
    }
}

/// Profile of every scene. A scene must lie inside one zone.
fn assign_zones(scenes: &[Scene], zone_map: &ZoneMap) -> Result<Vec<Arc<ZoneConfig>>> {
    scenes
        .iter()
        .map(|scene| {
            zone_map
                .zone_at(scene.start_frame)
                .filter(|span| scene.end_frame <= span.end)
                .map(|span| span.config.clone())
                .ok_or_else(|| {
                    BoostError::malformed(
                        "scenes",
                        format!(
                            "scene [{}:{}] crosses a zone boundary",
                            scene.start_frame, scene.end_frame
                        ),
                    )
                    .into()
                })
        })
        .collect()
}

/// A scene that gets probed, and where it lands in the probe encodes.
#[derive(Debug, Clone)]
struct Target {
    index: usize,
    scene: ProbeScene,
    zone: Arc<ZoneConfig>,
}

/// Metric enabled scenes, placed back to back as the probe encodes hold them.
fn measured_scenes(scenes: &[Scene], zones: &[Arc<ZoneConfig>]) -> Vec<Target> {
    let mut probe_head = 0;
    let mut targets = Vec::new();
    for (index, (scene, zone)) in scenes.iter().zip(zones).enumerate() {
        if !zone.metric_enable {
            continue;
        }
        targets.push(Target {
            index,
            scene: ProbeScene {
                start: scene.start_frame,
                end: scene.end_frame,
                probe_head,
            },
            zone: zone.clone(),
        });
        probe_head += scene.len();
    }
    targets
}

fn frame_range(start: u32, end: u32) -> std::ops::Range<usize> {
    start as usize..end as usize
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).wrap_err_with(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}

/// The luma signal from the cache, or measured and cached.
fn load_signal(source: &dyn SceneSource, dir: &Path) -> Result<FrameSignal> {
    let frames = source.frame_count();
    if let Some(signal) = FrameSignal::load_cache(dir, frames) {
        info!("Reusing the luma signal cached in {}", dir.display());
        return Ok(signal);
    }

    let signal = source.luma_signal()?;
    if signal.len() != frames as usize {
        return Err(BoostError::malformed(
            "VapourSynth",
            format!("measured {} frames of a {frames} frame clip", signal.len()),
        )
        .into());
    }
    signal.save_cache(dir)?;
    Ok(signal)
}

fn record_score(record: &SceneRecord, pass: ProbePass) -> Option<f64> {
    match pass {
        ProbePass::First => record.first_score,
        ProbePass::Second => record.second_score,
    }
}

fn record_qstep(record: &SceneRecord, pass: ProbePass) -> Option<u32> {
    match pass {
        ProbePass::First => record.first_qstep,
        ProbePass::Second => record.second_qstep,
    }
}

struct Coordinator<'s, 'a> {
    options: &'s BoostOptions,
    services: &'s Services<'a>,
    layout: TempLayout,
    ledger: StageLedger,
}

impl Coordinator<'_, '_> {
    fn segmentation_hash(&self, zone_map: &ZoneMap, external: Option<&SceneList>) -> Result<String> {
        let options = self.options;
        let mut hasher = StageHasher::new();
        hasher
            .file("input", &options.input)
            .file("scene_detection_input", &options.scene_detection_input)
            .field("frames", &zone_map.total.to_le_bytes());
        hasher.json("scene_detection_vspipe_args", &options.scene_detection_vspipe_args)?;
        if let Some(external) = external {
            hasher.json("input_scenes", external)?;
        }
        for span in &zone_map.spans {
            hasher.json(
                "zone",
                &(
                    span.start,
                    span.end,
                    &span.key,
                    span.config.scene_detection_method,
                    span.config.luma_range,
                    &span.config.split,
                ),
            )?;
        }
        Ok(hasher.finish())
    }

    /// Scene boundaries of the whole clip and the luma signal they were cut from.
    fn segment(
        &mut self,
        zone_map: &ZoneMap,
        external: Option<&SceneList>,
    ) -> Result<((String, StageState), SceneList, FrameSignal)> {
        let hash = self.segmentation_hash(zone_map, external)?;
        let scenes_path = self.layout.scenes();
        let existing = SceneList::parse_scene_file(&scenes_path)
            .ok()
            .filter(|list| list.frames == zone_map.total && list.check_partition().is_ok());

        let state = self.ledger.enter(Stage::Segmented, &hash, existing.is_some())?;
        if let (StageState::Fresh, Some(list)) = (state, existing) {
            let signal = load_signal(self.services.source, &self.layout.detection)?;
            return Ok(((hash, state), list, signal));
        }

        if state == StageState::Stale {
            FrameSignal::remove_cache(&self.layout.detection)?;
            remove_dir_if_exists(&self.layout.detection.join("x264.tmp"))?;
            remove_dir_if_exists(&self.layout.detection.join("x264.logs"))?;
        }

        let x264_zones: Vec<X264Zone> = zone_map
            .spans
            .iter()
            .enumerate()
            .filter(|(_, span)| {
                span.config.scene_detection_method == SceneDetectionMethod::X264Vapoursynth
            })
            .map(|(index, span)| X264Zone {
                index,
                start: span.start,
                end: span.end,
                extra_split: span.config.split.extra_split,
                min_scene_len: span.config.split.min_scene_len,
            })
            .collect();

        // x264 runs in av1an while the luma signal is measured here.
        let keyframes = self.services.keyframes;
        let source = self.services.source;
        let detection = &self.layout.detection;
        let (detected, signal) = thread::scope(|scope| {
            let detector = scope.spawn(|| keyframes.detect(&x264_zones));
            let signal = load_signal(source, detection);
            let detected = detector
                .join()
                .map_err(|_| eyre!("x264 scene detection panicked"))?;
            Ok::<_, eyre::Report>((detected?, signal?))
        })?;

        let mut x264_by_zone: Vec<Option<Vec<f64>>> = vec![None; zone_map.spans.len()];
        for (zone, keyframes) in x264_zones.iter().zip(detected) {
            x264_by_zone[zone.index] = Some(keyframes);
        }

        let bits = source.bits_per_sample();
        let mut scenes = Vec::new();
        for (index, span) in zone_map.spans.iter().enumerate() {
            let zone_scenes = match (span.config.scene_detection_method, external) {
                (SceneDetectionMethod::External, Some(external)) => {
                    clip_external_scenes(&external.scenes, span.start, span.end)?
                }
                (SceneDetectionMethod::External, None) => {
                    return Err(eyre!("zone {index} needs --input-scenes"));
                }
                _ => {
                    let range = frame_range(span.start, span.end);
                    let wwxd = source.wwxd(span.start, span.end)?;
                    let detectors = blend_detectors(&wwxd, x264_by_zone[index].as_deref());
                    let fades = luma_scenecut(
                        &signal.min[range.clone()],
                        &signal.max[range.clone()],
                        bits,
                        span.config.luma_range,
                    );
                    let diffs = preprocess(&signal.diff[range], &fades, &detectors);
                    let starts = scene_starts(&diffs, &span.config.split)?;
                    starts_to_scenes(&starts, span.start, span.end)
                }
            };
            debug!(
                "Zone {index} \"{}\" [{}:{}]: {} scenes",
                span.key,
                span.start,
                span.end,
                zone_scenes.len()
            );
            scenes.extend(zone_scenes);
        }

        let list = SceneList {
            scenes,
            split_scenes: None,
            frames: zone_map.total,
        };
        list.check_partition()?;
        list.write_scene_list_to_file(&scenes_path)?;
        Ok(((hash, state), list, signal))
    }

    /// Encodes every target at the step of `pass`.
    fn probe(
        &mut self,
        pass: ProbePass,
        upstream: &str,
        targets: &[Target],
        scenes: &[Scene],
        records: &mut MetricResult,
    ) -> Result<String> {
        let qsteps = targets
            .iter()
            .map(|target| match pass {
                ProbePass::First => Ok(FIRST_QSTEP),
                ProbePass::Second => {
                    let score = records.scenes[target.index]
                        .first_score
                        .ok_or_eyre("Scene was not measured in the first pass")?;
                    Ok(second_qstep(score, &target.zone))
                }
            })
            .collect::<Result<Vec<u32>>>()?;
        let list = probe_scene_list(
            targets
                .iter()
                .zip(&qsteps)
                .map(|(target, &qstep)| probe_scene(&scenes[target.index], &target.zone, qstep))
                .collect(),
        );
        let paths = ProbePaths::new(&self.layout.boost, pass);

        let mut hasher = StageHasher::new();
        hasher
            .text("upstream", upstream)
            .file("encode_input", &self.options.encode_input);
        hasher.json("encode_vspipe_args", &self.options.encode_vspipe_args)?;
        hasher.json("qstep_table", &QSTEP_TABLE[..])?;
        hasher.json("scenes", &list)?;
        let hash = hasher.finish();

        let stage = match pass {
            ProbePass::First => Stage::FirstProbed,
            ProbePass::Second => Stage::SecondProbed,
        };
        let complete = paths.output.exists()
            && targets
                .iter()
                .zip(&qsteps)
                .all(|(target, &qstep)| record_qstep(&records.scenes[target.index], pass) == Some(qstep));
        let state = self.ledger.enter(stage, &hash, complete)?;
        if state == StageState::Fresh {
            return Ok(hash);
        }

        if state == StageState::Stale {
            remove_dir_if_exists(&paths.temp)?;
        }
        for (target, &qstep) in targets.iter().zip(&qsteps) {
            let record = &mut records.scenes[target.index];
            match pass {
                ProbePass::First => {
                    record.clear_first();
                    record.first_qstep = Some(qstep);
                }
                ProbePass::Second => {
                    record.clear_second();
                    record.second_qstep = Some(qstep);
                }
            }
        }
        records.save(&self.layout.result())?;
        list.write_scene_list_to_file(&paths.scenes)?;

        println!(
            "\n\n✧ PROBE: {pass} pass, {} scenes, {} frames",
            list.scenes.len(),
            list.frames
        );
        self.services
            .encoder
            .encode(pass, &list, &paths, state == StageState::Resumable)?;
        Ok(hash)
    }

    /// Scores every target against the probe encode of `pass`, saving after each scene.
    fn measure(
        &mut self,
        pass: ProbePass,
        upstream: &str,
        targets: &[Target],
        signal: &FrameSignal,
        records: &mut MetricResult,
    ) -> Result<String> {
        let mut hasher = StageHasher::new();
        hasher.text("upstream", upstream);
        for target in targets {
            let zone = &target.zone;
            hasher.json(
                "metric",
                &(
                    zone.metric_method,
                    &zone.ffvship_metric,
                    &zone.ffvship_params,
                    zone.metric_direction,
                    &zone.sampling,
                ),
            )?;
        }
        let hash = hasher.finish();

        let stage = match pass {
            ProbePass::First => Stage::FirstMeasured,
            ProbePass::Second => Stage::SecondMeasured,
        };
        let complete = targets
            .iter()
            .all(|target| record_score(&records.scenes[target.index], pass).is_some());
        let state = self.ledger.enter(stage, &hash, complete)?;
        if state == StageState::Fresh {
            return Ok(hash);
        }

        if state == StageState::Stale {
            for target in targets {
                let record = &mut records.scenes[target.index];
                match pass {
                    ProbePass::First => {
                        record.frames = None;
                        record.first_score = None;
                        record.first_frame_scores.clear();
                    }
                    ProbePass::Second => {
                        record.second_score = None;
                        record.second_frame_scores.clear();
                    }
                }
            }
        }

        let pending: Vec<&Target> = targets
            .iter()
            .filter(|target| record_score(&records.scenes[target.index], pass).is_none())
            .collect();
        println!("\n\n✧ METRIC: {pass} pass, {} scenes", pending.len());

        let result_path = self.layout.result();
        let probe = ProbePaths::new(&self.layout.boost, pass).output;
        let mut session = self.services.metric.open(pass, &probe)?;
        let pb = progress_bar(pending.len() as u64, "Measuring probe scenes");

        for target in pending {
            let zone = &target.zone;
            let frames = match pass {
                ProbePass::First => {
                    let encode_diffs = if zone.sampling.highest_probing_diff_frames > 0 {
                        Some(session.encode_diffs(&target.scene)?)
                    } else {
                        None
                    };
                    select_frames(
                        &signal.diff[frame_range(target.scene.start, target.scene.end)],
                        encode_diffs.as_deref(),
                        &zone.sampling,
                    )
                }
                ProbePass::Second => records.scenes[target.index]
                    .frames
                    .clone()
                    .ok_or_eyre("Sampled frames of the first pass are missing")?,
            };

            let values = session
                .scores(&target.scene, &frames, zone)
                .wrap_err_with(|| {
                    format!(
                        "Failed to measure scene [{}:{}]",
                        target.scene.start, target.scene.end
                    )
                })?;
            let scores = ScoreList::zip(&frames, &values)?.scores;
            let summary = summarize(&scores, zone.metric_direction);
            if !summary.is_finite() {
                return Err(BoostError::malformed(
                    "metric",
                    format!(
                        "scene [{}:{}] has no usable score",
                        target.scene.start, target.scene.end
                    ),
                )
                .into());
            }
            debug!(
                "Scene [{}:{}] {pass} pass: {summary:.3} from {} frames",
                target.scene.start,
                target.scene.end,
                frames.len()
            );

            let record = &mut records.scenes[target.index];
            match pass {
                ProbePass::First => {
                    record.frames = Some(frames);
                    record.first_score = Some(summary);
                    record.first_frame_scores = scores;
                }
                ProbePass::Second => {
                    record.second_score = Some(summary);
                    record.second_frame_scores = scores;
                }
            }
            records.save(&result_path)?;
            pb.inc(1);
        }
        pb.finish();
        Ok(hash)
    }

    /// Solves every scene and writes the boosted scenes file.
    fn finalize(
        &mut self,
        upstream: &str,
        scenes: &[Scene],
        zones: &[Arc<ZoneConfig>],
        records: &MetricResult,
        signal: &FrameSignal,
    ) -> Result<SceneList> {
        let mut hasher = StageHasher::new();
        hasher.text("upstream", upstream);
        hasher.json("qstep_table", &QSTEP_TABLE[..])?;
        hasher.json("zones", &zones.iter().map(Arc::as_ref).collect::<Vec<_>>())?;
        let solved = hasher.finish();
        self.ledger.enter(Stage::Solved, &solved, true)?;

        let mut boosted = Vec::with_capacity(scenes.len());
        let mut crfs = Vec::with_capacity(scenes.len());
        for ((scene, zone), record) in scenes.iter().zip(zones).zip(&records.scenes) {
            let solution = solve_scene(scene, zone, record, signal)?;
            let crf = final_crf(&solution, zone);
            crfs.push(crf);
            boosted.push(final_scene(scene, zone, &solution, crf));
        }
        let frames = scenes.last().map_or(0, |scene| scene.end_frame);
        let list = SceneList::presplit(boosted, frames);

        let json = list.to_json()?;
        let output = &self.options.output_scenes;
        let mut hasher = StageHasher::new();
        hasher.text("upstream", &solved).text("scenes", &json);
        let complete = fs::read_to_string(output).is_ok_and(|existing| existing == json);
        if self.ledger.enter(Stage::Finalized, &hasher.finish(), complete)? != StageState::Fresh {
            list.write_scene_list_to_file(output)?;
        }

        println!("\n\n✧ RESULT: Boosting result");
        for line in histogram_lines(&crf_histogram(scenes, &crfs)) {
            println!("{line}");
        }
        println!("\nScenes file written to {}", output.display());
        Ok(list)
    }
}

fn solve_scene(
    scene: &Scene,
    zone: &ZoneConfig,
    record: &SceneRecord,
    signal: &FrameSignal,
) -> Result<Solution> {
    if !zone.metric_enable {
        return Ok(solve_disabled(zone));
    }
    let missing = || {
        eyre!(
            "Scene [{}:{}] is missing a probe result",
            scene.start_frame,
            scene.end_frame
        )
    };
    let first = Probe {
        qstep: record.first_qstep.ok_or_else(missing)?,
        score: record.first_score.ok_or_else(missing)?,
    };
    let second = Probe {
        qstep: record.second_qstep.ok_or_else(missing)?,
        score: record.second_score.ok_or_else(missing)?,
    };
    let panning = panning_confidence(&signal.diff[frame_range(scene.start_frame, scene.end_frame)]);
    let solution = solve(first, second, panning, zone);
    debug!(
        "Scene [{}:{}]: crf {:.2} ({:?}), panning {panning:.2}",
        scene.start_frame, scene.end_frame, solution.crf, solution.kind
    );
    Ok(solution)
}

/// Floored at the zone minimum and rounded to what the encoder accepts.
fn final_crf(solution: &Solution, zone: &ZoneConfig) -> f64 {
    let crf = solution.crf.max(zone.final_min_crf);
    if zone.quarterstep_crf {
        (crf * 4.0).round() / 4.0
    } else {
        crf.round()
    }
}

fn final_scene(scene: &Scene, zone: &ZoneConfig, solution: &Solution, crf: f64) -> Scene {
    let mut video_params = vec![
        "--crf".to_owned(),
        format_crf(crf, zone.quarterstep_crf),
        "--preset".to_owned(),
        solution.preset.to_string(),
    ];
    video_params.extend(zone.final_params.iter().cloned());

    Scene {
        start_frame: scene.start_frame,
        end_frame: scene.end_frame,
        zone_overrides: Some(ZoneOverrides {
            encoder: Some(zone.encoder.clone()),
            passes: Some(1),
            video_params: Some(video_params),
            photon_noise: zone.photon_noise,
            photon_noise_height: zone.photon_noise_height,
            photon_noise_width: zone.photon_noise_width,
            chroma_noise: Some(zone.chroma_noise),
            extra_splits_len: Some(zone.split.extra_split),
            min_scene_len: Some(zone.split.min_scene_len),
        }),
    }
}

/// Frames per crf decade. The last bucket holds everything from 90 up.
fn crf_histogram(scenes: &[Scene], crfs: &[f64]) -> [u64; 10] {
    let mut buckets = [0; 10];
    for (scene, crf) in scenes.iter().zip(crfs) {
        let bucket = ((crf / 10.0).floor().max(0.0) as usize).min(9);
        buckets[bucket] += u64::from(scene.len());
    }
    buckets
}

fn histogram_lines(buckets: &[u64; 10]) -> Vec<String> {
    let (Some(first), Some(last)) = (
        buckets.iter().position(|&n| n > 0),
        buckets.iter().rposition(|&n| n > 0),
    ) else {
        return Vec::new();
    };
    (first..=last)
        .map(|i| {
            if i == 9 {
                format!(" / --crf  90.00+ {} frames", buckets[i])
            } else {
                let low = i as f64 * 10.0;
                format!(
                    " / --crf [{low:>5.2} ~ {:>5.2}] {} frames",
                    low + 9.75,
                    buckets[i]
                )
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        sync::atomic::{AtomicU32, Ordering},
    };

    use super::*;
    use crate::{metric::MetricSession, zones::parse_zones};

    struct FakeSource {
        diff: Vec<f64>,
        measured: Cell<u32>,
    }

    impl FakeSource {
        fn new(frames: usize) -> Self {
            let mut diff = vec![0.05; frames];
            diff[150] = 1.5;
            FakeSource {
                diff,
                measured: Cell::new(0),
            }
        }
    }

    impl SceneSource for FakeSource {
        fn frame_count(&self) -> u32 {
            self.diff.len() as u32
        }

        fn bits_per_sample(&self) -> u32 {
            8
        }

        fn luma_signal(&self) -> Result<FrameSignal> {
            self.measured.set(self.measured.get() + 1);
            let frames = self.diff.len();
            Ok(FrameSignal {
                diff: self.diff.clone(),
                average: vec![120.0; frames],
                min: vec![30.0; frames],
                max: vec![200.0; frames],
            })
        }

        fn wwxd(&self, start: u32, end: u32) -> Result<Vec<f64>> {
            Ok(self.diff[frame_range(start, end)]
                .iter()
                .map(|&d| if d > 1.0 { 1.0 } else { 0.0 })
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeKeyframes {
        runs: AtomicU32,
    }

    impl KeyframeDetector for FakeKeyframes {
        fn detect(&self, zones: &[X264Zone]) -> Result<Vec<Vec<f64>>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(zones
                .iter()
                .map(|zone| vec![0.0; (zone.end - zone.start) as usize])
                .collect())
        }
    }

    /// Writes the probe scenes file as the "encode", so the metric can see the crf of each scene.
    #[derive(Default)]
    struct FakeEncoder {
        runs: Cell<u32>,
    }

    impl ProbeEncoder for FakeEncoder {
        fn encode(&self, _: ProbePass, scenes: &SceneList, paths: &ProbePaths, _: bool) -> Result<()> {
            self.runs.set(self.runs.get() + 1);
            fs::write(&paths.output, scenes.to_json()?)?;
            Ok(())
        }
    }

    /// Scores fall linearly with the probe crf.
    #[derive(Default)]
    struct FakeMetric {
        sessions: Cell<u32>,
    }

    struct FakeSession {
        crf_at_head: Vec<(u32, f64)>,
    }

    impl MetricService for FakeMetric {
        fn open<'a>(&'a self, _: ProbePass, probe: &Path) -> Result<Box<dyn MetricSession + 'a>> {
            self.sessions.set(self.sessions.get() + 1);
            let list = SceneList::parse_scene_file(probe)?;
            let mut head = 0;
            let mut crf_at_head: Vec<(u32, f64)> = Vec::new();
            for scene in &list.scenes {
                let params = scene
                    .zone_overrides
                    .as_ref()
                    .and_then(|o| o.video_params.as_ref())
                    .ok_or_eyre("probe scene without params")?;
                crf_at_head.push((head, params[1].parse::<f64>()?));
                head += scene.len();
            }
            Ok(Box::new(FakeSession { crf_at_head }))
        }
    }

    impl MetricSession for FakeSession {
        fn scores(&mut self, scene: &ProbeScene, frames: &[u32], _: &ZoneConfig) -> Result<Vec<f64>> {
            let (_, crf) = self
                .crf_at_head
                .iter()
                .find(|(head, _)| *head == scene.probe_head)
                .ok_or_eyre("unknown probe head")?;
            Ok(frames.iter().map(|&f| 110.0 - 1.5 * crf - 0.01 * f64::from(f)).collect())
        }

        fn encode_diffs(&mut self, scene: &ProbeScene) -> Result<Vec<f64>> {
            Ok(vec![0.01; scene.len() as usize])
        }
    }

    struct Fakes {
        source: FakeSource,
        keyframes: FakeKeyframes,
        encoder: FakeEncoder,
        metric: FakeMetric,
    }

    impl Fakes {
        fn new() -> Self {
            Fakes {
                source: FakeSource::new(300),
                keyframes: FakeKeyframes::default(),
                encoder: FakeEncoder::default(),
                metric: FakeMetric::default(),
            }
        }

        fn run(&self, options: &BoostOptions, profiles: &Profiles, zones: &[ZoneEntry]) -> Result<SceneList> {
            run_boost(
                options,
                profiles,
                zones,
                &Services {
                    source: &self.source,
                    keyframes: &self.keyframes,
                    encoder: &self.encoder,
                    metric: &self.metric,
                },
            )
        }
    }

    fn options(dir: &Path) -> BoostOptions {
        BoostOptions {
            input: PathBuf::from("source.mkv"),
            encode_input: PathBuf::from("source.mkv"),
            encode_vspipe_args: Vec::new(),
            scene_detection_input: PathBuf::from("source.mkv"),
            scene_detection_vspipe_args: Vec::new(),
            input_scenes: None,
            output_scenes: dir.join("out.scenes.json"),
            temp: dir.join("out.boost.tmp"),
            resume: true,
            verbose: 0,
            source_plugin: SourcePlugin::default(),
            workers: 8,
        }
    }

    fn profiles(target: f64) -> Profiles {
        Profiles::from_toml_str(&format!(
            "[default]\nmetric_target = {target:.1}\n[zones.credits]\nmetric_enable = false\n"
        ))
        .unwrap()
    }

    fn crf_of(scene: &Scene) -> &str {
        &scene.zone_overrides.as_ref().unwrap().video_params.as_ref().unwrap()[1]
    }

    #[test]
    fn temp_dir_follows_the_output_name() {
        assert_eq!(
            default_temp(Path::new("/v/ep01.scenes.json")),
            PathBuf::from("/v/ep01.boost.tmp")
        );
        assert_eq!(default_temp(Path::new("ep01.json")), PathBuf::from("ep01.boost.tmp"));
    }

    #[test]
    fn full_run_boosts_every_scene() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        let zones = parse_zones("240 -1 credits").unwrap();
        let fakes = Fakes::new();

        let list = fakes.run(&options, &profiles(84.0), &zones).unwrap();
        list.check_partition().unwrap();
        assert_eq!(list.frames, 300);
        assert_eq!(fakes.encoder.runs.get(), 2);
        assert_eq!(fakes.keyframes.runs.load(Ordering::SeqCst), 1);

        for scene in &list.scenes {
            let crf: f64 = crf_of(scene).parse().unwrap();
            if scene.start_frame >= 240 {
                assert_eq!(crf_of(scene), "28.00");
            } else {
                assert!((14.0..=36.0).contains(&crf), "crf {crf}");
                assert_eq!((crf * 4.0).fract(), 0.0);
            }
        }
        assert!(list.scenes.iter().any(|scene| scene.end_frame == 240));

        let result: MetricResult =
            serde_json::from_str(&fs::read_to_string(options.temp.join("progression-boost/result.json")).unwrap())
                .unwrap();
        let measured = result.scenes.iter().filter(|r| r.second_score.is_some()).count();
        assert_eq!(measured, list.scenes.iter().filter(|s| s.end_frame <= 240).count());
    }

    #[test]
    fn resumed_run_reuses_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        let zones = parse_zones("240 -1 credits").unwrap();
        let fakes = Fakes::new();

        fakes.run(&options, &profiles(84.0), &zones).unwrap();
        let first = fs::read(&options.output_scenes).unwrap();
        fakes.run(&options, &profiles(84.0), &zones).unwrap();

        assert_eq!(fs::read(&options.output_scenes).unwrap(), first);
        assert_eq!(fakes.encoder.runs.get(), 2);
        assert_eq!(fakes.metric.sessions.get(), 2);
        assert_eq!(fakes.source.measured.get(), 1);
        assert_eq!(fakes.keyframes.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replaced_source_is_segmented_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options(dir.path());
        options.input = dir.path().join("source.mkv");
        options.scene_detection_input = options.input.clone();
        options.encode_input = options.input.clone();
        let zones = parse_zones("240 -1 credits").unwrap();
        let fakes = Fakes::new();

        fs::write(&options.input, b"first cut").unwrap();
        fakes.run(&options, &profiles(84.0), &zones).unwrap();
        // Same frame count, different file.
        fs::write(&options.input, b"the director's cut").unwrap();
        fakes.run(&options, &profiles(84.0), &zones).unwrap();

        assert_eq!(fakes.keyframes.runs.load(Ordering::SeqCst), 2);
        assert_eq!(fakes.source.measured.get(), 2);
        assert_eq!(fakes.encoder.runs.get(), 4);
    }

    #[test]
    fn new_target_only_repeats_the_second_probe() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        let zones = parse_zones("240 -1 credits").unwrap();
        let fakes = Fakes::new();

        fakes.run(&options, &profiles(84.0), &zones).unwrap();
        // The first probe scores 74, so a target of 70 sends the second probe the other way.
        fakes.run(&options, &profiles(70.0), &zones).unwrap();

        assert_eq!(fakes.encoder.runs.get(), 3);
        assert_eq!(fakes.keyframes.runs.load(Ordering::SeqCst), 1);
        let probe = SceneList::parse_scene_file(
            &options.temp.join("progression-boost/probe-encode-second.scenes.json"),
        )
        .unwrap();
        assert!(probe.scenes.iter().all(|scene| crf_of(scene) == "40.00"));
    }

    #[test]
    fn without_resume_everything_runs_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options(dir.path());
        let zones = parse_zones("240 -1 credits").unwrap();
        let fakes = Fakes::new();

        fakes.run(&options, &profiles(84.0), &zones).unwrap();
        options.resume = false;
        fakes.run(&options, &profiles(84.0), &zones).unwrap();
        assert_eq!(fakes.encoder.runs.get(), 4);
        assert_eq!(fakes.keyframes.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn external_zone_without_scenes_fails_before_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        let profiles =
            Profiles::from_toml_str("[default]\nscene_detection_method = \"external\"\n").unwrap();
        let fakes = Fakes::new();

        let err = fakes.run(&options, &profiles, &[]).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 2);
        assert_eq!(fakes.encoder.runs.get(), 0);
        assert_eq!(fakes.keyframes.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn external_scenes_are_used_as_given() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options(dir.path());
        let external = SceneList {
            scenes: vec![Scene::new(0, 100), Scene::new(100, 300)],
            split_scenes: None,
            frames: 300,
        };
        let path = dir.path().join("input.scenes.json");
        external.write_scene_list_to_file(&path).unwrap();
        options.input_scenes = Some(path);
        let profiles = Profiles::from_toml_str(
            "[default]\nscene_detection_method = \"external\"\nmetric_enable = false\n",
        )
        .unwrap();
        let fakes = Fakes::new();

        let list = fakes.run(&options, &profiles, &[]).unwrap();
        let spans: Vec<(u32, u32)> = list.scenes.iter().map(|s| (s.start_frame, s.end_frame)).collect();
        assert_eq!(spans, vec![(0, 100), (100, 300)]);
        assert_eq!(fakes.encoder.runs.get(), 0);
    }

    #[test]
    fn histogram_spans_first_to_last_used_bucket() {
        let scenes = [Scene::new(0, 10), Scene::new(10, 40), Scene::new(40, 45)];
        let buckets = crf_histogram(&scenes, &[14.0, 33.5, 95.0]);
        assert_eq!(buckets[1], 10);
        assert_eq!(buckets[3], 30);
        assert_eq!(buckets[9], 5);

        let lines = histogram_lines(&buckets);
        assert_eq!(lines.len(), 9);
        assert_eq!(lines[0], " / --crf [10.00 ~ 19.75] 10 frames");
        assert_eq!(lines[1], " / --crf [20.00 ~ 29.75] 0 frames");
        assert_eq!(lines[8], " / --crf  90.00+ 5 frames");
        assert!(histogram_lines(&[0; 10]).is_empty());
    }

    #[test]
    fn final_crf_is_floored_and_rounded() {
        let zone = ZoneConfig::default();
        let solution = |crf| Solution {
            crf,
            preset: 2,
            kind: crate::solver::SolveKind::Linear,
            qstep: None,
        };
        assert_eq!(final_crf(&solution(12.0), &zone), 14.0);
        assert_eq!(final_crf(&solution(23.13), &zone), 23.25);
        let whole = ZoneConfig {
            quarterstep_crf: false,
            ..ZoneConfig::default()
        };
        assert_eq!(final_crf(&solution(23.6), &whole), 24.0);
    }
}
