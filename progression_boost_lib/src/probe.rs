use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use bytesize::ByteSize;
use eyre::{Context, Result};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::ZoneConfig,
    encode::{Av1anJob, check_run, common_params},
    logging::progress_bar,
    scenes::{Scene, SceneList, ZoneOverrides},
    solver::{format_crf, probe_crf},
    vapoursynth::SourcePlugin,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePass {
    First,
    Second,
}

impl ProbePass {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbePass::First => "first",
            ProbePass::Second => "second",
        }
    }
}

impl fmt::Display for ProbePass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Files of one probe pass inside `progression-boost/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePaths {
    pub temp: PathBuf,
    pub scenes: PathBuf,
    pub output: PathBuf,
}

impl ProbePaths {
    pub fn new(dir: &Path, pass: ProbePass) -> Self {
        let stem = format!("probe-encode-{pass}");
        ProbePaths {
            temp: dir.join(format!("{stem}.tmp")),
            scenes: dir.join(format!("{stem}.scenes.json")),
            output: dir.join(format!("{stem}.mkv")),
        }
    }

    /// Progress file av1an keeps inside its temp dir.
    pub fn done(&self) -> PathBuf {
        self.temp.join("done.json")
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FrameInfo {
    pub frames: u32,
    pub size_bytes: u64,
}

/// av1an's `done.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Done {
    pub frames: u32,
    pub done: HashMap<String, FrameInfo>,
    #[serde(default)]
    pub audio_done: bool,
}

impl Done {
    pub fn parse_done_file(json_path: &Path) -> Result<Done> {
        let json_data = fs::read_to_string(json_path)?;
        let done: Done = serde_json::from_str(&json_data)?;
        Ok(done)
    }

    pub fn size(&self) -> ByteSize {
        ByteSize::b(self.done.values().map(|info| info.size_bytes).sum())
    }
}

/// A scene of the probe encode at `qstep`, with the zone's probing settings.
pub fn probe_scene(scene: &Scene, zone: &ZoneConfig, qstep: u32) -> Scene {
    let mut video_params = vec![
        "--crf".to_owned(),
        format_crf(probe_crf(qstep), zone.quarterstep_crf),
        "--preset".to_owned(),
        zone.probing_preset.to_string(),
    ];
    video_params.extend(zone.probing_params.iter().cloned());

    Scene {
        start_frame: scene.start_frame,
        end_frame: scene.end_frame,
        zone_overrides: Some(ZoneOverrides {
            encoder: Some(zone.encoder.clone()),
            passes: Some(1),
            video_params: Some(video_params),
            photon_noise: None,
            photon_noise_height: None,
            photon_noise_width: None,
            chroma_noise: Some(false),
            extra_splits_len: Some(zone.split.extra_split),
            min_scene_len: Some(zone.split.min_scene_len),
        }),
    }
}

/// Scenes file of a probe pass. The encode holds only these scenes, back to back.
pub fn probe_scene_list(scenes: Vec<Scene>) -> SceneList {
    let frames = scenes.iter().map(Scene::len).sum();
    SceneList::presplit(scenes, frames)
}

/// Produces the probe encode described by a scenes file.
pub trait ProbeEncoder {
    /// `paths.scenes` has been written from `scenes` before this is called. On success
    /// `paths.output` holds every scene in order.
    fn encode(&self, pass: ProbePass, scenes: &SceneList, paths: &ProbePaths, resume: bool)
    -> Result<()>;
}

/// Probe encodes through av1an and svt-av1.
#[derive(Debug, Clone)]
pub struct Av1anProbe {
    pub input: PathBuf,
    pub vspipe_args: Vec<String>,
    pub source_plugin: SourcePlugin,
    pub workers: u32,
    pub verbose: u8,
}

impl Av1anProbe {
    fn params(&self, pass: ProbePass) -> Vec<String> {
        let mut params = vec!["--workers".to_owned(), self.workers.to_string()];
        params.extend(
            ["--chunk-order", "random", "--encoder", "svt-av1"].map(str::to_owned),
        );
        params.extend(common_params(
            self.source_plugin,
            &format!("> progression-boost probe-encode-{pass} <"),
        ));
        params
    }

    fn watch(&self, paths: &ProbePaths, scenes: usize) -> ProgressBar {
        if self.verbose >= 2 {
            return ProgressBar::hidden();
        }
        let pb = progress_bar(scenes as u64, "Encoding probe scenes");
        if let Ok(done) = Done::parse_done_file(&paths.done()) {
            pb.set_position(done.done.len() as u64);
            pb.reset_eta();
        }
        pb
    }
}

impl ProbeEncoder for Av1anProbe {
    fn encode(
        &self,
        pass: ProbePass,
        scenes: &SceneList,
        paths: &ProbePaths,
        resume: bool,
    ) -> Result<()> {
        fs::create_dir_all(&paths.temp)
            .wrap_err_with(|| format!("Failed to create {}", paths.temp.display()))?;

        let job = Av1anJob {
            input: &self.input,
            vspipe_args: &self.vspipe_args,
            temp: &paths.temp,
            output: &paths.output,
            scenes: &paths.scenes,
            resume,
            verbose: self.verbose,
            params: self.params(pass),
        };

        let pb = self.watch(paths, scenes.scenes.len());
        let mut child = job.spawn()?;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            // av1an rewrites done.json in place; a torn read just skips one update.
            if let Ok(done) = Done::parse_done_file(&paths.done()) {
                pb.set_position(done.done.len() as u64);
            }
            thread::sleep(POLL_INTERVAL);
        };
        pb.finish();

        check_run("av1an", status, &paths.output)?;
        if let Ok(done) = Done::parse_done_file(&paths.done()) {
            info!(
                "Probe encode {pass}: {} scenes, {}",
                done.done.len(),
                done.size()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_the_pass_name() {
        let paths = ProbePaths::new(Path::new("tmp/progression-boost"), ProbePass::Second);
        assert_eq!(paths.output, PathBuf::from("tmp/progression-boost/probe-encode-second.mkv"));
        assert_eq!(
            paths.scenes,
            PathBuf::from("tmp/progression-boost/probe-encode-second.scenes.json")
        );
        assert_eq!(
            paths.done(),
            PathBuf::from("tmp/progression-boost/probe-encode-second.tmp/done.json")
        );
    }

    #[test]
    fn probe_scenes_carry_crf_preset_and_probing_params() {
        let zone = ZoneConfig::default();
        let scene = probe_scene(&Scene::new(40, 90), &zone, 343);
        let overrides = scene.zone_overrides.unwrap();
        let params = overrides.video_params.unwrap();
        assert_eq!(&params[..4], ["--crf", "24.00", "--preset", "8"]);
        assert_eq!(params[4..], zone.probing_params[..]);
        assert_eq!(overrides.photon_noise, None);
        assert_eq!(overrides.chroma_noise, Some(false));
        assert_eq!(overrides.min_scene_len, Some(9));
    }

    #[test]
    fn probe_list_counts_only_probed_frames() {
        let zone = ZoneConfig::default();
        let list = probe_scene_list(vec![
            probe_scene(&Scene::new(0, 30), &zone, 343),
            probe_scene(&Scene::new(80, 100), &zone, 343),
        ]);
        assert_eq!(list.frames, 50);
        assert!(list.split_scenes.is_some());
    }

    #[test]
    fn av1an_gets_the_requested_workers() {
        let probe = Av1anProbe {
            input: PathBuf::from("in.mkv"),
            vspipe_args: Vec::new(),
            source_plugin: SourcePlugin::default(),
            workers: 3,
            verbose: 0,
        };
        let params = probe.params(ProbePass::First);
        assert_eq!(&params[..2], ["--workers", "3"]);
        assert_eq!(params.iter().filter(|p| *p == "--workers").count(), 1);
        assert!(params.iter().any(|p| p == "> progression-boost probe-encode-first <"));
    }

    #[test]
    fn done_file_sums_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.json");
        fs::write(
            &path,
            r#"{"frames": 50, "done": {"00000": {"frames": 30, "size_bytes": 1000},
                "00001": {"frames": 20, "size_bytes": 24}}, "audio_done": false}"#,
        )
        .unwrap();
        let done = Done::parse_done_file(&path).unwrap();
        assert_eq!(done.done.len(), 2);
        assert_eq!(done.size(), ByteSize::b(1024));
    }
}
