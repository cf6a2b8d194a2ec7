use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use eyre::{Context, OptionExt, Result, eyre};
use itertools::Itertools;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use tracing::trace;
use vapoursynth4_rs::{frame::Frame, map::KeyStr, node::{Node, VideoNode}};

use crate::{
    config::{MetricMethod, ZoneConfig},
    error::BoostError,
    probe::ProbePass,
    signal::VapoursynthSource,
    vapoursynth::{SourcePlugin, load_source, plane_stats, select_frames, trim, vszip_ssimulacra2},
};

/// Where a scene sits in the source and in the probe encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeScene {
    pub start: u32,
    pub end: u32,
    /// First frame of the scene inside the probe encode.
    pub probe_head: u32,
}

impl ProbeScene {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Probe frame number minus source frame number.
    pub fn encoded_offset(&self) -> i64 {
        i64::from(self.probe_head) - i64::from(self.start)
    }
}

/// Measures a probe encode against the source.
pub trait MetricService {
    fn open<'a>(&'a self, pass: ProbePass, probe: &Path) -> Result<Box<dyn MetricSession + 'a>>;
}

pub trait MetricSession {
    /// Scores of `frames`, counted from the scene start, in the same order.
    fn scores(&mut self, scene: &ProbeScene, frames: &[u32], zone: &ZoneConfig) -> Result<Vec<f64>>;

    /// Pixel difference between source and probe for every frame of the scene.
    fn encode_diffs(&mut self, scene: &ProbeScene) -> Result<Vec<f64>>;
}

/// vszip in process, or FFVship as a separate program, chosen per zone.
pub struct ProbeMetrics<'a> {
    pub source: &'a VapoursynthSource,
    pub source_path: PathBuf,
    pub source_plugin: SourcePlugin,
    /// `progression-boost/` inside the temp dir.
    pub dir: PathBuf,
}

impl MetricService for ProbeMetrics<'_> {
    fn open<'a>(&'a self, pass: ProbePass, probe: &Path) -> Result<Box<dyn MetricSession + 'a>> {
        Ok(Box::new(ProbeSession {
            metrics: self,
            pass,
            probe_path: probe.to_owned(),
            probe: None,
        }))
    }
}

struct ProbeSession<'a> {
    metrics: &'a ProbeMetrics<'a>,
    pass: ProbePass,
    probe_path: PathBuf,
    probe: Option<VideoNode>,
}

impl ProbeSession<'_> {
    fn probe(&mut self) -> Result<VideoNode> {
        if let Some(probe) = &self.probe {
            return Ok(probe.clone());
        }
        let probe = load_source(
            self.metrics.source.core(),
            &self.probe_path,
            self.metrics.source_plugin,
            &self.metrics.dir,
        )?;
        self.probe = Some(probe.clone());
        Ok(probe)
    }

    fn vszip_scores(&mut self, scene: &ProbeScene, frames: &[u32]) -> Result<Vec<f64>> {
        let core = self.metrics.source.core();
        let probe = self.probe()?;

        let source_frames: Vec<u32> = frames.iter().map(|f| scene.start + f).collect();
        let probe_frames: Vec<u32> = frames.iter().map(|f| scene.probe_head + f).collect();
        let reference = select_frames(core, self.metrics.source.clip(), &source_frames)?;
        let distorted = select_frames(core, &probe, &probe_frames)?;
        let metric = vszip_ssimulacra2(core, &reference, &distorted)?;

        (0..frames.len())
            .into_par_iter()
            .map(|i| {
                let frame = metric
                    .get_frame(i as i32)
                    .map_err(|e| eyre!(e.to_string_lossy().to_string()))?;
                let props = frame.properties().ok_or_eyre("Frame properties not found")?;
                Ok(props.get_float(KeyStr::from_cstr(c"SSIMULACRA2"), 0)?)
            })
            .collect()
    }

    fn ffvship_scores(&self, scene: &ProbeScene, frames: &[u32], zone: &ZoneConfig) -> Result<Vec<f64>> {
        let dir = &self.metrics.dir;
        let output = dir.join("metric-ffvship.json");
        if output.exists() {
            fs::remove_file(&output)?;
        }

        let args = ffvship_args(
            &self.metrics.source_path,
            &self.probe_path,
            &dir.join("metric-ffvship-source.ffindex"),
            &dir.join(format!("metric-ffvship-{}.ffindex", self.pass)),
            &output,
            scene,
            frames,
            zone,
        );
        trace!("FFVship {:?}", args);
        let status = Command::new("FFVship")
            .args(&args)
            .stdout(Stdio::null())
            .status()
            .wrap_err("Failed to start FFVship. Is it installed and on PATH?")?;
        if !status.success() {
            return Err(BoostError::ExternalTool {
                tool: "FFVship".to_owned(),
                code: status.code(),
            }
            .into());
        }

        let column = zone.ffvship_column().ok_or_else(|| {
            BoostError::config(format!("FFVship metric {} is not supported", zone.ffvship_metric))
        })?;
        let text = fs::read_to_string(&output)
            .map_err(|_| BoostError::malformed("FFVship", format!("{} was not created", output.display())))?;
        Ok(parse_ffvship_scores(&text, frames.len(), column)?)
    }
}

impl MetricSession for ProbeSession<'_> {
    fn scores(&mut self, scene: &ProbeScene, frames: &[u32], zone: &ZoneConfig) -> Result<Vec<f64>> {
        match zone.metric_method {
            MetricMethod::Vapoursynth => self.vszip_scores(scene, frames),
            MetricMethod::Ffvship => self.ffvship_scores(scene, frames, zone),
        }
    }

    fn encode_diffs(&mut self, scene: &ProbeScene) -> Result<Vec<f64>> {
        let core = self.metrics.source.core();
        let probe = self.probe()?;
        let last = scene.len().saturating_sub(1);
        let reference = trim(core, self.metrics.source.clip(), scene.start, scene.start + last)?;
        let distorted = trim(core, &probe, scene.probe_head, scene.probe_head + last)?;
        let stats = plane_stats(core, &reference, &distorted, "Encode")?;

        (0..scene.len())
            .into_par_iter()
            .map(|i| {
                let frame = stats
                    .get_frame(i as i32)
                    .map_err(|e| eyre!(e.to_string_lossy().to_string()))?;
                let props = frame.properties().ok_or_eyre("Frame properties not found")?;
                Ok(props.get_float(KeyStr::from_cstr(c"EncodeDiff"), 0)?)
            })
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
fn ffvship_args(
    source: &Path,
    encoded: &Path,
    source_index: &Path,
    encoded_index: &Path,
    output: &Path,
    scene: &ProbeScene,
    frames: &[u32],
    zone: &ZoneConfig,
) -> Vec<String> {
    let path = |p: &Path| p.to_string_lossy().into_owned();
    let mut args = vec![
        "--source".to_owned(),
        path(source),
        "--encoded".to_owned(),
        path(encoded),
        "--cache-index".to_owned(),
        "--source-index".to_owned(),
        path(source_index),
        "--encoded-index".to_owned(),
        path(encoded_index),
        "--metric".to_owned(),
        zone.ffvship_metric.clone(),
        "--json".to_owned(),
        path(output),
        "--source-indices".to_owned(),
        frames.iter().map(|f| scene.start + f).join(","),
        "--encoded-offset".to_owned(),
        scene.encoded_offset().to_string(),
    ];
    args.extend(zone.ffvship_params.iter().cloned());
    args
}

/// FFVship writes one array per frame; `column` picks the score out of it.
fn parse_ffvship_scores(text: &str, expected: usize, column: usize) -> Result<Vec<f64>, BoostError> {
    let rows: Vec<Vec<f64>> = serde_json::from_str(text)
        .map_err(|e| BoostError::malformed("FFVship", format!("output is not a list of frames: {e}")))?;
    if rows.len() != expected {
        return Err(BoostError::malformed(
            "FFVship",
            format!("{} frames measured, {expected} requested", rows.len()),
        ));
    }
    rows.iter()
        .map(|row| {
            row.get(column).copied().ok_or_else(|| {
                BoostError::malformed("FFVship", format!("a frame has no score in column {column}"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffvship_reads_the_column_of_the_metric() {
        let text = "[[81.5, 0.2, 3.0], [79.25, 0.1, 2.0]]";
        assert_eq!(parse_ffvship_scores(text, 2, 0).unwrap(), vec![81.5, 79.25]);

        let butteraugli = ZoneConfig {
            ffvship_metric: "Butteraugli".to_owned(),
            ..ZoneConfig::default()
        };
        let column = butteraugli.ffvship_column().unwrap();
        assert_eq!(parse_ffvship_scores(text, 2, column).unwrap(), vec![0.2, 0.1]);
    }

    #[test]
    fn ffvship_output_must_match_the_request() {
        assert!(parse_ffvship_scores("[[81.5]]", 2, 0).is_err());
        assert!(parse_ffvship_scores("[[]]", 1, 0).is_err());
        assert!(parse_ffvship_scores("[[81.5]]", 1, 1).is_err());
        assert!(parse_ffvship_scores("{\"frames\": 1}", 1, 0).is_err());
    }

    #[test]
    fn ffvship_indices_point_into_the_probe() {
        let scene = ProbeScene {
            start: 500,
            end: 560,
            probe_head: 120,
        };
        let zone = ZoneConfig {
            metric_method: MetricMethod::Ffvship,
            ffvship_params: vec!["--threads".to_owned(), "4".to_owned()],
            ..ZoneConfig::default()
        };
        let args = ffvship_args(
            Path::new("in.mkv"),
            Path::new("probe.mkv"),
            Path::new("src.ffindex"),
            Path::new("probe.ffindex"),
            Path::new("out.json"),
            &scene,
            &[0, 7, 59],
            &zone,
        );
        let at = |flag: &str| &args[args.iter().position(|a| a == flag).unwrap() + 1];
        assert_eq!(at("--source-indices"), "500,507,559");
        assert_eq!(at("--encoded-offset"), "-380");
        assert_eq!(at("--metric"), "SSIMULACRA2");
        assert_eq!(&args[args.len() - 2..], ["--threads", "4"]);
    }
}
