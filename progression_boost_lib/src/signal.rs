use std::{fs, path::Path};

use eyre::{Context, OptionExt, Result, eyre};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use tracing::{debug, info};
use vapoursynth4_rs::{
    core::Core,
    frame::Frame,
    map::KeyStr,
    node::{Node, VideoNode},
};

use crate::{
    checkpoint::write_atomically,
    logging::progress_bar,
    vapoursynth::{SourcePlugin, detection_clip, load_source, luma_stats, trim, wwxd},
};

const CACHE_FILES: [&str; 4] = [
    "luma-diff.txt",
    "luma-average.txt",
    "luma-min.txt",
    "luma-max.txt",
];

/// Per-frame luma statistics of the whole source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSignal {
    /// Mean absolute difference to the previous frame, normalised to `[0, 1]`.
    pub diff: Vec<f64>,
    pub average: Vec<f64>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl FrameSignal {
    pub fn len(&self) -> usize {
        self.diff.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }

    fn columns(&self) -> [&[f64]; 4] {
        [&self.diff, &self.average, &self.min, &self.max]
    }

    /// The cached signal in `dir`, if all four files parse and describe `frames` frames.
    pub fn load_cache(dir: &Path, frames: u32) -> Option<FrameSignal> {
        let mut columns = Vec::with_capacity(CACHE_FILES.len());
        for name in CACHE_FILES {
            let path = dir.join(name);
            let text = fs::read_to_string(&path).ok()?;
            let values = text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>();
            match values {
                Ok(values) if values.len() == frames as usize => columns.push(values),
                Ok(values) => {
                    debug!(
                        "{} has {} values for {frames} frames, measuring again",
                        path.display(),
                        values.len()
                    );
                    return None;
                }
                Err(e) => {
                    debug!("{} is unreadable ({e}), measuring again", path.display());
                    return None;
                }
            }
        }

        let [diff, average, min, max]: [Vec<f64>; 4] = columns.try_into().ok()?;
        Some(FrameSignal {
            diff,
            average,
            min,
            max,
        })
    }

    pub fn remove_cache(dir: &Path) -> Result<()> {
        for name in CACHE_FILES {
            let path = dir.join(name);
            if path.exists() {
                fs::remove_file(&path)
                    .wrap_err_with(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }

    pub fn save_cache(&self, dir: &Path) -> Result<()> {
        for (name, column) in CACHE_FILES.iter().zip(self.columns()) {
            let text: String = column.iter().map(|v| format!("{v:.9}\n")).collect();
            write_atomically(&dir.join(name), text.as_bytes())?;
        }
        Ok(())
    }
}

/// Frame-level analysis of the source the scenes are cut from.
pub trait SceneSource {
    fn frame_count(&self) -> u32;

    fn bits_per_sample(&self) -> u32;

    /// Measures every frame. Slow; callers cache the result.
    fn luma_signal(&self) -> Result<FrameSignal>;

    /// WWXD scene change flags for `[start, end)`, 1.0 where a change was detected.
    fn wwxd(&self, start: u32, end: u32) -> Result<Vec<f64>>;
}

/// The source opened through VapourSynth.
pub struct VapoursynthSource {
    core: Core,
    clip: VideoNode,
}

impl VapoursynthSource {
    pub fn open(path: &Path, source_plugin: SourcePlugin, cache_dir: &Path) -> Result<Self> {
        fs::create_dir_all(cache_dir)?;
        let core = Core::builder().build();
        let clip = load_source(&core, path, source_plugin, cache_dir)?;
        info!("Opened {}: {:?}", path.display(), clip.info());
        Ok(VapoursynthSource { core, clip })
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn clip(&self) -> &VideoNode {
        &self.clip
    }
}

impl SceneSource for VapoursynthSource {
    fn frame_count(&self) -> u32 {
        self.clip.info().num_frames.max(0) as u32
    }

    fn bits_per_sample(&self) -> u32 {
        self.clip.info().format.bits_per_sample.max(0) as u32
    }

    fn luma_signal(&self) -> Result<FrameSignal> {
        let stats = luma_stats(&self.core, &self.clip)?;
        let frames = self.frame_count();
        let pb = progress_bar(u64::from(frames), "Measuring frame luminance");

        let rows = (0..frames)
            .into_par_iter()
            .map(|n| {
                let frame = stats
                    .get_frame(n as i32)
                    .map_err(|e| eyre!(e.to_string_lossy().to_string()))?;
                let props = frame
                    .properties()
                    .ok_or_eyre("Frame properties not found")?;
                let row = [
                    props.get_float(KeyStr::from_cstr(c"LumaDiff"), 0)?,
                    props.get_float(KeyStr::from_cstr(c"LumaAverage"), 0)?,
                    props.get_float(KeyStr::from_cstr(c"LumaMin"), 0)?,
                    props.get_float(KeyStr::from_cstr(c"LumaMax"), 0)?,
                ];
                pb.inc(1);
                Ok(row)
            })
            .collect::<Result<Vec<[f64; 4]>>>()?;
        pb.finish();

        let mut signal = FrameSignal::default();
        for [diff, average, min, max] in rows {
            signal.diff.push(diff);
            signal.average.push(average);
            signal.min.push(min);
            signal.max.push(max);
        }
        Ok(signal)
    }

    fn wwxd(&self, start: u32, end: u32) -> Result<Vec<f64>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let zone = trim(&self.core, &self.clip, start, end - 1)?;
        let flagged = wwxd(&self.core, &detection_clip(&self.core, &zone)?)?;
        let pb = progress_bar(u64::from(end - start), "Detecting scenes");

        let flags = (0..end - start)
            .into_par_iter()
            .map(|n| {
                let frame = flagged
                    .get_frame(n as i32)
                    .map_err(|e| eyre!(e.to_string_lossy().to_string()))?;
                let props = frame
                    .properties()
                    .ok_or_eyre("Frame properties not found")?;
                let change = props.get_int(KeyStr::from_cstr(c"Scenechange"), 0)?;
                pb.inc(1);
                Ok(if change == 1 { 1.0 } else { 0.0 })
            })
            .collect::<Result<Vec<f64>>>()?;
        pb.finish();
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(len: usize) -> FrameSignal {
        FrameSignal {
            diff: (0..len).map(|i| i as f64 / 1000.0).collect(),
            average: vec![120.5; len],
            min: vec![16.0; len],
            max: vec![235.0; len],
        }
    }

    #[test]
    fn cache_round_trips_at_nine_decimals() {
        let dir = tempfile::tempdir().unwrap();
        let original = signal(5);
        original.save_cache(dir.path()).unwrap();

        let diff_text = fs::read_to_string(dir.path().join("luma-diff.txt")).unwrap();
        assert_eq!(diff_text.lines().nth(1), Some("0.001000000"));
        assert_eq!(FrameSignal::load_cache(dir.path(), 5), Some(original));
    }

    #[test]
    fn cache_for_another_length_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        signal(5).save_cache(dir.path()).unwrap();
        assert_eq!(FrameSignal::load_cache(dir.path(), 6), None);
    }

    #[test]
    fn incomplete_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        signal(3).save_cache(dir.path()).unwrap();
        fs::write(dir.path().join("luma-max.txt"), "235.0\nnot a number\n235.0\n").unwrap();
        assert_eq!(FrameSignal::load_cache(dir.path(), 3), None);

        fs::remove_file(dir.path().join("luma-min.txt")).unwrap();
        assert_eq!(FrameSignal::load_cache(dir.path(), 3), None);
    }
}
