use std::{
    collections::BTreeMap,
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::math::FrameScore;

/// Replaces `path` with `bytes` so that readers only ever see the old or the new content.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .wrap_err_with(|| format!("Failed to create directory {}", dir.display()))?;

    let mut file = NamedTempFile::new_in(dir)
        .wrap_err_with(|| format!("Failed to create a temporary file in {}", dir.display()))?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path)
        .map_err(|e| e.error)
        .wrap_err_with(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Segmented,
    FirstProbed,
    FirstMeasured,
    SecondProbed,
    SecondMeasured,
    Solved,
    Finalized,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Segmented,
        Stage::FirstProbed,
        Stage::FirstMeasured,
        Stage::SecondProbed,
        Stage::SecondMeasured,
        Stage::Solved,
        Stage::Finalized,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Segmented => "segmented",
            Stage::FirstProbed => "first_probed",
            Stage::FirstMeasured => "first_measured",
            Stage::SecondProbed => "second_probed",
            Stage::SecondMeasured => "second_measured",
            Stage::Solved => "solved",
            Stage::Finalized => "finalized",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulates the inputs of a stage into one digest.
#[derive(Debug, Default, Clone)]
pub struct StageHasher {
    hasher: blake3::Hasher,
}

impl StageHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fields are length prefixed so adjacent values cannot run into each other.
    pub fn field(&mut self, name: &str, bytes: &[u8]) -> &mut Self {
        self.hasher.update(&(name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn text(&mut self, name: &str, value: &str) -> &mut Self {
        self.field(name, value.as_bytes())
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<&mut Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.field(name, &bytes))
    }

    /// The path plus the size and modification time of the file behind it. A missing file
    /// hashes as its path alone.
    pub fn file(&mut self, name: &str, path: &Path) -> &mut Self {
        self.text(name, &path.to_string_lossy());
        let stamp = fs::metadata(path).ok().map(|meta| {
            let modified = meta
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |since| since.as_nanos());
            let mut bytes = meta.len().to_le_bytes().to_vec();
            bytes.extend_from_slice(&modified.to_le_bytes());
            bytes
        });
        self.field("stamp", &stamp.unwrap_or_default())
    }

    pub fn finish(&self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Artifacts exist and were produced from the current inputs.
    Fresh,
    /// Same inputs, but the stage was interrupted. Partial work may be reused.
    Resumable,
    /// Inputs changed or resuming is off. Partial work must be discarded.
    Stale,
}

/// `stages.json`: the input digest each stage's artifacts were produced from.
#[derive(Debug)]
pub struct StageLedger {
    path: PathBuf,
    resume: bool,
    hashes: BTreeMap<String, String>,
}

impl StageLedger {
    /// Without `resume` every stage starts stale.
    pub fn open(path: &Path, resume: bool) -> Result<Self> {
        let hashes = if resume && path.exists() {
            let content = fs::read_to_string(path)
                .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str(&content) {
                Ok(hashes) => hashes,
                Err(e) => {
                    info!("Ignoring unreadable stage ledger {}: {e}", path.display());
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Ok(StageLedger {
            path: path.to_owned(),
            resume,
            hashes,
        })
    }

    pub fn recorded(&self, stage: Stage) -> Option<&str> {
        self.hashes.get(stage.as_str()).map(String::as_str)
    }

    /// Decides whether `stage` has to run again. A stage whose inputs changed is `Stale`; one
    /// with the same inputs but unfinished artifacts is `Resumable`. Either way every later stage
    /// is forgotten.
    pub fn enter(&mut self, stage: Stage, hash: &str, complete: bool) -> Result<StageState> {
        let same_inputs = self.resume && self.recorded(stage) == Some(hash);
        if same_inputs && complete {
            debug!("Stage {stage} is up to date");
            return Ok(StageState::Fresh);
        }

        let state = if same_inputs {
            info!("Stage {stage} did not finish, resuming it");
            StageState::Resumable
        } else {
            if self.recorded(stage).is_some() {
                info!("Inputs of stage {stage} changed, recomputing it and every later stage");
            }
            StageState::Stale
        };

        for later in Stage::ALL.iter().filter(|s| **s >= stage) {
            self.hashes.remove(later.as_str());
        }
        self.hashes.insert(stage.as_str().to_owned(), hash.to_owned());
        self.save()?;
        Ok(state)
    }

    fn save(&self) -> Result<()> {
        write_atomically(&self.path, serde_json::to_string_pretty(&self.hashes)?.as_bytes())
    }
}

/// Calibration data for one scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneRecord {
    /// Sampled frames relative to the scene start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_qstep: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_qstep: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_score: Option<f64>,
    /// Raw per-frame scores behind `first_score` and `second_score`, kept for inspection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub first_frame_scores: Vec<FrameScore>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub second_frame_scores: Vec<FrameScore>,
}

impl SceneRecord {
    pub fn clear_first(&mut self) {
        *self = SceneRecord::default();
    }

    pub fn clear_second(&mut self) {
        self.second_qstep = None;
        self.second_score = None;
        self.second_frame_scores.clear();
    }
}

/// `result.json`: one record per scene of the segmented list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub scenes: Vec<SceneRecord>,
}

impl MetricResult {
    pub fn empty(scene_count: usize) -> Self {
        MetricResult {
            scenes: vec![SceneRecord::default(); scene_count],
        }
    }

    /// A record set that does not match the scene count is treated as missing.
    pub fn load_or_empty(path: &Path, scene_count: usize) -> Self {
        let loaded = fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str::<MetricResult>(&content).ok());
        match loaded {
            Some(result) if result.scenes.len() == scene_count => result,
            Some(result) => {
                info!(
                    "Discarding {}: {} records for {} scenes",
                    path.display(),
                    result.scenes.len(),
                    scene_count
                );
                MetricResult::empty(scene_count)
            }
            None => MetricResult::empty(scene_count),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomically(path, serde_json::to_string_pretty(self)?.as_bytes())
    }
}
