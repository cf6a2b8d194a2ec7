use std::{collections::BTreeMap, fs, path::Path, sync::Arc};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::BoostError;

pub const DEFAULT_ZONE: &str = "default";

const PROBING_PARAMS: &str = "--lp 3 --keyint 305 --input-depth 10 --scm 0 \
    --tune 3 --variance-boost-strength 1 --balancing-q-bias 1 --luminance-qp-bias 10 \
    --ac-bias 1.0 --tx-bias 3 --complex-hvs 0 \
    --color-primaries 1 --transfer-characteristics 1 --matrix-coefficients 1 --color-range 0";

const FINAL_PARAMS: &str = "--lp 3 --keyint 305 --input-depth 10 --scm 0 \
    --tune 3 --variance-boost-strength 1 --balancing-q-bias 1 --luminance-qp-bias 10 \
    --ac-bias 1.0 --tx-bias 3 --complex-hvs 1 \
    --color-primaries 1 --transfer-characteristics 1 --matrix-coefficients 1 --color-range 0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricDirection {
    #[default]
    HigherIsBetter,
    LowerIsBetter,
}

impl MetricDirection {
    /// `a` is strictly better than `b`.
    pub fn better(self, a: f64, b: f64) -> bool {
        match self {
            MetricDirection::HigherIsBetter => a > b,
            MetricDirection::LowerIsBetter => a < b,
        }
    }

    /// Moves `value` by `amount` towards better scores. A negative amount moves it towards worse.
    pub fn make_better(self, value: f64, amount: f64) -> f64 {
        match self {
            MetricDirection::HigherIsBetter => value + amount,
            MetricDirection::LowerIsBetter => value - amount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneDetectionMethod {
    #[default]
    X264Vapoursynth,
    Vapoursynth,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LumaRange {
    #[default]
    Limited,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricMethod {
    #[default]
    Vapoursynth,
    Ffvship,
}

/// Lengths that steer the segmenter, all in frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplitConfig {
    pub extra_split: u32,
    pub still_0042_extra_split: u32,
    pub still_0012_extra_split: u32,
    pub min_scene_len: u32,
    pub target_split_18: u32,
    pub target_split_12: u32,
    pub extra_target_split_27: u32,
}

impl Default for SplitConfig {
    fn default() -> Self {
        SplitConfig {
            extra_split: 193,
            still_0042_extra_split: 257,
            still_0012_extra_split: 321,
            min_scene_len: 9,
            target_split_18: 17,
            target_split_12: 65,
            extra_target_split_27: 129,
        }
    }
}

/// How many frames each selection rule may contribute per scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingConfig {
    pub peak_transformed_diff_frames: usize,
    pub highest_diff_frames: usize,
    pub highest_probing_diff_frames: usize,
    pub upper_diff_bracket_frames: usize,
    pub lower_diff_bracket_frames: usize,
    pub diff_brackets_min_separation: u32,
    pub upper_diff_bracket_fallback_frames: usize,
    pub first_frame: bool,
    pub last_frame: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            peak_transformed_diff_frames: 4,
            highest_diff_frames: 3,
            highest_probing_diff_frames: 0,
            upper_diff_bracket_frames: 1,
            lower_diff_bracket_frames: 3,
            diff_brackets_min_separation: 24,
            upper_diff_bracket_fallback_frames: 1,
            first_frame: true,
            last_frame: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DampingFactor {
    pub max_final_preset: i32,
    pub factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DampingBand {
    pub min_probing_preset: i32,
    pub factors: Vec<DampingFactor>,
}

/// Correction for probes encoded at a faster preset than the final encode.
/// Tuned for svt-av1; recalibrate when the encoder or its version changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DampingTable {
    pub knee: f64,
    pub bands: Vec<DampingBand>,
}

impl Default for DampingTable {
    fn default() -> Self {
        let band = |min_probing_preset: i32, factors: &[(i32, f64)]| DampingBand {
            min_probing_preset,
            factors: factors
                .iter()
                .map(|&(max_final_preset, factor)| DampingFactor {
                    max_final_preset,
                    factor,
                })
                .collect(),
        };
        DampingTable {
            knee: 163.0,
            bands: vec![
                band(8, &[(-1, 0.69), (0, 0.70), (2, 0.73), (6, 0.81)]),
                band(6, &[(-1, 0.72), (0, 0.73), (2, 0.76), (5, 0.84)]),
                band(5, &[(-1, 0.82), (0, 0.83), (2, 0.86)]),
                band(3, &[(-1, 0.90), (0, 0.91), (2, 0.94)]),
            ],
        }
    }
}

impl DampingTable {
    /// The first band whose probing preset floor is met decides; no later band is consulted.
    pub fn factor(&self, probing_preset: i32, final_preset: i32) -> Option<f64> {
        let band = self
            .bands
            .iter()
            .find(|band| probing_preset >= band.min_probing_preset)?;
        band.factors
            .iter()
            .find(|f| final_preset <= f.max_final_preset)
            .map(|f| f.factor)
    }
}

/// Pulls solved crf values below `below` back towards it, trading quality on the
/// hardest scenes for filesize. `linear` scales the distance to `below` by `factor`;
/// `power` maps `crf` to `(crf / below) ^ exponent * below`, which pulls the lowest
/// values in hardest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "curve", rename_all = "snake_case", deny_unknown_fields)]
pub enum CrfDampening {
    Linear { below: f64, factor: f64 },
    Power { below: f64, exponent: f64 },
}

impl CrfDampening {
    pub fn apply(&self, crf: f64) -> f64 {
        match *self {
            CrfDampening::Linear { below, factor } if crf < below => (crf - below) * factor + below,
            CrfDampening::Power { below, exponent } if crf < below && crf > 0.0 => {
                (crf / below).powf(exponent) * below
            }
            _ => crf,
        }
    }
}

/// Every knob of one zone profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZoneConfig {
    pub scene_detection_method: SceneDetectionMethod,
    pub luma_range: LumaRange,
    pub split: SplitConfig,

    pub metric_enable: bool,
    pub metric_method: MetricMethod,
    pub metric_direction: MetricDirection,
    pub metric_target: f64,
    pub metric_max_crf: f64,
    pub metric_min_crf: f64,
    pub metric_unreliable_crf_offset: f64,
    pub metric_disabled_base_crf: f64,
    pub panning_rejection_sigma: f64,
    pub dynamic_crf: Option<CrfDampening>,
    pub ffvship_metric: String,
    pub ffvship_params: Vec<String>,
    pub sampling: SamplingConfig,
    pub damping: DampingTable,

    pub probing_preset: i32,
    pub probing_params: Vec<String>,

    pub encoder: String,
    pub final_preset: i32,
    pub final_params: Vec<String>,
    pub final_min_crf: f64,
    pub quarterstep_crf: bool,
    pub photon_noise: Option<u32>,
    pub photon_noise_height: Option<u32>,
    pub photon_noise_width: Option<u32>,
    pub chroma_noise: bool,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        let split_params = |params: &str| params.split_whitespace().map(str::to_owned).collect();
        ZoneConfig {
            scene_detection_method: SceneDetectionMethod::default(),
            luma_range: LumaRange::default(),
            split: SplitConfig::default(),

            metric_enable: true,
            metric_method: MetricMethod::default(),
            metric_direction: MetricDirection::default(),
            metric_target: 84.0,
            metric_max_crf: 36.0,
            metric_min_crf: 14.0,
            metric_unreliable_crf_offset: 3.0,
            metric_disabled_base_crf: 28.0,
            panning_rejection_sigma: 2.0,
            dynamic_crf: None,
            ffvship_metric: "SSIMULACRA2".to_owned(),
            ffvship_params: Vec::new(),
            sampling: SamplingConfig::default(),
            damping: DampingTable::default(),

            probing_preset: 8,
            probing_params: split_params(PROBING_PARAMS),

            encoder: "svt_av1".to_owned(),
            final_preset: 2,
            final_params: split_params(FINAL_PARAMS),
            final_min_crf: 14.0,
            quarterstep_crf: true,
            photon_noise: Some(4),
            photon_noise_height: None,
            photon_noise_width: None,
            chroma_noise: false,
        }
    }
}

impl ZoneConfig {
    pub fn unreliable_crf_fallback(&self) -> f64 {
        self.metric_min_crf + self.metric_unreliable_crf_offset
    }

    pub fn clamp_crf(&self, crf: f64) -> f64 {
        crf.clamp(self.metric_min_crf, self.metric_max_crf)
    }

    /// Column of FFVship's per-frame output holding the score of `ffvship_metric`.
    /// Butteraugli reports 2-norm, 3-norm and infinity norm; the 3-norm is used.
    pub fn ffvship_column(&self) -> Option<usize> {
        match self.ffvship_metric.as_str() {
            "SSIMULACRA2" | "CVVDP" => Some(0),
            "Butteraugli" => Some(1),
            _ => None,
        }
    }

    /// Rejects threshold orderings the segmenter cannot honour.
    pub fn validate(&self, key: &str) -> Result<(), BoostError> {
        let s = &self.split;
        let checks = [
            (
                s.still_0042_extra_split >= s.extra_split,
                "still_0042_extra_split must be >= extra_split",
            ),
            (
                s.still_0012_extra_split >= s.extra_split,
                "still_0012_extra_split must be >= extra_split",
            ),
            (
                s.min_scene_len >= 1,
                "min_scene_len must be at least 1",
            ),
            (
                s.min_scene_len <= s.extra_split / 2,
                "extra_split must be >= 2 * min_scene_len",
            ),
            (
                s.target_split_18 <= s.target_split_12 / 2,
                "target_split_12 must be >= 2 * target_split_18",
            ),
            (
                s.target_split_18 <= s.extra_split / 2,
                "extra_split must be >= 2 * target_split_18",
            ),
            (
                s.target_split_12 <= s.extra_split / 2,
                "extra_split must be >= 2 * target_split_12",
            ),
            (
                s.extra_target_split_27 <= s.extra_split,
                "extra_target_split_27 must be <= extra_split",
            ),
            (
                self.metric_min_crf <= self.metric_max_crf,
                "metric_min_crf must be <= metric_max_crf",
            ),
            (
                self.damping.knee > 0.0,
                "damping knee must be positive",
            ),
            (
                self.ffvship_column().is_some(),
                "ffvship_metric must be SSIMULACRA2, Butteraugli or CVVDP",
            ),
            (
                match self.dynamic_crf {
                    Some(CrfDampening::Linear { below, .. } | CrfDampening::Power { below, .. }) => {
                        below > 0.0
                    }
                    None => true,
                },
                "dynamic_crf below must be positive",
            ),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(BoostError::config(format!("zone \"{key}\": {message}"))),
            None => Ok(()),
        }
    }
}

/// Zone profiles by key. `default` always exists.
#[derive(Debug, Clone)]
pub struct Profiles {
    profiles: BTreeMap<String, Arc<ZoneConfig>>,
}

impl Default for Profiles {
    fn default() -> Self {
        Profiles {
            profiles: BTreeMap::from([(DEFAULT_ZONE.to_owned(), Arc::new(ZoneConfig::default()))]),
        }
    }
}

impl Profiles {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Profiles::default());
        };
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config {}", path.display()))?;
        Profiles::from_toml_str(&content)
            .wrap_err_with(|| format!("Failed to load config {}", path.display()))
    }

    /// `[default]` overrides the stock profile, and every `[zones.<key>]` table
    /// overrides `[default]`.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut root: toml::Table = toml::from_str(content)
            .map_err(|e| BoostError::config(format!("config is not valid TOML: {e}")))?;

        let base = match root.remove(DEFAULT_ZONE) {
            Some(toml::Value::Table(table)) => table,
            Some(_) => return Err(BoostError::config("[default] must be a table").into()),
            None => toml::Table::new(),
        };
        let zones = match root.remove("zones") {
            Some(toml::Value::Table(table)) => table,
            Some(_) => return Err(BoostError::config("[zones] must be a table").into()),
            None => toml::Table::new(),
        };
        if let Some(unknown) = root.keys().next() {
            return Err(BoostError::config(format!("unknown top-level key \"{unknown}\"")).into());
        }

        let mut profiles = BTreeMap::new();
        profiles.insert(DEFAULT_ZONE.to_owned(), Arc::new(parse_profile(DEFAULT_ZONE, base.clone())?));

        for (key, value) in zones {
            if key.chars().any(char::is_whitespace) || key.is_empty() {
                return Err(BoostError::config(format!("zone key \"{key}\" must be non-empty without whitespace")).into());
            }
            if key == DEFAULT_ZONE {
                return Err(BoostError::config("use [default] instead of [zones.default]").into());
            }
            let toml::Value::Table(overrides) = value else {
                return Err(BoostError::config(format!("[zones.{key}] must be a table")).into());
            };
            let mut merged = base.clone();
            merge_tables(&mut merged, overrides);
            profiles.insert(key.clone(), Arc::new(parse_profile(&key, merged)?));
        }

        Ok(Profiles { profiles })
    }

    pub fn get(&self, key: &str) -> Option<&Arc<ZoneConfig>> {
        self.profiles.get(key)
    }

    pub fn default_profile(&self) -> &Arc<ZoneConfig> {
        &self.profiles[DEFAULT_ZONE]
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

fn parse_profile(key: &str, table: toml::Table) -> Result<ZoneConfig> {
    let config: ZoneConfig = toml::Value::Table(table)
        .try_into()
        .map_err(|e| BoostError::config(format!("zone \"{key}\": {e}")))?;
    config.validate(key)?;
    Ok(config)
}

fn merge_tables(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            // A dampening curve is replaced whole, its fields depend on the curve.
            (Some(toml::Value::Table(inner)), toml::Value::Table(over)) if key != "dynamic_crf" => {
                merge_tables(inner, over)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
