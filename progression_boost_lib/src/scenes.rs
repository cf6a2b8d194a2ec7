use std::{fs, path::Path};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{checkpoint::write_atomically, error::BoostError};

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Scene {
    pub start_frame: u32,
    pub end_frame: u32,
    #[serde(default)]
    pub zone_overrides: Option<ZoneOverrides>,
}

impl Scene {
    pub fn new(start_frame: u32, end_frame: u32) -> Self {
        Scene {
            start_frame,
            end_frame,
            zone_overrides: None,
        }
    }

    pub fn len(&self) -> u32 {
        self.end_frame - self.start_frame
    }

    pub fn is_empty(&self) -> bool {
        self.end_frame == self.start_frame
    }
}

/// Per-scene settings av1an applies on top of its command line.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ZoneOverrides {
    pub encoder: Option<String>,
    pub passes: Option<u8>,
    pub video_params: Option<Vec<String>>,
    pub photon_noise: Option<u32>,
    pub photon_noise_height: Option<u32>,
    pub photon_noise_width: Option<u32>,
    pub chroma_noise: Option<bool>,
    pub extra_splits_len: Option<u32>,
    pub min_scene_len: Option<u32>,
}

/// An av1an scenes file.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct SceneList {
    pub scenes: Vec<Scene>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_scenes: Option<Vec<Scene>>,
    pub frames: u32,
}

impl SceneList {
    /// A list av1an takes as already split, so it runs no scene detection of its own.
    pub fn presplit(scenes: Vec<Scene>, frames: u32) -> Self {
        SceneList {
            split_scenes: Some(scenes.clone()),
            scenes,
            frames,
        }
    }

    pub fn parse_scene_file(json_path: &Path) -> Result<SceneList> {
        let json_data = fs::read_to_string(json_path)
            .wrap_err_with(|| format!("Failed to read scenes file {}", json_path.display()))?;
        let scene_list: SceneList = serde_json::from_str(&json_data)
            .wrap_err_with(|| format!("Failed to parse scenes file {}", json_path.display()))?;
        Ok(scene_list)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_scene_list_to_file<'a>(&self, path: &'a Path) -> Result<&'a Path> {
        write_atomically(path, self.to_json()?.as_bytes())?;
        Ok(path)
    }

    /// Scenes must start at 0, touch each other, and end at `frames`.
    pub fn check_partition(&self) -> Result<(), BoostError> {
        let mut cursor = 0;
        for scene in &self.scenes {
            if scene.start_frame != cursor || scene.end_frame <= scene.start_frame {
                return Err(BoostError::malformed(
                    "scenes",
                    format!(
                        "scene [{}:{}] does not continue from frame {}",
                        scene.start_frame, scene.end_frame, cursor
                    ),
                ));
            }
            cursor = scene.end_frame;
        }
        if cursor != self.frames {
            return Err(BoostError::malformed(
                "scenes",
                format!("scenes end at frame {cursor} but the list has {} frames", self.frames),
            ));
        }
        Ok(())
    }
}

/// Cuts user supplied scenes down to `[zone_start, zone_end)`. A leading gap becomes its own scene.
pub fn clip_external_scenes(
    external: &[Scene],
    zone_start: u32,
    zone_end: u32,
) -> Result<Vec<Scene>, BoostError> {
    let invalid = |detail: String| BoostError::config(format!("invalid scenes file from --input-scenes: {detail}"));

    let mut scenes = Vec::new();
    let mut copying = false;
    let mut last_end: Option<u32> = None;

    for scene in external {
        if scene.start_frame >= zone_start {
            if !copying && scene.start_frame > zone_start {
                scenes.push(Scene::new(zone_start, scene.start_frame.min(zone_end)));
            }
            copying = true;
        }

        if copying {
            if let Some(last_end) = last_end
                && last_end != scene.start_frame
            {
                return Err(invalid(format!(
                    "scene starting at {} does not continue from {}",
                    scene.start_frame, last_end
                )));
            }
            if scene.end_frame <= scene.start_frame {
                return Err(invalid(format!(
                    "scene [{}:{}] is empty",
                    scene.start_frame, scene.end_frame
                )));
            }
            last_end = Some(scene.end_frame);

            if scene.start_frame < zone_end {
                scenes.push(Scene::new(scene.start_frame, scene.end_frame.min(zone_end)));
            }
        }

        if scene.end_frame >= zone_end {
            if !copying {
                // A single external scene spans the whole zone.
                scenes.push(Scene::new(zone_start, zone_end));
            }
            return Ok(scenes);
        }
    }

    Err(invalid(format!(
        "no scene reaches the end of the zone at frame {zone_end}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(scenes: &[Scene]) -> Vec<(u32, u32)> {
        scenes.iter().map(|s| (s.start_frame, s.end_frame)).collect()
    }

    #[test]
    fn presplit_lists_serialize_split_scenes() {
        let list = SceneList::presplit(vec![Scene::new(0, 10)], 10);
        let json = list.to_json().unwrap();
        assert!(json.contains("\"split_scenes\""));
        let parsed: SceneList = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, list);
    }

    #[test]
    fn plain_av1an_lists_parse_without_split_scenes() {
        let list: SceneList = serde_json::from_str(
            r#"{"frames": 20, "scenes": [{"start_frame": 0, "end_frame": 20, "zone_overrides": null}]}"#,
        )
        .unwrap();
        assert!(list.split_scenes.is_none());
        list.check_partition().unwrap();
    }

    #[test]
    fn partition_check_finds_gaps() {
        let list = SceneList {
            scenes: vec![Scene::new(0, 10), Scene::new(11, 20)],
            split_scenes: None,
            frames: 20,
        };
        assert!(list.check_partition().is_err());
    }

    #[test]
    fn external_scenes_are_clipped_to_the_zone() {
        let external = [
            Scene::new(0, 40),
            Scene::new(40, 90),
            Scene::new(90, 150),
            Scene::new(150, 200),
        ];
        let scenes = clip_external_scenes(&external, 50, 120).unwrap();
        assert_eq!(spans(&scenes), vec![(50, 90), (90, 120)]);
    }

    #[test]
    fn external_scenes_must_be_contiguous_and_reach_the_end() {
        let gap = [Scene::new(0, 40), Scene::new(41, 100)];
        assert!(clip_external_scenes(&gap, 0, 100).is_err());

        let short = [Scene::new(0, 40), Scene::new(40, 80)];
        assert!(clip_external_scenes(&short, 0, 100).is_err());
    }
}
