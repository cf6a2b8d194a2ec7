use std::ffi::{CStr, OsStr, OsString};
use std::path::{Path, PathBuf, absolute};
use std::process::{Command, Stdio};

use clap::ValueEnum;
use eyre::{OptionExt, Result, eyre};
use serde::{Deserialize, Serialize};
use vapoursynth4_rs::ffi::VSMapAppendMode::{Append, Replace};
use vapoursynth4_rs::{
    core::Core,
    map::{KeyStr, Map, Value},
    node::{Node, VideoNode},
    plugin::Plugin,
};

const YUV420P8: i64 = 805830913;

/// Detection runs on a copy scaled to roughly this many pixels.
const DETECTION_AREA: f64 = 1280.0 * 720.0;

/// Plugin used to open the source and the probe encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePlugin {
    #[default]
    Lsmash,
    Bestsource,
    Ffms2,
}

impl SourcePlugin {
    /// Name av1an expects for `--chunk-method`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePlugin::Lsmash => "lsmash",
            SourcePlugin::Bestsource => "bestsource",
            SourcePlugin::Ffms2 => "ffms2",
        }
    }
}

fn plugin(core: &Core, id: &CStr) -> Result<Plugin> {
    core.get_plugin_by_id(id)
        .ok_or_else(|| eyre!("Plugin [{}] was not found", id.to_string_lossy()))
}

/// Calls `function` and returns its `clip` output.
fn invoke(plugin: &Plugin, name: &str, function: &CStr, args: Map) -> Result<VideoNode> {
    let func = plugin.invoke(function, args);
    if let Some(err) = func.get_error() {
        return Err(eyre!(
            "{name} {} failed: {}",
            function.to_string_lossy(),
            err.to_string_lossy()
        ));
    }
    Ok(func.get_video_node(KeyStr::from_cstr(c"clip"), 0)?)
}

fn utf8_path(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| eyre!("Path {} is not valid UTF-8", path.display()))
}

fn index_path(path: &Path, cache_dir: &Path, ext: Option<&str>) -> Result<PathBuf> {
    let name = path.file_name().ok_or_eyre("Input path has no filename")?;
    let cache_path = cache_dir.join(name);
    Ok(match ext {
        Some(ext) => add_extension(ext, cache_path),
        None => cache_path,
    })
}

/// Opens `path` with `source_plugin`, keeping its index inside `cache_dir`.
pub fn load_source(
    core: &Core,
    path: &Path,
    source_plugin: SourcePlugin,
    cache_dir: &Path,
) -> Result<VideoNode> {
    match source_plugin {
        SourcePlugin::Lsmash => lsmash_invoke(core, path, cache_dir),
        SourcePlugin::Bestsource => bestsource_invoke(core, path, cache_dir),
        SourcePlugin::Ffms2 => ffms2_invoke(core, path, cache_dir),
    }
}

pub fn lsmash_invoke(core: &Core, path: &Path, cache_dir: &Path) -> Result<VideoNode> {
    let lsmash = plugin(core, c"systems.innocent.lsmas")?;
    let path = absolute(path)?;
    let cache_path = index_path(&path, &absolute(cache_dir)?, Some("lwi"))?;

    let mut args = Map::default();
    args.set(KeyStr::from_cstr(c"source"), Value::Utf8(utf8_path(&path)?), Replace)?;
    args.set(
        KeyStr::from_cstr(c"cachefile"),
        Value::Utf8(utf8_path(&cache_path)?),
        Replace,
    )?;

    invoke(&lsmash, "lsmash", c"LWLibavSource", args)
}

pub fn ffms2_invoke(core: &Core, path: &Path, cache_dir: &Path) -> Result<VideoNode> {
    let ffms2 = plugin(core, c"com.vapoursynth.ffms2")?;
    let path = absolute(path)?;
    let cache_path = index_path(&path, &absolute(cache_dir)?, Some("ffindex"))?;

    if !cache_path.exists() {
        let status = Command::new("ffmsindex")
            .arg("-f")
            .arg("-p")
            .arg(&path)
            .arg(&cache_path)
            .stdout(Stdio::null())
            .status()?;

        if !status.success() {
            return Err(eyre!(
                "ffmsindex failed to create index for {}",
                path.display()
            ));
        }
    }

    let mut args = Map::default();
    args.set(KeyStr::from_cstr(c"source"), Value::Utf8(utf8_path(&path)?), Replace)?;
    args.set(
        KeyStr::from_cstr(c"cachefile"),
        Value::Utf8(utf8_path(&cache_path)?),
        Replace,
    )?;

    invoke(&ffms2, "FFMS2", c"Source", args)
}

pub fn bestsource_invoke(core: &Core, path: &Path, cache_dir: &Path) -> Result<VideoNode> {
    let bs = plugin(core, c"com.vapoursynth.bestsource")?;
    let path = absolute(path)?;
    let cache_path = index_path(&path, &absolute(cache_dir)?, None)?;

    let mut args = Map::default();
    args.set(KeyStr::from_cstr(c"source"), Value::Utf8(utf8_path(&path)?), Replace)?;
    args.set(
        KeyStr::from_cstr(c"cachepath"),
        Value::Utf8(utf8_path(&cache_path)?),
        Replace,
    )?;
    args.set(KeyStr::from_cstr(c"cachemode"), Value::Int(4), Replace)?;

    invoke(&bs, "Bestsource", c"VideoSource", args)
}

/// Frames `first..=last` of `clip`.
pub fn trim(core: &Core, clip: &VideoNode, first: u32, last: u32) -> Result<VideoNode> {
    let std = plugin(core, c"com.vapoursynth.std")?;
    let mut args = Map::default();
    args.set(KeyStr::from_cstr(c"clip"), Value::VideoNode(clip.to_owned()), Replace)?;
    args.set(KeyStr::from_cstr(c"first"), Value::Int(first.into()), Replace)?;
    args.set(KeyStr::from_cstr(c"last"), Value::Int(last.into()), Replace)?;

    invoke(&std, "STD", c"Trim", args)
}

pub fn splice(core: &Core, clips: &[VideoNode]) -> Result<VideoNode> {
    let std = plugin(core, c"com.vapoursynth.std")?;
    let mut args = Map::default();
    for (i, clip) in clips.iter().enumerate() {
        args.set(
            KeyStr::from_cstr(c"clips"),
            Value::VideoNode(clip.to_owned()),
            if i == 0 { Replace } else { Append },
        )?;
    }

    invoke(&std, "STD", c"Splice", args)
}

/// A clip of only `frames`, in the given order.
pub fn select_frames(core: &Core, clip: &VideoNode, frames: &[u32]) -> Result<VideoNode> {
    if frames.is_empty() {
        return Err(eyre!("No frames specified for selection"));
    }

    let singles = frames
        .iter()
        .map(|&frame| trim(core, clip, frame, frame))
        .collect::<Result<Vec<_>>>()?;
    splice(core, &singles)
}

/// Luma statistics of `clipa` against `clipb`, stored as `<prop>Diff`, `<prop>Average`,
/// `<prop>Min` and `<prop>Max`.
pub fn plane_stats(
    core: &Core,
    clipa: &VideoNode,
    clipb: &VideoNode,
    prop: &str,
) -> Result<VideoNode> {
    let std = plugin(core, c"com.vapoursynth.std")?;
    let mut args = Map::default();
    args.set(KeyStr::from_cstr(c"clipa"), Value::VideoNode(clipa.to_owned()), Replace)?;
    args.set(KeyStr::from_cstr(c"clipb"), Value::VideoNode(clipb.to_owned()), Replace)?;
    args.set(KeyStr::from_cstr(c"plane"), Value::Int(0), Replace)?;
    args.set(KeyStr::from_cstr(c"prop"), Value::Utf8(prop), Replace)?;

    invoke(&std, "STD", c"PlaneStats", args)
}

/// Luma statistics of every frame against the frame before it. Frame 0 is compared to itself.
pub fn luma_stats(core: &Core, clip: &VideoNode) -> Result<VideoNode> {
    let first = trim(core, clip, 0, 0)?;
    let previous = splice(core, &[first, clip.to_owned()])?;
    plane_stats(core, clip, &previous, "Luma")
}

/// An 8-bit copy of `clip` point resized to about 720p, cropping the height to keep square
/// pixels. Clips that are already that small only change format.
pub fn detection_clip(core: &Core, clip: &VideoNode) -> Result<VideoNode> {
    let info = clip.info();
    let (width, height) = (f64::from(info.width), f64::from(info.height));

    let resize = plugin(core, c"com.vapoursynth.resize")?;
    let mut args = Map::default();
    args.set(KeyStr::from_cstr(c"clip"), Value::VideoNode(clip.to_owned()), Replace)?;

    let target_width = ((DETECTION_AREA / width / height).sqrt() * width / 40.0).round() * 40.0;
    if target_width < width * 0.9 {
        let target_height = (target_width / width * height / 2.0).ceil() * 2.0;
        let src_height = target_height / target_width * width;
        let src_top = (height - src_height) / 2.0;

        args.set(KeyStr::from_cstr(c"width"), Value::Int(target_width as i64), Replace)?;
        args.set(KeyStr::from_cstr(c"height"), Value::Int(target_height as i64), Replace)?;
        args.set(KeyStr::from_cstr(c"src_top"), Value::Float(src_top), Replace)?;
        args.set(KeyStr::from_cstr(c"src_height"), Value::Float(src_height), Replace)?;
    }
    args.set(KeyStr::from_cstr(c"format"), Value::Int(YUV420P8), Replace)?;
    args.set(KeyStr::from_cstr(c"dither_type"), Value::Utf8("none"), Replace)?;

    invoke(&resize, "Resize", c"Point", args)
}

/// Marks scene changes in the `Scenechange` frame property.
pub fn wwxd(core: &Core, clip: &VideoNode) -> Result<VideoNode> {
    let wwxd = plugin(core, c"com.nodame.wwxd")?;
    let mut args = Map::default();
    args.set(KeyStr::from_cstr(c"clip"), Value::VideoNode(clip.to_owned()), Replace)?;

    invoke(&wwxd, "WWXD", c"WWXD", args)
}

/// Scores every frame pair in the `SSIMULACRA2` frame property.
pub fn vszip_ssimulacra2(
    core: &Core,
    reference: &VideoNode,
    distorted: &VideoNode,
) -> Result<VideoNode> {
    let ref_info = reference.info();
    let dist_info = distorted.info();
    if ref_info.num_frames != dist_info.num_frames {
        return Err(eyre!(
            "Frame count mismatch: reference has {}, encode has {}",
            ref_info.num_frames,
            dist_info.num_frames
        ));
    }

    let vszip = plugin(core, c"com.julek.vszip")?;
    let mut args = Map::default();
    args.set(
        KeyStr::from_cstr(c"reference"),
        Value::VideoNode(reference.to_owned()),
        Replace,
    )?;
    args.set(
        KeyStr::from_cstr(c"distorted"),
        Value::VideoNode(distorted.to_owned()),
        Replace,
    )?;

    invoke(&vszip, "Vszip", c"SSIMULACRA2", args)
}

pub fn add_extension(ext: impl AsRef<OsStr>, path: PathBuf) -> PathBuf {
    let mut os_string: OsString = path.into();
    os_string.push(".");
    os_string.push(ext.as_ref());
    os_string.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_appended_not_replaced() {
        assert_eq!(
            add_extension("lwi", PathBuf::from("cache/input.mkv")),
            PathBuf::from("cache/input.mkv.lwi")
        );
    }

    #[test]
    fn index_files_live_in_the_cache_dir() {
        let path = index_path(Path::new("/videos/input.mkv"), Path::new("/tmp/boost"), Some("ffindex"))
            .unwrap();
        assert_eq!(path, PathBuf::from("/tmp/boost/input.mkv.ffindex"));
        assert!(index_path(Path::new("/"), Path::new("/tmp"), None).is_err());
    }

    #[test]
    fn source_plugin_names_match_av1an_chunk_methods() {
        assert_eq!(SourcePlugin::Lsmash.as_str(), "lsmash");
        assert_eq!(SourcePlugin::Bestsource.as_str(), "bestsource");
        assert_eq!(SourcePlugin::Ffms2.as_str(), "ffms2");
    }
}
