use clap::{ArgAction, Parser};
use eyre::Result;
use progression_boost_lib::{
    config::Profiles,
    error::{BoostError, exit_code},
    logging::init_logging,
    pipeline::{BoostOptions, default_temp, run},
    vapoursynth::SourcePlugin,
    zones::{parse_zones, read_zones_file},
};
use tracing::debug;

use std::{path::PathBuf, process};

/// Per-scene quality boosting for av1an.
/// Probes every scene at two quantizer steps, measures the probes, and writes a scenes file
/// with the crf that reaches the target quality in each scene
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source video. Frame signal and metrics are computed from it
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    input: PathBuf,

    /// Input handed to av1an for the probe encodes, a video or a .vpy script (default: --input)
    #[arg(long, value_parser = clap::value_parser!(PathBuf))]
    encode_input: Option<PathBuf>,

    /// vspipe arguments for --encode-input
    #[arg(long, num_args = 1..)]
    encode_vspipe_args: Vec<String>,

    /// Input handed to av1an for x264 scene detection (default: --input)
    #[arg(long, value_parser = clap::value_parser!(PathBuf))]
    scene_detection_input: Option<PathBuf>,

    /// vspipe arguments for --scene-detection-input
    #[arg(long, num_args = 1..)]
    scene_detection_vspipe_args: Vec<String>,

    /// Scenes file used by zones with scene_detection_method = "external"
    #[arg(long, value_parser = clap::value_parser!(PathBuf))]
    input_scenes: Option<PathBuf>,

    /// Boosted scenes file to write
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    output_scenes: PathBuf,

    /// Zones file of `start end key` triples
    #[arg(long, value_parser = clap::value_parser!(PathBuf), conflicts_with = "zones_string")]
    zones: Option<PathBuf>,

    /// Zones given inline, e.g. "0 1200 default 1200 -1 credits"
    #[arg(long)]
    zones_string: Option<String>,

    /// Zone profiles in TOML, a [default] table and [zones.<key>] tables
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    config: Option<PathBuf>,

    /// Temp folder (default: "<output without .scenes>.boost.tmp")
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    temp: Option<PathBuf>,

    /// Reuse every stage whose inputs did not change since the last run
    #[arg(short, long, action = ArgAction::SetTrue, default_value_t = false)]
    resume: bool,

    /// av1an workers for the probe encodes. Lower it if the machine runs out of memory
    #[arg(short, long, default_value_t = 8, value_parser = clap::value_parser!(u32).range(1..))]
    workers: u32,

    /// Video source plugin for VapourSynth and av1an
    #[arg(value_enum, short, long, default_value_t = SourcePlugin::Lsmash)]
    source_plugin: SourcePlugin,

    /// More output, repeat for more
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn boost(args: Args) -> Result<()> {
    if !args.input.exists() {
        return Err(BoostError::config(format!("input {} does not exist", args.input.display())).into());
    }

    let profiles = Profiles::load(args.config.as_deref())?;
    let zones = match (&args.zones, &args.zones_string) {
        (Some(path), _) => read_zones_file(path)?,
        (None, Some(text)) => parse_zones(text)?,
        (None, None) => Vec::new(),
    };
    debug!("Zones: {zones:?}");

    let options = BoostOptions {
        encode_input: args.encode_input.unwrap_or_else(|| args.input.clone()),
        encode_vspipe_args: args.encode_vspipe_args,
        scene_detection_input: args
            .scene_detection_input
            .unwrap_or_else(|| args.input.clone()),
        scene_detection_vspipe_args: args.scene_detection_vspipe_args,
        input_scenes: args.input_scenes,
        temp: args
            .temp
            .unwrap_or_else(|| default_temp(&args.output_scenes)),
        output_scenes: args.output_scenes,
        input: args.input,
        resume: args.resume,
        verbose: args.verbose,
        source_plugin: args.source_plugin,
        workers: args.workers,
    };

    run(&options, &profiles, &zones)?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(report) = boost(args) {
        eprintln!("Error: {report:?}");
        process::exit(exit_code(&report));
    }
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Args::command().debug_assert();
}

#[test]
fn zone_sources_conflict() {
    let parsed = Args::try_parse_from([
        "progression-boost",
        "-i",
        "in.mkv",
        "-o",
        "out.scenes.json",
        "--zones",
        "zones.txt",
        "--zones-string",
        "0 -1 default",
    ]);
    assert!(parsed.is_err());
}

#[test]
fn workers_default_to_eight() {
    let parse = |extra: &[&str]| {
        let mut argv = vec!["progression-boost", "-i", "in.mkv", "-o", "out.scenes.json"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv)
    };
    assert_eq!(parse(&[]).unwrap().workers, 8);
    assert_eq!(parse(&["--workers", "2"]).unwrap().workers, 2);
    assert!(parse(&["--workers", "0"]).is_err());
}
