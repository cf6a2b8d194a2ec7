use std::{
    ffi::OsString,
    fs,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
};

use eyre::{Context, Result};
use tracing::debug;

use crate::{error::BoostError, vapoursynth::SourcePlugin};

/// One av1an run over a scenes file. `params` follow the common arguments verbatim.
#[derive(Debug, Clone)]
pub struct Av1anJob<'a> {
    pub input: &'a Path,
    pub vspipe_args: &'a [String],
    pub temp: &'a Path,
    pub output: &'a Path,
    pub scenes: &'a Path,
    pub resume: bool,
    pub verbose: u8,
    pub params: Vec<String>,
}

impl Av1anJob<'_> {
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into()];
        if self.verbose < 2 {
            args.push("--quiet".into());
        }
        if self.verbose >= 3 {
            args.push("--verbose".into());
        }
        args.extend(["--temp".into(), self.temp.into(), "--keep".into()]);
        if self.resume {
            args.push("--resume".into());
        }
        args.extend(["-i".into(), self.input.into()]);
        if !self.vspipe_args.is_empty() {
            args.push("--vspipe-args".into());
            args.extend(self.vspipe_args.iter().map(OsString::from));
        }
        args.extend([
            "-o".into(),
            self.output.into(),
            "--scenes".into(),
            self.scenes.into(),
        ]);
        args.extend(self.params.iter().map(OsString::from));
        args
    }

    /// Starts av1an after removing any previous output, so a stale file cannot pass for a result.
    pub fn spawn(&self) -> Result<Child> {
        if self.output.exists() {
            fs::remove_file(self.output)
                .wrap_err_with(|| format!("Failed to remove {}", self.output.display()))?;
        }

        let args = self.args();
        debug!("av1an {:?}", args);
        Command::new("av1an")
            .args(args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .wrap_err("Failed to start av1an. Is it installed and on PATH?")
    }
}

/// Arguments shared by every av1an run with a presplit scenes file.
pub fn common_params(source_plugin: SourcePlugin, label: &str) -> Vec<String> {
    [
        "--pix-format",
        "yuv420p10le",
        "--chunk-method",
        source_plugin.as_str(),
        "--audio-params",
        "-an",
        "--concat",
        "mkvmerge",
        "--force",
        "--video-params",
        label,
    ]
    .map(str::to_owned)
    .to_vec()
}

/// Fails unless `tool` exited cleanly and left `output` behind.
pub fn check_run(tool: &str, status: ExitStatus, output: &Path) -> Result<()> {
    if !status.success() {
        return Err(BoostError::ExternalTool {
            tool: tool.to_owned(),
            code: status.code(),
        }
        .into());
    }
    if !output.exists() {
        return Err(BoostError::malformed(
            tool,
            format!("{} was not created", output.display()),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job<'a>(vspipe_args: &'a [String], resume: bool, verbose: u8) -> Av1anJob<'a> {
        Av1anJob {
            input: Path::new("in.mkv"),
            vspipe_args,
            temp: Path::new("t.tmp"),
            output: Path::new("out.mkv"),
            scenes: Path::new("s.json"),
            resume,
            verbose,
            params: vec!["--workers".to_owned(), "8".to_owned()],
        }
    }

    fn joined(args: Vec<OsString>) -> String {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn quiet_fresh_run() {
        assert_eq!(
            joined(job(&[], false, 0).args()),
            "-y --quiet --temp t.tmp --keep -i in.mkv -o out.mkv --scenes s.json --workers 8"
        );
    }

    #[test]
    fn resumed_verbose_run_with_vspipe_args() {
        let vspipe = vec!["-a".to_owned(), "x=1".to_owned()];
        assert_eq!(
            joined(job(&vspipe, true, 3).args()),
            "-y --verbose --temp t.tmp --keep --resume -i in.mkv --vspipe-args -a x=1 \
             -o out.mkv --scenes s.json --workers 8"
        );
    }

    #[test]
    fn missing_output_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let status = Command::new("true").status().unwrap();
        let err = check_run("av1an", status, &dir.path().join("out.mkv")).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 3);
    }
}
