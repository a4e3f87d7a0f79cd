//! External programs: a KindleUnpack-compatible unpacker and kindlegen.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, info, warn};

use crate::config::EpubVersion;
use crate::error::{Error, Result};

/// Full-book extraction of a Kindle file into a directory.
pub trait Unpacker {
    fn unpack(
        &self,
        input: &Path,
        outdir: &Path,
        epub_version: EpubVersion,
        use_hd: bool,
    ) -> Result<()>;
}

/// Runs `program [-i] --epub_version=<v> <input> <outdir>`.
#[derive(Debug, Clone)]
pub struct CommandUnpacker {
    program: PathBuf,
}

impl CommandUnpacker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn command_line(
        &self,
        input: &Path,
        outdir: &Path,
        epub_version: EpubVersion,
        use_hd: bool,
    ) -> Vec<OsString> {
        let mut args = vec![self.program.clone().into_os_string()];
        if use_hd {
            args.push("-i".into());
        }
        args.push(format!("--epub_version={epub_version}").into());
        args.push(input.as_os_str().to_owned());
        args.push(outdir.as_os_str().to_owned());
        args
    }
}

impl Unpacker for CommandUnpacker {
    fn unpack(
        &self,
        input: &Path,
        outdir: &Path,
        epub_version: EpubVersion,
        use_hd: bool,
    ) -> Result<()> {
        let command = self.command_line(input, outdir, epub_version, use_hd);
        info!(input = %input.display(), outdir = %outdir.display(), "unpacking");
        let output = run(&command, None)?;
        if output.status.success() {
            Ok(())
        } else {
            log_output(&output);
            Err(tool_failed(&command, &output))
        }
    }
}

/// Amazon's kindlegen compiler.
#[derive(Debug, Clone)]
pub struct Kindlegen {
    program: PathBuf,
}

impl Kindlegen {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn command_line(&self, source_epub: &Path, output_name: &str) -> Vec<OsString> {
        vec![
            self.program.clone().into_os_string(),
            source_epub.as_os_str().to_owned(),
            "-o".into(),
            output_name.into(),
        ]
    }

    /// Compile `source_epub` into `output_name`, written next to the ePub.
    ///
    /// Exit code 0 is success and 1 means success with warnings. Anything
    /// higher, or no exit code at all, is [`Error::ToolFailed`].
    pub fn compile(&self, source_epub: &Path, output_name: &str) -> Result<PathBuf> {
        let workdir = source_epub
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let command = self.command_line(source_epub, output_name);
        info!(epub = %source_epub.display(), output = output_name, "running kindlegen");

        let output = run(&command, Some(workdir))?;
        match output.status.code() {
            Some(0) => {}
            Some(1) => {
                warn!(epub = %source_epub.display(), "kindlegen completed with warnings");
                log_output(&output);
            }
            _ => {
                log_output(&output);
                return Err(tool_failed(&command, &output));
            }
        }
        Ok(workdir.join(output_name))
    }
}

fn run(command: &[OsString], cwd: Option<&Path>) -> Result<Output> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| Error::Config("empty command line".into()))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    hide_console(&mut cmd);
    debug!(?command, "spawning");
    Ok(cmd.output()?)
}

#[cfg(windows)]
fn hide_console(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_cmd: &mut Command) {}

fn log_output(output: &Output) {
    for line in String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
        .filter(|l| !l.trim().is_empty())
    {
        debug!("{line}");
    }
}

fn tool_failed(command: &[OsString], output: &Output) -> Error {
    Error::ToolFailed {
        command: command
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect(),
        code: output.status.code(),
    }
}
