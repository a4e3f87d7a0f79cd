//! User preferences for unpacking and converting books.
//!
//! Stored as a JSON file; keys missing from the file take their defaults.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// ePub flavour requested from the unpacker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EpubVersion {
    /// Let the unpacker pick from the book's content.
    #[serde(rename = "A")]
    Auto,
    #[default]
    #[serde(rename = "2")]
    Epub2,
    #[serde(rename = "3")]
    Epub3,
}

impl EpubVersion {
    /// The value passed as `--epub_version=`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EpubVersion::Auto => "A",
            EpubVersion::Epub2 => "2",
            EpubVersion::Epub3 => "3",
        }
    }
}

impl fmt::Display for EpubVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EpubVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "A" | "a" | "auto" => Ok(EpubVersion::Auto),
            "2" => Ok(EpubVersion::Epub2),
            "3" => Ok(EpubVersion::Epub3),
            other => Err(Error::Config(format!(
                "unknown ePub version {other:?} (expected A, 2 or 3)"
            ))),
        }
    }
}

/// Preferences passed explicitly into [`MobiProcessor`](crate::MobiProcessor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default destination for unpacked books.
    pub unpack_folder: PathBuf,
    /// Always write into `unpack_folder` instead of next to the input.
    pub always_use_unpack_folder: bool,
    /// Kindlegen executable: a path, or a bare name looked up on `PATH`.
    pub kindlegen_path: PathBuf,
    /// KindleUnpack-compatible program used for full extraction.
    pub unpacker_path: PathBuf,
    /// Prefer HD images when the book carries them.
    pub use_hd_images: bool,
    pub epub_version: EpubVersion,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unpack_folder: home_dir().unwrap_or_else(|| PathBuf::from(".")),
            always_use_unpack_folder: false,
            kindlegen_path: PathBuf::from("kindlegen"),
            unpacker_path: PathBuf::from("kindleunpack"),
            use_hd_images: false,
            epub_version: EpubVersion::default(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read preferences from `path`, or the defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Where output for `input` should go.
    pub fn output_dir(&self, input: &Path) -> PathBuf {
        if self.always_use_unpack_folder {
            return self.unpack_folder.clone();
        }
        match input.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Resolve the kindlegen executable.
    ///
    /// An explicit path must exist; a bare program name is searched on `PATH`.
    pub fn kindlegen(&self) -> Result<PathBuf> {
        resolve_program(&self.kindlegen_path)
            .ok_or_else(|| Error::Config(format!("kindlegen not found at {}", self.kindlegen_path.display())))
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}
