//! Firmware artifact naming.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{Context, Error, Result};

/// A firmware artifact as named on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRef {
    path: PathBuf,
    file_name: String,
}

impl FirmwareRef {
    /// Build from a path; only the final component is used for naming.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidName {
                kind: "firmware",
                value: path.display().to_string(),
                reason: "path has no file name",
            })?
            .to_string();
        Ok(Self {
            path: path.to_path_buf(),
            file_name,
        })
    }

    /// Like [`FirmwareRef::new`] but requires the file to exist on the host.
    pub fn existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FirmwareNotFound(path.to_path_buf()));
        }
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Host directory holding the artifact, mounted as the firmware dir.
    pub fn host_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// File name with its last extension removed. This is what the emulation
    /// pipeline writes into an instance's `name` marker.
    pub fn base_name(&self) -> &str {
        match self.file_name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.file_name,
        }
    }

    /// File name with `/`, space and `.` replaced by `_`.
    pub fn sanitized(&self) -> String {
        sanitize(&self.file_name)
    }

    pub fn sandbox_name(&self, index: usize) -> String {
        format!("docker{index}_{}", self.sanitized())
    }

    /// Anchored pattern matching any sandbox created for this artifact.
    pub fn sandbox_pattern(&self) -> Result<Regex> {
        let pattern = format!(r"^docker\d+_{}$", regex::escape(&self.sanitized()));
        Regex::new(&pattern).context("sandbox pattern")
    }
}

pub fn sanitize(file_name: &str) -> String {
    file_name.replace(['/', ' ', '.'], "_")
}
