// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ProjectFile, RawProjectFile};
use crate::errors::Result;

/// Read and deserialize a project file without validating it.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawProjectFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<RawProjectFile> {
    Ok(toml::from_str(contents)?)
}

/// Load a project file and validate it. This is what the binary uses.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ProjectFile> {
    let raw = load_from_path(&path)?;
    ProjectFile::try_from(raw)
}

/// `Resctl.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Resctl.toml")
}
