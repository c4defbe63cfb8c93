//! Configuration for a richness run.

use crate::error::{Result, RichnessError};
use crate::season::{SeasonCodes, SeasonFilter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration for the richness pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Name used for output directories and files (e.g. "raptors")
    pub group_name: String,

    /// Directory receiving checkpoints, the final raster, log and table
    pub output_root: PathBuf,

    /// Directory for the scratch and reclassified workspaces.
    /// Defaults to `output_root`.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,

    /// Habitat raster store: one raster per lower-cased species code
    #[serde(default)]
    pub source_root: Option<PathBuf>,

    /// Maximum number of species summed at once
    #[serde(default = "default_interval")]
    pub interval: usize,

    #[serde(default)]
    pub season: SeasonFilter,

    #[serde(default)]
    pub season_codes: SeasonCodes,

    /// CSV of species taxonomy/crosswalk used for the species table
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,

    #[serde(default)]
    pub validation: ValidationConfig,

    /// Reuse checkpoints recorded in an existing log
    #[serde(default)]
    pub resume: bool,

    /// Keep intermediate checkpoints after the final merge
    #[serde(default = "default_true")]
    pub keep_checkpoints: bool,
}

/// Checkpoint completeness checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub level: ValidationLevel,

    /// Raster whose extent is added to every sum (e.g. a CONUS extent grid).
    /// Its valid cells are counting cells: each folded species adds one there.
    #[serde(default)]
    pub extent_reference: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// No per-batch check
    #[default]
    Off,
    /// Log and report mismatches, keep going
    Warn,
    /// Abort the run on the first mismatch
    Fail,
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValidationLevel::Off => "off",
            ValidationLevel::Warn => "warn",
            ValidationLevel::Fail => "fail",
        })
    }
}

impl FromStr for ValidationLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(ValidationLevel::Off),
            "warn" => Ok(ValidationLevel::Warn),
            "fail" => Ok(ValidationLevel::Fail),
            other => Err(format!("unknown validation level '{}' (expected off, warn or fail)", other)),
        }
    }
}

impl PipelineConfig {
    /// Configuration with defaults for everything but the group and output root.
    pub fn new(group_name: impl Into<String>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            group_name: group_name.into(),
            output_root: output_root.into(),
            scratch_root: None,
            source_root: None,
            interval: default_interval(),
            season: SeasonFilter::default(),
            season_codes: SeasonCodes::default(),
            catalog_path: None,
            validation: ValidationConfig::default(),
            resume: false,
            keep_checkpoints: true,
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn scratch_root(&self) -> &Path {
        self.scratch_root.as_deref().unwrap_or(&self.output_root)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let group = self.group_name.trim();
        if group.is_empty() {
            return Err(RichnessError::InvalidConfig("group_name must not be empty".to_string()));
        }
        if group.contains(['/', '\\']) || group == "." || group == ".." {
            return Err(RichnessError::InvalidConfig(format!(
                "group_name '{}' must be a plain file name",
                self.group_name
            )));
        }
        if self.interval == 0 {
            return Err(RichnessError::InvalidInterval(self.interval));
        }
        self.season_codes
            .validate()
            .map_err(RichnessError::InvalidConfig)?;
        if self.validation.level != ValidationLevel::Off && self.validation.extent_reference.is_none() {
            return Err(RichnessError::InvalidConfig(format!(
                "validation level '{}' needs an extent_reference with counting cells",
                self.validation.level
            )));
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_interval() -> usize { 20 }
fn default_true() -> bool { true }
