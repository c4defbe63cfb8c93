//! On-disk layout of a richness run.

use crate::config::PipelineConfig;
use crate::io::remove_dir_if_exists;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Every path a run reads or writes, derived from the group name and roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    group: String,
    output_root: PathBuf,
    scratch_root: PathBuf,
}

impl RunLayout {
    pub fn new(group: impl Into<String>, output_root: impl Into<PathBuf>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            group: group.into(),
            output_root: output_root.into(),
            scratch_root: scratch_root.into(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.group_name.trim(),
            config.output_root.clone(),
            config.scratch_root().to_path_buf(),
        )
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_root.join(format!("{}_01_scratch", self.group))
    }

    pub fn reclass_dir(&self) -> PathBuf {
        self.scratch_root.join(format!("{}_02_reclassed", self.group))
    }

    pub fn intermediate_dir(&self) -> PathBuf {
        self.output_root
            .join(format!("{}_03_Richness_intermediate", self.group))
    }

    pub fn richness_dir(&self) -> PathBuf {
        self.output_root.join(format!("{}_04_Richness", self.group))
    }

    pub fn log_path(&self) -> PathBuf {
        self.output_root.join(format!("log_{}.txt", self.group))
    }

    pub fn table_path(&self) -> PathBuf {
        self.output_root.join(format!("{}.csv", self.group))
    }

    /// Name a batch by the offset of its first species, e.g. `raptors_40`.
    pub fn batch_name(&self, offset: usize) -> String {
        format!("{}_{}", self.group, offset)
    }

    pub fn checkpoint_path(&self, offset: usize) -> PathBuf {
        self.intermediate_dir()
            .join(format!("{}.tif", self.batch_name(offset)))
    }

    pub fn final_raster(&self) -> PathBuf {
        self.richness_dir().join(format!("{}.tif", self.group))
    }

    /// Create all working and output directories.
    pub fn prepare(&self) -> io::Result<()> {
        for dir in [
            self.scratch_dir(),
            self.reclass_dir(),
            self.intermediate_dir(),
            self.richness_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Empty the scratch and reclassed directories, keeping the directories.
    pub fn clear_batch_workspace(&self) -> io::Result<()> {
        for dir in [self.scratch_dir(), self.reclass_dir()] {
            clear_dir(&dir)?;
        }
        Ok(())
    }

    /// Remove the scratch and reclassed directories entirely.
    pub fn remove_workspace(&self) -> io::Result<()> {
        remove_dir_if_exists(&self.scratch_dir())?;
        remove_dir_if_exists(&self.reclass_dir())?;
        Ok(())
    }
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            remove_dir_if_exists(&path)?;
        } else {
            crate::io::remove_file_if_exists(&path)?;
        }
    }
    Ok(())
}
