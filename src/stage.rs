//! Copy species habitat rasters into the scratch workspace.

use crate::error::{Result, SpeciesError};
use crate::io::RasterBackend;
use crate::species::SpeciesCode;
use log::{debug, info};
use std::path::{Path, PathBuf};

/// Resolves a species code to its habitat raster.
pub trait HabitatSource {
    fn locate(&self, species: &SpeciesCode) -> Option<PathBuf>;
}

/// Habitat rasters kept in one directory, named by lower-cased species code.
#[derive(Debug, Clone)]
pub struct DirectoryHabitatSource {
    root: PathBuf,
}

impl DirectoryHabitatSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl HabitatSource for DirectoryHabitatSource {
    fn locate(&self, species: &SpeciesCode) -> Option<PathBuf> {
        let code = species.normalized();
        [format!("{}.tif", code), format!("{}.tiff", code), code]
            .into_iter()
            .map(|name| self.root.join(name))
            .find(|candidate| candidate.is_file())
    }
}

/// Working copy of one species' habitat raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRaster {
    pub species: SpeciesCode,
    pub path: PathBuf,
}

/// Copy a species' raster into `scratch_dir` as 8-bit with no-data 0.
///
/// The outer `Result` carries workspace failures, which are fatal. The inner
/// one carries problems with this species' data, which only exclude it.
pub fn stage_species<B: RasterBackend + ?Sized>(
    backend: &B,
    source: &dyn HabitatSource,
    species: &SpeciesCode,
    scratch_dir: &Path,
) -> Result<std::result::Result<StagedRaster, SpeciesError>> {
    let Some(source_path) = source.locate(species) else {
        return Ok(Err(SpeciesError::MissingSource {
            species: species.to_string(),
        }));
    };
    debug!("Staging {} from {}", species, source_path.display());

    let staged = match backend
        .read(&source_path)
        .and_then(|raster| raster.to_presence_encoding())
    {
        Ok(staged) => staged,
        Err(err) => {
            return Ok(Err(SpeciesError::Stage {
                species: species.to_string(),
                source: err,
            }))
        }
    };

    let path = scratch_dir.join(format!("{}.tif", species.normalized()));
    backend.write(&path, &staged)?;
    info!("\t\t{}", species);

    Ok(Ok(StagedRaster {
        species: species.clone(),
        path,
    }))
}
