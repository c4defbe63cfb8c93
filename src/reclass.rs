//! Reclassify staged habitat rasters into binary presence masks.

use crate::error::{Result, SpeciesError};
use crate::io::RasterBackend;
use crate::season::{SeasonCodes, SeasonFilter};
use crate::species::SpeciesCode;
use crate::stage::StagedRaster;
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// Presence mask for one species: cells are 1 or no-data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclassifiedMask {
    pub species: SpeciesCode,
    pub path: PathBuf,
    /// Cells admitted by the season filter
    pub present_cells: usize,
}

/// Write the season mask for `staged` into `reclass_dir` and delete the
/// staged copy.
///
/// Failing to write the mask is fatal; failing to read the staged raster
/// only excludes the species.
pub fn reclassify<B: RasterBackend + ?Sized>(
    backend: &B,
    staged: &StagedRaster,
    season: SeasonFilter,
    codes: &SeasonCodes,
    reclass_dir: &Path,
) -> Result<std::result::Result<ReclassifiedMask, SpeciesError>> {
    let raster = match backend.read(&staged.path) {
        Ok(raster) => raster,
        Err(err) => {
            return Ok(Err(SpeciesError::Reclassify {
                species: staged.species.to_string(),
                source: err,
            }))
        }
    };

    let mask = raster.map_cells(|value| season.admits(value, codes));
    let present_cells = mask.valid_cells();
    if present_cells == 0 {
        warn!("{} has no cells present for {}", staged.species, season);
    } else {
        debug!(
            "{}: {} of {} valid cells present for {}",
            staged.species,
            present_cells,
            raster.valid_cells(),
            season
        );
    }

    let file_name = staged
        .path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.tif", staged.species.normalized())));
    let path = reclass_dir.join(file_name);
    backend.write(&path, &mask)?;

    // The staged copy is single-use
    if let Err(e) = backend.delete(&staged.path) {
        warn!("Could not delete staged raster {}: {}", staged.path.display(), e);
    }

    Ok(Ok(ReclassifiedMask {
        species: staged.species.clone(),
        path,
        present_cells,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::GeoTiffBackend;
    use crate::raster::{PixelType, Raster, RasterMetadata};
    use ndarray::arr2;
    use std::fs;

    fn stage(dir: &Path, code: &str, data: ndarray::Array2<u16>) -> StagedRaster {
        let (height, width) = data.dim();
        let metadata = RasterMetadata {
            width,
            height,
            geotransform: [0.0, 30.0, 0.0, 90.0, 0.0, -30.0],
            projection: String::new(),
            nodata: Some(0.0),
            pixel_type: PixelType::U8,
        };
        let path = dir.join(format!("{}.tif", code));
        GeoTiffBackend::new()
            .write(&path, &Raster::new(metadata, data).unwrap())
            .unwrap();
        StagedRaster {
            species: SpeciesCode::new(code),
            path,
        }
    }

    #[test]
    fn test_summer_mask_keeps_year_round_and_summer() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        let reclassed = tmp.path().join("reclassed");
        fs::create_dir_all(&scratch).unwrap();
        fs::create_dir_all(&reclassed).unwrap();

        // 1 = year-round, 2 = winter, 3 = summer
        let staged = stage(&scratch, "sp1", arr2(&[[1, 2, 3], [0, 3, 2], [2, 1, 0]]));
        let backend = GeoTiffBackend::new();

        let mask = reclassify(
            &backend,
            &staged,
            SeasonFilter::Summer,
            &SeasonCodes::default(),
            &reclassed,
        )
        .unwrap()
        .unwrap();

        let raster = backend.read(&mask.path).unwrap();
        assert_eq!(raster.data, arr2(&[[1, 0, 1], [0, 1, 0], [0, 1, 0]]));
        assert_eq!(raster.metadata.nodata, Some(0.0));
        assert_eq!(raster.max_value(), Some(1));
        assert_eq!(mask.present_cells, 4);

        // Staged copy is consumed
        assert!(!staged.path.exists());
    }

    #[test]
    fn test_out_of_season_raster_has_no_present_cells() {
        let tmp = tempfile::tempdir().unwrap();
        let reclassed = tmp.path().join("reclassed");
        fs::create_dir_all(&reclassed).unwrap();
        let staged = stage(tmp.path(), "sp1", arr2(&[[2, 2], [0, 2]]));

        let mask = reclassify(
            &GeoTiffBackend::new(),
            &staged,
            SeasonFilter::Summer,
            &SeasonCodes::default(),
            &reclassed,
        )
        .unwrap()
        .unwrap();
        assert_eq!(mask.present_cells, 0);
        assert_eq!(GeoTiffBackend::new().read(&mask.path).unwrap().max_value(), None);
    }

    #[test]
    fn test_missing_staged_raster_excludes_species() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = StagedRaster {
            species: SpeciesCode::new("sp9"),
            path: tmp.path().join("sp9.tif"),
        };
        let outcome = reclassify(
            &GeoTiffBackend::new(),
            &staged,
            SeasonFilter::YearRound,
            &SeasonCodes::default(),
            tmp.path(),
        )
        .unwrap();
        assert!(matches!(outcome, Err(SpeciesError::Reclassify { .. })));
    }
}
