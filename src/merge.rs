//! Final merge of batch checkpoints into the richness raster.

use crate::accumulate::{union_grid, RichnessAccumulator};
use crate::error::{Result, RichnessError};
use crate::io::RasterBackend;
use crate::raster::RasterMetadata;
use log::{debug, info};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeSummary {
    pub path: PathBuf,
    pub max_value: Option<u16>,
}

/// Sum `checkpoints` cell-wise into `output`, ignoring no-data.
///
/// Checkpoints are pipeline state, so any failure to read one is fatal.
/// Merging the same checkpoints always produces the same bytes.
pub fn merge_checkpoints<B: RasterBackend + ?Sized>(
    backend: &B,
    checkpoints: &[PathBuf],
    extent: Option<&RasterMetadata>,
    output: &Path,
) -> Result<MergeSummary> {
    info!("Calculating final richness from {} checkpoints", checkpoints.len());

    let described = checkpoints
        .iter()
        .map(|path| backend.describe(path))
        .collect::<Result<Vec<_>>>()?;

    let (grid, projection) =
        union_grid(described.iter(), extent)?.ok_or(RichnessError::NothingToMerge)?;
    debug!("Final grid: {}x{} cells", grid.width, grid.height);

    let mut accumulator = RichnessAccumulator::new(grid, projection);
    for path in checkpoints {
        let raster = backend.read(path)?;
        accumulator.add(&raster)?;
    }
    info!("\tRichness calculated");

    let richness = accumulator.finish();
    let max_value = richness.max_value();
    info!("Saving richness raster to {}", output.display());
    backend.write(output, &richness)?;
    info!("\tRichness raster saved.");

    Ok(MergeSummary {
        path: output.to_path_buf(),
        max_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::GeoTiffBackend;
    use crate::raster::{PixelType, Raster};
    use ndarray::arr2;
    use std::fs;

    fn checkpoint(dir: &Path, name: &str, data: ndarray::Array2<u16>) -> PathBuf {
        let (height, width) = data.dim();
        let metadata = RasterMetadata {
            width,
            height,
            geotransform: [0.0, 10.0, 0.0, 100.0, 0.0, -10.0],
            projection: "Albers".to_string(),
            nodata: Some(0.0),
            pixel_type: PixelType::U16,
        };
        let path = dir.join(name);
        GeoTiffBackend::new()
            .write(&path, &Raster::new(metadata, data).unwrap())
            .unwrap();
        path
    }

    #[test]
    fn test_merge_sums_checkpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let checkpoints = vec![
            checkpoint(tmp.path(), "g_0.tif", arr2(&[[2, 0], [1, 2]])),
            checkpoint(tmp.path(), "g_2.tif", arr2(&[[1, 0], [0, 1]])),
        ];
        let out = tmp.path().join("g.tif");

        let backend = GeoTiffBackend::new();
        let summary = merge_checkpoints(&backend, &checkpoints, None, &out).unwrap();
        assert_eq!(summary.max_value, Some(3));

        let merged = backend.read(&out).unwrap();
        assert_eq!(merged.data, arr2(&[[3, 0], [1, 3]]));
        assert_eq!(merged.metadata.projection, "Albers");
    }

    #[test]
    fn test_repeated_merge_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let checkpoints = vec![
            checkpoint(tmp.path(), "g_0.tif", arr2(&[[2, 0], [1, 2]])),
            checkpoint(tmp.path(), "g_2.tif", arr2(&[[1, 0], [0, 1]])),
        ];
        let out = tmp.path().join("g.tif");
        let backend = GeoTiffBackend::new();

        merge_checkpoints(&backend, &checkpoints, None, &out).unwrap();
        let first = fs::read(&out).unwrap();
        merge_checkpoints(&backend, &checkpoints, None, &out).unwrap();
        let second = fs::read(&out).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_nothing_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let result = merge_checkpoints(&GeoTiffBackend::new(), &[], None, &tmp.path().join("g.tif"));
        assert!(matches!(result, Err(RichnessError::NothingToMerge)));
    }

    #[test]
    fn test_missing_checkpoint_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let result = merge_checkpoints(
            &GeoTiffBackend::new(),
            &[tmp.path().join("g_0.tif")],
            None,
            &tmp.path().join("g.tif"),
        );
        assert!(matches!(result, Err(RichnessError::Io(_))));
    }
}
