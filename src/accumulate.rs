//! Cell-wise richness sums and per-batch checkpoints.

use crate::error::{Result, RichnessError, SpeciesError};
use crate::io::RasterBackend;
use crate::raster::{Grid, PixelType, Raster, RasterMetadata};
use crate::reclass::ReclassifiedMask;
use crate::species::SpeciesCode;
use log::{debug, info, warn};
use ndarray::{s, Array2, Zip};
use std::path::{Path, PathBuf};

/// Running per-cell species count over a fixed output grid.
///
/// No-data cells of an input leave the sum untouched, so an all-no-data
/// input is the identity. Cells nobody contributed to stay 0, which is the
/// no-data value of the finished raster.
///
/// Counting cells (see [`RichnessAccumulator::with_counting_cells`]) gain
/// one for every raster added, whether or not the raster covers them, so
/// their final value is the number of rasters folded in.
#[derive(Debug)]
pub struct RichnessAccumulator {
    grid: Grid,
    projection: String,
    sum: Array2<u16>,
    counting: Vec<(usize, usize)>,
    folded: usize,
}

impl RichnessAccumulator {
    pub fn new(grid: Grid, projection: impl Into<String>) -> Self {
        Self {
            sum: Array2::zeros((grid.height, grid.width)),
            grid,
            projection: projection.into(),
            counting: Vec::new(),
            folded: 0,
        }
    }

    /// Use the valid cells of `reference` as counting cells.
    pub fn with_counting_cells(mut self, reference: &Raster) -> Result<Self> {
        let (row, col) = self.grid.placement(&reference.metadata.grid()?)?;
        self.counting = reference
            .data
            .indexed_iter()
            .filter(|&(_, &value)| !reference.is_nodata(value))
            .map(|((r, c), _)| (row + r, col + c))
            .collect();
        debug!("{} counting cells", self.counting.len());
        Ok(self)
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Number of rasters added so far.
    pub fn folded(&self) -> usize {
        self.folded
    }

    /// Add every valid cell of `raster` at its georeferenced position.
    pub fn add(&mut self, raster: &Raster) -> Result<()> {
        let grid = raster.metadata.grid()?;
        let (row, col) = self.grid.placement(&grid)?;

        // Counting cells the raster leaves empty are stamped with presence
        let stamped: Vec<(usize, usize)> = self
            .counting
            .iter()
            .copied()
            .filter(|&(r, c)| {
                let covered = (row..row + grid.height).contains(&r)
                    && (col..col + grid.width).contains(&c)
                    && !raster.is_nodata(raster.data[(r - row, c - col)]);
                !covered
            })
            .collect();

        // Check first so a failed add leaves the sum untouched
        if let Some(&(row, col)) = stamped.iter().find(|&&cell| self.sum[cell] == u16::MAX) {
            return Err(RichnessError::CountOverflow { row, col });
        }

        let mut window = self
            .sum
            .slice_mut(s![row..row + grid.height, col..col + grid.width]);

        let mut overflow = None;
        Zip::indexed(&window)
            .and(&raster.data)
            .for_each(|(r, c), &total, &value| {
                if overflow.is_none()
                    && !raster.is_nodata(value)
                    && total.checked_add(value).is_none()
                {
                    overflow = Some((row + r, col + c));
                }
            });
        if let Some((row, col)) = overflow {
            return Err(RichnessError::CountOverflow { row, col });
        }

        Zip::from(&mut window).and(&raster.data).for_each(|total, &value| {
            if !raster.is_nodata(value) {
                *total += value;
            }
        });

        for cell in stamped {
            self.sum[cell] += 1;
        }

        self.folded += 1;
        Ok(())
    }

    /// The summed raster: 16-bit, no-data 0.
    pub fn finish(self) -> Raster {
        let metadata = RasterMetadata {
            width: self.grid.width,
            height: self.grid.height,
            geotransform: self.grid.geotransform(),
            projection: self.projection,
            nodata: Some(0.0),
            pixel_type: PixelType::U16,
        };
        Raster {
            metadata,
            data: self.sum,
        }
    }
}

/// Grow `current` to cover `metadata`. The first raster fixes the projection.
pub fn extend_union(
    current: Option<(Grid, String)>,
    metadata: &RasterMetadata,
) -> Result<(Grid, String)> {
    let grid = metadata.grid()?;
    match current {
        Some((current, projection)) => Ok((current.union(&grid)?, projection)),
        None => Ok((grid, metadata.projection.clone())),
    }
}

/// Output grid covering every input (and the extent reference, if any).
pub fn union_grid<'a, I>(inputs: I, extent: Option<&RasterMetadata>) -> Result<Option<(Grid, String)>>
where
    I: IntoIterator<Item = &'a RasterMetadata>,
{
    let mut union = extent.map(|reference| extend_union(None, reference)).transpose()?;
    for metadata in inputs {
        union = Some(extend_union(union, metadata)?);
    }
    Ok(union)
}

/// Result of summing one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSum {
    pub checkpoint: PathBuf,
    /// Species whose masks were added, in batch order
    pub folded: Vec<SpeciesCode>,
    pub max_value: Option<u16>,
}

/// Sum a batch's masks into a checkpoint at `checkpoint_path`.
///
/// With an extent reference the checkpoint covers the reference's extent and
/// its valid cells count every mask folded in. Masks that cannot be read or
/// do not line up with the batch grid are excluded and reported. Returns
/// `None` for the sum when no mask could be added. Every mask file is
/// deleted before returning, whatever the outcome.
pub fn accumulate_batch<B: RasterBackend + ?Sized>(
    backend: &B,
    masks: &[ReclassifiedMask],
    extent: Option<&Raster>,
    checkpoint_path: &Path,
) -> Result<(Option<BatchSum>, Vec<SpeciesError>)> {
    let outcome = sum_masks(backend, masks, extent, checkpoint_path);

    for mask in masks {
        if let Err(e) = backend.delete(&mask.path) {
            warn!("Could not delete reclassified raster {}: {}", mask.path.display(), e);
        }
    }

    outcome
}

fn sum_masks<B: RasterBackend + ?Sized>(
    backend: &B,
    masks: &[ReclassifiedMask],
    extent: Option<&Raster>,
    checkpoint_path: &Path,
) -> Result<(Option<BatchSum>, Vec<SpeciesError>)> {
    let mut excluded = Vec::new();
    let exclude = |mask: &ReclassifiedMask, err: RichnessError| {
        warn!("\tExcluding {} from batch sum: {}", mask.species, err);
        SpeciesError::Accumulate {
            species: mask.species.to_string(),
            source: err,
        }
    };

    // Describe every mask and grow the batch grid one at a time, so a
    // misaligned mask only drops itself.
    let mut union = extent
        .map(|reference| extend_union(None, &reference.metadata))
        .transpose()?;
    let mut described: Vec<&ReclassifiedMask> = Vec::with_capacity(masks.len());
    for mask in masks {
        let grown = backend
            .describe(&mask.path)
            .and_then(|metadata| extend_union(union.clone(), &metadata));
        match grown {
            Ok(next) => {
                union = Some(next);
                described.push(mask);
            }
            Err(err) => excluded.push(exclude(mask, err)),
        }
    }

    let Some((grid, projection)) = union else {
        return Ok((None, excluded));
    };
    debug!("Batch grid: {}x{} cells", grid.width, grid.height);

    let mut accumulator = RichnessAccumulator::new(grid, projection);
    if let Some(reference) = extent {
        accumulator = accumulator.with_counting_cells(reference)?;
    }
    let mut folded = Vec::with_capacity(described.len());
    for mask in described {
        match backend.read(&mask.path) {
            Ok(raster) => match accumulator.add(&raster) {
                Ok(()) => folded.push(mask.species.clone()),
                Err(err @ RichnessError::CountOverflow { .. }) => return Err(err),
                Err(err) => excluded.push(exclude(mask, err)),
            },
            Err(err) => excluded.push(exclude(mask, err)),
        }
    }

    if folded.is_empty() {
        return Ok((None, excluded));
    }

    info!("\tRichness processed");
    let richness = accumulator.finish();
    let max_value = richness.max_value();
    backend.write(checkpoint_path, &richness)?;
    info!("\tSaved to {}", checkpoint_path.display());

    Ok((
        Some(BatchSum {
            checkpoint: checkpoint_path.to_path_buf(),
            folded,
            max_value,
        }),
        excluded,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::GeoTiffBackend;
    use ndarray::arr2;
    use std::fs;

    fn metadata(origin_x: f64, origin_y: f64, width: usize, height: usize) -> RasterMetadata {
        RasterMetadata {
            width,
            height,
            geotransform: [origin_x, 10.0, 0.0, origin_y, 0.0, -10.0],
            projection: String::new(),
            nodata: Some(0.0),
            pixel_type: PixelType::U8,
        }
    }

    fn mask(data: Array2<u16>) -> Raster {
        let (height, width) = data.dim();
        Raster::new(metadata(0.0, 100.0, width, height), data).unwrap()
    }

    #[test]
    fn test_nodata_mask_is_identity() {
        let other = mask(arr2(&[[1, 0], [1, 1]]));
        let empty = mask(arr2(&[[0, 0], [0, 0]]));

        let mut acc = RichnessAccumulator::new(other.metadata.grid().unwrap(), "");
        acc.add(&empty).unwrap();
        acc.add(&other).unwrap();
        let sum = acc.finish();

        assert_eq!(sum.data, other.data);
        assert_eq!(sum.max_value(), Some(1));
    }

    #[test]
    fn test_sum_ignores_nodata() {
        let a = mask(arr2(&[[1, 0], [1, 1]]));
        let b = mask(arr2(&[[1, 1], [0, 1]]));

        let mut acc = RichnessAccumulator::new(a.metadata.grid().unwrap(), "");
        acc.add(&a).unwrap();
        acc.add(&b).unwrap();
        assert_eq!(acc.folded(), 2);

        let sum = acc.finish();
        assert_eq!(sum.data, arr2(&[[2, 1], [1, 2]]));
        assert_eq!(sum.metadata.pixel_type, PixelType::U16);
        assert_eq!(sum.metadata.nodata, Some(0.0));
    }

    #[test]
    fn test_offset_rasters_land_in_union_grid() {
        let a = Raster::new(metadata(0.0, 100.0, 2, 2), arr2(&[[1, 1], [1, 1]])).unwrap();
        let b = Raster::new(metadata(10.0, 90.0, 2, 2), arr2(&[[1, 1], [1, 1]])).unwrap();

        let (grid, _) = union_grid([&a.metadata, &b.metadata], None).unwrap().unwrap();
        let mut acc = RichnessAccumulator::new(grid, "");
        acc.add(&a).unwrap();
        acc.add(&b).unwrap();

        let sum = acc.finish();
        assert_eq!(sum.data, arr2(&[[1, 1, 0], [1, 2, 1], [0, 1, 1]]));
    }

    #[test]
    fn test_overflow_leaves_sum_untouched() {
        let grid = metadata(0.0, 100.0, 2, 1).grid().unwrap();
        let mut acc = RichnessAccumulator::new(grid, "");

        let mut wide = metadata(0.0, 100.0, 2, 1);
        wide.pixel_type = PixelType::U16;
        wide.nodata = None;
        let big = Raster::new(wide, arr2(&[[u16::MAX, 1]])).unwrap();
        acc.add(&big).unwrap();

        let err = acc.add(&big).unwrap_err();
        assert!(matches!(err, RichnessError::CountOverflow { row: 0, col: 0 }));
        assert_eq!(acc.folded(), 1);
        assert_eq!(acc.finish().data, arr2(&[[u16::MAX, 1]]));
    }

    #[test]
    fn test_accumulate_batch_excludes_misaligned_mask() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = GeoTiffBackend::new();

        let aligned = Raster::new(metadata(0.0, 100.0, 2, 2), arr2(&[[1, 0], [1, 1]])).unwrap();
        let shifted = Raster::new(metadata(5.0, 100.0, 2, 2), arr2(&[[1, 1], [1, 1]])).unwrap();
        let masks = vec![
            ReclassifiedMask {
                species: SpeciesCode::new("sp1"),
                path: tmp.path().join("sp1.tif"),
                present_cells: 1,
            },
            ReclassifiedMask {
                species: SpeciesCode::new("sp2"),
                path: tmp.path().join("sp2.tif"),
                present_cells: 1,
            },
        ];
        backend.write(&masks[0].path, &aligned).unwrap();
        backend.write(&masks[1].path, &shifted).unwrap();

        let checkpoint = tmp.path().join("group_0.tif");
        let (sum, excluded) = accumulate_batch(&backend, &masks, None, &checkpoint).unwrap();

        let sum = sum.unwrap();
        assert_eq!(sum.folded, vec![SpeciesCode::new("sp1")]);
        assert_eq!(sum.max_value, Some(1));
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].species(), "sp2");

        // Masks are always removed
        assert!(!masks[0].path.exists());
        assert!(!masks[1].path.exists());
        assert!(checkpoint.exists());
    }

    #[test]
    fn test_accumulate_batch_with_nothing_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let masks = vec![ReclassifiedMask {
            species: SpeciesCode::new("sp1"),
            path: tmp.path().join("missing.tif"),
            present_cells: 1,
        }];
        let checkpoint = tmp.path().join("group_0.tif");

        let (sum, excluded) =
            accumulate_batch(&GeoTiffBackend::new(), &masks, None, &checkpoint).unwrap();
        assert!(sum.is_none());
        assert_eq!(excluded.len(), 1);
        assert!(!checkpoint.exists());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_extent_reference_expands_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = GeoTiffBackend::new();
        let small = Raster::new(metadata(10.0, 90.0, 1, 1), arr2(&[[1]])).unwrap();
        let masks = vec![ReclassifiedMask {
            species: SpeciesCode::new("sp1"),
            path: tmp.path().join("sp1.tif"),
            present_cells: 1,
        }];
        backend.write(&masks[0].path, &small).unwrap();

        let reference = Raster::new(metadata(0.0, 100.0, 3, 3), Array2::zeros((3, 3))).unwrap();
        let checkpoint = tmp.path().join("group_0.tif");
        accumulate_batch(&backend, &masks, Some(&reference), &checkpoint).unwrap();

        let written = backend.read(&checkpoint).unwrap();
        assert_eq!(written.data, arr2(&[[0, 0, 0], [0, 1, 0], [0, 0, 0]]));
        assert_eq!(written.metadata.geotransform, reference.metadata.geotransform);
    }

    #[test]
    fn test_counting_cell_counts_disjoint_masks() {
        let reference = Raster::new(
            metadata(0.0, 100.0, 3, 3),
            arr2(&[[1, 0, 0], [0, 0, 0], [0, 0, 0]]),
        )
        .unwrap();
        let a = Raster::new(metadata(0.0, 100.0, 1, 1), arr2(&[[1]])).unwrap();
        let b = Raster::new(metadata(20.0, 80.0, 1, 1), arr2(&[[1]])).unwrap();
        let c = Raster::new(metadata(10.0, 90.0, 1, 1), arr2(&[[1]])).unwrap();

        let mut acc = RichnessAccumulator::new(reference.metadata.grid().unwrap(), "")
            .with_counting_cells(&reference)
            .unwrap();
        acc.add(&a).unwrap();
        acc.add(&b).unwrap();
        acc.add(&c).unwrap();

        // Covered counting cells are not counted twice
        let sum = acc.finish();
        assert_eq!(sum.data, arr2(&[[3, 0, 0], [0, 1, 0], [0, 0, 1]]));
        assert_eq!(sum.max_value(), Some(3));
    }

    #[test]
    fn test_accumulate_batch_counting_cell_tracks_folded() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = GeoTiffBackend::new();
        let masks = vec![
            ReclassifiedMask {
                species: SpeciesCode::new("sp1"),
                path: tmp.path().join("sp1.tif"),
                present_cells: 1,
            },
            ReclassifiedMask {
                species: SpeciesCode::new("sp2"),
                path: tmp.path().join("sp2.tif"),
                present_cells: 1,
            },
        ];
        backend
            .write(&masks[0].path, &Raster::new(metadata(10.0, 90.0, 1, 1), arr2(&[[1]])).unwrap())
            .unwrap();
        backend
            .write(&masks[1].path, &Raster::new(metadata(20.0, 80.0, 1, 1), arr2(&[[1]])).unwrap())
            .unwrap();
        let reference = Raster::new(
            metadata(0.0, 100.0, 3, 3),
            arr2(&[[1, 0, 0], [0, 0, 0], [0, 0, 0]]),
        )
        .unwrap();

        let checkpoint = tmp.path().join("group_0.tif");
        let (sum, excluded) =
            accumulate_batch(&backend, &masks, Some(&reference), &checkpoint).unwrap();
        assert!(excluded.is_empty());
        assert_eq!(sum.unwrap().max_value, Some(2));
    }

    #[test]
    fn test_union_grid_matches_stepwise_union() {
        let a = metadata(0.0, 100.0, 2, 2);
        let b = metadata(10.0, 90.0, 2, 2);

        let stepwise = extend_union(Some(extend_union(None, &a).unwrap()), &b).unwrap();
        let folded = union_grid([&a, &b], None).unwrap().unwrap();
        assert_eq!(stepwise, folded);
        assert_eq!((folded.0.width, folded.0.height), (3, 3));
    }
}
