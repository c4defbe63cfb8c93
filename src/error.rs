use std::path::PathBuf;
use thiserror::Error;

/// Infrastructure failures. Any of these aborts the run.
#[derive(Error, Debug)]
pub enum RichnessError {
    #[error("GeoTIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid interval: {0} (must be positive)")]
    InvalidInterval(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Raster has invalid dimensions: {0}x{1}")]
    InvalidDimensions(usize, usize),

    #[error("Pixel size is non-positive: {0}")]
    InvalidPixelSize(f64),

    #[error("Unsupported pixel layout in {path}: {detail}")]
    UnsupportedPixelType { path: PathBuf, detail: String },

    #[error("Cell value {value} does not fit in {pixel_type}")]
    ValueOutOfRange { value: u16, pixel_type: &'static str },

    #[error("Grid mismatch: {0}")]
    GridMismatch(String),

    #[error("Richness count overflow at cell ({row}, {col})")]
    CountOverflow { row: usize, col: usize },

    #[error("Duplicate species code in input: {0}")]
    DuplicateSpecies(String),

    #[error("No species contributed to the richness raster")]
    NothingToMerge,

    #[error("Validation failed for {batch}: expected max {expected}, found {observed:?}")]
    ValidationFailed {
        batch: String,
        expected: usize,
        observed: Option<u16>,
    },
}

pub type Result<T> = std::result::Result<T, RichnessError>;

/// Failures confined to one species. The species is excluded and the run
/// carries on.
#[derive(Error, Debug)]
pub enum SpeciesError {
    #[error("habitat raster not found for {species}")]
    MissingSource { species: String },

    #[error("failed to stage {species}: {source}")]
    Stage {
        species: String,
        #[source]
        source: RichnessError,
    },

    #[error("failed to reclassify {species}: {source}")]
    Reclassify {
        species: String,
        #[source]
        source: RichnessError,
    },

    #[error("failed to add {species} to the batch sum: {source}")]
    Accumulate {
        species: String,
        #[source]
        source: RichnessError,
    },
}

impl SpeciesError {
    pub fn species(&self) -> &str {
        match self {
            SpeciesError::MissingSource { species }
            | SpeciesError::Stage { species, .. }
            | SpeciesError::Reclassify { species, .. }
            | SpeciesError::Accumulate { species, .. } => species,
        }
    }

    pub fn kind(&self) -> ExclusionKind {
        match self {
            SpeciesError::MissingSource { .. } => ExclusionKind::MissingSource,
            SpeciesError::Stage { .. } => ExclusionKind::Stage,
            SpeciesError::Reclassify { .. } => ExclusionKind::Reclassify,
            SpeciesError::Accumulate { .. } => ExclusionKind::Accumulate,
        }
    }
}

/// Why a species did not make it into the richness raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionKind {
    MissingSource,
    Stage,
    Reclassify,
    Accumulate,
    /// Excluded by an earlier run whose checkpoint was reused.
    EarlierRun,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_species_error_kind() {
        let err = SpeciesError::MissingSource {
            species: "bbaeax".to_string(),
        };
        assert_eq!(err.kind(), ExclusionKind::MissingSource);
        assert_eq!(err.species(), "bbaeax");
        assert_eq!(err.to_string(), "habitat raster not found for bbaeax");
    }

    #[test]
    fn test_species_error_wraps_source() {
        let err = SpeciesError::Reclassify {
            species: "mnarox".to_string(),
            source: RichnessError::InvalidDimensions(0, 3),
        };
        assert_eq!(err.kind(), ExclusionKind::Reclassify);
        assert!(err.to_string().contains("0x3"));
    }
}
