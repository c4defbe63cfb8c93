//! Species richness rasters from GAP habitat models.
//!
//! Habitat rasters are processed in batches: each species is staged,
//! reclassified to a seasonal presence mask, and summed into a per-batch
//! checkpoint. The checkpoints are then merged into the final richness
//! raster, alongside a table of the species that contributed.

pub mod accumulate;
pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod layout;
pub mod manifest;
pub mod merge;
pub mod partition;
pub mod pipeline;
pub mod raster;
pub mod reclass;
pub mod season;
pub mod species;
pub mod stage;

// Re-export commonly used types
pub use config::{PipelineConfig, ValidationConfig, ValidationLevel};
pub use error::{ExclusionKind, Result, RichnessError, SpeciesError};
pub use io::{GeoTiffBackend, RasterBackend};
pub use pipeline::{ExcludedSpecies, RichnessPipeline, RunReport, ValidationMismatch};
pub use raster::{Grid, PixelType, Raster, RasterMetadata};
pub use season::{SeasonCodes, SeasonFilter};
pub use species::{CsvSpeciesCatalog, SpeciesCatalog, SpeciesCode, SpeciesRecord};
pub use stage::{DirectoryHabitatSource, HabitatSource};
